use super::*;
use common::Config;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use tempfile::{TempDir, tempdir};

fn test_pager(pool_size: usize) -> (TempDir, Arc<Pager>) {
    let dir = tempdir().unwrap();
    let config = Config::builder()
        .db_path(dir.path().join("index.db"))
        .pool_size(pool_size)
        .build();
    let pager = Arc::new(Pager::create(&config).unwrap());
    (dir, pager)
}

fn rid(page: u32, slot: u32) -> Rid {
    Rid::new(PageId(page), slot)
}

/// Inspect one node under a short-lived lease.
fn with_node_view<T>(
    pager: &Pager,
    page_id: PageId,
    f: impl FnOnce(&BTreeNode<'_>) -> T,
) -> T {
    let page_ref = pager.get(page_id).unwrap();
    let out = {
        let mut page = page_ref.write().unwrap();
        let node = BTreeNode::attach(&mut page).unwrap();
        f(&node)
    };
    drop(page_ref);
    pager.release(page_id, false).unwrap();
    out
}

fn leftmost_leaf(pager: &Pager, root: PageId) -> PageId {
    let mut current = root;
    loop {
        let child = with_node_view(pager, current, |node| {
            if node.is_leaf() {
                None
            } else {
                Some(node.child_at(0).unwrap())
            }
        });
        match child {
            None => return current,
            Some(next) => current = next,
        }
    }
}

/// Every key in the tree, collected by walking the leaf chain.
fn chain_keys(pager: &Pager, root: PageId) -> Vec<Value> {
    let mut keys = Vec::new();
    let mut current = leftmost_leaf(pager, root);
    loop {
        let next = with_node_view(pager, current, |node| {
            for i in 0..node.key_count() {
                keys.push(node.key_at(i).unwrap());
            }
            node.next_page_id()
        });
        if !next.is_valid() {
            return keys;
        }
        current = next;
    }
}

/// Check strict key ordering within every node reachable from `root`.
fn assert_nodes_sorted(pager: &Pager, root: PageId) {
    let children = with_node_view(pager, root, |node| {
        for i in 1..node.key_count() {
            let prev = node.key_at(i - 1).unwrap();
            let curr = node.key_at(i).unwrap();
            assert_eq!(
                prev.cmp_same_type(&curr),
                Some(std::cmp::Ordering::Less),
                "keys out of order in node {root}"
            );
        }
        if node.is_leaf() {
            Vec::new()
        } else {
            (0..=node.key_count())
                .map(|i| node.child_at(i).unwrap())
                .collect()
        }
    });
    for child in children {
        assert_nodes_sorted(pager, child);
    }
}

#[test]
fn search_on_empty_tree_is_invalid() {
    let (_dir, pager) = test_pager(8);
    let tree = BTree::new(pager, PageId::INVALID, TypeId::Integer);
    assert_eq!(tree.search(&Value::Integer(1)).unwrap(), Rid::invalid());
    assert_eq!(tree.height().unwrap(), 0);
}

#[test]
fn insert_then_search_single_leaf() {
    let (_dir, pager) = test_pager(8);
    let mut tree = BTree::new(Arc::clone(&pager), PageId::INVALID, TypeId::Integer);

    assert!(tree.insert(&Value::Integer(10), rid(1, 0)).unwrap());
    assert!(tree.insert(&Value::Integer(20), rid(1, 1)).unwrap());
    assert!(tree.insert(&Value::Integer(5), rid(1, 2)).unwrap());
    assert!(tree.insert(&Value::Integer(15), rid(1, 3)).unwrap());

    assert_eq!(tree.search(&Value::Integer(5)).unwrap(), rid(1, 2));
    assert_eq!(tree.search(&Value::Integer(15)).unwrap(), rid(1, 3));
    assert_eq!(tree.search(&Value::Integer(20)).unwrap(), rid(1, 1));
    assert_eq!(tree.search(&Value::Integer(999)).unwrap(), Rid::invalid());

    // all four keys sit sorted on the sole leaf
    assert_eq!(tree.height().unwrap(), 1);
    assert_eq!(tree.node_count().unwrap(), 1);
    let keys = chain_keys(&pager, tree.root_page_id());
    assert_eq!(
        keys,
        vec![
            Value::Integer(5),
            Value::Integer(10),
            Value::Integer(15),
            Value::Integer(20),
        ]
    );
}

#[test]
fn duplicate_insert_is_refused() {
    let (_dir, pager) = test_pager(8);
    let mut tree = BTree::new(pager, PageId::INVALID, TypeId::Integer);

    assert!(tree.insert(&Value::Integer(7), rid(1, 0)).unwrap());
    assert!(!tree.insert(&Value::Integer(7), rid(1, 1)).unwrap());

    // the original mapping survives
    assert_eq!(tree.search(&Value::Integer(7)).unwrap(), rid(1, 0));
}

#[test]
fn leaf_split_grows_the_tree() {
    let (_dir, pager) = test_pager(16);
    let mut tree = BTree::new(Arc::clone(&pager), PageId::INVALID, TypeId::Integer);
    let first_root = {
        tree.insert(&Value::Integer(0), rid(1, 0)).unwrap();
        tree.root_page_id()
    };

    // enough keys to overflow several integer leaves
    let n = 1000;
    for i in 1..n {
        assert!(tree.insert(&Value::Integer(i), rid(1, i as u32)).unwrap());
    }

    assert!(tree.height().unwrap() >= 2);
    assert!(tree.node_count().unwrap() > 3);
    assert_ne!(tree.root_page_id(), first_root);

    for i in 0..n {
        assert_eq!(
            tree.search(&Value::Integer(i)).unwrap(),
            rid(1, i as u32),
            "key {i} lost after splits"
        );
    }

    let keys = chain_keys(&pager, tree.root_page_id());
    let expected: Vec<Value> = (0..n).map(Value::Integer).collect();
    assert_eq!(keys, expected);
    assert_nodes_sorted(&pager, tree.root_page_id());
}

#[test]
fn descending_inserts_stay_sorted() {
    let (_dir, pager) = test_pager(16);
    let mut tree = BTree::new(Arc::clone(&pager), PageId::INVALID, TypeId::Integer);

    for i in (0..800).rev() {
        assert!(tree.insert(&Value::Integer(i), rid(2, i as u32)).unwrap());
    }

    let keys = chain_keys(&pager, tree.root_page_id());
    let expected: Vec<Value> = (0..800).map(Value::Integer).collect();
    assert_eq!(keys, expected);

    assert_eq!(tree.search(&Value::Integer(0)).unwrap(), rid(2, 0));
    assert_eq!(tree.search(&Value::Integer(799)).unwrap(), rid(2, 799));
}

#[test]
fn varchar_keys_round_trip() {
    let (_dir, pager) = test_pager(8);
    let mut tree = BTree::new(pager, PageId::INVALID, TypeId::Varchar);

    tree.insert(&Value::Varchar("apple".into()), rid(1, 0)).unwrap();
    tree.insert(&Value::Varchar("banana".into()), rid(1, 1)).unwrap();
    tree.insert(&Value::Varchar("cherry".into()), rid(1, 2)).unwrap();

    assert_eq!(
        tree.search(&Value::Varchar("banana".into())).unwrap(),
        rid(1, 1)
    );
    assert_eq!(
        tree.search(&Value::Varchar("date".into())).unwrap(),
        Rid::invalid()
    );
}

#[test]
fn varchar_splits_reach_internal_nodes() {
    let (_dir, pager) = test_pager(32);
    let mut tree = BTree::new(Arc::clone(&pager), PageId::INVALID, TypeId::Varchar);

    // varchar fan-out is small, so a few hundred keys split internals too
    let n = 400;
    for i in 0..n {
        let key = Value::Varchar(format!("key{i:04}"));
        assert!(tree.insert(&key, rid(3, i)).unwrap());
    }

    assert!(tree.height().unwrap() >= 3);

    for i in 0..n {
        let key = Value::Varchar(format!("key{i:04}"));
        assert_eq!(tree.search(&key).unwrap(), rid(3, i));
    }

    let keys = chain_keys(&pager, tree.root_page_id());
    let expected: Vec<Value> = (0..n).map(|i| Value::Varchar(format!("key{i:04}"))).collect();
    assert_eq!(keys, expected);
    assert_nodes_sorted(&pager, tree.root_page_id());
}

#[test]
fn boolean_keys_are_supported() {
    let (_dir, pager) = test_pager(8);
    let mut tree = BTree::new(pager, PageId::INVALID, TypeId::Boolean);

    tree.insert(&Value::Boolean(true), rid(1, 1)).unwrap();
    tree.insert(&Value::Boolean(false), rid(1, 0)).unwrap();

    assert_eq!(tree.search(&Value::Boolean(false)).unwrap(), rid(1, 0));
    assert_eq!(tree.search(&Value::Boolean(true)).unwrap(), rid(1, 1));
    assert!(!tree.insert(&Value::Boolean(true), rid(9, 9)).unwrap());
}

#[test]
fn range_returns_exactly_the_span() {
    let (_dir, pager) = test_pager(16);
    let mut tree = BTree::new(pager, PageId::INVALID, TypeId::Integer);

    for i in 0..500 {
        tree.insert(&Value::Integer(i * 2), rid(1, i as u32)).unwrap();
    }

    // inclusive bounds, even keys only
    let rids = tree.range(&Value::Integer(10), &Value::Integer(20)).unwrap();
    let expected: Vec<Rid> = (5..=10).map(|i| rid(1, i)).collect();
    assert_eq!(rids, expected);

    // bounds that fall between keys
    let rids = tree.range(&Value::Integer(9), &Value::Integer(21)).unwrap();
    assert_eq!(rids, expected);

    // begin beyond every key
    assert!(tree
        .range(&Value::Integer(2000), &Value::Integer(3000))
        .unwrap()
        .is_empty());

    // inverted bounds
    assert!(tree
        .range(&Value::Integer(20), &Value::Integer(10))
        .unwrap()
        .is_empty());

    // full span crosses leaf boundaries in chain order
    let all = tree.range(&Value::Integer(0), &Value::Integer(998)).unwrap();
    assert_eq!(all.len(), 500);
    assert_eq!(all[0], rid(1, 0));
    assert_eq!(all[499], rid(1, 499));
}

#[test]
fn remove_deletes_from_the_leaf() {
    let (_dir, pager) = test_pager(8);
    let mut tree = BTree::new(pager, PageId::INVALID, TypeId::Integer);

    for i in 0..10 {
        tree.insert(&Value::Integer(i), rid(1, i as u32)).unwrap();
    }

    assert!(tree.remove(&Value::Integer(4)).unwrap());
    assert_eq!(tree.search(&Value::Integer(4)).unwrap(), Rid::invalid());
    assert!(!tree.remove(&Value::Integer(4)).unwrap());

    // neighbours unaffected, removed key can come back
    assert_eq!(tree.search(&Value::Integer(3)).unwrap(), rid(1, 3));
    assert_eq!(tree.search(&Value::Integer(5)).unwrap(), rid(1, 5));
    assert!(tree.insert(&Value::Integer(4), rid(2, 0)).unwrap());
    assert_eq!(tree.search(&Value::Integer(4)).unwrap(), rid(2, 0));
}

#[test]
fn remove_across_splits_keeps_search_correct() {
    let (_dir, pager) = test_pager(16);
    let mut tree = BTree::new(Arc::clone(&pager), PageId::INVALID, TypeId::Integer);

    for i in 0..1000 {
        tree.insert(&Value::Integer(i), rid(1, i as u32)).unwrap();
    }
    for i in (0..1000).step_by(3) {
        assert!(tree.remove(&Value::Integer(i)).unwrap());
    }

    for i in 0..1000 {
        let expected = if i % 3 == 0 { Rid::invalid() } else { rid(1, i as u32) };
        assert_eq!(tree.search(&Value::Integer(i)).unwrap(), expected);
    }

    let keys = chain_keys(&pager, tree.root_page_id());
    let expected: Vec<Value> = (0..1000).filter(|i| i % 3 != 0).map(Value::Integer).collect();
    assert_eq!(keys, expected);
}

#[test]
fn key_type_is_enforced() {
    let (_dir, pager) = test_pager(8);
    let mut tree = BTree::new(pager, PageId::INVALID, TypeId::Integer);

    assert!(matches!(
        tree.insert(&Value::Varchar("oops".into()), rid(1, 0)),
        Err(DbError::TypeMismatch { .. })
    ));
    assert!(matches!(
        tree.search(&Value::Boolean(true)),
        Err(DbError::TypeMismatch { .. })
    ));
    assert!(matches!(
        tree.range(&Value::Integer(0), &Value::Varchar("z".into())),
        Err(DbError::TypeMismatch { .. })
    ));
    assert!(matches!(
        tree.insert(&Value::Invalid, rid(1, 0)),
        Err(DbError::TypeMismatch { .. })
    ));
}

#[test]
fn invalid_rids_are_rejected() {
    let (_dir, pager) = test_pager(8);
    let mut tree = BTree::new(pager, PageId::INVALID, TypeId::Integer);
    assert!(matches!(
        tree.insert(&Value::Integer(1), Rid::invalid()),
        Err(DbError::InvalidRid(_))
    ));
}

#[test]
fn oversized_varchar_keys_are_refused() {
    let (_dir, pager) = test_pager(8);
    let mut tree = BTree::new(pager, PageId::INVALID, TypeId::Varchar);
    let long = Value::Varchar("x".repeat(MAX_VARCHAR_KEY_LEN + 1));
    assert!(matches!(
        tree.insert(&long, rid(1, 0)),
        Err(DbError::NotSupported(_))
    ));
}

#[test]
fn tree_survives_a_restart() {
    let dir = tempdir().unwrap();
    let config = Config::builder()
        .db_path(dir.path().join("index.db"))
        .pool_size(16)
        .build();

    let root;
    {
        let pager = Arc::new(Pager::create(&config).unwrap());
        let mut tree = BTree::new(Arc::clone(&pager), PageId::INVALID, TypeId::Integer);
        for i in 0..600 {
            tree.insert(&Value::Integer(i), rid(1, i as u32)).unwrap();
        }
        root = tree.root_page_id();
        pager.flush_all().unwrap();
    }

    let pager = Arc::new(Pager::open(&config).unwrap());
    let tree = BTree::new(Arc::clone(&pager), root, TypeId::Integer);
    for i in 0..600 {
        assert_eq!(tree.search(&Value::Integer(i)).unwrap(), rid(1, i as u32));
    }
    let keys = chain_keys(&pager, root);
    assert_eq!(keys.len(), 600);
}

#[test]
fn all_pins_are_released() {
    let (_dir, pager) = test_pager(4);
    let mut tree = BTree::new(Arc::clone(&pager), PageId::INVALID, TypeId::Integer);

    // a pool of 4 only works if every operation unpins what it pinned
    for i in 0..2000 {
        tree.insert(&Value::Integer(i), rid(1, i as u32)).unwrap();
    }
    for i in 0..2000 {
        tree.search(&Value::Integer(i)).unwrap();
    }
    tree.range(&Value::Integer(0), &Value::Integer(1999)).unwrap();
    assert!(pager.buffer().len() <= 4);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn random_key_sets_stay_searchable(
        keys in proptest::collection::hash_set(0u32..10_000, 1..120)
    ) {
        let (_dir, pager) = test_pager(16);
        let mut tree = BTree::new(Arc::clone(&pager), PageId::INVALID, TypeId::Varchar);

        // varchar keys keep the fan-out small enough to force splits
        let mut sorted: Vec<String> = keys.iter().map(|k| format!("{k:05}")).collect();
        sorted.sort();

        for (slot, k) in keys.iter().enumerate() {
            let key = Value::Varchar(format!("{k:05}"));
            prop_assert!(tree.insert(&key, rid(1, slot as u32)).unwrap());
        }

        for (slot, k) in keys.iter().enumerate() {
            let key = Value::Varchar(format!("{k:05}"));
            prop_assert_eq!(tree.search(&key).unwrap(), rid(1, slot as u32));
        }
        prop_assert_eq!(
            tree.search(&Value::Varchar("99999x".into())).unwrap(),
            Rid::invalid()
        );

        let chained: Vec<String> = chain_keys(&pager, tree.root_page_id())
            .into_iter()
            .map(|v| v.as_str().unwrap().to_owned())
            .collect();
        prop_assert_eq!(chained, sorted);
    }
}
