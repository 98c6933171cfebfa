//! Clustered B+ tree index over typed keys, mapping each key to the RID
//! of its row.
//!
//! The tree sits on a [`Pager`]: every node is a [`BTreeNode`] view over a
//! leased page, pinned for exactly the duration of one visit. Splits are
//! propagated bottom-up along an explicit path stack; no parent pointers
//! are stored on disk. Keys are unique; leaves are chained through
//! `next_page_id` for range scans.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use btree::BTree;
//! use buffer::Pager;
//! use common::{Config, PageId, Rid};
//! use types::{TypeId, Value};
//!
//! let config = Config::builder().db_path("/tmp/index.db".into()).build();
//! let pager = Arc::new(Pager::create(&config).unwrap());
//!
//! let mut tree = BTree::new(pager, PageId::INVALID, TypeId::Integer);
//! tree.insert(&Value::Integer(7), Rid::new(PageId(1), 0)).unwrap();
//! assert!(tree.search(&Value::Integer(7)).unwrap().is_valid());
//! ```

mod node;

#[cfg(test)]
mod tests;

pub use node::{BTreeNode, MAX_VARCHAR_KEY_LEN, NODE_HEADER_BYTES, NodeHeader};

use std::cmp::Ordering;
use std::sync::Arc;

use buffer::Pager;
use common::{DbError, DbResult, PageId, Rid};
use log::warn;
use types::{TypeId, Value};

/// What the leaf step of an insert decided.
enum LeafStep {
    Inserted,
    Duplicate,
    Full {
        entries: Vec<(Value, Rid)>,
        next: PageId,
    },
}

/// A B+ tree index rooted at `root_page_id`.
///
/// Operations assume a single writer at a time; concurrent read-only
/// searches are safe against each other but not against a writer.
pub struct BTree {
    pager: Arc<Pager>,
    root_page_id: PageId,
    key_type: TypeId,
}

impl BTree {
    /// Wrap an existing tree, or start an empty one with
    /// `PageId::INVALID` as the root.
    pub fn new(pager: Arc<Pager>, root_page_id: PageId, key_type: TypeId) -> BTree {
        BTree {
            pager,
            root_page_id,
            key_type,
        }
    }

    /// Current root page id. The catalog layer persists this; it changes
    /// when the root splits or the first key is inserted.
    pub fn root_page_id(&self) -> PageId {
        self.root_page_id
    }

    pub fn key_type(&self) -> TypeId {
        self.key_type
    }

    /// Insert `key → rid`. Returns `Ok(false)` without touching the tree
    /// if the key is already present.
    pub fn insert(&mut self, key: &Value, rid: Rid) -> DbResult<bool> {
        self.check_key(key)?;
        if !rid.is_valid() {
            return Err(DbError::InvalidRid(rid));
        }

        if !self.root_page_id.is_valid() {
            self.root_page_id = self.create_node(true)?;
        }

        let (leaf_id, mut path) = self.find_leaf_with_path(key)?;

        let step = self.with_node(leaf_id, |node| {
            if node.find_key_index(key)?.is_ok() {
                return Ok((LeafStep::Duplicate, false));
            }
            if !node.is_full() {
                node.insert_leaf_pair(key, rid)?;
                return Ok((LeafStep::Inserted, true));
            }
            Ok((
                LeafStep::Full {
                    entries: node.leaf_entries()?,
                    next: node.next_page_id(),
                },
                false,
            ))
        })?;

        let (mut separator, mut right_id) = match step {
            LeafStep::Duplicate => return Ok(false),
            LeafStep::Inserted => return Ok(true),
            LeafStep::Full { entries, next } => {
                self.split_leaf(leaf_id, entries, next, key, rid)?
            }
        };

        // Walk the recorded path back up, inserting the promoted separator
        // at each level until a parent has room.
        while let Some((parent_id, _)) = path.pop() {
            let overflow = self.with_node(parent_id, |node| {
                if !node.is_full() {
                    node.insert_internal_pair(&separator, right_id)?;
                    return Ok((None, true));
                }
                Ok((Some(node.internal_entries()?), false))
            })?;

            match overflow {
                None => return Ok(true),
                Some((keys, children)) => {
                    let (promoted, new_id) =
                        self.split_internal(parent_id, keys, children, separator, right_id)?;
                    separator = promoted;
                    right_id = new_id;
                }
            }
        }

        // The root itself split: grow the tree by one level.
        let old_root = self.root_page_id;
        let new_root = self.create_node(false)?;
        let wrote = self.with_node(new_root, |node| {
            node.write_internal_entries(std::slice::from_ref(&separator), &[old_root, right_id])?;
            Ok(((), true))
        });
        if let Err(e) = wrote {
            self.free_node(new_root);
            return Err(e);
        }
        self.root_page_id = new_root;
        Ok(true)
    }

    /// Look up the RID stored under `key`; `Rid::invalid()` when absent.
    pub fn search(&self, key: &Value) -> DbResult<Rid> {
        self.check_key(key)?;
        if !self.root_page_id.is_valid() {
            return Ok(Rid::invalid());
        }
        let leaf_id = self.find_leaf(key)?;
        self.with_node(leaf_id, |node| {
            let rid = match node.find_key_index(key)? {
                Ok(index) => node.rid_at(index)?,
                Err(_) => Rid::invalid(),
            };
            Ok((rid, false))
        })
    }

    /// RIDs of all keys in `[begin, end]`, in ascending key order.
    pub fn range(&self, begin: &Value, end: &Value) -> DbResult<Vec<Rid>> {
        self.check_key(begin)?;
        self.check_key(end)?;

        let mut results = Vec::new();
        if !self.root_page_id.is_valid()
            || matches!(begin.cmp_same_type(end), Some(Ordering::Greater))
        {
            return Ok(results);
        }

        let mut current = self.find_leaf(begin)?;
        loop {
            let (chunk, next, past_end) = self.with_node(current, |node| {
                let mut chunk = Vec::new();
                let mut past_end = false;
                for index in 0..node.key_count() {
                    let key = node.key_at(index)?;
                    if matches!(key.cmp_same_type(begin), Some(Ordering::Less)) {
                        continue;
                    }
                    if matches!(key.cmp_same_type(end), Some(Ordering::Greater)) {
                        past_end = true;
                        break;
                    }
                    chunk.push(node.rid_at(index)?);
                }
                Ok(((chunk, node.next_page_id(), past_end), false))
            })?;

            results.extend(chunk);
            if past_end || !next.is_valid() {
                return Ok(results);
            }
            current = next;
        }
    }

    /// Delete `key` from its leaf. Returns `Ok(false)` when absent.
    ///
    /// Leaf-only deletion: underflowed leaves are tolerated and separator
    /// keys in internal nodes are left as-is, which keeps search and range
    /// correct without borrow/merge rebalancing.
    pub fn remove(&mut self, key: &Value) -> DbResult<bool> {
        self.check_key(key)?;
        if !self.root_page_id.is_valid() {
            return Ok(false);
        }
        let leaf_id = self.find_leaf(key)?;
        self.with_node(leaf_id, |node| match node.find_key_index(key)? {
            Ok(index) => {
                node.remove_leaf_pair(index)?;
                Ok((true, true))
            }
            Err(_) => Ok((false, false)),
        })
    }

    /// Number of levels, counting the leaf level. 0 for an empty tree.
    pub fn height(&self) -> DbResult<u32> {
        if !self.root_page_id.is_valid() {
            return Ok(0);
        }
        let mut levels = 1;
        let mut current = self.root_page_id;
        loop {
            let child = self.with_node(current, |node| {
                let child = if node.is_leaf() {
                    None
                } else {
                    Some(node.child_at(0)?)
                };
                Ok((child, false))
            })?;
            match child {
                None => return Ok(levels),
                Some(next) => {
                    levels += 1;
                    current = next;
                }
            }
        }
    }

    /// Number of nodes in the tree, leaves included. 0 for an empty tree.
    pub fn node_count(&self) -> DbResult<u32> {
        if !self.root_page_id.is_valid() {
            return Ok(0);
        }
        let mut count = 0;
        let mut pending = vec![self.root_page_id];
        while let Some(page_id) = pending.pop() {
            count += 1;
            let children = self.with_node(page_id, |node| {
                let children = if node.is_leaf() {
                    Vec::new()
                } else {
                    (0..=node.key_count())
                        .map(|i| node.child_at(i))
                        .collect::<DbResult<Vec<_>>>()?
                };
                Ok((children, false))
            })?;
            pending.extend(children);
        }
        Ok(count)
    }

    /// Descend to the leaf whose key range covers `key`.
    fn find_leaf(&self, key: &Value) -> DbResult<PageId> {
        let mut current = self.root_page_id;
        loop {
            match self.descend_step(current, key)? {
                None => return Ok(current),
                Some(child) => current = child,
            }
        }
    }

    /// Like [`BTree::find_leaf`], recording the `(page_id, child_index)`
    /// pairs visited so splits can walk back up without parent pointers.
    fn find_leaf_with_path(&self, key: &Value) -> DbResult<(PageId, Vec<(PageId, usize)>)> {
        let mut path = Vec::new();
        let mut current = self.root_page_id;
        loop {
            let step = self.with_node(current, |node| {
                if node.is_leaf() {
                    return Ok((None, false));
                }
                let index = node.child_index_for(key)?;
                Ok((Some((index, node.child_at(index)?)), false))
            })?;
            match step {
                None => return Ok((current, path)),
                Some((index, child)) => {
                    if !child.is_valid() {
                        return Err(DbError::Corrupted(format!(
                            "invalid child pointer in node {current}"
                        )));
                    }
                    path.push((current, index));
                    current = child;
                }
            }
        }
    }

    fn descend_step(&self, page_id: PageId, key: &Value) -> DbResult<Option<PageId>> {
        let child = self.with_node(page_id, |node| {
            if node.is_leaf() {
                return Ok((None, false));
            }
            Ok((Some(node.child_at(node.child_index_for(key)?)?), false))
        })?;
        if let Some(child) = child
            && !child.is_valid()
        {
            return Err(DbError::Corrupted(format!(
                "invalid child pointer in node {page_id}"
            )));
        }
        Ok(child)
    }

    /// Split a full leaf and place the pending pair.
    ///
    /// The upper half of the entries moves to a new leaf that takes over
    /// the old `next` pointer; the promoted separator is the first key of
    /// the new leaf. On failure the old leaf is untouched and the new page
    /// is freed.
    fn split_leaf(
        &self,
        leaf_id: PageId,
        mut entries: Vec<(Value, Rid)>,
        old_next: PageId,
        key: &Value,
        rid: Rid,
    ) -> DbResult<(Value, PageId)> {
        let split_pos = entries.len().div_ceil(2);
        let mut right = entries.split_off(split_pos);
        let separator = right[0].0.clone();

        let target = if matches!(key.cmp_same_type(&separator), Some(Ordering::Less)) {
            &mut entries
        } else {
            &mut right
        };
        let pos = target
            .partition_point(|(k, _)| matches!(k.cmp_same_type(key), Some(Ordering::Less)));
        target.insert(pos, (key.clone(), rid));

        let new_id = self.create_node(true)?;
        let wrote = self
            .with_node(new_id, |node| {
                node.write_leaf_entries(&right)?;
                node.set_next_page_id(old_next);
                Ok(((), true))
            })
            .and_then(|()| {
                self.with_node(leaf_id, |node| {
                    node.write_leaf_entries(&entries)?;
                    node.set_next_page_id(new_id);
                    Ok(((), true))
                })
            });
        if let Err(e) = wrote {
            self.free_node(new_id);
            return Err(e);
        }
        Ok((separator, new_id))
    }

    /// Split a full internal node after conceptually inserting the pending
    /// pair. The middle key is promoted, not kept in either half.
    fn split_internal(
        &self,
        page_id: PageId,
        mut keys: Vec<Value>,
        mut children: Vec<PageId>,
        separator: Value,
        right_child: PageId,
    ) -> DbResult<(Value, PageId)> {
        let pos = keys
            .partition_point(|k| matches!(k.cmp_same_type(&separator), Some(Ordering::Less)));
        keys.insert(pos, separator);
        children.insert(pos + 1, right_child);

        let mid = keys.len() / 2;
        let promoted = keys[mid].clone();
        let right_keys = keys.split_off(mid + 1);
        let right_children = children.split_off(mid + 1);
        keys.truncate(mid);

        let new_id = self.create_node(false)?;
        let wrote = self
            .with_node(new_id, |node| {
                node.write_internal_entries(&right_keys, &right_children)?;
                Ok(((), true))
            })
            .and_then(|()| {
                self.with_node(page_id, |node| {
                    node.write_internal_entries(&keys, &children)?;
                    Ok(((), true))
                })
            });
        if let Err(e) = wrote {
            self.free_node(new_id);
            return Err(e);
        }
        Ok((promoted, new_id))
    }

    /// Allocate and format a fresh node page.
    fn create_node(&self, leaf: bool) -> DbResult<PageId> {
        let page_id = self.pager.allocate()?;
        let page_ref = match self.pager.get(page_id) {
            Ok(page_ref) => page_ref,
            Err(e) => {
                self.free_node(page_id);
                return Err(e);
            }
        };
        let formatted = {
            let mut page = page_ref.write().expect("page latch poisoned");
            if leaf {
                BTreeNode::init_leaf(&mut page, self.key_type).map(|_| ())
            } else {
                BTreeNode::init_internal(&mut page, self.key_type).map(|_| ())
            }
        };
        drop(page_ref);
        match formatted {
            Ok(()) => {
                self.pager.release(page_id, true)?;
                Ok(page_id)
            }
            Err(e) => {
                self.release_quietly(page_id);
                self.free_node(page_id);
                Err(e)
            }
        }
    }

    /// Lease `page_id`, run `f` on its node view, and release the lease.
    /// `f` returns the result plus whether it dirtied the page.
    fn with_node<T>(
        &self,
        page_id: PageId,
        f: impl FnOnce(&mut BTreeNode<'_>) -> DbResult<(T, bool)>,
    ) -> DbResult<T> {
        let page_ref = self.pager.get(page_id)?;
        let outcome = {
            let mut page = page_ref.write().expect("page latch poisoned");
            BTreeNode::attach(&mut page).and_then(|mut node| f(&mut node))
        };
        drop(page_ref);
        match outcome {
            Ok((value, dirty)) => {
                self.pager.release(page_id, dirty)?;
                Ok(value)
            }
            Err(e) => {
                self.release_quietly(page_id);
                Err(e)
            }
        }
    }

    fn release_quietly(&self, page_id: PageId) {
        if let Err(e) = self.pager.release(page_id, false) {
            warn!("failed to release page {page_id}: {e}");
        }
    }

    /// Best-effort cleanup of a node allocated by a failed split.
    fn free_node(&self, page_id: PageId) {
        if let Err(e) = self.pager.deallocate(page_id) {
            warn!("failed to free page {page_id} after aborted split: {e}");
        }
    }

    fn check_key(&self, key: &Value) -> DbResult<()> {
        if key.is_invalid() || key.type_id() != self.key_type {
            return Err(DbError::TypeMismatch {
                expected: self.key_type,
                actual: key.type_id(),
            });
        }
        if let Value::Varchar(s) = key
            && s.len() > MAX_VARCHAR_KEY_LEN
        {
            return Err(DbError::NotSupported(
                "varchar keys longer than 256 bytes",
            ));
        }
        Ok(())
    }
}
