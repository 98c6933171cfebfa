//! On-page B+ tree node layout.
//!
//! A node lives inside the data region of one index page: a packed
//! [`NodeHeader`] followed by sorted entries. Leaves store `key | rid`
//! pairs. Internal nodes store one leading child pointer and then
//! `key | child` pairs, so the child right of `keys[i]` is `children[i+1]`.
//! Fixed-size keys use a constant stride; varchar keys carry a `u16`
//! length prefix and entry offsets are found by linear scan.

use std::cmp::Ordering;

use bincode::config::{self, Config};
use bincode::serde::{decode_from_slice, encode_into_slice};
use common::{DbError, DbResult, PageId, Rid};
use storage::{PAGE_DATA_BYTES, Page, PageType};
use types::{TypeId, Value};

/// Packed size of [`NodeHeader`] on disk.
pub const NODE_HEADER_BYTES: usize = 10;
/// Longest varchar key accepted by the tree; node capacity is sized
/// against it.
pub const MAX_VARCHAR_KEY_LEN: usize = 256;

const RID_BYTES: usize = 8;
const CHILD_BYTES: usize = 4;

fn bincode_config() -> impl Config {
    config::legacy()
}

/// Node header, stored packed little-endian at offset 0 of the data
/// region. `next_page_id` chains leaves in ascending key order and is
/// `INVALID` for internal nodes and the last leaf. `key_size` is 0 for
/// varchar keys (variable layout).
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct NodeHeader {
    pub is_leaf: u8,
    pub key_count: u16,
    pub next_page_id: PageId,
    pub key_type: u8,
    pub key_size: u16,
}

/// Accessor over a leased index page.
///
/// Stateless except for a cached copy of the header; every mutation writes
/// the header back and marks the page dirty. The view is transient and
/// must not outlive the lease on the page it wraps.
pub struct BTreeNode<'a> {
    page: &'a mut Page,
    header: NodeHeader,
}

impl<'a> BTreeNode<'a> {
    /// Interpret an existing index page.
    pub fn attach(page: &'a mut Page) -> DbResult<BTreeNode<'a>> {
        let (header, read): (NodeHeader, usize) =
            decode_from_slice(&page.data()[..NODE_HEADER_BYTES], bincode_config())
                .expect("node header decoding is infallible");
        debug_assert_eq!(read, NODE_HEADER_BYTES);

        let key_type = TypeId::from_u8(header.key_type);
        if header.is_leaf > 1 || key_type.is_none() || key_type == Some(TypeId::Invalid) {
            return Err(DbError::Corrupted(format!(
                "page {} does not hold a b+ tree node",
                page.page_id()
            )));
        }
        Ok(BTreeNode { page, header })
    }

    /// Format `page` as an empty leaf.
    pub fn init_leaf(page: &'a mut Page, key_type: TypeId) -> DbResult<BTreeNode<'a>> {
        Self::init(page, key_type, true)
    }

    /// Format `page` as an empty internal node.
    pub fn init_internal(page: &'a mut Page, key_type: TypeId) -> DbResult<BTreeNode<'a>> {
        Self::init(page, key_type, false)
    }

    fn init(page: &'a mut Page, key_type: TypeId, leaf: bool) -> DbResult<BTreeNode<'a>> {
        if key_type == TypeId::Invalid {
            return Err(DbError::NotSupported("b+ tree keys of the invalid type"));
        }
        page.set_page_type(PageType::Index);
        page.data_mut().fill(0);

        let header = NodeHeader {
            is_leaf: leaf as u8,
            key_count: 0,
            next_page_id: PageId::INVALID,
            key_type: key_type.as_u8(),
            key_size: key_type.fixed_size().unwrap_or(0) as u16,
        };
        let mut node = BTreeNode { page, header };
        node.save_header();
        if !leaf {
            node.set_child_at(0, PageId::INVALID);
        }
        Ok(node)
    }

    pub fn is_leaf(&self) -> bool {
        self.header.is_leaf == 1
    }

    pub fn key_count(&self) -> usize {
        self.header.key_count as usize
    }

    pub fn key_type(&self) -> TypeId {
        TypeId::from_u8(self.header.key_type).expect("key type verified on attach")
    }

    pub fn next_page_id(&self) -> PageId {
        self.header.next_page_id
    }

    pub fn set_next_page_id(&mut self, page_id: PageId) {
        self.header.next_page_id = page_id;
        self.save_header();
    }

    /// Write the cached header back into the page.
    pub fn save_header(&mut self) {
        let written = encode_into_slice(
            self.header,
            &mut self.page.data_mut()[..NODE_HEADER_BYTES],
            bincode_config(),
        )
        .expect("node header encoding is infallible");
        debug_assert_eq!(written, NODE_HEADER_BYTES);
    }

    pub fn key_at(&self, index: usize) -> DbResult<Value> {
        self.check_index(index, self.key_count())?;
        let offset = self.entry_offset(index);
        let (key, _) = Value::decode(self.key_type(), &self.page.data()[offset..])
            .ok_or_else(|| self.corrupted("undecodable key"))?;
        Ok(key)
    }

    /// Record id stored at `index`. Leaf nodes only.
    pub fn rid_at(&self, index: usize) -> DbResult<Rid> {
        assert!(self.is_leaf(), "rid access on an internal node");
        self.check_index(index, self.key_count())?;
        let offset = self.entry_offset(index) + self.key_len_at(index);
        let (rid, _) = decode_from_slice(
            &self.page.data()[offset..offset + RID_BYTES],
            bincode_config(),
        )
        .map_err(|_| self.corrupted("undecodable rid"))?;
        Ok(rid)
    }

    /// Child pointer `index` (0 ..= key_count). Internal nodes only.
    pub fn child_at(&self, index: usize) -> DbResult<PageId> {
        assert!(!self.is_leaf(), "child access on a leaf node");
        self.check_index(index, self.key_count() + 1)?;
        let offset = self.child_offset(index);
        let (child, _) = decode_from_slice(
            &self.page.data()[offset..offset + CHILD_BYTES],
            bincode_config(),
        )
        .map_err(|_| self.corrupted("undecodable child pointer"))?;
        Ok(child)
    }

    pub fn set_child_at(&mut self, index: usize, child: PageId) {
        assert!(!self.is_leaf(), "child access on a leaf node");
        let offset = self.child_offset(index);
        encode_into_slice(
            child,
            &mut self.page.data_mut()[offset..offset + CHILD_BYTES],
            bincode_config(),
        )
        .expect("child pointer encoding is infallible");
    }

    /// Binary search. `Ok(i)` when `keys[i] == key`, otherwise
    /// `Err(insert_pos)`, the index at which `key` would be inserted.
    pub fn find_key_index(&self, key: &Value) -> DbResult<Result<usize, usize>> {
        self.check_key(key)?;
        let mut lo = 0usize;
        let mut hi = self.key_count();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let mid_key = self.key_at(mid)?;
            match mid_key
                .cmp_same_type(key)
                .expect("stored keys match the node key type")
            {
                Ordering::Equal => return Ok(Ok(mid)),
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
            }
        }
        Ok(Err(lo))
    }

    /// Index of the child to descend into for `key`: keys equal to a
    /// separator belong to its right child.
    pub fn child_index_for(&self, key: &Value) -> DbResult<usize> {
        Ok(match self.find_key_index(key)? {
            Ok(found) => found + 1,
            Err(insert_pos) => insert_pos,
        })
    }

    /// Insert a `key → rid` pair into a leaf, keeping keys sorted.
    pub fn insert_leaf_pair(&mut self, key: &Value, rid: Rid) -> DbResult<()> {
        assert!(self.is_leaf(), "leaf insert on an internal node");
        let insert_pos = match self.find_key_index(key)? {
            Ok(_) => return Err(DbError::DuplicateKey(key.clone())),
            Err(pos) => pos,
        };
        let entry_len = self.key_slot_len(key) + RID_BYTES;
        self.make_room(insert_pos, entry_len)?;

        let offset = self.entry_offset(insert_pos);
        let key_len = self.write_key(offset, key);
        encode_into_slice(
            rid,
            &mut self.page.data_mut()[offset + key_len..offset + key_len + RID_BYTES],
            bincode_config(),
        )
        .expect("rid encoding is infallible");

        self.header.key_count += 1;
        self.save_header();
        Ok(())
    }

    /// Insert a separator and its right child into an internal node: the
    /// key lands at `insert_pos`, the child at `insert_pos + 1`.
    pub fn insert_internal_pair(&mut self, key: &Value, child: PageId) -> DbResult<()> {
        assert!(!self.is_leaf(), "internal insert on a leaf node");
        let insert_pos = match self.find_key_index(key)? {
            Ok(_) => return Err(DbError::DuplicateKey(key.clone())),
            Err(pos) => pos,
        };
        let entry_len = self.key_slot_len(key) + CHILD_BYTES;
        self.make_room(insert_pos, entry_len)?;

        let offset = self.entry_offset(insert_pos);
        let key_len = self.write_key(offset, key);
        encode_into_slice(
            child,
            &mut self.page.data_mut()[offset + key_len..offset + key_len + CHILD_BYTES],
            bincode_config(),
        )
        .expect("child pointer encoding is infallible");

        self.header.key_count += 1;
        self.save_header();
        Ok(())
    }

    /// Remove the pair at `index` from a leaf, shifting the tail left.
    pub fn remove_leaf_pair(&mut self, index: usize) -> DbResult<()> {
        assert!(self.is_leaf(), "leaf removal on an internal node");
        self.remove_entry(index)
    }

    /// Remove `keys[index]` and `children[index + 1]` from an internal
    /// node, shifting the tail left.
    pub fn remove_internal_pair(&mut self, index: usize) -> DbResult<()> {
        assert!(!self.is_leaf(), "internal removal on a leaf node");
        self.remove_entry(index)
    }

    /// All `key → rid` pairs of a leaf, in key order.
    pub fn leaf_entries(&self) -> DbResult<Vec<(Value, Rid)>> {
        assert!(self.is_leaf(), "leaf entries of an internal node");
        (0..self.key_count())
            .map(|i| Ok((self.key_at(i)?, self.rid_at(i)?)))
            .collect()
    }

    /// Keys and all `key_count + 1` children of an internal node.
    pub fn internal_entries(&self) -> DbResult<(Vec<Value>, Vec<PageId>)> {
        assert!(!self.is_leaf(), "internal entries of a leaf node");
        let keys = (0..self.key_count())
            .map(|i| self.key_at(i))
            .collect::<DbResult<Vec<_>>>()?;
        let children = (0..=self.key_count())
            .map(|i| self.child_at(i))
            .collect::<DbResult<Vec<_>>>()?;
        Ok((keys, children))
    }

    /// Replace a leaf's entries wholesale. `next_page_id` is untouched.
    pub fn write_leaf_entries(&mut self, entries: &[(Value, Rid)]) -> DbResult<()> {
        assert!(self.is_leaf(), "leaf rewrite of an internal node");
        let mut offset = self.entries_base();
        for (key, rid) in entries {
            self.check_key(key)?;
            let key_len = self.key_slot_len(key);
            if offset + key_len + RID_BYTES > PAGE_DATA_BYTES {
                return Err(self.corrupted("leaf rewrite overflows the page"));
            }
            self.write_key(offset, key);
            encode_into_slice(
                *rid,
                &mut self.page.data_mut()[offset + key_len..offset + key_len + RID_BYTES],
                bincode_config(),
            )
            .expect("rid encoding is infallible");
            offset += key_len + RID_BYTES;
        }
        self.header.key_count = entries.len() as u16;
        self.save_header();
        Ok(())
    }

    /// Replace an internal node's keys and children wholesale.
    pub fn write_internal_entries(&mut self, keys: &[Value], children: &[PageId]) -> DbResult<()> {
        assert!(!self.is_leaf(), "internal rewrite of a leaf node");
        assert_eq!(
            children.len(),
            keys.len() + 1,
            "an internal node carries one more child than keys"
        );
        self.header.key_count = keys.len() as u16;
        self.save_header();
        self.set_child_at(0, children[0]);

        let mut offset = self.entries_base();
        for (key, child) in keys.iter().zip(&children[1..]) {
            self.check_key(key)?;
            let key_len = self.key_slot_len(key);
            if offset + key_len + CHILD_BYTES > PAGE_DATA_BYTES {
                return Err(self.corrupted("internal rewrite overflows the page"));
            }
            self.write_key(offset, key);
            encode_into_slice(
                *child,
                &mut self.page.data_mut()[offset + key_len..offset + key_len + CHILD_BYTES],
                bincode_config(),
            )
            .expect("child pointer encoding is infallible");
            offset += key_len + CHILD_BYTES;
        }
        Ok(())
    }

    /// Largest number of pairs this node can hold. Varchar capacity is
    /// sized against [`MAX_VARCHAR_KEY_LEN`].
    pub fn max_capacity(&self) -> usize {
        let key_slot = match self.key_type().fixed_size() {
            Some(size) => size,
            None => 2 + MAX_VARCHAR_KEY_LEN,
        };
        let pair = key_slot + self.value_size();
        let mut avail = PAGE_DATA_BYTES - NODE_HEADER_BYTES;
        if !self.is_leaf() {
            avail -= CHILD_BYTES;
        }
        avail / pair
    }

    pub fn is_full(&self) -> bool {
        self.key_count() >= self.max_capacity()
    }

    pub fn is_underflow(&self) -> bool {
        self.key_count() < self.max_capacity() / 2
    }

    fn value_size(&self) -> usize {
        if self.is_leaf() { RID_BYTES } else { CHILD_BYTES }
    }

    fn entries_base(&self) -> usize {
        NODE_HEADER_BYTES + if self.is_leaf() { 0 } else { CHILD_BYTES }
    }

    /// Byte offset of entry `index`; `index == key_count` yields the end
    /// of the used region.
    fn entry_offset(&self, index: usize) -> usize {
        if let Some(key_size) = self.key_type().fixed_size() {
            return self.entries_base() + index * (key_size + self.value_size());
        }
        let mut offset = self.entries_base();
        for _ in 0..index {
            let len = u16::from_le_bytes(
                self.page.data()[offset..offset + 2]
                    .try_into()
                    .expect("length prefix in range"),
            ) as usize;
            offset += 2 + len + self.value_size();
        }
        offset
    }

    /// Stored byte length of the key at `index` (length prefix included
    /// for varchar).
    fn key_len_at(&self, index: usize) -> usize {
        if let Some(key_size) = self.key_type().fixed_size() {
            return key_size;
        }
        let offset = self.entry_offset(index);
        let len = u16::from_le_bytes(
            self.page.data()[offset..offset + 2]
                .try_into()
                .expect("length prefix in range"),
        ) as usize;
        2 + len
    }

    fn key_slot_len(&self, key: &Value) -> usize {
        match self.key_type().fixed_size() {
            Some(size) => size,
            None => key.encoded_len(),
        }
    }

    fn child_offset(&self, index: usize) -> usize {
        if index == 0 {
            NODE_HEADER_BYTES
        } else {
            self.entry_offset(index - 1) + self.key_len_at(index - 1)
        }
    }

    /// Shift entries from `insert_pos` right by `entry_len` bytes, failing
    /// before any mutation if the node cannot take another pair.
    fn make_room(&mut self, insert_pos: usize, entry_len: usize) -> DbResult<()> {
        let used_end = self.entry_offset(self.key_count());
        if self.is_full() || used_end + entry_len > PAGE_DATA_BYTES {
            return Err(DbError::PageFull {
                needed: entry_len,
                free: PAGE_DATA_BYTES - used_end,
            });
        }
        let offset = self.entry_offset(insert_pos);
        self.page
            .data_mut()
            .copy_within(offset..used_end, offset + entry_len);
        Ok(())
    }

    fn remove_entry(&mut self, index: usize) -> DbResult<()> {
        self.check_index(index, self.key_count())?;
        let offset = self.entry_offset(index);
        let entry_len = self.key_len_at(index) + self.value_size();
        let used_end = self.entry_offset(self.key_count());
        self.page
            .data_mut()
            .copy_within(offset + entry_len..used_end, offset);

        self.header.key_count -= 1;
        self.save_header();
        Ok(())
    }

    fn write_key(&mut self, offset: usize, key: &Value) -> usize {
        let len = self.key_slot_len(key);
        let data = self.page.data_mut();
        // fixed-size keys occupy the full slot; encode_into writes exactly
        // encoded_len bytes, which equals the slot width for those types
        key.encode_into(&mut data[offset..offset + len])
            .expect("key type and length verified before writing");
        len
    }

    fn check_key(&self, key: &Value) -> DbResult<()> {
        if key.is_invalid() || key.type_id() != self.key_type() {
            return Err(DbError::TypeMismatch {
                expected: self.key_type(),
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

    fn check_index(&self, index: usize, limit: usize) -> DbResult<()> {
        if index >= limit {
            return Err(DbError::OutOfRange {
                what: "node entry",
                index: index as u64,
                limit: limit as u64,
            });
        }
        Ok(())
    }

    fn corrupted(&self, why: &str) -> DbError {
        DbError::Corrupted(format!("node on page {}: {why}", self.page.page_id()))
    }
}
