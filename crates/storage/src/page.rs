use bincode::config::{self, Config};
use bincode::serde::{decode_from_slice, encode_into_slice};
use common::{DbError, DbResult, PAGE_SIZE, PageId, Rid};

/// Packed size of [`PageHeader`] on disk.
pub const PAGE_HEADER_BYTES: usize = 16;
/// Bytes available to the slot directory and record payloads.
pub const PAGE_DATA_BYTES: usize = PAGE_SIZE - PAGE_HEADER_BYTES;
/// Packed size of one slot directory entry.
pub const SLOT_BYTES: usize = 4;

fn bincode_config() -> impl Config {
    config::legacy()
}

/// What a page stores. The raw byte lives in the header's `page_type` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageType {
    Data,
    Index,
    Meta,
}

impl PageType {
    pub fn from_u8(raw: u8) -> Option<PageType> {
        match raw {
            0 => Some(PageType::Data),
            1 => Some(PageType::Index),
            2 => Some(PageType::Meta),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            PageType::Data => 0,
            PageType::Index => 1,
            PageType::Meta => 2,
        }
    }
}

/// On-disk page header, stored packed little-endian in the first 16 bytes.
///
/// `page_type` and `is_dirty` stay raw `u8` here so the bincode legacy
/// encoding matches the file format byte for byte; [`Page`] exposes typed
/// accessors. The persisted `is_dirty` byte is advisory only.
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct PageHeader {
    pub page_id: PageId,
    pub page_type: u8,
    pub slot_count: u16,
    pub free_space_offset: u16,
    pub free_space: u16,
    pub is_dirty: u8,
    pub next_free_page: PageId,
}

/// One slot directory entry: payload offset and size within the data
/// region. `size == 0` marks a tombstone.
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
struct Slot {
    offset: u16,
    size: u16,
}

impl Slot {
    fn is_tombstone(&self) -> bool {
        self.size == 0
    }
}

/// In-memory image of one 4 KiB page: header plus slotted data region.
///
/// The slot directory grows upward from offset 0 of the data region;
/// record payloads are packed downward from its end. RIDs name slot
/// numbers, never byte offsets, so compaction can move payloads without
/// invalidating them.
#[derive(Clone, Debug)]
pub struct Page {
    header: PageHeader,
    data: Vec<u8>,
}

impl Page {
    /// A fresh, empty page.
    pub fn new(page_id: PageId, page_type: PageType) -> Page {
        Page {
            header: PageHeader {
                page_id,
                page_type: page_type.as_u8(),
                slot_count: 0,
                free_space_offset: PAGE_DATA_BYTES as u16,
                free_space: PAGE_DATA_BYTES as u16,
                is_dirty: 0,
                next_free_page: PageId::INVALID,
            },
            data: vec![0u8; PAGE_DATA_BYTES],
        }
    }

    pub fn page_id(&self) -> PageId {
        self.header.page_id
    }

    pub fn page_type(&self) -> Option<PageType> {
        PageType::from_u8(self.header.page_type)
    }

    pub fn set_page_type(&mut self, page_type: PageType) {
        self.header.page_type = page_type.as_u8();
        self.set_dirty(true);
    }

    pub fn slot_count(&self) -> u16 {
        self.header.slot_count
    }

    pub fn free_space(&self) -> u16 {
        self.header.free_space
    }

    pub fn free_space_offset(&self) -> u16 {
        self.header.free_space_offset
    }

    pub fn is_dirty(&self) -> bool {
        self.header.is_dirty != 0
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.header.is_dirty = dirty as u8;
    }

    pub fn header(&self) -> &PageHeader {
        &self.header
    }

    /// Raw data region (everything after the header). Index pages lay
    /// their node format out here.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.set_dirty(true);
        &mut self.data
    }

    pub fn has_enough_space(&self, record_size: usize) -> bool {
        record_size + SLOT_BYTES <= self.header.free_space as usize
    }

    /// Append a record, returning its RID.
    ///
    /// The payload lands at `free_space_offset - size`, a new slot is
    /// appended to the directory, and the accounting fields move together
    /// so the invariant `slots + used + free == data region` holds.
    pub fn insert_record(&mut self, record: &[u8]) -> DbResult<Rid> {
        let size = record.len();
        if size == 0 {
            return Err(DbError::NotSupported("zero-length records"));
        }
        if size > u16::MAX as usize || !self.has_enough_space(size) {
            return Err(DbError::PageFull {
                needed: size + SLOT_BYTES,
                free: self.header.free_space as usize,
            });
        }

        let slot_num = self.header.slot_count;
        let end = self.header.free_space_offset as usize;
        let start = end - size;
        self.data[start..end].copy_from_slice(record);
        self.write_slot(
            slot_num,
            Slot {
                offset: start as u16,
                size: size as u16,
            },
        );

        self.header.slot_count += 1;
        self.header.free_space_offset = start as u16;
        self.header.free_space -= (size + SLOT_BYTES) as u16;
        self.set_dirty(true);

        Ok(Rid::new(self.header.page_id, slot_num as u32))
    }

    /// Payload bytes for `rid`, or `None` if the RID names another page, a
    /// slot that does not exist, or a tombstone.
    pub fn get_record(&self, rid: Rid) -> Option<&[u8]> {
        let slot = self.live_slot(rid)?;
        let start = slot.offset as usize;
        Some(&self.data[start..start + slot.size as usize])
    }

    /// Tombstone the record's slot. The payload bytes stay in place until
    /// compaction; the slot number is never reused, so neighbouring RIDs
    /// stay valid. Returns false if there was nothing live to delete.
    pub fn delete_record(&mut self, rid: Rid) -> bool {
        let Some(slot) = self.live_slot(rid) else {
            return false;
        };
        self.write_slot(
            rid.slot as u16,
            Slot {
                offset: slot.offset,
                size: 0,
            },
        );
        self.set_dirty(true);
        true
    }

    /// Replace a record: tombstone the old slot and append the new payload
    /// under a fresh slot number.
    ///
    /// `InvalidRid` if `rid` is not a live record here; `PageFull` if the
    /// new payload does not fit, in which case the page is left untouched
    /// and the caller decides whether to compact or spill.
    pub fn update_record(&mut self, rid: Rid, record: &[u8]) -> DbResult<Rid> {
        if self.live_slot(rid).is_none() {
            return Err(DbError::InvalidRid(rid));
        }
        if record.is_empty() {
            return Err(DbError::NotSupported("zero-length records"));
        }
        if record.len() > u16::MAX as usize || !self.has_enough_space(record.len()) {
            return Err(DbError::PageFull {
                needed: record.len() + SLOT_BYTES,
                free: self.header.free_space as usize,
            });
        }

        self.delete_record(rid);
        self.insert_record(record)
    }

    /// Coalesce tombstone space: repack live payloads against the end of
    /// the data region and rewrite slot offsets. Slot numbers (and hence
    /// RIDs) of live records do not change.
    pub fn compactify(&mut self) {
        let mut packed = vec![0u8; PAGE_DATA_BYTES];
        let mut write_end = PAGE_DATA_BYTES;

        for slot_num in 0..self.header.slot_count {
            let slot = self.read_slot(slot_num);
            if slot.is_tombstone() {
                continue;
            }
            let size = slot.size as usize;
            let start = slot.offset as usize;
            write_end -= size;
            packed[write_end..write_end + size].copy_from_slice(&self.data[start..start + size]);
            self.write_slot(
                slot_num,
                Slot {
                    offset: write_end as u16,
                    size: slot.size,
                },
            );
        }

        let old_offset = self.header.free_space_offset as usize;
        self.data[write_end..].copy_from_slice(&packed[write_end..]);
        self.header.free_space_offset = write_end as u16;
        self.header.free_space += (write_end - old_offset) as u16;
        self.set_dirty(true);
    }

    /// Write the on-disk image (header + data region) into `dest`.
    pub fn serialize(&self, dest: &mut [u8]) {
        debug_assert_eq!(dest.len(), PAGE_SIZE);
        let written = encode_into_slice(
            self.header,
            &mut dest[..PAGE_HEADER_BYTES],
            bincode_config(),
        )
        .expect("page header encoding is infallible");
        debug_assert_eq!(written, PAGE_HEADER_BYTES);
        dest[PAGE_HEADER_BYTES..].copy_from_slice(&self.data);
    }

    /// Rebuild a page from its on-disk image. The persisted dirty bit is
    /// advisory and is cleared; buffer state is authoritative.
    pub fn deserialize(src: &[u8]) -> Page {
        debug_assert_eq!(src.len(), PAGE_SIZE);
        let (mut header, read): (PageHeader, usize) =
            decode_from_slice(&src[..PAGE_HEADER_BYTES], bincode_config())
                .expect("page header decoding is infallible");
        debug_assert_eq!(read, PAGE_HEADER_BYTES);
        header.is_dirty = 0;
        Page {
            header,
            data: src[PAGE_HEADER_BYTES..].to_vec(),
        }
    }

    /// Whether the header satisfies the slotted-page accounting equation
    /// and basic range checks. Pages that fail this are reinitialized by
    /// the buffer pool on load.
    pub fn is_consistent(&self) -> bool {
        let h = &self.header;
        let offset = h.free_space_offset as usize;
        let dir = h.slot_count as usize * SLOT_BYTES;
        h.page_id.is_valid()
            && PageType::from_u8(h.page_type).is_some()
            && offset <= PAGE_DATA_BYTES
            && dir <= offset
            && h.free_space as usize == offset - dir
    }

    fn live_slot(&self, rid: Rid) -> Option<Slot> {
        if rid.page_id != self.header.page_id || rid.slot >= self.header.slot_count as u32 {
            return None;
        }
        let slot = self.read_slot(rid.slot as u16);
        if slot.is_tombstone() { None } else { Some(slot) }
    }

    fn read_slot(&self, slot_num: u16) -> Slot {
        let start = slot_num as usize * SLOT_BYTES;
        let (slot, _) = decode_from_slice(&self.data[start..start + SLOT_BYTES], bincode_config())
            .expect("slot decoding is infallible");
        slot
    }

    fn write_slot(&mut self, slot_num: u16, slot: Slot) {
        let start = slot_num as usize * SLOT_BYTES;
        encode_into_slice(
            slot,
            &mut self.data[start..start + SLOT_BYTES],
            bincode_config(),
        )
        .expect("slot encoding is infallible");
    }
}

impl std::fmt::Display for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let h = &self.header;
        write!(
            f,
            "Page[id={}, type={}, slots={}, free={}@{}]",
            h.page_id, h.page_type, h.slot_count, h.free_space, h.free_space_offset
        )
    }
}
