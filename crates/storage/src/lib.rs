//! Physical storage: the database file, page-granular disk I/O, and the
//! slotted record page format.
//!
//! The file is a byte-for-byte sequence of 4096-byte pages. Page 0 is the
//! reserved header page; its first four bytes hold the little-endian page
//! count. Every other page is a [`Page`]: a packed header followed by a
//! slot directory growing up from the start of the data region and record
//! payloads packed down from its end.

mod disk;
mod file;
mod page;


pub use disk::DiskManager;
pub use file::DbFile;
pub use page::{PAGE_DATA_BYTES, PAGE_HEADER_BYTES, Page, PageType, SLOT_BYTES};
