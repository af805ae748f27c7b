//! What the recovery manager needs from the buffer and disk layers.

use crate::Lsn;
use crate::error::RecoveryResult;

/// Page number: partition in the high 32 bits, page index in the low 32.
pub type PageNum = u64;
pub type PartNum = u32;

/// The partition holding the log itself. Allocations in it are never logged.
pub const LOG_PARTITION: PartNum = 0;

pub fn page_num(part: PartNum, index: u32) -> PageNum {
    (u64::from(part) << 32) | u64::from(index)
}

pub fn part_num(page: PageNum) -> PartNum {
    (page >> 32) as PartNum
}

pub fn page_index(page: PageNum) -> u32 {
    (page & u64::from(u32::MAX)) as u32
}

/// Allocation of partitions and pages. Changes are durable when the call
/// returns.
///
/// Each call reports whether it changed anything: `false` means the object
/// was already in the requested state, which is what replaying an allocation
/// that already reached disk looks like.
pub trait DiskSpaceManager: Send + Sync {
    fn alloc_part(&self, part: PartNum) -> RecoveryResult<bool>;

    fn free_part(&self, part: PartNum) -> RecoveryResult<bool>;

    fn alloc_page(&self, page: PageNum) -> RecoveryResult<bool>;

    fn free_page(&self, page: PageNum) -> RecoveryResult<bool>;

    fn page_allocated(&self, page: PageNum) -> bool;
}

/// A pinned buffer page. Dropping the handle unpins it.
pub trait PageHandle {
    fn page_num(&self) -> PageNum;

    /// LSN of the last log record applied to the page.
    fn page_lsn(&self) -> Lsn;

    fn set_page_lsn(&mut self, lsn: Lsn);

    fn read(&self, offset: usize, len: usize) -> RecoveryResult<Vec<u8>>;

    fn write(&mut self, offset: usize, bytes: &[u8]) -> RecoveryResult<()>;
}

pub trait BufferManager: Send + Sync {
    /// Load `page` into the buffer if needed and pin it.
    fn fetch_page(&self, page: PageNum) -> RecoveryResult<Box<dyn PageHandle + '_>>;

    /// Call `f` with every buffered page and whether it is dirty.
    fn iter_page_nums(&self, f: &mut dyn FnMut(PageNum, bool));
}

/// Callbacks the buffer layer makes around writing a page to disk.
pub trait FlushHooks: Send + Sync {
    /// Called before a page whose pageLSN is `page_lsn` is written, so the log
    /// can be made durable up to it first.
    fn page_flush_hook(&self, page_lsn: Lsn) -> RecoveryResult<()>;

    /// Called after `page` has been written.
    fn disk_io_hook(&self, page: PageNum);
}
