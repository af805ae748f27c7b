use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::Lsn;
use crate::buffer::{
    BufferManager, DiskSpaceManager, FlushHooks, PageHandle, PageNum, PartNum, page_index,
    part_num,
};
use crate::config::MemoryBufferConfig;
use crate::error::{RecoveryError, RecoveryResult};

#[derive(Clone)]
struct DiskImage {
    data: Vec<u8>,
    page_lsn: Lsn,
}

struct Frame {
    data: Vec<u8>,
    page_lsn: Lsn,
    dirty: bool,
    pins: usize,
}

#[derive(Default)]
struct StoreState {
    /// Allocated page indices per allocated partition.
    partitions: HashMap<PartNum, BTreeSet<u32>>,
    /// Page images on "disk". Pages never written read as zeros.
    disk: HashMap<PageNum, DiskImage>,
    /// Buffered pages.
    frames: HashMap<PageNum, Frame>,
}

impl StoreState {
    fn page_allocated(&self, page: PageNum) -> bool {
        self.partitions
            .get(&part_num(page))
            .is_some_and(|pages| pages.contains(&page_index(page)))
    }

    fn frame(&self, page: PageNum) -> RecoveryResult<&Frame> {
        self.frames
            .get(&page)
            .ok_or_else(|| RecoveryError::Buffer(format!("page {page} is not buffered")))
    }

    fn frame_mut(&mut self, page: PageNum) -> RecoveryResult<&mut Frame> {
        self.frames
            .get_mut(&page)
            .ok_or_else(|| RecoveryError::Buffer(format!("page {page} is not buffered")))
    }
}

/// An in-memory disk with a buffer pool in front of it.
///
/// Allocations go straight to disk. Page contents are only written to disk by
/// [`MemoryStore::flush_page`] and [`MemoryStore::flush_all`], which honour the
/// write-ahead rule through the registered [`FlushHooks`]. [`MemoryStore::crash`]
/// drops the buffer pool, leaving exactly what was flushed.
pub struct MemoryStore {
    config: MemoryBufferConfig,
    state: Mutex<StoreState>,
    hooks: RwLock<Option<Weak<dyn FlushHooks>>>,
}

impl MemoryStore {
    pub fn new(config: MemoryBufferConfig) -> Self {
        Self {
            config,
            state: Mutex::new(StoreState::default()),
            hooks: RwLock::new(None),
        }
    }

    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// Register the callbacks made around page writes, typically the
    /// recovery manager.
    pub fn set_flush_hooks(&self, hooks: Weak<dyn FlushHooks>) {
        *self.hooks.write() = Some(hooks);
    }

    fn flush_hooks(&self) -> Option<Arc<dyn FlushHooks>> {
        self.hooks.read().as_ref().and_then(Weak::upgrade)
    }

    /// Write `page` to disk if it is buffered and dirty.
    ///
    /// The log is flushed up to the page's pageLSN before the image is
    /// written; if that fails the page stays dirty in the buffer.
    pub fn flush_page(&self, page: PageNum) -> RecoveryResult<()> {
        let hooks = self.flush_hooks();
        {
            let mut state = self.state.lock();
            let Some(frame) = state.frames.get_mut(&page) else {
                return Ok(());
            };
            if !frame.dirty {
                return Ok(());
            }
            if let Some(hooks) = &hooks {
                hooks.page_flush_hook(frame.page_lsn)?;
            }
            frame.dirty = false;
            let image = DiskImage {
                data: frame.data.clone(),
                page_lsn: frame.page_lsn,
            };
            state.disk.insert(page, image);
        }
        tracing::trace!(page, "flushed page");
        if let Some(hooks) = &hooks {
            hooks.disk_io_hook(page);
        }
        Ok(())
    }

    pub fn flush_all(&self) -> RecoveryResult<()> {
        let mut dirty: Vec<PageNum> = self
            .state
            .lock()
            .frames
            .iter()
            .filter(|(_, frame)| frame.dirty)
            .map(|(page, _)| *page)
            .collect();
        dirty.sort_unstable();
        for page in dirty {
            self.flush_page(page)?;
        }
        Ok(())
    }

    /// Lose everything that was not flushed.
    pub fn crash(&self) {
        let mut state = self.state.lock();
        tracing::debug!(frames = state.frames.len(), "dropping buffer pool");
        state.frames.clear();
    }

    /// The on-disk image of `page` and its pageLSN.
    pub fn disk_image(&self, page: PageNum) -> Option<(Vec<u8>, Lsn)> {
        self.state
            .lock()
            .disk
            .get(&page)
            .map(|image| (image.data.clone(), image.page_lsn))
    }

    pub fn is_dirty(&self, page: PageNum) -> bool {
        self.state
            .lock()
            .frames
            .get(&page)
            .is_some_and(|frame| frame.dirty)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(MemoryBufferConfig::default())
    }
}

impl DiskSpaceManager for MemoryStore {
    fn alloc_part(&self, part: PartNum) -> RecoveryResult<bool> {
        let mut state = self.state.lock();
        if state.partitions.contains_key(&part) {
            return Ok(false);
        }
        state.partitions.insert(part, BTreeSet::new());
        Ok(true)
    }

    fn free_part(&self, part: PartNum) -> RecoveryResult<bool> {
        let mut state = self.state.lock();
        if state.partitions.remove(&part).is_none() {
            return Ok(false);
        }
        state.disk.retain(|page, _| part_num(*page) != part);
        state.frames.retain(|page, _| part_num(*page) != part);
        Ok(true)
    }

    fn alloc_page(&self, page: PageNum) -> RecoveryResult<bool> {
        let mut state = self.state.lock();
        let part = part_num(page);
        let Some(pages) = state.partitions.get_mut(&part) else {
            return Err(RecoveryError::Buffer(format!(
                "cannot allocate page {page}: partition {part} is not allocated"
            )));
        };
        Ok(pages.insert(page_index(page)))
    }

    fn free_page(&self, page: PageNum) -> RecoveryResult<bool> {
        let mut state = self.state.lock();
        if state.frames.get(&page).is_some_and(|frame| frame.pins > 0) {
            return Err(RecoveryError::Buffer(format!(
                "cannot free page {page} while it is pinned"
            )));
        }
        let freed = state
            .partitions
            .get_mut(&part_num(page))
            .is_some_and(|pages| pages.remove(&page_index(page)));
        if freed {
            state.disk.remove(&page);
            state.frames.remove(&page);
        }
        Ok(freed)
    }

    fn page_allocated(&self, page: PageNum) -> bool {
        self.state.lock().page_allocated(page)
    }
}

impl BufferManager for MemoryStore {
    fn fetch_page(&self, page: PageNum) -> RecoveryResult<Box<dyn PageHandle + '_>> {
        let mut state = self.state.lock();
        if !state.page_allocated(page) {
            return Err(RecoveryError::Buffer(format!(
                "page {page} is not allocated"
            )));
        }
        let loaded = state.disk.get(&page).cloned();
        let page_size = self.config.page_size;
        let frame = state.frames.entry(page).or_insert_with(|| match loaded {
            Some(image) => Frame {
                data: image.data,
                page_lsn: image.page_lsn,
                dirty: false,
                pins: 0,
            },
            None => Frame {
                data: vec![0; page_size],
                page_lsn: 0,
                dirty: false,
                pins: 0,
            },
        });
        frame.pins += 1;
        Ok(Box::new(MemoryPage {
            store: self,
            page_num: page,
        }))
    }

    fn iter_page_nums(&self, f: &mut dyn FnMut(PageNum, bool)) {
        let mut pages: Vec<(PageNum, bool)> = self
            .state
            .lock()
            .frames
            .iter()
            .map(|(page, frame)| (*page, frame.dirty))
            .collect();
        pages.sort_unstable();
        for (page, dirty) in pages {
            f(page, dirty);
        }
    }
}

struct MemoryPage<'a> {
    store: &'a MemoryStore,
    page_num: PageNum,
}

impl MemoryPage<'_> {
    fn check_range(&self, offset: usize, len: usize) -> RecoveryResult<()> {
        let page_size = self.store.config.page_size;
        if offset.checked_add(len).is_none_or(|end| end > page_size) {
            return Err(RecoveryError::Buffer(format!(
                "range {offset}+{len} is outside page {} of {page_size} bytes",
                self.page_num
            )));
        }
        Ok(())
    }
}

impl PageHandle for MemoryPage<'_> {
    fn page_num(&self) -> PageNum {
        self.page_num
    }

    fn page_lsn(&self) -> Lsn {
        self.store
            .state
            .lock()
            .frames
            .get(&self.page_num)
            .map_or(0, |frame| frame.page_lsn)
    }

    fn set_page_lsn(&mut self, lsn: Lsn) {
        let mut state = self.store.state.lock();
        if let Some(frame) = state.frames.get_mut(&self.page_num) {
            frame.page_lsn = lsn;
            frame.dirty = true;
        }
    }

    fn read(&self, offset: usize, len: usize) -> RecoveryResult<Vec<u8>> {
        self.check_range(offset, len)?;
        let state = self.store.state.lock();
        let frame = state.frame(self.page_num)?;
        Ok(frame.data[offset..offset + len].to_vec())
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> RecoveryResult<()> {
        self.check_range(offset, bytes.len())?;
        let mut state = self.store.state.lock();
        let frame = state.frame_mut(self.page_num)?;
        frame.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        frame.dirty = true;
        Ok(())
    }
}

impl Drop for MemoryPage<'_> {
    fn drop(&mut self) {
        let mut state = self.store.state.lock();
        if let Some(frame) = state.frames.get_mut(&self.page_num) {
            frame.pins = frame.pins.saturating_sub(1);
        }
    }
}
