//! Per-process address spaces.
//!
//! An `AddressSpace` owns one mapping root plus the bookkeeping needed
//! to tear it down: which user pages it installed and whether the
//! backing frames belong to it (anonymous memory) or to someone else
//! (shared regions, initrd windows). All mutation happens under the
//! per-space lock; lock order is space lock → mapper → PMM.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use super::mapper::{MapError, MapFlags, Mapper, MappingRoot};
use super::{PhysicalAddress, VirtualAddress};
use crate::config::FRAME_SIZE;
use crate::sync::IrqMutex;

/// Who owns the frame behind a user page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageBacking {
    /// Frame allocated by this space; freed when unmapped.
    Anonymous,
    /// Caller-supplied frame (shared memory, initrd); never freed here.
    Borrowed,
}

struct SpaceInner {
    /// Installed user pages, keyed by page-aligned VA.
    pages: BTreeMap<u64, PageBacking>,
}

/// A process's view of memory.
pub struct AddressSpace {
    root: MappingRoot,
    mapper: &'static dyn Mapper,
    inner: IrqMutex<SpaceInner>,
}

impl AddressSpace {
    /// Create a fresh space with the kernel half cloned in.
    pub fn new(mapper: &'static dyn Mapper) -> Result<Arc<Self>, MapError> {
        let root = mapper.create_root().ok_or(MapError::OutOfMemory)?;
        Ok(Arc::new(Self {
            root,
            mapper,
            inner: IrqMutex::new(SpaceInner {
                pages: BTreeMap::new(),
            }),
        }))
    }

    pub fn root(&self) -> MappingRoot {
        self.root
    }

    fn check_user_va(va: VirtualAddress, n_pages: usize) -> Result<(), MapError> {
        if !va.is_page_aligned() {
            return Err(MapError::Misaligned);
        }
        let end = va.as_u64() + (n_pages * FRAME_SIZE) as u64;
        if !va.is_user() || end == 0 || !VirtualAddress::new(end - 1).is_user() {
            return Err(MapError::NonCanonical);
        }
        Ok(())
    }

    /// Map one caller-owned page.
    pub fn map_page(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: MapFlags,
    ) -> Result<(), MapError> {
        Self::check_user_va(va, 1)?;
        let mut inner = self.inner.lock();
        self.mapper.map4k(self.root, va, pa, flags | MapFlags::USER)?;
        inner.pages.insert(va.as_u64(), PageBacking::Borrowed);
        Ok(())
    }

    /// Remove one page, returning its frame to the caller.
    pub fn unmap_page(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let mut inner = self.inner.lock();
        let pa = self.mapper.unmap4k(self.root, va)?;
        inner.pages.remove(&va.as_u64());
        Some(pa)
    }

    /// Map `n_pages` of zeroed anonymous memory at `va`.
    ///
    /// Frames are zeroed through the direct map before they become
    /// user-visible, so stale kernel data can never leak. On any
    /// failure the already-installed prefix is unwound and its frames
    /// are returned.
    pub fn map_anonymous(
        &self,
        va: VirtualAddress,
        n_pages: usize,
        flags: MapFlags,
    ) -> Result<(), MapError> {
        Self::check_user_va(va, n_pages)?;
        let mut inner = self.inner.lock();
        for i in 0..n_pages {
            let page_va = va.add(i * FRAME_SIZE);
            let frame = match self.mapper.alloc_frame() {
                Some(f) => f,
                None => {
                    self.rollback(&mut inner, va, i);
                    return Err(MapError::OutOfMemory);
                }
            };
            // SAFETY: the frame was just allocated and is reached
            // through the HHDM; no other owner exists yet.
            unsafe {
                core::ptr::write_bytes(
                    (self.mapper.hhdm_base() + frame.as_u64()) as *mut u8,
                    0,
                    FRAME_SIZE,
                );
            }
            if let Err(e) = self
                .mapper
                .map4k(self.root, page_va, frame, flags | MapFlags::USER)
            {
                self.mapper.free_frame(frame);
                self.rollback(&mut inner, va, i);
                return Err(e);
            }
            inner.pages.insert(page_va.as_u64(), PageBacking::Anonymous);
        }
        Ok(())
    }

    fn rollback(&self, inner: &mut SpaceInner, va: VirtualAddress, mapped: usize) {
        for i in 0..mapped {
            let page_va = va.add(i * FRAME_SIZE);
            if let Some(pa) = self.mapper.unmap4k(self.root, page_va) {
                self.mapper.free_frame(pa);
            }
            inner.pages.remove(&page_va.as_u64());
        }
    }

    /// Unmap `n_pages` starting at `va`, freeing anonymous frames.
    pub fn unmap_and_free(&self, va: VirtualAddress, n_pages: usize) {
        let mut inner = self.inner.lock();
        for i in 0..n_pages {
            let page_va = va.add(i * FRAME_SIZE);
            if let Some(pa) = self.mapper.unmap4k(self.root, page_va) {
                if inner.pages.remove(&page_va.as_u64()) == Some(PageBacking::Anonymous) {
                    self.mapper.free_frame(pa);
                }
            }
        }
    }

    /// Map `n_pages` of caller-supplied contiguous physical memory
    /// (initrd windows, shared regions). No zeroing.
    pub fn map_pages(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        n_pages: usize,
        flags: MapFlags,
    ) -> Result<(), MapError> {
        Self::check_user_va(va, n_pages)?;
        let mut inner = self.inner.lock();
        for i in 0..n_pages {
            let page_va = va.add(i * FRAME_SIZE);
            if let Err(e) = self.mapper.map4k(
                self.root,
                page_va,
                pa.offset((i * FRAME_SIZE) as u64),
                flags | MapFlags::USER,
            ) {
                for j in 0..i {
                    let undo = va.add(j * FRAME_SIZE);
                    self.mapper.unmap4k(self.root, undo);
                    inner.pages.remove(&undo.as_u64());
                }
                return Err(e);
            }
            inner.pages.insert(page_va.as_u64(), PageBacking::Borrowed);
        }
        Ok(())
    }

    pub fn activate(&self) {
        self.mapper.activate(self.root);
    }

    pub fn is_active(&self) -> bool {
        self.mapper.active_root() == self.root
    }

    /// Every page of `[va, va+len)` is mapped, user-accessible and (for
    /// `write`) writable. Used by the syscall copy paths.
    pub fn is_user_range_accessible(&self, va: u64, len: usize, write: bool) -> bool {
        if len == 0 {
            return true;
        }
        let _inner = self.inner.lock();
        let start = va & !(FRAME_SIZE as u64 - 1);
        let end = match va.checked_add(len as u64) {
            Some(e) => e,
            None => return false,
        };
        let mut page = start;
        while page < end {
            match self.mapper.query4k(self.root, VirtualAddress::new(page)) {
                Some(m) if m.user && (!write || m.writable) => {}
                _ => return false,
            }
            page += FRAME_SIZE as u64;
        }
        true
    }

    /// Translate one user address under the space lock.
    pub fn translate(&self, va: u64) -> Option<super::Mapping> {
        let _inner = self.inner.lock();
        self.mapper.query4k(self.root, VirtualAddress::new(va))
    }

    /// Number of user pages currently installed.
    pub fn mapped_pages(&self) -> usize {
        self.inner.lock().pages.len()
    }

    pub fn hhdm_base(&self) -> u64 {
        self.mapper.hhdm_base()
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        // Tear down any user pages the owner forgot, then release the
        // page-table frames. destroy_root asserts the leaves are gone.
        let leftover: alloc::vec::Vec<(u64, PageBacking)> = {
            let inner = self.inner.lock();
            inner.pages.iter().map(|(k, v)| (*k, *v)).collect()
        };
        for (va, backing) in leftover {
            if let Some(pa) = self.mapper.unmap4k(self.root, VirtualAddress::new(va)) {
                if backing == PageBacking::Anonymous {
                    self.mapper.free_frame(pa);
                }
            }
        }
        self.mapper.destroy_root(self.root);
    }
}
