use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::shadow::{self, ShadowLinks};
use crate::drivers::BlockDev;
use crate::errno::KResult;
use crate::fs::vnode::Vnode;
use crate::memory::{page, PAGE_SIZE};
use crate::scheduler::mutex::{KMutex, KMutexGuard};

/// A resident page cached by a memory object.
pub struct Pframe {
    pagenum: usize,
    data: Mutex<PframeData>,
}

struct PframeData {
    page: Box<[u8]>,
    dirty: bool,
}

impl Pframe {
    fn new(pagenum: usize) -> Arc<Pframe> {
        Arc::new(Pframe {
            pagenum,
            data: Mutex::new(PframeData {
                page: page::page_alloc(),
                dirty: false,
            }),
        })
    }

    pub fn pagenum(&self) -> usize {
        self.pagenum
    }

    /// Address of the backing page; the physical address in the page-table
    /// contract.
    pub fn paddr(&self) -> usize {
        self.data.lock().page.as_ptr() as usize
    }

    pub fn dirty(&self) -> bool {
        self.data.lock().dirty
    }

    pub(crate) fn set_dirty(&self) {
        self.data.lock().dirty = true;
    }

    pub(crate) fn clear_dirty(&self) {
        self.data.lock().dirty = false;
    }

    pub fn copy_to(&self, off: usize, buf: &mut [u8]) {
        debug_assert!(off + buf.len() <= PAGE_SIZE);
        let data = self.data.lock();
        buf.copy_from_slice(&data.page[off..off + buf.len()]);
    }

    pub fn copy_from(&self, off: usize, buf: &[u8]) {
        debug_assert!(off + buf.len() <= PAGE_SIZE);
        let mut data = self.data.lock();
        data.page[off..off + buf.len()].copy_from_slice(buf);
        data.dirty = true;
    }

    /// Overwrite this frame with the contents of `src`.
    pub(crate) fn fill_from(&self, src: &Pframe) {
        let src_data = src.data.lock();
        self.data.lock().page.copy_from_slice(&src_data.page);
    }

}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MobjType {
    Anon,
    File,
    Shadow,
    BlockDev,
}

pub(crate) enum MobjBackend {
    /// Zero-fill on first touch.
    Anon,
    /// Pages come from (and flush back to) a vnode.
    File { vnode: Arc<Vnode> },
    /// Copy-on-write overlay; see `shadow`.
    Shadow(ShadowLinks),
    /// Pages come from a block device.
    BlockDev { dev: Arc<dyn BlockDev> },
}

/// A memory object: a page provider with a cache of resident frames.
/// Shared ownership is the refcount; a vmarea, a shadow link, or a vnode
/// holding an `Arc<Mobj>` is what the original kernel called a ref.
pub struct Mobj {
    backend: MobjBackend,
    /// The mobj mutex of the concurrency model. Held for cache lookups,
    /// inserts, and chain walks; may block, so never under a spin lock.
    pframes: KMutex<BTreeMap<usize, Arc<Pframe>>>,
}

impl Mobj {
    fn create(backend: MobjBackend) -> Arc<Mobj> {
        Arc::new(Mobj {
            backend,
            pframes: KMutex::new(BTreeMap::new()),
        })
    }

    pub fn anon_create() -> Arc<Mobj> {
        Self::create(MobjBackend::Anon)
    }

    pub(crate) fn file_create(vnode: Arc<Vnode>) -> Arc<Mobj> {
        Self::create(MobjBackend::File { vnode })
    }

    pub(crate) fn blockdev_create(dev: Arc<dyn BlockDev>) -> Arc<Mobj> {
        Self::create(MobjBackend::BlockDev { dev })
    }

    pub(crate) fn shadow_create_raw(links: ShadowLinks) -> Arc<Mobj> {
        Self::create(MobjBackend::Shadow(links))
    }

    pub fn mo_type(&self) -> MobjType {
        match self.backend {
            MobjBackend::Anon => MobjType::Anon,
            MobjBackend::File { .. } => MobjType::File,
            MobjBackend::Shadow(_) => MobjType::Shadow,
            MobjBackend::BlockDev { .. } => MobjType::BlockDev,
        }
    }

    pub(crate) fn backend(&self) -> &MobjBackend {
        &self.backend
    }

    pub(crate) fn pframes_lock(&self) -> KMutexGuard<'_, BTreeMap<usize, Arc<Pframe>>> {
        self.pframes.lock()
    }

    /// Cached frame lookup; no I/O, no creation.
    pub fn find_pframe(&self, pagenum: usize) -> Option<Arc<Pframe>> {
        self.pframes.lock().get(&pagenum).cloned()
    }

    /// Obtain the frame for `pagenum`. A read on a shadow object walks the
    /// chain and may return an ancestor's frame; everything else (including
    /// any write) resolves to a frame owned by this object.
    pub fn get_pframe(&self, pagenum: usize, forwrite: bool) -> KResult<Arc<Pframe>> {
        if !forwrite && self.mo_type() == MobjType::Shadow {
            return shadow::shadow_get_pframe(self, pagenum);
        }
        self.default_get_pframe(pagenum, forwrite)
    }

    /// The default path: cache hit, or create + backend fill + insert.
    pub(crate) fn default_get_pframe(&self, pagenum: usize, forwrite: bool) -> KResult<Arc<Pframe>> {
        let mut cache = self.pframes.lock();
        if let Some(pf) = cache.get(&pagenum) {
            if forwrite {
                pf.set_dirty();
            }
            return Ok(pf.clone());
        }
        let pf = Pframe::new(pagenum);
        self.fill_pframe(&pf)?;
        if forwrite {
            pf.set_dirty();
        }
        cache.insert(pagenum, pf.clone());
        Ok(pf)
    }

    fn fill_pframe(&self, pf: &Pframe) -> KResult<()> {
        match &self.backend {
            // Freshly allocated pages are already zeroed.
            MobjBackend::Anon => Ok(()),
            MobjBackend::File { vnode } => {
                let off = pf.pagenum() * PAGE_SIZE;
                let mut buf = page::page_alloc();
                let n = vnode.read(off, &mut buf)?;
                pf.copy_from(0, &buf[..n]);
                pf.clear_dirty();
                Ok(())
            }
            MobjBackend::Shadow(_) => shadow::shadow_fill_pframe(self, pf),
            MobjBackend::BlockDev { dev } => {
                let mut buf = page::page_alloc();
                dev.read_block(pf.pagenum(), &mut buf)?;
                pf.copy_from(0, &buf);
                pf.clear_dirty();
                Ok(())
            }
        }
    }

    /// Write a dirty frame back to its backing store.
    pub(crate) fn flush_pframe(&self, pf: &Pframe) -> KResult<()> {
        match &self.backend {
            MobjBackend::File { vnode } => {
                let off = pf.pagenum() * PAGE_SIZE;
                let len = vnode.len();
                if off < len {
                    let n = core::cmp::min(PAGE_SIZE, len - off);
                    // Stage through a buffer: the vnode lock can block, and
                    // the frame's spin lock must not be held across that.
                    let mut buf = page::page_alloc();
                    pf.copy_to(0, &mut buf);
                    vnode.write_at(off, &buf[..n])?;
                }
                pf.clear_dirty();
                Ok(())
            }
            MobjBackend::BlockDev { dev } => {
                let mut buf = page::page_alloc();
                pf.copy_to(0, &mut buf);
                dev.write_block(pf.pagenum(), &buf)?;
                pf.clear_dirty();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn flush_all(&self) -> KResult<()> {
        let frames: Vec<Arc<Pframe>> = self.pframes.lock().values().cloned().collect();
        for pf in frames {
            if pf.dirty() {
                self.flush_pframe(&pf)?;
            }
        }
        Ok(())
    }
}

impl Drop for Mobj {
    fn drop(&mut self) {
        match &self.backend {
            MobjBackend::File { .. } | MobjBackend::BlockDev { .. } => {
                let _ = self.flush_all();
            }
            // Sever the chain iteratively: a fork bomb's chain must not
            // unwind recursively on the kernel stack.
            MobjBackend::Shadow(links) => shadow::teardown_chain(links),
            MobjBackend::Anon => {}
        }
    }
}
