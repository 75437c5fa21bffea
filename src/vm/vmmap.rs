use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;

use super::mobj::{Mobj, MobjType};
use super::shadow::shadow_collapse;
use crate::errno::{Errno, KResult};
use crate::fs::vnode::Vnode;
use crate::memory::{addr_to_pn, page_offset, PAGE_SIZE, USER_MEM_HIGH, USER_MEM_LOW};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const SHARED = 1 << 0;
        const PRIVATE = 1 << 1;
        const FIXED = 1 << 2;
        const ANON = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmapDir {
    LoHi,
    HiLo,
}

/// A contiguous run of virtual pages with uniform protection, backed by one
/// memory object. Ranges are half-open page numbers.
#[derive(Clone)]
pub struct Vmarea {
    pub start: usize,
    pub end: usize,
    /// Page offset of `start` into the backing object.
    pub off: usize,
    pub prot: Prot,
    pub flags: MapFlags,
    pub obj: Arc<Mobj>,
}

impl Vmarea {
    pub fn contains(&self, vfn: usize) -> bool {
        vfn >= self.start && vfn < self.end
    }

    pub fn npages(&self) -> usize {
        self.end - self.start
    }

    /// Object page backing virtual frame `vfn`.
    pub fn obj_pagenum(&self, vfn: usize) -> usize {
        debug_assert!(self.contains(vfn));
        vfn - self.start + self.off
    }
}

/// A process address space: vmareas kept disjoint and sorted by start.
pub struct Vmmap {
    areas: Vec<Vmarea>,
}

impl Vmmap {
    pub fn new() -> Self {
        Vmmap { areas: Vec::new() }
    }

    pub(crate) fn areas(&self) -> &[Vmarea] {
        &self.areas
    }

    pub(crate) fn areas_mut(&mut self) -> &mut [Vmarea] {
        &mut self.areas
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    /// Add a vmarea. The range must lie in user space and be free.
    pub fn insert(&mut self, vma: Vmarea) {
        assert!(vma.start < vma.end);
        assert!(vma.start >= addr_to_pn(USER_MEM_LOW));
        assert!(vma.end <= addr_to_pn(USER_MEM_HIGH));
        assert!(self.is_range_empty(vma.start, vma.npages()));
        let pos = self
            .areas
            .iter()
            .position(|a| a.start > vma.start)
            .unwrap_or(self.areas.len());
        self.areas.insert(pos, vma);
    }

    pub fn lookup(&self, vfn: usize) -> Option<&Vmarea> {
        self.areas.iter().find(|a| a.contains(vfn))
    }

    pub fn is_range_empty(&self, startvfn: usize, npages: usize) -> bool {
        let endvfn = startvfn + npages;
        !self
            .areas
            .iter()
            .any(|a| a.start < endvfn && startvfn < a.end)
    }

    /// First-fit scan for `npages` free pages. LoHi takes the lowest gap;
    /// HiLo walks down from the top of user space and takes the highest.
    pub fn find_range(&self, npages: usize, dir: VmmapDir) -> Option<usize> {
        if npages == 0 {
            return None;
        }
        let lo = addr_to_pn(USER_MEM_LOW);
        let hi = addr_to_pn(USER_MEM_HIGH);
        match dir {
            VmmapDir::LoHi => {
                let mut prev_end = lo;
                for a in &self.areas {
                    if a.start - prev_end >= npages {
                        return Some(prev_end);
                    }
                    prev_end = a.end;
                }
                (hi - prev_end >= npages).then_some(prev_end)
            }
            VmmapDir::HiLo => {
                let mut next_start = hi;
                for a in self.areas.iter().rev() {
                    if next_start - a.end >= npages {
                        return Some(next_start - npages);
                    }
                    next_start = a.start;
                }
                (next_start - lo >= npages).then_some(next_start - npages)
            }
        }
    }

    /// Unmap `[lopage, lopage + npages)`, truncating or splitting any
    /// vmarea that overlaps it.
    pub fn remove(&mut self, lopage: usize, npages: usize) {
        if npages == 0 {
            return;
        }
        let hipage = lopage + npages;
        let old = core::mem::take(&mut self.areas);
        for mut vma in old {
            if vma.end <= lopage || vma.start >= hipage {
                self.areas.push(vma);
            } else if vma.start < lopage && vma.end > hipage {
                // The hole is interior: split into two.
                let mut high = vma.clone();
                high.off = vma.off + (hipage - vma.start);
                high.start = hipage;
                vma.end = lopage;
                self.areas.push(vma);
                self.areas.push(high);
            } else if vma.start < lopage {
                vma.end = lopage;
                self.areas.push(vma);
            } else if vma.end > hipage {
                vma.off += hipage - vma.start;
                vma.start = hipage;
                self.areas.push(vma);
            }
            // else: fully covered, dropped (and its object ref with it)
        }
    }

    /// Duplicate the map for fork. Vmareas are copied; the backing objects
    /// are shared (fork layers shadows on top afterwards).
    pub fn clone_map(&self) -> Vmmap {
        Vmmap {
            areas: self.areas.clone(),
        }
    }

    /// Collapse every shadow chain in the map.
    pub fn collapse(&self) {
        for vma in &self.areas {
            if vma.obj.mo_type() == MobjType::Shadow {
                shadow_collapse(&vma.obj);
            }
        }
    }

    /// Create a mapping. `lopage == 0` means pick a free range in direction
    /// `dir`; a nonzero `lopage` (MAP_FIXED) evicts whatever overlaps.
    /// Returns the starting page number.
    pub fn map(
        &mut self,
        file: Option<&Arc<Vnode>>,
        lopage: usize,
        npages: usize,
        prot: Prot,
        flags: MapFlags,
        off_pn: usize,
        dir: VmmapDir,
    ) -> KResult<usize> {
        if npages == 0 {
            return Err(Errno::EINVAL);
        }
        let start = if lopage == 0 {
            self.find_range(npages, dir).ok_or(Errno::ENOMEM)?
        } else {
            self.remove(lopage, npages);
            lopage
        };
        let obj = if flags.contains(MapFlags::ANON) {
            Mobj::anon_create()
        } else {
            let obj = match file {
                Some(vnode) => vnode.mmap()?,
                None => return Err(Errno::EINVAL),
            };
            if flags.contains(MapFlags::PRIVATE) {
                // Private file pages must never dirty the file; writes land
                // in a shadow from the start.
                crate::vm::shadow::shadow_create(&obj)
            } else {
                obj
            }
        };
        self.insert(Vmarea {
            start,
            end: start + npages,
            off: off_pn,
            prot,
            flags,
            obj,
        });
        Ok(start)
    }

    /// Copy bytes out of the address space through the backing objects,
    /// page by page. Fails with EFAULT on any hole.
    pub fn read(&self, vaddr: usize, buf: &mut [u8]) -> KResult<()> {
        let mut addr = vaddr;
        let mut done = 0;
        while done < buf.len() {
            let vfn = addr_to_pn(addr);
            let vma = self.lookup(vfn).ok_or(Errno::EFAULT)?;
            let pf = vma.obj.get_pframe(vma.obj_pagenum(vfn), false)?;
            let off = page_offset(addr);
            let n = core::cmp::min(PAGE_SIZE - off, buf.len() - done);
            pf.copy_to(off, &mut buf[done..done + n]);
            done += n;
            addr += n;
        }
        Ok(())
    }

    /// Copy bytes into the address space. Frames are requested for write,
    /// so a private mapping materializes its copy-on-write pages here just
    /// as a write fault would.
    pub fn write(&self, vaddr: usize, buf: &[u8]) -> KResult<()> {
        let mut addr = vaddr;
        let mut done = 0;
        while done < buf.len() {
            let vfn = addr_to_pn(addr);
            let vma = self.lookup(vfn).ok_or(Errno::EFAULT)?;
            let pf = vma.obj.get_pframe(vma.obj_pagenum(vfn), true)?;
            let off = page_offset(addr);
            let n = core::cmp::min(PAGE_SIZE - off, buf.len() - done);
            pf.copy_from(off, &buf[done..done + n]);
            done += n;
            addr += n;
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.areas.clear();
    }
}

impl Default for Vmmap {
    fn default() -> Self {
        Self::new()
    }
}
