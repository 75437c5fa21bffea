use crate::errno::{Errno, KResult};
use crate::fs::file::{FMode, NFILES};
use crate::memory::pagetable::tlb_flush_range;
use crate::memory::{addr_to_pn, page_align_up, page_aligned, pn_to_addr, USER_MEM_HIGH, USER_MEM_LOW};
use crate::proc::curproc;

use super::vmmap::{MapFlags, Prot, VmmapDir};

/// Map `len` bytes into the current address space.
///
/// `addr` is honored only with MAP_FIXED (and must then be page-aligned and
/// in user range); otherwise the highest free range is used. Anonymous
/// mappings take no fd (`fd == -1`); file mappings validate the descriptor's
/// mode against the requested protection.
pub fn do_mmap(
    addr: Option<usize>,
    len: usize,
    prot: Prot,
    flags: MapFlags,
    fd: i32,
    off: usize,
) -> KResult<usize> {
    let proc = curproc().expect("mmap with no current process");

    if len == 0 {
        return Err(Errno::EINVAL);
    }
    if flags.contains(MapFlags::PRIVATE) == flags.contains(MapFlags::SHARED) {
        return Err(Errno::EINVAL);
    }
    if !page_aligned(off) {
        return Err(Errno::EINVAL);
    }
    let lopage = if flags.contains(MapFlags::FIXED) {
        let a = addr.ok_or(Errno::EINVAL)?;
        if !page_aligned(a) || a < USER_MEM_LOW || a >= USER_MEM_HIGH {
            return Err(Errno::EINVAL);
        }
        addr_to_pn(a)
    } else {
        0
    };
    let npages = addr_to_pn(page_align_up(len));

    let start = if flags.contains(MapFlags::ANON) {
        if fd != -1 {
            return Err(Errno::EINVAL);
        }
        proc.vmmap
            .lock()
            .map(None, lopage, npages, prot, flags, addr_to_pn(off), VmmapDir::HiLo)?
    } else {
        if fd < 0 || fd as usize >= NFILES {
            return Err(Errno::EBADF);
        }
        let file = proc.file_get(fd as usize).ok_or(Errno::EBADF)?;
        if !file.mode().contains(FMode::READ) {
            return Err(Errno::EACCES);
        }
        if prot.contains(Prot::WRITE) {
            if flags.contains(MapFlags::SHARED) && !file.mode().contains(FMode::WRITE) {
                return Err(Errno::EACCES);
            }
            if file.mode().contains(FMode::APPEND) {
                return Err(Errno::EACCES);
            }
        }
        let vnode = file.vnode();
        proc.vmmap.lock().map(
            Some(&vnode),
            lopage,
            npages,
            prot,
            flags,
            addr_to_pn(off),
            VmmapDir::HiLo,
        )?
    };

    // The range may carry stale translations from an earlier mapping.
    proc.pagedir.lock().unmap_range(start, npages);
    tlb_flush_range(pn_to_addr(start), npages);
    Ok(pn_to_addr(start))
}

/// Unmap `[addr, addr + len)`.
pub fn do_munmap(addr: usize, len: usize) -> KResult<()> {
    let proc = curproc().expect("munmap with no current process");

    if len == 0 || !page_aligned(addr) {
        return Err(Errno::EINVAL);
    }
    let end = addr.checked_add(page_align_up(len)).ok_or(Errno::EINVAL)?;
    if addr < USER_MEM_LOW || end > USER_MEM_HIGH {
        return Err(Errno::EINVAL);
    }
    let npages = addr_to_pn(end - addr);

    proc.vmmap.lock().remove(addr_to_pn(addr), npages);
    proc.pagedir.lock().unmap_range(addr_to_pn(addr), npages);
    tlb_flush_range(addr, npages);
    Ok(())
}
