use bitflags::bitflags;

use crate::errno::{Errno, KResult};
use crate::memory::pagetable::{tlb_flush, PtFlags};
use crate::memory::{addr_to_pn, page_align_down};
use crate::proc::{curproc, do_exit};

use super::vmmap::Prot;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultCause: u32 {
        const USER = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

/// Resolve a user-mode pagefault at `vaddr`, or kill the faulting process
/// with an EFAULT status. Neither WRITE nor EXEC in `cause` means a read.
pub fn handle_pagefault(vaddr: usize, cause: FaultCause) {
    if pagefault_resolve(vaddr, cause).is_err() {
        log_debug!("segfault at {:#x} (cause {:?})", vaddr, cause);
        do_exit(Errno::EFAULT as i32 as isize);
    }
}

fn pagefault_resolve(vaddr: usize, cause: FaultCause) -> KResult<()> {
    let proc = curproc().ok_or(Errno::EFAULT)?;
    let vfn = addr_to_pn(vaddr);

    let map = proc.vmmap.lock();
    let vma = map.lookup(vfn).ok_or(Errno::EFAULT)?;

    let needed = if cause.contains(FaultCause::WRITE) {
        Prot::WRITE
    } else if cause.contains(FaultCause::EXEC) {
        Prot::EXEC
    } else {
        Prot::READ
    };
    if !vma.prot.contains(needed) {
        return Err(Errno::EFAULT);
    }

    let forwrite = cause.contains(FaultCause::WRITE);
    let pf = vma.obj.get_pframe(vma.obj_pagenum(vfn), forwrite)?;

    let mut flags = PtFlags::PRESENT | PtFlags::USER;
    if vma.prot.contains(Prot::WRITE) && forwrite {
        flags |= PtFlags::WRITE;
    }
    let page_vaddr = page_align_down(vaddr);
    proc.pagedir.lock().map(pf.paddr(), page_vaddr, flags);
    tlb_flush(page_vaddr);
    Ok(())
}
