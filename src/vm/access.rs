//! Permission-checked user memory access. Kernel code never dereferences a
//! user pointer; copies go through the address space's backing objects.

use alloc::sync::Arc;

use crate::errno::{Errno, KResult};
use crate::memory::{page_align_up, USER_MEM_HIGH, USER_MEM_LOW};
use crate::proc::{curproc, Proc};

use super::vmmap::Prot;

pub fn userland_address(addr: usize) -> bool {
    (USER_MEM_LOW..USER_MEM_HIGH).contains(&addr)
}

/// Does `p` have `perm` on the page containing `vaddr`?
pub fn addr_perm(p: &Arc<Proc>, vaddr: usize, perm: Prot) -> bool {
    let map = p.vmmap.lock();
    map.lookup(crate::memory::addr_to_pn(vaddr))
        .map_or(false, |vma| vma.prot.contains(perm))
}

/// Does `p` have `perm` on all of `[vaddr, vaddr + len)`?
pub fn range_perm(p: &Arc<Proc>, vaddr: usize, len: usize, perm: Prot) -> bool {
    if len == 0 {
        return true;
    }
    let end = vaddr + len;
    let mut addr = vaddr;
    while addr < end {
        if !addr_perm(p, addr, perm) {
            return false;
        }
        addr = core::cmp::min(page_align_up(addr + 1), end);
    }
    true
}

/// Copy `kbuf.len()` bytes from userland `uaddr` into `kbuf`.
pub fn copy_from_user(kbuf: &mut [u8], uaddr: usize) -> KResult<()> {
    let proc = curproc().expect("user copy with no current process");
    if !userland_address(uaddr) || !range_perm(&proc, uaddr, kbuf.len(), Prot::READ) {
        return Err(Errno::EFAULT);
    }
    let result = proc.vmmap.lock().read(uaddr, kbuf);
    result
}

/// Copy `kbuf` out to userland `uaddr`.
pub fn copy_to_user(uaddr: usize, kbuf: &[u8]) -> KResult<()> {
    let proc = curproc().expect("user copy with no current process");
    if !userland_address(uaddr) || !range_perm(&proc, uaddr, kbuf.len(), Prot::WRITE) {
        return Err(Errno::EFAULT);
    }
    let result = proc.vmmap.lock().write(uaddr, kbuf);
    result
}
