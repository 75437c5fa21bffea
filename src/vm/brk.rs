use crate::errno::{Errno, KResult};
use crate::memory::pagetable::tlb_flush_range;
use crate::memory::{addr_to_pn, page_align_up, pn_to_addr, USER_MEM_HIGH, USER_MEM_LOW};
use crate::proc::curproc;

use super::mobj::Mobj;
use super::vmmap::{MapFlags, Prot, Vmarea};

/// Set the process break. `None` reports the current break without moving
/// it. The heap vmarea covers whole pages starting at the first page after
/// `start_brk`; the loader may have set `start_brk` to the end of bss, and
/// an unset break is initialized to the bottom of user memory on first use.
pub fn do_brk(addr: Option<usize>) -> KResult<usize> {
    let proc = curproc().expect("brk with no current process");

    let (mut start_brk, mut brk) = proc.brk_range();
    if start_brk == 0 {
        start_brk = USER_MEM_LOW;
        brk = USER_MEM_LOW;
    }

    let new_brk = match addr {
        None => {
            proc.set_brk_range(start_brk, brk);
            return Ok(brk);
        }
        Some(a) => a,
    };

    if new_brk < start_brk || new_brk > USER_MEM_HIGH {
        return Err(Errno::ENOMEM);
    }

    let heap_start = addr_to_pn(page_align_up(start_brk));
    let cur_end = addr_to_pn(page_align_up(brk));
    let new_end = addr_to_pn(page_align_up(new_brk));

    if new_end > cur_end {
        let mut map = proc.vmmap.lock();
        let has_heap = map.areas().iter().any(|v| v.start == heap_start);
        if has_heap {
            if !map.is_range_empty(cur_end, new_end - cur_end) {
                return Err(Errno::ENOMEM);
            }
            let heap = map
                .areas_mut()
                .iter_mut()
                .find(|v| v.start == heap_start)
                .unwrap();
            heap.end = new_end;
        } else {
            if !map.is_range_empty(heap_start, new_end - heap_start) {
                return Err(Errno::ENOMEM);
            }
            map.insert(Vmarea {
                start: heap_start,
                end: new_end,
                off: 0,
                prot: Prot::READ | Prot::WRITE,
                flags: MapFlags::PRIVATE | MapFlags::ANON,
                obj: Mobj::anon_create(),
            });
        }
    } else if new_end < cur_end {
        proc.vmmap.lock().remove(new_end, cur_end - new_end);
        proc.pagedir.lock().unmap_range(new_end, cur_end - new_end);
        tlb_flush_range(pn_to_addr(new_end), cur_end - new_end);
    }

    proc.set_brk_range(start_brk, new_brk);
    Ok(new_brk)
}
