use alloc::format;

use crate::errno::KResult;
use crate::memory::pagetable::tlb_flush_all;
use crate::proc::{curproc, proc_create, Pid};
use crate::scheduler::thread::kthread_create;
use crate::scheduler::{make_runnable, ThreadEntry};
use crate::vm::shadow::shadow_create;
use crate::vm::vmmap::MapFlags;

/// Fork the current process.
///
/// The child gets a copy-on-write clone of the parent's address space and a
/// duplicate of its descriptor table and cwd (both via `proc_create`). Every
/// PRIVATE vmarea gains a fresh shadow object in *both* processes, layered
/// over the previously shared object; the parent's stale translations are
/// torn down so its next write faults into its own shadow.
///
/// `child_main` is the child thread's continuation — the register-level
/// mechanics of resuming a forked kernel stack with a zero return value
/// belong to the syscall dispatcher, not the core. The parent receives the
/// child's pid.
pub fn do_fork(child_main: ThreadEntry) -> KResult<Pid> {
    let parent = curproc().expect("fork with no current process");

    // Bound the shadow chains left over from earlier forks.
    parent.vmmap.lock().collapse();

    let child = proc_create(&format!("{}_child", parent.name()))?;

    let mut child_map = parent.vmmap.lock().clone_map();

    {
        let mut parent_map = parent.vmmap.lock();
        for (pvma, cvma) in parent_map
            .areas_mut()
            .iter_mut()
            .zip(child_map.areas_mut().iter_mut())
        {
            if pvma.flags.contains(MapFlags::PRIVATE) {
                let shared = pvma.obj.clone();
                pvma.obj = shadow_create(&shared);
                cvma.obj = shadow_create(&shared);
            }
        }
    }
    *child.vmmap.lock() = child_map;

    // Unmap the parent's private pages so post-fork writes fault into the
    // new shadow instead of the shared frames.
    {
        let parent_map = parent.vmmap.lock();
        let mut pagedir = parent.pagedir.lock();
        for vma in parent_map.areas() {
            if vma.flags.contains(MapFlags::PRIVATE) {
                pagedir.unmap_range(vma.start, vma.end - vma.start);
            }
        }
    }
    tlb_flush_all();

    let thr = kthread_create(&child, child_main);
    make_runnable(&thr);

    log_debug!("forked P{} -> P{}", parent.pid(), child.pid());
    Ok(child.pid())
}
