//! kernos — an instructional kernel core: cooperative scheduler, virtual
//! memory with copy-on-write shadow objects, and a vnode-based VFS.
//!
//! Hardware collaborators (frame allocator, page-table walker, interrupt
//! controller, device bodies) are modeled in software behind their
//! contracts, so the whole core — context switches included — runs and
//! tests on a stock x86_64 host.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub mod klog;

pub mod drivers;
pub mod errno;
pub mod fs;
pub mod memory;
pub mod proc;
pub mod scheduler;
pub mod vm;

#[cfg(test)]
mod test;

use alloc::boxed::Box;

/// Boot the core and run `init_main` as the init process (pid 1).
///
/// Subsystems come up in dependency order: scheduler core, process table
/// and idle process, device registry, VFS root with the `/dev` layout.
/// The caller's stack becomes the idle loop; the call returns init's exit
/// status once no live thread remains.
pub fn kernel_main<F>(init_main: F) -> isize
where
    F: FnOnce() -> isize + 'static,
{
    scheduler::core_init();
    proc::proc_init();
    drivers::drivers_init();
    fs::fs_init();

    // The idle process chdirs to the fresh root; init inherits it.
    if let Some(idle) = proc::idleproc() {
        idle.set_cwd(Some(fs::root_vnode()));
    }

    let init = proc::proc_create("init").expect("creating init process");
    assert_eq!(init.pid(), proc::PID_INIT);
    let thr = scheduler::thread::kthread_create(&init, Box::new(init_main));
    scheduler::make_runnable(&thr);
    log_info!("init process created, entering idle loop");

    scheduler::idle_loop();

    let status = init.status();
    fs::fs_teardown();
    proc::proc_teardown();
    status
}
