//! Process and scheduler scenarios: termination and reaping, sleep/wakeup,
//! cancellable sleep, broadcast, kill-all.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use super::util::{kassert, kassert_eq, ktest};
use crate::errno::Errno;
use crate::proc::{self, do_waitpid, proc_kill_all, Proc};
use crate::scheduler::{
    self, cancellable_sleep_on, sleep_on, thread::kthread_create, thread::kthread_cancel,
    wakeup_on, yield_now, KtQueue, KThread, ThreadState,
};

fn spawn<F>(name: &str, entry: F) -> (Arc<Proc>, Arc<KThread>)
where
    F: FnOnce() -> isize + 'static,
{
    let p = proc::proc_create(name).expect("proc_create");
    let t = kthread_create(&p, Box::new(entry));
    scheduler::make_runnable(&t);
    (p, t)
}

#[test]
fn child_status_reaches_waitpid() {
    let status = ktest(|| {
        let (child, thr) = spawn("exits-seven", || 7);
        let (pid, st) = match do_waitpid(-1, 0) {
            Ok(r) => r,
            Err(_) => return 90,
        };
        kassert_eq!(pid, child.pid());
        kassert_eq!(st, 7);
        kassert_eq!(thr.state(), ThreadState::Exited);
        // The only child is reaped; nothing is left to wait for.
        kassert_eq!(do_waitpid(-1, 0).unwrap_err(), Errno::ECHILD);
        kassert!(proc::proc_lookup(pid).is_none());
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn dead_process_lingers_until_reaped() {
    let status = ktest(|| {
        let (child, thr) = spawn("zombie", || 5);
        yield_now();
        // Exited but not yet reaped: state DEAD, thread EXITED, still
        // visible in the process table.
        kassert_eq!(child.state(), proc::ProcState::Dead);
        kassert_eq!(thr.state(), ThreadState::Exited);
        kassert!(proc::proc_lookup(child.pid()).is_some());

        let (pid, st) = do_waitpid(child.pid() as i64, 0).unwrap();
        kassert_eq!(pid, child.pid());
        kassert_eq!(st, 5);
        kassert!(proc::proc_lookup(pid).is_none());
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn waitpid_selects_a_specific_child() {
    let status = ktest(|| {
        let (c1, _) = spawn("first", || 11);
        let (c2, _) = spawn("second", || 22);
        let (pid, st) = do_waitpid(c2.pid() as i64, 0).unwrap();
        kassert_eq!(pid, c2.pid());
        kassert_eq!(st, 22);
        let (pid, st) = do_waitpid(c1.pid() as i64, 0).unwrap();
        kassert_eq!(pid, c1.pid());
        kassert_eq!(st, 11);
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn waitpid_rejects_bad_arguments() {
    let status = ktest(|| {
        kassert_eq!(do_waitpid(0, 0).unwrap_err(), Errno::ENOTSUP);
        kassert_eq!(do_waitpid(-2, 0).unwrap_err(), Errno::ENOTSUP);
        // Not a child of ours.
        kassert_eq!(do_waitpid(4095, 0).unwrap_err(), Errno::ECHILD);
        let (child, _) = spawn("opts", || 0);
        kassert_eq!(
            do_waitpid(child.pid() as i64, 1).unwrap_err(),
            Errno::ENOTSUP
        );
        do_waitpid(child.pid() as i64, 0).unwrap();
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn sleep_then_wakeup() {
    let status = ktest(|| {
        let q = KtQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let (p, t) = {
            let q = q.clone();
            let ran = ran.clone();
            spawn("sleeper", move || {
                sleep_on(&q);
                ran.store(1, Ordering::SeqCst);
                0
            })
        };

        yield_now();
        kassert_eq!(t.state(), ThreadState::Sleep);
        kassert_eq!(q.len(), 1);
        kassert_eq!(ran.load(Ordering::SeqCst), 0);

        let woken = wakeup_on(&q);
        kassert!(woken.is_some());
        kassert!(Arc::ptr_eq(&woken.unwrap(), &t));
        kassert!(q.is_empty());

        do_waitpid(p.pid() as i64, 0).unwrap();
        kassert_eq!(ran.load(Ordering::SeqCst), 1);
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn cancel_aborts_a_cancellable_sleep() {
    let status = ktest(|| {
        let q = KtQueue::new();
        let (p, t) = {
            let q = q.clone();
            spawn("cancellable", move || {
                match cancellable_sleep_on(&q) {
                    // The cancellation reaches the sleeper as EINTR.
                    Err(Errno::EINTR) => 1234,
                    _ => 4321,
                }
            })
        };

        yield_now();
        kassert_eq!(t.state(), ThreadState::SleepCancellable);
        kassert_eq!(q.len(), 1);

        kthread_cancel(&t, -1);
        // Pulled off the wait channel immediately.
        kassert!(q.is_empty());

        let (_, st) = do_waitpid(p.pid() as i64, 0).unwrap();
        kassert_eq!(st, 1234);
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn cancel_never_touches_uninterruptible_sleep() {
    let status = ktest(|| {
        let q = KtQueue::new();
        let (p, t) = {
            let q = q.clone();
            spawn("hard-sleeper", move || {
                sleep_on(&q);
                // Woken by the event, not the cancel; but the flag is
                // visible at the next cancellation point.
                match cancellable_sleep_on(&q) {
                    Err(Errno::EINTR) => 55,
                    _ => 56,
                }
            })
        };

        yield_now();
        kthread_cancel(&t, -1);
        // Still asleep on the queue, flag notwithstanding.
        kassert_eq!(t.state(), ThreadState::Sleep);
        kassert_eq!(q.len(), 1);

        kassert!(wakeup_on(&q).is_some());
        let (_, st) = do_waitpid(p.pid() as i64, 0).unwrap();
        kassert_eq!(st, 55);
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn broadcast_wakes_every_sleeper() {
    let status = ktest(|| {
        let q = KtQueue::new();
        let woken = Arc::new(AtomicUsize::new(0));
        let mut pids = alloc::vec::Vec::new();

        for i in 0..3 {
            let q = q.clone();
            let woken = woken.clone();
            let (p, _) = spawn(&alloc::format!("waiter{}", i), move || {
                sleep_on(&q);
                woken.fetch_add(1, Ordering::SeqCst);
                0
            });
            pids.push(p.pid());
        }

        yield_now();
        kassert_eq!(q.len(), 3);
        kassert_eq!(woken.load(Ordering::SeqCst), 0);

        scheduler::broadcast_on(&q);
        kassert!(q.is_empty());

        for pid in pids {
            let (_, st) = do_waitpid(pid as i64, 0).unwrap();
            kassert_eq!(st, 0);
        }
        kassert_eq!(woken.load(Ordering::SeqCst), 3);
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn kill_all_spares_init_and_kills_the_rest() {
    let status = ktest(|| {
        let q = KtQueue::new();
        let mut pids = alloc::vec::Vec::new();
        for i in 0..2 {
            let q = q.clone();
            let (p, _) = spawn(&alloc::format!("victim{}", i), move || {
                match cancellable_sleep_on(&q) {
                    // Exit with the killer-supplied return value.
                    Err(Errno::EINTR) => scheduler::curthr().unwrap().retval(),
                    _ => 77,
                }
            });
            pids.push(p.pid());
        }
        // Let the victims reach their sleep.
        yield_now();
        kassert_eq!(q.len(), 2);

        let (killer, _) = spawn("killer", || proc_kill_all());
        let killer_pid = killer.pid();
        drop(killer);
        yield_now();

        let (_, st) = do_waitpid(killer_pid as i64, 0).unwrap();
        kassert_eq!(st, -1);
        for pid in pids {
            let (_, st) = do_waitpid(pid as i64, 0).unwrap();
            kassert_eq!(st, -1);
        }
        // init survived to tell the tale.
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn orphans_are_reparented_to_init() {
    let status = ktest(|| {
        let grandchild_pid = Arc::new(AtomicUsize::new(0));
        let gp = grandchild_pid.clone();
        let q = KtQueue::new();
        let q2 = q.clone();

        // Child spawns a grandchild and exits without reaping it.
        let (child, _) = spawn("middle", move || {
            let q = q2.clone();
            let (g, _) = spawn("orphan", move || match cancellable_sleep_on(&q) {
                Err(Errno::EINTR) => 9,
                _ => 8,
            });
            gp.store(g.pid() as usize, Ordering::SeqCst);
            3
        });

        let (_, st) = do_waitpid(child.pid() as i64, 0).unwrap();
        kassert_eq!(st, 3);

        // The orphan is ours now; wake it through cancellation and reap.
        let orphan_pid = grandchild_pid.load(Ordering::SeqCst) as u64;
        kassert!(orphan_pid != 0);
        let orphan = proc::proc_lookup(orphan_pid).unwrap();
        kassert_eq!(orphan.parent().unwrap().pid(), proc::PID_INIT);
        proc::proc_kill(&orphan, 9);
        let (pid, st) = do_waitpid(orphan_pid as i64, 0).unwrap();
        kassert_eq!(pid, orphan_pid);
        kassert_eq!(st, 9);
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn pids_are_unique_and_skip_the_reserved_ones() {
    let status = ktest(|| {
        let (a, _) = spawn("a", || 0);
        let (b, _) = spawn("b", || 0);
        kassert!(a.pid() > proc::PID_INIT);
        kassert!(b.pid() > a.pid());
        do_waitpid(-1, 0).unwrap();
        do_waitpid(-1, 0).unwrap();
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn yield_round_robins_the_run_queue() {
    let status = ktest(|| {
        let order = Arc::new(AtomicUsize::new(0));
        let mut pids = alloc::vec::Vec::new();
        for i in 1..=2 {
            let order = order.clone();
            let (p, _) = spawn(&alloc::format!("rr{}", i), move || {
                // First to run claims slot 1, second slot 2.
                order
                    .compare_exchange(i - 1, i, Ordering::SeqCst, Ordering::SeqCst)
                    .map(|_| 0)
                    .unwrap_or(1)
            });
            pids.push(p.pid());
        }
        yield_now();
        for pid in pids {
            let (_, st) = do_waitpid(pid as i64, 0).unwrap();
            kassert_eq!(st, 0);
        }
        0
    });
    assert_eq!(status, 0);
}
