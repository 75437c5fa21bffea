use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use core::cell::UnsafeCell;
use spin::Mutex;

use super::context::Context;
use super::KtQueue;
use crate::memory::page;
use crate::proc::Proc;

/// Entry point of a kernel thread. The closure's return value becomes the
/// thread's return value, and the process exit status when the thread is a
/// process's sole thread.
pub type ThreadEntry = Box<dyn FnOnce() -> isize>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Created but never scheduled.
    NoState,
    Runnable,
    OnCpu,
    /// Uninterruptible sleep: only a wakeup on the wait channel resumes it.
    Sleep,
    /// Sleep that `cancel` may abort.
    SleepCancellable,
    Exited,
}

struct ThreadInner {
    state: ThreadState,
    cancelled: bool,
    retval: isize,
    /// The queue this thread is currently enqueued on, if any.
    wchan: Option<Arc<KtQueue>>,
    preemption_count: usize,
}

/// A kernel thread. The structure owns its kernel stack; the stack stays
/// alive until the last reference (held by the owning process until reap)
/// is dropped.
pub struct KThread {
    ctx: UnsafeCell<Context>,
    _kstack: Box<[u8]>,
    proc: Weak<Proc>,
    inner: Mutex<ThreadInner>,
}

// The context cell is only touched by the single scheduling core, with the
// thread off-CPU, under the cooperative discipline.
unsafe impl Send for KThread {}
unsafe impl Sync for KThread {}

impl KThread {
    pub fn state(&self) -> ThreadState {
        self.inner.lock().state
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.inner.lock().state = state;
    }

    pub fn cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    pub(crate) fn set_cancelled(&self) {
        self.inner.lock().cancelled = true;
    }

    pub fn retval(&self) -> isize {
        self.inner.lock().retval
    }

    pub(crate) fn set_retval(&self, retval: isize) {
        self.inner.lock().retval = retval;
    }

    pub(crate) fn wchan(&self) -> Option<Arc<KtQueue>> {
        self.inner.lock().wchan.clone()
    }

    pub(crate) fn set_wchan(&self, q: Option<Arc<KtQueue>>) {
        self.inner.lock().wchan = q;
    }

    pub fn proc(&self) -> Option<Arc<Proc>> {
        self.proc.upgrade()
    }

    pub(crate) fn ctx_ptr(&self) -> *mut Context {
        self.ctx.get()
    }

    pub(crate) fn preemption_count(&self) -> usize {
        self.inner.lock().preemption_count
    }

    pub(crate) fn adjust_preemption(&self, delta: isize) {
        let mut inner = self.inner.lock();
        inner.preemption_count = inner
            .preemption_count
            .checked_add_signed(delta)
            .expect("preemption count underflow");
    }
}

/// Create a thread belonging to `proc`, in state NO_STATE. The caller makes
/// it runnable when ready.
pub fn kthread_create(proc: &Arc<Proc>, entry: ThreadEntry) -> Arc<KThread> {
    let kstack = page::alloc_stack();
    let raw = Box::into_raw(Box::new(entry));
    let ctx = Context::setup(kthread_run as *const () as u64, raw as u64, &kstack);

    let thr = Arc::new(KThread {
        ctx: UnsafeCell::new(ctx),
        _kstack: kstack,
        proc: Arc::downgrade(proc),
        inner: Mutex::new(ThreadInner {
            state: ThreadState::NoState,
            cancelled: false,
            retval: 0,
            wchan: None,
            preemption_count: 0,
        }),
    });
    proc.attach_thread(&thr);
    thr
}

/// Set the thread's return value and cancel it. A cancellably sleeping
/// thread wakes immediately; anything else just carries the flag.
pub fn kthread_cancel(thr: &Arc<KThread>, retval: isize) {
    assert!(
        !super::is_curthr(thr),
        "kthread_cancel called on the current thread"
    );
    thr.set_retval(retval);
    super::cancel(thr);
}

/// Release a dead thread. Only the reaper calls this, and only on EXITED
/// threads; the stack is freed when the last reference drops.
pub fn kthread_destroy(thr: &Arc<KThread>) {
    assert!(!super::is_curthr(thr), "destroying the current thread");
    let state = thr.state();
    if state != ThreadState::Exited {
        panic!("destroying thread in state {:?}", state);
    }
    debug_assert!(thr.wchan().is_none());
}

/// Wrapper around the supervisor's exit path.
pub fn kthread_exit(retval: isize) -> ! {
    crate::proc::proc_thread_exiting(retval)
}

/// First Rust frame of every thread: recover the boxed entry, run it, exit
/// with its return value.
extern "C" fn kthread_run(raw: *mut ThreadEntry) -> ! {
    let entry = unsafe { Box::from_raw(raw) };
    let retval = entry();
    kthread_exit(retval)
}
