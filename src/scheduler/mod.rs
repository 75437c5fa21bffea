pub mod context;
pub mod mutex;
pub mod thread;

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::errno::{Errno, KResult};
use crate::proc::{self, Proc};
use context::Context;
pub use mutex::KMutex;
pub use thread::{KThread, ThreadEntry, ThreadState};

/// Interrupt priority levels of the software model. Queue surgery happens at
/// HIGH; the core drops to LOW only while genuinely idle or running a thread.
pub const IPL_LOW: u8 = 0;
pub const IPL_HIGH: u8 = 1;

/// FIFO of threads. The run queue and every wait channel are this one type;
/// any shared object can embed one and sleep threads on it.
pub struct KtQueue {
    list: Mutex<VecDeque<Arc<KThread>>>,
}

impl KtQueue {
    pub fn new() -> Arc<KtQueue> {
        Arc::new(KtQueue {
            list: Mutex::new(VecDeque::new()),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    /// Add `thr` to the tail of `q` and record the wait channel.
    pub(crate) fn enqueue(q: &Arc<KtQueue>, thr: Arc<KThread>) {
        debug_assert!(thr.wchan().is_none());
        thr.set_wchan(Some(q.clone()));
        q.list.lock().push_back(thr);
    }

    pub(crate) fn dequeue(&self) -> Option<Arc<KThread>> {
        let thr = self.list.lock().pop_front()?;
        thr.set_wchan(None);
        Some(thr)
    }

    /// Remove a specific thread, wherever it sits in the queue.
    pub(crate) fn remove(q: &Arc<KtQueue>, thr: &Arc<KThread>) -> bool {
        let mut list = q.list.lock();
        if let Some(i) = list.iter().position(|t| Arc::ptr_eq(t, thr)) {
            list.remove(i);
            drop(list);
            thr.set_wchan(None);
            true
        } else {
            false
        }
    }
}

struct CoreState {
    curthr: Option<Arc<KThread>>,
    curproc: Option<Arc<Proc>>,
    /// Queue the outgoing thread lands on once it is fully off-CPU. The idle
    /// loop performs the enqueue, so no thread is ever visible on a wait
    /// channel while its stack is still live on the core.
    deposit: Option<Arc<KtQueue>>,
    ipl: u8,
}

lazy_static! {
    static ref CORE: Mutex<CoreState> = Mutex::new(CoreState {
        curthr: None,
        curproc: None,
        deposit: None,
        ipl: IPL_LOW,
    });
    static ref RUNQ: Arc<KtQueue> = KtQueue::new();
}

struct IdleSlot(UnsafeCell<Context>);
unsafe impl Sync for IdleSlot {}

static IDLE_CTX: IdleSlot = IdleSlot(UnsafeCell::new(Context::empty()));

pub fn curthr() -> Option<Arc<KThread>> {
    CORE.lock().curthr.clone()
}

pub fn curproc() -> Option<Arc<Proc>> {
    CORE.lock().curproc.clone()
}

pub(crate) fn is_curthr(thr: &Arc<KThread>) -> bool {
    CORE.lock()
        .curthr
        .as_ref()
        .map_or(false, |c| Arc::ptr_eq(c, thr))
}

pub(crate) fn set_curproc(p: Option<Arc<Proc>>) {
    CORE.lock().curproc = p;
}

pub fn getipl() -> u8 {
    CORE.lock().ipl
}

pub fn setipl(ipl: u8) -> u8 {
    core::mem::replace(&mut CORE.lock().ipl, ipl)
}

/// Masks "interrupts" for the lifetime of the guard.
pub struct IplGuard {
    old: u8,
}

pub fn raise_ipl() -> IplGuard {
    IplGuard {
        old: setipl(IPL_HIGH),
    }
}

impl Drop for IplGuard {
    fn drop(&mut self) {
        setipl(self.old);
    }
}

/*===================
 * Preemption helpers
 *==================*/

pub fn preemption_disable() {
    if let Some(thr) = curthr() {
        thr.adjust_preemption(1);
    }
}

pub fn preemption_enable() {
    if let Some(thr) = curthr() {
        assert!(thr.preemption_count() > 0);
        thr.adjust_preemption(-1);
    }
}

pub fn preemption_enabled() -> bool {
    curthr().map_or(false, |thr| thr.preemption_count() == 0)
}

/*==========
 * Operations
 *=========*/

/// Make `thr` runnable and enqueue it on the run queue.
/// Must not be called on the current thread.
pub fn make_runnable(thr: &Arc<KThread>) {
    let _ipl = raise_ipl();
    assert!(!is_curthr(thr), "make_runnable on the current thread");
    debug_assert!(thr.state() != ThreadState::OnCpu);
    thr.set_state(ThreadState::Runnable);
    KtQueue::enqueue(&RUNQ, thr.clone());
}

/// Give up the CPU, staying runnable.
pub fn yield_now() {
    let thr = curthr().expect("yield with no current thread");
    assert_eq!(thr.state(), ThreadState::OnCpu);
    {
        let _ipl = raise_ipl();
        thr.set_state(ThreadState::Runnable);
    }
    sched_switch(Some(RUNQ.clone()));
}

/// Uninterruptible sleep on `q`. Cancellation is not observed until the
/// sleeper is woken by the event it waits for.
pub fn sleep_on(q: &Arc<KtQueue>) {
    let thr = curthr().expect("sleep_on with no current thread");
    {
        let _ipl = raise_ipl();
        thr.set_state(ThreadState::Sleep);
    }
    sched_switch(Some(q.clone()));
}

/// Sleep on `q`, resumable by either a wakeup or `cancel`.
/// Returns `EINTR` if the thread was cancelled before or during the sleep.
pub fn cancellable_sleep_on(q: &Arc<KtQueue>) -> KResult<()> {
    let thr = curthr().expect("cancellable_sleep_on with no current thread");
    if thr.cancelled() {
        return Err(Errno::EINTR);
    }
    {
        let _ipl = raise_ipl();
        thr.set_state(ThreadState::SleepCancellable);
    }
    sched_switch(Some(q.clone()));
    if thr.cancelled() {
        Err(Errno::EINTR)
    } else {
        Ok(())
    }
}

/// Wake one thread sleeping on `q`, returning a handle to it (a mutex
/// unlock, for instance, uses the handle to transfer ownership).
pub fn wakeup_on(q: &Arc<KtQueue>) -> Option<Arc<KThread>> {
    let _ipl = raise_ipl();
    let thr = q.dequeue()?;
    debug_assert!(matches!(
        thr.state(),
        ThreadState::Sleep | ThreadState::SleepCancellable
    ));
    make_runnable(&thr);
    Some(thr)
}

/// Wake every thread sleeping on `q`.
pub fn broadcast_on(q: &Arc<KtQueue>) {
    while wakeup_on(q).is_some() {}
}

/// Flag `thr` as cancelled. A cancellable sleeper is pulled off its wait
/// channel and made runnable; an uninterruptible sleeper is never touched.
pub fn cancel(thr: &Arc<KThread>) {
    let _ipl = raise_ipl();
    thr.set_cancelled();
    if thr.state() == ThreadState::SleepCancellable {
        if let Some(q) = thr.wchan() {
            KtQueue::remove(&q, thr);
        }
        make_runnable(thr);
    }
}

/// The switch primitive. Parks the deposit target in the core slot and
/// resumes the idle loop, which enqueues the outgoing thread and picks the
/// next runnable one. The caller must have already moved the current thread
/// out of ON_CPU.
pub(crate) fn sched_switch(deposit: Option<Arc<KtQueue>>) {
    let thr_ctx;
    let idle_ctx;
    {
        let mut core = CORE.lock();
        let thr = core
            .curthr
            .as_ref()
            .expect("sched_switch with no current thread");
        assert!(
            thr.state() != ThreadState::OnCpu,
            "sched_switch while still ON_CPU"
        );
        thr_ctx = thr.ctx_ptr();
        core.deposit = deposit;
        idle_ctx = IDLE_CTX.0.get() as *const Context;
    }
    // The core lock must be released before the stack swap.
    unsafe { context::switch_context(thr_ctx, idle_ctx) };
}

/// The idle loop. Runs on the boot stack; every `sched_switch` resumes it
/// here. Returns once no live thread remains anywhere in the system.
pub(crate) fn idle_loop() {
    loop {
        let outgoing;
        let deposit;
        {
            let mut core = CORE.lock();
            core.ipl = IPL_HIGH;
            outgoing = core.curthr.take();
            deposit = core.deposit.take();
            core.curproc = proc::idleproc();
        }
        if let Some(thr) = outgoing {
            debug_assert!(thr.state() != ThreadState::OnCpu);
            match deposit {
                // The outgoing thread is off-CPU now; only here may it
                // become visible to wakeup_on.
                Some(q) => KtQueue::enqueue(&q, thr),
                None => debug_assert_eq!(thr.state(), ThreadState::Exited),
            }
        }

        let next = match RUNQ.dequeue() {
            Some(thr) => thr,
            None => {
                // No interrupt source exists in the core model, so an empty
                // run queue with live sleepers can never make progress.
                if proc::any_live_thread() {
                    panic!("idle core: live threads exist but none are runnable");
                }
                CORE.lock().ipl = IPL_LOW;
                return;
            }
        };
        assert_eq!(next.state(), ThreadState::Runnable);
        debug_assert!(next.proc().is_some());

        let next_ctx;
        {
            let mut core = CORE.lock();
            next.set_state(ThreadState::OnCpu);
            core.curproc = next.proc();
            next_ctx = next.ctx_ptr() as *const Context;
            core.curthr = Some(next);
            core.ipl = IPL_LOW;
        }
        unsafe { context::switch_context(IDLE_CTX.0.get(), next_ctx) };
    }
}

/// Reset the core to its boot state. Called once per `kernel_main`.
pub(crate) fn core_init() {
    {
        let mut core = CORE.lock();
        core.curthr = None;
        core.curproc = None;
        core.deposit = None;
        core.ipl = IPL_LOW;
    }
    while RUNQ.dequeue().is_some() {}
    unsafe {
        *IDLE_CTX.0.get() = Context::empty();
    }
}
