pub mod fork;

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::errno::{Errno, KResult};
use crate::fs::file::{File, NFILES};
use crate::fs::vnode::Vnode;
use crate::memory::pagetable::PageTable;
use crate::scheduler::thread::{kthread_cancel, kthread_destroy};
use crate::scheduler::{self, KMutex, KtQueue, ThreadState};
use crate::vm::vmmap::Vmmap;

pub type Pid = u64;

pub const PID_IDLE: Pid = 0;
pub const PID_INIT: Pid = 1;
pub const PROC_MAX_COUNT: Pid = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Running,
    /// The sole thread has exited; the process lingers until its parent
    /// reaps it.
    Dead,
}

pub(crate) struct ProcInner {
    parent: Weak<Proc>,
    children: Vec<Arc<Proc>>,
    threads: Vec<Arc<scheduler::KThread>>,
    state: ProcState,
    status: isize,
    cwd: Option<Arc<Vnode>>,
    files: [Option<Arc<File>>; NFILES],
    start_brk: usize,
    brk: usize,
}

pub struct Proc {
    pid: Pid,
    name: String,
    /// The parent sleeps here while waiting for this process to die.
    pub(crate) wait: Arc<KtQueue>,
    /// Address space. A sleeping lock: pagefault resolution holds it across
    /// pframe fills that may block.
    pub(crate) vmmap: KMutex<Vmmap>,
    /// Page-table root of this process.
    pub(crate) pagedir: Mutex<PageTable>,
    inner: Mutex<ProcInner>,
}

lazy_static! {
    /// All processes except the idle process.
    static ref PROC_LIST: Mutex<Vec<Arc<Proc>>> = Mutex::new(Vec::new());
    static ref IDLEPROC: Mutex<Option<Arc<Proc>>> = Mutex::new(None);
    static ref INITPROC: Mutex<Option<Arc<Proc>>> = Mutex::new(None);
    static ref NEXT_PID: Mutex<Pid> = Mutex::new(PID_INIT);
}

fn empty_files() -> [Option<Arc<File>>; NFILES] {
    core::array::from_fn(|_| None)
}

impl Proc {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProcState {
        self.inner.lock().state
    }

    pub fn status(&self) -> isize {
        self.inner.lock().status
    }

    pub fn parent(&self) -> Option<Arc<Proc>> {
        self.inner.lock().parent.upgrade()
    }

    pub fn cwd(&self) -> Option<Arc<Vnode>> {
        self.inner.lock().cwd.clone()
    }

    /// Swap the working directory, returning the old reference.
    pub fn set_cwd(&self, vnode: Option<Arc<Vnode>>) -> Option<Arc<Vnode>> {
        core::mem::replace(&mut self.inner.lock().cwd, vnode)
    }

    pub(crate) fn attach_thread(&self, thr: &Arc<scheduler::KThread>) {
        self.inner.lock().threads.push(thr.clone());
    }

    pub fn file_get(&self, fd: usize) -> Option<Arc<File>> {
        self.inner.lock().files.get(fd)?.clone()
    }

    pub(crate) fn file_install(&self, fd: usize, file: Arc<File>) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.files[fd].is_none());
        inner.files[fd] = Some(file);
    }

    pub(crate) fn file_take(&self, fd: usize) -> Option<Arc<File>> {
        self.inner.lock().files.get_mut(fd)?.take()
    }

    /// First free descriptor slot, scanning low to high.
    pub fn get_empty_fd(&self) -> KResult<usize> {
        let inner = self.inner.lock();
        inner
            .files
            .iter()
            .position(|f| f.is_none())
            .ok_or(Errno::EMFILE)
    }

    pub(crate) fn brk_range(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.start_brk, inner.brk)
    }

    pub(crate) fn set_brk_range(&self, start_brk: usize, brk: usize) {
        let mut inner = self.inner.lock();
        inner.start_brk = start_brk;
        inner.brk = brk;
    }
}

/*===============
 * System startup
 *==============*/

/// Reset the process subsystem and install the idle process. Called once
/// per boot, before any other process exists.
pub(crate) fn proc_init() {
    PROC_LIST.lock().clear();
    *INITPROC.lock() = None;
    *NEXT_PID.lock() = PID_INIT;

    let idle = Arc::new(Proc {
        pid: PID_IDLE,
        name: String::from("idle"),
        wait: KtQueue::new(),
        vmmap: KMutex::new(Vmmap::new()),
        pagedir: Mutex::new(PageTable::new()),
        inner: Mutex::new(ProcInner {
            parent: Weak::new(),
            children: Vec::new(),
            threads: Vec::new(),
            state: ProcState::Running,
            status: 0,
            cwd: None,
            files: empty_files(),
            start_brk: 0,
            brk: 0,
        }),
    });
    *IDLEPROC.lock() = Some(idle.clone());
    scheduler::set_curproc(Some(idle));
    log_debug!("created idle process");
}

/// Drop every process reference. Run after the idle loop drains.
pub(crate) fn proc_teardown() {
    PROC_LIST.lock().clear();
    *INITPROC.lock() = None;
    *IDLEPROC.lock() = None;
    scheduler::set_curproc(None);
}

pub(crate) fn idleproc() -> Option<Arc<Proc>> {
    IDLEPROC.lock().clone()
}

pub fn initproc() -> Option<Arc<Proc>> {
    INITPROC.lock().clone()
}

pub fn curproc() -> Option<Arc<Proc>> {
    scheduler::curproc()
}

/*=================
 * Helper functions
 *================*/

/// Next free pid, skipping pids still in use. 0 is the idle process and is
/// never handed out.
fn proc_getid(list: &[Arc<Proc>]) -> Option<Pid> {
    let mut next = NEXT_PID.lock();
    let start = *next;
    let mut pid = start;
    'retry: loop {
        for p in list {
            if p.pid == pid {
                pid = if pid + 1 == PROC_MAX_COUNT { PID_INIT } else { pid + 1 };
                if pid == start {
                    return None;
                }
                continue 'retry;
            }
        }
        break;
    }
    *next = if pid + 1 == PROC_MAX_COUNT { PID_INIT } else { pid + 1 };
    Some(pid)
}

pub fn proc_lookup(pid: Pid) -> Option<Arc<Proc>> {
    if pid == PID_IDLE {
        return idleproc();
    }
    PROC_LIST.lock().iter().find(|p| p.pid == pid).cloned()
}

/// Any thread anywhere that has not exited?
pub(crate) fn any_live_thread() -> bool {
    PROC_LIST.lock().iter().any(|p| {
        p.inner
            .lock()
            .threads
            .iter()
            .any(|t| t.state() != ThreadState::Exited)
    })
}

/*==========
 * Functions
 *=========*/

/// Create a new process as a child of the current one. The child inherits
/// the parent's working directory (referenced) and descriptor table (each
/// open file referenced); its address space starts empty.
pub fn proc_create(name: &str) -> KResult<Arc<Proc>> {
    let parent = curproc();
    let (cwd, files, start_brk, brk) = match &parent {
        Some(p) => {
            let inner = p.inner.lock();
            (inner.cwd.clone(), inner.files.clone(), inner.start_brk, inner.brk)
        }
        None => (None, empty_files(), 0, 0),
    };

    let mut list = PROC_LIST.lock();
    let pid = proc_getid(&list).ok_or(Errno::ENOMEM)?;

    let proc = Arc::new(Proc {
        pid,
        name: String::from(name),
        wait: KtQueue::new(),
        vmmap: KMutex::new(Vmmap::new()),
        pagedir: Mutex::new(PageTable::new()),
        inner: Mutex::new(ProcInner {
            parent: parent.as_ref().map(Arc::downgrade).unwrap_or_default(),
            children: Vec::new(),
            threads: Vec::new(),
            state: ProcState::Running,
            status: 0,
            cwd,
            files,
            start_brk,
            brk,
        }),
    });
    list.push(proc.clone());
    drop(list);

    if let Some(p) = &parent {
        p.inner.lock().children.push(proc.clone());
    }
    if pid == PID_INIT {
        *INITPROC.lock() = Some(proc.clone());
    }
    log_debug!("created process {} (pid {})", proc.name, proc.pid);
    Ok(proc)
}

fn initproc_finish() {
    log_info!("init process exiting, system going down");
}

/// Release the current process's resources ahead of its destruction:
/// descriptors, cwd, children (reparented to init), and notify the parent.
fn proc_cleanup(status: isize) {
    let proc = curproc().expect("proc_cleanup with no current process");
    assert!(proc.pid != PID_IDLE);

    {
        let mut inner = proc.inner.lock();
        inner.state = ProcState::Dead;
        inner.status = status;
        for slot in inner.files.iter_mut() {
            *slot = None;
        }
        inner.cwd = None;
    }

    if proc.pid == PID_INIT {
        initproc_finish();
    }

    let init = initproc();
    if let Some(init) = init.filter(|i| !Arc::ptr_eq(i, &proc)) {
        let orphans: Vec<Arc<Proc>> = proc.inner.lock().children.drain(..).collect();
        for child in orphans {
            child.inner.lock().parent = Arc::downgrade(&init);
            init.inner.lock().children.push(child);
        }
    }

    if let Some(parent) = proc.parent() {
        scheduler::broadcast_on(&parent.wait);
    }
}

/// Exit path of a process's thread. Cleans the process up, marks the thread
/// EXITED, and switches away for the last time. Does not return; the parent
/// finishes destruction in waitpid.
pub fn proc_thread_exiting(retval: isize) -> ! {
    proc_cleanup(retval);

    let thr = scheduler::curthr().expect("thread exit with no current thread");
    thr.set_retval(retval);
    thr.set_state(ThreadState::Exited);
    scheduler::sched_switch(None);
    unreachable!("exited thread was rescheduled");
}

/// Cancel every thread of `proc` with `status` as its return value.
pub fn proc_kill(proc: &Arc<Proc>, status: isize) {
    if let Some(cur) = curproc() {
        assert!(!Arc::ptr_eq(&cur, proc), "proc_kill on the current process");
    }
    let threads: Vec<_> = proc.inner.lock().threads.clone();
    for thr in &threads {
        kthread_cancel(thr, status);
    }
}

/// Kill every process that is neither the caller nor a direct child of the
/// idle process (sparing init), then exit with status -1.
pub fn proc_kill_all() -> ! {
    let procs: Vec<Arc<Proc>> = PROC_LIST.lock().clone();
    let me = curproc();
    for p in procs {
        if me.as_ref().map_or(false, |m| Arc::ptr_eq(m, &p)) {
            continue;
        }
        if p.parent().map_or(false, |pp| pp.pid == PID_IDLE) {
            continue;
        }
        proc_kill(&p, -1);
    }
    do_exit(-1)
}

/// Finish destroying a dead process: threads, descriptors, address space,
/// page table. Runs on the reaper's stack, never the dead process's.
pub(crate) fn proc_destroy(proc: &Arc<Proc>) {
    PROC_LIST.lock().retain(|p| !Arc::ptr_eq(p, proc));

    let threads: Vec<_> = proc.inner.lock().threads.drain(..).collect();
    for thr in &threads {
        kthread_destroy(thr);
    }

    {
        let mut inner = proc.inner.lock();
        for slot in inner.files.iter_mut() {
            *slot = None;
        }
        inner.cwd = None;
    }
    proc.vmmap.lock().clear();
    proc.pagedir.lock().clear();
    log_debug!("destroyed P{}", proc.pid);
}

/*=============
 * System calls
 *============*/

/// Wait for a child to die and reap it. `pid > 0` selects a specific child,
/// `pid == -1` any child. Returns the reaped pid and its exit status.
pub fn do_waitpid(pid: i64, options: u32) -> KResult<(Pid, isize)> {
    if options != 0 {
        return Err(Errno::ENOTSUP);
    }
    if pid == 0 || pid < -1 {
        return Err(Errno::ENOTSUP);
    }
    let proc = curproc().expect("waitpid with no current process");

    let reap = |child: &Arc<Proc>| -> (Pid, isize) {
        let status = child.status();
        proc.inner
            .lock()
            .children
            .retain(|c| !Arc::ptr_eq(c, child));
        proc_destroy(child);
        (child.pid, status)
    };

    if pid > 0 {
        let child = proc
            .inner
            .lock()
            .children
            .iter()
            .find(|c| c.pid == pid as Pid)
            .cloned()
            .ok_or(Errno::ECHILD)?;
        // Wakeups from other exiting children are benign: recheck and go
        // back to sleep. The sleep is uninterruptible by design.
        while child.state() != ProcState::Dead {
            scheduler::sleep_on(&proc.wait);
        }
        Ok(reap(&child))
    } else {
        loop {
            let dead = {
                let inner = proc.inner.lock();
                if inner.children.is_empty() {
                    return Err(Errno::ECHILD);
                }
                inner
                    .children
                    .iter()
                    .find(|c| c.state() == ProcState::Dead)
                    .cloned()
            };
            if let Some(child) = dead {
                return Ok(reap(&child));
            }
            scheduler::sleep_on(&proc.wait);
        }
    }
}

/// Exit the current process with `status`.
pub fn do_exit(status: isize) -> ! {
    proc_thread_exiting(status)
}
