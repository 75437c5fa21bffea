use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use spin::Mutex;

use super::{curthr, sleep_on, wakeup_on, KtQueue, KThread};

/// Sleeping kernel mutex. Contended lockers sleep uninterruptibly on the
/// wait channel; unlock wakes the first waiter and hands ownership straight
/// to it, so a lock never bounces through a third thread.
///
/// Suspension point: `lock` may block. Never acquire a `KMutex` while
/// holding a spin lock.
pub struct KMutex<T: ?Sized> {
    state: Mutex<KMutexState>,
    waiters: Arc<KtQueue>,
    data: UnsafeCell<T>,
}

struct KMutexState {
    locked: bool,
    /// Identity of the holder (thread address, 0 for the boot context).
    holder: Option<usize>,
    /// Set while ownership is in flight to a woken waiter.
    handoff: Option<usize>,
}

unsafe impl<T: ?Sized + Send> Send for KMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for KMutex<T> {}

fn current_id() -> usize {
    curthr().map_or(0, |thr| Arc::as_ptr(&thr) as usize)
}

fn thread_id(thr: &Arc<KThread>) -> usize {
    Arc::as_ptr(thr) as usize
}

impl<T> KMutex<T> {
    pub fn new(data: T) -> Self {
        KMutex {
            state: Mutex::new(KMutexState {
                locked: false,
                holder: None,
                handoff: None,
            }),
            waiters: KtQueue::new(),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> KMutex<T> {
    pub fn lock(&self) -> KMutexGuard<'_, T> {
        let me = current_id();
        loop {
            {
                let mut st = self.state.lock();
                if !st.locked {
                    st.locked = true;
                    st.holder = Some(me);
                    break;
                }
                if st.handoff == Some(me) {
                    st.handoff = None;
                    break;
                }
                assert!(st.holder != Some(me), "recursive kmutex lock");
            }
            sleep_on(&self.waiters);
        }
        KMutexGuard { mutex: self }
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// Does the calling context hold this mutex?
    pub fn owns(&self) -> bool {
        let st = self.state.lock();
        st.locked && st.holder == Some(current_id())
    }

    /// Direct access when the mutex itself is exclusively borrowed.
    pub fn get_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }

    fn unlock(&self) {
        if let Some(w) = wakeup_on(&self.waiters) {
            let mut st = self.state.lock();
            let id = thread_id(&w);
            st.holder = Some(id);
            st.handoff = Some(id);
        } else {
            let mut st = self.state.lock();
            st.locked = false;
            st.holder = None;
        }
    }
}

pub struct KMutexGuard<'a, T: ?Sized> {
    mutex: &'a KMutex<T>,
}

impl<T: ?Sized> Deref for KMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for KMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for KMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
