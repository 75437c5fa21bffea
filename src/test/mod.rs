//! End-to-end suites, each scenario running as the init process of a fresh
//! kernel boot.

mod proctest;
mod vmtest;

pub(crate) mod util {
    use std::sync::Mutex;

    // One kernel at a time: the core state is core-local, and the test
    // harness is the only "machine" with more than one caller.
    static KERNEL_LOCK: Mutex<()> = Mutex::new(());

    /// Run `f` while holding the kernel lock, for tests that touch core
    /// state without booting.
    pub fn serialized<R>(f: impl FnOnce() -> R) -> R {
        let _guard = KERNEL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        f()
    }

    /// Boot the kernel, run `init_main` as init, return its exit status.
    pub fn ktest<F>(init_main: F) -> isize
    where
        F: FnOnce() -> isize + 'static,
    {
        serialized(|| crate::kernel_main(init_main))
    }

    /// In-kernel assertion. Panics cannot unwind out of a kernel thread,
    /// so failures exit the thread with the failing line as its status;
    /// the host-side `assert_eq!(status, 0)` then reports it.
    macro_rules! kassert {
        ($cond:expr) => {
            if !($cond) {
                log_error!(
                    "kassert failed at {}:{}: {}",
                    file!(),
                    line!(),
                    stringify!($cond)
                );
                return line!() as isize;
            }
        };
    }

    macro_rules! kassert_eq {
        ($a:expr, $b:expr) => {
            if $a != $b {
                log_error!(
                    "kassert_eq failed at {}:{}: {} != {}",
                    file!(),
                    line!(),
                    stringify!($a),
                    stringify!($b)
                );
                return line!() as isize;
            }
        };
    }

    pub(crate) use {kassert, kassert_eq};
}
