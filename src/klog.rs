use core::fmt;
use spin::Mutex;

/// Log sink installed by the embedder. The core never writes to hardware
/// directly; whoever boots the kernel points this at a serial port, a
/// framebuffer console, or nothing at all.
static SINK: Mutex<Option<&'static (dyn Fn(fmt::Arguments) + Send + Sync)>> = Mutex::new(None);

pub fn set_sink(sink: &'static (dyn Fn(fmt::Arguments) + Send + Sync)) {
    *SINK.lock() = Some(sink);
}

#[doc(hidden)]
pub fn _log(level: &str, args: fmt::Arguments) {
    #[cfg(test)]
    {
        std::eprintln!("[{}] {}", level, args);
    }
    #[cfg(not(test))]
    {
        if let Some(sink) = *SINK.lock() {
            sink(format_args!("[{}] {}\n", level, args));
        }
    }
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::klog::_log("INFO", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::klog::_log("WARN", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::klog::_log("ERROR", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::klog::_log("DEBUG", format_args!($($arg)*))
    };
}
