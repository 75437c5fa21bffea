//! Minimal terminal device. The real line discipline is a driver body and
//! out of scope; this keeps an input queue (fed by whatever interrupt
//! source the port wires up) and echoes output to the kernel log.

use alloc::collections::VecDeque;
use spin::Mutex;

use super::CharDev;
use crate::errno::KResult;

pub struct Tty {
    input: Mutex<VecDeque<u8>>,
}

impl Tty {
    pub fn new() -> Tty {
        Tty {
            input: Mutex::new(VecDeque::new()),
        }
    }

    /// Feed input, as a keyboard interrupt handler would.
    pub fn push_input(&self, bytes: &[u8]) {
        let mut input = self.input.lock();
        input.extend(bytes.iter().copied());
    }
}

impl CharDev for Tty {
    fn read(&self, _pos: usize, buf: &mut [u8]) -> KResult<usize> {
        let mut input = self.input.lock();
        let mut n = 0;
        while n < buf.len() {
            match input.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write(&self, _pos: usize, buf: &[u8]) -> KResult<usize> {
        if let Ok(s) = core::str::from_utf8(buf) {
            log_info!("tty: {}", s.trim_end());
        }
        Ok(buf.len())
    }
}

impl Default for Tty {
    fn default() -> Self {
        Self::new()
    }
}
