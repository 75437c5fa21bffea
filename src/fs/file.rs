use alloc::sync::Arc;
use bitflags::bitflags;
use spin::Mutex;

use super::vnode::Vnode;

/// Descriptor table size per process.
pub const NFILES: usize = 32;

bitflags! {
    /// Access mode of an open file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FMode: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const APPEND = 1 << 2;
    }
}

bitflags! {
    /// Open flags. O_RDONLY is the absence of WRONLY and RDWR.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OFlags: u32 {
        const WRONLY = 0x001;
        const RDWR = 0x002;
        const CREAT = 0x100;
        const TRUNC = 0x200;
        const APPEND = 0x400;
    }
}

/// An open file: a vnode reference, the access mode, and the byte position.
/// Shared by `Arc` — dup, dup2, and fork all alias the same position.
pub struct File {
    vnode: Arc<Vnode>,
    mode: FMode,
    pos: Mutex<usize>,
}

impl File {
    pub(crate) fn new(vnode: Arc<Vnode>, mode: FMode) -> Arc<File> {
        Arc::new(File {
            vnode,
            mode,
            pos: Mutex::new(0),
        })
    }

    pub fn vnode(&self) -> Arc<Vnode> {
        self.vnode.clone()
    }

    pub fn mode(&self) -> FMode {
        self.mode
    }

    pub fn pos(&self) -> usize {
        *self.pos.lock()
    }

    pub(crate) fn set_pos(&self, pos: usize) {
        *self.pos.lock() = pos;
    }
}

/// The current process's open file for `fd`, reference included.
pub fn fget(fd: i32) -> Option<Arc<File>> {
    if fd < 0 || fd as usize >= NFILES {
        return None;
    }
    crate::proc::curproc()?.file_get(fd as usize)
}
