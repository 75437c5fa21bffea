use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use super::ramfs::Ramfs;
use crate::drivers::DevId;
use crate::scheduler::KMutex;
use crate::vm::Mobj;

/// Longest single path component.
pub const NAME_LEN: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VnodeType {
    Regular,
    Directory,
    CharDev,
    BlockDev,
}

#[derive(Debug, Clone)]
pub struct Stat {
    pub ino: u64,
    pub vtype: VnodeType,
    pub len: usize,
    pub nlink: usize,
    pub dev: Option<DevId>,
}

/// One directory entry as handed to userland.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    pub ino: u64,
    pub name: String,
}

/// A name-to-inode binding inside a directory.
#[derive(Debug, Clone)]
pub(crate) struct RamDirent {
    pub name: String,
    pub ino: u64,
}

pub(crate) enum VnodeData {
    Bytes(Vec<u8>),
    Entries(Vec<RamDirent>),
    Device,
}

pub(crate) struct VnodeInner {
    /// Hard-link count. The filesystem drops its canonical reference when
    /// this reaches zero; open files keep the data alive until they close.
    pub nlink: usize,
    pub data: VnodeData,
    /// Cached memory object for mmap. Weak: the mobj holds the vnode, not
    /// the other way around.
    pub mobj: Weak<Mobj>,
}

/// In-memory inode. One canonical `Vnode` exists per live inode, interned
/// by the owning filesystem; every `Arc` clone of it is a reference in the
/// refcounting discipline.
pub struct Vnode {
    vno: u64,
    vtype: VnodeType,
    dev: Option<DevId>,
    /// Non-owning back-reference; the fs owns its vnodes.
    pub(crate) fs: Weak<Ramfs>,
    /// The vnode mutex: held across every operation that touches length or
    /// contents. Sleeping lock, per the concurrency model.
    pub(crate) inner: KMutex<VnodeInner>,
}

impl Vnode {
    pub(crate) fn new(
        vno: u64,
        vtype: VnodeType,
        dev: Option<DevId>,
        fs: Weak<Ramfs>,
        nlink: usize,
    ) -> Arc<Vnode> {
        let data = match vtype {
            VnodeType::Regular => VnodeData::Bytes(Vec::new()),
            VnodeType::Directory => VnodeData::Entries(Vec::new()),
            VnodeType::CharDev | VnodeType::BlockDev => VnodeData::Device,
        };
        Arc::new(Vnode {
            vno,
            vtype,
            dev,
            fs,
            inner: KMutex::new(VnodeInner {
                nlink,
                data,
                mobj: Weak::new(),
            }),
        })
    }

    pub fn vno(&self) -> u64 {
        self.vno
    }

    pub fn vtype(&self) -> VnodeType {
        self.vtype
    }

    pub fn is_dir(&self) -> bool {
        self.vtype == VnodeType::Directory
    }

    pub fn devid(&self) -> Option<DevId> {
        self.dev
    }

    pub fn nlink(&self) -> usize {
        self.inner.lock().nlink
    }

    /// Current length: file size in bytes, entry count for directories.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        match &inner.data {
            VnodeData::Bytes(b) => b.len(),
            VnodeData::Entries(e) => e.len(),
            VnodeData::Device => 0,
        }
    }

    pub fn stat(&self) -> Stat {
        let inner = self.inner.lock();
        let len = match &inner.data {
            VnodeData::Bytes(b) => b.len(),
            VnodeData::Entries(e) => e.len(),
            VnodeData::Device => 0,
        };
        Stat {
            ino: self.vno,
            vtype: self.vtype,
            len,
            nlink: inner.nlink,
            dev: self.dev,
        }
    }
}

impl core::fmt::Debug for Vnode {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Vnode")
            .field("vno", &self.vno)
            .field("vtype", &self.vtype)
            .finish()
    }
}

impl Drop for Vnode {
    fn drop(&mut self) {
        log_debug!("vnode {} destroyed", self.vno);
    }
}
