pub mod file;
pub mod namev;
pub mod open;
pub mod ramfs;
pub mod syscall;
pub mod vnode;

use alloc::format;
use alloc::sync::Arc;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::drivers::{
    DevId, DISK_MAJOR, MEM_NULL_DEVID, MEM_ZERO_DEVID, NDISKS, NTERMS, TTY_MAJOR,
};
use ramfs::Ramfs;
use vnode::{Vnode, VnodeType};

lazy_static! {
    static ref ROOT_FS: Mutex<Option<Arc<Ramfs>>> = Mutex::new(None);
}

pub fn root_fs() -> Arc<Ramfs> {
    ROOT_FS.lock().clone().expect("vfs not initialized")
}

/// The filesystem root, reference included.
pub fn root_vnode() -> Arc<Vnode> {
    root_fs().root()
}

/// Mount a fresh root filesystem and populate `/dev`.
pub(crate) fn fs_init() {
    *ROOT_FS.lock() = Some(Ramfs::new());
    make_dev_nodes();
    log_info!("vfs initialized: ramfs at /");
}

pub(crate) fn fs_teardown() {
    *ROOT_FS.lock() = None;
}

/// Boot-time device node layout: /dev/null, /dev/zero, the terminals, and
/// the disks.
fn make_dev_nodes() {
    let root = root_vnode();
    let dev = root.mkdir("dev").expect("mkdir /dev");
    dev.create("null", VnodeType::CharDev, Some(MEM_NULL_DEVID))
        .expect("mknod /dev/null");
    dev.create("zero", VnodeType::CharDev, Some(MEM_ZERO_DEVID))
        .expect("mknod /dev/zero");
    for minor in 0..NTERMS {
        dev.create(
            &format!("tty{}", minor),
            VnodeType::CharDev,
            Some(DevId::new(TTY_MAJOR, minor)),
        )
        .expect("mknod tty");
    }
    for minor in 0..NDISKS {
        dev.create(
            &format!("hda{}", minor),
            VnodeType::BlockDev,
            Some(DevId::new(DISK_MAJOR, minor)),
        )
        .expect("mknod disk");
    }
}
