use super::file::{File, FMode, OFlags};
use super::namev::namev_open;
use super::vnode::VnodeType;
use crate::drivers::{blockdev_lookup, chardev_lookup};
use crate::errno::{Errno, KResult};
use crate::proc::curproc;

/// Open `path` relative to the current process's cwd.
///
/// Returns the new descriptor, or:
///  - EINVAL: O_WRONLY and O_RDWR both set
///  - EISDIR: directory opened with write access
///  - ENXIO: device node with no backing driver
///  - whatever path resolution reports
pub fn do_open(path: &str, oflags: OFlags) -> KResult<usize> {
    if oflags.contains(OFlags::WRONLY) && oflags.contains(OFlags::RDWR) {
        return Err(Errno::EINVAL);
    }
    let proc = curproc().expect("open with no current process");
    let fd = proc.get_empty_fd()?;

    let vnode = namev_open(None, path, oflags, VnodeType::Regular, None)?;

    if vnode.is_dir() && oflags.intersects(OFlags::WRONLY | OFlags::RDWR) {
        return Err(Errno::EISDIR);
    }
    match vnode.vtype() {
        VnodeType::CharDev => {
            let backed = vnode.devid().and_then(chardev_lookup).is_some();
            if !backed {
                return Err(Errno::ENXIO);
            }
        }
        VnodeType::BlockDev => {
            let backed = vnode.devid().and_then(blockdev_lookup).is_some();
            if !backed {
                return Err(Errno::ENXIO);
            }
        }
        _ => {}
    }

    let mut mode = if oflags.contains(OFlags::RDWR) {
        FMode::READ | FMode::WRITE
    } else if oflags.contains(OFlags::WRONLY) {
        FMode::WRITE
    } else {
        FMode::READ
    };
    if oflags.contains(OFlags::APPEND) {
        mode |= FMode::APPEND;
    }

    if oflags.contains(OFlags::TRUNC)
        && vnode.vtype() == VnodeType::Regular
        && mode.contains(FMode::WRITE)
    {
        vnode.truncate()?;
    }

    proc.file_install(fd, File::new(vnode, mode));
    Ok(fd)
}
