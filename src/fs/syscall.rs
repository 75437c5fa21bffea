//! The file syscall surface. Every path resolution returns a held vnode
//! reference; `Arc` drops release them on all exit paths.

use crate::drivers::DevId;
use crate::errno::{Errno, KResult};
use crate::proc::curproc;

use super::file::{fget, FMode, NFILES, OFlags};
use super::namev::{namev_dir, namev_lookup, namev_open, namev_resolve};
use super::ramfs;
use super::vnode::{Dirent, Stat, VnodeType, NAME_LEN};

/// Read from `fd` at its position, advancing it by the bytes returned.
pub fn do_read(fd: i32, buf: &mut [u8]) -> KResult<usize> {
    let file = fget(fd).ok_or(Errno::EBADF)?;
    if !file.mode().contains(FMode::READ) {
        return Err(Errno::EBADF);
    }
    let vnode = file.vnode();
    if vnode.is_dir() {
        return Err(Errno::EISDIR);
    }
    let pos = file.pos();
    let n = vnode.read(pos, buf)?;
    file.set_pos(pos + n);
    Ok(n)
}

/// Write to `fd`. In append mode the position moves to the end of the file
/// under the vnode lock before the bytes land.
pub fn do_write(fd: i32, buf: &[u8]) -> KResult<usize> {
    let file = fget(fd).ok_or(Errno::EBADF)?;
    if !file.mode().contains(FMode::WRITE) {
        return Err(Errno::EBADF);
    }
    let vnode = file.vnode();
    if file.mode().contains(FMode::APPEND) {
        let (n, end) = vnode.append_write(buf)?;
        file.set_pos(end);
        Ok(n)
    } else {
        let pos = file.pos();
        let n = vnode.write_at(pos, buf)?;
        file.set_pos(pos + n);
        Ok(n)
    }
}

/// Release the descriptor slot and put the open-file reference.
pub fn do_close(fd: i32) -> KResult<()> {
    if fd < 0 || fd as usize >= NFILES {
        return Err(Errno::EBADF);
    }
    let proc = curproc().expect("close with no current process");
    proc.file_take(fd as usize).ok_or(Errno::EBADF)?;
    Ok(())
}

/// Duplicate `fd` into the lowest free slot; both share one open file.
pub fn do_dup(fd: i32) -> KResult<usize> {
    let file = fget(fd).ok_or(Errno::EBADF)?;
    let proc = curproc().expect("dup with no current process");
    let nfd = proc.get_empty_fd()?;
    proc.file_install(nfd, file);
    Ok(nfd)
}

/// Duplicate `ofd` into `nfd`, closing whatever occupied `nfd`.
/// Identical descriptors are a no-op.
pub fn do_dup2(ofd: i32, nfd: i32) -> KResult<usize> {
    if nfd < 0 || nfd as usize >= NFILES {
        return Err(Errno::EBADF);
    }
    let file = fget(ofd).ok_or(Errno::EBADF)?;
    if ofd == nfd {
        return Ok(nfd as usize);
    }
    let proc = curproc().expect("dup2 with no current process");
    let _old = proc.file_take(nfd as usize);
    proc.file_install(nfd as usize, file);
    Ok(nfd as usize)
}

/// Create a filesystem node: a regular file, or a device with `devid`.
pub fn do_mknod(path: &str, vtype: VnodeType, devid: Option<DevId>) -> KResult<()> {
    match vtype {
        VnodeType::Regular | VnodeType::CharDev | VnodeType::BlockDev => {}
        VnodeType::Directory => return Err(Errno::EINVAL),
    }
    let _vnode = namev_open(None, path, OFlags::CREAT, vtype, devid)?;
    Ok(())
}

pub fn do_mkdir(path: &str) -> KResult<()> {
    let (parent, name) = namev_dir(None, path)?;
    if !parent.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    if name.is_empty() {
        return Err(Errno::EEXIST);
    }
    if name.len() > NAME_LEN {
        return Err(Errno::ENAMETOOLONG);
    }
    match namev_lookup(&parent, name) {
        Ok(_) => return Err(Errno::EEXIST),
        Err(Errno::ENOENT) => {}
        Err(e) => return Err(e),
    }
    parent.mkdir(name).map(|_| ())
}

pub fn do_rmdir(path: &str) -> KResult<()> {
    let (parent, name) = namev_dir(None, path)?;
    if name.len() > NAME_LEN {
        return Err(Errno::ENAMETOOLONG);
    }
    if !parent.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    if name == "." {
        return Err(Errno::EINVAL);
    }
    if name == ".." {
        return Err(Errno::ENOTEMPTY);
    }
    parent.rmdir(name)
}

/// Remove a non-directory link. Unlinking a directory is EPERM.
pub fn do_unlink(path: &str) -> KResult<()> {
    let (parent, name) = namev_dir(None, path)?;
    if name.len() > NAME_LEN {
        return Err(Errno::ENAMETOOLONG);
    }
    if !parent.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    if let Ok(target) = namev_lookup(&parent, name) {
        if target.is_dir() {
            return Err(Errno::EPERM);
        }
    }
    parent.unlink(name)
}

/// Hard-link `newpath` to the file at `oldpath`.
pub fn do_link(oldpath: &str, newpath: &str) -> KResult<()> {
    let target = namev_resolve(None, oldpath)?;
    if target.is_dir() {
        return Err(Errno::EPERM);
    }
    let (parent, name) = namev_dir(None, newpath)?;
    if name.len() > NAME_LEN {
        return Err(Errno::ENAMETOOLONG);
    }
    if !parent.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    parent.link(name, &target)
}

pub fn do_rename(oldpath: &str, newpath: &str) -> KResult<()> {
    let (olddir, oldname) = namev_dir(None, oldpath)?;
    if oldname.len() > NAME_LEN {
        return Err(Errno::ENAMETOOLONG);
    }
    if !olddir.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    let (newdir, newname) = namev_dir(None, newpath)?;
    if newname.len() > NAME_LEN {
        return Err(Errno::ENAMETOOLONG);
    }
    if !newdir.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    ramfs::rename(&olddir, oldname, &newdir, newname)
}

/// Change the working directory, releasing the old reference.
pub fn do_chdir(path: &str) -> KResult<()> {
    let vnode = namev_resolve(None, path)?;
    if !vnode.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    let proc = curproc().expect("chdir with no current process");
    let _old = proc.set_cwd(Some(vnode));
    Ok(())
}

/// Next directory entry of `fd`, advancing the position past it.
/// `None` at the end of the directory.
pub fn do_getdent(fd: i32) -> KResult<Option<Dirent>> {
    let file = fget(fd).ok_or(Errno::EBADF)?;
    let vnode = file.vnode();
    if !vnode.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    let pos = file.pos();
    match vnode.readdir(pos)? {
        Some(dirent) => {
            file.set_pos(pos + 1);
            Ok(Some(dirent))
        }
        None => Ok(None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// Reposition `fd`. The resulting offset must not be negative.
pub fn do_lseek(fd: i32, offset: isize, whence: Whence) -> KResult<usize> {
    let file = fget(fd).ok_or(Errno::EBADF)?;
    let new_pos = match whence {
        Whence::Set => offset,
        Whence::Cur => file.pos() as isize + offset,
        Whence::End => file.vnode().len() as isize + offset,
    };
    if new_pos < 0 {
        return Err(Errno::EINVAL);
    }
    file.set_pos(new_pos as usize);
    Ok(new_pos as usize)
}

pub fn do_stat(path: &str) -> KResult<Stat> {
    let vnode = namev_resolve(None, path)?;
    Ok(vnode.stat())
}
