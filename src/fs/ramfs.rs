//! The in-memory filesystem driver and the vnode operation table.
//!
//! Inodes live entirely in their vnodes; the filesystem interns one
//! canonical `Arc<Vnode>` per inode number and holds it until the inode's
//! last hard link goes away. Every directory carries real `.` and `..`
//! entries, so path walking needs no special cases for them.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::vnode::{Dirent, RamDirent, Vnode, VnodeData, VnodeInner, VnodeType, NAME_LEN};
use crate::drivers::{blockdev_lookup, chardev_lookup};
use crate::errno::{Errno, KResult};
use crate::memory::{page_offset, PAGE_SIZE};
use crate::vm::Mobj;

const ROOT_INO: u64 = 1;

pub struct Ramfs {
    /// Canonical vnode per live inode; these are the fs-internal refs.
    vnodes: Mutex<BTreeMap<u64, Arc<Vnode>>>,
    next_ino: Mutex<u64>,
}

impl Ramfs {
    pub fn new() -> Arc<Ramfs> {
        let fs = Arc::new(Ramfs {
            vnodes: Mutex::new(BTreeMap::new()),
            next_ino: Mutex::new(ROOT_INO + 1),
        });
        let root = Vnode::new(
            ROOT_INO,
            VnodeType::Directory,
            None,
            Arc::downgrade(&fs),
            2,
        );
        {
            let mut inner = root.inner.lock();
            if let VnodeData::Entries(entries) = &mut inner.data {
                entries.push(RamDirent {
                    name: String::from("."),
                    ino: ROOT_INO,
                });
                // The root is its own parent.
                entries.push(RamDirent {
                    name: String::from(".."),
                    ino: ROOT_INO,
                });
            }
        }
        fs.vnodes.lock().insert(ROOT_INO, root);
        fs
    }

    pub fn root(&self) -> Arc<Vnode> {
        self.vget(ROOT_INO).expect("ramfs root missing")
    }

    /// Canonical vnode for `ino`, reference included.
    pub(crate) fn vget(&self, ino: u64) -> KResult<Arc<Vnode>> {
        self.vnodes.lock().get(&ino).cloned().ok_or(Errno::ENOENT)
    }

    fn alloc_vnode(
        self: &Arc<Self>,
        vtype: VnodeType,
        dev: Option<crate::drivers::DevId>,
        nlink: usize,
    ) -> Arc<Vnode> {
        let ino = {
            let mut next = self.next_ino.lock();
            let ino = *next;
            *next += 1;
            ino
        };
        let vnode = Vnode::new(ino, vtype, dev, Arc::downgrade(self), nlink);
        self.vnodes.lock().insert(ino, vnode.clone());
        vnode
    }

    /// Forget an inode whose link count reached zero. Open references keep
    /// the vnode alive until they drain; destruction happens exactly once,
    /// when the last of them drops.
    pub(crate) fn delete_vnode(&self, ino: u64) {
        self.vnodes.lock().remove(&ino);
        log_debug!("ramfs: inode {} unlinked from table", ino);
    }

    fn fs_of(vnode: &Vnode) -> KResult<Arc<Ramfs>> {
        vnode.fs.upgrade().ok_or(Errno::ENOENT)
    }
}

fn check_name(name: &str) -> KResult<()> {
    if name.is_empty() {
        return Err(Errno::ENOENT);
    }
    if name.len() > NAME_LEN {
        return Err(Errno::ENAMETOOLONG);
    }
    Ok(())
}

fn entries_of(data: &VnodeData) -> &Vec<RamDirent> {
    match data {
        VnodeData::Entries(e) => e,
        _ => panic!("directory vnode without entries"),
    }
}

fn entries_of_mut(data: &mut VnodeData) -> &mut Vec<RamDirent> {
    match data {
        VnodeData::Entries(e) => e,
        _ => panic!("directory vnode without entries"),
    }
}

/// The vnode operation table. Regular-file and directory bodies are the
/// ramfs driver; device nodes dispatch to the registered driver.
impl Vnode {
    /// Read at `pos`. Directories refuse; devices go to their driver.
    pub fn read(&self, pos: usize, buf: &mut [u8]) -> KResult<usize> {
        match self.vtype() {
            VnodeType::Directory => Err(Errno::EISDIR),
            VnodeType::CharDev | VnodeType::BlockDev => self.dev_read(pos, buf),
            VnodeType::Regular => {
                let inner = self.inner.lock();
                let bytes = match &inner.data {
                    VnodeData::Bytes(b) => b,
                    _ => panic!("regular vnode without bytes"),
                };
                if pos >= bytes.len() {
                    return Ok(0);
                }
                let n = core::cmp::min(buf.len(), bytes.len() - pos);
                buf[..n].copy_from_slice(&bytes[pos..pos + n]);
                Ok(n)
            }
        }
    }

    /// Write at `pos`, extending the file as needed; a gap left by a seek
    /// past the end reads back as zeros.
    pub fn write_at(&self, pos: usize, buf: &[u8]) -> KResult<usize> {
        match self.vtype() {
            VnodeType::Directory => Err(Errno::EISDIR),
            VnodeType::CharDev | VnodeType::BlockDev => self.dev_write(pos, buf),
            VnodeType::Regular => {
                let mut inner = self.inner.lock();
                let bytes = match &mut inner.data {
                    VnodeData::Bytes(b) => b,
                    _ => panic!("regular vnode without bytes"),
                };
                let end = pos + buf.len();
                if end > bytes.len() {
                    bytes.resize(end, 0);
                }
                bytes[pos..end].copy_from_slice(buf);
                Ok(buf.len())
            }
        }
    }

    /// Append under a single hold of the vnode lock; returns the bytes
    /// written and the resulting end position.
    pub fn append_write(&self, buf: &[u8]) -> KResult<(usize, usize)> {
        match self.vtype() {
            VnodeType::Regular => {
                let mut inner = self.inner.lock();
                let bytes = match &mut inner.data {
                    VnodeData::Bytes(b) => b,
                    _ => panic!("regular vnode without bytes"),
                };
                bytes.extend_from_slice(buf);
                Ok((buf.len(), bytes.len()))
            }
            _ => {
                let n = self.write_at(0, buf)?;
                Ok((n, n))
            }
        }
    }

    /// Drop a regular file's contents and any cached pages.
    pub fn truncate(&self) -> KResult<()> {
        if self.vtype() != VnodeType::Regular {
            return Err(Errno::EISDIR);
        }
        let mobj = {
            let mut inner = self.inner.lock();
            match &mut inner.data {
                VnodeData::Bytes(b) => b.clear(),
                _ => panic!("regular vnode without bytes"),
            }
            inner.mobj.upgrade()
        };
        // Cached frames are stale now; invalidate outside the vnode lock
        // (the fill path locks mobj-then-vnode).
        if let Some(mobj) = mobj {
            mobj.pframes_lock().clear();
        }
        Ok(())
    }

    /// Look `name` up in this directory, returning the canonical child
    /// vnode with a reference.
    pub fn lookup(&self, name: &str) -> KResult<Arc<Vnode>> {
        if !self.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        check_name(name)?;
        let ino = {
            let inner = self.inner.lock();
            entries_of(&inner.data)
                .iter()
                .find(|e| e.name == name)
                .map(|e| e.ino)
                .ok_or(Errno::ENOENT)?
        };
        Ramfs::fs_of(self)?.vget(ino)
    }

    /// Create a regular file or device node named `name` in this directory.
    pub fn create(
        &self,
        name: &str,
        vtype: VnodeType,
        dev: Option<crate::drivers::DevId>,
    ) -> KResult<Arc<Vnode>> {
        debug_assert!(vtype != VnodeType::Directory, "use mkdir");
        if !self.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        check_name(name)?;
        let fs = Ramfs::fs_of(self)?;

        let mut inner = self.inner.lock();
        if entries_of(&inner.data).iter().any(|e| e.name == name) {
            return Err(Errno::EEXIST);
        }
        let child = fs.alloc_vnode(vtype, dev, 1);
        entries_of_mut(&mut inner.data).push(RamDirent {
            name: String::from(name),
            ino: child.vno(),
        });
        Ok(child)
    }

    /// Create a subdirectory, wiring its `.` and `..` entries.
    pub fn mkdir(&self, name: &str) -> KResult<Arc<Vnode>> {
        if !self.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        check_name(name)?;
        let fs = Ramfs::fs_of(self)?;

        let mut inner = self.inner.lock();
        if entries_of(&inner.data).iter().any(|e| e.name == name) {
            return Err(Errno::EEXIST);
        }
        // `.` is the self-link, the parent entry is the second link.
        let child = fs.alloc_vnode(VnodeType::Directory, None, 2);
        {
            let mut child_inner = child.inner.lock();
            let entries = entries_of_mut(&mut child_inner.data);
            entries.push(RamDirent {
                name: String::from("."),
                ino: child.vno(),
            });
            entries.push(RamDirent {
                name: String::from(".."),
                ino: self.vno(),
            });
        }
        entries_of_mut(&mut inner.data).push(RamDirent {
            name: String::from(name),
            ino: child.vno(),
        });
        // The child's `..` is a link to us.
        inner.nlink += 1;
        Ok(child)
    }

    /// Remove the empty directory `name`.
    pub fn rmdir(&self, name: &str) -> KResult<()> {
        if !self.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        check_name(name)?;
        let fs = Ramfs::fs_of(self)?;

        let mut inner = self.inner.lock();
        let ino = entries_of(&inner.data)
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.ino)
            .ok_or(Errno::ENOENT)?;
        if ino == self.vno() {
            return Err(Errno::EINVAL);
        }
        let child = fs.vget(ino)?;
        if !child.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        {
            // Parent-then-child is ancestor-first order.
            let mut child_inner = child.inner.lock();
            let occupied = entries_of(&child_inner.data)
                .iter()
                .any(|e| e.name != "." && e.name != "..");
            if occupied {
                return Err(Errno::ENOTEMPTY);
            }
            child_inner.nlink = 0;
        }
        entries_of_mut(&mut inner.data).retain(|e| e.name != name);
        // The dead child's `..` no longer links us.
        inner.nlink -= 1;
        fs.delete_vnode(ino);
        Ok(())
    }

    /// Remove the link `name`. Never applies to directories.
    pub fn unlink(&self, name: &str) -> KResult<()> {
        if !self.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        check_name(name)?;
        let fs = Ramfs::fs_of(self)?;

        let mut inner = self.inner.lock();
        let ino = entries_of(&inner.data)
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.ino)
            .ok_or(Errno::ENOENT)?;
        let child = fs.vget(ino)?;
        if child.is_dir() {
            return Err(Errno::EPERM);
        }
        entries_of_mut(&mut inner.data).retain(|e| e.name != name);
        let gone = {
            let mut child_inner = child.inner.lock();
            child_inner.nlink -= 1;
            child_inner.nlink == 0
        };
        if gone {
            fs.delete_vnode(ino);
        }
        Ok(())
    }

    /// Create the hard link `name` -> `target` in this directory. Both
    /// vnode locks are taken in inode order, a total order consistent with
    /// ancestor-first within one filesystem.
    pub fn link(&self, name: &str, target: &Arc<Vnode>) -> KResult<()> {
        if !self.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        if target.is_dir() {
            return Err(Errno::EPERM);
        }
        check_name(name)?;

        let (mut dir_inner, mut target_inner) = if self.vno() < target.vno() {
            let d = self.inner.lock();
            let t = target.inner.lock();
            (d, t)
        } else {
            let t = target.inner.lock();
            let d = self.inner.lock();
            (d, t)
        };
        if entries_of(&dir_inner.data).iter().any(|e| e.name == name) {
            return Err(Errno::EEXIST);
        }
        entries_of_mut(&mut dir_inner.data).push(RamDirent {
            name: String::from(name),
            ino: target.vno(),
        });
        target_inner.nlink += 1;
        Ok(())
    }

    /// Entry at `index`, for getdent. `None` past the end.
    pub fn readdir(&self, index: usize) -> KResult<Option<Dirent>> {
        if !self.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        let inner = self.inner.lock();
        Ok(entries_of(&inner.data).get(index).map(|e| Dirent {
            ino: e.ino,
            name: e.name.clone(),
        }))
    }

    /// Memory object providing this vnode's pages. Interned per vnode, so
    /// every mapping of the same file shares one page cache.
    pub fn mmap(&self) -> KResult<Arc<Mobj>> {
        match self.vtype() {
            VnodeType::Regular => {
                let fs = Ramfs::fs_of(self).map_err(|_| Errno::ENODEV)?;
                let mut inner = self.inner.lock();
                if let Some(mobj) = inner.mobj.upgrade() {
                    return Ok(mobj);
                }
                let me = fs.vget(self.vno())?;
                let mobj = Mobj::file_create(me);
                inner.mobj = Arc::downgrade(&mobj);
                Ok(mobj)
            }
            VnodeType::BlockDev => {
                let devid = self.devid().ok_or(Errno::ENXIO)?;
                let dev = blockdev_lookup(devid).ok_or(Errno::ENXIO)?;
                let mut inner = self.inner.lock();
                if let Some(mobj) = inner.mobj.upgrade() {
                    return Ok(mobj);
                }
                let mobj = Mobj::blockdev_create(dev);
                inner.mobj = Arc::downgrade(&mobj);
                Ok(mobj)
            }
            _ => Err(Errno::ENODEV),
        }
    }

    fn dev_read(&self, pos: usize, buf: &mut [u8]) -> KResult<usize> {
        let devid = self.devid().ok_or(Errno::ENXIO)?;
        match self.vtype() {
            VnodeType::CharDev => chardev_lookup(devid).ok_or(Errno::ENXIO)?.read(pos, buf),
            VnodeType::BlockDev => {
                let dev = blockdev_lookup(devid).ok_or(Errno::ENXIO)?;
                let size = dev.block_count() * PAGE_SIZE;
                if pos >= size {
                    return Ok(0);
                }
                let want = core::cmp::min(buf.len(), size - pos);
                // Byte access goes through the device's memory object.
                let mobj = self.mmap()?;
                let mut done = 0;
                while done < want {
                    let at = pos + done;
                    let pf = mobj.get_pframe(at / PAGE_SIZE, false)?;
                    let off = page_offset(at);
                    let n = core::cmp::min(PAGE_SIZE - off, want - done);
                    pf.copy_to(off, &mut buf[done..done + n]);
                    done += n;
                }
                Ok(done)
            }
            _ => unreachable!(),
        }
    }

    fn dev_write(&self, pos: usize, buf: &[u8]) -> KResult<usize> {
        let devid = self.devid().ok_or(Errno::ENXIO)?;
        match self.vtype() {
            VnodeType::CharDev => chardev_lookup(devid).ok_or(Errno::ENXIO)?.write(pos, buf),
            VnodeType::BlockDev => {
                let dev = blockdev_lookup(devid).ok_or(Errno::ENXIO)?;
                let size = dev.block_count() * PAGE_SIZE;
                if pos >= size {
                    return Err(Errno::EINVAL);
                }
                let want = core::cmp::min(buf.len(), size - pos);
                let mobj = self.mmap()?;
                let mut done = 0;
                while done < want {
                    let at = pos + done;
                    let pf = mobj.get_pframe(at / PAGE_SIZE, true)?;
                    let off = page_offset(at);
                    let n = core::cmp::min(PAGE_SIZE - off, want - done);
                    pf.copy_from(off, &buf[done..done + n]);
                    done += n;
                }
                Ok(done)
            }
            _ => unreachable!(),
        }
    }
}

/// Move `oldname` in `olddir` to `newname` in `newdir`. Directories are not
/// renameable; the destination name must be free. Parent locks are taken in
/// inode order when the directories differ.
pub fn rename(
    olddir: &Arc<Vnode>,
    oldname: &str,
    newdir: &Arc<Vnode>,
    newname: &str,
) -> KResult<()> {
    if !olddir.is_dir() || !newdir.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    check_name(oldname)?;
    check_name(newname)?;
    let fs = Ramfs::fs_of(olddir)?;

    let same = Arc::ptr_eq(olddir, newdir);
    let mut old_inner;
    let mut new_inner = None;
    if same {
        old_inner = olddir.inner.lock();
    } else if olddir.vno() < newdir.vno() {
        old_inner = olddir.inner.lock();
        new_inner = Some(newdir.inner.lock());
    } else {
        let n = newdir.inner.lock();
        old_inner = olddir.inner.lock();
        new_inner = Some(n);
    }

    let ino = entries_of(&old_inner.data)
        .iter()
        .find(|e| e.name == oldname)
        .map(|e| e.ino)
        .ok_or(Errno::ENOENT)?;
    let moved = fs.vget(ino)?;
    if moved.is_dir() {
        return Err(Errno::EPERM);
    }

    {
        let dst: &VnodeInner = new_inner.as_deref().unwrap_or(&old_inner);
        if entries_of(&dst.data).iter().any(|e| e.name == newname) {
            return Err(Errno::EEXIST);
        }
    }

    entries_of_mut(&mut old_inner.data).retain(|e| e.name != oldname);
    let dst: &mut VnodeInner = match new_inner.as_deref_mut() {
        Some(inner) => inner,
        None => &mut old_inner,
    };
    entries_of_mut(&mut dst.data).push(RamDirent {
        name: String::from(newname),
        ino,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_has_dot_entries() {
        let fs = Ramfs::new();
        let root = fs.root();
        assert!(root.is_dir());
        let dot = root.lookup(".").unwrap();
        let dotdot = root.lookup("..").unwrap();
        assert!(Arc::ptr_eq(&dot, &root));
        assert!(Arc::ptr_eq(&dotdot, &root));
    }

    #[test]
    fn create_write_read() {
        let fs = Ramfs::new();
        let root = fs.root();
        let f = root.create("motd", VnodeType::Regular, None).unwrap();
        assert_eq!(f.write_at(0, b"hello").unwrap(), 5);
        let mut buf = [0u8; 16];
        assert_eq!(f.read(0, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(f.read(5, &mut buf).unwrap(), 0);

        // Sparse write: the gap reads back as zeros.
        assert_eq!(f.write_at(8, b"x").unwrap(), 1);
        assert_eq!(f.read(4, &mut buf[..5]).unwrap(), 5);
        assert_eq!(&buf[..5], b"o\0\0\0x");
    }

    #[test]
    fn lookup_is_interned() {
        let fs = Ramfs::new();
        let root = fs.root();
        let a = root.create("f", VnodeType::Regular, None).unwrap();
        let b = root.lookup("f").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn mkdir_rmdir_restores_parent() {
        let fs = Ramfs::new();
        let root = fs.root();
        let before = root.stat();

        let d = root.mkdir("d").unwrap();
        assert_eq!(d.nlink(), 2);
        assert_eq!(root.nlink(), before.nlink + 1);
        assert_eq!(root.rmdir("d"), Ok(()));
        assert_eq!(root.stat().nlink, before.nlink);
        assert_eq!(root.stat().len, before.len);
        assert_eq!(root.lookup("d").unwrap_err(), Errno::ENOENT);
    }

    #[test]
    fn rmdir_rejects_nonempty() {
        let fs = Ramfs::new();
        let root = fs.root();
        let d = root.mkdir("d").unwrap();
        d.create("f", VnodeType::Regular, None).unwrap();
        assert_eq!(root.rmdir("d"), Err(Errno::ENOTEMPTY));
        d.unlink("f").unwrap();
        assert_eq!(root.rmdir("d"), Ok(()));
    }

    #[test]
    fn hard_links_share_the_inode() {
        let fs = Ramfs::new();
        let root = fs.root();
        let a = root.create("a", VnodeType::Regular, None).unwrap();
        a.write_at(0, b"data").unwrap();

        root.link("b", &a).unwrap();
        assert_eq!(a.nlink(), 2);
        let b = root.lookup("b").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        root.unlink("b").unwrap();
        assert_eq!(a.nlink(), 1);
        let mut buf = [0u8; 4];
        assert_eq!(root.lookup("a").unwrap().read(0, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"data");
    }

    #[test]
    fn link_to_directory_is_refused() {
        let fs = Ramfs::new();
        let root = fs.root();
        let d = root.mkdir("d").unwrap();
        assert_eq!(root.link("d2", &d), Err(Errno::EPERM));
    }

    #[test]
    fn unlinked_inode_lives_until_last_ref() {
        let fs = Ramfs::new();
        let root = fs.root();
        let f = root.create("tmp", VnodeType::Regular, None).unwrap();
        f.write_at(0, b"still here").unwrap();
        root.unlink("tmp").unwrap();

        // The table entry is gone but our reference still reads.
        assert_eq!(root.lookup("tmp").unwrap_err(), Errno::ENOENT);
        let mut buf = [0u8; 10];
        assert_eq!(f.read(0, &mut buf).unwrap(), 10);
        assert_eq!(&buf, b"still here");
    }

    #[test]
    fn rename_moves_entries() {
        let fs = Ramfs::new();
        let root = fs.root();
        let d = root.mkdir("d").unwrap();
        let f = root.create("a", VnodeType::Regular, None).unwrap();
        f.write_at(0, b"z").unwrap();

        rename(&root, "a", &d, "b").unwrap();
        assert_eq!(root.lookup("a").unwrap_err(), Errno::ENOENT);
        let moved = d.lookup("b").unwrap();
        assert!(Arc::ptr_eq(&moved, &f));

        // Same-directory rename.
        rename(&d, "b", &d, "c").unwrap();
        assert!(d.lookup("c").is_ok());
        assert_eq!(rename(&root, "d", &root, "e"), Err(Errno::EPERM));
    }

    #[test]
    fn readdir_walks_entries_in_order() {
        let fs = Ramfs::new();
        let root = fs.root();
        root.create("x", VnodeType::Regular, None).unwrap();
        assert_eq!(root.readdir(0).unwrap().unwrap().name, ".");
        assert_eq!(root.readdir(1).unwrap().unwrap().name, "..");
        assert_eq!(root.readdir(2).unwrap().unwrap().name, "x");
        assert_eq!(root.readdir(3).unwrap(), None);
    }

    #[test]
    fn name_length_is_bounded() {
        let fs = Ramfs::new();
        let root = fs.root();
        let long = "x".repeat(NAME_LEN + 1);
        assert_eq!(
            root.create(&long, VnodeType::Regular, None).unwrap_err(),
            Errno::ENAMETOOLONG
        );
        assert_eq!(root.lookup(&long).unwrap_err(), Errno::ENAMETOOLONG);
    }

    #[test]
    fn file_mmap_sees_file_bytes() {
        let fs = Ramfs::new();
        let root = fs.root();
        let f = root.create("m", VnodeType::Regular, None).unwrap();
        f.write_at(0, b"mapped!").unwrap();

        let mobj = f.mmap().unwrap();
        let pf = mobj.get_pframe(0, false).unwrap();
        let mut buf = [0u8; 7];
        pf.copy_to(0, &mut buf);
        assert_eq!(&buf, b"mapped!");

        // Interned: a second mmap shares the page cache.
        assert!(Arc::ptr_eq(&mobj, &f.mmap().unwrap()));
    }
}
