//! Path resolution.
//!
//! Every function here returns held references; callers release them (drop
//! the `Arc`) on all exit paths. `..` and `.` are ordinary directory
//! entries, so a walk needs no special handling for either, and `..` at the
//! root is the root because the root's `..` entry points at itself.

use alloc::sync::Arc;

use super::vnode::{Vnode, VnodeType, NAME_LEN};
use crate::drivers::DevId;
use crate::errno::{Errno, KResult};
use crate::fs::file::OFlags;
use crate::proc::curproc;

/// Single-component lookup in `dir`.
pub fn namev_lookup(dir: &Arc<Vnode>, name: &str) -> KResult<Arc<Vnode>> {
    dir.lookup(name)
}

/// Starting vnode for a walk: the root for absolute paths, `base` when
/// given, the current process's cwd otherwise.
fn walk_base(base: Option<&Arc<Vnode>>, path: &str) -> KResult<Arc<Vnode>> {
    if path.starts_with('/') {
        return Ok(crate::fs::root_vnode());
    }
    if let Some(b) = base {
        return Ok(b.clone());
    }
    if let Some(cwd) = curproc().and_then(|p| p.cwd()) {
        return Ok(cwd);
    }
    Ok(crate::fs::root_vnode())
}

/// Resolve `path` to a vnode. Empty components and `.` are skipped; every
/// intermediate component must be a directory.
pub fn namev_resolve(base: Option<&Arc<Vnode>>, path: &str) -> KResult<Arc<Vnode>> {
    if path.is_empty() {
        return Err(Errno::ENOENT);
    }
    let mut cur = walk_base(base, path)?;
    for comp in path.split('/') {
        if comp.is_empty() || comp == "." {
            continue;
        }
        if comp.len() > NAME_LEN {
            return Err(Errno::ENAMETOOLONG);
        }
        cur = namev_lookup(&cur, comp)?;
    }
    Ok(cur)
}

/// Resolve everything up to, but not including, the final component.
/// Returns the parent vnode and the basename slice of `path` — which may
/// name something that does not exist yet, which is the whole point for
/// create, mkdir, rmdir, and unlink.
pub fn namev_dir<'p>(
    base: Option<&Arc<Vnode>>,
    path: &'p str,
) -> KResult<(Arc<Vnode>, &'p str)> {
    if path.is_empty() {
        return Err(Errno::ENOENT);
    }
    let (dirpart, basename) = match path.rfind('/') {
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    };
    let parent = if dirpart.is_empty() {
        walk_base(base, path)?
    } else {
        namev_resolve(base, dirpart)?
    };
    Ok((parent, basename))
}

/// Resolve for open: like `namev_resolve`, but a missing final component is
/// created when `O_CREAT` is set, using `vtype` and `devid` (regular files
/// pass no device).
pub fn namev_open(
    base: Option<&Arc<Vnode>>,
    path: &str,
    oflags: OFlags,
    vtype: VnodeType,
    devid: Option<DevId>,
) -> KResult<Arc<Vnode>> {
    let (parent, basename) = namev_dir(base, path)?;
    if basename.is_empty() {
        // Paths like "/" or "d/": the parent is the object itself.
        return Ok(parent);
    }
    if basename.len() > NAME_LEN {
        return Err(Errno::ENAMETOOLONG);
    }
    match namev_lookup(&parent, basename) {
        Ok(vnode) => Ok(vnode),
        Err(Errno::ENOENT) if oflags.contains(OFlags::CREAT) => {
            parent.create(basename, vtype, devid)
        }
        Err(e) => Err(e),
    }
}
