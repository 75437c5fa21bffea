//! Copy-on-write shadow objects.
//!
//! A shadow object overlays another mobj: reads fall through the chain of
//! shadows to the first object holding the page, writes materialize a
//! private copy in the top shadow. Fork pushes a fresh shadow onto every
//! PRIVATE mapping of both parent and child.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::mobj::{Mobj, MobjBackend, MobjType, Pframe};
use crate::errno::KResult;

pub(crate) struct ShadowLinks {
    /// The object this shadow overlays. Re-pointed by collapse, taken by
    /// the teardown walk; otherwise always Some.
    pub(crate) shadowed: Mutex<Option<Arc<Mobj>>>,
    /// The non-shadow object at the bottom of the chain. Fixed for life.
    pub(crate) bottom: Arc<Mobj>,
}

fn links(obj: &Mobj) -> &ShadowLinks {
    match obj.backend() {
        MobjBackend::Shadow(links) => links,
        _ => panic!("not a shadow object"),
    }
}

/// Create a shadow overlaying `shadowed`. The new object's bottom is the
/// shadowed object's bottom when that is itself a shadow, or the shadowed
/// object itself otherwise.
pub fn shadow_create(shadowed: &Arc<Mobj>) -> Arc<Mobj> {
    let bottom = match shadowed.backend() {
        MobjBackend::Shadow(l) => l.bottom.clone(),
        _ => shadowed.clone(),
    };
    debug_assert!(bottom.mo_type() != MobjType::Shadow);
    Mobj::shadow_create_raw(ShadowLinks {
        shadowed: Mutex::new(Some(shadowed.clone())),
        bottom,
    })
}

/// Read path: this shadow's own frame if present, else the nearest
/// ancestor's, else the bottom object's. The walk is a loop — a fork bomb
/// builds chains far deeper than any kernel stack.
pub(crate) fn shadow_get_pframe(obj: &Mobj, pagenum: usize) -> KResult<Arc<Pframe>> {
    if let Some(pf) = obj.find_pframe(pagenum) {
        return Ok(pf);
    }
    let bottom = links(obj).bottom.clone();
    let mut cur = links(obj).shadowed.lock().clone();
    while let Some(m) = cur {
        if m.mo_type() != MobjType::Shadow {
            break;
        }
        if let Some(pf) = m.find_pframe(pagenum) {
            return Ok(pf);
        }
        cur = links(&m).shadowed.lock().clone();
    }
    bottom.get_pframe(pagenum, false)
}

/// Write-path fill: copy the page's bytes from the nearest object in the
/// chain that has them. Called by the default get path with the new frame
/// already allocated and owned by `obj`.
pub(crate) fn shadow_fill_pframe(obj: &Mobj, pf: &Pframe) -> KResult<()> {
    let bottom = links(obj).bottom.clone();
    let mut cur = links(obj).shadowed.lock().clone();
    while let Some(m) = cur {
        if m.mo_type() != MobjType::Shadow {
            break;
        }
        if let Some(src) = m.find_pframe(pf.pagenum()) {
            pf.fill_from(&src);
            return Ok(());
        }
        cur = links(&m).shadowed.lock().clone();
    }
    let src = bottom.get_pframe(pf.pagenum(), false)?;
    pf.fill_from(&src);
    Ok(())
}

/// Collapse `obj`'s chain as far as possible: whenever the next link is a
/// shadow referenced by nobody else, migrate its frames up into `obj` and
/// splice it out. Keeps chains bounded as forked siblings die.
pub fn shadow_collapse(obj: &Arc<Mobj>) {
    assert_eq!(obj.mo_type(), MobjType::Shadow);
    loop {
        let shadowed = match links(obj).shadowed.lock().clone() {
            Some(s) => s,
            None => return,
        };
        if shadowed.mo_type() != MobjType::Shadow {
            return;
        }
        // Two handles exist when the link is otherwise unreferenced: the
        // chain's and the local clone above.
        if Arc::strong_count(&shadowed) > 2 {
            return;
        }

        // Migrate pages we do not already have. Lock order: upper object
        // before the one it shadows.
        {
            let mut ours = obj.pframes_lock();
            let mut theirs = shadowed.pframes_lock();
            let moved: Vec<(usize, Arc<Pframe>)> = core::mem::take(&mut *theirs).into_iter().collect();
            for (pn, pf) in moved {
                ours.entry(pn).or_insert(pf);
            }
        }

        let next = links(&shadowed).shadowed.lock().take();
        *links(obj).shadowed.lock() = next;
        // The spliced-out link dies here; its own teardown sees no chain.
    }
}

/// Iteratively dismantle a dying shadow's chain. Each sole-owner link is
/// detached before it drops, so `Mobj::drop` never recurses down the chain.
pub(crate) fn teardown_chain(links_of_dying: &ShadowLinks) {
    let mut cur = links_of_dying.shadowed.lock().take();
    while let Some(m) = cur {
        cur = None;
        if m.mo_type() == MobjType::Shadow && Arc::strong_count(&m) == 1 {
            cur = links(&m).shadowed.lock().take();
        }
    }
}
