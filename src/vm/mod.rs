pub mod access;
pub mod brk;
pub mod mmap;
pub mod mobj;
pub mod pagefault;
pub mod shadow;
pub mod vmmap;

pub use mobj::{Mobj, MobjType, Pframe};
pub use vmmap::{MapFlags, Prot, Vmarea, Vmmap, VmmapDir};
