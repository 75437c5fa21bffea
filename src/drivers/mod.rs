pub mod disk;
pub mod memdev;
pub mod tty;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::errno::KResult;

/// Device identity, `(major, minor)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DevId {
    pub major: u16,
    pub minor: u16,
}

impl DevId {
    pub const fn new(major: u16, minor: u16) -> DevId {
        DevId { major, minor }
    }
}

pub const MEM_MAJOR: u16 = 1;
pub const TTY_MAJOR: u16 = 2;
pub const DISK_MAJOR: u16 = 3;

pub const MEM_NULL_DEVID: DevId = DevId::new(MEM_MAJOR, 0);
pub const MEM_ZERO_DEVID: DevId = DevId::new(MEM_MAJOR, 1);

/// Terminals and disks created at boot.
pub const NTERMS: u16 = 3;
pub const NDISKS: u16 = 1;

/// Byte-stream device. Position is supplied by the caller; stream devices
/// are free to ignore it.
pub trait CharDev: Send + Sync {
    fn read(&self, pos: usize, buf: &mut [u8]) -> KResult<usize>;
    fn write(&self, pos: usize, buf: &[u8]) -> KResult<usize>;
}

/// Block device with page-sized blocks.
pub trait BlockDev: Send + Sync {
    fn read_block(&self, block: usize, buf: &mut [u8]) -> KResult<()>;
    fn write_block(&self, block: usize, buf: &[u8]) -> KResult<()>;
    fn block_count(&self) -> usize;
}

enum Device {
    Char(Arc<dyn CharDev>),
    Block(Arc<dyn BlockDev>),
}

lazy_static! {
    static ref REGISTRY: Mutex<BTreeMap<DevId, Device>> = Mutex::new(BTreeMap::new());
}

pub fn register_chardev(devid: DevId, dev: Arc<dyn CharDev>) {
    REGISTRY.lock().insert(devid, Device::Char(dev));
}

pub fn register_blockdev(devid: DevId, dev: Arc<dyn BlockDev>) {
    REGISTRY.lock().insert(devid, Device::Block(dev));
}

/// The driver backing a char device node, if one is registered.
pub fn chardev_lookup(devid: DevId) -> Option<Arc<dyn CharDev>> {
    match REGISTRY.lock().get(&devid) {
        Some(Device::Char(dev)) => Some(dev.clone()),
        _ => None,
    }
}

pub fn blockdev_lookup(devid: DevId) -> Option<Arc<dyn BlockDev>> {
    match REGISTRY.lock().get(&devid) {
        Some(Device::Block(dev)) => Some(dev.clone()),
        _ => None,
    }
}

/// Register the boot-time device set: memory devices, terminals, disks.
pub(crate) fn drivers_init() {
    let mut reg = REGISTRY.lock();
    reg.clear();
    reg.insert(MEM_NULL_DEVID, Device::Char(Arc::new(memdev::NullDev)));
    reg.insert(MEM_ZERO_DEVID, Device::Char(Arc::new(memdev::ZeroDev)));
    for minor in 0..NTERMS {
        reg.insert(
            DevId::new(TTY_MAJOR, minor),
            Device::Char(Arc::new(tty::Tty::new())),
        );
    }
    for minor in 0..NDISKS {
        reg.insert(
            DevId::new(DISK_MAJOR, minor),
            Device::Block(Arc::new(disk::RamDisk::new(disk::DISK_BLOCKS))),
        );
    }
    drop(reg);
    log_info!("device registry initialized");
}
