use super::CharDev;
use crate::errno::KResult;

/// `/dev/null`: reads hit EOF immediately, writes vanish.
pub struct NullDev;

impl CharDev for NullDev {
    fn read(&self, _pos: usize, _buf: &mut [u8]) -> KResult<usize> {
        Ok(0)
    }

    fn write(&self, _pos: usize, buf: &[u8]) -> KResult<usize> {
        Ok(buf.len())
    }
}

/// `/dev/zero`: an endless source of zero bytes.
pub struct ZeroDev;

impl CharDev for ZeroDev {
    fn read(&self, _pos: usize, buf: &mut [u8]) -> KResult<usize> {
        buf.fill(0);
        Ok(buf.len())
    }

    fn write(&self, _pos: usize, buf: &[u8]) -> KResult<usize> {
        Ok(buf.len())
    }
}
