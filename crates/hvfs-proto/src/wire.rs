//! Little-endian decoding helpers shared by the codecs

use bytes::Buf;
use hvfs_common::{Error, Result};

/// Fail with a corrupt-data error unless `len` bytes remain
pub(crate) fn ensure(buf: &impl Buf, len: usize, what: &str) -> Result<()> {
    if buf.remaining() < len {
        return Err(Error::corrupt(format!(
            "truncated {what}: need {len} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

/// Length field as `u32`, rejecting oversized values
pub(crate) fn len_u32(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::invalid_argument(format!("{what} too long: {len}")))
}

/// Read a `u32` length prefix and that many bytes
pub(crate) fn take_prefixed(buf: &mut impl Buf, what: &str) -> Result<bytes::Bytes> {
    ensure(&*buf, 4, what)?;
    let len = buf.get_u32_le() as usize;
    ensure(&*buf, len, what)?;
    Ok(buf.copy_to_bytes(len))
}
