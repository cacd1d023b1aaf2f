//! Global message area (§4.G): one coarse-locked byte buffer shared by
//! every ring, used for payloads too large or too infrequent to
//! justify a dedicated per-ring channel. All three operations take the
//! global lock; this is the one part of the protocol allowed to block.

use crate::error::{Error, Result};
use crate::layout::header_offsets as hdr;
use crate::mapping::Mapping;

/// Outcome of `append_global`: either the whole payload fit, or only a
/// prefix did and the caller must chain further calls after the
/// Monitor drains the buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    Chunked(usize),
}

impl Mapping {
    /// Returns the first `globmsg_sz` bytes of the global buffer.
    pub fn read_global(&self) -> Vec<u8> {
        self.with_global_lock(|m| unsafe {
            let len = (m.read_i32(hdr::GLOBMSG_SZ).max(0) as usize).min(m.layout.global_sz);
            m.bytes(m.layout.off_global_buffer(), len).to_vec()
        })
    }

    /// Replaces the global buffer's contents wholesale.
    pub fn write_global(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.layout.global_sz {
            return Err(Error::TooLarge { len: bytes.len(), limit: self.layout.global_sz });
        }
        self.with_global_lock(|m| unsafe {
            m.bytes_mut(m.layout.off_global_buffer(), bytes.len())[..].copy_from_slice(bytes);
            m.write_i32(hdr::GLOBMSG_SZ, bytes.len() as i32);
        });
        Ok(())
    }

    /// Appends as much of `bytes` as fits after the current
    /// `globmsg_sz`, returning how much was consumed. A caller with
    /// more bytes than fit should drain (`read_global` + reset to
    /// empty) and call again with the remainder.
    pub fn append_global(&self, bytes: &[u8]) -> AppendOutcome {
        self.with_global_lock(|m| unsafe {
            let current = (m.read_i32(hdr::GLOBMSG_SZ).max(0) as usize).min(m.layout.global_sz);
            let capacity = m.layout.global_sz - current;
            let take = bytes.len().min(capacity);

            m.bytes_mut(m.layout.off_global_buffer() + current, take).copy_from_slice(&bytes[..take]);
            m.write_i32(hdr::GLOBMSG_SZ, (current + take) as i32);

            if take == bytes.len() {
                AppendOutcome::Appended
            } else {
                AppendOutcome::Chunked(take)
            }
        })
    }
}
