//! Mailbox protocol (§4.E): a single-slot request/response channel per
//! ring, arbitrated by `cmdready` alone so neither side ever blocks on
//! the other under the global lock.
//!
//! ```text
//! Monitor: cmdready == 0  -->  write command+msg, store cmdready = 1
//! AUT:     cmdready == 1  -->  read command+msg, ... , store cmdready = -2
//! Monitor: cmdready == -2 -->  read response, store cmdready = 0
//! ```

use std::sync::atomic::Ordering;

use log::debug;

use crate::error::{Error, Result};
use crate::mapping::Mapping;

/// The three states of `cmdready`. Not `#[repr]`-matched to the raw
/// field by derive; callers compare against `as i32`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmdReady {
    Idle = 0,
    Requested = 1,
    Responded = -2,
}

impl Mapping {
    /// Monitor-side: posts a command to ring `index` if its mailbox is
    /// idle. `command` is the 4-byte command tag from the data model;
    /// `msg` is truncated to the configured message-area bound. Per
    /// §7, posting while the mailbox is not idle is protocol misuse,
    /// not a caller-visible failure: it is silently ignored and the
    /// state machine is left untouched.
    pub fn post_command(&self, index: usize, command: [u8; 4], msg: &[u8]) -> Result<()> {
        if msg.len() > self.layout.msgarea_sz {
            return Err(Error::TooLarge { len: msg.len(), limit: self.layout.msgarea_sz });
        }

        let ring_off = self.layout.off_ring(index);
        unsafe {
            let gate = self.atomic_i32(ring_off + self.layout.ring_off_cmdready());
            if gate.load(Ordering::Acquire) != CmdReady::Idle as i32 {
                debug!("post_command on ring {index} ignored: mailbox not idle");
                return Ok(());
            }

            self.bytes_mut(ring_off + self.layout.ring_off_command(), 4)[..4].copy_from_slice(&command);
            let area = self.bytes_mut(ring_off + self.layout.ring_off_msgarea(), self.layout.msgarea_sz);
            area[..msg.len()].copy_from_slice(msg);
            for b in &mut area[msg.len()..] {
                *b = 0;
            }
            self.write_i32(ring_off + self.layout.ring_off_msglen(), msg.len() as i32);

            gate.store(CmdReady::Requested as i32, Ordering::Release);
        }
        Ok(())
    }

    /// Monitor-side: non-blocking read of the response once
    /// `cmdready == -2`; resets the mailbox to idle. Returns `None` if
    /// the AUT hasn't responded yet.
    pub fn read_response(&self, index: usize) -> Option<Vec<u8>> {
        let ring_off = self.layout.off_ring(index);
        unsafe {
            let gate = self.atomic_i32(ring_off + self.layout.ring_off_cmdready());
            if gate.load(Ordering::Acquire) != CmdReady::Responded as i32 {
                return None;
            }

            let len = self.read_i32(ring_off + self.layout.ring_off_msglen()).max(0) as usize;
            let response = self.bytes(ring_off + self.layout.ring_off_msgarea(), len.min(self.layout.msgarea_sz)).to_vec();
            gate.store(CmdReady::Idle as i32, Ordering::Release);
            Some(response)
        }
    }

    /// Forces a mailbox back to idle, e.g. when the Monitor gives up
    /// waiting on an AUT thread that may have exited.
    pub fn reset_mailbox(&self, index: usize) {
        let ring_off = self.layout.off_ring(index);
        unsafe {
            self.atomic_i32(ring_off + self.layout.ring_off_cmdready()).store(CmdReady::Idle as i32, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::tempdir;

    #[test]
    fn post_rejects_oversized_message() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ring");
        let cfg = Config { buffers: 1, slots: 2, slot_sz: 32, msg_sz: 4, global_sz: 64, ..Config::defaults() };
        let mapping = Mapping::create_at(&path, &cfg).unwrap();

        let err = mapping.post_command(0, *b"CMD1", b"too long").unwrap_err();
        assert!(matches!(err, Error::TooLarge { .. }));
    }

    #[test]
    fn post_while_not_idle_is_a_silent_no_op() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ring");
        let cfg = Config { buffers: 1, slots: 2, slot_sz: 32, msg_sz: 16, global_sz: 64, ..Config::defaults() };
        let mapping = Mapping::create_at(&path, &cfg).unwrap();

        mapping.post_command(0, *b"CMD1", b"hi").unwrap();
        mapping.post_command(0, *b"CMD2", b"again").unwrap();

        // The second post must not have clobbered the first: cmdready
        // is still Requested and the command/msg are still CMD1/"hi".
        let ring_off = mapping.layout.off_ring(0);
        unsafe {
            let gate = mapping.atomic_i32(ring_off + mapping.layout.ring_off_cmdready());
            assert_eq!(gate.load(Ordering::Acquire), CmdReady::Requested as i32);
            let command = mapping.bytes(ring_off + mapping.layout.ring_off_command(), 4);
            assert_eq!(command, b"CMD1");
            let len = mapping.read_i32(ring_off + mapping.layout.ring_off_msglen()) as usize;
            let msg = mapping.bytes(ring_off + mapping.layout.ring_off_msgarea(), len);
            assert_eq!(msg, b"hi");
        }
    }
}
