//! Monitor-side facade (ambient, new): the AUT addresses exactly one
//! ring, its own; the Monitor addresses any ring in the mapping by
//! index. `MonitorView` collects that "any index" shape in one place
//! rather than scattering `index: usize` parameters through the
//! public API that `RingHandle` otherwise hides behind `&self`.

use std::sync::Arc;

use crate::error::Result;
use crate::global::AppendOutcome;
use crate::mapping::Mapping;
use crate::ring::Slot;

/// A read-mostly, read/write-anywhere view over a mapping, built for
/// the out-of-process diagnostic collaborator rather than the AUT
/// itself. Construct once per attached mapping; cheap to clone (it's
/// just the `Arc`).
#[derive(Clone)]
pub struct MonitorView {
    mapping: Arc<Mapping>,
}

/// A read-only summary of one ring's owner/control state, independent
/// of any `RingHandle` — the Monitor inspects rings it does not own.
#[derive(Clone, Debug, PartialEq)]
pub struct RingInfo {
    pub index: usize,
    pub free: bool,
    pub pid: i32,
    pub tid: i32,
    pub depth: i32,
    pub trace: i32,
    pub signal: i32,
}

impl MonitorView {
    pub fn new(mapping: Arc<Mapping>) -> Self {
        MonitorView { mapping }
    }

    pub fn max_buffers(&self) -> usize {
        self.mapping.layout.max_buffers
    }

    /// Summary of every ring, free or in use, in index order.
    pub fn rings(&self) -> Vec<RingInfo> {
        (0..self.max_buffers()).map(|i| self.ring_info(i)).collect()
    }

    pub fn ring_info(&self, index: usize) -> RingInfo {
        let m = &self.mapping;
        let ring_off = m.layout.off_ring(index);
        unsafe {
            RingInfo {
                index,
                free: *m.byte_ptr(m.layout.off_free_map_entry(index)) == 1,
                pid: m.read_i32(ring_off + m.layout.ring_off_pid()),
                tid: m.read_i32(ring_off + m.layout.ring_off_tid()),
                depth: m.read_i32(ring_off + m.layout.ring_off_depth()),
                trace: m.trace(index),
                signal: m.signal(index),
            }
        }
    }

    /// Same slot-window view as `RingHandle::snapshot`, for any ring
    /// index rather than only the calling thread's own.
    pub fn ring_snapshot(&self, index: usize) -> Vec<Slot> {
        let m = &self.mapping;
        let ring_off = m.layout.off_ring(index);
        unsafe {
            let depth = m.read_i32(ring_off + m.layout.ring_off_depth()).max(0) as usize;
            let slots = m.layout.slots;
            let count = depth.min(slots);
            let curr = m.read_i32(ring_off + m.layout.ring_off_curr_slot()) as usize;

            (0..count)
                .map(|i| {
                    let idx = (curr + slots - i % slots) % slots;
                    let slot_off = ring_off + m.layout.ring_off_slot(idx);
                    let linenumber = m.read_i32(slot_off + m.layout.slot_off_linenumber());
                    let timestamp = m.read_f64(slot_off + m.layout.slot_off_timestamp());
                    let bytes = m.bytes(slot_off + m.layout.slot_off_subroutine(), m.layout.slot_sz);
                    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                    let subroutine = String::from_utf8_lossy(&bytes[..end]).into_owned();
                    Slot { linenumber, timestamp, subroutine }
                })
                .collect()
        }
    }

    // --- mailbox ---

    pub fn post_command(&self, index: usize, command: [u8; 4], msg: &[u8]) -> Result<()> {
        self.mapping.post_command(index, command, msg)
    }

    pub fn read_response(&self, index: usize) -> Option<Vec<u8>> {
        self.mapping.read_response(index)
    }

    pub fn reset_mailbox(&self, index: usize) {
        self.mapping.reset_mailbox(index)
    }

    // --- watches ---

    pub fn arm_watch(&self, index: usize, expr: &[u8]) -> Result<usize> {
        self.mapping.arm_watch(index, expr)
    }

    pub fn read_watch(&self, index: usize, slot: usize) -> Option<std::result::Result<Vec<u8>, Vec<u8>>> {
        self.mapping.read_watch(index, slot)
    }

    pub fn request_reevaluation(&self, index: usize, slot: usize) {
        self.mapping.request_reevaluation(index, slot)
    }

    pub fn release_watch(&self, index: usize, slot: usize) {
        self.mapping.release_watch(index, slot)
    }

    // --- global area ---

    pub fn read_global(&self) -> Vec<u8> {
        self.mapping.read_global()
    }

    pub fn write_global(&self, bytes: &[u8]) -> Result<()> {
        self.mapping.write_global(bytes)
    }

    pub fn append_global(&self, bytes: &[u8]) -> AppendOutcome {
        self.mapping.append_global(bytes)
    }

    // --- flags ---

    pub fn single(&self) -> i32 {
        self.mapping.single()
    }

    pub fn set_single(&self, value: i32) {
        self.mapping.set_single(value)
    }

    pub fn trace(&self, index: usize) -> i32 {
        self.mapping.trace(index)
    }

    pub fn set_trace(&self, index: usize, value: i32) {
        self.mapping.set_trace(index, value)
    }

    pub fn signal(&self, index: usize) -> i32 {
        self.mapping.signal(index)
    }

    pub fn set_signal(&self, index: usize, value: i32) {
        self.mapping.set_signal(index, value)
    }

    /// Reclaims a ring whose owning process is no longer alive. Policy
    /// is left to the caller (§4.C): this only performs the free once
    /// the caller has decided `pid` is dead.
    pub fn reclaim(&self, index: usize) {
        self.mapping.free_index(index);
    }
}
