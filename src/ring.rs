//! Per-thread ring handle (§4.D) plus the AUT-side halves of the
//! mailbox (§4.E) and watch (§4.F) protocols. None of these operations
//! take the global lock; they're the hot path the rest of the system
//! is built to keep off the AUT's critical section.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::trace;

use crate::mailbox::CmdReady;
use crate::mapping::Mapping;
use crate::watch::WatchState;

/// One execution slot: a subroutine name, the line currently executing
/// in it, and when that was last recorded.
#[derive(Clone, Debug, PartialEq)]
pub struct Slot {
    pub linenumber: i32,
    pub timestamp: f64,
    pub subroutine: String,
}

/// A per-thread façade over one ring record. `RingHandle::null()` is
/// returned when the pool was exhausted at allocation time; every
/// operation on a null handle is a no-op (or a default value), so the
/// AUT can use it exactly like a real handle without a hot-path branch.
pub struct RingHandle {
    inner: Option<(Arc<Mapping>, usize)>,
}

impl RingHandle {
    pub(crate) fn owning(mapping: Arc<Mapping>, index: usize) -> Self {
        RingHandle { inner: Some((mapping, index)) }
    }

    pub fn null() -> Self {
        RingHandle { inner: None }
    }

    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    pub fn index(&self) -> Option<usize> {
        self.inner.as_ref().map(|(_, i)| *i)
    }

    fn ring_offset(&self) -> Option<(&Arc<Mapping>, usize)> {
        self.inner.as_ref().map(|(m, i)| (m, m.layout.off_ring(*i)))
    }

    pub fn pid(&self) -> i32 {
        self.ring_offset().map(|(m, off)| unsafe { m.read_i32(off + m.layout.ring_off_pid()) }).unwrap_or(0)
    }

    pub fn tid(&self) -> i32 {
        self.ring_offset().map(|(m, off)| unsafe { m.read_i32(off + m.layout.ring_off_tid()) }).unwrap_or(0)
    }

    pub fn depth(&self) -> i32 {
        self.ring_offset().map(|(m, off)| unsafe { m.read_i32(off + m.layout.ring_off_depth()) }).unwrap_or(0)
    }

    /// Pushes a new call frame: advances `currSlot` (once `depth > 1`),
    /// bumps `depth`, and writes the truncated, NUL-terminated
    /// subroutine name into the new current slot. `linenumber`/
    /// `timestamp` are left for the next `record`.
    pub fn enter(&self, subroutine_name: &str) {
        let Some((m, ring_off)) = self.ring_offset() else { return };
        unsafe {
            let depth = m.read_i32(ring_off + m.layout.ring_off_depth());
            let slots = m.layout.slots as i32;

            let new_depth = depth + 1;
            let curr = if new_depth > 1 {
                let prev = m.read_i32(ring_off + m.layout.ring_off_curr_slot());
                (prev + 1).rem_euclid(slots)
            } else {
                m.read_i32(ring_off + m.layout.ring_off_curr_slot())
            };

            m.write_i32(ring_off + m.layout.ring_off_depth(), new_depth);
            m.write_i32(ring_off + m.layout.ring_off_curr_slot(), curr);

            let slot_off = ring_off + m.layout.ring_off_slot(curr as usize);
            write_subroutine_name(m, slot_off + m.layout.slot_off_subroutine(), m.layout.slot_sz, subroutine_name);
        }
    }

    /// Pops the current call frame: decrements `depth` and, if frames
    /// remain, moves `currSlot` back one.
    pub fn leave(&self) {
        let Some((m, ring_off)) = self.ring_offset() else { return };
        unsafe {
            let depth = m.read_i32(ring_off + m.layout.ring_off_depth());
            if depth <= 0 {
                return;
            }
            let new_depth = depth - 1;
            m.write_i32(ring_off + m.layout.ring_off_depth(), new_depth);

            if new_depth > 0 {
                let slots = m.layout.slots as i32;
                let prev = m.read_i32(ring_off + m.layout.ring_off_curr_slot());
                m.write_i32(ring_off + m.layout.ring_off_curr_slot(), (prev - 1).rem_euclid(slots));
            }
        }
    }

    /// Overwrites the current slot's line and timestamp. No allocation,
    /// no lock; called on every line-level debug-hook entry.
    pub fn record(&self, line: i32, timestamp: f64) {
        let Some((m, ring_off)) = self.ring_offset() else { return };
        unsafe {
            let curr = m.read_i32(ring_off + m.layout.ring_off_curr_slot());
            let slot_off = ring_off + m.layout.ring_off_slot(curr as usize);
            m.write_i32(slot_off + m.layout.slot_off_linenumber(), line);
            m.write_f64(slot_off + m.layout.slot_off_timestamp(), timestamp);
        }
    }

    pub fn set_trace(&self, v: i32) {
        if let Some((m, off)) = self.ring_offset() {
            unsafe { m.write_i32(off + m.layout.ring_off_trace(), v) };
        }
    }

    pub fn get_trace(&self) -> i32 {
        self.ring_offset().map(|(m, off)| unsafe { m.read_i32(off + m.layout.ring_off_trace()) }).unwrap_or(0)
    }

    pub fn set_signal(&self, v: i32) {
        if let Some((m, off)) = self.ring_offset() {
            unsafe { m.write_i32(off + m.layout.ring_off_signal(), v) };
        }
    }

    pub fn get_signal(&self) -> i32 {
        self.ring_offset().map(|(m, off)| unsafe { m.read_i32(off + m.layout.ring_off_signal()) }).unwrap_or(0)
    }

    /// Returns the `min(depth, slots)` most recent slots, most-recent
    /// first. Best-effort: the AUT may be mid-write to these fields, so
    /// readers should treat the contents as a snapshot, not a
    /// synchronized view (§5).
    pub fn snapshot(&self) -> Vec<Slot> {
        let Some((m, ring_off)) = self.ring_offset() else { return Vec::new() };
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
                    let name_bytes = m.bytes(slot_off + m.layout.slot_off_subroutine(), m.layout.slot_sz);
                    let subroutine = bytes_to_nul_terminated_string(name_bytes);
                    Slot { linenumber, timestamp, subroutine }
                })
                .collect()
        }
    }

    // --- mailbox (§4.E), AUT side ---

    /// Non-blocking poll for a pending Monitor request. Returns `None`
    /// if `cmdready != 1`.
    pub fn take_request(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        let (m, ring_off) = self.ring_offset()?;
        unsafe {
            let state = m.atomic_i32(ring_off + m.layout.ring_off_cmdready()).load(Ordering::Acquire);
            if state != CmdReady::Requested as i32 {
                return None;
            }
            let command = m.bytes(ring_off + m.layout.ring_off_command(), 4).to_vec();
            let msglen = m.read_i32(ring_off + m.layout.ring_off_msglen()).max(0) as usize;
            let msg = m.bytes(ring_off + m.layout.ring_off_msgarea(), msglen.min(m.layout.msgarea_sz)).to_vec();
            trace!("ring {} took mailbox request", self.index().unwrap_or(usize::MAX));
            Some((command, msg))
        }
    }

    /// Publishes the response and moves the mailbox to `-2` (response
    /// ready). `response` is truncated to the configured bound.
    pub fn post_response(&self, response: &[u8]) {
        let Some((m, ring_off)) = self.ring_offset() else { return };
        unsafe {
            let len = response.len().min(m.layout.msgarea_sz);
            m.bytes_mut(ring_off + m.layout.ring_off_msgarea(), m.layout.msgarea_sz)[..len]
                .copy_from_slice(&response[..len]);
            m.write_i32(ring_off + m.layout.ring_off_msglen(), len as i32);
            m.atomic_i32(ring_off + m.layout.ring_off_cmdready()).store(CmdReady::Responded as i32, Ordering::Release);
        }
    }

    // --- watch channel (§4.F), AUT side ---

    /// Evaluates armed watches by handing each `Armed` slot's
    /// expression to `eval`, which returns `Ok(result_bytes)` or
    /// `Err(error_text)`. Also transitions any `Releasing` slot to
    /// `Free`. Call on hook entry when `single` or `trace` is set;
    /// coalescing calls elsewhere is fine, per §4.F.
    pub fn service_watches(&self, mut eval: impl FnMut(&[u8]) -> std::result::Result<Vec<u8>, String>) {
        let Some((m, ring_off)) = self.ring_offset() else { return };
        for slot in 0..4 {
            unsafe {
                let woff = ring_off + m.layout.ring_off_watch(slot);
                let inuse = m.atomic_i32(woff + m.layout.watch_off_inuse()).load(Ordering::Acquire);

                if inuse == WatchState::RELEASING {
                    m.atomic_i32(woff + m.layout.watch_off_inuse()).store(WatchState::FREE, Ordering::Release);
                    continue;
                }

                if inuse != WatchState::ARMED {
                    continue;
                }
                let resready = m.atomic_i32(woff + m.layout.watch_off_resready()).load(Ordering::Acquire);
                if resready != 0 {
                    continue;
                }

                let exprlen = m.read_i32(woff + m.layout.watch_off_exprlength()).max(0) as usize;
                let expr = m.bytes(woff + m.layout.watch_off_expr(), exprlen.min(m.layout.watch_expr_capacity()));

                let (reslen, ok) = match eval(expr) {
                    Ok(bytes) => {
                        let cap = m.layout.watch_result_capacity();
                        let len = bytes.len().min(cap);
                        m.bytes_mut(woff + m.layout.watch_off_result(), cap)[..len].copy_from_slice(&bytes[..len]);
                        (len as i32, true)
                    }
                    Err(msg) => {
                        let cap = m.layout.watch_result_capacity();
                        let bytes = msg.as_bytes();
                        let len = bytes.len().min(cap);
                        m.bytes_mut(woff + m.layout.watch_off_result(), cap)[..len].copy_from_slice(&bytes[..len]);
                        (-(len as i32), false)
                    }
                };
                let _ = ok;
                m.write_i32(woff + m.layout.watch_off_reslength(), reslen);
                // Armed->Resolved: inuse stays 1, resready flips to 1.
                m.atomic_i32(woff + m.layout.watch_off_resready()).store(1, Ordering::Release);
            }
        }
    }

    /// Frees this thread's ring. Idempotent: freeing an already-null
    /// handle, or calling twice, is a no-op.
    pub fn free(&mut self) {
        if let Some((mapping, index)) = self.inner.take() {
            mapping.free_index(index);
        }
    }
}

unsafe fn write_subroutine_name(mapping: &Mapping, offset: usize, capacity: usize, name: &str) {
    let bytes = name.as_bytes();
    let max_len = capacity.saturating_sub(1); // leave room for the NUL
    let len = bytes.len().min(max_len);

    let dest = mapping.bytes_mut(offset, capacity);
    dest[..len].copy_from_slice(&bytes[..len]);
    for b in &mut dest[len..] {
        *b = 0;
    }
}

fn bytes_to_nul_terminated_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::mapping::Mapping;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn new_mapping(cfg: Config) -> Arc<Mapping> {
        let dir = tempdir().unwrap();
        // leak the tempdir so the file survives for the test's duration
        let path = Box::leak(Box::new(dir)).path().join("ring");
        Mapping::create_at(&path, &cfg).unwrap()
    }

    #[test]
    fn slot_wrap_scenario() {
        let cfg = Config { buffers: 1, slots: 3, slot_sz: 64, msg_sz: 64, global_sz: 256, ..Config::defaults() };
        let mapping = new_mapping(cfg);
        let ring = mapping.try_allocate().unwrap();

        ring.enter("a");
        ring.record(10, 1.0);
        ring.enter("b");
        ring.record(20, 2.0);
        ring.enter("c");
        ring.record(30, 3.0);
        ring.enter("d");
        ring.record(40, 4.0);

        assert_eq!(ring.depth(), 4);

        let snap = ring.snapshot();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[0], Slot { linenumber: 40, timestamp: 4.0, subroutine: "d".into() });
        assert_eq!(snap[1], Slot { linenumber: 30, timestamp: 3.0, subroutine: "c".into() });
        assert_eq!(snap[2], Slot { linenumber: 20, timestamp: 2.0, subroutine: "b".into() });
    }

    #[test]
    fn long_subroutine_name_is_truncated_and_terminated() {
        let cfg = Config { buffers: 1, slots: 2, slot_sz: 8, msg_sz: 16, global_sz: 64, ..Config::defaults() };
        let mapping = new_mapping(cfg);
        let ring = mapping.try_allocate().unwrap();

        ring.enter("0123456789");
        let snap = ring.snapshot();
        assert_eq!(snap[0].subroutine, "0123456");
        assert_eq!(snap[0].subroutine.len(), 7); // slot_sz - 1
    }

    #[test]
    fn null_handle_is_inert() {
        let ring = RingHandle::null();
        assert!(ring.is_null());
        ring.enter("whatever");
        ring.record(1, 1.0);
        ring.leave();
        assert_eq!(ring.depth(), 0);
        assert!(ring.snapshot().is_empty());
    }

    #[test]
    fn mailbox_round_trip_scenario() {
        let cfg = Config { buffers: 1, slots: 2, slot_sz: 32, msg_sz: 64, global_sz: 64, ..Config::defaults() };
        let mapping = new_mapping(cfg);
        let ring = mapping.try_allocate().unwrap();
        let index = ring.index().unwrap();

        let monitor = crate::monitor::MonitorView::new(mapping.clone());
        monitor.post_command(index, *b"STEP", b"").unwrap();

        let (cmd, _msg) = ring.take_request().unwrap();
        assert_eq!(&cmd, b"STEP");
        ring.post_response(b"OK");

        let response = monitor.read_response(index).unwrap();
        assert_eq!(response, b"OK");
        monitor.reset_mailbox(index);
    }
}
