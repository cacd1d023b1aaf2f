//! Watch protocol (§4.F): up to 4 concurrently armed watch expressions
//! per ring, each a state machine over the pair (`inuse`, `resready`)
//! so the Monitor never has to wait on a specific polling cadence from
//! the AUT.
//!
//! | State     | (inuse, resready) | owner of transition |
//! |-----------|--------------------|---------------------|
//! | Free      | (0, 0)             | —                   |
//! | Armed     | (1, 0)             | Monitor -> AUT       |
//! | Resolved  | (1, 1)             | AUT -> Monitor       |
//! | Releasing | (-2, *)            | Monitor -> AUT       |

use std::sync::atomic::Ordering;

use crate::error::{Error, Result};
use crate::mapping::Mapping;

pub struct WatchState;

impl WatchState {
    pub const FREE: i32 = 0;
    pub const ARMED: i32 = 1;
    pub const RELEASING: i32 = -2;
}

impl Mapping {
    /// Monitor-side: arms the first free watch slot on ring `index`
    /// with `expr`. Returns the watch slot claimed, or `Exhausted` if
    /// all 4 are in use.
    pub fn arm_watch(&self, index: usize, expr: &[u8]) -> Result<usize> {
        if expr.len() > self.layout.watch_expr_capacity() {
            return Err(Error::TooLarge { len: expr.len(), limit: self.layout.watch_expr_capacity() });
        }

        let ring_off = self.layout.off_ring(index);
        for slot in 0..4 {
            let woff = ring_off + self.layout.ring_off_watch(slot);
            unsafe {
                let inuse = self.atomic_i32(woff + self.layout.watch_off_inuse());
                if inuse.load(Ordering::Acquire) != WatchState::FREE {
                    continue;
                }

                let area = self.bytes_mut(woff + self.layout.watch_off_expr(), self.layout.watch_expr_capacity());
                area[..expr.len()].copy_from_slice(expr);
                for b in &mut area[expr.len()..] {
                    *b = 0;
                }
                self.write_i32(woff + self.layout.watch_off_exprlength(), expr.len() as i32);
                self.write_i32(woff + self.layout.watch_off_reslength(), 0);
                self.atomic_i32(woff + self.layout.watch_off_resready()).store(0, Ordering::Release);

                inuse.store(WatchState::ARMED, Ordering::Release);
                return Ok(slot);
            }
        }
        Err(Error::Exhausted)
    }

    /// Monitor-side: non-blocking read of `watch`'s result once the AUT
    /// has resolved it (`inuse == Armed, resready == 1`). Returns
    /// `None` otherwise. Does not release the slot; call
    /// `release_watch` or `request_reevaluation` once done.
    pub fn read_watch(&self, index: usize, slot: usize) -> Option<std::result::Result<Vec<u8>, Vec<u8>>> {
        let woff = self.layout.off_ring(index) + self.layout.ring_off_watch(slot);
        unsafe {
            let inuse = self.atomic_i32(woff + self.layout.watch_off_inuse()).load(Ordering::Acquire);
            let resready = self.atomic_i32(woff + self.layout.watch_off_resready()).load(Ordering::Acquire);
            if inuse != WatchState::ARMED || resready == 0 {
                return None;
            }

            let reslen = self.read_i32(woff + self.layout.watch_off_reslength());
            let len = reslen.unsigned_abs() as usize;
            let bytes = self.bytes(woff + self.layout.watch_off_result(), len.min(self.layout.watch_result_capacity())).to_vec();

            Some(if reslen >= 0 { Ok(bytes) } else { Err(bytes) })
        }
    }

    /// Monitor-side: Resolved -> Armed, requesting the AUT re-evaluate
    /// the same expression on its next service pass.
    pub fn request_reevaluation(&self, index: usize, slot: usize) {
        let woff = self.layout.off_ring(index) + self.layout.ring_off_watch(slot);
        unsafe {
            self.atomic_i32(woff + self.layout.watch_off_resready()).store(0, Ordering::Release);
        }
    }

    /// Monitor-side: releases a resolved (or still-armed) watch slot
    /// back to the pool. The AUT observes `Releasing` on its next
    /// service pass and clears it to `Free`.
    pub fn release_watch(&self, index: usize, slot: usize) {
        let woff = self.layout.off_ring(index) + self.layout.ring_off_watch(slot);
        unsafe {
            self.atomic_i32(woff + self.layout.watch_off_inuse()).store(WatchState::RELEASING, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::tempdir;

    fn mapping_with(buffers: usize) -> std::sync::Arc<Mapping> {
        let dir = tempdir().unwrap();
        let path = Box::leak(Box::new(dir)).path().join("ring");
        let cfg = Config { buffers, slots: 2, slot_sz: 32, msg_sz: 16, global_sz: 64, ..Config::defaults() };
        Mapping::create_at(&path, &cfg).unwrap()
    }

    #[test]
    fn watch_lifecycle_scenario() {
        let mapping = mapping_with(1);
        let ring = mapping.try_allocate().unwrap();
        let index = ring.index().unwrap();

        let slot = mapping.arm_watch(index, b"$x").unwrap();
        assert!(mapping.read_watch(index, slot).is_none());

        ring.service_watches(|expr| {
            assert_eq!(expr, b"$x");
            Ok(b"42".to_vec())
        });

        let result = mapping.read_watch(index, slot).unwrap();
        assert_eq!(result.unwrap(), b"42");

        mapping.release_watch(index, slot);
        ring.service_watches(|_| Ok(Vec::new()));

        let slot2 = mapping.arm_watch(index, b"$y").unwrap();
        assert_eq!(slot2, slot);
    }

    #[test]
    fn arming_all_four_then_one_more_is_exhausted() {
        let mapping = mapping_with(1);
        let ring = mapping.try_allocate().unwrap();
        let index = ring.index().unwrap();

        for _ in 0..4 {
            mapping.arm_watch(index, b"$z").unwrap();
        }
        let err = mapping.arm_watch(index, b"$z").unwrap_err();
        assert!(matches!(err, Error::Exhausted));
    }

    #[test]
    fn failed_evaluation_is_reported_as_err() {
        let mapping = mapping_with(1);
        let ring = mapping.try_allocate().unwrap();
        let index = ring.index().unwrap();

        let slot = mapping.arm_watch(index, b"$bad").unwrap();
        ring.service_watches(|_| Err("undefined variable".to_string()));

        let result = mapping.read_watch(index, slot).unwrap();
        assert_eq!(result.unwrap_err(), b"undefined variable");
    }
}
