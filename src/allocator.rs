//! Free-map allocator (§4.C): allocate/free one ring index per AUT
//! thread, always under `with_global_lock`.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::mapping::Mapping;
use crate::ring::RingHandle;

impl Mapping {
    /// Scans the free-map for the lowest free index, claims it, and
    /// returns an owning handle. Does not mutate the free-map on
    /// failure.
    pub fn try_allocate(self: &Arc<Self>) -> Result<RingHandle> {
        self.with_global_lock(|m| {
            let free_index = (0..m.layout.max_buffers)
                .find(|&i| unsafe { *m.byte_ptr(m.layout.off_free_map_entry(i)) } == 1);

            let Some(index) = free_index else {
                warn!("ring pool exhausted ({} buffers)", m.layout.max_buffers);
                return Err(Error::Exhausted);
            };

            unsafe { m.claim_ring(index) };
            debug!("allocated ring {index}");
            Ok(RingHandle::owning(Arc::clone(self), index))
        })
    }

    /// Infallible counterpart used by AUT-side call sites that must
    /// never fail: an exhausted pool yields a null handle whose
    /// operations are no-ops, per §7's policy that instrumentation
    /// degrades gracefully rather than disturbing the AUT.
    pub fn allocate(self: &Arc<Self>) -> RingHandle {
        match self.try_allocate() {
            Ok(handle) => handle,
            Err(Error::Exhausted) => RingHandle::null(),
            Err(e) => {
                warn!("allocate failed unexpectedly ({e}); continuing without instrumentation");
                RingHandle::null()
            }
        }
    }

    /// Frees ring `index`. Safe to call twice: the second call finds
    /// `free_map[index]` already `1` and is a no-op beyond that check.
    pub(crate) fn free_index(&self, index: usize) {
        self.with_global_lock(|m| unsafe {
            m.write_i32(m.layout.off_ring(index) + m.layout.ring_off_pid(), 0);
            m.write_i32(m.layout.off_ring(index) + m.layout.ring_off_tid(), 0);
            // Release: once this becomes visible, a concurrent allocate
            // observing it must also see the zeroed pid/tid above.
            m.atomic_free_map_entry(index).store(1, Ordering::Release);
            debug!("freed ring {index}");
        });
    }

    unsafe fn claim_ring(&self, index: usize) {
        let ring_off = self.layout.off_ring(index);

        self.atomic_free_map_entry(index).store(0, Ordering::Release);

        self.write_i32(ring_off + self.layout.ring_off_curr_slot(), 0);
        self.write_i32(ring_off + self.layout.ring_off_depth(), 0);
        self.write_i32(ring_off + self.layout.ring_off_trace(), 0);
        self.write_i32(ring_off + self.layout.ring_off_signal(), 0);
        self.write_i32(ring_off + self.layout.ring_off_cmdready(), 0);
        self.write_i32(ring_off + self.layout.ring_off_msglen(), 0);

        for w in 0..4 {
            let woff = ring_off + self.layout.ring_off_watch(w);
            self.write_i32(woff + self.layout.watch_off_inuse(), 0);
            self.write_i32(woff + self.layout.watch_off_resready(), 0);
        }

        let (stop_on_create, trace_on_create) = self.creation_policy();
        self.write_i32(ring_off + self.layout.ring_off_signal(), stop_on_create);
        self.write_i32(ring_off + self.layout.ring_off_trace(), trace_on_create);

        self.write_i32(ring_off + self.layout.ring_off_pid(), current_pid());
        self.write_i32(ring_off + self.layout.ring_off_tid(), current_tid());
    }

    fn creation_policy(&self) -> (i32, i32) {
        use crate::layout::header_offsets as hdr;
        unsafe { (self.read_i32(hdr::STOP_ON_CREATE), self.read_i32(hdr::TRACE_ON_CREATE)) }
    }

    pub(crate) unsafe fn atomic_free_map_entry(&self, index: usize) -> &std::sync::atomic::AtomicU8 {
        &*(self.base().add(self.layout.off_free_map_entry(index)) as *const std::sync::atomic::AtomicU8)
    }
}

fn current_pid() -> i32 {
    std::process::id() as i32
}

fn current_tid() -> i32 {
    // Linux-specific; the data model's `tid` field is the owning
    // thread's kernel thread id, distinct from the process id for
    // multi-threaded AUTs.
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::mapping::Mapping;
    use tempfile::tempdir;

    #[test]
    fn allocation_and_free_scenario() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ring");
        let cfg = Config { buffers: 3, slots: 4, slot_sz: 64, msg_sz: 64, global_sz: 1024, ..Config::defaults() };
        let mapping = Mapping::create_at(&path, &cfg).unwrap();

        let r0 = mapping.try_allocate().unwrap();
        assert_eq!(r0.index(), Some(0));
        assert_free_map(&mapping, &[0, 1, 1]);

        let r1 = mapping.try_allocate().unwrap();
        assert_eq!(r1.index(), Some(1));
        assert_free_map(&mapping, &[0, 0, 1]);

        mapping.free_index(0);
        assert_free_map(&mapping, &[1, 0, 1]);

        let r0b = mapping.try_allocate().unwrap();
        assert_eq!(r0b.index(), Some(0));
    }

    #[test]
    fn exhaustion_does_not_mutate_free_map() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ring");
        let cfg = Config { buffers: 1, ..Config::defaults() };
        let mapping = Mapping::create_at(&path, &cfg).unwrap();

        let _only = mapping.try_allocate().unwrap();
        let err = mapping.try_allocate().unwrap_err();
        assert!(matches!(err, Error::Exhausted));
        assert_free_map(&mapping, &[0]);

        let null = mapping.allocate();
        assert!(null.is_null());
    }

    fn assert_free_map(mapping: &Arc<Mapping>, expect: &[u8]) {
        for (i, &want) in expect.iter().enumerate() {
            let got = unsafe { *mapping.byte_ptr(mapping.layout.off_free_map_entry(i)) };
            assert_eq!(got, want, "free_map[{i}]");
        }
    }
}
