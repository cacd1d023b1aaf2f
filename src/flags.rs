//! Flag-tie facade (§4.H): the header's `single` and each ring's
//! `trace`/`signal`, presented as plain scalar accessors. No locking —
//! these are lone aligned 32-bit loads/stores, matching the data
//! model's "tied scalar" semantics from the source system.

use crate::layout::header_offsets as hdr;
use crate::mapping::Mapping;

impl Mapping {
    /// `single`: Monitor-owned; AUT code MUST NOT write this.
    pub fn single(&self) -> i32 {
        unsafe { self.read_i32(hdr::SINGLE) }
    }

    pub fn set_single(&self, value: i32) {
        unsafe { self.write_i32(hdr::SINGLE, value) };
    }

    pub fn trace(&self, index: usize) -> i32 {
        unsafe { self.read_i32(self.layout.off_ring(index) + self.layout.ring_off_trace()) }
    }

    pub fn set_trace(&self, index: usize, value: i32) {
        unsafe { self.write_i32(self.layout.off_ring(index) + self.layout.ring_off_trace(), value) };
    }

    pub fn signal(&self, index: usize) -> i32 {
        unsafe { self.read_i32(self.layout.off_ring(index) + self.layout.ring_off_signal()) }
    }

    pub fn set_signal(&self, index: usize, value: i32) {
        unsafe { self.write_i32(self.layout.off_ring(index) + self.layout.ring_off_signal(), value) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::tempdir;

    #[test]
    fn flags_read_write_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ring");
        let cfg = Config { buffers: 2, ..Config::defaults() };
        let mapping = Mapping::create_at(&path, &cfg).unwrap();

        assert_eq!(mapping.single(), 0);
        mapping.set_single(1);
        assert_eq!(mapping.single(), 1);

        mapping.set_trace(0, 1);
        mapping.set_signal(0, 1);
        assert_eq!(mapping.trace(0), 1);
        assert_eq!(mapping.signal(0), 1);
        assert_eq!(mapping.trace(1), 0);
    }
}
