//! Field-offset computation and typed binding over the mapping.
//!
//! The mapping is treated as one flat byte region. Every other
//! component reads and writes through the offsets computed here rather
//! than hand-rolling arithmetic; this is the sole place that knows how
//! the header, global buffer, free-map, and ring array are laid out
//! relative to each other.
//!
//! Layout (matches the on-disk/on-mapping format in the data model):
//!
//! ```text
//! | header (fixed) | global_buffer[global_sz] | free_map[max_buffers] | rings[max_buffers] |
//! ```
//!
//! Each ring record is:
//!
//! ```text
//! | fixed ring header | watches[4] | msgarea[msgarea_sz] (+ pad) | slots[slots] |
//! ```
//!
//! and each slot is `linenumber: i32, timestamp: f64, subroutine: [u8; slot_sz]`,
//! padded so that `timestamp` stays naturally aligned for every slot in
//! the ring, per the data model's alignment requirement.

use crate::config::Config;

/// 64-bit floats need 8-byte alignment on every platform this crate
/// targets; everything in the layout that precedes a `timestamp` field
/// is padded up to a multiple of this.
const ALIGN: usize = 8;

const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

/// Fixed (non-variable-length) header fields, in field order:
/// single, msgarea_sz, max_buffers, slots, slot_sz, stop_on_create,
/// trace_on_create, global_sz, globmsg_sz — nine `i32`s.
const HEADER_FIXED_FIELDS: usize = 9;
const HEADER_FIXED_RAW: usize = HEADER_FIXED_FIELDS * 4;

/// Fixed ring header fields: pid, tid, currSlot, depth, trace, signal,
/// baseoff, cmdready, msglen (nine `i32`s) plus the 4-byte `command` tag.
const RING_FIXED_RAW: usize = 9 * 4 + 4;

/// One watch record: inuse, exprlength (i32 each), expr[256], resready,
/// reslength (i32 each), result[512].
const WATCH_EXPR_LEN: usize = 256;
const WATCH_RESULT_LEN: usize = 512;
const WATCH_RECORD_SIZE: usize = 4 + 4 + WATCH_EXPR_LEN + 4 + 4 + WATCH_RESULT_LEN;
const WATCHES_PER_RING: usize = 4;

/// Header field offsets are independent of `Config` (the fixed header
/// is nine `i32`s, always), so they're available as plain constants
/// for reading a header before a `Layout` has been built — this is how
/// `attach` bootstraps a `Config` from an unknown file.
pub mod header_offsets {
    pub const SINGLE: usize = 0;
    pub const MSGAREA_SZ: usize = 4;
    pub const MAX_BUFFERS: usize = 8;
    pub const SLOTS: usize = 12;
    pub const SLOT_SZ: usize = 16;
    pub const STOP_ON_CREATE: usize = 20;
    pub const TRACE_ON_CREATE: usize = 24;
    pub const GLOBAL_SZ: usize = 28;
    pub const GLOBMSG_SZ: usize = 32;
}

/// Computed byte offsets and sizes for one mapping. Immutable once
/// built; `Config` is fixed for the mapping's lifetime (resizing is not
/// supported, per the data model).
#[derive(Clone, Copy, Debug)]
pub struct Layout {
    pub max_buffers: usize,
    pub slots: usize,
    pub slot_sz: usize,
    pub msgarea_sz: usize,
    pub global_sz: usize,

    header_size: usize,
    global_offset: usize,
    free_map_offset: usize,
    rings_offset: usize,
    ring_stride: usize,

    watches_offset: usize,
    msgarea_offset: usize,
    slots_offset: usize,
    slot_stride: usize,
}

impl Layout {
    pub fn new(cfg: &Config) -> Self {
        let max_buffers = cfg.buffers;
        let slots = cfg.slots;
        let slot_sz = cfg.slot_sz;
        let msgarea_sz = cfg.msg_sz;
        let global_sz = cfg.global_sz;

        let header_size = align_up(HEADER_FIXED_RAW, ALIGN);
        let global_offset = header_size;
        let free_map_offset = global_offset + global_sz;
        let rings_offset = align_up(free_map_offset + max_buffers, ALIGN);

        let watches_offset = align_up(RING_FIXED_RAW, ALIGN);
        let msgarea_offset = watches_offset + WATCHES_PER_RING * WATCH_RECORD_SIZE;
        let slots_offset = align_up(msgarea_offset + msgarea_sz, ALIGN);

        // linenumber (4) + pad (4) + timestamp (8) + subroutine bytes.
        let slot_stride = align_up(16 + slot_sz, ALIGN);
        let ring_stride = align_up(slots_offset + slots * slot_stride, ALIGN);

        Layout {
            max_buffers,
            slots,
            slot_sz,
            msgarea_sz,
            global_sz,
            header_size,
            global_offset,
            free_map_offset,
            rings_offset,
            ring_stride,
            watches_offset,
            msgarea_offset,
            slots_offset,
            slot_stride,
        }
    }

    /// Total size of the mapping, per §4.A: header + global buffer +
    /// free-map + ring array.
    pub fn total_size(&self) -> usize {
        self.rings_offset + self.max_buffers * self.ring_stride
    }

    /// Total size rounded up to a whole number of pages, since the
    /// backing file is always `mmap`ed and the kernel grants memory in
    /// page-sized units regardless of the requested length.
    pub fn mapped_size(&self) -> usize {
        let page = page_size::get();
        let total = self.total_size();
        total.div_ceil(page) * page
    }

    pub fn ring_stride(&self) -> usize {
        self.ring_stride
    }

    pub fn slot_stride(&self) -> usize {
        self.slot_stride
    }

    // --- header field offsets ---

    pub fn off_single(&self) -> usize {
        0
    }
    pub fn off_msgarea_sz(&self) -> usize {
        4
    }
    pub fn off_max_buffers(&self) -> usize {
        8
    }
    pub fn off_slots(&self) -> usize {
        12
    }
    pub fn off_slot_sz(&self) -> usize {
        16
    }
    pub fn off_stop_on_create(&self) -> usize {
        20
    }
    pub fn off_trace_on_create(&self) -> usize {
        24
    }
    pub fn off_global_sz(&self) -> usize {
        28
    }
    pub fn off_globmsg_sz(&self) -> usize {
        32
    }

    pub fn off_global_buffer(&self) -> usize {
        self.global_offset
    }

    pub fn off_free_map(&self) -> usize {
        self.free_map_offset
    }

    pub fn off_free_map_entry(&self, index: usize) -> usize {
        self.free_map_offset + index
    }

    pub fn off_ring(&self, index: usize) -> usize {
        self.rings_offset + index * self.ring_stride
    }

    // --- per-ring field offsets (relative to the start of a ring record) ---

    pub fn ring_off_pid(&self) -> usize {
        0
    }
    pub fn ring_off_tid(&self) -> usize {
        4
    }
    pub fn ring_off_curr_slot(&self) -> usize {
        8
    }
    pub fn ring_off_depth(&self) -> usize {
        12
    }
    pub fn ring_off_trace(&self) -> usize {
        16
    }
    pub fn ring_off_signal(&self) -> usize {
        20
    }
    pub fn ring_off_baseoff(&self) -> usize {
        24
    }
    pub fn ring_off_cmdready(&self) -> usize {
        28
    }
    pub fn ring_off_command(&self) -> usize {
        32
    }
    pub fn ring_off_msglen(&self) -> usize {
        36
    }

    pub fn ring_off_watch(&self, slot: usize) -> usize {
        self.watches_offset + slot * WATCH_RECORD_SIZE
    }

    pub fn ring_off_msgarea(&self) -> usize {
        self.msgarea_offset
    }

    pub fn ring_off_slot(&self, index: usize) -> usize {
        self.slots_offset + index * self.slot_stride
    }

    // --- watch field offsets (relative to the start of a watch record) ---

    pub fn watch_off_inuse(&self) -> usize {
        0
    }
    pub fn watch_off_exprlength(&self) -> usize {
        4
    }
    pub fn watch_off_expr(&self) -> usize {
        8
    }
    pub fn watch_off_resready(&self) -> usize {
        self.watch_off_expr() + WATCH_EXPR_LEN
    }
    pub fn watch_off_reslength(&self) -> usize {
        self.watch_off_resready() + 4
    }
    pub fn watch_off_result(&self) -> usize {
        self.watch_off_reslength() + 4
    }

    pub fn watch_expr_capacity(&self) -> usize {
        WATCH_EXPR_LEN
    }
    pub fn watch_result_capacity(&self) -> usize {
        WATCH_RESULT_LEN
    }

    // --- slot field offsets (relative to the start of a slot record) ---

    pub fn slot_off_linenumber(&self) -> usize {
        0
    }
    pub fn slot_off_timestamp(&self) -> usize {
        8
    }
    pub fn slot_off_subroutine(&self) -> usize {
        16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn size_is_sum_of_sections() {
        let cfg = Config {
            buffers: 3,
            slots: 4,
            slot_sz: 64,
            msg_sz: 64,
            global_sz: 1024,
            ..Config::defaults()
        };
        let layout = Layout::new(&cfg);

        assert!(layout.off_global_buffer() >= HEADER_FIXED_RAW);
        assert!(layout.off_free_map() >= layout.off_global_buffer() + cfg.global_sz);
        assert!(layout.off_ring(0) >= layout.off_free_map() + cfg.buffers);
        assert_eq!(layout.off_ring(1) - layout.off_ring(0), layout.ring_stride());
        assert_eq!(layout.total_size(), layout.off_ring(0) + cfg.buffers * layout.ring_stride());
    }

    #[test]
    fn ring_record_offsets_stay_within_stride() {
        let cfg = Config { buffers: 2, slots: 5, slot_sz: 37, msg_sz: 13, global_sz: 8, ..Config::defaults() };
        let layout = Layout::new(&cfg);

        let last_slot_end = layout.ring_off_slot(cfg.slots - 1) + layout.slot_stride();
        assert!(last_slot_end <= layout.ring_stride());

        for i in 0..cfg.slots {
            assert_eq!(layout.ring_off_slot(i) % ALIGN, 0, "slot {i} timestamp must stay 8-byte aligned");
        }
    }

    #[test]
    fn odd_slot_sz_does_not_misalign_following_slot() {
        // slot_sz deliberately not a multiple of 8.
        let cfg = Config { buffers: 1, slots: 3, slot_sz: 201, msg_sz: 1, global_sz: 1, ..Config::defaults() };
        let layout = Layout::new(&cfg);
        for i in 0..cfg.slots {
            assert_eq!((layout.ring_off_slot(i) + layout.slot_off_timestamp()) % ALIGN, 0);
        }
    }
}
