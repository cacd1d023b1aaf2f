//! File mapping & the process-global advisory lock (§4.B).
//!
//! Two locks guard the shared state, always acquired in this order:
//! a process-local [`Mutex`] first, then an OS-level `flock` on the
//! backing file. Taking the thread mutex first keeps two threads in
//! *this* process from racing each other while the file lock is held
//! by this process (the file lock alone wouldn't stop that, since
//! `flock` is per-open-file-description, not per-thread).

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use memmap2::MmapMut;
use nix::fcntl::{flock, FlockArg};
use std::os::unix::io::AsRawFd;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::layout::{header_offsets as hdr, Layout};

/// An open, mapped ring-buffer file. Shared via `Arc` across every
/// `RingHandle` and `MonitorView` that touches it; torn down (unmapped)
/// when the last `Arc` is dropped.
pub struct Mapping {
    file: File,
    mmap: MmapMut,
    base: *mut u8,
    pub(crate) layout: Layout,
    path: PathBuf,
    thread_lock: Mutex<()>,
}

// SAFETY: all shared mutation goes through the ordering and locking
// rules documented on each component; the raw pointer itself is never
// aliased mutably without those rules being followed.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Creates the mapping if `cfg.path()` doesn't exist or is empty,
    /// otherwise attaches to it — idempotent in shape: an existing file
    /// whose header disagrees with `cfg` fails with `ConfigMismatch`.
    pub fn create(cfg: &Config) -> Result<Arc<Self>> {
        let path = cfg.path();
        Self::create_at(&path, cfg)
    }

    pub fn create_at(path: &Path, cfg: &Config) -> Result<Arc<Self>> {
        debug!("opening {path:?} for create/attach");
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        let existing_len = file.metadata()?.len();
        let creating = existing_len == 0;

        let layout = Layout::new(cfg);
        let needed = layout.mapped_size() as u64;

        if creating {
            file.set_len(needed)?;
        } else if existing_len != needed {
            return Err(Error::ConfigMismatch {
                path: path.to_path_buf(),
                reason: format!("file is {existing_len} bytes, config implies {needed} bytes"),
            });
        }

        let mapping = Self::from_file(file, layout, path.to_path_buf())?;

        if creating {
            debug!("initializing new mapping header at {path:?}");
            mapping.with_global_lock(|m| unsafe { m.init_header(cfg) });
        } else {
            mapping.validate_header(cfg)?;
        }

        Ok(Arc::new(mapping))
    }

    /// Opens an existing mapping, inferring its `Config` from the
    /// header rather than requiring the caller to already know it.
    pub fn attach(path: &Path) -> Result<Arc<Self>> {
        debug!("attaching to {path:?}");
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            return Err(Error::ConfigMismatch { path: path.to_path_buf(), reason: "file is empty".into() });
        }

        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let base = mmap.as_mut_ptr();

        let cfg = unsafe { read_header_config(base) };
        let layout = Layout::new(&cfg);
        if layout.mapped_size() as u64 != len {
            return Err(Error::ConfigMismatch {
                path: path.to_path_buf(),
                reason: format!("header implies {} bytes but file is {len} bytes", layout.mapped_size()),
            });
        }

        Ok(Arc::new(Mapping { file, mmap, base, layout, path: path.to_path_buf(), thread_lock: Mutex::new(()) }))
    }

    fn from_file(file: File, layout: Layout, path: PathBuf) -> Result<Self> {
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let base = mmap.as_mut_ptr();
        Ok(Mapping { file, mmap, base, layout, path, thread_lock: Mutex::new(()) })
    }

    fn validate_header(&self, cfg: &Config) -> Result<()> {
        let on_disk = unsafe { read_header_config(self.base) };
        if on_disk.buffers != cfg.buffers
            || on_disk.slots != cfg.slots
            || on_disk.slot_sz != cfg.slot_sz
            || on_disk.msg_sz != cfg.msg_sz
            || on_disk.global_sz != cfg.global_sz
        {
            return Err(Error::ConfigMismatch {
                path: self.path.clone(),
                reason: format!("on-disk sizes {on_disk:?} disagree with requested {cfg:?}"),
            });
        }
        Ok(())
    }

    /// Zeroes the region and writes the header. Must be called while
    /// holding the global lock; the caller (`create_at`) enforces this.
    unsafe fn init_header(&self, cfg: &Config) {
        std::ptr::write_bytes(self.base, 0, self.layout.total_size());

        self.write_i32(hdr::SINGLE, 0);
        self.write_i32(hdr::MSGAREA_SZ, cfg.msg_sz as i32);
        self.write_i32(hdr::MAX_BUFFERS, cfg.buffers as i32);
        self.write_i32(hdr::SLOTS, cfg.slots as i32);
        self.write_i32(hdr::SLOT_SZ, cfg.slot_sz as i32);
        self.write_i32(hdr::STOP_ON_CREATE, cfg.stop_on_create);
        self.write_i32(hdr::TRACE_ON_CREATE, cfg.trace_on_create);
        self.write_i32(hdr::GLOBAL_SZ, cfg.global_sz as i32);
        self.write_i32(hdr::GLOBMSG_SZ, 0);

        for i in 0..self.layout.max_buffers {
            // 1 == free, per the data model.
            *self.byte_ptr(self.layout.off_free_map_entry(i)) = 1;

            // baseoff: byte offset from this ring record back to the
            // mapping base, fixed for the ring's lifetime.
            let ring_off = self.layout.off_ring(i);
            self.write_i32_at(ring_off + self.layout.ring_off_baseoff(), ring_off as i32);
        }
    }

    /// Scoped acquisition of the two-level lock: the process-local
    /// mutex first, then the cross-process `flock`, released on every
    /// exit path including panics inside `f`.
    pub fn with_global_lock<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Mapping) -> R,
    {
        let _thread_guard = self.thread_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let _file_guard = FileLockGuard::acquire(&self.file);
        f(self)
    }

    /// Unmaps and, if `unlink` is set, removes the backing file.
    /// Constructors only ever hand back `Arc<Mapping>`, so this takes
    /// the `Arc` and unwraps it rather than demanding a bare `Mapping`
    /// the caller has no way to produce; if other handles are still
    /// live the mapping is dropped normally (unmapped when the last
    /// `Arc` goes away) and, if `unlink` was requested, the file is
    /// still removed.
    pub fn teardown(this: Arc<Self>, unlink: bool) -> Result<()> {
        let path = this.path.clone();
        drop(this);
        if unlink {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // --- raw field access; every other component routes through these ---

    pub(crate) fn base(&self) -> *mut u8 {
        self.base
    }

    pub(crate) unsafe fn read_i32(&self, offset: usize) -> i32 {
        std::ptr::read(self.base.add(offset) as *const i32)
    }

    pub(crate) unsafe fn write_i32(&self, offset: usize, value: i32) {
        self.write_i32_at(offset, value);
    }

    unsafe fn write_i32_at(&self, offset: usize, value: i32) {
        std::ptr::write(self.base.add(offset) as *mut i32, value);
    }

    pub(crate) unsafe fn read_f64(&self, offset: usize) -> f64 {
        std::ptr::read(self.base.add(offset) as *const f64)
    }

    pub(crate) unsafe fn write_f64(&self, offset: usize, value: f64) {
        std::ptr::write(self.base.add(offset) as *mut f64, value);
    }

    pub(crate) unsafe fn byte_ptr(&self, offset: usize) -> *mut u8 {
        self.base.add(offset)
    }

    pub(crate) unsafe fn atomic_i32(&self, offset: usize) -> &AtomicI32 {
        &*(self.base.add(offset) as *const AtomicI32)
    }

    pub(crate) unsafe fn bytes_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.base.add(offset), len)
    }

    pub(crate) unsafe fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        std::slice::from_raw_parts(self.base.add(offset), len)
    }
}

/// Reads just the fixed header's size-defining fields into a `Config`,
/// used by `attach` before a `Layout` exists.
unsafe fn read_header_config(base: *mut u8) -> Config {
    let read = |off: usize| std::ptr::read(base.add(off) as *const i32);
    Config {
        buffers: read(hdr::MAX_BUFFERS) as usize,
        slots: read(hdr::SLOTS) as usize,
        slot_sz: read(hdr::SLOT_SZ) as usize,
        msg_sz: read(hdr::MSGAREA_SZ) as usize,
        global_sz: read(hdr::GLOBAL_SZ) as usize,
        stop_on_create: read(hdr::STOP_ON_CREATE),
        trace_on_create: read(hdr::TRACE_ON_CREATE),
        file: None,
    }
}

/// RAII guard around an exclusive, blocking `flock` on the whole file.
/// Released on every exit path, including unwinding.
struct FileLockGuard<'a> {
    file: &'a File,
}

impl<'a> FileLockGuard<'a> {
    fn acquire(file: &'a File) -> Self {
        // `flock` has no range granularity; this always covers the
        // entire mapping, which is all this protocol needs.
        if let Err(e) = flock(file.as_raw_fd(), FlockArg::LockExclusive) {
            warn!("flock acquire failed: {e}; proceeding without it would violate the locking contract");
        }
        FileLockGuard { file }
    }
}

impl<'a> Drop for FileLockGuard<'a> {
    fn drop(&mut self) {
        if let Err(e) = flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            warn!("flock release failed: {e}");
        }
    }
}
