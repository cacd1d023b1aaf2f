//! A shared-memory ring-buffer facility for out-of-band inspection of
//! a multi-process, multi-threaded application under test (AUT) by a
//! separate Monitor process.
//!
//! Each AUT thread owns one ring record in a memory-mapped file and
//! talks to it lock-free (`RingHandle`); the Monitor attaches the same
//! file and addresses any ring by index (`MonitorView`). The only
//! operation that blocks is [`Mapping::with_global_lock`], used for
//! allocation and the shared global message area.
//!
//! ```no_run
//! use ringhook::{Config, Mapping};
//!
//! let cfg = Config::from_env();
//! let mapping = Mapping::create(&cfg)?;
//! let ring = mapping.allocate(); // null handle if the pool is exhausted
//! ring.enter("main");
//! ring.record(42, 0.0);
//! ring.leave();
//! # Ok::<(), ringhook::Error>(())
//! ```

pub mod allocator;
pub mod config;
pub mod error;
pub mod flags;
pub mod global;
pub mod layout;
pub mod mailbox;
pub mod mapping;
pub mod monitor;
pub mod ring;
pub mod watch;

pub use config::Config;
pub use error::{Error, Result};
pub use global::AppendOutcome;
pub use mapping::Mapping;
pub use monitor::{MonitorView, RingInfo};
pub use ring::{RingHandle, Slot};
