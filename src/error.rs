use std::io;

pub type Result<T> = ::std::result::Result<T, Error>;

/// Every way the core can fail, per the error kinds enumerated in the
/// ring-buffer design. None of these are fatal to the process: callers
/// decide whether to propagate, retry, or (for `Exhausted`) fall back
/// to an uninstrumented no-op handle.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An attached file's header sizes disagree with the requested config.
    #[error("mapping at {path:?} has sizes incompatible with the requested config: {reason}")]
    ConfigMismatch { path: std::path::PathBuf, reason: String },

    /// Open, map, or lock failure.
    #[error("file system error: {inner}")]
    FileSystem {
        #[from]
        inner: io::Error,
    },

    /// No free ring was available for `allocate`.
    #[error("ring pool exhausted: all buffers in use")]
    Exhausted,

    /// A payload exceeded a configured bound (mailbox message, global
    /// buffer, watch expression/result).
    #[error("payload of {len} bytes exceeds the configured bound of {limit} bytes")]
    TooLarge { len: usize, limit: usize },

    /// Caller attempted to free a ring it does not own.
    #[error("attempted to free ring {index} which is not owned by this handle")]
    NotOwner { index: usize },

    /// Reserved for reader-side snapshot validation; the core never
    /// returns this today; `snapshot()` tolerates torn reads instead.
    #[error("snapshot observed a torn write")]
    Torn,
}
