use libc::{EAGAIN, EFBIG, EINVAL, EIO, ENOBUFS, ENOENT, ENOSYS, ENOTSUP, EPERM};
use thiserror::Error;

/// Every failure mode named in the abstract error-kind table (spec §7),
/// collapsed into one enum so the dispatcher has a single place to map
/// onto kernel errnos.
#[derive(Debug, Error)]
pub enum DcfsError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("backend returned http {0}")]
    Http(u16),

    #[error("failed to parse backend response: {0}")]
    Parse(String),

    #[error("no such file or directory")]
    NoEntry,

    #[error("operation not permitted on this path")]
    NotPermitted,

    #[error("operation not supported")]
    NotSupported,

    #[error("operation not implemented")]
    NotImplemented,

    #[error("temporary failure, try again")]
    TryAgain,

    #[error("file exceeds the maximum part count")]
    TooLarge,

    #[error("no buffer space available")]
    NoBuffers,

    #[error("invalid argument")]
    Invalid,

    #[error("i/o error: {0}")]
    Io(String),
}

impl DcfsError {
    /// Maps an abstract error kind onto the POSIX errno the kernel expects
    /// back from a FUSE reply, per spec §7's "user-visible failures" table.
    pub fn errno(&self) -> i32 {
        match self {
            DcfsError::Codec(_) => EINVAL,
            DcfsError::Transport(_) => EAGAIN,
            DcfsError::Http(_) => EAGAIN,
            DcfsError::Parse(_) => EAGAIN,
            DcfsError::NoEntry => ENOENT,
            DcfsError::NotPermitted => EPERM,
            DcfsError::NotSupported => ENOTSUP,
            DcfsError::NotImplemented => ENOSYS,
            DcfsError::TryAgain => EAGAIN,
            DcfsError::TooLarge => EFBIG,
            DcfsError::NoBuffers => ENOBUFS,
            DcfsError::Invalid => EINVAL,
            DcfsError::Io(_) => EIO,
        }
    }
}
