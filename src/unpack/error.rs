// SPDX-License-Identifier: AGPL-3.0-or-later
// Stdlib
use std::error::Error;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum UnpackError {
    Io(std::io::Error),
    /// The extraction root itself is missing or not a usable directory.
    /// Fatal: the whole extraction stops.
    Cwd { path: PathBuf, code: String },
    /// A symbolic link sat on the ancestor chain of a directory we were
    /// asked to create and we were not allowed to remove it.
    Symlink { path: PathBuf },
    /// The upstream archive stream is malformed beyond recovery.
    BadArchive(String),
    /// Invalid option combination.
    Config(String),
    LockPoisoned,
    ChannelClosed
}

impl fmt::Display for UnpackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e)            => write!(f, "IO error: {}", e),
            Self::Cwd { path, code } => write!(
                f, "{}: Cannot cd into '{}'", code, path.to_string_lossy()
            ),
            Self::Symlink { path } => write!(
                f, "Cannot extract through symbolic link '{}'",
                path.to_string_lossy()
            ),
            Self::BadArchive(e)    => write!(f, "Bad archive: {}", e),
            Self::Config(e)        => write!(f, "Invalid options: {}", e),
            Self::LockPoisoned     => write!(f, "Lock Poisoned"),
            Self::ChannelClosed    => write!(f, "Channel Closed")
        }
    }
}

impl Error for UnpackError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for UnpackError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl<T> From<std::sync::PoisonError<T>> for UnpackError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        UnpackError::LockPoisoned
    }
}

impl From<flume::TryRecvError> for UnpackError {
    fn from(_: flume::TryRecvError) -> Self {
        UnpackError::ChannelClosed
    }
}

impl<T> From<flume::SendError<T>> for UnpackError {
    fn from(_: flume::SendError<T>) -> Self {
        UnpackError::ChannelClosed
    }
}
