use thiserror::Error;

/// Errors raised by [`crate::DiskArena`] construction and capacity queries.
///
/// Per-allocation failures do not use this type — they collapse into the
/// null [`crate::RegionHandle`] — and per-free failures use
/// [`crate::FreeStatus`]. See the crate-level docs for the full mapping.
#[derive(Debug, Error)]
pub enum ArenaError {
    /// The arena's folder could not be opened or created.
    #[error("cannot open or create arena folder: {0}")]
    Config(#[source] std::io::Error),
    /// An OS call (statvfs, open, mmap, flush, ...) failed.
    #[error("arena io error: {0}")]
    Io(#[source] std::io::Error),
}

impl From<std::io::Error> for ArenaError {
    fn from(err: std::io::Error) -> Self {
        ArenaError::Io(err)
    }
}
