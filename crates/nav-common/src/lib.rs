//! Common utilities and data structures shared by the navmesh and crowd crates

mod bounds;
mod geometry;
mod math;
mod vector;

pub use bounds::*;
pub use geometry::*;
pub use math::*;
pub use vector::*;

/// Represents a 3D position
pub type Vec3 = glam::Vec3;

/// Error types for the library
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("malformed tile data: {0}")]
    InvalidTile(String),

    #[error("tile already loaded at ({x}, {y})")]
    AlreadyLoaded { x: i32, y: i32 },

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("buffer too small: wrote {written} of {required} entries")]
    BufferTooSmall { written: usize, required: usize },

    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("navigation error: {0}")]
    Detour(String),

    #[cfg(feature = "std")]
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true for the "nothing there" family of failures
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

/// Result type for navigation operations
pub type Result<T> = std::result::Result<T, Error>;
