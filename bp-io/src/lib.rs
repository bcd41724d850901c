//! Core traits and implementations for positional IO.
//!
//! A BP dataset is a directory of append-only files (the index, the metadata files and one
//! data file per subfile). Writers place payload at offsets chosen by the aggregation chain,
//! readers fetch arbitrary byte ranges named by the index. Everything in this crate is
//! therefore positional: there is no shared cursor on any transport.
//!
//! The crate also hosts the [`TransportMan`], which opens subfiles lazily on first use, and the
//! burst-buffer [`FileDrainer`], a background thread that mirrors locally written segments to
//! their final location.

pub use drainer::*;
pub use file::*;
pub use manager::*;
pub use memory::*;
pub use ranges::*;
pub use read::*;
pub use write::*;

mod drainer;
mod file;
mod manager;
mod memory;
mod ranges;
mod read;
mod write;

/// Chunk size used when copying between files.
pub const DEFAULT_COPY_CHUNK_SIZE: usize = 4 << 20;
