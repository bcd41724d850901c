#![allow(clippy::cast_possible_truncation)]
//! Read and write BP datasets, step-indexed multi-file containers of self-describing variables
//! produced by many cooperating writer ranks.
//!
//! # Writing
//!
//! Every rank of a communicator opens the same dataset with [`BpWriter::open`]. Each step, a
//! rank puts blocks of its variables, and the aggregation chain moves those blocks into one of
//! a few subfiles: either every rank writes at offsets relayed along its group, or producers
//! stream their blocks through a node-local shared buffer to a consumer that writes for the
//! whole group. Rank 0 then publishes the step's metadata. With a burst buffer configured, all
//! files are written to fast local storage and a background drainer copies them to the
//! dataset.
//!
//! # Reading
//!
//! [`BpReader::open`] waits for the dataset to appear and parses its index. A streaming reader
//! consumes steps while the writer is still appending; a random-access reader installs every
//! complete step at once. Selections are planned into byte ranges of the subfiles and fetched
//! lazily, subfiles in parallel, neighbouring ranges in one read.
//!
//! # File Format
//!
//! A dataset is a directory:
//!
//! ```text
//! <name>/
//! ├── md.idx    64-byte header, writer → subfile map, one record per step
//! ├── md.0      64-byte header, one combined metadata block per step
//! ├── mmd.0     deduplicated format descriptors, (IDLen, InfoLen, ID, Info)
//! └── data.N    raw payload of subfile N, every flush on a page boundary
//! ```
//!
//! A step record is `(MetadataPos, MetadataSize, FlushCount)` followed, per writer, by
//! `FlushCount - 1` pairs `(DataPos, DataSize)` and the position of the final flush. A combined
//! metadata block is `TotalSize`, one metadata length and one attribute length per writer, then
//! the blocks. All integers are 8 bytes in the byte order named by the header.
//!
//! ```text
//! ┌──────────────── md.idx header (64 bytes) ────────────────┐
//! │ 0..32  "BP v<major>.<minor>.<patch> Index Table"          │
//! │ 32..35 library version digits      36  endianness flag    │
//! │ 37     bp version (5)              38  bp minor (2)       │
//! │ 39     writer active               40  column major y/n   │
//! │ 41     flatten steps                                      │
//! │ 44..48 writer count                48..52 subfile count   │
//! └───────────────────────────────────────────────────────────┘
//! ```

mod collective;
mod deserializer;
mod dtype;
pub mod executor;
pub mod format;
pub mod header;
pub mod index;
pub mod metadata;
mod names;
pub mod operator;
mod params;
pub mod plan;
mod reader;
pub mod schema;
mod selection;
#[cfg(test)]
mod tests;
mod writer;

pub use deserializer::*;
pub use dtype::*;
pub use executor::ReaderMetrics;
pub use format::Endianness;
pub use forever_constant::*;
pub use names::*;
pub use operator::{DEFAULT_REGISTRY, Operator, OperatorParams, OperatorRegistry};
pub use params::*;
pub use reader::*;
pub use schema::{AttributeValue, ShapeKind};
pub use selection::*;
pub use writer::*;

/// Constants that will never change (i.e., doing so would break backwards compatibility)
mod forever_constant {
    /// Size of the header of `md.idx` and `md.0`.
    pub const INDEX_HEADER_SIZE: usize = 64;
    pub const VERSION_TAG_PREFIX: &str = "BP v";
    pub const VERSION_TAG_LENGTH: usize = 32;
    pub const VERSION_MAJOR_POSITION: usize = 32;
    pub const VERSION_MINOR_POSITION: usize = 33;
    pub const VERSION_PATCH_POSITION: usize = 34;
    pub const ENDIAN_FLAG_POSITION: usize = 36;
    pub const BP_VERSION_POSITION: usize = 37;
    pub const BP_MINOR_VERSION_POSITION: usize = 38;
    pub const ACTIVE_FLAG_POSITION: usize = 39;
    pub const COLUMN_MAJOR_FLAG_POSITION: usize = 40;
    pub const FLATTEN_STEPS_POSITION: usize = 41;
    pub const WRITER_COUNT_POSITION: usize = 44;
    pub const AGGREGATOR_COUNT_POSITION: usize = 48;

    /// The major version of the format.
    pub const BP_VERSION: u8 = 5;
    /// The newest minor version this crate reads and the one it writes.
    pub const BP_MINOR_VERSION: u8 = 2;

    pub const INDEX_FILE_NAME: &str = "md.idx";
    pub const METADATA_FILE_NAME: &str = "md.0";
    pub const META_METADATA_FILE_NAME: &str = "mmd.0";
    pub const DATA_FILE_PREFIX: &str = "data.";

}
