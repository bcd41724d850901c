//! Collective communication for cooperating writer and reader ranks.
//!
//! The engine only needs a small slice of a message-passing library: rank and size, splitting
//! into sub-communicators, broadcast, gather, buffered point-to-point messages and a
//! node-local shared-memory window. [`Communicator`] captures that slice; collectives are
//! provided on top of point-to-point messages so an implementation only has to move bytes.
//!
//! [`LocalWorld`] runs every rank as a thread of the current process. It backs the tests and
//! single-node runs.

pub use comm::*;
pub use local::*;
pub use window::*;

mod comm;
mod local;
mod window;
