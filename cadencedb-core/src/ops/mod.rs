//! Read and write cursors
//!
//! Both cursors are explicit state machines so that file, directory and
//! series code can make partial progress and be resumed later.

mod read;
mod write;

pub use read::ReadOperation;
pub use write::{DatapointBuffer, RawBuffer, WriteOperation};
