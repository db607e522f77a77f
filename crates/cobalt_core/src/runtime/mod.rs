//! Runtime support library called from generated code.
//!
//! Everything generated code touches through a pointer is owned here. The
//! generated side only ever sees these structures as opaque byte blobs of
//! the exported sizes, plus the few exported field offsets.

pub mod consumer;
pub mod error;
pub mod hash_table;
pub mod multi_thread;
pub mod sorter;
pub mod storage;
pub mod strings;
