//! Structured control flow and small data structures over raw blocks.

pub mod bitmap;
pub mod if_block;
pub mod loop_block;
pub mod vector;
pub mod vectorized_loop;

pub use bitmap::{BitmapReader, BitmapWriter};
pub use if_block::If;
pub use loop_block::Loop;
pub use vector::Vector;
pub use vectorized_loop::{Range, VectorizedLoop};
