//! Buffer primitives backing the receive pipeline.
mod buffer;

pub use buffer::{ClipInfo, PacketBuf};
