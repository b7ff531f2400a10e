//! Data layer - pure state without I/O
//!
//! Elements produced by the parser and the per-channel buffers they are
//! stored in. Nothing here knows about the network or the event bus.

pub mod buffer;
pub mod element;

pub use buffer::{BufferManager, MAIN_CHANNEL};
pub use element::{Attributes, Element, ElementBuilder};
