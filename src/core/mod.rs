//! Core ingestion layer
//!
//! Routing, publication and the pipeline that drives the parser.
//! Core updates the data layer; consumers read buffers and subscribe to the bus.

pub mod event_bus;
pub mod messages;
pub mod router;
pub mod state;

pub use event_bus::EventBus;
pub use messages::{IngestStats, MessageProcessor};
pub use state::GameState;
