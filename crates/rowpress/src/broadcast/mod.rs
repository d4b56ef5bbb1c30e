//! Broadcasting of batch progress events.
//!
//! Any front end (the CLI, a server) can subscribe; nothing in the engine
//! depends on an event being received.

pub mod batch_events;

pub use batch_events::{BatchEvent, BatchEventBroadcaster, BatchEventKind};
