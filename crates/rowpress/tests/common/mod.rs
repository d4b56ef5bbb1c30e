//! Shared test utilities for rowpress integration tests.
//!
//! - `TestEngine`: an engine over an in-memory database and a temp store
//! - fakes for the renderer, the dispatcher and the store
//! - row builders

pub mod builders;
pub mod fakes;
pub mod harness;

pub use builders::*;
pub use fakes::{Gate, RecordingDispatcher, ScriptedRenderer, TrapStore};
pub use harness::{drain_events, TestEngine};
