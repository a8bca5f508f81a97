//! facetrack-pipeline — glue between the per-frame tracker and the
//! similarity index.
//!
//! Owns the frame loop contract: `Engine::update_tracks` runs one tracking
//! cycle synchronously, resolves identities for eligible tracks through the
//! matcher, and returns the resulting snapshot. Background maintenance
//! (cache sweeping) runs as a cancellable tokio task.

pub mod config;
pub mod engine;

pub use config::Config;
pub use engine::{Engine, EngineError};
