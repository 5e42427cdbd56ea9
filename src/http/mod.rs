//! HTTP server module
//!
//! A thin adapter over the pipeline interfaces:
//! - Session lifecycle (start, stop)
//! - Status, progress, and playback position
//! - Segment and manifest delivery
//! - Health, version, and debug endpoints

pub mod handlers;
pub mod routes;

pub use routes::create_router;
