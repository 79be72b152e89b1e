//! Mediarelay - Upload, transcode and relay service
//!
//! Hexagonal Architecture:
//! - domain/: Pure types (stream bridge, upload session, media, errors)
//! - ports/: Trait definitions (transcoder, upload sink)
//! - adapters/: Concrete implementations (ffmpeg process, HTTP in and out)
//! - application/: Generic services (multipart ingress, pipeline orchestrator)
//! - config: Environment configuration
//!
//! An upload is never held in memory or on disk as a whole: the request body
//! streams into the transcoder's stdin while its output streams to the remote
//! endpoint, each hop bounded by a stream bridge.

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;

// Re-exports for convenience
pub use application::orchestrator::{PipelineService, PipelineSettings};
pub use config::RelayConfig;
