//! Domain layer - Pure pipeline types.

pub mod bridge;
pub mod error;
pub mod media;
pub mod session;
