//! Ports - Traits at the pipeline's external seams.

pub mod transcoder;
pub mod upload;
