//! Application layer - The upload pipeline, generic over its ports.

pub mod ingress;
pub mod orchestrator;
