//! HTTP on both ends of the pipeline: the inbound upload endpoint and the
//! outbound relay to the remote service.

pub mod egress;
pub mod inbound;

pub use egress::HttpUploader;
pub use inbound::router;
