//! Everything that speaks the object-store protocol: request signing, the
//! XML bodies, and the per-connection HTTP request engine.

pub mod client;
pub mod sign;
pub mod xml;

pub use client::{Connection, Endpoint, HttpMethod, S3Response};
