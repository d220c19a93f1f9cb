//! FastCGI responder client and backend process supervision.

pub mod client;
pub mod record;
pub mod supervisor;

pub use client::{FastCgiAddress, FastCgiTarget};
pub use supervisor::Supervisor;
