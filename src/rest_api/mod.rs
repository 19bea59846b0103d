//! Read-only REST surface for observing managed endpoints.
//!
//! This is not the deployment-request surface (that lives outside this
//! crate); it exposes health and the manager's view of its endpoints.

mod dto;
mod handlers;
mod server;

pub use dto::*;
pub use server::run_server;
