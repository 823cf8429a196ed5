//! Network boundary: request/response types, the `Network` seam, and the
//! TaskPilot REST endpoints built on top of it.

pub mod api;
pub mod client;
#[cfg(test)]
pub mod mock;
pub mod types;

pub use api::RemoteApi;
pub use client::{HttpClient, Network, NetworkError};
pub use types::{Request, Response, CONTENT_TYPE_JSON};
