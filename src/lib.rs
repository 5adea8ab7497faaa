//! Boardgate - launches log-directory dashboards on demand and proxies them
//!
//! This library provides a gateway that:
//! - Starts one dashboard backend per log directory, on a free local port
//! - Adapts the backend command line to the installed backend version
//! - Tracks instances by a short numeric name and by directory
//! - Streams HTTP traffic under `/proxy/{name}/` to the owning backend
//! - Exposes a JSON control API under `/api/instances`

pub mod api;
pub mod config;
pub mod error;
pub mod launcher;
pub mod port;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod version;
