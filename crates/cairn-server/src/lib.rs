//! Cairn Server
//!
//! Host runtime for `cairn-core`: concrete directory backends, process
//! observability and the HTTP API.

pub mod api;
pub mod backends;
pub mod membership;
pub mod observability;
pub mod version;
