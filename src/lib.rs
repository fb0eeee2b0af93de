//! Disk-backed HTTP response cache for axum services, plus the pieces needed
//! to run it as a caching reverse proxy.

pub mod cache;
pub mod config;
pub mod infra;
