//! Shared building blocks for the Herald workspace: configuration, connection
//! pools, the error taxonomy and the domain types every crate passes around.

pub mod config;
pub mod db;
pub mod error;
pub mod redis_pool;
pub mod types;
