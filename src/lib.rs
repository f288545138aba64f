//! Offline-first synchronization and caching engine for a paginated social
//! feed.
//!
//! The cache store serves the last known feed instantly, page fetches and
//! push events merge into it by freshness, and user mutations apply
//! optimistically and replay from a durable queue once the network is back.

pub mod api;
pub mod config;
pub mod model;
pub mod network;
pub mod prefetch;
pub mod queue;
pub mod realtime;
pub mod storage;
pub mod sync;
pub mod util;

#[cfg(test)]
mod test_support;
