mod monitor;

pub use monitor::{NetworkMonitor, ProbeConfig, ProbeHandle};

use std::future::Future;

use crate::api::ApiError;

/// A lightweight round trip used to grade connection quality.
pub trait Prober: Send + Sync + 'static {
    fn probe(&self) -> impl Future<Output = Result<(), ApiError>> + Send;
}
