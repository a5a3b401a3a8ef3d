//! Weather API fetch client with bounded retry and backoff.

pub mod client;
pub mod error;
pub mod retry;
pub mod types;

use std::future::Future;

use tokio::time::Instant;
use wxpipe_core::{CityTarget, RawReading};

pub use client::WeatherClient;
pub use error::{ClientError, FetchError, FetchFailure};
pub use retry::RetryPolicy;

/// A reading together with the number of attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub reading: RawReading,
    pub attempts: u32,
}

/// Something that can produce one reading per city.
///
/// [`WeatherClient`] is the production implementation; the orchestrator is
/// generic over this trait so tests can script outcomes per city.
pub trait WeatherSource: Send + Sync {
    /// Fetches the current reading for `target`. No attempt is started once
    /// `deadline` has passed.
    fn fetch(
        &self,
        target: &CityTarget,
        deadline: Option<Instant>,
    ) -> impl Future<Output = Result<Fetched, FetchError>> + Send;
}
