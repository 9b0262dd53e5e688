//! # fsd9 METAR
//!
//! Weather reports for the ACARS and weather commands. A `MetarService`
//! owns the cache and the cron/once acquisition policy; `Fetcher`s adapt
//! individual sources. NOAA and AWC fetchers ship with the crate and further
//! fetchers can be handed to the service at boot.

pub mod awc;
pub mod fetcher;
pub mod noaa;
pub mod service;

use std::sync::Arc;

pub use awc::AwcFetcher;
pub use fetcher::Fetcher;
pub use noaa::NoaaFetcher;
pub use service::{CodeState, MetarService};

/// Fetchers available without extra configuration.
pub fn builtin_fetchers() -> Vec<Arc<dyn Fetcher>> {
    vec![Arc::new(NoaaFetcher::new()), Arc::new(AwcFetcher::new())]
}
