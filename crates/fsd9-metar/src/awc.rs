//! Aviation Weather Center data API.

use async_trait::async_trait;
use fsd9_core::{FetchError, MetarRecord};
use reqwest::{Client, StatusCode};

use crate::fetcher::{split_report, Fetcher};

pub const AWC_ID: &str = "AWC";
pub const AWC_BASE_URL: &str = "https://aviationweather.gov/api/data/metar";

pub struct AwcFetcher {
    client: Client,
    base_url: String,
}

impl AwcFetcher {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: AWC_BASE_URL.to_string(),
        }
    }
}

impl Default for AwcFetcher {
    fn default() -> Self {
        Self::new()
    }
}

/// One raw report per line.
pub(crate) fn parse_raw(body: &str) -> Vec<MetarRecord> {
    body.lines()
        .filter_map(split_report)
        .map(|(station, report)| MetarRecord::new(station, report, AWC_ID))
        .collect()
}

#[async_trait]
impl Fetcher for AwcFetcher {
    fn id(&self) -> &str {
        AWC_ID
    }

    async fn fetch(&self, icao: &str) -> Result<MetarRecord, FetchError> {
        self.fetch_bulk(&[icao.to_string()])
            .await?
            .into_iter()
            .find(|record| record.icao == icao)
            .ok_or_else(|| FetchError::no_data(AWC_ID, icao))
    }

    async fn fetch_bulk(&self, codes: &[String]) -> Result<Vec<MetarRecord>, FetchError> {
        if codes.is_empty() {
            return Ok(Vec::new());
        }

        let ids = codes.join(",");
        tracing::debug!(fetcher = AWC_ID, ids = %ids, "Requesting METAR");

        let response = self
            .client
            .get(&self.base_url)
            .query(&[("ids", ids.as_str()), ("format", "raw")])
            .send()
            .await
            .map_err(|e| FetchError::request(AWC_ID, e.to_string()))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NO_CONTENT => return Err(FetchError::no_data(AWC_ID, ids)),
            status => {
                return Err(FetchError::Status {
                    fetcher: AWC_ID.to_string(),
                    status: status.as_u16(),
                })
            }
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::request(AWC_ID, e.to_string()))?;

        let records = parse_raw(&body);
        if records.is_empty() {
            return Err(FetchError::no_data(AWC_ID, ids));
        }
        Ok(records)
    }
}
