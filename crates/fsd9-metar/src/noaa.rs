//! NOAA text feeds at tgftp.nws.noaa.gov.
//!
//! Station files hold two lines: the observation time (`YYYY/MM/DD HH:MM`)
//! and the raw report. Cycle files concatenate such blocks for every station
//! reported in one UTC hour, separated by blank lines.

use async_trait::async_trait;
use chrono::{Timelike, Utc};
use fsd9_core::{FetchError, MetarRecord};
use reqwest::{Client, StatusCode};

use crate::fetcher::{split_report, Fetcher};

pub const NOAA_ID: &str = "NOAA";
pub const NOAA_BASE_URL: &str = "https://tgftp.nws.noaa.gov/data/observations/metar";

pub struct NoaaFetcher {
    client: Client,
    base_url: String,
}

impl NoaaFetcher {
    pub fn new() -> Self {
        Self::with_base_url(NOAA_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn get_text(&self, url: &str, icao: &str) -> Result<String, FetchError> {
        tracing::debug!(fetcher = NOAA_ID, url = %url, "Requesting METAR");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::request(NOAA_ID, e.to_string()))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(FetchError::no_data(NOAA_ID, icao)),
            status => {
                return Err(FetchError::Status {
                    fetcher: NOAA_ID.to_string(),
                    status: status.as_u16(),
                })
            }
        }

        response
            .text()
            .await
            .map_err(|e| FetchError::request(NOAA_ID, e.to_string()))
    }
}

impl Default for NoaaFetcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses one station block. The time line is not needed, only its
/// presence.
pub(crate) fn parse_block(block: &str) -> Option<MetarRecord> {
    let mut lines = block.lines().map(str::trim).filter(|l| !l.is_empty());
    let _observed = lines.next()?;
    let (station, report) = split_report(lines.next()?)?;
    Some(MetarRecord::new(station, report, NOAA_ID))
}

/// Parses a cycle file into records.
pub(crate) fn parse_cycle(body: &str) -> Vec<MetarRecord> {
    body.replace("\r\n", "\n")
        .split("\n\n")
        .filter_map(parse_block)
        .collect()
}

#[async_trait]
impl Fetcher for NoaaFetcher {
    fn id(&self) -> &str {
        NOAA_ID
    }

    async fn fetch(&self, icao: &str) -> Result<MetarRecord, FetchError> {
        let url = format!("{}/stations/{}.TXT", self.base_url, icao);
        let body = self.get_text(&url, icao).await?;

        let record = parse_block(&body)
            .ok_or_else(|| FetchError::malformed(NOAA_ID, format!("unexpected station file for {}", icao)))?;

        if record.icao != icao {
            return Err(FetchError::malformed(
                NOAA_ID,
                format!("asked for {}, got {}", icao, record.icao),
            ));
        }
        Ok(record)
    }

    /// Downloads the current hour's cycle file. Returns every station in it,
    /// not only `codes`.
    async fn fetch_bulk(&self, _codes: &[String]) -> Result<Vec<MetarRecord>, FetchError> {
        let url = format!("{}/cycles/{:02}Z.TXT", self.base_url, Utc::now().hour());
        let body = self.get_text(&url, "*").await?;

        let records = parse_cycle(&body);
        if records.is_empty() {
            return Err(FetchError::malformed(NOAA_ID, "cycle file holds no reports"));
        }
        Ok(records)
    }
}
