use async_trait::async_trait;
use fsd9_core::packet::is_icao_code;
use fsd9_core::{FetchError, MetarRecord};

/// A single weather source.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Id used in `metar.fetchers` and in records' `source`.
    fn id(&self) -> &str;

    /// Fetches the current report for one station.
    async fn fetch(&self, icao: &str) -> Result<MetarRecord, FetchError>;

    /// Fetches reports for a sweep.
    ///
    /// Sources with a bulk feed may return more stations than asked for.
    /// The default asks for each code in turn and only fails when codes were
    /// requested and none of them came back.
    async fn fetch_bulk(&self, codes: &[String]) -> Result<Vec<MetarRecord>, FetchError> {
        let mut records = Vec::with_capacity(codes.len());
        let mut last_error = None;

        for code in codes {
            match self.fetch(code).await {
                Ok(record) => records.push(record),
                Err(e) => last_error = Some(e),
            }
        }

        match last_error {
            Some(e) if records.is_empty() => Err(e),
            _ => Ok(records),
        }
    }
}

/// Splits a raw report line into station and report, dropping a leading
/// `METAR` or `SPECI` marker.
pub(crate) fn split_report(line: &str) -> Option<(&str, &str)> {
    let mut report = line.trim();
    for marker in ["METAR ", "SPECI "] {
        if let Some(rest) = report.strip_prefix(marker) {
            report = rest.trim_start();
        }
    }
    let station = report.split_whitespace().next()?;
    is_icao_code(station).then_some((station, report))
}
