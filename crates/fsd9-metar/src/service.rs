//! Weather cache and acquisition policy.
//!
//! In cron mode a background task sweeps every fetcher in order with
//! `fetch_bulk` and the first one that answers supplies the cache. In once
//! mode codes are fetched on request. With fallback enabled, a code the
//! active mode could not produce is retried through the other mode.
//!
//! Only well-formed station codes reach a fetcher. A cron sweep forgets
//! codes that nobody asked for since the previous sweep.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fsd9_core::packet::is_icao_code;
use fsd9_core::{FetchError, FetchMode, FetchPolicy, MetarRecord};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::fetcher::Fetcher;

/// What is known about one station.
#[derive(Debug, Clone, Default)]
pub struct CodeState {
    pub record: Option<MetarRecord>,
    /// Last time each fetcher was asked for this code
    pub attempts: HashMap<String, DateTime<Utc>>,
    /// Fetcher that failed this code in the latest sweep
    pub last_failed: Option<String>,
    pub pending_fallback: bool,
}

pub struct MetarService {
    policy: FetchPolicy,
    fetchers: Vec<Arc<dyn Fetcher>>,
    codes: DashMap<String, CodeState>,
    /// Codes swept in cron mode, flagged when requested since the last sweep
    interest: DashMap<String, bool>,
}

/// Upper-cased station code, or `None` if it is not one.
fn normalise(icao: &str) -> Option<String> {
    let code = icao.trim();
    is_icao_code(code).then(|| code.to_ascii_uppercase())
}

impl MetarService {
    /// Creates the service with the fetchers named in `policy.fetcher_order`,
    /// picked from `available`. Unknown ids are logged and skipped.
    pub fn new(policy: FetchPolicy, available: Vec<Arc<dyn Fetcher>>) -> Self {
        let mut fetchers = Vec::with_capacity(policy.fetcher_order.len());
        for id in &policy.fetcher_order {
            match available.iter().find(|f| f.id() == id) {
                Some(fetcher) => fetchers.push(fetcher.clone()),
                None => warn!(fetcher = %id, "No such METAR fetcher, skipping"),
            }
        }

        if fetchers.is_empty() {
            warn!("No METAR fetcher configured, weather requests will fail");
        }

        info!(
            mode = %policy.mode,
            fetchers = ?fetchers.iter().map(|f| f.id().to_string()).collect::<Vec<_>>(),
            fallback = policy.fallback_enabled,
            "METAR service configured"
        );

        Self {
            policy,
            fetchers,
            codes: DashMap::new(),
            interest: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Ids of the active fetchers, in order.
    pub fn fetcher_ids(&self) -> Vec<&str> {
        self.fetchers.iter().map(|f| f.id()).collect()
    }

    /// Current record for a code, fresh or not.
    pub fn cached(&self, icao: &str) -> Option<MetarRecord> {
        self.codes.get(&normalise(icao)?).and_then(|state| state.record.clone())
    }

    /// Snapshot of the bookkeeping for a code.
    pub fn code_state(&self, icao: &str) -> Option<CodeState> {
        self.codes.get(&normalise(icao)?).map(|state| state.clone())
    }

    /// Adds a code to the set swept in cron mode. Returns false if `icao`
    /// is not a station code.
    pub fn track(&self, icao: &str) -> bool {
        match normalise(icao) {
            Some(code) => {
                self.interest.insert(code, true);
                true
            }
            None => false,
        }
    }

    /// Number of codes the next sweep would consider.
    pub fn tracked(&self) -> usize {
        self.interest.len()
    }

    fn is_fresh(&self, record: &MetarRecord) -> bool {
        match (self.policy.mode, self.policy.once_max_age) {
            (FetchMode::Once, Some(max_age)) => record.is_younger_than(max_age),
            _ => true,
        }
    }

    fn fresh(&self, code: &str) -> Option<MetarRecord> {
        let state = self.codes.get(code)?;
        let record = state.record.as_ref()?;
        self.is_fresh(record).then(|| record.clone())
    }

    fn store(&self, record: MetarRecord) {
        let mut state = self.codes.entry(record.icao.clone()).or_default();
        state.pending_fallback = false;
        state.record = Some(record);
    }

    fn note_attempt(&self, code: &str, fetcher: &str) {
        self.codes
            .entry(code.to_string())
            .or_default()
            .attempts
            .insert(fetcher.to_string(), Utc::now());
    }

    async fn timed<T, F>(&self, fetcher: &str, fut: F) -> Result<T, FetchError>
    where
        F: Future<Output = Result<T, FetchError>>,
    {
        let result = match tokio::time::timeout(self.policy.fetch_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout {
                fetcher: fetcher.to_string(),
                timeout_secs: self.policy.fetch_timeout.as_secs(),
            }),
        };

        let outcome = if result.is_ok() { "success" } else { "failure" };
        metrics::counter!(
            "fsd9_metar_fetches_total",
            "fetcher" => fetcher.to_string(),
            "outcome" => outcome
        )
        .increment(1);

        result
    }

    /// Serves a weather request.
    ///
    /// Returns the cached record when it is fresh. Otherwise runs the
    /// active mode's path for this code and, when allowed, the fallback.
    /// `None` means no source had a report, or `icao` is not a station code.
    pub async fn request(&self, icao: &str) -> Option<MetarRecord> {
        let Some(code) = normalise(icao) else {
            debug!(icao = %icao, "Not a station code");
            return None;
        };

        if self.policy.mode == FetchMode::Cron {
            self.interest.insert(code.clone(), true);
        }

        if let Some(record) = self.fresh(&code) {
            return Some(record);
        }

        match self.policy.mode {
            FetchMode::Cron => {
                if !self.policy.fallback_enabled {
                    return None;
                }
                let exclude = self.fallback_exclusion(&code);
                self.once_path(&code, exclude.as_deref()).await
            }
            FetchMode::Once => {
                if let Some(record) = self.once_path(&code, None).await {
                    return Some(record);
                }
                if !self.policy.fallback_enabled {
                    return None;
                }
                debug!(icao = %code, "On-demand fetch failed, trying bulk path");
                self.cron_path(&code).await
            }
        }
    }

    fn fallback_exclusion(&self, code: &str) -> Option<String> {
        if !self.policy.skips_previous_fetcher() {
            return None;
        }
        self.codes.get(code).and_then(|state| state.last_failed.clone())
    }

    /// Tries `fetch` on each fetcher in order, skipping `exclude`.
    async fn once_path(&self, code: &str, exclude: Option<&str>) -> Option<MetarRecord> {
        for fetcher in self.fetchers.iter().filter(|f| Some(f.id()) != exclude) {
            self.note_attempt(code, fetcher.id());
            match self.timed(fetcher.id(), fetcher.fetch(code)).await {
                Ok(record) => {
                    debug!(icao = %code, fetcher = fetcher.id(), "Fetched METAR");
                    self.store(record.clone());
                    return Some(record);
                }
                Err(e) if e.is_transient() => {
                    warn!(icao = %code, fetcher = fetcher.id(), error = %e, "METAR fetch failed");
                }
                Err(e) => {
                    debug!(icao = %code, fetcher = fetcher.id(), error = %e, "METAR fetch failed");
                }
            }
        }
        None
    }

    /// Runs `fetch_bulk(&[code])` over the full order.
    async fn cron_path(&self, code: &str) -> Option<MetarRecord> {
        let codes = [code.to_string()];
        for fetcher in &self.fetchers {
            self.note_attempt(code, fetcher.id());
            match self.timed(fetcher.id(), fetcher.fetch_bulk(&codes)).await {
                Ok(records) => {
                    let mut found = None;
                    for record in records {
                        if record.icao == code {
                            found = Some(record.clone());
                        }
                        self.store(record);
                    }
                    if found.is_some() {
                        return found;
                    }
                }
                Err(e) => {
                    debug!(icao = %code, fetcher = fetcher.id(), error = %e, "Bulk METAR fetch failed");
                }
            }
        }
        None
    }

    /// One cron pass over the tracked codes, followed by the on-demand
    /// fallback for every code the pass missed.
    pub async fn sweep(&self) {
        self.forget_unrequested();
        let interest: Vec<String> = self.interest.iter().map(|code| code.key().clone()).collect();
        info!(tracked = interest.len(), "Fetching METAR");

        let mut supplier: Option<&str> = None;
        let mut last_tried: Option<&str> = None;
        let mut supplied: HashSet<String> = HashSet::new();

        for fetcher in &self.fetchers {
            last_tried = Some(fetcher.id());
            for code in &interest {
                self.note_attempt(code, fetcher.id());
            }

            match self.timed(fetcher.id(), fetcher.fetch_bulk(&interest)).await {
                Ok(records) => {
                    info!(fetcher = fetcher.id(), count = records.len(), "Fetched METAR");
                    for record in records {
                        supplied.insert(record.icao.clone());
                        self.store(record);
                        tokio::task::yield_now().await;
                    }
                    supplier = Some(fetcher.id());
                    break;
                }
                Err(e) => {
                    warn!(fetcher = fetcher.id(), error = %e, "METAR sweep failed");
                }
            }
        }

        if supplier.is_none() && !self.fetchers.is_empty() {
            warn!("No METAR was fetched, every fetcher failed");
        }

        let Some(failed_by) = supplier.or(last_tried) else {
            return;
        };

        let mut pending = Vec::new();
        for code in interest {
            let mut state = self.codes.entry(code.clone()).or_default();
            if supplier.is_some() && supplied.contains(&code) {
                state.last_failed = None;
                state.pending_fallback = false;
            } else {
                state.last_failed = Some(failed_by.to_string());
                state.pending_fallback = true;
                drop(state);
                pending.push(code);
            }
        }

        if !self.policy.fallback_enabled || pending.is_empty() {
            return;
        }

        debug!(count = pending.len(), "Running on-demand fallback for missed codes");
        for code in pending {
            let exclude = self.fallback_exclusion(&code);
            if self.once_path(&code, exclude.as_deref()).await.is_none() {
                debug!(icao = %code, "No fallback source had a report");
            }
        }
    }

    /// Drops codes not requested since the previous sweep and clears the
    /// flag on the rest.
    fn forget_unrequested(&self) {
        let before = self.interest.len();
        self.interest.retain(|_, requested| std::mem::replace(requested, false));
        self.codes.retain(|code, _| self.interest.contains_key(code));
        let dropped = before.saturating_sub(self.interest.len());
        if dropped > 0 {
            debug!(dropped, "Stopped tracking unrequested codes");
        }
    }

    /// Starts the periodic sweep. Returns `None` outside cron mode.
    pub fn spawn_cron(self: Arc<Self>) -> Option<JoinHandle<()>> {
        if self.policy.mode != FetchMode::Cron {
            return None;
        }

        let interval = self.policy.cron_interval;
        Some(tokio::spawn(async move {
            loop {
                self.sweep().await;
                tokio::time::sleep(interval).await;
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    type CallLog = Arc<Mutex<Vec<String>>>;

    /// Scripted fetcher. `single` lists the codes `fetch` knows; `bulk` is
    /// the sweep answer, `None` meaning the bulk call fails.
    struct MockFetcher {
        id: String,
        single: Vec<String>,
        bulk: Option<Vec<String>>,
        delay: Option<Duration>,
        log: CallLog,
    }

    impl MockFetcher {
        fn new(id: &str, single: &[&str], bulk: Option<&[&str]>, log: &CallLog) -> Arc<dyn Fetcher> {
            Arc::new(Self {
                id: id.to_string(),
                single: single.iter().map(|s| s.to_string()).collect(),
                bulk: bulk.map(|codes| codes.iter().map(|s| s.to_string()).collect()),
                delay: None,
                log: log.clone(),
            })
        }

        fn report(&self, icao: &str) -> MetarRecord {
            MetarRecord::new(icao, format!("{} 121225Z 24012KT", icao), &self.id)
        }
    }

    #[async_trait]
    impl Fetcher for MockFetcher {
        fn id(&self) -> &str {
            &self.id
        }

        async fn fetch(&self, icao: &str) -> Result<MetarRecord, FetchError> {
            self.log.lock().push(format!("{}:fetch:{}", self.id, icao));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.single.iter().any(|c| c == icao) {
                Ok(self.report(icao))
            } else {
                Err(FetchError::no_data(&self.id, icao))
            }
        }

        async fn fetch_bulk(&self, _codes: &[String]) -> Result<Vec<MetarRecord>, FetchError> {
            self.log.lock().push(format!("{}:bulk", self.id));
            match &self.bulk {
                Some(codes) => Ok(codes.iter().map(|c| self.report(c)).collect()),
                None => Err(FetchError::request(&self.id, "connection refused")),
            }
        }
    }

    fn policy(mode: FetchMode, skip: bool) -> FetchPolicy {
        FetchPolicy {
            mode,
            fetcher_order: vec!["F1".to_string(), "F2".to_string()],
            fallback_enabled: true,
            skip_previous_fetcher_on_fallback: skip,
            cron_interval: Duration::from_secs(3600),
            fetch_timeout: Duration::from_secs(5),
            once_max_age: None,
        }
    }

    #[tokio::test]
    async fn test_fresh_code_hits_no_fetcher() {
        let log = CallLog::default();
        let service = MetarService::new(
            policy(FetchMode::Once, false),
            vec![MockFetcher::new("F1", &["EHAM"], None, &log)],
        );

        let first = service.request("eham").await.unwrap();
        assert_eq!(first.icao, "EHAM");
        assert_eq!(log.lock().len(), 1);

        for _ in 0..5 {
            assert_eq!(service.request("EHAM").await.unwrap(), first);
        }
        assert_eq!(log.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_fallback_skips_failing_fetcher() {
        let log = CallLog::default();
        let service = MetarService::new(
            policy(FetchMode::Cron, true),
            vec![
                MockFetcher::new("F1", &["ZZZZ"], Some(&["EHAM"]), &log),
                MockFetcher::new("F2", &["ZZZZ"], Some(&["EHAM", "ZZZZ"]), &log),
            ],
        );
        service.track("EHAM");
        service.track("ZZZZ");

        service.sweep().await;

        assert_eq!(*log.lock(), vec!["F1:bulk", "F2:fetch:ZZZZ"]);
        assert_eq!(service.cached("ZZZZ").unwrap().source, "F2");
        assert_eq!(service.cached("EHAM").unwrap().source, "F1");
        assert!(!service.code_state("ZZZZ").unwrap().pending_fallback);
    }

    #[tokio::test]
    async fn test_sweep_fallback_without_skip_retries_full_order() {
        let log = CallLog::default();
        let service = MetarService::new(
            policy(FetchMode::Cron, false),
            vec![
                MockFetcher::new("F1", &[], Some(&["EHAM"]), &log),
                MockFetcher::new("F2", &["ZZZZ"], None, &log),
            ],
        );
        service.track("ZZZZ");

        service.sweep().await;

        assert_eq!(*log.lock(), vec!["F1:bulk", "F1:fetch:ZZZZ", "F2:fetch:ZZZZ"]);
        assert_eq!(service.cached("ZZZZ").unwrap().source, "F2");
    }

    #[tokio::test]
    async fn test_all_bulk_fail_blames_last_fetcher() {
        let log = CallLog::default();
        let service = MetarService::new(
            policy(FetchMode::Cron, true),
            vec![
                MockFetcher::new("F1", &["EHAM"], None, &log),
                MockFetcher::new("F2", &["EHAM"], None, &log),
            ],
        );
        service.track("EHAM");

        service.sweep().await;

        assert_eq!(*log.lock(), vec!["F1:bulk", "F2:bulk", "F1:fetch:EHAM"]);
        let state = service.code_state("EHAM").unwrap();
        assert_eq!(state.last_failed.as_deref(), Some("F2"));
        assert!(state.attempts.contains_key("F1"));
        assert!(state.attempts.contains_key("F2"));
        assert!(service.cached("EHAM").is_some());
    }

    #[tokio::test]
    async fn test_cron_request_miss_uses_once_path() {
        let log = CallLog::default();
        let service = MetarService::new(
            policy(FetchMode::Cron, true),
            vec![
                MockFetcher::new("F1", &[], Some(&[]), &log),
                MockFetcher::new("F2", &["LFPG"], None, &log),
            ],
        );

        let record = service.request("LFPG").await.unwrap();
        assert_eq!(record.source, "F2");
        assert_eq!(*log.lock(), vec!["F1:fetch:LFPG", "F2:fetch:LFPG"]);
    }

    #[tokio::test]
    async fn test_cron_without_fallback_only_tracks() {
        let log = CallLog::default();
        let mut p = policy(FetchMode::Cron, true);
        p.fallback_enabled = false;
        let service = MetarService::new(p, vec![MockFetcher::new("F1", &["LFPG"], Some(&["LFPG"]), &log)]);

        assert!(service.request("LFPG").await.is_none());
        assert!(log.lock().is_empty());

        service.sweep().await;
        assert!(service.request("LFPG").await.is_some());
    }

    #[tokio::test]
    async fn test_once_failure_falls_back_to_bulk() {
        let log = CallLog::default();
        let service = MetarService::new(
            policy(FetchMode::Once, true),
            vec![
                MockFetcher::new("F1", &[], None, &log),
                MockFetcher::new("F2", &[], Some(&["KJFK"]), &log),
            ],
        );

        let record = service.request("KJFK").await.unwrap();
        assert_eq!(record.source, "F2");
        assert_eq!(
            *log.lock(),
            vec!["F1:fetch:KJFK", "F2:fetch:KJFK", "F1:bulk", "F2:bulk"]
        );
    }

    #[tokio::test]
    async fn test_unavailable_everywhere() {
        let log = CallLog::default();
        let service = MetarService::new(
            policy(FetchMode::Once, true),
            vec![MockFetcher::new("F1", &[], None, &log)],
        );
        assert!(service.request("ZZZZ").await.is_none());
        assert!(service.request("").await.is_none());
    }

    #[tokio::test]
    async fn test_once_max_age_expires_record() {
        let log = CallLog::default();
        let mut p = policy(FetchMode::Once, false);
        p.once_max_age = Some(Duration::from_millis(20));
        let service = MetarService::new(p, vec![MockFetcher::new("F1", &["EHAM"], None, &log)]);

        service.request("EHAM").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        service.request("EHAM").await.unwrap();
        assert_eq!(log.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_slow_fetcher_times_out() {
        let log = CallLog::default();
        let mut p = policy(FetchMode::Once, false);
        p.fetch_timeout = Duration::from_millis(50);
        let slow: Arc<dyn Fetcher> = Arc::new(MockFetcher {
            id: "F1".to_string(),
            single: vec!["EHAM".to_string()],
            bulk: None,
            delay: Some(Duration::from_secs(5)),
            log: log.clone(),
        });
        let service = MetarService::new(p, vec![slow, MockFetcher::new("F2", &["EHAM"], None, &log)]);

        let record = service.request("EHAM").await.unwrap();
        assert_eq!(record.source, "F2");
    }

    #[tokio::test]
    async fn test_malformed_code_reaches_no_fetcher() {
        let log = CallLog::default();
        let service = MetarService::new(
            policy(FetchMode::Cron, false),
            vec![MockFetcher::new("F1", &["EHAM"], Some(&["EHAM"]), &log)],
        );

        for junk in ["../../x?y=1", "EHA", "EHAMX", "EH M", "", "E/AM"] {
            assert!(service.request(junk).await.is_none());
            assert!(!service.track(junk));
        }
        assert!(log.lock().is_empty());
        assert_eq!(service.tracked(), 0);
        assert!(service.code_state("../../x?y=1").is_none());
    }

    #[tokio::test]
    async fn test_unrequested_codes_are_forgotten() {
        let log = CallLog::default();
        let service = MetarService::new(
            policy(FetchMode::Cron, false),
            vec![MockFetcher::new("F1", &[], Some(&["EHAM"]), &log)],
        );
        service.track("EHAM");
        service.track("LFPG");

        service.sweep().await;
        assert_eq!(service.tracked(), 2);
        assert!(service.code_state("LFPG").unwrap().pending_fallback);

        // Only EHAM is asked for during the next cycle
        assert!(service.request("EHAM").await.is_some());
        service.sweep().await;
        assert_eq!(service.tracked(), 1);
        assert!(service.code_state("LFPG").is_none());
        assert!(service.cached("EHAM").is_some());

        service.sweep().await;
        assert_eq!(service.tracked(), 0);
    }

    #[test]
    fn test_unknown_fetcher_ids_skipped() {
        let log = CallLog::default();
        let mut p = policy(FetchMode::Cron, true);
        p.fetcher_order = vec!["MISSING".to_string(), "F1".to_string()];
        let service = MetarService::new(p, vec![MockFetcher::new("F1", &[], None, &log)]);
        assert_eq!(service.fetcher_ids(), vec!["F1"]);
    }
}
