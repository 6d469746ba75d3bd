//! Snapshot directory storage + HTTP fetch utilities.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use gripe_core::{Snapshot, SnapshotIndex};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gripe-storage";

pub const INDEX_FILE_NAME: &str = "index.json";

const DATE_STAMP_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub file_name: String,
    pub absolute_path: PathBuf,
    pub sha256: String,
    pub byte_size: usize,
    pub item_count: usize,
}

/// Parts of a `<source>_<topic_id>_<YYYY-MM-DD>.json` file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFileName {
    pub source: String,
    pub topic_id: String,
    pub date: NaiveDate,
}

pub fn snapshot_file_name(source: &str, topic_id: &str, date: NaiveDate) -> String {
    format!("{source}_{topic_id}_{}.json", date.format(DATE_STAMP_FORMAT))
}

/// Returns `None` for anything that is not a snapshot file name; those files are never pruned.
pub fn parse_snapshot_file_name(file_name: &str) -> Option<SnapshotFileName> {
    let stem = file_name.strip_suffix(".json")?;
    let (head, stamp) = stem.rsplit_once('_')?;
    if !is_date_stamp(stamp) {
        return None;
    }
    let date = NaiveDate::parse_from_str(stamp, DATE_STAMP_FORMAT).ok()?;
    let (source, topic_id) = head.split_once('_')?;
    if source.is_empty() || topic_id.is_empty() {
        return None;
    }
    Some(SnapshotFileName {
        source: source.to_string(),
        topic_id: topic_id.to_string(),
        date,
    })
}

fn is_date_stamp(stamp: &str) -> bool {
    let bytes = stamp.as_bytes();
    bytes.len() == 10
        && bytes.iter().enumerate().all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        })
}

/// Fractional days between UTC midnight of `date` and `now`.
pub fn snapshot_age_days(date: NaiveDate, now: DateTime<Utc>) -> Option<f64> {
    let midnight = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?);
    Some((now - midnight).num_milliseconds() as f64 / 86_400_000.0)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub kept: BTreeSet<String>,
    pub pruned: Vec<String>,
    pub delete_failures: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE_NAME)
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub async fn ensure_root(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating snapshot directory {}", self.root.display()))
    }

    /// Write `snapshot` as `<source>_<topic_id>_<fetched_at date>.json`, replacing a same-day file.
    pub async fn write_snapshot(&self, snapshot: &Snapshot) -> anyhow::Result<StoredSnapshot> {
        let file_name = snapshot_file_name(
            &snapshot.source,
            &snapshot.topic_id,
            snapshot.fetched_at.date_naive(),
        );
        if file_name.contains(['/', '\\']) {
            anyhow::bail!("snapshot name {file_name:?} is not a plain file name");
        }
        let absolute_path = self.root.join(&file_name);
        let bytes = serde_json::to_vec_pretty(snapshot)
            .with_context(|| format!("serializing snapshot {file_name}"))?;
        self.write_atomic(&absolute_path, &bytes).await?;

        Ok(StoredSnapshot {
            file_name,
            absolute_path,
            sha256: Self::sha256_hex(&bytes),
            byte_size: bytes.len(),
            item_count: snapshot.items.len(),
        })
    }

    /// Missing or unreadable index files yield an empty index.
    pub async fn load_index(&self) -> SnapshotIndex {
        let path = self.index_path();
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return SnapshotIndex::default();
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unreadable index; starting empty");
                return SnapshotIndex::default();
            }
        };
        match serde_json::from_str(&text) {
            Ok(index) => index,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unparseable index; starting empty");
                SnapshotIndex::default()
            }
        }
    }

    pub async fn persist_index(&self, index: &SnapshotIndex) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(index).context("serializing snapshot index")?;
        self.write_atomic(&self.index_path(), &bytes).await
    }

    /// Delete snapshot files older than `retain_days` and drop vanished names from `index.files`.
    ///
    /// Failed deletes are logged; the file still leaves the kept set. `index.latest` is not touched.
    pub async fn sweep(
        &self,
        index: &mut SnapshotIndex,
        retain_days: u32,
        now: DateTime<Utc>,
    ) -> anyhow::Result<SweepReport> {
        self.sweep_with(index, retain_days, now, fs::remove_file)
            .await
    }

    async fn sweep_with<F, Fut>(
        &self,
        index: &mut SnapshotIndex,
        retain_days: u32,
        now: DateTime<Utc>,
        mut remove: F,
    ) -> anyhow::Result<SweepReport>
    where
        F: FnMut(PathBuf) -> Fut,
        Fut: Future<Output = std::io::Result<()>>,
    {
        let mut report = SweepReport::default();
        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("listing {}", self.root.display()))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", self.root.display()))?
        {
            let file_name = entry.file_name().to_string_lossy().to_string();
            let is_file = entry.file_type().await.map(|ft| ft.is_file()).unwrap_or(false);
            let expired = is_file
                && parse_snapshot_file_name(&file_name)
                    .and_then(|parsed| snapshot_age_days(parsed.date, now))
                    .is_some_and(|age| age > f64::from(retain_days));

            if !expired {
                report.kept.insert(file_name);
                continue;
            }

            match remove(entry.path()).await {
                Ok(()) => {
                    info!(file = %file_name, "pruned expired snapshot");
                    report.pruned.push(file_name);
                }
                Err(err) => {
                    warn!(file = %file_name, error = %err, "failed to prune expired snapshot");
                    report.delete_failures.push(file_name);
                }
            }
        }

        index.retain_files(|f| report.kept.contains(f));
        Ok(report)
    }

    async fn write_atomic(&self, absolute_path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        let parent = absolute_path.parent().unwrap_or(self.root.as_path());
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    /// Pause after every call, successful or not.
    pub courtesy_delay: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            courtesy_delay: Duration::from_millis(200),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
    courtesy_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    /// Final URL without its query string.
    pub endpoint: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(reqwest::Error),
    #[error("http status {status} for {endpoint}")]
    HttpStatus {
        status: u16,
        endpoint: String,
        body: String,
    },
    #[error("invalid json from {endpoint}: {source}")]
    Decode {
        endpoint: String,
        source: serde_json::Error,
    },
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        // Query strings carry credentials.
        FetchError::Request(err.without_url())
    }
}

const LOGGED_BODY_CHARS: usize = 512;

fn endpoint_of(url: &reqwest::Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
            courtesy_delay: config.courtesy_delay,
        })
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let response = self.fetch_bytes(run_id, source_id, url, query).await?;
        serde_json::from_slice(&response.body).map_err(|source| FetchError::Decode {
            endpoint: response.endpoint,
            source,
        })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id);
        let result = self.fetch_with_retries(url, query).instrument(span).await;
        if !self.courtesy_delay.is_zero() {
            tokio::time::sleep(self.courtesy_delay).await;
        }
        result
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let resp_result = self
                .client
                .get(url)
                .query(query)
                .header(reqwest::header::ACCEPT, "application/json")
                .send()
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let endpoint = endpoint_of(resp.url());

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            endpoint,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp
                        .text()
                        .await
                        .unwrap_or_default()
                        .chars()
                        .take(LOGGED_BODY_CHARS)
                        .collect();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        endpoint,
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(err.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gripe_core::FilteredItem;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn ts(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .expect("ts")
            .with_timezone(&Utc)
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("date")
    }

    fn snapshot(topic_id: &str, fetched_at: DateTime<Utc>, texts: &[&str]) -> Snapshot {
        Snapshot {
            source: "youtube".into(),
            topic_id: topic_id.into(),
            fetched_at,
            items: texts
                .iter()
                .enumerate()
                .map(|(i, t)| FilteredItem {
                    id: format!("vid:{i}"),
                    text: t.to_string(),
                    likes: Some(i as i64),
                    timestamp: None,
                    lang: "en".into(),
                    extra: BTreeMap::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn snapshot_hashing_is_stable() {
        let hash = SnapshotStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn file_names_parse_back_with_underscored_topics() {
        let name = snapshot_file_name("youtube", "travel_mugs", date("2026-10-16"));
        assert_eq!(name, "youtube_travel_mugs_2026-10-16.json");
        assert_eq!(
            parse_snapshot_file_name(&name),
            Some(SnapshotFileName {
                source: "youtube".into(),
                topic_id: "travel_mugs".into(),
                date: date("2026-10-16"),
            })
        );
    }

    #[test]
    fn foreign_file_names_are_not_snapshots() {
        for name in [
            "index.json",
            "notes.txt",
            "youtube_2026-10-16.json",
            "youtube_mugs_2026-1-16.json",
            "youtube_mugs_2026-13-40.json",
            "youtube_mugs_latest.json",
            "_mugs_2026-10-16.json",
        ] {
            assert_eq!(parse_snapshot_file_name(name), None, "{name}");
        }
    }

    #[tokio::test]
    async fn same_day_writes_replace_the_file() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());

        let first = store
            .write_snapshot(&snapshot("mugs", ts("2026-10-16T08:00:00Z"), &["one"]))
            .await
            .expect("first write");
        let second = store
            .write_snapshot(&snapshot("mugs", ts("2026-10-16T20:00:00Z"), &["one", "two"]))
            .await
            .expect("second write");

        assert_eq!(first.file_name, "youtube_mugs_2026-10-16.json");
        assert_eq!(first.file_name, second.file_name);
        assert_ne!(first.sha256, second.sha256);

        let on_disk: Snapshot =
            serde_json::from_slice(&std::fs::read(&second.absolute_path).unwrap()).unwrap();
        assert_eq!(on_disk.items.len(), 2);
        assert_eq!(on_disk.fetched_at, ts("2026-10-16T20:00:00Z"));

        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn topic_ids_cannot_escape_the_snapshot_directory() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path().join("data"));
        let err = store
            .write_snapshot(&snapshot("../mugs", ts("2026-10-16T08:00:00Z"), &["one"]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not a plain file name"));
        assert!(!dir.path().join("youtube_..").exists());
    }

    #[tokio::test]
    async fn missing_or_corrupt_index_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        assert_eq!(store.load_index().await, SnapshotIndex::default());

        std::fs::write(store.index_path(), "{ not json").unwrap();
        assert_eq!(store.load_index().await, SnapshotIndex::default());
    }

    #[tokio::test]
    async fn index_round_trips_through_disk() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let mut index = SnapshotIndex::default();
        index.record_snapshot("mugs", "youtube_mugs_2026-10-16.json");

        store.persist_index(&index).await.expect("persist");
        assert_eq!(store.load_index().await, index);
    }

    #[tokio::test]
    async fn sweep_prunes_only_expired_snapshots() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let now = ts("2026-10-16T12:00:00Z");

        let old = "youtube_mugs_2026-09-26.json";
        let fresh = "youtube_mugs_2026-10-11.json";
        for name in [old, fresh, "README.md", "cpsc_misc_notes.json"] {
            std::fs::write(dir.path().join(name), "{}").unwrap();
        }

        let mut index = SnapshotIndex::default();
        index.record_snapshot("mugs", old);
        index.record_snapshot("mugs", fresh);
        index.files.push("youtube_gone_2026-10-15.json".into());

        let report = store.sweep(&mut index, 14, now).await.expect("sweep");

        assert_eq!(report.pruned, vec![old.to_string()]);
        assert!(report.delete_failures.is_empty());
        assert!(!dir.path().join(old).exists());
        assert!(dir.path().join(fresh).exists());
        assert!(dir.path().join("README.md").exists());
        assert!(dir.path().join("cpsc_misc_notes.json").exists());
        assert_eq!(index.files, vec![fresh.to_string()]);
        assert_eq!(index.latest_for("mugs"), Some(fresh));
    }

    #[tokio::test]
    async fn sweep_leaves_latest_pointing_at_pruned_file() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let old = "cpsc_kettles_2026-09-01.json";
        std::fs::write(dir.path().join(old), "{}").unwrap();

        let mut index = SnapshotIndex::default();
        index.record_snapshot("kettles", old);
        store
            .sweep(&mut index, 14, ts("2026-10-16T00:00:00Z"))
            .await
            .expect("sweep");

        assert!(index.files.is_empty());
        assert_eq!(index.latest_for("kettles"), Some(old));
    }

    #[tokio::test]
    async fn failed_delete_is_reported_and_dropped_from_index() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let stuck = "youtube_mugs_2026-09-01.json";
        let gone = "youtube_mugs_2026-09-02.json";
        let fresh = "youtube_mugs_2026-10-15.json";
        for name in [stuck, gone, fresh] {
            std::fs::write(dir.path().join(name), "{}").unwrap();
        }

        let mut index = SnapshotIndex::default();
        for name in [stuck, gone, fresh] {
            index.record_snapshot("mugs", name);
        }

        let report = store
            .sweep_with(&mut index, 14, ts("2026-10-16T12:00:00Z"), |path: PathBuf| {
                let locked = path.ends_with(stuck);
                async move {
                    if locked {
                        Err(std::io::Error::new(
                            std::io::ErrorKind::PermissionDenied,
                            "read-only volume",
                        ))
                    } else {
                        fs::remove_file(path).await
                    }
                }
            })
            .await
            .expect("sweep continues past a failed delete");

        assert_eq!(report.delete_failures, vec![stuck.to_string()]);
        assert_eq!(report.pruned, vec![gone.to_string()]);
        assert!(!report.kept.contains(stuck));
        assert!(dir.path().join(stuck).exists());
        assert!(!dir.path().join(gone).exists());
        assert_eq!(index.files, vec![fresh.to_string()]);
    }

    #[test]
    fn age_is_measured_from_utc_midnight() {
        let age = snapshot_age_days(date("2026-10-02"), ts("2026-10-16T12:00:00Z")).unwrap();
        assert!((age - 14.5).abs() < 1e-9);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            RetryDisposition::NonRetryable
        );
    }
}
