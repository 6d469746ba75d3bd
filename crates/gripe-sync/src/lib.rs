//! Harvest pipeline orchestration: manifest → connectors → relevance → dedup → snapshots → retention.

mod relevance;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use gripe_adapters::{
    connector_for_source, sanitize_text, ConnectorSettings, HarvestContext, SourceConnector,
    CPSC_SOURCE_ID, DEFAULT_MAX_PAGES, YOUTUBE_SOURCE_ID,
};
use gripe_core::{FilteredItem, Manifest, Snapshot, SnapshotIndex, Topic};
use gripe_storage::{HttpClientConfig, HttpFetcher, SnapshotStore, StoredSnapshot};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use relevance::{
    is_likely_english, normalize_terms, normalize_text, KeepAllFilter, KeywordRelevanceFilter,
    Lexicon, RelevanceFilter, MIN_NORMALIZED_CHARS,
};

pub const CRATE_NAME: &str = "gripe-sync";

pub const DEFAULT_RETAIN_DAYS: u32 = 14;
pub const DEFAULT_MAX_ITEMS_PER_TOPIC: usize = 4000;

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub manifest_path: PathBuf,
    pub data_dir: PathBuf,
    pub retain_days: u32,
    pub sources_path: PathBuf,
    pub lexicon_path: PathBuf,
    pub youtube_api_key: Option<String>,
    pub youtube_region: String,
    pub youtube_language: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub call_delay_ms: u64,
    pub max_pages: usize,
    pub max_items_per_topic: usize,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        Self {
            manifest_path: PathBuf::from(env_or("MANIFEST_PATH", "config/topic_manifest.json")),
            data_dir: PathBuf::from(env_or("DATA_DIR", "docs/data")),
            retain_days: env_parse("RETAIN_DAYS", DEFAULT_RETAIN_DAYS),
            sources_path: PathBuf::from(env_or("GRIPE_SOURCES_PATH", "config/sources.yaml")),
            lexicon_path: PathBuf::from(env_or("GRIPE_LEXICON_PATH", "config/lexicon.yaml")),
            youtube_api_key: std::env::var("YT_API_KEY").ok(),
            youtube_region: env_or("YT_REGION", "US"),
            youtube_language: env_or("YT_LANG", "en"),
            user_agent: env_or("GRIPE_USER_AGENT", "gripe-harvester/0.1"),
            http_timeout_secs: env_parse("GRIPE_HTTP_TIMEOUT_SECS", 20),
            call_delay_ms: env_parse("GRIPE_CALL_DELAY_MS", 200),
            max_pages: env_parse("GRIPE_MAX_PAGES", DEFAULT_MAX_PAGES),
            max_items_per_topic: env_parse("GRIPE_MAX_ITEMS_PER_TOPIC", DEFAULT_MAX_ITEMS_PER_TOPIC),
        }
    }

    pub fn connector_settings(&self) -> ConnectorSettings {
        ConnectorSettings {
            youtube_api_key: self.youtube_api_key.clone(),
            youtube_region: self.youtube_region.clone(),
            youtube_language: self.youtube_language.clone(),
            max_pages: self.max_pages,
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            courtesy_delay: Duration::from_millis(self.call_delay_ms),
            ..Default::default()
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            retain_days: self.retain_days,
            max_items_per_topic: self.max_items_per_topic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    #[default]
    KeepAll,
    Keyword,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub filter: FilterKind,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self {
            sources: vec![
                SourceConfig {
                    source_id: YOUTUBE_SOURCE_ID.to_string(),
                    enabled: true,
                    filter: FilterKind::Keyword,
                },
                SourceConfig {
                    source_id: CPSC_SOURCE_ID.to_string(),
                    enabled: true,
                    filter: FilterKind::KeepAll,
                },
            ],
        }
    }
}

impl SourceRegistry {
    /// Reads `path`, or returns the built-in registry when the file does not exist.
    pub async fn load(path: &Path) -> Result<Self> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            debug!(path = %path.display(), "no source registry file; using built-in sources");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Enabled sources when `requested` is empty; otherwise exactly the requested ids,
    /// enabled or not. Unknown ids are an error.
    pub fn select(&self, requested: &[String]) -> Result<Vec<SourceConfig>> {
        if requested.is_empty() {
            return Ok(self.sources.iter().filter(|s| s.enabled).cloned().collect());
        }
        let mut selected: Vec<SourceConfig> = Vec::new();
        for id in requested {
            let source = self
                .sources
                .iter()
                .find(|s| &s.source_id == id)
                .with_context(|| format!("unknown source {id:?}"))?;
            if !selected.iter().any(|s| s.source_id == source.source_id) {
                selected.push(source.clone());
            }
        }
        Ok(selected)
    }
}

/// Within-run duplicate suppression for one topic, keyed on normalized text.
#[derive(Debug)]
pub struct SnapshotDeduplicator {
    seen: HashSet<String>,
    cap: usize,
}

impl SnapshotDeduplicator {
    pub fn new(cap: usize) -> Self {
        Self {
            seen: HashSet::new(),
            cap,
        }
    }

    /// False when `key` was already admitted or the cap is reached.
    pub fn admit(&mut self, key: &str) -> bool {
        if self.is_full() || self.seen.contains(key) {
            return false;
        }
        self.seen.insert(key.to_string());
        true
    }

    pub fn is_full(&self) -> bool {
        self.seen.len() >= self.cap
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// One source as configured for a run.
pub struct SourcePlan {
    pub connector: Box<dyn SourceConnector>,
    pub filter: Box<dyn RelevanceFilter>,
}

pub fn filter_for(kind: FilterKind, lexicon: &Lexicon) -> Box<dyn RelevanceFilter> {
    match kind {
        FilterKind::KeepAll => Box::new(KeepAllFilter),
        FilterKind::Keyword => Box::new(KeywordRelevanceFilter::new(lexicon)),
    }
}

pub fn build_plans(
    sources: &[SourceConfig],
    settings: &ConnectorSettings,
    lexicon: &Lexicon,
) -> Result<Vec<SourcePlan>> {
    sources
        .iter()
        .map(|source| {
            let connector = connector_for_source(&source.source_id, settings)
                .with_context(|| format!("configuring source {}", source.source_id))?;
            Ok(SourcePlan {
                connector,
                filter: filter_for(source.filter, lexicon),
            })
        })
        .collect()
}

/// Manifest missing, unparseable or with non-unique topic ids is an error.
pub async fn load_manifest(path: &Path) -> Result<Manifest> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading manifest {}", path.display()))?;
    let manifest: Manifest = serde_json::from_str(&text)
        .with_context(|| format!("parsing manifest {}", path.display()))?;
    manifest
        .validate()
        .with_context(|| format!("validating manifest {}", path.display()))?;
    Ok(manifest)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub retain_days: u32,
    pub max_items_per_topic: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            retain_days: DEFAULT_RETAIN_DAYS,
            max_items_per_topic: DEFAULT_MAX_ITEMS_PER_TOPIC,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TopicCounts {
    pub candidates: usize,
    pub fetched: usize,
    pub excluded: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub kept: usize,
    pub capped: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicRunSummary {
    pub topic_id: String,
    pub file_name: String,
    pub sha256: String,
    pub byte_size: usize,
    pub counts: TopicCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRunSummary {
    pub source_id: String,
    pub filter: &'static str,
    pub topics: Vec<TopicRunSummary>,
    pub failed_topics: Vec<String>,
}

impl SourceRunSummary {
    pub fn items_written(&self) -> usize {
        self.topics.iter().map(|t| t.counts.kept).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceRunSummary>,
    pub pruned: Vec<String>,
    pub index_files: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PruneSummary {
    pub pruned: Vec<String>,
    pub delete_failures: Vec<String>,
    pub index_files: usize,
}

pub struct HarvestPipeline {
    store: SnapshotStore,
    http: HttpFetcher,
    settings: PipelineSettings,
}

impl HarvestPipeline {
    pub fn new(store: SnapshotStore, http: HttpFetcher, settings: PipelineSettings) -> Self {
        Self {
            store,
            http,
            settings,
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Load the index, harvest every topic for every plan, sweep, persist the index.
    ///
    /// Topic failures are logged and skipped. Only setup and the final index write propagate.
    pub async fn run(
        &self,
        manifest: &Manifest,
        plans: &[SourcePlan],
        now: DateTime<Utc>,
    ) -> Result<HarvestRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("harvest_run", %run_id);
        self.run_inner(run_id, manifest, plans, now)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        manifest: &Manifest,
        plans: &[SourcePlan],
        now: DateTime<Utc>,
    ) -> Result<HarvestRunSummary> {
        self.store.ensure_root().await?;
        let mut index = self.store.load_index().await;
        let ctx = HarvestContext {
            run_id,
            published_after: now - chrono::Duration::days(i64::from(manifest.recency_days)),
        };
        info!(
            topics = manifest.queries.len(),
            sources = plans.len(),
            published_after = %ctx.published_after,
            "harvest started"
        );

        let mut sources = Vec::with_capacity(plans.len());
        for plan in plans {
            sources.push(self.harvest_source(&ctx, manifest, plan, &mut index, now).await);
        }

        let pruned = match self
            .store
            .sweep(&mut index, self.settings.retain_days, now)
            .await
        {
            Ok(report) => report.pruned,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "retention sweep skipped");
                Vec::new()
            }
        };

        self.store
            .persist_index(&index)
            .await
            .context("persisting snapshot index")?;
        info!(
            files = index.files.len(),
            pruned = pruned.len(),
            "index persisted"
        );

        Ok(HarvestRunSummary {
            run_id,
            started_at: now,
            finished_at: Utc::now(),
            sources,
            pruned,
            index_files: index.files.len(),
        })
    }

    async fn harvest_source(
        &self,
        ctx: &HarvestContext,
        manifest: &Manifest,
        plan: &SourcePlan,
        index: &mut SnapshotIndex,
        now: DateTime<Utc>,
    ) -> SourceRunSummary {
        let source_id = plan.connector.source_id();
        let mut summary = SourceRunSummary {
            source_id: source_id.to_string(),
            filter: plan.filter.name(),
            topics: Vec::new(),
            failed_topics: Vec::new(),
        };

        for topic in &manifest.queries {
            match self.harvest_topic(ctx, manifest, plan, topic, now).await {
                Ok((stored, counts)) => {
                    index.record_snapshot(&topic.id, &stored.file_name);
                    info!(
                        source = source_id,
                        topic_id = %topic.id,
                        file = %stored.file_name,
                        items = stored.item_count,
                        bytes = stored.byte_size,
                        sha256 = %stored.sha256,
                        "snapshot written"
                    );
                    summary.topics.push(TopicRunSummary {
                        topic_id: topic.id.clone(),
                        file_name: stored.file_name,
                        sha256: stored.sha256,
                        byte_size: stored.byte_size,
                        counts,
                    });
                }
                Err(err) => {
                    error!(
                        source = source_id,
                        topic_id = %topic.id,
                        error = %format!("{err:#}"),
                        "topic harvest failed"
                    );
                    summary.failed_topics.push(topic.id.clone());
                }
            }
        }
        summary
    }

    /// Collect, filter and dedup one topic, then write its snapshot.
    pub async fn harvest_topic(
        &self,
        ctx: &HarvestContext,
        manifest: &Manifest,
        plan: &SourcePlan,
        topic: &Topic,
        now: DateTime<Utc>,
    ) -> Result<(StoredSnapshot, TopicCounts)> {
        let connector = plan.connector.as_ref();
        let limits = connector.limits(manifest);
        let excludes = normalize_terms(&topic.exclude);
        let mut dedup = SnapshotDeduplicator::new(self.settings.max_items_per_topic);
        let mut visited = HashSet::new();
        let mut counts = TopicCounts::default();
        let mut items = Vec::new();

        'terms: for term in topic.include.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
            let ids = connector
                .search(&self.http, ctx, term, limits.search_results)
                .await;
            for id in ids {
                if !visited.insert(id.clone()) {
                    continue;
                }
                counts.candidates += 1;
                let raw_items = connector
                    .list_details(&self.http, ctx, &id, limits.detail_items)
                    .await;
                for raw in raw_items {
                    counts.fetched += 1;
                    let text = sanitize_text(&raw.text);
                    if text.is_empty() {
                        counts.rejected += 1;
                        continue;
                    }
                    let key = normalize_text(&text);
                    if excludes.iter().any(|t| key.contains(t.as_str())) {
                        counts.excluded += 1;
                        continue;
                    }
                    if !plan.filter.accepts_normalized(&key) {
                        counts.rejected += 1;
                        continue;
                    }
                    if !dedup.admit(&key) {
                        counts.duplicates += 1;
                        continue;
                    }
                    items.push(FilteredItem {
                        id: raw.external_id,
                        text,
                        likes: raw.likes,
                        timestamp: raw.published_at,
                        lang: connector.lang().to_string(),
                        extra: raw.extra,
                    });
                    if dedup.is_full() {
                        counts.capped = true;
                        warn!(
                            source = connector.source_id(),
                            topic_id = %topic.id,
                            cap = self.settings.max_items_per_topic,
                            "item cap reached; collection stopped"
                        );
                        break 'terms;
                    }
                }
            }
        }

        counts.kept = items.len();
        let snapshot = Snapshot {
            source: connector.source_id().to_string(),
            topic_id: topic.id.clone(),
            fetched_at: now,
            items,
        };
        let stored = self
            .store
            .write_snapshot(&snapshot)
            .await
            .with_context(|| format!("writing snapshot for topic {}", topic.id))?;
        Ok((stored, counts))
    }

    /// Load → sweep → persist, without harvesting.
    pub async fn prune(&self, now: DateTime<Utc>) -> Result<PruneSummary> {
        self.store.ensure_root().await?;
        let mut index = self.store.load_index().await;
        let report = self
            .store
            .sweep(&mut index, self.settings.retain_days, now)
            .await?;
        self.store
            .persist_index(&index)
            .await
            .context("persisting snapshot index")?;
        Ok(PruneSummary {
            pruned: report.pruned,
            delete_failures: report.delete_failures,
            index_files: index.files.len(),
        })
    }
}

pub async fn run_harvest_from_env(requested_sources: &[String]) -> Result<HarvestRunSummary> {
    let config = HarvestConfig::from_env();
    let registry = SourceRegistry::load(&config.sources_path).await?;
    let selected = registry.select(requested_sources)?;
    let lexicon = Lexicon::load(&config.lexicon_path).await?;
    let plans = build_plans(&selected, &config.connector_settings(), &lexicon)?;
    let manifest = load_manifest(&config.manifest_path).await?;

    let http = HttpFetcher::new(config.http_config())?;
    let pipeline = HarvestPipeline::new(
        SnapshotStore::new(config.data_dir.clone()),
        http,
        config.pipeline_settings(),
    );
    pipeline.run(&manifest, &plans, Utc::now()).await
}

pub async fn run_prune_from_env() -> Result<PruneSummary> {
    let config = HarvestConfig::from_env();
    let http = HttpFetcher::new(config.http_config())?;
    let pipeline = HarvestPipeline::new(
        SnapshotStore::new(config.data_dir.clone()),
        http,
        config.pipeline_settings(),
    );
    pipeline.prune(Utc::now()).await
}
