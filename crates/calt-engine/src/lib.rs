//! Tracker orchestration: ingest passes, longevity recomputation,
//! classification queries, reports, and scheduled cadences.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

use calt_adapters::AdSource;
use calt_core::{Ad, AdType};
use calt_enrich::EnrichmentCoordinator;
use calt_store::JsonStore;

pub const CRATE_NAME: &str = "calt-engine";

pub const DEFAULT_VETERAN_MIN_DAYS: u32 = 30;
pub const DEFAULT_VETERAN_LIMIT: usize = 10;
pub const DEFAULT_RECENT_DAYS: u32 = 7;

/// Join default when an ad references a competitor the registry cannot
/// resolve.
const UNKNOWN_PAGE_NAME: &str = "Unknown";

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub data_dir: PathBuf,
    pub competitors_file: PathBuf,
    pub captures_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub ingest_cron: String,
    pub enrich_cron: String,
    pub web_port: u16,
    pub classifier_api_key: Option<String>,
    pub classifier_model: String,
    pub classifier_base_url: Option<String>,
    pub enrich_delay_ms: u64,
    pub http_timeout_secs: u64,
    pub stale_after_days: u32,
}

impl TrackerConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("CALT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            competitors_file: std::env::var("CALT_COMPETITORS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./competitors.yaml")),
            captures_dir: std::env::var("CALT_CAPTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./captures")),
            reports_dir: std::env::var("CALT_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            scheduler_enabled: std::env::var("CALT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            ingest_cron: std::env::var("CALT_INGEST_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            enrich_cron: std::env::var("CALT_ENRICH_CRON")
                .unwrap_or_else(|_| "0 30 6 * * *".to_string()),
            web_port: std::env::var("CALT_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            classifier_api_key: std::env::var("OPENAI_API_KEY").ok(),
            classifier_model: std::env::var("CALT_CLASSIFIER_MODEL")
                .unwrap_or_else(|_| "gpt-4o".to_string()),
            classifier_base_url: std::env::var("CALT_CLASSIFIER_BASE_URL").ok(),
            enrich_delay_ms: std::env::var("CALT_ENRICH_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
            http_timeout_secs: std::env::var("CALT_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            stale_after_days: std::env::var("CALT_STALE_AFTER_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(14),
        }
    }
}

/// Operator-maintained registry seed file.
#[derive(Debug, Clone, Deserialize)]
pub struct CompetitorRegistryFile {
    pub competitors: Vec<CompetitorSeed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompetitorSeed {
    pub page_name: String,
    #[serde(default)]
    pub page_id: Option<String>,
}

/// Query row: an ad plus the resolved competitor page name. The page name is
/// a read-time projection, never stored.
#[derive(Debug, Clone, Serialize)]
pub struct AdRow {
    #[serde(flatten)]
    pub ad: Ad,
    pub page_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackerStats {
    pub total_ads: usize,
    pub veteran_ads: usize,
    pub new_ads: usize,
    pub avg_days_running: f64,
    pub category_breakdown: BTreeMap<String, usize>,
    pub hook_breakdown: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub competitors: usize,
    pub candidates: usize,
    pub rejected: usize,
    pub created: usize,
    pub refreshed: usize,
    pub recomputed: usize,
}

pub struct Tracker {
    store: Arc<JsonStore>,
}

impl Tracker {
    pub fn new(store: Arc<JsonStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<JsonStore> {
        &self.store
    }

    /// Register every competitor named in the yaml seed file. Idempotent:
    /// returns how many were newly created.
    pub async fn register_from_file(&self, path: &Path) -> Result<usize> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let registry: CompetitorRegistryFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

        let mut created = 0;
        for seed in registry.competitors {
            let registered = self
                .store
                .register_competitor(&seed.page_name, seed.page_id.as_deref(), Utc::now())
                .await?;
            if registered.created {
                created += 1;
            }
        }
        Ok(created)
    }

    /// One acquisition pass over every registered competitor: validate,
    /// upsert, audit, then recompute longevity once. A source failure for one
    /// competitor skips that competitor; a store failure aborts the pass.
    pub async fn ingest_pass(&self, source: &dyn AdSource) -> Result<PassSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let competitors = self.store.list_competitors().await?;

        let mut candidates_total = 0;
        let mut rejected = 0;
        let mut created = 0;
        let mut refreshed = 0;

        for competitor in &competitors {
            let candidates = match source.collect(competitor).await {
                Ok(candidates) => candidates,
                Err(err) => {
                    warn!(page_name = %competitor.page_name, error = %err, "acquisition failed, skipping competitor");
                    continue;
                }
            };

            let mut found = 0u32;
            let mut new_ads = 0u32;
            for candidate in candidates {
                if candidate.is_malformed() {
                    rejected += 1;
                    warn!(page_name = %competitor.page_name, "rejected candidate without ad_id");
                    continue;
                }
                found += 1;
                candidates_total += 1;
                let upserted = self.store.upsert_ad(&candidate, Utc::now()).await?;
                if upserted.created {
                    new_ads += 1;
                    created += 1;
                } else {
                    refreshed += 1;
                }
            }

            self.store
                .append_scrape_event(competitor.id, found, new_ads, Utc::now())
                .await?;
            info!(page_name = %competitor.page_name, found, new = new_ads, "acquisition pass recorded");
        }

        let recomputed = self.store.recompute_days_running(Utc::now()).await?;

        let summary = PassSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            competitors: competitors.len(),
            candidates: candidates_total,
            rejected,
            created,
            refreshed,
            recomputed,
        };
        info!(
            run_id = %summary.run_id,
            candidates = summary.candidates,
            created = summary.created,
            refreshed = summary.refreshed,
            rejected = summary.rejected,
            "ingest pass complete"
        );
        Ok(summary)
    }

    pub async fn recompute_longevity(&self, now: DateTime<Utc>) -> Result<usize> {
        Ok(self.store.recompute_days_running(now).await?)
    }

    /// Deactivate ads not re-observed within the grace window. Only ever
    /// invoked explicitly by an operator.
    pub async fn sweep_stale(&self, now: DateTime<Utc>, grace_days: u32) -> Result<usize> {
        let cutoff = now - Duration::days(i64::from(grace_days));
        let swept = self.store.mark_inactive_before(cutoff).await?;
        if swept > 0 {
            info!(swept, grace_days, "stale ads deactivated");
        }
        Ok(swept)
    }

    async fn page_names(&self) -> Result<HashMap<u64, String>> {
        Ok(self
            .store
            .list_competitors()
            .await?
            .into_iter()
            .map(|c| (c.id, c.page_name))
            .collect())
    }

    fn join(ads: Vec<Ad>, names: &HashMap<u64, String>) -> Vec<AdRow> {
        ads.into_iter()
            .map(|ad| AdRow {
                page_name: names
                    .get(&ad.competitor_id)
                    .cloned()
                    .unwrap_or_else(|| UNKNOWN_PAGE_NAME.to_string()),
                ad,
            })
            .collect()
    }

    /// Descending `days_running`; ties break by ascending `first_seen`, then
    /// ascending `ad_id`.
    fn sort_by_longevity(ads: &mut [Ad]) {
        ads.sort_by(|a, b| {
            b.days_running
                .cmp(&a.days_running)
                .then(a.first_seen.cmp(&b.first_seen))
                .then(a.ad_id.cmp(&b.ad_id))
        });
    }

    pub async fn veterans(&self, min_days: u32, limit: usize) -> Result<Vec<AdRow>> {
        let mut ads: Vec<Ad> = self
            .store
            .scan_active()
            .await?
            .into_iter()
            .filter(|a| a.days_running >= min_days)
            .collect();
        Self::sort_by_longevity(&mut ads);
        ads.truncate(limit);
        Ok(Self::join(ads, &self.page_names().await?))
    }

    pub async fn recent(&self, days_ago: u32, now: DateTime<Utc>) -> Result<Vec<AdRow>> {
        let cutoff = now - Duration::days(i64::from(days_ago));
        let mut ads: Vec<Ad> = self
            .store
            .scan_active()
            .await?
            .into_iter()
            .filter(|a| a.first_seen >= cutoff)
            .collect();
        ads.sort_by(|a, b| b.first_seen.cmp(&a.first_seen).then(a.ad_id.cmp(&b.ad_id)));
        Ok(Self::join(ads, &self.page_names().await?))
    }

    pub async fn all_active(&self) -> Result<Vec<AdRow>> {
        let mut ads = self.store.scan_active().await?;
        Self::sort_by_longevity(&mut ads);
        Ok(Self::join(ads, &self.page_names().await?))
    }

    /// Aggregate view over the active set. Unclassified ads count under
    /// `"unknown"` in both breakdowns.
    pub async fn stats(&self, now: DateTime<Utc>) -> Result<TrackerStats> {
        let ads = self.store.scan_active().await?;
        let recent_cutoff = now - Duration::days(i64::from(DEFAULT_RECENT_DAYS));

        let total_ads = ads.len();
        let veteran_ads = ads
            .iter()
            .filter(|a| a.days_running >= DEFAULT_VETERAN_MIN_DAYS)
            .count();
        let new_ads = ads.iter().filter(|a| a.first_seen >= recent_cutoff).count();
        let avg_days_running = if ads.is_empty() {
            0.0
        } else {
            ads.iter().map(|a| f64::from(a.days_running)).sum::<f64>() / total_ads as f64
        };

        let mut category_breakdown = BTreeMap::new();
        let mut hook_breakdown = BTreeMap::new();
        for ad in &ads {
            let (category, hook) = match &ad.classification {
                Some(c) => (c.category.as_str(), c.hook.as_str()),
                None => ("unknown", "unknown"),
            };
            *category_breakdown.entry(category.to_string()).or_insert(0) += 1;
            *hook_breakdown.entry(hook.to_string()).or_insert(0) += 1;
        }

        Ok(TrackerStats {
            total_ads,
            veteran_ads,
            new_ads,
            avg_days_running,
            category_breakdown,
            hook_breakdown,
        })
    }

    /// Render the winners report for the current state into a timestamped
    /// directory. Pure consumer of the queries above.
    pub async fn write_winners_report(
        &self,
        reports_dir: &Path,
        now: DateTime<Utc>,
    ) -> Result<PathBuf> {
        let run_dir = reports_dir.join(now.format("%Y%m%d_%H%M%S").to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;

        let stats = self.stats(now).await?;
        let veterans = self
            .veterans(DEFAULT_VETERAN_MIN_DAYS, DEFAULT_VETERAN_LIMIT)
            .await?;
        let recent = self.recent(DEFAULT_RECENT_DAYS, now).await?;

        let mut lines = vec![
            "# Winners Report".to_string(),
            String::new(),
            format!("- Generated: {}", now.to_rfc3339()),
            format!("- Active ads: {}", stats.total_ads),
            format!(
                "- Veterans (>= {} days): {}",
                DEFAULT_VETERAN_MIN_DAYS, stats.veteran_ads
            ),
            format!(
                "- New (last {} days): {}",
                DEFAULT_RECENT_DAYS, stats.new_ads
            ),
            format!("- Average days running: {:.1}", stats.avg_days_running),
            String::new(),
            "## Longest-Running Ads".to_string(),
            String::new(),
            "| Page | Headline | Days | Category | Hook |".to_string(),
            "|------|----------|------|----------|------|".to_string(),
        ];
        for row in &veterans {
            let (category, hook) = match &row.ad.classification {
                Some(c) => (c.category.as_str(), c.hook.as_str()),
                None => ("unknown", "unknown"),
            };
            lines.push(format!(
                "| {} | {} | {} | {} | {} |",
                row.page_name, row.ad.headline, row.ad.days_running, category, hook
            ));
        }

        lines.push(String::new());
        lines.push("## New This Week".to_string());
        lines.push(String::new());
        for row in &recent {
            lines.push(format!(
                "- {} — {} (first seen {})",
                row.page_name,
                row.ad.headline,
                row.ad.first_seen.format("%Y-%m-%d")
            ));
        }
        lines.push(String::new());

        let path = run_dir.join("winners_report.md");
        fs::write(&path, lines.join("\n"))
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "winners report written");
        Ok(path)
    }
}

/// Most recently generated winners report, if any. Report directories are
/// timestamp-named, so lexicographic order is chronological.
pub fn latest_report(reports_dir: &Path) -> Result<Option<PathBuf>> {
    if !reports_dir.exists() {
        return Ok(None);
    }
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .map(|entry| entry.path())
        .collect();
    dirs.sort();
    Ok(dirs
        .into_iter()
        .rev()
        .map(|dir| dir.join("winners_report.md"))
        .find(|path| path.exists()))
}

/// Register the ingest and enrichment cadences when scheduling is enabled.
/// The returned handle must be kept alive for the lifetime of the process.
pub async fn maybe_build_scheduler(
    config: &TrackerConfig,
    tracker: Arc<Tracker>,
    source: Arc<dyn AdSource>,
    enrichment: Arc<EnrichmentCoordinator>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let ingest_tracker = Arc::clone(&tracker);
    let ingest_source = Arc::clone(&source);
    let ingest_job = Job::new_async(config.ingest_cron.as_str(), move |_uuid, _l| {
        let tracker = Arc::clone(&ingest_tracker);
        let source = Arc::clone(&ingest_source);
        Box::pin(async move {
            if let Err(err) = tracker.ingest_pass(source.as_ref()).await {
                warn!(error = %err, "scheduled ingest pass failed");
            }
        })
    })
    .with_context(|| format!("creating ingest job for cron {}", config.ingest_cron))?;
    sched.add(ingest_job).await.context("adding ingest job")?;

    let enrich_job = Job::new_async(config.enrich_cron.as_str(), move |_uuid, _l| {
        let enrichment = Arc::clone(&enrichment);
        Box::pin(async move {
            if let Err(err) = enrichment.enrich_pending().await {
                warn!(error = %err, "scheduled enrichment pass failed");
            }
        })
    })
    .with_context(|| format!("creating enrichment job for cron {}", config.enrich_cron))?;
    sched.add(enrich_job).await.context("adding enrichment job")?;

    sched.start().await.context("starting scheduler")?;
    Ok(Some(sched))
}

const DEMO_COMPETITORS: [&str; 8] = [
    "Nike",
    "Adidas",
    "Gymshark",
    "Lululemon",
    "Allbirds",
    "Casper",
    "Purple",
    "Warby Parker",
];

const DEMO_HEADLINES: [&str; 10] = [
    "Get 30% Off Your First Order",
    "The Most Comfortable Shoes You'll Ever Wear",
    "Transform Your Workout in 30 Days",
    "Limited Time: Free Shipping on All Orders",
    "Join 1 Million Happy Customers",
    "As Seen on Shark Tank",
    "Why Athletes Choose Us",
    "Your New Favorite Product",
    "Made for People Who Care About Quality",
    "Try Risk-Free for 100 Days",
];

const DEMO_BODIES: [&str; 5] = [
    "Discover why thousands of customers are making the switch. Premium quality, unbeatable comfort, and a 100-day money-back guarantee.",
    "Limited time offer: Get 30% off your first purchase. Plus free shipping on orders over $50. Don't miss out!",
    "Engineered for performance. Designed for style. Built to last. Experience the difference today.",
    "Real results from real customers. Join our community of over 1 million satisfied buyers.",
    "What makes us different? We obsess over every detail so you don't have to.",
];

// Mixed veteran / mid / new ages so every query has content.
const DEMO_AGES: [u32; 6] = [45, 3, 12, 60, 1, 33];

const DEMO_TYPES: [AdType; 3] = [AdType::Video, AdType::Static, AdType::Carousel];

/// Deterministic demo dataset: eight competitors with ads spanning veteran,
/// mid, and new age buckets. Returns the number of ads created.
pub async fn seed_demo_data(store: &JsonStore, now: DateTime<Utc>) -> Result<usize> {
    let mut created = 0;

    for name in DEMO_COMPETITORS {
        let registered = store.register_competitor(name, None, now).await?;
        let competitor = registered.competitor;

        for slot in 0..DEMO_AGES.len() {
            let offset = competitor.id as usize + slot;
            let ad_type = DEMO_TYPES[offset % DEMO_TYPES.len()];
            let candidate = calt_core::AdCandidate {
                ad_id: format!("demo_{}_{}", competitor.id, slot),
                competitor_id: competitor.id,
                ad_type,
                headline: DEMO_HEADLINES[offset % DEMO_HEADLINES.len()].to_string(),
                body_text: DEMO_BODIES[offset % DEMO_BODIES.len()].to_string(),
                image_url: format!(
                    "https://placehold.example.com/1200x628?text={}",
                    calt_adapters::page_slug(&competitor.page_name)
                ),
                video_url: if ad_type == AdType::Video {
                    "https://video.example.com/demo.mp4".to_string()
                } else {
                    String::new()
                },
            };
            let upserted = store.upsert_ad(&candidate, now).await?;
            if upserted.created {
                created += 1;
                let age = DEMO_AGES[slot];
                store
                    .backdate_first_seen(&candidate.ad_id, now - Duration::days(i64::from(age)))
                    .await?;
            }
        }
    }

    store.recompute_days_running(now).await?;
    info!(created, "demo data seeded");
    Ok(created)
}
