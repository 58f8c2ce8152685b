//! JSON-document persistence for competitors, ads, and the scrape audit log.
//!
//! Three collections live as three documents under one data directory. Every
//! write rewrites the whole document through a temp file renamed into place,
//! and read-modify-write cycles are serialised by an async mutex so two
//! passes observing the same ad cannot lose an upsert.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use calt_core::{
    whole_days_between, Ad, AdCandidate, Classification, ClassificationProvenance, Competitor,
    ScrapeEvent,
};

pub const CRATE_NAME: &str = "calt-store";

const COMPETITORS_FILE: &str = "competitors.json";
const ADS_FILE: &str = "ads.json";
const SCRAPE_HISTORY_FILE: &str = "scrape_history.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading store document {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("writing store document {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt store document {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn first_id() -> u64 {
    1
}

#[derive(Debug, Serialize, Deserialize)]
struct CompetitorsDoc {
    #[serde(default = "first_id")]
    next_id: u64,
    #[serde(default)]
    records: Vec<Competitor>,
}

impl Default for CompetitorsDoc {
    fn default() -> Self {
        Self {
            next_id: first_id(),
            records: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AdsDoc {
    #[serde(default)]
    records: Vec<Ad>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EventsDoc {
    #[serde(default = "first_id")]
    next_id: u64,
    #[serde(default)]
    records: Vec<ScrapeEvent>,
}

impl Default for EventsDoc {
    fn default() -> Self {
        Self {
            next_id: first_id(),
            records: Vec::new(),
        }
    }
}

/// Result of an idempotent competitor registration.
#[derive(Debug, Clone)]
pub struct Registered {
    pub competitor: Competitor,
    pub created: bool,
}

/// Result of an ad upsert.
#[derive(Debug, Clone, Copy)]
pub struct Upserted {
    pub created: bool,
}

/// File-backed store owning all three collections.
#[derive(Debug)]
pub struct JsonStore {
    data_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    async fn load_doc<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T, StoreError> {
        let path = self.data_dir.join(name);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(T::default());
            }
            Err(source) => return Err(StoreError::Read { path, source }),
        };
        serde_json::from_str(&text).map_err(|source| StoreError::Corrupt { path, source })
    }

    /// Rewrite a document atomically: temp file in the same directory, then
    /// rename over the destination.
    async fn save_doc<T: Serialize>(&self, name: &str, doc: &T) -> Result<(), StoreError> {
        let path = self.data_dir.join(name);
        fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|source| StoreError::Write {
                path: self.data_dir.clone(),
                source,
            })?;

        let bytes = serde_json::to_vec_pretty(doc).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;

        let temp_path = self.data_dir.join(format!(".{name}.{}.tmp", Uuid::new_v4()));
        fs::write(&temp_path, &bytes)
            .await
            .map_err(|source| StoreError::Write {
                path: temp_path.clone(),
                source,
            })?;

        match fs::rename(&temp_path, &path).await {
            Ok(()) => {
                debug!(document = name, bytes = bytes.len(), "store document written");
                Ok(())
            }
            Err(source) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StoreError::Write { path, source })
            }
        }
    }

    /// Idempotent add-by-name. An existing `page_name` returns the stored
    /// record untouched; a new one gets the next id from the persisted
    /// counter.
    pub async fn register_competitor(
        &self,
        page_name: &str,
        page_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Registered, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut doc: CompetitorsDoc = self.load_doc(COMPETITORS_FILE).await?;

        if let Some(existing) = doc.records.iter().find(|c| c.page_name == page_name) {
            return Ok(Registered {
                competitor: existing.clone(),
                created: false,
            });
        }

        let competitor = Competitor {
            id: doc.next_id,
            page_name: page_name.to_string(),
            page_id: page_id.map(ToString::to_string),
            added_at: now,
        };
        doc.next_id += 1;
        doc.records.push(competitor.clone());
        self.save_doc(COMPETITORS_FILE, &doc).await?;
        Ok(Registered {
            competitor,
            created: true,
        })
    }

    /// All competitors, ascending id.
    pub async fn list_competitors(&self) -> Result<Vec<Competitor>, StoreError> {
        let doc: CompetitorsDoc = self.load_doc(COMPETITORS_FILE).await?;
        Ok(doc.records)
    }

    /// Insert a new ad or refresh the liveness of an existing one. On refresh
    /// only `last_seen` and `is_active` change: the originally captured
    /// creative content is preserved. Safe to call repeatedly with the same
    /// `ad_id`.
    pub async fn upsert_ad(
        &self,
        candidate: &AdCandidate,
        now: DateTime<Utc>,
    ) -> Result<Upserted, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut doc: AdsDoc = self.load_doc(ADS_FILE).await?;

        if let Some(existing) = doc.records.iter_mut().find(|a| a.ad_id == candidate.ad_id) {
            existing.last_seen = now;
            existing.is_active = true;
            self.save_doc(ADS_FILE, &doc).await?;
            return Ok(Upserted { created: false });
        }

        doc.records.push(Ad {
            ad_id: candidate.ad_id.clone(),
            competitor_id: candidate.competitor_id,
            ad_type: candidate.ad_type,
            headline: candidate.headline.clone(),
            body_text: candidate.body_text.clone(),
            image_url: candidate.image_url.clone(),
            video_url: candidate.video_url.clone(),
            first_seen: now,
            last_seen: now,
            is_active: true,
            days_running: 0,
            classification: None,
        });
        self.save_doc(ADS_FILE, &doc).await?;
        Ok(Upserted { created: true })
    }

    /// Set category, hook, and provenance as one unit. Returns `false` for an
    /// unknown `ad_id`.
    pub async fn set_classification(
        &self,
        ad_id: &str,
        classification: Classification,
    ) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut doc: AdsDoc = self.load_doc(ADS_FILE).await?;
        let Some(ad) = doc.records.iter_mut().find(|a| a.ad_id == ad_id) else {
            return Ok(false);
        };
        ad.classification = Some(classification);
        self.save_doc(ADS_FILE, &doc).await?;
        Ok(true)
    }

    /// Operator reset: drop classifications produced by the fallback path so
    /// those ads become pending again. Externally classified ads are kept.
    pub async fn clear_fallback_classifications(&self) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut doc: AdsDoc = self.load_doc(ADS_FILE).await?;
        let mut cleared = 0;
        for ad in &mut doc.records {
            if matches!(
                ad.classification.as_ref(),
                Some(Classification {
                    provenance: ClassificationProvenance::Fallback,
                    ..
                })
            ) {
                ad.classification = None;
                cleared += 1;
            }
        }
        if cleared > 0 {
            self.save_doc(ADS_FILE, &doc).await?;
        }
        Ok(cleared)
    }

    /// Every ad currently marked active.
    pub async fn scan_active(&self) -> Result<Vec<Ad>, StoreError> {
        let doc: AdsDoc = self.load_doc(ADS_FILE).await?;
        Ok(doc.records.into_iter().filter(|a| a.is_active).collect())
    }

    pub async fn get_ad(&self, ad_id: &str) -> Result<Option<Ad>, StoreError> {
        let doc: AdsDoc = self.load_doc(ADS_FILE).await?;
        Ok(doc.records.into_iter().find(|a| a.ad_id == ad_id))
    }

    /// Batch longevity recompute over active ads. Idempotent for a fixed
    /// `now`. Returns the number of active ads recomputed.
    pub async fn recompute_days_running(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut doc: AdsDoc = self.load_doc(ADS_FILE).await?;
        let mut recomputed = 0;
        for ad in doc.records.iter_mut().filter(|a| a.is_active) {
            ad.days_running = whole_days_between(ad.first_seen, now);
            recomputed += 1;
        }
        if recomputed > 0 {
            self.save_doc(ADS_FILE, &doc).await?;
        }
        Ok(recomputed)
    }

    /// Staleness sweep support: deactivate active ads whose `last_seen` is
    /// before `cutoff`. Returns the number of ads deactivated.
    pub async fn mark_inactive_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut doc: AdsDoc = self.load_doc(ADS_FILE).await?;
        let mut swept = 0;
        for ad in doc.records.iter_mut().filter(|a| a.is_active) {
            if ad.last_seen < cutoff {
                ad.is_active = false;
                swept += 1;
            }
        }
        if swept > 0 {
            self.save_doc(ADS_FILE, &doc).await?;
        }
        Ok(swept)
    }

    /// Seed support: rewrite `first_seen` on an existing ad. Not part of the
    /// tracking contract, which treats `first_seen` as immutable.
    pub async fn backdate_first_seen(
        &self,
        ad_id: &str,
        first_seen: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut doc: AdsDoc = self.load_doc(ADS_FILE).await?;
        let Some(ad) = doc.records.iter_mut().find(|a| a.ad_id == ad_id) else {
            return Ok(false);
        };
        ad.first_seen = first_seen;
        self.save_doc(ADS_FILE, &doc).await?;
        Ok(true)
    }

    /// Append one immutable audit record for a completed acquisition pass.
    pub async fn append_scrape_event(
        &self,
        competitor_id: u64,
        ads_found: u32,
        new_ads: u32,
        now: DateTime<Utc>,
    ) -> Result<ScrapeEvent, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut doc: EventsDoc = self.load_doc(SCRAPE_HISTORY_FILE).await?;
        let event = ScrapeEvent {
            id: doc.next_id,
            competitor_id,
            scraped_at: now,
            ads_found,
            new_ads,
        };
        doc.next_id += 1;
        doc.records.push(event.clone());
        self.save_doc(SCRAPE_HISTORY_FILE, &doc).await?;
        Ok(event)
    }

    /// Most recent audit records, newest first.
    pub async fn recent_scrape_events(&self, limit: usize) -> Result<Vec<ScrapeEvent>, StoreError> {
        let doc: EventsDoc = self.load_doc(SCRAPE_HISTORY_FILE).await?;
        Ok(doc.records.into_iter().rev().take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calt_core::AdType;
    use chrono::{Duration, TimeZone};
    use tempfile::tempdir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    fn candidate(ad_id: &str, competitor_id: u64) -> AdCandidate {
        AdCandidate {
            ad_id: ad_id.to_string(),
            competitor_id,
            ad_type: AdType::Video,
            headline: "Run Far".into(),
            body_text: "Engineered for distance.".into(),
            image_url: "https://cdn.example.com/run-far.jpg".into(),
            video_url: String::new(),
        }
    }

    #[tokio::test]
    async fn registration_is_idempotent_with_monotonic_ids() {
        let dir = tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path());

        let nike = store
            .register_competitor("Nike", None, t0())
            .await
            .expect("register");
        let adidas = store
            .register_competitor("Adidas", Some("page-77"), t0())
            .await
            .expect("register");
        let again = store
            .register_competitor("Nike", Some("ignored"), t0())
            .await
            .expect("register");

        assert!(nike.created);
        assert!(adidas.created);
        assert!(!again.created);
        assert_eq!(nike.competitor.id, 1);
        assert_eq!(adidas.competitor.id, 2);
        assert_eq!(again.competitor, nike.competitor);
        assert_eq!(store.list_competitors().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn upsert_refreshes_liveness_without_touching_creative_content() {
        let dir = tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path());

        let first = store.upsert_ad(&candidate("a1", 1), t0()).await.unwrap();
        assert!(first.created);

        let mut reobserved = candidate("a1", 1);
        reobserved.headline = "Completely Different Headline".into();
        let later = t0() + Duration::days(10);
        let second = store.upsert_ad(&reobserved, later).await.unwrap();
        assert!(!second.created);

        let ad = store.get_ad("a1").await.unwrap().expect("stored ad");
        assert_eq!(ad.first_seen, t0());
        assert_eq!(ad.last_seen, later);
        assert_eq!(ad.headline, "Run Far");
        assert!(ad.is_active);
        assert_eq!(store.scan_active().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn recompute_floors_days_and_tolerates_future_first_seen() {
        let dir = tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path());

        store.upsert_ad(&candidate("old", 1), t0()).await.unwrap();
        store.upsert_ad(&candidate("skewed", 1), t0()).await.unwrap();
        store
            .backdate_first_seen("skewed", t0() + Duration::days(3))
            .await
            .unwrap();

        let now = t0() + Duration::days(10) + Duration::hours(23);
        let recomputed = store.recompute_days_running(now).await.unwrap();
        assert_eq!(recomputed, 2);
        assert_eq!(store.get_ad("old").await.unwrap().unwrap().days_running, 10);
        assert_eq!(store.get_ad("skewed").await.unwrap().unwrap().days_running, 7);

        // Same instant again: no further change.
        store.recompute_days_running(now).await.unwrap();
        assert_eq!(store.get_ad("old").await.unwrap().unwrap().days_running, 10);
    }

    #[tokio::test]
    async fn classification_set_is_atomic_and_reset_targets_fallback_only() {
        let dir = tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path());
        store.upsert_ad(&candidate("a1", 1), t0()).await.unwrap();
        store.upsert_ad(&candidate("a2", 1), t0()).await.unwrap();

        let unknown = store
            .set_classification(
                "missing",
                Classification {
                    category: "video".into(),
                    hook: "urgency".into(),
                    provenance: ClassificationProvenance::External,
                },
            )
            .await
            .unwrap();
        assert!(!unknown);

        store
            .set_classification(
                "a1",
                Classification {
                    category: "ugc_style".into(),
                    hook: "social_proof".into(),
                    provenance: ClassificationProvenance::External,
                },
            )
            .await
            .unwrap();
        store
            .set_classification(
                "a2",
                Classification {
                    category: "video".into(),
                    hook: "curiosity".into(),
                    provenance: ClassificationProvenance::Fallback,
                },
            )
            .await
            .unwrap();

        let cleared = store.clear_fallback_classifications().await.unwrap();
        assert_eq!(cleared, 1);
        assert!(store.get_ad("a1").await.unwrap().unwrap().classification.is_some());
        assert!(store.get_ad("a2").await.unwrap().unwrap().classification.is_none());
    }

    #[tokio::test]
    async fn staleness_sweep_spares_recently_observed_ads() {
        let dir = tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path());

        store.upsert_ad(&candidate("stale", 1), t0()).await.unwrap();
        store
            .upsert_ad(&candidate("fresh", 1), t0() + Duration::days(20))
            .await
            .unwrap();

        let cutoff = t0() + Duration::days(14);
        let swept = store.mark_inactive_before(cutoff).await.unwrap();
        assert_eq!(swept, 1);

        let active = store.scan_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].ad_id, "fresh");
        assert!(!store.get_ad("stale").await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn scrape_events_append_with_monotonic_ids() {
        let dir = tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path());

        store.append_scrape_event(1, 12, 3, t0()).await.unwrap();
        let second = store
            .append_scrape_event(2, 5, 0, t0() + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(second.id, 2);

        let recent = store.recent_scrape_events(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].competitor_id, 2);
        assert_eq!(recent[1].ads_found, 12);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        {
            let store = JsonStore::new(dir.path());
            store.register_competitor("Nike", None, t0()).await.unwrap();
            store.upsert_ad(&candidate("a1", 1), t0()).await.unwrap();
        }

        let reopened = JsonStore::new(dir.path());
        assert_eq!(reopened.list_competitors().await.unwrap().len(), 1);
        let ad = reopened.get_ad("a1").await.unwrap().expect("persisted ad");
        assert_eq!(ad.first_seen, t0());

        let adidas = reopened
            .register_competitor("Adidas", None, t0())
            .await
            .unwrap();
        assert_eq!(adidas.competitor.id, 2);
    }
}
