//! Acquisition intake: capture bundles and ad-card extraction.
//!
//! The engine never drives a browser. An acquisition collaborator captures an
//! Ad Library results page (or pre-parsed records) into a JSON bundle, and
//! this crate turns bundles into [`AdCandidate`]s with stable ids.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use calt_core::{AdCandidate, AdType, Competitor};

pub const CRATE_NAME: &str = "calt-adapters";

/// Cap on cards taken from one captured results page.
const MAX_CARDS_PER_CAPTURE: usize = 20;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// An acquisition collaborator: hands the engine proposed ad records for one
/// competitor. Implementations must emit stable `ad_id`s so repeated passes
/// dedup correctly.
#[async_trait]
pub trait AdSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn collect(&self, competitor: &Competitor) -> Result<Vec<AdCandidate>, AdapterError>;
}

/// One captured Ad Library page for one competitor. Either `records` is
/// pre-parsed, or `raw_html` holds the page for extraction here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureBundle {
    pub page_name: String,
    pub captured_from_url: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub raw_html: Option<String>,
    #[serde(default)]
    pub records: Vec<CaptureRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureRecord {
    #[serde(default)]
    pub ad_id: String,
    pub ad_type: AdType,
    #[serde(default)]
    pub headline: String,
    #[serde(default)]
    pub body_text: String,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub video_url: String,
}

pub fn load_capture_bundle(path: impl AsRef<Path>) -> Result<CaptureBundle, AdapterError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading capture bundle {}", path.display()))?;
    let bundle: CaptureBundle = serde_json::from_str(&text)
        .with_context(|| format!("parsing capture bundle {}", path.display()))?;
    Ok(bundle)
}

/// Stable id for a creative whose capture carries none: uuid-v5 over the
/// content that identifies the creative across passes.
pub fn derive_stable_ad_id(page_name: &str, record: &CaptureRecord) -> String {
    let seed = format!(
        "{}:{}:{}:{}",
        page_name, record.headline, record.body_text, record.image_url
    );
    format!("ad_{}", Uuid::new_v5(&Uuid::NAMESPACE_URL, seed.as_bytes()))
}

fn select_first_text(card: ElementRef<'_>, selector: &str) -> Result<Option<String>, AdapterError> {
    let sel = Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))?;
    Ok(card
        .select(&sel)
        .next()
        .map(|n| n.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty()))
}

fn select_first_attr(
    card: ElementRef<'_>,
    selector: &str,
    attr: &str,
) -> Result<Option<String>, AdapterError> {
    let sel = Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))?;
    Ok(card
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty()))
}

/// Extract ad cards from a captured Ad Library results page.
pub fn extract_cards_from_html(
    page_name: &str,
    html: &str,
) -> Result<Vec<CaptureRecord>, AdapterError> {
    let document = Html::parse_document(html);
    let card_sel = Selector::parse(r#"[data-testid="search-result-card"]"#)
        .map_err(|e| AdapterError::Message(e.to_string()))?;
    let carousel_sel = Selector::parse(r#"[aria-label*="carousel"]"#)
        .map_err(|e| AdapterError::Message(e.to_string()))?;

    let mut records = Vec::new();
    for card in document.select(&card_sel).take(MAX_CARDS_PER_CAPTURE) {
        let headline = select_first_text(card, r#"div[style*="font-weight"]"#)?.unwrap_or_default();
        let body_text = select_first_text(card, r#"div[dir="auto"]"#)?.unwrap_or_default();
        let image_url = select_first_attr(card, r#"img[src*="scontent"]"#, "src")?.unwrap_or_default();
        let video_url = select_first_attr(card, "video", "src")?
            .or(select_first_attr(card, "video source", "src")?)
            .unwrap_or_default();

        let ad_type = if !video_url.is_empty() {
            AdType::Video
        } else if card.select(&carousel_sel).next().is_some() {
            AdType::Carousel
        } else {
            AdType::Static
        };

        let mut record = CaptureRecord {
            ad_id: card.value().attr("data-ad-id").unwrap_or_default().to_string(),
            ad_type,
            headline,
            body_text,
            image_url,
            video_url,
        };
        if record.ad_id.is_empty() {
            record.ad_id = derive_stable_ad_id(page_name, &record);
        }
        records.push(record);
    }
    Ok(records)
}

/// Turn a bundle into candidates for one competitor. Contentless cards are
/// dropped, and records without an id get a derived one, so nothing malformed
/// leaves this boundary under normal operation.
pub fn bundle_candidates(bundle: &CaptureBundle, competitor: &Competitor) -> Vec<AdCandidate> {
    let mut records = bundle.records.clone();
    if records.is_empty() {
        if let Some(html) = bundle.raw_html.as_deref() {
            records = extract_cards_from_html(&bundle.page_name, html).unwrap_or_default();
        }
    }

    records
        .into_iter()
        .filter(|r| !r.headline.is_empty() || !r.body_text.is_empty() || !r.image_url.is_empty())
        .map(|mut record| {
            if record.ad_id.trim().is_empty() {
                record.ad_id = derive_stable_ad_id(&bundle.page_name, &record);
            }
            AdCandidate {
                ad_id: record.ad_id,
                competitor_id: competitor.id,
                ad_type: record.ad_type,
                headline: record.headline,
                body_text: record.body_text,
                image_url: record.image_url,
                video_url: record.video_url,
            }
        })
        .collect()
}

/// Filesystem slug for a competitor page name.
pub fn page_slug(page_name: &str) -> String {
    page_name
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}

/// Capture-bundle source: one `<slug>.json` bundle per competitor under a
/// captures directory. A missing bundle is an empty pass, not an error.
#[derive(Debug, Clone)]
pub struct FileCaptureSource {
    captures_dir: PathBuf,
}

impl FileCaptureSource {
    pub fn new(captures_dir: impl Into<PathBuf>) -> Self {
        Self {
            captures_dir: captures_dir.into(),
        }
    }

    fn bundle_path(&self, competitor: &Competitor) -> PathBuf {
        self.captures_dir
            .join(format!("{}.json", page_slug(&competitor.page_name)))
    }
}

#[async_trait]
impl AdSource for FileCaptureSource {
    fn source_id(&self) -> &'static str {
        "file-capture"
    }

    async fn collect(&self, competitor: &Competitor) -> Result<Vec<AdCandidate>, AdapterError> {
        let path = self.bundle_path(competitor);
        if !path.exists() {
            debug!(page_name = %competitor.page_name, path = %path.display(), "no capture bundle");
            return Ok(Vec::new());
        }
        let bundle = load_capture_bundle(&path)?;
        Ok(bundle_candidates(&bundle, competitor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SAMPLE_PAGE: &str = r#"
        <html><body>
          <div data-testid="search-result-card" data-ad-id="fb-123">
            <div style="font-weight: 600">Run Far</div>
            <div dir="auto">Engineered for distance runners.</div>
            <video src="https://video.example.com/run.mp4"></video>
          </div>
          <div data-testid="search-result-card">
            <div style="font-weight: 700">Join 1 Million Happy Customers</div>
            <div dir="auto">Real results from real customers.</div>
            <img src="https://scontent.example.com/social.jpg"/>
          </div>
          <div data-testid="search-result-card"></div>
        </body></html>
    "#;

    fn nike() -> Competitor {
        Competitor {
            id: 1,
            page_name: "Nike".into(),
            page_id: None,
            added_at: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap(),
        }
    }

    #[test]
    fn html_extraction_reads_cards_and_types() {
        let records = extract_cards_from_html("Nike", SAMPLE_PAGE).expect("extract");
        assert_eq!(records.len(), 3);

        assert_eq!(records[0].ad_id, "fb-123");
        assert_eq!(records[0].ad_type, AdType::Video);
        assert_eq!(records[0].headline, "Run Far");
        assert_eq!(records[0].video_url, "https://video.example.com/run.mp4");

        assert_eq!(records[1].ad_type, AdType::Static);
        assert_eq!(records[1].image_url, "https://scontent.example.com/social.jpg");
        assert!(records[1].ad_id.starts_with("ad_"));
    }

    #[test]
    fn derived_ids_are_stable_and_content_sensitive() {
        let record = CaptureRecord {
            headline: "Run Far".into(),
            body_text: "Engineered for distance.".into(),
            ..CaptureRecord::default()
        };
        let id_a = derive_stable_ad_id("Nike", &record);
        let id_b = derive_stable_ad_id("Nike", &record);
        assert_eq!(id_a, id_b);

        let mut other = record.clone();
        other.headline = "Run Farther".into();
        assert_ne!(id_a, derive_stable_ad_id("Nike", &other));
        assert_ne!(id_a, derive_stable_ad_id("Adidas", &record));
    }

    #[test]
    fn bundle_candidates_drop_contentless_cards() {
        let bundle = CaptureBundle {
            page_name: "Nike".into(),
            captured_from_url: "https://www.facebook.com/ads/library/?q=Nike".into(),
            fetched_at: Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap(),
            raw_html: Some(SAMPLE_PAGE.to_string()),
            records: Vec::new(),
        };

        let candidates = bundle_candidates(&bundle, &nike());
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|c| !c.is_malformed()));
        assert!(candidates.iter().all(|c| c.competitor_id == 1));
    }

    #[test]
    fn page_slug_normalizes_names() {
        assert_eq!(page_slug("Warby Parker"), "warby-parker");
        assert_eq!(page_slug("Nike"), "nike");
    }

    #[tokio::test]
    async fn file_capture_source_reads_bundles_and_tolerates_missing_ones() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bundle = CaptureBundle {
            page_name: "Nike".into(),
            captured_from_url: "https://www.facebook.com/ads/library/?q=Nike".into(),
            fetched_at: Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap(),
            raw_html: None,
            records: vec![CaptureRecord {
                ad_id: "a1".into(),
                ad_type: AdType::Static,
                headline: "Run Far".into(),
                ..CaptureRecord::default()
            }],
        };
        std::fs::write(
            dir.path().join("nike.json"),
            serde_json::to_vec_pretty(&bundle).unwrap(),
        )
        .unwrap();

        let source = FileCaptureSource::new(dir.path());
        let candidates = source.collect(&nike()).await.expect("collect");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].ad_id, "a1");

        let mut adidas = nike();
        adidas.page_name = "Adidas".into();
        let empty = source.collect(&adidas).await.expect("collect");
        assert!(empty.is_empty());
    }
}
