//! Core domain model for CALT.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "calt-core";

/// Seconds in one whole day, the unit of ad longevity.
pub const SECONDS_PER_DAY: u64 = 86_400;

/// A tracked competitor page. Append-only: records are never mutated or
/// deleted after registration, and `page_name` is unique across the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Competitor {
    pub id: u64,
    pub page_name: String,
    pub page_id: Option<String>,
    pub added_at: DateTime<Utc>,
}

/// Creative format observed at capture time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdType {
    Video,
    #[default]
    Static,
    Carousel,
    TextOnly,
}

impl AdType {
    pub fn wire_name(self) -> &'static str {
        match self {
            AdType::Video => "video",
            AdType::Static => "static",
            AdType::Carousel => "carousel",
            AdType::TextOnly => "text_only",
        }
    }
}

/// Where an ad's classification came from. Fallback-tagged classifications
/// may be cleared by an operator to re-attempt external classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationProvenance {
    External,
    Fallback,
}

/// AI-derived metadata. Category and hook are set together or not at all,
/// which the model enforces by making the pair one optional struct on [`Ad`].
/// Both are free strings: the classifier is prompted with a fixed vocabulary
/// but its output is stored as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub category: String,
    pub hook: String,
    pub provenance: ClassificationProvenance,
}

/// A tracked ad record. `ad_id` is the externally supplied dedup key;
/// `first_seen` is immutable after creation, and `days_running` is derived
/// from it by the longevity recompute pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ad {
    pub ad_id: String,
    pub competitor_id: u64,
    pub ad_type: AdType,
    pub headline: String,
    pub body_text: String,
    pub image_url: String,
    pub video_url: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub is_active: bool,
    pub days_running: u32,
    #[serde(default)]
    pub classification: Option<Classification>,
}

impl Ad {
    /// Whether the ad carries an image reference the classifier can fetch.
    pub fn has_usable_image(&self) -> bool {
        self.image_url.starts_with("http")
    }
}

/// Proposed ad record handed to the engine by an acquisition pass. Carries
/// everything except lifecycle and derived fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdCandidate {
    pub ad_id: String,
    pub competitor_id: u64,
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

impl AdCandidate {
    /// A candidate without a usable `ad_id` cannot participate in dedup and
    /// is rejected before it reaches the store.
    pub fn is_malformed(&self) -> bool {
        self.ad_id.trim().is_empty()
    }
}

/// Append-only audit record, one per completed acquisition pass per
/// competitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeEvent {
    pub id: u64,
    pub competitor_id: u64,
    pub scraped_at: DateTime<Utc>,
    pub ads_found: u32,
    pub new_ads: u32,
}

/// Whole days between two instants, by absolute difference. Clock skew that
/// places `first_seen` in the future must yield 0, not a panic or a negative.
pub fn whole_days_between(a: DateTime<Utc>, b: DateTime<Utc>) -> u32 {
    let seconds = (b - a).num_seconds().unsigned_abs();
    (seconds / SECONDS_PER_DAY) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).single().unwrap()
    }

    #[test]
    fn whole_days_floor_partial_days() {
        assert_eq!(whole_days_between(at(1, 0), at(1, 23)), 0);
        assert_eq!(whole_days_between(at(1, 0), at(2, 0)), 1);
        assert_eq!(whole_days_between(at(1, 6), at(11, 5)), 9);
        assert_eq!(whole_days_between(at(1, 6), at(11, 6)), 10);
    }

    #[test]
    fn whole_days_absolute_under_clock_skew() {
        assert_eq!(whole_days_between(at(10, 0), at(3, 0)), 7);
        assert_eq!(whole_days_between(at(10, 0), at(10, 0)), 0);
    }

    #[test]
    fn ad_type_wire_names() {
        assert_eq!(AdType::Video.wire_name(), "video");
        assert_eq!(AdType::TextOnly.wire_name(), "text_only");
        let parsed: AdType = serde_json::from_str("\"text_only\"").unwrap();
        assert_eq!(parsed, AdType::TextOnly);
    }

    #[test]
    fn blank_ad_id_is_malformed() {
        let mut candidate = AdCandidate {
            ad_id: "  ".into(),
            competitor_id: 1,
            ad_type: AdType::Static,
            headline: "Run Far".into(),
            body_text: String::new(),
            image_url: String::new(),
            video_url: String::new(),
        };
        assert!(candidate.is_malformed());
        candidate.ad_id = "a1".into();
        assert!(!candidate.is_malformed());
    }
}
