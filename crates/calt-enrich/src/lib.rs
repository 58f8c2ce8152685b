//! Enrichment: attach AI-derived category/hook metadata to ads.
//!
//! The external classifier is a capability that may fail. Every failure mode
//! terminates in the deterministic fallback, so an enrichment pass always
//! leaves every examined ad with both fields set.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use calt_core::{Ad, AdType, Classification, ClassificationProvenance};
use calt_store::JsonStore;

pub const CRATE_NAME: &str = "calt-enrich";

/// Vocabulary offered to the classifier. Prompt text only: responses are
/// stored as-is.
pub const KNOWN_CATEGORIES: [&str; 6] = [
    "video",
    "carousel",
    "static_image",
    "text_only",
    "ugc_style",
    "professional",
];
pub const KNOWN_HOOKS: [&str; 6] = [
    "emotional",
    "logical",
    "urgency",
    "social_proof",
    "curiosity",
    "fear_of_missing_out",
];

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("classifier http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("malformed classifier response: {0}")]
    Malformed(String),
}

/// Classifier output before provenance is attached.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Verdict {
    pub category: String,
    pub hook: String,
}

/// One classification request. `image_url` is set only when the ad carries a
/// fetchable image, which switches the wire payload to the vision variant.
#[derive(Debug, Clone)]
pub struct ClassifyRequest<'a> {
    pub headline: &'a str,
    pub body_text: &'a str,
    pub ad_type: AdType,
    pub image_url: Option<&'a str>,
}

#[async_trait]
pub trait AdClassifier: Send + Sync {
    async fn classify(&self, request: ClassifyRequest<'_>) -> Result<Verdict, ClassifierError>;
}

/// Deterministic local fallback. Never fails: this is the terminal error
/// boundary for enrichment.
pub fn fallback_classification(ad: &Ad) -> Classification {
    let hook = if ad.headline.trim().is_empty() {
        "unknown"
    } else {
        "curiosity"
    };
    Classification {
        category: ad.ad_type.wire_name().to_string(),
        hook: hook.to_string(),
        provenance: ClassificationProvenance::Fallback,
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible chat-completions classifier
// ---------------------------------------------------------------------------

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: WireContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrlRef },
}

#[derive(Debug, Serialize)]
struct ImageUrlRef {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

pub struct OpenAiClassifier {
    api_key: String,
    model: String,
    base_url: String,
    http: reqwest::Client,
}

impl OpenAiClassifier {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building classifier http client")?;
        Ok(Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            http,
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn prompt_text(request: &ClassifyRequest<'_>) -> String {
        let headline = if request.headline.is_empty() {
            "N/A"
        } else {
            request.headline
        };
        let body = if request.body_text.is_empty() {
            "N/A"
        } else {
            request.body_text
        };
        format!(
            "Analyze this Facebook ad and provide:\n\
             1. Category (one of: {})\n\
             2. Primary hook/angle (one of: {})\n\n\
             Headline: {}\n\
             Body: {}\n\
             Type: {}\n\n\
             Respond in JSON format: {{\"category\": \"...\", \"hook\": \"...\"}}",
            KNOWN_CATEGORIES.join(", "),
            KNOWN_HOOKS.join(", "),
            headline,
            body,
            request.ad_type.wire_name(),
        )
    }

    fn build_message(request: &ClassifyRequest<'_>) -> WireMessage {
        let text = Self::prompt_text(request);
        let content = match request.image_url {
            Some(url) => WireContent::Parts(vec![
                ContentPart::Text { text },
                ContentPart::ImageUrl {
                    image_url: ImageUrlRef {
                        url: url.to_string(),
                    },
                },
            ]),
            None => WireContent::Text(text),
        };
        WireMessage {
            role: "user",
            content,
        }
    }
}

/// Pull a `Verdict` out of a model reply, tolerating markdown code fences.
fn parse_verdict(content: &str) -> Result<Verdict, ClassifierError> {
    let trimmed = content.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end_matches("```"))
        .unwrap_or(trimmed)
        .trim();
    serde_json::from_str(trimmed).map_err(|e| ClassifierError::Malformed(e.to_string()))
}

#[async_trait]
impl AdClassifier for OpenAiClassifier {
    async fn classify(&self, request: ClassifyRequest<'_>) -> Result<Verdict, ClassifierError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![Self::build_message(&request)],
            max_tokens: 300,
            temperature: 0.3,
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let chat: ChatResponse = response.json().await?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ClassifierError::Malformed("empty choices".to_string()))?;
        parse_verdict(&content)
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct EnrichmentSummary {
    pub examined: usize,
    pub skipped: usize,
    pub external: usize,
    pub fallbacks: usize,
}

/// Walks the active set one ad at a time, classifying whatever is still
/// pending. External calls are paced by a minimum inter-call delay; skips
/// cost nothing.
pub struct EnrichmentCoordinator {
    store: Arc<JsonStore>,
    classifier: Arc<dyn AdClassifier>,
    pace: Duration,
}

impl EnrichmentCoordinator {
    pub fn new(store: Arc<JsonStore>, classifier: Arc<dyn AdClassifier>, pace: Duration) -> Self {
        Self {
            store,
            classifier,
            pace,
        }
    }

    pub async fn enrich_pending(&self) -> anyhow::Result<EnrichmentSummary> {
        let ads = self.store.scan_active().await.context("scanning active ads")?;
        let mut summary = EnrichmentSummary::default();
        let mut calls = 0usize;

        for ad in &ads {
            summary.examined += 1;
            if ad.classification.is_some() {
                summary.skipped += 1;
                continue;
            }

            if calls > 0 && !self.pace.is_zero() {
                tokio::time::sleep(self.pace).await;
            }
            calls += 1;

            let request = ClassifyRequest {
                headline: &ad.headline,
                body_text: &ad.body_text,
                ad_type: ad.ad_type,
                image_url: ad.has_usable_image().then_some(ad.image_url.as_str()),
            };

            let classification = match self.classifier.classify(request).await {
                Ok(verdict) => {
                    summary.external += 1;
                    Classification {
                        category: verdict.category,
                        hook: verdict.hook,
                        provenance: ClassificationProvenance::External,
                    }
                }
                Err(err) => {
                    warn!(ad_id = %ad.ad_id, error = %err, "external classification failed, applying fallback");
                    summary.fallbacks += 1;
                    fallback_classification(ad)
                }
            };

            self.store
                .set_classification(&ad.ad_id, classification)
                .await
                .with_context(|| format!("persisting classification for {}", ad.ad_id))?;
        }

        info!(
            examined = summary.examined,
            skipped = summary.skipped,
            external = summary.external,
            fallbacks = summary.fallbacks,
            "enrichment pass complete"
        );
        Ok(summary)
    }
}
