use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use calt_adapters::{AdSource, FileCaptureSource};
use calt_engine::{maybe_build_scheduler, seed_demo_data, Tracker, TrackerConfig};
use calt_enrich::{AdClassifier, EnrichmentCoordinator, OpenAiClassifier};
use calt_store::JsonStore;
use calt_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "calt")]
#[command(about = "Competitor ad longevity tracker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one acquisition pass over every registered competitor.
    Ingest,
    /// Recompute days-running for all active ads.
    Recompute,
    /// Classify pending ads via the external classifier.
    Enrich {
        /// Clear fallback classifications first so they are retried.
        #[arg(long)]
        retry_fallback: bool,
    },
    /// Deactivate ads not re-observed within the grace window.
    Sweep {
        /// Override CALT_STALE_AFTER_DAYS for this run.
        #[arg(long)]
        grace_days: Option<u32>,
    },
    /// Write a winners report for the current state.
    Report,
    /// Seed deterministic demo data.
    Seed,
    /// Serve the JSON API, with scheduled passes when enabled.
    Serve,
}

fn build_classifier(config: &TrackerConfig) -> Result<Arc<dyn AdClassifier>> {
    if config.classifier_api_key.is_none() {
        warn!("OPENAI_API_KEY not set; external classification will fail and fall back");
    }
    let api_key = config
        .classifier_api_key
        .clone()
        .unwrap_or_else(|| "dummy-key".to_string());
    let mut classifier = OpenAiClassifier::new(
        api_key,
        config.classifier_model.clone(),
        Duration::from_secs(config.http_timeout_secs),
    )?;
    if let Some(base_url) = &config.classifier_base_url {
        classifier = classifier.with_base_url(base_url.clone());
    }
    Ok(Arc::new(classifier))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let config = TrackerConfig::from_env();
    let store = Arc::new(JsonStore::new(config.data_dir.clone()));
    let tracker = Arc::new(Tracker::new(Arc::clone(&store)));

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Ingest => {
            if config.competitors_file.exists() {
                let created = tracker.register_from_file(&config.competitors_file).await?;
                info!(created, "competitor registry synced");
            } else {
                warn!(path = %config.competitors_file.display(), "no competitor registry file");
            }
            let source = FileCaptureSource::new(config.captures_dir.clone());
            let summary = tracker.ingest_pass(&source).await?;
            println!(
                "ingest complete: run_id={} candidates={} created={} refreshed={} rejected={}",
                summary.run_id,
                summary.candidates,
                summary.created,
                summary.refreshed,
                summary.rejected
            );
        }
        Commands::Recompute => {
            let recomputed = tracker.recompute_longevity(Utc::now()).await?;
            println!("recomputed days_running for {recomputed} active ads");
        }
        Commands::Enrich { retry_fallback } => {
            if retry_fallback {
                let cleared = store.clear_fallback_classifications().await?;
                println!("cleared {cleared} fallback classifications");
            }
            let coordinator = EnrichmentCoordinator::new(
                Arc::clone(&store),
                build_classifier(&config)?,
                Duration::from_millis(config.enrich_delay_ms),
            );
            let summary = coordinator.enrich_pending().await?;
            println!(
                "enrichment complete: examined={} skipped={} external={} fallbacks={}",
                summary.examined, summary.skipped, summary.external, summary.fallbacks
            );
        }
        Commands::Sweep { grace_days } => {
            let grace = grace_days.unwrap_or(config.stale_after_days);
            let swept = tracker.sweep_stale(Utc::now(), grace).await?;
            println!("deactivated {swept} ads not seen in {grace} days");
        }
        Commands::Report => {
            let path = tracker
                .write_winners_report(&config.reports_dir, Utc::now())
                .await?;
            println!("report written to {}", path.display());
        }
        Commands::Seed => {
            let created = seed_demo_data(&store, Utc::now()).await?;
            println!("seeded {created} demo ads");
        }
        Commands::Serve => {
            let source: Arc<dyn AdSource> =
                Arc::new(FileCaptureSource::new(config.captures_dir.clone()));
            let coordinator = Arc::new(EnrichmentCoordinator::new(
                Arc::clone(&store),
                build_classifier(&config)?,
                Duration::from_millis(config.enrich_delay_ms),
            ));
            let _scheduler =
                maybe_build_scheduler(&config, Arc::clone(&tracker), source, coordinator).await?;

            let state = AppState::new(Arc::clone(&tracker), config.reports_dir.clone());
            info!(port = config.web_port, "serving api");
            tokio::select! {
                result = calt_web::serve(state, config.web_port) => result?,
                () = shutdown_signal() => {}
            }
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl-c");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("received shutdown signal, stopping");
}
