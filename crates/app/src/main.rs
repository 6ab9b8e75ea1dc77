mod demo;

use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use musical_conductor_core::{
    AppConfig, Collaborators, Conductor, ConductorError, InteractionManifest, KeyValueStore,
    MemoryStore, MemorySurface, PluginManifest, SequenceDef, TopicRouter, UiSurface,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> musical_conductor_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { files } => run_validate(&files),
        Commands::Demo { theme, config } => run_demo(theme, config).await,
        Commands::Routes { manifest } => run_routes(&manifest),
    }
}

fn run_validate(files: &[PathBuf]) -> musical_conductor_core::Result<()> {
    let mut invalid = 0;
    for path in files {
        match validate_file(path) {
            Ok(summary) => println!("{}: ok ({summary})", path.display()),
            Err(err) => {
                invalid += 1;
                println!("{}: {err}", path.display());
            }
        }
    }

    if invalid > 0 {
        return Err(ConductorError::msg(format!("{invalid} of {} files invalid", files.len())));
    }
    Ok(())
}

/// Accepts either a single sequence definition or a plugin manifest.
fn validate_file(path: &PathBuf) -> musical_conductor_core::Result<String> {
    let content = std::fs::read_to_string(path)?;

    if let Ok(sequence) = SequenceDef::from_json(&content) {
        check_sequence(&sequence)?;
        return Ok(format!(
            "sequence `{}`, {} beats, handlers: {}",
            sequence.id,
            sequence.beat_count(),
            sequence.handler_names().join(", ")
        ));
    }

    let manifest = PluginManifest::from_json(&content)?;
    for sequence in &manifest.sequences {
        check_sequence(sequence)?;
    }
    for (topic, sequence_id) in &manifest.topics {
        if !manifest.sequences.iter().any(|sequence| &sequence.id == sequence_id) {
            return Err(ConductorError::InvalidSequence(format!(
                "topic `{topic}` targets unknown sequence `{sequence_id}`"
            )));
        }
    }
    Ok(format!(
        "plugin `{}`, {} sequences, {} topics",
        manifest.id,
        manifest.sequences.len(),
        manifest.topics.len()
    ))
}

fn check_sequence(sequence: &SequenceDef) -> musical_conductor_core::Result<()> {
    sequence.validate()?;
    let reparsed = SequenceDef::from_json(&sequence.to_json()?)?;
    if &reparsed != sequence {
        return Err(ConductorError::Serialization(format!(
            "sequence `{}` does not survive a JSON round trip",
            sequence.id
        )));
    }
    Ok(())
}

async fn run_demo(theme: Option<String>, config: Option<PathBuf>) -> musical_conductor_core::Result<()> {
    let config = match config {
        Some(path) => AppConfig::load(&path)?,
        None => AppConfig::default(),
    };
    let theme = theme.unwrap_or_else(|| config.demo.default_theme.clone());
    tracing::info!(%theme, topic = %config.demo.topic, "starting demo");

    let surface = Arc::new(MemorySurface::new());
    let store = Arc::new(MemoryStore::new());
    let conductor = Conductor::builder(config.conductor.clone())
        .collaborators(
            Collaborators::new()
                .with_ui(surface.clone())
                .with_store(store.clone()),
        )
        .build();
    conductor.mount_plugin(&demo::bundle(&config.demo))?;

    let summary = conductor.publish(&config.demo.topic, json!({ "targetTheme": theme }));
    for failure in &summary.failures {
        tracing::warn!(route = %failure.route, error = %failure.error, "route failed to start");
    }

    let mut failed = false;
    for outcome in summary.wait_all().await {
        let outcome = outcome?;
        failed |= !outcome.is_success();
        let report = json!({
            "sequence": outcome.key.sequence_id,
            "correlationId": outcome.key.correlation_id,
            "state": outcome.state.to_string(),
            "durationMs": outcome.duration.as_millis() as u64,
            "baton": outcome.baton,
            "error": outcome.error.as_ref().map(ToString::to_string),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    println!(
        "ui body[data-theme] = {}",
        surface.property("body", "data-theme").unwrap_or_else(|| "<unset>".to_string())
    );
    println!("store ui.theme = {}", store.get("ui.theme").await?.unwrap_or_default());
    println!("{}", serde_json::to_string_pretty(&conductor.statistics())?);

    if failed {
        return Err(ConductorError::msg("demo sequence failed"));
    }
    Ok(())
}

fn run_routes(manifest: &PathBuf) -> musical_conductor_core::Result<()> {
    let content = std::fs::read_to_string(manifest)?;
    let manifest = InteractionManifest::from_json(&content)?;
    let router = TopicRouter::new();
    let loaded = router.load_manifest(&manifest)?;
    tracing::info!(routes = loaded, "loaded interaction manifest");

    for topic in router.topics() {
        let targets: Vec<String> = router.routes(&topic).iter().map(ToString::to_string).collect();
        println!("{topic} -> {}", targets.join(", "));
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Sequence orchestration engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse and validate sequence definitions or plugin manifests.
    Validate {
        /// JSON files to check.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Mount the built-in theme plugin and publish a theme change.
    Demo {
        /// Theme to request; defaults to the configured theme.
        #[arg(short, long)]
        theme: Option<String>,
        /// Optional TOML configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print the routing table of an interaction manifest.
    Routes {
        /// Interaction manifest JSON file.
        manifest: PathBuf,
    },
}
