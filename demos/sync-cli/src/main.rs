//! Command-line client for a tagsync backend.
//!
//! Run the demo server first, then:
//!   tagsync watch p1
//!   tagsync sync p1 --vendor siemens --file main.st
//!   tagsync edit p1 --set line.name='"Line 2"' --set line.speed=1200 --message "retune"
//!   tagsync history p1
//!   tagsync diff p1 1 2
//!   tagsync rollback p1 1
//!
//! Settings come from `--config tagsync.toml` (see `ClientConfig`), with
//! `--api`, `--ws` and `TAGSYNC_TOKEN` overriding the file.

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::time::Duration;
use tagsync_core::{Change, ConnectionStatus, EventKind, ServerMessage, Vendor, diff};
use tagsync_client::{
    AutosaveEvent, AutosaveEventKind, AutosavePipeline, ClientConfig, ConnectionManager,
    FallbackCache, FileFallbackStore, HttpStore, RemoteStore,
};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tagsync", about = "Talk to a tagsync backend")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true, env = "TAGSYNC_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, global = true, env = "TAGSYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,
    /// REST base URL, e.g. http://127.0.0.1:8080/api
    #[arg(long, global = true)]
    api: Option<String>,
    /// WebSocket URL, e.g. ws://127.0.0.1:8081/ws/tags
    #[arg(long, global = true)]
    ws: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to a project and print its events until interrupted.
    Watch { project: String },
    /// Send structured text to be parsed into tags and wait for the result.
    Sync {
        project: String,
        #[arg(long, default_value = "siemens")]
        vendor: Vendor,
        /// Structured text source file.
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value_t = 500)]
        debounce_ms: u64,
    },
    /// Change a project's state through the autosave pipeline.
    Edit {
        project: String,
        /// Dotted path and JSON value; bare words are taken as strings.
        #[arg(long = "set", value_name = "PATH=VALUE")]
        assignments: Vec<String>,
        /// Save immediately and record a named version.
        #[arg(long)]
        message: Option<String>,
        /// Save immediately instead of waiting for the debounce.
        #[arg(long)]
        now: bool,
    },
    /// List a project's versions, newest first.
    History { project: String },
    /// Show what changed between two versions.
    Diff { project: String, from: u64, to: u64 },
    /// Restore an earlier version.
    Rollback { project: String, version: u64 },
    DeleteVersion { project: String, version: u64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tagsync=info".parse()?)
                .add_directive("tagsync_client=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Command::Watch { project } => watch(&config, project).await,
        Command::Sync {
            project,
            vendor,
            file,
            debounce_ms,
        } => {
            let st_code = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            sync(&config, project, vendor, st_code, debounce_ms).await
        }
        Command::Edit {
            project,
            assignments,
            message,
            now,
        } => edit(&config, project, &assignments, message, now).await,
        Command::History { project } => history(&config, &project).await,
        Command::Diff { project, from, to } => show_diff(&config, &project, from, to).await,
        Command::Rollback { project, version } => {
            let store = http_store(&config)?;
            let outcome = remote(&store).rollback(&project, version).await?;
            println!(
                "rolled back to v{}, recorded as v{}",
                outcome.rolled_back_to, outcome.new_version
            );
            Ok(())
        }
        Command::DeleteVersion { project, version } => {
            let store = http_store(&config)?;
            remote(&store).delete_version(&project, version).await?;
            println!("deleted v{version}");
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    if let Some(token) = &cli.token {
        config.token = Some(token.clone());
    }
    if let Some(api) = &cli.api {
        config.api_base_url = api.clone();
    }
    if let Some(ws) = &cli.ws {
        config.ws_url = ws.clone();
    }
    config.validate()?;
    Ok(config)
}

fn http_store(config: &ClientConfig) -> anyhow::Result<HttpStore> {
    Ok(HttpStore::new(&config.api_base_url, config.token.clone())?)
}

/// The store viewed as holding JSON documents.
fn remote(store: &HttpStore) -> &impl RemoteStore<Value> {
    store
}

/// Used when the config names no fallback directory.
const DEFAULT_FALLBACK_DIR: &str = ".tagsync/fallback";

fn fallback_dir(config: &ClientConfig) -> PathBuf {
    config
        .fallback_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_FALLBACK_DIR))
}

/// Fallback entries live on disk so a failed save survives this process.
fn fallback_cache(config: &ClientConfig) -> anyhow::Result<FallbackCache> {
    let store = FileFallbackStore::new(fallback_dir(config))?;
    Ok(FallbackCache::new(store, config.app_namespace.clone()))
}

async fn watch(config: &ClientConfig, project: String) -> anyhow::Result<()> {
    let manager = ConnectionManager::new(config.connection_settings());
    for kind in [EventKind::TagsUpdated, EventKind::SyncQueued, EventKind::Error, EventKind::Pong] {
        manager.on(kind, |msg| match serde_json::to_string(msg) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, "unprintable event"),
        });
    }
    manager.subscribe(project);
    manager.connect();

    let mut states = manager.watch();
    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                tracing::info!(status = ?state.status, attempts = state.attempt_count, error = ?state.last_error, "connection");
                if state.status == ConnectionStatus::CircuitOpen {
                    bail!("{}", state.last_error.unwrap_or_else(|| "circuit open".into()));
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    manager.disconnect();
    Ok(())
}

async fn sync(
    config: &ClientConfig,
    project: String,
    vendor: Vendor,
    st_code: String,
    debounce_ms: u64,
) -> anyhow::Result<()> {
    let manager = ConnectionManager::new(config.connection_settings());
    let (tx, mut rx) = mpsc::unbounded_channel();
    for kind in [EventKind::TagsUpdated, EventKind::Error] {
        let tx = tx.clone();
        manager.on(kind, move |msg| {
            let _ = tx.send(msg.clone());
        });
    }

    manager.subscribe(project.clone());
    manager.connect();
    let connect_budget = config.connection.connect_timeout() * config.connection.max_attempts;
    let state = tokio::time::timeout(connect_budget, async {
        let mut states = manager.watch();
        let state = states
            .wait_for(|s| matches!(s.status, ConnectionStatus::Connected | ConnectionStatus::CircuitOpen))
            .await?;
        Ok::<_, anyhow::Error>(state.clone())
    })
    .await
    .context("timed out connecting")??;
    if state.status == ConnectionStatus::CircuitOpen {
        bail!("could not connect: {}", state.last_error.unwrap_or_default());
    }

    manager.sync_tags(project.as_str(), vendor, st_code, debounce_ms)?;
    tracing::info!(%project, %vendor, "sync requested");

    let wait = Duration::from_millis(debounce_ms) + Duration::from_secs(10);
    let reply = tokio::time::timeout(wait, async {
        while let Some(msg) = rx.recv().await {
            match &msg {
                ServerMessage::TagsUpdated { project_id, .. } if *project_id == project => return Some(msg),
                ServerMessage::Error { .. } => return Some(msg),
                _ => {}
            }
        }
        None
    })
    .await
    .context("timed out waiting for tags")?;

    match reply {
        Some(ServerMessage::TagsUpdated { tags, parsed_count, .. }) => {
            println!("{parsed_count} tags");
            for tag in tags {
                println!(
                    "{:<24} {:<16} {:<12} {}",
                    tag.name,
                    tag.data_type.unwrap_or_default(),
                    tag.address.unwrap_or_default(),
                    tag.description.unwrap_or_default()
                );
            }
        }
        Some(ServerMessage::Error { error, .. }) => bail!("server error: {error}"),
        _ => bail!("connection ended before a reply"),
    }
    manager.disconnect();
    Ok(())
}

/// Turn `a.b.c=VALUE` into `{"a": {"b": {"c": VALUE}}}`.
fn assignment_patch(assignment: &str) -> anyhow::Result<Value> {
    let (path, raw) = assignment
        .split_once('=')
        .with_context(|| format!("expected PATH=VALUE, got '{assignment}'"))?;
    if path.is_empty() {
        bail!("empty path in '{assignment}'");
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok(path.rsplit('.').fold(value, |inner, key| {
        let mut object = serde_json::Map::new();
        object.insert(key.to_string(), inner);
        Value::Object(object)
    }))
}

async fn edit(
    config: &ClientConfig,
    project: String,
    assignments: &[String],
    message: Option<String>,
    now: bool,
) -> anyhow::Result<()> {
    let store = http_store(config)?;
    let initial: Value = store.fetch(&project).await?.unwrap_or_else(|| json!({}));
    let pipeline = AutosavePipeline::open(
        project,
        initial,
        store,
        fallback_cache(config)?,
        config.autosave.clone(),
    )
    .await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    for kind in [
        AutosaveEventKind::Saved,
        AutosaveEventKind::SaveFailed,
        AutosaveEventKind::VersionCreated,
        AutosaveEventKind::VersionFailed,
        AutosaveEventKind::Recovered,
    ] {
        let tx = tx.clone();
        pipeline.on(kind, move |event| {
            tracing::info!(?event, "autosave");
            let _ = tx.send(event.clone());
        });
    }

    for assignment in assignments {
        pipeline.merge(assignment_patch(assignment)?)?;
    }

    if let Some(message) = message {
        let report = pipeline.save_with_message(&message).await?;
        match (report.version, report.version_error) {
            (Some(version), _) => println!("saved, version v{version}"),
            (None, Some(error)) => println!("saved, but no version was recorded: {error}"),
            (None, None) => println!("saved"),
        }
    } else if now {
        pipeline.save_now().await?;
        println!("saved");
    } else {
        while pipeline.has_unsaved_changes() {
            match rx.recv().await {
                Some(AutosaveEvent::SaveFailed {
                    will_retry: false,
                    error,
                    ..
                }) => bail!("autosave gave up: {error}"),
                Some(_) => {}
                None => break,
            }
        }
        println!("autosaved");
    }

    println!("{}", serde_json::to_string_pretty(&pipeline.state())?);
    Ok(())
}

async fn history(config: &ClientConfig, project: &str) -> anyhow::Result<()> {
    let store = http_store(config)?;
    for version in remote(&store).version_history(project).await? {
        println!(
            "v{:<4} {:<6} {:<14} {}",
            version.version_number,
            if version.is_auto { "auto" } else { "manual" },
            version.created_at.unwrap_or_default(),
            version.message.unwrap_or_default()
        );
    }
    Ok(())
}

async fn show_diff(config: &ClientConfig, project: &str, from: u64, to: u64) -> anyhow::Result<()> {
    let store = http_store(config)?;
    let versions = remote(&store).version_history(project).await?;
    let state_of = |n: u64| {
        versions
            .iter()
            .find(|v| v.version_number == n)
            .and_then(|v| v.state.as_ref())
            .with_context(|| format!("version v{n} has no stored state"))
    };
    let changes = diff(state_of(from)?, state_of(to)?);
    if changes.is_empty() {
        println!("no changes");
    }
    for change in changes {
        match change {
            Change::Added { path, value } => println!("+ {path}: {value}"),
            Change::Removed { path, value } => println!("- {path}: {value}"),
            Change::Modified { path, from, to } => println!("~ {path}: {from} -> {to}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignments_nest_by_path() {
        assert_eq!(
            assignment_patch("line.speed=1200").unwrap(),
            json!({"line": {"speed": 1200}})
        );
        assert_eq!(assignment_patch("name=Line 2").unwrap(), json!({"name": "Line 2"}));
        assert_eq!(assignment_patch("tags=null").unwrap(), json!({"tags": null}));
        assert!(assignment_patch("novalue").is_err());
        assert!(assignment_patch("=1").is_err());
    }

    #[test]
    fn fallback_defaults_to_a_local_directory() {
        let mut config = ClientConfig::default();
        assert_eq!(fallback_dir(&config), PathBuf::from(".tagsync/fallback"));
        config.fallback_dir = Some(PathBuf::from("/var/cache/tagsync"));
        assert_eq!(fallback_dir(&config), PathBuf::from("/var/cache/tagsync"));
    }

    #[test]
    fn cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
        let cli = Cli::parse_from(["tagsync", "sync", "p1", "--vendor", "beckhoff", "--file", "a.st"]);
        assert!(matches!(cli.command, Command::Sync { vendor: Vendor::Beckhoff, .. }));
    }
}
