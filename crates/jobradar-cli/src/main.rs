use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobradar_core::{Cursor, SourceState};
use jobradar_engine::{CrawlOptions, EngineConfig, SourceRegistry};
use jobradar_storage::{PgStore, SourceStateRepository};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "jobradar-cli")]
#[command(about = "Incremental job-posting crawler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl every enabled source once.
    Crawl {
        /// Run sources even while they are cooling down.
        #[arg(long)]
        ignore_cooldown: bool,
        /// Roll back all writes and skip notifications.
        #[arg(long)]
        dry_run: bool,
        /// Only crawl this source. Repeatable.
        #[arg(long = "source", value_name = "ID")]
        sources: Vec<String>,
    },
    /// Apply pending SQL migrations.
    Migrate,
    /// Show configured sources with their crawl state.
    Sources,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn")))
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Crawl {
        ignore_cooldown: false,
        dry_run: false,
        sources: Vec::new(),
    });

    match command {
        Commands::Crawl {
            ignore_cooldown,
            dry_run,
            sources,
        } => {
            let report = jobradar_engine::run_crawl_once_from_env(CrawlOptions {
                ignore_cooldown,
                dry_run,
                only_sources: sources,
            })
            .await?;
            if let Some(notification) = report.notification {
                if let Err(err) = notification.await {
                    warn!(error = %err, "notification task did not complete");
                }
            }
            let run = &report.run;
            println!(
                "crawl complete: run_id={} attempted={} succeeded={} failed={} skipped={} inserted={} updated={}",
                run.run_id,
                run.sources_attempted.len(),
                run.sources_succeeded.len(),
                run.sources_failed.len(),
                run.sources_skipped.len(),
                run.inserted_count,
                run.updated_count,
            );
            for failure in &run.sources_failed {
                println!("  failed {}: {}", failure.source, failure.error);
            }
        }
        Commands::Migrate => {
            let config = EngineConfig::from_env();
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Sources => {
            let config = EngineConfig::from_env();
            let registry = match SourceRegistry::load(&config.workspace_root).await {
                Ok(registry) => Some(registry),
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "source registry unavailable, showing state only");
                    None
                }
            };
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to postgres")?;
            let states = store.list().await.context("listing source state")?;

            if let Some(registry) = &registry {
                for source in &registry.sources {
                    let state = states.iter().find(|s| s.source_id == source.source_id);
                    println!(
                        "{:<24} {} [{}] {}",
                        source.source_id,
                        source.label(),
                        if source.enabled { "enabled" } else { "disabled" },
                        state_columns(state),
                    );
                    if let Some(notes) = &source.notes {
                        println!("{:<24} note: {notes}", "");
                    }
                }
            }

            // Sources with stored state that the registry no longer lists.
            for state in states.iter().filter(|state| {
                registry
                    .as_ref()
                    .map_or(true, |r| r.get(&state.source_id).is_none())
            }) {
                println!("{:<24} [unregistered] {}", state.source_id, state_columns(Some(state)));
            }
            if states.is_empty() {
                println!("no source state recorded yet");
            }
        }
    }

    Ok(())
}

fn state_columns(state: Option<&SourceState>) -> String {
    let show = |value: Option<String>| value.unwrap_or_else(|| "-".to_string());
    let Some(state) = state else {
        return "failures=0 cooldown_until=- last_success=- high_water=-".to_string();
    };
    let cursor = Cursor::from_blob(state.cursor.as_ref());
    format!(
        "failures={} cooldown_until={} last_success={} high_water={}",
        state.consecutive_failures,
        show(state.cooldown_until.map(|t| t.to_rfc3339())),
        show(state.last_success_at.map(|t| t.to_rfc3339())),
        show(cursor.last_max_post_date_seen.map(|t| t.to_rfc3339())),
    )
}
