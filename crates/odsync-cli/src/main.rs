use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use odsync_core::PassSummary;
use odsync_normalize::{infer_types, table_name_for, RecordNormalizer};
use odsync_remote::{decode_collection_name, HttpRemoteClient, RateLimiter, RemoteSource};
use odsync_store::PgStore;
use odsync_sync::{
    check_drift, run_daemon, run_sync_once, PassThroughFilter, ResolvedSource, SourceRegistry,
    SyncConfig,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "odsync")]
#[command(about = "Mirror remote OData collections into PostgreSQL")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one pass over every enabled source.
    Sync {
        /// Query the remotes but keep all writes in memory.
        #[arg(long)]
        dry_run: bool,
    },
    /// Run passes on the configured cron schedule until interrupted.
    Run,
    /// Apply the sync-state migrations.
    Migrate,
    /// Compare remote counts with stored collection metadata.
    Check {
        #[arg(long)]
        source: Option<String>,
    },
    /// Fetch the first records of a collection and show the inferred columns.
    Preview {
        source: String,
        collection: String,
        #[arg(long, default_value_t = 5)]
        top: usize,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { dry_run: false }) {
        Commands::Sync { dry_run } => {
            let summaries = run_sync_once(&config, dry_run).await?;
            for summary in &summaries {
                print_summary(summary);
            }
        }
        Commands::Run => {
            run_daemon(config, Arc::new(PassThroughFilter)).await?;
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to state database")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Check { source } => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to state database")?;
            for resolved in load_sources(&config).await? {
                if source.as_deref().is_some_and(|name| name != resolved.name) {
                    continue;
                }
                let client = client_for(&config, &resolved)?;
                for report in check_drift(&client, &store).await? {
                    let remote = report
                        .remote_count
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "?".to_string());
                    let marker = if report.drifted() { "DRIFT" } else { "ok" };
                    println!(
                        "{:<5} {} {} stored={} remote={}{}",
                        marker,
                        resolved.name,
                        report.collection,
                        report.stored_count,
                        remote,
                        report
                            .error
                            .as_ref()
                            .map(|e| format!(" error={e}"))
                            .unwrap_or_default()
                    );
                }
            }
        }
        Commands::Preview {
            source,
            collection,
            top,
        } => {
            let resolved = load_sources(&config)
                .await?
                .into_iter()
                .find(|s| s.name == source)
                .ok_or_else(|| anyhow!("no enabled source named {source}"))?;
            let client = client_for(&config, &resolved)?;
            let records = client.preview_collection(&collection, top).await?;
            let rows = RecordNormalizer::default().expand_all(&records);

            println!(
                "table: {}",
                table_name_for(&resolved.table_prefix, &decode_collection_name(&collection))
            );
            for (column, column_type) in infer_types(&rows, rows.len().max(1)) {
                println!("  {column:<40} {column_type}");
            }
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }

    Ok(())
}

async fn load_sources(config: &SyncConfig) -> Result<Vec<ResolvedSource>> {
    let registry = SourceRegistry::load(&config.sources_file).await?;
    Ok(registry
        .resolve()
        .into_iter()
        .filter_map(|resolved| {
            resolved
                .map_err(|err| warn!(error = %err, "source configuration rejected"))
                .ok()
        })
        .collect())
}

fn client_for(config: &SyncConfig, source: &ResolvedSource) -> Result<HttpRemoteClient> {
    HttpRemoteClient::new(
        &source.base_url,
        config.remote_client_config(Some(source.credentials.clone())),
        Arc::new(RateLimiter::new(config.min_request_interval)),
    )
    .with_context(|| format!("building client for {}", source.name))
}

fn print_summary(summary: &PassSummary) {
    println!(
        "sync complete: run_id={} source={} collections={} inserted={} failed={}",
        summary.run_id,
        summary.source,
        summary.results.len(),
        summary.inserted(),
        summary.failed()
    );
    if let Some(error) = &summary.discovery_error {
        println!("  discovery failed: {error}");
    }
    for result in &summary.results {
        let strategy = result
            .strategy
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<40} {:<11} fetched={} inserted={} skipped={} added_columns={}{}",
            result.table,
            strategy,
            result.records_fetched,
            result.rows_inserted,
            result.rows_skipped,
            result.columns_added.len(),
            result
                .error
                .as_ref()
                .map(|e| format!(" error={e}"))
                .unwrap_or_default()
        );
    }
}
