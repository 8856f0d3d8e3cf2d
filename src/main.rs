use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use measurement_hub::cli::{Cli, Commands, ExtractHistoryArgs, RunArgs};
use measurement_hub::collector::{CollectorService, HttpBufferSource, SummaryCollector};
use measurement_hub::config::Config;
use measurement_hub::db::Store;
use measurement_hub::history::{self, HistoricalArchive};
use measurement_hub::ingest::{IngestStats, Ingestor};
use measurement_hub::migrate;
use measurement_hub::query::QueryEngine;
use measurement_hub::routes;
use measurement_hub::state::AppState;
use measurement_hub::stream::{StreamService, StreamSettings};
use measurement_hub::summarize::{parse_since, BatchSummarizer};
use std::io::{BufWriter, Write};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,measurement_hub=info".into());
    // Logs go to stderr so extract-history can write the archive to stdout.
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "measurement-hub"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Failed to bind query api on {addr}: port already in use. Stop the other service or pass --port.",
            );
        }
        Err(err) => Err(err).with_context(|| format!("failed to bind query api on {addr}")),
    }
}

async fn open_raw(config: &Config) -> Result<Store> {
    Store::open(&config.measurements_db, config.db_pool_size).await
}

async fn open_summaries(config: &Config) -> Result<Store> {
    Store::open(&config.summaries_db, config.db_pool_size).await
}

async fn build_ingestor(
    config: &Config,
    raw: Store,
    summaries: Store,
    stats: Arc<IngestStats>,
) -> Result<Ingestor> {
    let summaries = config.online_rollup.then_some(summaries);
    let ingestor = Ingestor::new(raw, summaries, stats, config.raw_retention());
    ingestor.prepare().await?;
    Ok(ingestor)
}

async fn build_state(
    config: &Config,
    raw: Store,
    summaries: Store,
    stats: Arc<IngestStats>,
) -> Result<AppState> {
    let archive = match &config.history_path {
        Some(path) => HistoricalArchive::load(path)?,
        None => HistoricalArchive::new(),
    };
    let engine = QueryEngine::new(raw, summaries, Arc::new(archive));
    engine.prepare().await?;
    Ok(AppState { engine, stats })
}

fn start_collector(config: &Config, summaries: Store, cancel: CancellationToken) -> Result<JoinHandle<()>> {
    let source = HttpBufferSource::new(&config.buffer_url, config.collector_fetch_timeout())?;
    let collector = SummaryCollector::new(summaries, source);
    Ok(CollectorService::new(
        collector,
        config.collector_check_interval(),
        config.collector_error_backoff(),
    )
    .start(cancel))
}

fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            return;
        }
        tracing::info!("shutdown requested");
        cancel.cancel();
    });
}

async fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "background task panicked");
        }
    }
}

/// One process, one handle per store file, so every component shares the
/// same per-store gate.
async fn run(config: &Config, args: &RunArgs) -> Result<()> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let raw = open_raw(config).await?;
    let summaries = open_summaries(config).await?;
    let stats = Arc::new(IngestStats::new());
    let ingestor = build_ingestor(config, raw.clone(), summaries.clone(), stats.clone()).await?;
    let state = build_state(config, raw, summaries.clone(), stats).await?;
    let listener = bind_listener(&config.http_address()).await?;

    let mut handles =
        vec![StreamService::new(StreamSettings::from_config(config), ingestor).start(cancel.clone())];
    if !args.no_collector {
        handles.push(start_collector(config, summaries, cancel.clone())?);
    }

    let served = routes::serve(listener, state, cancel.clone()).await;
    cancel.cancel();
    join_all(handles).await;
    served
}

async fn serve(config: &Config) -> Result<()> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let state = build_state(
        config,
        open_raw(config).await?,
        open_summaries(config).await?,
        Arc::new(IngestStats::new()),
    )
    .await?;
    let listener = bind_listener(&config.http_address()).await?;
    routes::serve(listener, state, cancel).await
}

async fn ingest(config: &Config) -> Result<()> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let ingestor = build_ingestor(
        config,
        open_raw(config).await?,
        open_summaries(config).await?,
        Arc::new(IngestStats::new()),
    )
    .await?;
    StreamService::new(StreamSettings::from_config(config), ingestor)
        .run(cancel)
        .await;
    Ok(())
}

async fn collect_summaries(config: &Config) -> Result<()> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let handle = start_collector(config, open_summaries(config).await?, cancel)?;
    join_all(vec![handle]).await;
    Ok(())
}

async fn extract_history(args: &ExtractHistoryArgs) -> Result<()> {
    let archive = history::extract_history(&args.databases).await;
    match &args.output {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            archive.write_tsv(BufWriter::new(file))?;
            tracing::info!(path = %path.display(), rows = archive.len(), "wrote historical archive");
        }
        None => {
            let stdout = std::io::stdout();
            let mut out = BufWriter::new(stdout.lock());
            archive.write_tsv(&mut out)?;
            out.flush()?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    cli.apply(&mut config);
    match &cli.command {
        Commands::Run(args) => args.serve.apply(&mut config),
        Commands::Serve(args) => args.apply(&mut config),
        _ => {}
    }
    init_tracing(&config)?;

    let now = Utc::now().timestamp();
    match &cli.command {
        Commands::Run(args) => run(&config, args).await,
        Commands::Ingest => ingest(&config).await,
        Commands::Serve(_) => serve(&config).await,
        Commands::CollectSummaries => collect_summaries(&config).await,
        Commands::SummarizeLatest => {
            BatchSummarizer::new(open_raw(&config).await?)
                .summarize_latest(now)
                .await?;
            Ok(())
        }
        Commands::SummarizePrevious => {
            BatchSummarizer::new(open_raw(&config).await?)
                .summarize_previous(now)
                .await?;
            Ok(())
        }
        Commands::SummarizeSince(args) => {
            let since = parse_since(&args.date)?;
            BatchSummarizer::new(open_raw(&config).await?)
                .summarize_since(since, now, args.overwrite)
                .await?;
            Ok(())
        }
        Commands::ClearSummaries => {
            let dropped = BatchSummarizer::new(open_raw(&config).await?).clear().await?;
            for table in dropped {
                tracing::info!(table = %table, "dropped");
            }
            Ok(())
        }
        Commands::ExtractHistory(args) => extract_history(args).await,
        Commands::SplitLegacy(args) => {
            let source = Store::open_read_only(&args.source).await?;
            let destination = Store::open(&args.destination, config.db_pool_size).await?;
            migrate::split_legacy(&source, &destination).await?;
            Ok(())
        }
    }
}
