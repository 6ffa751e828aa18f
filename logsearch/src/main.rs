//! Log Search command-line entry point.
//!
//! Runs one query against the backend, prints the rows as JSON lines and
//! optionally the requested field distributions and request metrics.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use common::SystemClock;
use common::storage::factory::create_store;
use tracing_subscriber::EnvFilter;

use logsearch::config::load_config;
use logsearch::http::HttpBackend;
use logsearch::{
    CliArgs, ConsoleConfig, Dispatch, Error, Result, SearchParamsUpdate, SearchSession,
    SessionEvent, SessionOptions, TabMirror, TimeSpec,
};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "search failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: CliArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => ConsoleConfig::default(),
    };
    if let Some(base_url) = &args.base_url {
        config.backend.base_url = base_url.clone();
    }
    tracing::info!(base_url = %config.backend.base_url, module = %args.module, "starting search");

    let backend = HttpBackend::from_config(&config.backend)?;
    let mirror = TabMirror::new(create_store(&config.mirror)?, config.tab_id.clone());
    let options = SessionOptions::from_config(&config, Arc::new(SystemClock))?.with_mirror(mirror);
    let mut session = SearchSession::new(Arc::new(backend), options);

    session.select_module(&args.module, args.datasource_id).await?;
    for field in &args.fields {
        if !session.params().active_fields.contains(field) {
            session.toggle_column(field)?;
        }
    }

    let mut update = SearchParamsUpdate::new();
    if let Some(time_range) = &args.time_range {
        let spec: TimeSpec = time_range
            .parse()
            .map_err(|e| Error::InvalidInput(format!("{}", e)))?;
        update = update.time_range(spec);
    }
    if !args.where_predicates.is_empty() {
        update = update.where_predicates(args.where_predicates.clone());
    }
    if !args.keywords.is_empty() {
        update = update.keywords(args.keywords.clone());
    }
    session.update(update);
    session.search();
    report(session.settle().await)?;

    for _ in 1..args.pages {
        if session.load_more() == Dispatch::Ignored {
            break;
        }
        report(session.settle().await)?;
    }

    if !args.distributions.is_empty() {
        session.request_distribution(&args.distributions);
        report(session.settle().await)?;
    }

    for row in session.view() {
        println!("{}", serde_json::to_string(&row.fields)?);
    }
    tracing::info!(
        rows = session.rows().len(),
        total = session.total(),
        histogram_total = session.histogram().total_count(),
        "search complete"
    );

    for (field, distribution) in session.distributions().distributions() {
        println!("# {} ({} distinct)", field, distribution.unique_count);
        for value in &distribution.top_values {
            println!("{}\t{}\t{:.2}%", value.value, value.count, value.percentage);
        }
    }

    if args.metrics {
        print!("{}", session.metrics().encode());
    }
    Ok(())
}

/// Logs what settled and fails on a detail error.
fn report(events: Vec<SessionEvent>) -> Result<()> {
    for event in events {
        match event {
            SessionEvent::DetailFailed(error) => return Err(error),
            SessionEvent::HistogramFailed(error) => {
                tracing::warn!(%error, "histogram unavailable");
            }
            SessionEvent::DistributionsFailed { fields, error } => {
                tracing::warn!(?fields, %error, "distributions unavailable");
            }
            other => tracing::debug!(?other, "session event"),
        }
    }
    Ok(())
}
