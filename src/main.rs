mod analyzer;
mod config;
mod llm;
mod output;
mod platform;
mod scan;
mod scenarios;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::analyzer::{confidence_rank, Analyzer, LlmAnalyzer};
use crate::config::Config;
use crate::llm::LlmClient;
use crate::output::{OutputFormat, RunSummary};
use crate::platform::replay::ReplayWebClient;
use crate::platform::WebClient;
use crate::scan::aggregator::{ConfidenceTally, DrainFilter};
use crate::scan::extractor::MessageExtractor;
use crate::scan::fingerprint::Fingerprinter;
use crate::scan::orchestrator::{RunReport, ScanOrchestrator, ScanSettings};
use crate::scenarios::loader::load_scenarios_from_dir;

#[derive(Parser)]
#[command(name = "groupscan", version, about = "Scan chat groups for messages matching configured scenarios")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Backfill: scroll through each group's history once, then exit
    History {
        /// Scroll steps per group (defaults to scan.scroll_steps)
        #[arg(long)]
        scrolls: Option<u32>,

        /// Show HIGH confidence results first
        #[arg(long)]
        high_first: bool,

        #[command(flatten)]
        scan: ScanArgs,
    },
    /// Poll each group for new messages until Ctrl-C
    Live {
        /// Seconds between passes (defaults to scan.poll_interval_secs)
        #[arg(long)]
        interval: Option<u64>,

        #[command(flatten)]
        scan: ScanArgs,
    },
}

#[derive(Args)]
struct ScanArgs {
    /// Groups to scan (defaults to every group any scenario lists)
    #[arg(long, num_args = 1..)]
    groups: Vec<String>,

    /// Analyze at most this many new messages per group per pass
    #[arg(long)]
    limit: Option<usize>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    output: OutputFormat,

    /// HIGH, MEDIUM, LOW or a number
    #[arg(long, value_parser = parse_min_confidence)]
    min_confidence: Option<f64>,
}

fn parse_min_confidence(raw: &str) -> Result<f64, String> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .or_else(|| confidence_rank(&Value::String(raw.to_string())))
        .ok_or_else(|| format!("expected HIGH, MEDIUM, LOW or a number, got '{}'", raw))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Results go to stdout, logs to stderr
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,groupscan=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Loading configuration from: {}", cli.config.display());
    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    info!("Configuration loaded successfully");
    info!("  Provider: {} ({})", config.llm.provider, config.llm.effective_base_url());
    info!("  Model: {}", config.llm.model);
    info!("  Transcripts: {}", config.replay.directory.display());

    let registry = load_scenarios_from_dir(&config.scan.scenarios_dir).await?;
    info!(
        "  Scenarios: {} covering {} group(s)",
        registry.len(),
        registry.groups().len()
    );
    let registry = Arc::new(registry);

    let llm = LlmClient::new(config.llm.clone())?;
    let analyzer: Arc<dyn Analyzer> = Arc::new(LlmAnalyzer::new(llm, registry.clone()));
    let client: Arc<dyn WebClient> = Arc::new(ReplayWebClient::new(&config.replay));

    let scan_args = match &cli.mode {
        Mode::History { scan, .. } | Mode::Live { scan, .. } => scan,
    };
    let groups = if scan_args.groups.is_empty() {
        registry.groups()
    } else {
        scan_args.groups.clone()
    };

    let settings = ScanSettings {
        max_fatal_retries: config.scan.max_fatal_retries,
        analyze_timeout: config.llm.timeout(),
        limit: scan_args.limit,
        baseline_scroll_steps: config.scan.baseline_scroll_steps,
    };
    let mut orchestrator = ScanOrchestrator::new(
        MessageExtractor::new(client, config.web_timeout()),
        Fingerprinter::new(Duration::from_secs(config.scan.timestamp_tolerance_secs)),
        registry,
        analyzer,
        settings,
    )
    .with_context(|| {
        format!(
            "No usable scenarios in {}",
            config.scan.scenarios_dir.display()
        )
    })?;

    let (report, confidence) = match &cli.mode {
        Mode::History {
            scrolls,
            high_first,
            scan,
        } => {
            let scrolls = scrolls.unwrap_or(config.scan.scroll_steps);
            let report = orchestrator.run_history(&groups, scrolls).await;
            let failed = report.passes.iter().filter(|p| p.extraction_failed).count();
            if failed > 0 {
                warn!(
                    "History run {}: {} of {} group(s) could not be read",
                    report.run_id,
                    failed,
                    report.passes.len()
                );
            }
            let filter = DrainFilter {
                min_confidence: scan.min_confidence,
                high_first: *high_first,
            };
            let results = orchestrator.drain_with(&filter);
            print!("{}", output::render(&results, scan.output, false)?);
            (report, ConfidenceTally::of(&results))
        }
        Mode::Live { interval, scan } => {
            let interval = interval
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.poll_interval());
            run_live(&mut orchestrator, &groups, interval, scan).await?
        }
    };

    let stats = orchestrator.group_stats();
    RunSummary {
        seen: stats
            .keys()
            .map(|group| (group.clone(), orchestrator.seen_len(group)))
            .collect(),
        groups: stats,
        confidence,
        unknown_groups: report.unknown_groups,
    }
    .log();

    Ok(())
}

async fn run_live(
    orchestrator: &mut ScanOrchestrator,
    groups: &[String],
    interval: Duration,
    scan: &ScanArgs,
) -> Result<(RunReport, ConfidenceTally)> {
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, stopping after the current passes");
                cancel.cancel();
            }
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let filter = DrainFilter {
        min_confidence: scan.min_confidence,
        high_first: false,
    };
    let format = scan.output;
    let printer = tokio::spawn(async move {
        let mut tally = ConfidenceTally::default();
        while let Some(batch) = rx.recv().await {
            let batch = filter.apply(batch);
            tally.add(&batch);
            match output::render(&batch, format, true) {
                Ok(rendered) => {
                    let mut stdout = std::io::stdout().lock();
                    if let Err(e) = stdout
                        .write_all(rendered.as_bytes())
                        .and_then(|_| stdout.flush())
                    {
                        warn!("Failed to write results: {}", e);
                    }
                }
                Err(e) => warn!("Failed to render results: {}", e),
            }
        }
        tally
    });

    let report = orchestrator.run_live(groups, interval, cancel, tx).await;
    if report.scanned.is_empty() {
        warn!("No known groups to poll");
    }
    let tally = printer.await.context("Result printer failed")?;
    Ok((report, tally))
}
