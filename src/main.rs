#![forbid(unsafe_code)]

//! `dnscheck` — streaming CLI for the `DnsCheck` verification service.
//!
//! Bootstraps configuration and the provider catalog, then drives one
//! check run over a WebSocket session, printing per-provider results and
//! the consensus as they stream in.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use clap::{Parser, ValueEnum};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use dnscheck::catalog;
use dnscheck::config::GlobalConfig;
use dnscheck::consensus::is_divergent;
use dnscheck::controller::{CheckParams, RunController};
use dnscheck::protocol::{
    ConsensusMap, DnsErrorInfo, Provider, ProviderResult, RecordType, TransportMode,
};
use dnscheck::sink::PresentationSink;
use dnscheck::transport::ws::WsConnector;
use dnscheck::transport::{ChannelState, Connector};
use dnscheck::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "dnscheck", about = "Multi-provider DNS check client", version, long_about = None)]
struct Cli {
    /// Domain name to check.
    domain: Option<String>,

    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// WebSocket endpoint of the `DnsCheck` server.
    #[arg(long)]
    url: Option<String>,

    /// Provider list to run against.
    #[arg(long)]
    list_id: Option<String>,

    /// Resolver transport mode (auto, udp, or tcp).
    #[arg(long)]
    transport: Option<TransportMode>,

    /// Print the server's provider catalogs and exit.
    #[arg(long)]
    lists: bool,

    /// Overall wall-clock budget for the run, in seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    debug!("dnscheck client bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    if let Some(url) = args.url {
        config.endpoint = url;
    }
    if let Some(secs) = args.timeout_secs {
        config.timeouts.run_seconds = secs;
    }
    config.validate()?;
    debug!(endpoint = config.endpoint, "configuration loaded");

    let connector: Arc<dyn Connector> = Arc::new(WsConnector::new());

    // ── Catalog bootstrap ───────────────────────────────
    let catalog = catalog::fetch_provider_lists(
        Arc::clone(&connector),
        &config.endpoint,
        config.timeouts.catalog(),
    )
    .await;

    if args.lists {
        let lists = catalog?;
        for list in lists.values() {
            println!("{}  {}", list.id, list.label);
            println!("    {}", list.description);
            for provider in &list.providers {
                println!(
                    "    {:<12} {} ({})",
                    provider.id,
                    provider.name,
                    provider.nameservers.join(", ")
                );
            }
            println!();
        }
        return Ok(());
    }

    let Some(domain) = args.domain else {
        return Err(AppError::InvalidInput(
            "a domain to check is required (or pass --lists)".into(),
        ));
    };

    let providers: BTreeMap<String, Provider> = match catalog {
        Ok(lists) => lists
            .values()
            .flat_map(|list| list.providers.iter().map(|p| (p.id.clone(), p.clone())))
            .collect(),
        Err(err) => {
            warn!(%err, "catalog fetch failed; provider names fall back to ids");
            BTreeMap::new()
        }
    };

    // ── Run the check ───────────────────────────────────
    let (done_tx, done_rx) = oneshot::channel();
    let sink = Arc::new(TermSink {
        providers,
        done: Mutex::new(Some(done_tx)),
    });
    let controller = RunController::new(connector, config.endpoint.clone(), sink);

    let params = CheckParams {
        domain,
        list_id: Some(args.list_id.unwrap_or(config.default_list_id)),
        transport: Some(args.transport.unwrap_or(config.default_transport)),
    };
    info!(domain = params.domain, "starting check");
    controller.start(params).await?;

    let outcome = tokio::time::timeout(config.timeouts.run(), done_rx).await;
    controller.shutdown();

    match outcome {
        Ok(Ok(true)) => Ok(()),
        // The sink already printed the failure; keep the exit status honest.
        Ok(Ok(false)) => Err(AppError::ServerReported("check did not complete".into())),
        Ok(Err(_)) => Err(AppError::ConnectionClosed("run abandoned".into())),
        Err(_) => Err(AppError::ConnectionClosed(
            "timed out waiting for results".into(),
        )),
    }
}

/// Terminal sink: prints streaming results and signals completion to the
/// main task.
struct TermSink {
    providers: BTreeMap<String, Provider>,
    done: Mutex<Option<oneshot::Sender<bool>>>,
}

impl TermSink {
    fn finish(&self, completed: bool) {
        let waiter = self
            .done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(waiter) = waiter {
            let _ = waiter.send(completed);
        }
    }

    fn display_name(&self, provider_id: &str) -> String {
        self.providers
            .get(provider_id)
            .map_or_else(|| provider_id.to_owned(), |p| p.name.clone())
    }
}

/// One rendered cell of record values, with a divergence marker.
fn format_records(result: &ProviderResult, record_type: RecordType, snapshot: &ConsensusMap) -> String {
    if let Some(error) = result.error_for(record_type) {
        return format!("{record_type}: {}", error.message);
    }
    let values = result.records_for(record_type);
    if values.is_empty() {
        return format!("{record_type}: \u{2014}");
    }
    let divergent = if is_divergent(result, record_type, snapshot) {
        "  (differs from consensus)"
    } else {
        ""
    };
    format!("{record_type}: {}{divergent}", values.join(", "))
}

/// Status tag mirroring the per-row states of the web view.
fn status_label(result: &ProviderResult) -> &'static str {
    let hard = result.errors.values().flatten().any(DnsErrorInfo::is_hard);
    let soft = result
        .errors
        .values()
        .flatten()
        .any(|info| !info.is_hard());
    let records = result.has_records();
    match (hard, soft, records) {
        (true, _, false) => "ERROR",
        (true, _, true) => "PARTIAL",
        (false, true, false) => "NOTICE",
        (false, _, false) => "NO DATA",
        _ => "OK",
    }
}

impl PresentationSink for TermSink {
    fn on_connection_status(&self, state: ChannelState, allow_retry: bool) {
        debug!(?state, allow_retry, "connection status changed");
    }

    fn on_run_started(&self, provider_ids: &[String]) {
        println!("Checking with {} providers:", provider_ids.len());
        for id in provider_ids {
            println!("  {:<20} waiting", self.display_name(id));
        }
        println!();
    }

    fn on_provider_result(&self, result: &ProviderResult, snapshot: &ConsensusMap) {
        println!(
            "  {:<20} {:>5} ms  [{}]  {}  {}",
            self.display_name(&result.provider.id),
            result.latency_ms,
            status_label(result),
            format_records(result, RecordType::A, snapshot),
            format_records(result, RecordType::Aaaa, snapshot),
        );
    }

    fn on_run_complete(&self, snapshot: &ConsensusMap) {
        println!("\nConsensus:");
        for record_type in RecordType::ALL {
            let rendered = snapshot
                .get(&record_type)
                .filter(|values| !values.is_empty())
                .map_or_else(|| "\u{2014}".to_owned(), |values| values.join(", "));
            println!("  {record_type:<5} {rendered}");
        }
        self.finish(true);
    }

    fn on_failure(&self, message: &str, retryable: bool) {
        eprintln!("error: {message}");
        // Informational notices (not retryable) leave the run going; a
        // retryable failure is terminal for this invocation.
        if retryable {
            self.finish(false);
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
