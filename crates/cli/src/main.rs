use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use conv_core::{ConditionStatus, ConditionType, ManagedResourceRef};
use conv_kubehub::{snapshot_of, EventSource, KubeEventSource, KubeObjectClient, ObjectClient};
use conv_scenario::catalog::{contexts, printed_row};
use conv_scenario::config::deployment_kind;
use conv_scenario::{select, CaseReport, HarnessConfig, Orchestrator, ScaledDeploymentProcess};
use conv_validate::{validate_conditions, ChildSetValidator};
use futures::StreamExt;
use regex::Regex;
use serde::Deserialize;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "convctl", version, about = "Operator convergence harness")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Operator namespace (default: CONV_NAMESPACE or "default")
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// YAML file with harness settings, applied over the environment
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the scenario catalog
    List {
        /// Only scenarios whose name matches this regex
        #[arg(long = "filter")]
        filter: Option<String>,
    },
    /// Run scenarios against the current cluster
    Run {
        /// Only scenarios whose name matches this regex
        #[arg(long = "filter")]
        filter: Option<String>,
        /// Stop after the first failing scenario
        #[arg(long = "fail-fast", action = ArgAction::SetTrue)]
        fail_fast: bool,
    },
    /// Print operator events for driver deployments until interrupted
    WatchEvents,
    /// Show the printed columns and conditions of a driver deployment
    Get {
        name: String,
        /// Expected conditions, e.g. "CertsReady=True,DriverDeployed=True"
        #[arg(long = "expect")]
        expect: Option<String>,
    },
}

/// Settings file; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConfigFile {
    namespace: Option<String>,
    operator_name: Option<String>,
    operator_component: Option<String>,
    operator_selector: Option<String>,
    case_deadline_secs: Option<u64>,
    poll_interval_ms: Option<u64>,
    driver_image: Option<String>,
    app_image: Option<String>,
    app_namespace: Option<String>,
    cluster_version: Option<String>,
}

impl ConfigFile {
    fn load(path: &PathBuf) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    fn apply(self, cfg: &mut HarnessConfig) {
        if let Some(v) = self.namespace { cfg.namespace = v; }
        if let Some(v) = self.operator_name { cfg.operator_name = v; }
        if let Some(v) = self.operator_component { cfg.operator_component = v; }
        if let Some(v) = self.operator_selector { cfg.operator_selector = v; }
        if let Some(v) = self.case_deadline_secs { cfg.case_deadline = Duration::from_secs(v); }
        if let Some(v) = self.poll_interval_ms.filter(|v| *v > 0) {
            cfg.timeouts = cfg.timeouts.with_interval(Duration::from_millis(v));
        }
        if let Some(v) = self.driver_image { cfg.driver_image = v; }
        if let Some(v) = self.app_image { cfg.app_image = v; }
        if let Some(v) = self.app_namespace { cfg.app_namespace = v; }
        if let Some(v) = self.cluster_version { cfg.cluster_version = Some(v); }
    }
}

fn init_tracing() {
    let env = std::env::var("CONV_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CONV_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid CONV_METRICS_ADDR; expected host:port");
        }
    }
}

fn harness_config(cli: &Cli) -> Result<HarnessConfig> {
    let mut cfg = HarnessConfig::from_env();
    if let Some(path) = &cli.config {
        ConfigFile::load(path)?.apply(&mut cfg);
    }
    if let Some(ns) = &cli.namespace {
        cfg.namespace = ns.clone();
    }
    Ok(cfg)
}

fn filter_regex(filter: Option<&str>) -> Result<Option<Regex>> {
    filter.map(|f| Regex::new(f).with_context(|| format!("invalid filter {:?}", f))).transpose()
}

fn parse_conditions(s: &str) -> Result<BTreeMap<ConditionType, ConditionStatus>> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|pair| {
            let (t, st) = pair.split_once('=').ok_or_else(|| anyhow!("expected Type=Status, got {:?}", pair))?;
            Ok((ConditionType::from(t.trim().to_string()), ConditionStatus::from_str(st.trim())?))
        })
        .collect()
}

async fn run(mut cfg: HarnessConfig, filter: Option<Regex>, fail_fast: bool, output: Output) -> Result<bool> {
    let kube = conv_kubehub::get_kube_client().await?;
    if cfg.cluster_version.is_none() {
        match conv_kubehub::server_version(&kube).await {
            Ok(v) => cfg.cluster_version = Some(v),
            Err(e) => warn!(error = %e, "cannot read server version; assuming a current cluster"),
        }
    }
    let client = Arc::new(KubeObjectClient::new(kube.clone()));
    let events: Arc<dyn EventSource> = Arc::new(KubeEventSource::new(kube));
    let validator = Arc::new(ChildSetValidator::new(client.clone(), deployment_kind()));
    let process = Arc::new(ScaledDeploymentProcess::new(
        client.clone(),
        &cfg.namespace,
        &cfg.operator_name,
        &cfg.operator_selector,
        cfg.timeouts.long,
    ));
    info!(namespace = %cfg.namespace, operator = %cfg.operator_name, version = ?cfg.cluster_version, "harness configured");
    let orchestrator = Orchestrator::new(client, events, validator, process, cfg);

    let cases = select(filter.as_ref());
    let mut reports: Vec<CaseReport> = Vec::with_capacity(cases.len());
    for desc in &cases {
        let report = orchestrator.run(desc).await;
        if output == Output::Human {
            let verdict = if report.passed { "PASS" } else { "FAIL" };
            println!("{:<4} {:<70} {:>7}ms", verdict, desc.name, report.elapsed_ms);
            if let Some(e) = &report.error {
                println!("     {}", e);
            }
            for c in &report.cleanup_errors {
                println!("     cleanup: {}", c);
            }
        }
        let failed = !report.passed;
        reports.push(report);
        if failed && fail_fast {
            warn!(case = %desc.name, "stopping after first failure");
            break;
        }
    }
    let passed = reports.iter().filter(|r| r.passed).count();
    match output {
        Output::Human => println!("{} passed, {} failed, {} selected", passed, reports.len() - passed, cases.len()),
        Output::Json => println!("{}", serde_json::to_string_pretty(&reports)?),
    }
    Ok(passed == reports.len())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::List { filter } => {
            let cases = select(filter_regex(filter.as_deref())?.as_ref());
            match cli.output {
                Output::Human => {
                    println!("{:<70} RESOURCE", "SCENARIO");
                    for d in &cases {
                        println!("{:<70} {}", d.name, d.resource);
                    }
                    for (ctx, n) in contexts(&cases) {
                        eprintln!("{}: {}", ctx, n);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&cases)?),
            }
        }
        Commands::Run { filter, fail_fast } => {
            let cfg = harness_config(&cli)?;
            let filter = filter_regex(filter.as_deref())?;
            info!(filter = ?filter.as_ref().map(Regex::as_str), "run invoked");
            if !run(cfg, filter, *fail_fast, cli.output).await? {
                std::process::exit(1);
            }
        }
        Commands::WatchEvents => {
            let cfg = harness_config(&cli)?;
            let kube = conv_kubehub::get_kube_client().await?;
            let source = KubeEventSource::new(kube);
            let mut stream = source.subscribe().await?;
            info!(component = %cfg.operator_component, "watching events");
            loop {
                tokio::select! {
                    next = stream.next() => match next {
                        Some(ev) if ev.component == cfg.operator_component => match cli.output {
                            Output::Human => println!(
                                "{} {} {}",
                                ev.timestamp.to_rfc3339(),
                                conv_core::format_uid(&ev.involved_uid),
                                ev.reason
                            ),
                            Output::Json => println!("{}", serde_json::to_string(&ev)?),
                        },
                        Some(_) => {}
                        None => {
                            warn!("event stream closed");
                            break;
                        }
                    },
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; stopping");
                        break;
                    }
                }
            }
        }
        Commands::Get { name, expect } => {
            let kube = conv_kubehub::get_kube_client().await?;
            let client = KubeObjectClient::new(kube);
            let obj = client
                .get(&ManagedResourceRef::cluster_scoped(name.as_str()).object_ref(&deployment_kind()))
                .await
                .map_err(|e| anyhow!("{}", e))?;
            let snap = snapshot_of(&obj)?;
            match cli.output {
                Output::Human => {
                    println!("NAME   DEVICEMODE   NODESELECTOR   IMAGE   STATUS   AGE");
                    println!("{}", printed_row(&obj));
                    for c in &snap.status.conditions {
                        println!("  {}={}{}", c.condition_type, c.status, c.reason.as_deref().map(|r| format!(" ({})", r)).unwrap_or_default());
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&snap)?),
            }
            if let Some(expect) = expect {
                let expected = parse_conditions(expect)?;
                if let Err(e) = validate_conditions(&snap, &expected) {
                    error!(error = %e, "conditions differ");
                    eprintln!("{}", e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
