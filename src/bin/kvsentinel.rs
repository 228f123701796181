//! kvsentinel binary: lifecycle hooks, monitor agent, probes

use clap::{Parser, Subcommand, ValueEnum};
use kvsentinel::common::{Config, NodeAddr};
use kvsentinel::discovery::{own_address, DnsDirectory, PeerDirectory};
use kvsentinel::health::{router, HealthState};
use kvsentinel::node::{wait_for_demotion, LaunchPlan, RoleDecision, RoleResolver};
use kvsentinel::probe::{check, check_sentinel, check_with_master, ProbeKind};
use kvsentinel::protocol::{RespDataPlane, RespPeerChannel, SentinelClient};
use kvsentinel::sentinel::{bootstrap, FailoverCoordinator, MonitorAgent, MonitorConfig};
use kvsentinel::{Error, MonitorId};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "kvsentinel")]
#[command(version, about = "Role resolution and failover control plane for a replicated KV cluster")]
struct Cli {
    /// Configuration file (TOML); KVSENTINEL__* variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Data member lifecycle
    Node {
        #[command(subcommand)]
        action: NodeAction,
    },
    /// Monitor agent lifecycle
    Sentinel {
        #[command(subcommand)]
        action: SentinelAction,
    },
    /// Run one health probe; exit code 0 when healthy
    Probe {
        #[arg(value_enum)]
        kind: ProbeArg,

        /// Also require this master (host:port) to pass
        #[arg(long)]
        master: Option<String>,

        /// Seconds to wait for a reply
        #[arg(long)]
        timeout: Option<String>,
    },
    /// Health HTTP endpoints
    Health {
        #[command(subcommand)]
        action: HealthAction,
    },
}

#[derive(Subcommand)]
enum NodeAction {
    /// Resolve the role, then exec the data server
    Start {
        /// Data server executable
        #[arg(long, default_value = kvsentinel::node::launch::DEFAULT_PROGRAM)]
        program: String,

        /// Print the launch plan instead of exec'ing it
        #[arg(long)]
        dry_run: bool,
    },
    /// Wait for the monitors to move the master role away
    Prestop {
        /// Budget, e.g. `20` or `20s`
        #[arg(long)]
        timeout: Option<String>,
    },
}

#[derive(Subcommand)]
enum SentinelAction {
    /// Bootstrap and run the built-in monitor agent
    Start,
    /// Bootstrap and write the configuration for an external sentinel
    Render {
        /// Defaults to cluster.sentinel_conf
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Request a failover if this member is master, then wait for it
    Prestop {
        #[arg(long)]
        timeout: Option<String>,
    },
}

#[derive(Subcommand)]
enum HealthAction {
    /// Serve /health/live, /health/ready and /metrics
    Serve {
        #[arg(long)]
        bind: Option<String>,

        /// Master (host:port) readiness also depends on
        #[arg(long)]
        master: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProbeArg {
    Liveness,
    Readiness,
    Sentinel,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Node { action } => match action {
            NodeAction::Start { program, dry_run } => node_start(&config, program, dry_run).await,
            NodeAction::Prestop { timeout } => node_prestop(&config, timeout.as_deref()).await,
        },
        Commands::Sentinel { action } => match action {
            SentinelAction::Start => sentinel_start(&config).await,
            SentinelAction::Render { output } => {
                let target = output.unwrap_or_else(|| config.cluster.sentinel_conf.clone());
                let monitor = sentinel_bootstrap(&config).await?;
                monitor.persist(&target).await?;
                tracing::info!(path = %target.display(), "Monitor configuration written");
                Ok(ExitCode::SUCCESS)
            }
            SentinelAction::Prestop { timeout } => {
                sentinel_prestop(&config, timeout.as_deref()).await
            }
        },
        Commands::Probe {
            kind,
            master,
            timeout,
        } => run_probe(&config, kind, master, timeout.as_deref()).await,
        Commands::Health { action } => match action {
            HealthAction::Serve { bind, master } => health_serve(&config, bind, master).await,
        },
    }
}

fn timeout_or(arg: Option<&str>, default: Duration) -> anyhow::Result<Duration> {
    match arg {
        Some(s) => Ok(kvsentinel::common::parse_duration(s)?),
        None => Ok(default),
    }
}

fn parse_addr(s: &str) -> anyhow::Result<NodeAddr> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("expected host:port, got {}", s))?;
    Ok(NodeAddr::from_parts(host, port)?)
}

fn sentinel_client(config: &Config, password: Option<String>) -> SentinelClient {
    SentinelClient::new(
        NodeAddr::new(config.cluster.service.clone(), config.cluster.sentinel_port),
        password,
        config.retry.command_timeout(),
    )
}

fn local_node(config: &Config) -> NodeAddr {
    NodeAddr::new("127.0.0.1", config.cluster.data_port)
}

/// Discovery barrier plus role resolution, shared by both start paths
async fn resolve(config: &Config, hostname: &str) -> anyhow::Result<RoleDecision> {
    let password = config.auth.resolve()?;
    let directory: Arc<dyn PeerDirectory> = Arc::new(DnsDirectory::new());
    let self_addr = own_address(directory.as_ref(), hostname).await?;
    tracing::info!(hostname, %self_addr, "Resolving role");

    let resolver = RoleResolver::new(
        config.cluster.clone(),
        config.retry.clone(),
        directory,
        Arc::new(sentinel_client(config, password)),
    );
    match resolver.resolve_role(self_addr, hostname).await {
        Ok(decision) => Ok(decision),
        Err(e) => {
            if e.is_fatal_at_startup() {
                tracing::error!(error = %e, "Startup aborted");
            }
            Err(e.into())
        }
    }
}

async fn node_start(config: &Config, program: String, dry_run: bool) -> anyhow::Result<ExitCode> {
    let hostname = config.cluster.self_hostname()?;
    let decision = resolve(config, &hostname).await?;
    let password = config.auth.resolve()?;

    let plan = LaunchPlan::build(
        &config.cluster,
        &hostname,
        decision.role,
        decision.master.as_ref(),
        password.as_deref(),
    )
    .with_program(program);
    tracing::info!(role = %decision.role, plan = %plan.redacted(), "Starting data server");

    if dry_run {
        println!("{}", plan.redacted());
        return Ok(ExitCode::SUCCESS);
    }
    exec(&plan)
}

#[cfg(unix)]
fn exec(plan: &LaunchPlan) -> anyhow::Result<ExitCode> {
    use std::os::unix::process::CommandExt;
    let err = std::process::Command::new(&plan.program)
        .args(&plan.args)
        .exec();
    Err(anyhow::anyhow!("failed to exec {}: {}", plan.program, err))
}

#[cfg(not(unix))]
fn exec(plan: &LaunchPlan) -> anyhow::Result<ExitCode> {
    let status = std::process::Command::new(&plan.program)
        .args(&plan.args)
        .status()?;
    Ok(if status.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn node_prestop(config: &Config, timeout: Option<&str>) -> anyhow::Result<ExitCode> {
    let timeout = timeout_or(timeout, config.retry.prestop_timeout())?;
    let data_plane = RespDataPlane::new(config.auth.resolve()?, config.retry.command_timeout());
    let demoted = wait_for_demotion(
        &data_plane,
        &local_node(config),
        timeout,
        config.retry.poll_interval(),
    )
    .await;
    Ok(if demoted {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn sentinel_bootstrap(config: &Config) -> anyhow::Result<MonitorConfig> {
    let hostname = config.cluster.self_hostname()?;
    let decision = resolve(config, &hostname).await?;
    let master = decision
        .master
        .clone()
        .ok_or_else(|| Error::MasterUnknown {
            name: config.cluster.name.clone(),
            attempts: config.retry.master_attempts,
        })?;
    let directory = DnsDirectory::new();
    let monitor = bootstrap(
        &config.cluster,
        &config.sentinel,
        &directory,
        &hostname,
        master,
        config.auth.resolve()?,
    )
    .await?;
    Ok(monitor)
}

async fn sentinel_start(config: &Config) -> anyhow::Result<ExitCode> {
    let hostname = config.cluster.self_hostname()?;
    let password = config.auth.resolve()?;
    let monitor = sentinel_bootstrap(config).await?;
    persist_or_warn(&monitor, &config.cluster.sentinel_conf).await;

    let timeout = config.retry.command_timeout();
    let agent = MonitorAgent::new(
        monitor,
        config.cluster.clone(),
        hostname,
        Arc::new(DnsDirectory::new()),
        Arc::new(RespDataPlane::new(password.clone(), timeout)),
        Arc::new(RespPeerChannel::new(password.clone(), timeout)),
    )
    .with_conf_path(config.cluster.sentinel_conf.clone());

    let listener =
        tokio::net::TcpListener::bind(("0.0.0.0", config.cluster.sentinel_port)).await?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    agent.run(listener, password, shutdown_rx).await?;
    Ok(ExitCode::SUCCESS)
}

async fn persist_or_warn(monitor: &MonitorConfig, path: &Path) {
    if let Err(e) = monitor.persist(path).await {
        tracing::warn!(path = %path.display(), error = %e, "Could not persist monitor configuration");
    }
}

async fn sentinel_prestop(config: &Config, timeout: Option<&str>) -> anyhow::Result<ExitCode> {
    let timeout = timeout_or(timeout, config.retry.prestop_timeout())?;
    let hostname = config.cluster.self_hostname()?;
    let coordinator = FailoverCoordinator::new(
        Arc::new(sentinel_client(config, config.auth.resolve()?)),
        config.cluster.name.clone(),
        NodeAddr::new(config.cluster.full_hostname(&hostname), config.cluster.data_port),
        MonitorId::from_hostname(&hostname),
        config.retry.poll_interval(),
    );
    match coordinator.on_member_stopping(timeout).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            tracing::warn!(error = %e, "Graceful handover incomplete");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run_probe(
    config: &Config,
    kind: ProbeArg,
    master: Option<String>,
    timeout: Option<&str>,
) -> anyhow::Result<ExitCode> {
    let timeout = timeout_or(timeout, config.health.probe_timeout())?;
    let password = config.auth.resolve()?;

    let outcome = match kind {
        ProbeArg::Sentinel => {
            let client = SentinelClient::new(
                NodeAddr::new("127.0.0.1", config.cluster.sentinel_port),
                password,
                timeout,
            );
            check_sentinel(&client).await
        }
        ProbeArg::Liveness | ProbeArg::Readiness => {
            let probe = if matches!(kind, ProbeArg::Liveness) {
                ProbeKind::Liveness
            } else {
                ProbeKind::Readiness
            };
            let data_plane = RespDataPlane::new(password, timeout);
            let local = local_node(config);
            match master.as_deref().map(parse_addr).transpose()? {
                Some(master) => {
                    check_with_master(&data_plane, &local, &master, probe, timeout).await
                }
                None => check(&data_plane, &local, probe, timeout).await,
            }
        }
    };

    if outcome.healthy {
        Ok(ExitCode::SUCCESS)
    } else {
        println!("{}", outcome.detail);
        Ok(ExitCode::FAILURE)
    }
}

async fn health_serve(
    config: &Config,
    bind: Option<String>,
    master: Option<String>,
) -> anyhow::Result<ExitCode> {
    let bind_addr = match bind {
        Some(b) => b.parse()?,
        None => config.health.bind_addr,
    };
    let state = HealthState {
        data_plane: Arc::new(RespDataPlane::new(
            config.auth.resolve()?,
            config.health.probe_timeout(),
        )),
        local: local_node(config),
        master: master.as_deref().map(parse_addr).transpose()?,
        timeout: config.health.probe_timeout(),
    };

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "Health endpoints listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(ExitCode::SUCCESS)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
