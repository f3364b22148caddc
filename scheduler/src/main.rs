//! Process entrypoint for the shared compute-job scheduler. Parses the CLI
//! flags in a thin `Args` struct, builds the immutable `Config` the rest of
//! the system reads, and wires the decision engine (`scheduler_core`) to
//! real sockets: a client listener, a discovery handshake listener, a UDP
//! pulse listener, a node-reply listener, the dispatch-intent drain, and the
//! timer service. Mirrors this codebase's split between a library crate
//! holding the hard logic and a binary crate that only parses flags and
//! calls into it.
use clap::Parser;
use scheduler_core::auth;
use scheduler_core::config::{parse_file_size, Config};
use scheduler_core::net::discovery::{self, NodeSpec};
use scheduler_core::net::{client_server, node_server, spawn_engine};
use scheduler_core::policy::{LoadBalance, Policy};
use serde::Serialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Flags documented in the system's external interface: every scheduler
/// deployment is driven by this surface and nothing else.
#[derive(Parser, Debug)]
#[command(name = "dispy_scheduler", about = "Shared compute-job scheduler")]
struct Args {
    /// Node IPs/hostnames/patterns to probe for at startup (repeatable); a
    /// bare `*` requests a broadcast probe.
    #[arg(long = "nodes")]
    nodes: Vec<String>,

    /// Bind addresses for the scheduler's listeners (repeatable).
    #[arg(short = 'i', long = "ip_addr")]
    ip_addr: Vec<IpAddr>,

    /// Addresses advertised to nodes and clients (repeatable); defaults to
    /// the bind addresses when empty.
    #[arg(long = "ext_ip_addr")]
    ext_ip_addr: Vec<IpAddr>,

    /// Client protocol + UDP discovery port.
    #[arg(short = 'p', long = "port", default_value_t = 51347)]
    port: u16,

    /// Node discovery port: the port nodes listen on, used only as the
    /// destination for pings and dispatches. Never bound by the scheduler.
    #[arg(long = "node_port", default_value_t = 51348)]
    node_port: u16,

    /// Scheduler-command port: where nodes send job replies, file
    /// transfers, and termination notices.
    #[arg(long = "scheduler_port", default_value_t = 51349)]
    scheduler_port: u16,

    /// Shared secret nodes authenticate with.
    #[arg(long = "node_secret")]
    node_secret: Option<String>,

    /// TLS key file for the node-facing channel (out of scope for this
    /// core: TLS is assumed to wrap the socket transparently).
    #[arg(long = "node_keyfile")]
    node_keyfile: Option<PathBuf>,

    /// TLS cert file for the node-facing channel.
    #[arg(long = "node_certfile")]
    node_certfile: Option<PathBuf>,

    /// Shared secret clients authenticate with.
    #[arg(long = "cluster_secret")]
    cluster_secret: Option<String>,

    /// TLS key file for the client-facing channel.
    #[arg(long = "cluster_keyfile")]
    cluster_keyfile: Option<PathBuf>,

    /// TLS cert file for the client-facing channel.
    #[arg(long = "cluster_certfile")]
    cluster_certfile: Option<PathBuf>,

    /// Pulse interval in seconds, 1..1000.
    #[arg(long = "pulse_interval", default_value_t = 5 * 60)]
    pulse_interval: u64,

    /// Ping/re-discovery interval in seconds, 1..1000.
    #[arg(long = "ping_interval", default_value_t = 2 * 60)]
    ping_interval: u64,

    /// Zombie sweep interval in minutes, >= 1. Also the upper bound used to
    /// auto-clamp `pulse_interval`.
    #[arg(long = "zombie_interval", default_value_t = 60)]
    zombie_interval: u64,

    /// Per-message I/O timeout in seconds.
    #[arg(long = "msg_timeout", default_value_t = 5)]
    msg_timeout: u64,

    /// Root directory clusters' per-client destination directories are
    /// created under.
    #[arg(long = "dest_path_prefix", default_value = "/tmp/dispy_scheduler")]
    dest_path_prefix: PathBuf,

    /// Maximum accepted transfer-file size; accepts a `k|m|g|t` suffix.
    #[arg(long = "max_file_size", default_value = "0")]
    max_file_size: String,

    /// Purge `dest_path_prefix` before starting.
    #[arg(long = "clean", default_value_t = false)]
    clean: bool,

    /// Enable the HTTP dashboard.
    #[arg(long = "httpd", default_value_t = false)]
    httpd: bool,

    /// Verbose (debug) logging.
    #[arg(short = 'd', long = "debug", default_value_t = false)]
    debug: bool,
}

/// `<dest_prefix>/config` — a snapshot of process-lifetime secrets for
/// tooling that needs to construct auth tokens out-of-band, mirroring what
/// `auth_code` derives on both sides.
#[derive(Serialize)]
struct PersistedConfig {
    port: u16,
    sign: String,
    cluster_secret: String,
    node_secret: String,
    auth: String,
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_config(args: &Args) -> color_eyre::Result<Config> {
    let bind_addrs = if args.ip_addr.is_empty() {
        vec![IpAddr::from([0, 0, 0, 0])]
    } else {
        args.ip_addr.clone()
    };
    let ext_addrs = if args.ext_ip_addr.is_empty() {
        bind_addrs.clone()
    } else {
        args.ext_ip_addr.clone()
    };
    let max_file_size = parse_file_size(&args.max_file_size)?;

    if args.node_keyfile.is_some() || args.cluster_keyfile.is_some() {
        tracing::debug!(
            "TLS keyfiles/certfiles accepted for CLI-surface compatibility; this core assumes \
             TLS wraps its sockets transparently and does not terminate it itself"
        );
    }

    let node_secret = args
        .node_secret
        .clone()
        .unwrap_or_else(|| {
            let generated = hex::encode(auth::random_sign());
            tracing::info!("no --node_secret given; generated one for this run");
            generated
        })
        .into_bytes();
    let cluster_secret = args
        .cluster_secret
        .clone()
        .unwrap_or_else(|| {
            let generated = hex::encode(auth::random_sign());
            tracing::info!("no --cluster_secret given; generated one for this run");
            generated
        })
        .into_bytes();

    let config = Config {
        bind_addrs,
        ext_addrs,
        node_specs: args.nodes.clone(),
        scheduler_port: args.port,
        node_port: args.node_port,
        command_port: args.scheduler_port,
        node_secret,
        cluster_secret,
        pulse_interval: Duration::from_secs(args.pulse_interval),
        ping_interval: Duration::from_secs(args.ping_interval),
        zombie_interval: Duration::from_secs(args.zombie_interval * 60),
        msg_timeout: Duration::from_secs(args.msg_timeout),
        dest_path_prefix: args.dest_path_prefix.clone(),
        max_file_size,
        clean_on_start: args.clean,
        httpd: args.httpd,
        debug: args.debug,
    };
    Ok(config.validate()?)
}

/// Writes `<dest_prefix>/config`, purging the directory first if `--clean`
/// was given. Failure to persist is a warning, not fatal: the file is a
/// convenience for external tooling, not load-bearing for the scheduler
/// itself.
async fn bootstrap_dest_path(config: &Config, sign: &[u8]) -> std::io::Result<()> {
    if config.clean_on_start && config.dest_path_prefix.exists() {
        tracing::info!(path = %config.dest_path_prefix.display(), "--clean: purging dest_path_prefix");
        tokio::fs::remove_dir_all(&config.dest_path_prefix).await?;
    }
    tokio::fs::create_dir_all(&config.dest_path_prefix).await?;

    let auth = auth::auth_code(&config.cluster_secret, sign);
    let persisted = PersistedConfig {
        port: config.scheduler_port,
        sign: hex::encode(sign),
        cluster_secret: String::from_utf8_lossy(&config.cluster_secret).into_owned(),
        node_secret: String::from_utf8_lossy(&config.node_secret).into_owned(),
        auth,
    };
    let bytes = serde_json::to_vec_pretty(&persisted)
        .expect("PersistedConfig should always serialize");
    tokio::fs::write(config.dest_path_prefix.join("config"), bytes).await
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    init_tracing(args.debug);

    let config = build_config(&args)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}

async fn run(config: Config) -> color_eyre::Result<()> {
    let sign = auth::random_sign();
    bootstrap_dest_path(&config, &sign).await?;

    let (handle, intent_rx) = spawn_engine(config.clone(), Box::new(LoadBalance) as Box<dyn Policy>);

    for bind_ip in &config.bind_addrs {
        let client_addr = std::net::SocketAddr::new(*bind_ip, config.scheduler_port);
        let pulse_addr = std::net::SocketAddr::new(*bind_ip, config.scheduler_port);
        let handshake_addr = std::net::SocketAddr::new(*bind_ip, config.node_port);
        let result_addr = std::net::SocketAddr::new(*bind_ip, config.command_port);

        let cfg = config.clone();
        let h = handle.clone();
        let sign_for_client = sign.clone();
        tokio::spawn(async move {
            if let Err(e) = client_server::run_client_listener(client_addr, cfg, sign_for_client, h).await
            {
                tracing::error!(%client_addr, error = %e, "client listener exited");
            }
        });

        let h = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = discovery::run_pulse_listener(pulse_addr, h).await {
                tracing::error!(%pulse_addr, error = %e, "pulse listener exited");
            }
        });

        let cluster_secret = config.cluster_secret.clone();
        let sign_for_handshake = sign.clone();
        let h = handle.clone();
        tokio::spawn(async move {
            if let Err(e) =
                discovery::run_handshake_listener(handshake_addr, cluster_secret, sign_for_handshake, h)
                    .await
            {
                tracing::error!(%handshake_addr, error = %e, "discovery handshake listener exited");
            }
        });

        let node_secret = config.node_secret.clone();
        let h = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = node_server::run_result_listener(result_addr, node_secret, h).await {
                tracing::error!(%result_addr, error = %e, "node result listener exited");
            }
        });
    }

    tokio::spawn(node_server::run_dispatch_loop(
        intent_rx,
        config.node_port,
        config.msg_timeout,
        handle.clone(),
    ));

    tokio::spawn(scheduler_core::timer::run(config.clone(), sign.clone(), handle.clone()));

    if config.httpd {
        let httpd_handle = handle.clone();
        let httpd_addr = std::net::SocketAddr::new(
            *config.bind_addrs.first().unwrap_or(&IpAddr::from([0, 0, 0, 0])),
            8181,
        );
        tokio::spawn(async move {
            if let Err(e) = scheduler_httpd::serve(httpd_addr, httpd_handle).await {
                tracing::error!(error = %e, "http dashboard exited");
            }
        });
    }

    let specs: Vec<NodeSpec> = discovery::parse_node_specs(&config.node_specs);
    if !specs.is_empty() {
        if let Err(e) = discovery::send_pings(
            &specs,
            &config.ext_addrs,
            config.scheduler_port,
            config.node_port,
            &sign,
        )
        .await
        {
            tracing::warn!(error = %e, "initial discovery ping sweep failed to send");
        }
    }

    tracing::info!(
        scheduler_port = config.scheduler_port,
        node_port = config.node_port,
        command_port = config.command_port,
        "scheduler up"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("received ctrl-c, draining in-flight jobs before shutdown");
    handle.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}
