use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use taskmon::config::{Config, OutputFormat, DEFAULT_PERIOD_MS, DEFAULT_WORKERS};
use taskmon::monitor::run_pipeline;
use taskmon::netlink::{self, codec::QueryCodec, NetlinkSocket, Transport};
use taskmon::target::{self, ChildProbe, Liveness, PidProbe};
use taskmon::taskstats::TargetKind;

/// Per-process delay-accounting monitor over kernel taskstats.
#[derive(Debug, Parser)]
#[command(name = "taskmon", about, version = version::full())]
struct Cli {
    /// Process id to monitor.
    #[arg(long, conflicts_with = "tgid")]
    pid: Option<u32>,

    /// Thread-group id to monitor (aggregated stats).
    #[arg(long)]
    tgid: Option<u32>,

    /// Sampling period in milliseconds.
    #[arg(long, default_value_t = DEFAULT_PERIOD_MS)]
    period: u64,

    /// Print raw counters instead of human-readable units.
    #[arg(long)]
    raw: bool,

    /// Append one tab-separated line per sample to this file instead of
    /// printing display blocks to stdout.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Redirect the spawned command's stdout and stderr to this file.
    #[arg(long)]
    cmd_out: Option<PathBuf>,

    /// Number of query workers.
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Command to spawn and monitor (its pid becomes the target).
    #[arg(last = true)]
    command: Vec<String>,
}

mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} ({}/{})",
            RELEASE,
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    // Diagnostics go to stderr so they never mix with sample output.
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    run(cli)
}

/// Resolve the monitoring target: an explicit pid/tgid, or a spawned command.
fn resolve_target(cli: &Cli) -> Result<(TargetKind, u32, Box<dyn Liveness>)> {
    match (&cli.pid, &cli.tgid, cli.command.is_empty()) {
        (Some(_), _, false) | (_, Some(_), false) => {
            bail!("a trailing command conflicts with --pid and --tgid")
        }
        // Unreachable through the CLI (clap rejects the combination), but
        // the resolution logic stands on its own.
        (Some(_), Some(_), true) => bail!("--pid conflicts with --tgid"),
        (Some(pid), None, true) => Ok((TargetKind::Pid, *pid, Box::new(PidProbe::new(*pid)))),
        (None, Some(tgid), true) => Ok((TargetKind::Tgid, *tgid, Box::new(PidProbe::new(*tgid)))),
        (None, None, false) => {
            let child = target::spawn_command(&cli.command, cli.cmd_out.as_deref())
                .with_context(|| format!("spawning `{}`", cli.command.join(" ")))?;
            let pid = child.id();
            tracing::info!(pid, command = %cli.command[0], "spawned monitored command");
            Ok((TargetKind::Pid, pid, Box::new(ChildProbe::new(child))))
        }
        (None, None, true) => bail!("one of --pid, --tgid or a trailing command is required"),
    }
}

fn run(cli: Cli) -> Result<()> {
    let (kind, target_id, liveness) = resolve_target(&cli)?;

    let mut cfg = Config::new(kind, target_id);
    cfg.period = std::time::Duration::from_millis(cli.period);
    cfg.workers = cli.workers;
    cfg.format = match &cli.out {
        Some(_) => OutputFormat::Tsv,
        None => OutputFormat::Block {
            human_units: !cli.raw,
        },
    };
    cfg.validate()?;

    // Resolve the taskstats family id once, on a throwaway control socket.
    let control = NetlinkSocket::connect().context("opening netlink control socket")?;
    let family_id = netlink::resolve_family_id(&control, netlink::codec::TASKSTATS_GENL_NAME)
        .context("resolving taskstats generic-netlink family")?;
    drop(control);
    tracing::debug!(family_id, "resolved taskstats family");

    // One socket per worker so request/reply exchanges never interleave.
    let mut transports: Vec<Box<dyn Transport>> = Vec::with_capacity(cfg.workers);
    for i in 0..cfg.workers {
        let socket = NetlinkSocket::connect()
            .with_context(|| format!("opening netlink socket for worker {i}"))?;
        transports.push(Box::new(socket));
    }

    let out: Box<dyn Write + Send> = match &cli.out {
        Some(path) => Box::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening output file {}", path.display()))?,
        ),
        None => Box::new(std::io::stdout()),
    };

    tracing::info!(
        version = version::RELEASE,
        target = target_id,
        kind = kind.as_str(),
        "starting taskmon",
    );

    run_pipeline(&cfg, QueryCodec::new(family_id), transports, liveness, out)?;
    Ok(())
}
