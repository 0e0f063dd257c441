//! Strata - minimal Wayland compositor core on a headless backend.

use std::time::Duration;

use clap::Parser;
use strata_compositor::{Compositor, HeadlessConfig, HeadlessPlatform, ServerConfig};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "strata", version, about = "Minimal Wayland compositor core")]
struct Cli {
    /// Wayland socket name (default: first free wayland-N)
    #[arg(long)]
    socket: Option<String>,

    /// Number of virtual outputs
    #[arg(long, default_value_t = 1)]
    outputs: u32,

    /// Virtual output resolution as WxH
    #[arg(long, default_value = "1920x1080")]
    resolution: String,

    /// Virtual output refresh rate in Hz
    #[arg(long, default_value_t = 60.0)]
    refresh: f64,

    /// Do not report a preferred mode; outputs keep their initial mode
    #[arg(long)]
    no_preferred_mode: bool,

    /// Frame event interval in milliseconds (0 disables frame events)
    #[arg(long, default_value_t = 16)]
    frame_interval_ms: u64,

    /// Event loop poll interval in milliseconds
    #[arg(long, default_value_t = 100)]
    poll_interval_ms: u64,

    /// Exit after N seconds
    #[arg(long)]
    exit_after: Option<u64>,

    /// Command to run once the socket is up
    #[arg(short = 's', long)]
    startup_cmd: Option<String>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "strata_compositor=debug,strata=debug"
    } else {
        "strata_compositor=info,strata=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    info!("strata v{} starting", env!("CARGO_PKG_VERSION"));

    let Some((width, height)) = HeadlessConfig::parse_resolution(&cli.resolution) else {
        anyhow::bail!("invalid resolution {:?}, expected WxH", cli.resolution);
    };
    if !(cli.refresh.is_finite() && cli.refresh >= 0.0) {
        anyhow::bail!("invalid refresh rate {}", cli.refresh);
    }

    let headless = HeadlessConfig {
        output_count: cli.outputs,
        width,
        height,
        refresh: (cli.refresh * 1000.0).round() as i32,
        report_preferred_mode: !cli.no_preferred_mode,
        frame_interval: (cli.frame_interval_ms > 0).then(|| Duration::from_millis(cli.frame_interval_ms)),
    };
    let config = ServerConfig {
        socket_name: cli.socket,
        startup_command: cli.startup_cmd,
        poll_interval: Duration::from_millis(cli.poll_interval_ms.max(1)),
        exit_after: cli.exit_after.map(Duration::from_secs),
    };

    let platform = HeadlessPlatform::new(headless);
    let mut compositor = match Compositor::new(&platform, config) {
        Ok(compositor) => compositor,
        Err(e) => {
            error!("startup failed: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(socket) = compositor.socket_name() {
        std::env::set_var("WAYLAND_DISPLAY", socket);
    }

    compositor.run()?;
    info!("strata shut down cleanly");
    Ok(())
}
