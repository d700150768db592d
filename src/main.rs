use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info, LevelFilter};
use std::{net::IpAddr, path::PathBuf, sync::Arc, time::Duration};
use usbip_bridge::{
    diag::{self, DiagnosticSink, RingLog, RING_CAPACITY},
    dispatch, server, DetachPolicy, DeviceState, HostExecutor, HostNetwork, ServerConfig,
    UsbIpServer, USBIP_PORT,
};

#[derive(Parser, Debug)]
#[command(name = "usbip-bridge")]
#[command(author, version, about = "Export one USB device of this host over USB/IP")]
struct Args {
    /// USB device to export, as VID:PID in hex
    #[arg(short, long, value_name = "VID:PID")]
    device: String,

    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// TCP port to listen on
    #[arg(short, long, default_value_t = USBIP_PORT)]
    port: u16,

    /// USB/IP version control headers must carry, in hex
    #[arg(long, value_name = "HEX", default_value = "0111")]
    protocol_version: String,

    /// Seconds a receive may block before the session polls again
    #[arg(long, default_value_t = 30)]
    recv_timeout: u64,

    /// Milliseconds to wait for the device to confirm an import
    #[arg(long, default_value_t = 1000)]
    import_wait: u64,

    /// Largest transfer payload accepted from a client, in bytes
    #[arg(long, default_value_t = 1024)]
    max_transfer: usize,

    /// Exit with an error after a client detaches instead of serving the next one
    #[arg(long)]
    restart_on_detach: bool,

    /// Keep the diagnostic log in this file across restarts
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    log_level: LevelFilter,
}

fn parse_vid_pid(s: &str) -> Result<(u16, u16)> {
    let Some((vid, pid)) = s.split_once(':') else {
        bail!("expected VID:PID, got {:?}", s);
    };
    let vid = u16::from_str_radix(vid, 16).with_context(|| format!("invalid vendor id {:?}", vid))?;
    let pid =
        u16::from_str_radix(pid, 16).with_context(|| format!("invalid product id {:?}", pid))?;
    Ok((vid, pid))
}

fn setup_logging(args: &Args) -> Result<Arc<RingLog>> {
    let ring = match &args.log_file {
        Some(path) => Arc::new(
            RingLog::open(path, RING_CAPACITY)
                .with_context(|| format!("Failed to open log file {}", path.display()))?,
        ),
        None => Arc::new(RingLog::new(RING_CAPACITY)),
    };
    let mut builder = env_logger::Builder::new();
    builder.filter_level(args.log_level).parse_default_env();
    diag::install(&mut builder, ring.clone() as Arc<dyn DiagnosticSink>)
        .context("Failed to setup logging")?;
    Ok(ring)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let ring = setup_logging(&args)?;
    info!(
        "usbip-bridge v{} (boot {})",
        env!("CARGO_PKG_VERSION"),
        ring.boot_count()
    );

    let (vendor_id, product_id) = parse_vid_pid(&args.device)?;
    let protocol_version = u16::from_str_radix(&args.protocol_version, 16)
        .with_context(|| format!("invalid protocol version {:?}", args.protocol_version))?;
    let config = ServerConfig {
        bind_address: args.bind,
        port: args.port,
        protocol_version,
        recv_timeout: Duration::from_secs(args.recv_timeout),
        import_wait: Duration::from_millis(args.import_wait),
        max_transfer: args.max_transfer,
        detach_policy: if args.restart_on_detach {
            DetachPolicy::Restart
        } else {
            DetachPolicy::GracefulReset
        },
        ..ServerConfig::default()
    };
    config.validate()?;

    let state = Arc::new(DeviceState::new());
    let executor = Arc::new(
        HostExecutor::open(vendor_id, product_id, state.clone(), &config).with_context(|| {
            format!("Failed to open USB device {:04x}:{:04x}", vendor_id, product_id)
        })?,
    );

    let (bridge, ports) = dispatch::channel(&config.dispatch);
    tokio::spawn(executor.clone().run(ports));

    let server = UsbIpServer::new(config, bridge, state, executor)?;
    let res = server::run(&HostNetwork, &server).await;
    if let Err(err) = &res {
        error!("Server stopped: {}", err);
    }
    ring.flush();
    Ok(res?)
}
