use qp_bootstrap::provider::soft::SoftFabric;
use qp_bootstrap::{
    ConnectionTuning, DEFAULT_PORT, Initiator, Provider, ProviderContext, RdmaError, Responder,
    RoutingMode, SessionConfig, TransferMode, TransferReport,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

#[derive(clap::Parser, Debug)]
#[command(
    version,
    about = "Bootstrap an RDMA queue pair and move one message across it."
)]
struct Args {
    /// Address of the listening peer; listen when omitted.
    #[arg(conflicts_with = "loopback")]
    server: Option<IpAddr>,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long, value_enum, default_value_t = TransferMode::SendRecv)]
    mode: TransferMode,

    #[arg(long, value_enum, default_value_t = RoutingMode::GlobalRouted)]
    routing: RoutingMode,

    /// JSON file with connection tuning overrides.
    #[arg(long)]
    tuning: Option<PathBuf>,

    /// Index into the local RDMA device list.
    #[arg(short, long, default_value_t = 0)]
    device: usize,

    /// Run both sides in this process on the soft fabric.
    #[arg(long)]
    loopback: bool,

    /// Milliseconds to wait for a completion; spins forever when omitted.
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[arg(long, default_value_t = Level::INFO)]
    log: Level,
}

fn main() -> qp_bootstrap::Result<()> {
    let args: Args = clap::Parser::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::from_level(args.log).into())
                .from_env_lossy(),
        )
        .with_thread_ids(true)
        .compact()
        .init();

    let config = session_config(&args)?;
    if args.loopback {
        return run_loopback(&args, config);
    }
    run_device(&args, config)
}

fn session_config(args: &Args) -> qp_bootstrap::Result<SessionConfig> {
    let mut config = SessionConfig::new(args.mode);
    config.routing = args.routing;
    config.completion_timeout = args.timeout_ms.map(Duration::from_millis);
    if let Some(path) = &args.tuning {
        config.tuning = ConnectionTuning::from_json_file(path)?;
    }
    config.validate()?;
    Ok(config)
}

#[cfg(feature = "verbs")]
fn run_device(args: &Args, config: SessionConfig) -> qp_bootstrap::Result<()> {
    use qp_bootstrap::error::SetupPhase;
    use qp_bootstrap::provider::verbs::VerbsDevice;

    let device = VerbsDevice::open(args.device).map_err(|source| RdmaError::Setup {
        phase: SetupPhase::Device,
        source,
    })?;
    info!(device = device.device_name(), "opened RDMA device");
    run(&ProviderContext::new(device), args, config)
}

#[cfg(not(feature = "verbs"))]
fn run_device(_args: &Args, _config: SessionConfig) -> qp_bootstrap::Result<()> {
    Err(RdmaError::Config(
        "built without the `verbs` feature; use --loopback or rebuild with --features verbs"
            .into(),
    ))
}

#[cfg_attr(not(feature = "verbs"), allow(dead_code))]
fn run<P: Provider>(
    ctx: &ProviderContext<P>,
    args: &Args,
    config: SessionConfig,
) -> qp_bootstrap::Result<()> {
    let report = match args.server {
        None => {
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.port);
            let listener = TcpListener::bind(addr).map_err(listen_error)?;
            info!(%addr, "waiting for a peer");
            Responder::new(ctx, config)?.accept(&listener)?
        }
        Some(server) => Initiator::new(ctx, config)?.connect((server, args.port))?,
    };
    log_report(&report);
    Ok(())
}

fn run_loopback(args: &Args, config: SessionConfig) -> qp_bootstrap::Result<()> {
    let fabric = SoftFabric::new();
    let server_ctx = ProviderContext::new(fabric.open_device("soft0"));
    let client_ctx = ProviderContext::new(fabric.open_device("soft1"));

    let listener =
        TcpListener::bind((Ipv4Addr::LOCALHOST, args.port)).map_err(listen_error)?;
    let addr = listener.local_addr().map_err(listen_error)?;
    let responder = Responder::new(&server_ctx, config.clone())?;
    let initiator = Initiator::new(&client_ctx, config)?;

    let (served, connected) = thread::scope(|s| {
        let server = s.spawn(|| responder.accept(&listener));
        let connected = initiator.connect(addr);
        let served = server
            .join()
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
        (served, connected)
    });
    log_report(&served?);
    log_report(&connected?);
    Ok(())
}

fn listen_error(source: std::io::Error) -> RdmaError {
    RdmaError::Handshake {
        step: qp_bootstrap::error::HandshakeStep::Listen,
        source,
    }
}

fn log_report(report: &TransferReport) {
    info!(
        role = %report.role,
        mode = %report.transfer,
        local_qp = report.local_qp_num,
        remote_qp = report.remote_qp_num,
        byte_len = report.byte_len,
        "{}",
        report.payload_text()
    );
}
