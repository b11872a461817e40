use std::io;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use rtsp_relay::{CameraConfig, Config, Server};

#[derive(Parser)]
#[command(name = "rtsp-relay", about = "Multi-client RTSP proxy")]
struct Args {
    /// Bind address (host:port) for viewer connections.
    #[arg(long, short, default_value = "0.0.0.0:4554")]
    bind: String,

    /// A camera to proxy, given as HASH=URL. Repeat for multiple cameras.
    #[arg(long = "camera", value_parser = parse_camera)]
    cameras: Vec<CameraConfig>,

    /// Negotiate TCP-interleaved transport with cameras and viewers instead
    /// of UDP.
    #[arg(long)]
    tcp: bool,

    /// Maximum concurrent `web`-classified viewers per camera (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    web_limit: u32,

    /// IP address advertised in rewritten SDP and used for local/web client
    /// classification.
    #[arg(long, default_value = "127.0.0.1")]
    local_ip: String,

    /// First local UDP port handed out to cameras; each camera gets a block
    /// of 4 consecutive ports.
    #[arg(long, default_value_t = 5550)]
    start_udp_port: u16,

    /// Per-request timeout, in seconds, waiting on an upstream camera reply.
    #[arg(long, default_value_t = 10)]
    upstream_timeout_secs: u64,
}

fn parse_camera(s: &str) -> Result<CameraConfig, String> {
    let (hash, url) = s
        .split_once('=')
        .ok_or_else(|| format!("expected HASH=URL, got `{s}`"))?;
    if hash.is_empty() || url.is_empty() {
        return Err(format!("expected HASH=URL, got `{s}`"));
    }
    Ok(CameraConfig::new(hash, url))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    if args.cameras.is_empty() {
        eprintln!("at least one --camera HASH=URL is required");
        return ExitCode::FAILURE;
    }

    let (host, port) = match args.bind.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => {
                eprintln!("invalid --bind port: {}", args.bind);
                return ExitCode::FAILURE;
            }
        },
        None => {
            eprintln!("--bind must be host:port, got `{}`", args.bind);
            return ExitCode::FAILURE;
        }
    };

    let config = Config {
        rtsp_host: host,
        rtsp_port: port,
        start_udp_port: args.start_udp_port,
        local_ip: args.local_ip,
        tcp_mode: args.tcp,
        web_limit: args.web_limit,
        upstream_timeout: Duration::from_secs(args.upstream_timeout_secs),
        cameras: args.cameras,
    };

    let mut server = Server::new(config);

    if let Err(e) = server.start() {
        eprintln!("failed to start proxy: {e}");
        return ExitCode::FAILURE;
    }

    println!("RTSP proxy on {} — press Enter to stop", args.bind);
    let mut input = String::new();
    if io::stdin().read_line(&mut input).is_err() {
        eprintln!("stdin closed, stopping");
    }

    server.stop();
    ExitCode::SUCCESS
}
