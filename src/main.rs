//! tunguard daemon
//!
//! Creates a TUN device and UDP bind, applies a standard configuration
//! file, and serves the text configuration protocol on a local socket so
//! the usual control tools keep working.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use tunguard::error::TunguardError;

/// Userspace WireGuard tunnel daemon
#[derive(Parser, Debug)]
#[command(name = "tunguard")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a WireGuard configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Path for the configuration protocol socket
    #[arg(long, default_value = "/var/run/tunguard.sock")]
    uapi_socket: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    fmt().with_env_filter(filter).with_target(false).init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(unix)]
async fn run(args: Args) -> Result<(), TunguardError> {
    use tunguard::device::Device;
    use tunguard::net::udp::UdpBind;
    use tunguard::tunnel::OsTun;
    use tunguard::WireGuardConfig;

    tracing::info!("tunguard starting");

    let config = WireGuardConfig::from_file(&args.config)?;
    let address = config
        .interface
        .address
        .first()
        .ok_or_else(|| tunguard::error::ConfigError::MissingField {
            field: "Address".to_string(),
        })?;

    let tun = OsTun::create(
        address.addr(),
        address.prefix_len(),
        config.interface.mtu.unwrap_or(1420),
    )?;
    let device = Device::new(tun, UdpBind::new());
    device.apply_config(&config).await?;
    device.up().await?;

    // configuration protocol socket
    let _ = std::fs::remove_file(&args.uapi_socket);
    let listener = tokio::net::UnixListener::bind(&args.uapi_socket)?;
    tracing::info!("control socket at {}", args.uapi_socket.display());
    {
        let device = device.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let device = device.clone();
                        tokio::spawn(async move { device.handle_uapi(stream).await });
                    }
                    Err(e) => {
                        tracing::error!("control socket accept failed: {e}");
                        return;
                    }
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    device.close().await;
    let _ = std::fs::remove_file(&args.uapi_socket);
    Ok(())
}

#[cfg(not(unix))]
async fn run(_args: Args) -> Result<(), TunguardError> {
    Err(tunguard::error::TunnelError::CreateFailed {
        reason: "this daemon requires a Unix platform".to_string(),
    }
    .into())
}
