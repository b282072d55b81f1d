/*!
 * bsdbtd - FreeBSD Bluetooth Pairing Daemon
 * Discovers devices with hccontrol and manages hcsecd pairings over a local socket
 */

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod bluetooth;
mod client;
mod config;
mod dispatcher;
mod ipc;
mod privilege;
mod process;
mod protocol;

use bluetooth::BluetoothManager;
use client::DaemonClient;
use config::{DaemonConfig, DEFAULT_CONFIG_PATH};
use dispatcher::Dispatcher;
use ipc::IpcServer;
use process::SystemRunner;
use protocol::{PairParams, Request, Response};

#[derive(Parser)]
#[command(name = "bsdbtd")]
#[command(about = "FreeBSD Bluetooth pairing daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// HCI node to scan on, overrides the config file
    #[arg(long)]
    device: Option<String>,

    /// Socket path, overrides the config file
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Run,
    /// Ask a running daemon to scan for nearby devices
    Scan,
    /// Show the devices found by the last scan
    List,
    /// Store a PIN for a device and reload hcsecd
    Pair {
        address: String,
        pin: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Stop the daemon
    Stop,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("bsdbt_daemon={log_level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result = match load_config(&cli) {
        Ok(config) => match cli.command {
            None | Some(Commands::Run) => run_daemon(config).await,
            Some(Commands::Scan) => send(&config, Request::Scan).await,
            Some(Commands::List) => send(&config, Request::List).await,
            Some(Commands::Pair { address, pin, name }) => {
                let params = PairParams {
                    address: Some(address),
                    pin: Some(pin),
                    name,
                };
                send(&config, Request::Pair(params)).await
            }
            Some(Commands::Stop) => send(&config, Request::Shutdown).await,
        },
        Err(e) => Err(e),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<DaemonConfig> {
    let mut config = DaemonConfig::load(&cli.config)?;
    if let Some(device) = &cli.device {
        config.hci_node = device.clone();
    }
    if let Some(socket) = &cli.socket {
        config.socket_path = socket.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn run_daemon(config: DaemonConfig) -> Result<ExitCode> {
    if let Err(e) = privilege::verify() {
        error!("{e}");
        return Ok(ExitCode::FAILURE);
    }

    info!("bsdbtd starting...");

    // Registered before binding so a signal during startup still cleans up.
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let shutdown = async move {
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    };

    let manager = BluetoothManager::new(SystemRunner, &config);
    info!(
        node = manager.hci_node(),
        hcsecd = %manager.hcsecd_path().display(),
        "Bluetooth manager ready"
    );

    let server = IpcServer::bind(&config.socket_path, Dispatcher::new(manager))?;
    info!("bsdbtd ready on socket: {}", server.socket_path().display());

    server.run(shutdown).await?;

    info!("bsdbtd stopped");
    Ok(ExitCode::SUCCESS)
}

async fn send(config: &DaemonConfig, request: Request) -> Result<ExitCode> {
    let client = DaemonClient::new(&config.socket_path);
    let response = client.send_request(&request).await?;
    print_response(&response);

    Ok(if response.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_response(response: &Response) {
    if let Some(message) = &response.message {
        if response.is_success() {
            println!("{message}");
        } else {
            eprintln!("error: {message}");
        }
    }
    for device in &response.data {
        let name = device.name.as_deref().unwrap_or("-");
        let paired = if device.paired { "paired" } else { "" };
        println!("{}  {name:<24} {paired}", device.address);
    }
}
