use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info, warn, LevelFilter};
use peermount::modules::constants::PACKET_TYPE_SFTP_REQUEST;
use peermount::{
    resolve, Collaborators, DeviceIdentity, DirectoryMap, DirectoryPublisher, ErrorReporter,
    GioVolumes, Location, MountConfig, MountError, MountOffer, MountSession, MountState, Packet,
    SystemBackends, Transport, TransportClass,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LinkArg {
    Tcp,
    Bluetooth,
}

impl From<LinkArg> for TransportClass {
    fn from(link: LinkArg) -> Self {
        match link {
            LinkArg::Tcp => TransportClass::Lan,
            LinkArg::Bluetooth => TransportClass::Bluetooth,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Mount a peer's offer and keep it mounted until interrupted
    Mount {
        /// JSON file holding the offer packet body
        #[arg(long)]
        offer: PathBuf,
        /// Device identifier, names the mount point
        #[arg(long = "device-id")]
        device_id: String,
        /// Peer address
        #[arg(long)]
        host: String,
        /// Device name used in logs (defaults to the device id)
        #[arg(long)]
        name: Option<String>,
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Link the peer is connected over
        #[arg(long, value_enum, default_value = "tcp")]
        transport: LinkArg,
    },
    /// Print the directories an offer resolves to, without mounting
    Resolve {
        /// JSON file holding the offer packet body
        #[arg(long)]
        offer: PathBuf,
        /// Resolve against a local mount point instead of the peer
        #[arg(long)]
        local: Option<PathBuf>,
        /// Peer address for remote resolution
        #[arg(long)]
        host: Option<String>,
    },
    /// Print the packet that asks a peer for an offer
    Request,
}

/// Prints outbound packets instead of sending them.
struct StdoutTransport;

impl Transport for StdoutTransport {
    fn send_packet(&self, packet: Packet) {
        match serde_json::to_string(&packet) {
            Ok(line) => println!("{}", line),
            Err(e) => error!("Failed to encode packet: {}", e),
        }
    }
}

struct LogReporter;

impl ErrorReporter for LogReporter {
    fn notify_error(&self, device: &DeviceIdentity, error: &MountError) {
        error!("{}: {}", device.name, error);
    }
}

struct ConsolePublisher;

impl DirectoryPublisher for ConsolePublisher {
    fn publish(&self, directories: &DirectoryMap) {
        println!("Mounted directories:");
        print_directories(directories);
    }

    fn retract(&self) {
        println!("Directories withdrawn");
    }

    fn set_actions_enabled(&self, enabled: bool) {
        if !enabled {
            warn!("Mounting is not available on this transport");
        }
    }
}

fn print_directories(directories: &DirectoryMap) {
    for (name, uri) in directories.iter() {
        println!("  {} -> {}", name, uri);
    }
}

fn read_offer(path: &Path) -> Result<MountOffer> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read offer {}", path.display()))?;
    let body: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("Invalid JSON in {}", path.display()))?;
    Ok(MountOffer::from_body(&body)?)
}

async fn run_mount(device: DeviceIdentity, offer: MountOffer, config: MountConfig) -> Result<()> {
    let volumes = Arc::new(GioVolumes::new(&config.gio_program));
    let collaborators = Collaborators {
        transport: Arc::new(StdoutTransport),
        reporter: Arc::new(LogReporter),
        publisher: Arc::new(ConsolePublisher),
        backends: Arc::new(SystemBackends::new(config, volumes)),
    };

    let session = MountSession::spawn(device, collaborators);
    let mut state = session.subscribe();

    session.connected()?;
    session.offer(offer)?;
    session.flush().await?;

    if session.state() == MountState::Unmounted {
        warn!("Offer was not mounted");
        session.destroy().await?;
        return Ok(());
    }

    let mut was_mounted = false;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Interrupted, unmounting");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                match current {
                    MountState::Mounted => was_mounted = true,
                    MountState::Unmounted => {
                        if was_mounted {
                            info!("Mount went away");
                        } else {
                            error!("Mount failed");
                        }
                        break;
                    }
                    MountState::Mounting => {}
                }
            }
        }
    }

    session.destroy().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger based on verbose flag
    let log_level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::new().filter_level(log_level).init();

    match cli.command {
        Commands::Mount {
            offer,
            device_id,
            host,
            name,
            config,
            transport,
        } => {
            let config = match config {
                Some(path) => MountConfig::load(&path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?,
                None => MountConfig::default(),
            };
            let offer = read_offer(&offer)?;
            let device = DeviceIdentity {
                name: name.unwrap_or_else(|| device_id.clone()),
                id: device_id,
                host: Some(host),
                transport: transport.into(),
            };

            info!("Starting peermount for {}...", device.name);
            run_mount(device, offer, config).await?;
        }
        Commands::Resolve { offer, local, host } => {
            let offer = read_offer(&offer)?;
            let directories = match (&local, host.as_deref().or(offer.host.as_deref())) {
                (Some(dir), _) => resolve(&offer, Location::Local(dir))?,
                (None, Some(host)) => resolve(
                    &offer,
                    Location::Remote {
                        host,
                        port: offer.port,
                    },
                )?,
                (None, None) => bail!("No host in offer; pass --host or --local"),
            };
            print_directories(&directories);
        }
        Commands::Request => {
            let packet = Packet::new(PACKET_TYPE_SFTP_REQUEST, json!({ "startBrowsing": true }));
            println!("{}", serde_json::to_string_pretty(&packet)?);
        }
    }

    Ok(())
}
