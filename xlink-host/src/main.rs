//! xlink-host entry point.
//!
//! ```text
//! xlink-host list                          List devices on every transport
//! xlink-host boot --firmware <path>        Boot a firmware image
//! xlink-host bootloader version            Print the bootloader version
//! xlink-host flash --image <path>          Flash an application image
//! xlink-host config get|set                Read or write bootloader config
//! xlink-host ping                          Round trip to a booted device
//! xlink-host gen-config                    Write default config to stdout
//! ```

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use xlink_core::bootloader::{Memory, Storage};
use xlink_core::{BootloaderConfig, DeviceRequirements, DeviceState};
use xlink_host::commands;
use xlink_host::config::HostConfig;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "xlink-host", about = "Discover, boot and flash xlink devices")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "xlink-host.toml")]
    config: PathBuf,

    /// Only use the device with this name (USB path or ip:port).
    #[arg(long, global = true)]
    name: Option<String>,

    /// Only use the device with this MX serial.
    #[arg(long, global = true)]
    mxid: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List reachable devices.
    List,
    /// Boot a firmware image on an unbooted or bootloader device.
    Boot {
        #[arg(long)]
        firmware: PathBuf,
    },
    /// Bootloader queries.
    Bootloader {
        #[command(subcommand)]
        command: BootloaderCommand,
    },
    /// Flash an image through the bootloader.
    Flash {
        #[arg(long)]
        image: PathBuf,
        #[arg(long, value_enum, default_value_t = StorageArg::Application)]
        storage: StorageArg,
    },
    /// Read or write the bootloader configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Connect to a booted device and measure a round trip.
    Ping,
    /// Print the default configuration to stdout and exit.
    GenConfig,
}

#[derive(Subcommand, Debug)]
enum BootloaderCommand {
    Version,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the stored configuration as JSON.
    Get {
        #[arg(long, value_enum, default_value_t = MemoryArg::Auto)]
        memory: MemoryArg,
    },
    /// Store the configuration read from a JSON file.
    Set {
        file: PathBuf,
        #[arg(long, value_enum, default_value_t = MemoryArg::Auto)]
        memory: MemoryArg,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StorageArg {
    Application,
    Bootloader,
}

impl From<StorageArg> for Storage {
    fn from(arg: StorageArg) -> Self {
        match arg {
            StorageArg::Application => Storage::Sbr,
            StorageArg::Bootloader => Storage::Bootloader,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum MemoryArg {
    Auto,
    Flash,
    Emmc,
}

impl From<MemoryArg> for Memory {
    fn from(arg: MemoryArg) -> Self {
        match arg {
            MemoryArg::Auto => Memory::Auto,
            MemoryArg::Flash => Memory::Flash,
            MemoryArg::Emmc => Memory::Emmc,
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // gen-config: dump defaults and exit.
    if let Command::GenConfig = cli.command {
        println!("{}", HostConfig::default().to_toml()?);
        return Ok(());
    }

    let config = HostConfig::load(&cli.config);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("xlink-host v{}", env!("CARGO_PKG_VERSION"));

    let session = config.session();
    let req = DeviceRequirements {
        state: DeviceState::Any,
        name: cli.name,
        mxid: cli.mxid,
        ..Default::default()
    };

    match cli.command {
        Command::List => {
            let found = commands::list(&session, &req).await?;
            if found.is_empty() {
                println!("no devices found");
            }
            for desc in &found {
                println!("{}", commands::format_device(desc));
            }
        }
        Command::Boot { firmware } => {
            let image = std::fs::read(&firmware)?;
            let desc = commands::boot(&session, &req, &image).await?;
            println!("booted {}", commands::format_device(&desc));
        }
        Command::Bootloader {
            command: BootloaderCommand::Version,
        } => {
            let version = commands::bootloader_version(&session, &req).await?;
            println!("{version}");
        }
        Command::Flash { image, storage } => {
            let data = std::fs::read(&image)?;
            commands::flash(&session, &req, storage.into(), &data, |p| {
                eprint!("\rflashing {:>5.1}%", p * 100.0);
                let _ = std::io::stderr().flush();
            })
            .await?;
            eprintln!();
            println!("flashed {} bytes from {}", data.len(), image.display());
        }
        Command::Config {
            command: ConfigCommand::Get { memory },
        } => {
            let cfg = commands::config_get(&session, &req, memory.into()).await?;
            println!("{}", serde_json::to_string_pretty(&cfg)?);
        }
        Command::Config {
            command: ConfigCommand::Set { file, memory },
        } => {
            let cfg = BootloaderConfig::from_json(&std::fs::read(&file)?)?;
            commands::config_set(&session, &req, memory.into(), &cfg).await?;
            println!("configuration stored");
        }
        Command::Ping => {
            let rtt = commands::ping(&session, &req).await?;
            println!("round trip {rtt:?}");
        }
        Command::GenConfig => {}
    }

    Ok(())
}
