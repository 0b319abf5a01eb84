use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use leasegate::db::{self, Backend};
use leasegate::{Config, Device, LeaseManager, MacAddr, NewDevice, QuarantineCollector, Result, Role};

#[derive(Parser)]
#[command(name = "leasegate")]
#[command(author, version, about = "IP/DHCP reservation engine for a captive portal", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "leasegate.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile the blacklist, then collect quarantine leases until Ctrl-C
    Run,
    ShowConfig,
    /// Create missing tables
    InitSchema,
    /// Register a device and assign it a permanent address
    Register {
        #[arg(long)]
        mac: MacAddr,
        #[arg(long)]
        name: String,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        role: Role,
    },
    Unregister {
        mac: MacAddr,
    },
    /// Move a device into quarantine
    Deactivate {
        mac: MacAddr,
    },
    Reactivate {
        mac: MacAddr,
    },
    /// Move a device to a different address in its band
    Reassign {
        mac: MacAddr,
    },
    /// Show which MAC holds an address
    Lookup {
        ip: Ipv4Addr,
    },
    #[command(subcommand)]
    Blacklist(BlacklistCommands),
    /// Run one quarantine garbage-collection pass
    Gc,
    ListDevices,
}

#[derive(Subcommand)]
enum BlacklistCommands {
    /// Blacklist an address and reassign the devices holding it
    Add {
        ip: Ipv4Addr,
        #[arg(long, default_value = "")]
        reason: String,
    },
    Remove {
        ip: Ipv4Addr,
    },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config)?;

    let command = cli.command.unwrap_or(Commands::Run);
    if let Commands::ShowConfig = command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let config = Arc::new(config);
    let manager = Arc::new(LeaseManager::connect(config.clone()).await?);

    match command {
        Commands::Run => {
            info!("Starting leasegate with config: {:?}", cli.config);
            init_schema(&manager, &config).await?;

            let reassigned = manager.reconcile_blacklist().await?;
            if !reassigned.is_empty() {
                info!("Moved {} device(s) off blacklisted addresses", reassigned.len());
            }

            let (shutdown, receiver) = watch::channel(false);
            let collector =
                QuarantineCollector::spawn(manager.clone(), config.gc_interval(), receiver);

            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", error);
            }
            info!("Received shutdown signal, stopping...");
            let _ = shutdown.send(true);
            if let Err(error) = collector.await {
                tracing::error!("Quarantine GC task failed: {}", error);
            }
            Ok(())
        }
        Commands::ShowConfig => Ok(()),
        Commands::InitSchema => {
            init_schema(&manager, &config).await?;
            println!("Schema ready.");
            Ok(())
        }
        Commands::Register {
            mac,
            name,
            owner,
            role,
        } => {
            let device = manager
                .register_device(NewDevice {
                    mac,
                    name,
                    owner,
                    role,
                })
                .await?;
            print_devices(&[device]);
            Ok(())
        }
        Commands::Unregister { mac } => {
            let device = manager.unregister_device(mac).await?;
            println!("Unregistered {} ({}).", device.mac, device.name);
            Ok(())
        }
        Commands::Deactivate { mac } => {
            let device = manager.device(mac).await?;
            print_devices(&[manager.deactivate(&device).await?]);
            Ok(())
        }
        Commands::Reactivate { mac } => {
            let device = manager.device(mac).await?;
            print_devices(&[manager.reactivate(&device).await?]);
            Ok(())
        }
        Commands::Reassign { mac } => {
            let device = manager.device(mac).await?;
            print_devices(&[manager.reassign(&device).await?]);
            Ok(())
        }
        Commands::Lookup { ip } => {
            let mac = manager.reservations().lookup_mac_by_ip(ip).await?;
            match manager.devices().get(mac).await? {
                Some(device) => println!("{} -> {} ({}, {})", ip, mac, device.name, device.owner),
                None => println!("{} -> {} (not registered)", ip, mac),
            }
            Ok(())
        }
        Commands::Blacklist(BlacklistCommands::Add { ip, reason }) => {
            let reassigned = manager.blacklist_add(ip, &reason).await?;
            println!("Blacklisted {}.", ip);
            if !reassigned.is_empty() {
                print_devices(&reassigned);
            }
            Ok(())
        }
        Commands::Blacklist(BlacklistCommands::Remove { ip }) => {
            manager.blacklist_remove(ip).await?;
            println!("Removed {} from the blacklist.", ip);
            Ok(())
        }
        Commands::Blacklist(BlacklistCommands::List) => {
            let entries = manager.blacklist().entries().await?;
            if entries.is_empty() {
                println!("Blacklist is empty.");
            } else {
                println!("{:<16} {:<24} {}", "IP Address", "Added At", "Reason");
                println!("{}", "-".repeat(64));
                for entry in entries {
                    println!(
                        "{:<16} {:<24} {}",
                        entry.ip,
                        entry.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
                        entry.reason
                    );
                }
            }
            Ok(())
        }
        Commands::Gc => {
            let report = manager.garbage_collect_quarantine().await?;
            println!(
                "Removed {} expired quarantine lease(s) and {} stale temporary lease(s).",
                report.expired_quarantine, report.stale_temporary
            );
            Ok(())
        }
        Commands::ListDevices => {
            let devices = manager.devices().list_all().await?;
            if devices.is_empty() {
                println!("No registered devices.");
            } else {
                print_devices(&devices);
            }
            Ok(())
        }
    }
}

async fn init_schema(manager: &LeaseManager, config: &Config) -> Result<()> {
    let backend = Backend::from_url(&config.database_url)?;
    db::init_schema(manager.reservations().pool(), backend).await
}

fn print_devices(devices: &[Device]) {
    println!(
        "{:<6} {:<18} {:<16} {:<8} {:<8} {:<16} {}",
        "ID", "MAC", "IP Address", "Role", "Active", "Owner", "Name"
    );
    println!("{}", "-".repeat(92));

    for device in devices {
        let ip = device
            .assigned_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<6} {:<18} {:<16} {:<8} {:<8} {:<16} {}",
            device.id,
            device.mac.to_string(),
            ip,
            device.role.to_string(),
            if device.is_active { "yes" } else { "no" },
            device.owner,
            device.name
        );
    }
}
