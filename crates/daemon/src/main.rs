//! tbauth
//!
//! Thunderbolt device authorization: hotplug monitor and one-shot commands.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::Config;
use daemon::systemd::{notify_ready, notify_status, notify_stopping, wait_for_shutdown_signal};
use daemon::sysfs::is_overflow;
use daemon::{AuthorizeMode, AutoOutcome, Manager, Store, Sysfs, UeventMonitor};
use model::{Device, Error, Policy};
use tracing_subscriber::EnvFilter;

/// tbauth - authorize Thunderbolt devices and remember the decision.
#[derive(Parser, Debug)]
#[command(name = "tbauth")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Watch for hotplug events and reconcile attached devices
    Monitor,

    /// List attached devices
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show one attached device
    Info {
        /// Device unique id
        uid: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Authorize an attached device
    Authorize {
        /// Device unique id
        uid: String,

        /// Store the device after authorizing it
        #[arg(long)]
        store: bool,

        /// Always authorize this device automatically (implies --store)
        #[arg(long)]
        auto: bool,
    },

    /// Authorize an attached device if its stored policy is auto
    Auto {
        /// Device unique id
        uid: String,
    },

    /// Manage the device store
    #[command(subcommand)]
    Db(DbCommands),
}

/// Store subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum DbCommands {
    /// List stored devices
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show a stored device
    Get {
        /// Device unique id
        uid: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Store a device or update its policy
    Set {
        /// Device unique id
        uid: String,

        /// Authorization policy (manual, auto)
        #[arg(long, value_parser = parse_policy)]
        policy: Option<Policy>,

        /// Connect without interaction
        #[arg(long, value_name = "BOOL")]
        autoconnect: Option<bool>,
    },

    /// Remove a device and its key from the store
    Delete {
        /// Device unique id
        uid: String,
    },

    /// Generate key material for a device (never overwrites)
    CreateKey {
        /// Device unique id
        uid: String,
    },
}

fn parse_policy(value: &str) -> Result<Policy, String> {
    value.parse().map_err(|e: Error| e.to_string())
}

impl Commands {
    /// Whether the command changes sysfs or the store.
    fn writes(&self) -> bool {
        match self {
            Commands::Authorize { .. } | Commands::Auto { .. } => true,
            Commands::Db(cmd) => matches!(
                cmd,
                DbCommands::Set { .. } | DbCommands::Delete { .. } | DbCommands::CreateKey { .. }
            ),
            Commands::Monitor | Commands::List { .. } | Commands::Info { .. } => false,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Commands::Monitor => "monitor",
            Commands::List { .. } => "list",
            Commands::Info { .. } => "info",
            Commands::Authorize { .. } => "authorize",
            Commands::Auto { .. } => "auto",
            Commands::Db(DbCommands::List { .. }) => "db list",
            Commands::Db(DbCommands::Get { .. }) => "db get",
            Commands::Db(DbCommands::Set { .. }) => "db set",
            Commands::Db(DbCommands::Delete { .. }) => "db delete",
            Commands::Db(DbCommands::CreateKey { .. }) => "db create-key",
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    let overrides = config.apply_env_overrides();
    config.validate()?;

    init_tracing(&config, cli.verbose);
    for (variable, value) in overrides {
        tracing::info!("Overriding from environment {}: {}", variable, value);
    }

    if cli.command.writes() {
        require_root(cli.command.name())?;
    }

    match cli.command {
        Commands::Monitor => run_monitor(&config).await,
        Commands::List { json } => {
            let manager = open_manager(&config)?;
            let devices: Vec<&Device> = manager.list_attached();
            if json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else {
                print_device_table(&devices);
            }
            Ok(())
        }
        Commands::Info { uid, json } => {
            let manager = open_manager(&config)?;
            let device = manager
                .lookup(&uid)
                .ok_or_else(|| Error::not_found(format!("attached device {}", uid)))?;
            if json {
                println!("{}", serde_json::to_string_pretty(device)?);
            } else {
                print_device(device);
            }
            Ok(())
        }
        Commands::Authorize { uid, store, auto } => {
            let mut manager = open_manager(&config)?;
            let auth = manager.authorize(&uid, AuthorizeMode { store, auto })?;
            if auth.written {
                println!("Authorized {}", uid);
            } else {
                println!("{} needs no authorization", uid);
            }
            if auth.stored {
                println!("Stored {}", uid);
            }
            Ok(())
        }
        Commands::Auto { uid } => {
            let mut manager = open_manager(&config)?;
            match manager.auto_authorize(&uid)? {
                AutoOutcome::Authorized(_) => println!("Authorized {}", uid),
                AutoOutcome::Skipped(reason) => println!("Not authorizing {}: {}", uid, reason),
            }
            Ok(())
        }
        Commands::Db(cmd) => run_db(&config, cmd),
    }
}

fn run_db(config: &Config, cmd: DbCommands) -> anyhow::Result<()> {
    let store = Store::new(&config.store.root);

    match cmd {
        DbCommands::List { json } => {
            let mut devices = Vec::new();
            for uid in store.list_ids()? {
                match store.get(&uid) {
                    Ok(device) => devices.push(device),
                    Err(e) => tracing::warn!("Skipping {}: {}", uid, e),
                }
            }
            let devices: Vec<&Device> = devices.iter().collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else {
                print_device_table(&devices);
            }
        }
        DbCommands::Get { uid, json } => {
            let device = store.get(&uid)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&device)?);
            } else {
                print_device(&device);
            }
        }
        DbCommands::Set {
            uid,
            policy,
            autoconnect,
        } => {
            let mut manager = open_manager(config)?;
            let device = manager.set_policy(&uid, policy, autoconnect)?;
            println!(
                "Stored {}: policy {}, autoconnect {}",
                uid, device.policy, device.autoconnect
            );
        }
        DbCommands::Delete { uid } => {
            store.delete(&uid)?;
            println!("Deleted {}", uid);
        }
        DbCommands::CreateKey { uid } => {
            let mut manager = open_manager(config)?;
            let key = manager.create_key(&uid)?;
            if key.created() {
                println!("Created key {}", key.path().display());
            } else {
                println!("Key already exists: {}", key.path().display());
            }
        }
    }

    Ok(())
}

/// Runs the reconciler until SIGTERM or SIGINT.
async fn run_monitor(config: &Config) -> anyhow::Result<()> {
    let sysfs = Sysfs::new(&config.sysfs.root);

    // Subscribe before enumerating so nothing attached in between is lost.
    let mut monitor = UeventMonitor::bind(sysfs.clone()).context("Failed to subscribe to uevents")?;

    let mut manager = Manager::new(Store::new(&config.store.root), sysfs)
        .with_auto_authorize(config.daemon.auto_authorize);
    let count = manager.initial_sync().context("Initial device scan failed")?;

    notify_ready();
    notify_status(&format!("{} device(s) attached", count));
    tracing::info!(
        "Monitoring {} (store {})",
        config.sysfs.root.display(),
        config.store.root.display()
    );

    let shutdown = wait_for_shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal.context("Failed to install signal handlers")?;
                break;
            }
            event = monitor.next_event() => {
                match event {
                    Ok(event) => {
                        manager.dispatch(event);
                    }
                    Err(e) if is_overflow(&e) => {
                        tracing::warn!("Hotplug events were lost ({}), rescanning devices", e);
                        match manager.resync() {
                            Ok(count) => notify_status(&format!("{} device(s) attached", count)),
                            Err(e) => tracing::error!("Device rescan failed: {}", e),
                        }
                    }
                    Err(e) => return Err(e).context("Failed to read hotplug event"),
                }
            }
        }
    }

    notify_stopping();
    Ok(())
}

fn open_manager(config: &Config) -> anyhow::Result<Manager> {
    let mut manager = Manager::new(
        Store::new(&config.store.root),
        Sysfs::new(&config.sysfs.root),
    );
    manager.initial_sync()?;
    Ok(manager)
}

fn init_tracing(config: &Config, verbose: bool) {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn require_root(operation: &str) -> Result<(), Error> {
    if nix::unistd::geteuid().is_root() {
        Ok(())
    } else {
        Err(Error::PermissionDenied {
            operation: operation.to_string(),
        })
    }
}

fn print_device(device: &Device) {
    println!("{} {}", device.vendor_name, device.device_name);
    println!("  uid:         {}", device.uid());
    println!(
        "  vendor:      {} ({:#06x})",
        device.vendor_name, device.vendor_id
    );
    println!(
        "  device:      {} ({:#06x})",
        device.device_name, device.device_id
    );
    match device.sysfs_path() {
        Some(path) => {
            println!("  sysfs:       {}", path.display());
            println!("  authorized:  {}", device.authorized);
        }
        None => println!("  sysfs:       -"),
    }
    println!("  stored:      {}", if device.known { "yes" } else { "no" });
    if device.known {
        println!("  policy:      {}", device.policy);
        println!("  autoconnect: {}", device.autoconnect);
        println!(
            "  key:         {}",
            device
                .key
                .as_ref()
                .map(|k| k.display().to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
}

fn print_device_table(devices: &[&Device]) {
    if devices.is_empty() {
        println!("No devices.");
        return;
    }

    let uid_width = devices.iter().map(|d| d.uid().len()).max().unwrap_or(3).max(3);
    let name_width = devices
        .iter()
        .map(|d| d.device_name.len())
        .max()
        .unwrap_or(4)
        .max(4);

    println!(
        "{:<uid_width$}  {:<name_width$}  {:<12}  {:<7}",
        "UID", "NAME", "STATUS", "POLICY"
    );
    println!("{}", "-".repeat(uid_width + name_width + 25));

    for device in devices {
        let status = if device.is_attached() {
            device.authorized.as_str()
        } else {
            "-"
        };
        let policy = if device.known {
            device.policy.as_str()
        } else {
            "-"
        };
        println!(
            "{:<uid_width$}  {:<name_width$}  {:<12}  {:<7}",
            device.uid(),
            device.device_name,
            status,
            policy
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_monitor_command() {
        let cli = Cli::try_parse_from(["tbauth", "monitor"]).unwrap();
        assert!(matches!(cli.command, Commands::Monitor));
        assert!(!cli.command.writes());
    }

    #[test]
    fn test_authorize_flags() {
        let cli = Cli::try_parse_from(["tbauth", "authorize", "abc", "--auto"]).unwrap();
        match cli.command {
            Commands::Authorize { ref uid, store, auto } => {
                assert_eq!(uid, "abc");
                assert!(!store);
                assert!(auto);
            }
            _ => panic!("Expected Authorize command"),
        }
        assert!(cli.command.writes());
        assert_eq!(cli.command.name(), "authorize");
    }

    #[test]
    fn test_list_json() {
        let cli = Cli::try_parse_from(["tbauth", "list", "--json"]).unwrap();
        match cli.command {
            Commands::List { json } => assert!(json),
            _ => panic!("Expected List command"),
        }
    }

    #[test]
    fn test_db_set() {
        let cli = Cli::try_parse_from([
            "tbauth",
            "db",
            "set",
            "abc",
            "--policy",
            "auto",
            "--autoconnect",
            "false",
        ])
        .unwrap();
        match cli.command {
            Commands::Db(DbCommands::Set {
                ref uid,
                policy,
                autoconnect,
            }) => {
                assert_eq!(uid, "abc");
                assert_eq!(policy, Some(Policy::Auto));
                assert_eq!(autoconnect, Some(false));
            }
            _ => panic!("Expected Db Set command"),
        }
        assert!(cli.command.writes());
    }

    #[test]
    fn test_db_set_rejects_bad_policy() {
        let result = Cli::try_parse_from(["tbauth", "db", "set", "abc", "--policy", "maybe"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_db_read_commands_do_not_write() {
        let cli = Cli::try_parse_from(["tbauth", "db", "list"]).unwrap();
        assert!(!cli.command.writes());

        let cli = Cli::try_parse_from(["tbauth", "db", "get", "abc", "--json"]).unwrap();
        assert!(!cli.command.writes());
        assert_eq!(cli.command.name(), "db get");
    }

    #[test]
    fn test_db_create_key() {
        let cli = Cli::try_parse_from(["tbauth", "db", "create-key", "abc"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Db(DbCommands::CreateKey { .. })
        ));
        assert!(cli.command.writes());
    }

    #[test]
    fn test_global_options() {
        let cli =
            Cli::try_parse_from(["tbauth", "list", "--config", "/tmp/tbauth.toml", "-v"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/tbauth.toml")));
        assert!(cli.verbose);
    }
}
