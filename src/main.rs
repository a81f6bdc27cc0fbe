use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use xmpbee_core::config::Config;
use xmpbee_core::logstore::LogStore;
use xmpbee_core::persistence::{data_root, FileKeyValueStore, FileSecretStore};
use xmpbee_core::supervisor::{SessionSupervisor, SupervisorCommand, SupervisorEvent};

fn print_help() {
    println!(
        "\
xmpbee-core v{}

XMPP client core and session supervisor for a desktop chat application.

USAGE:
    xmpbee-core [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/account.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG        Log level filter for tracing (e.g. debug, xmpbee_core=debug)
    XMPBEE_HOME     Overrides the app-data root (secrets, settings, logs)

EXAMPLES:
    xmpbee-core                          # uses config/account.toml
    xmpbee-core /etc/xmpbee/account.toml # custom config path
    RUST_LOG=debug xmpbee-core           # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("xmpbee-core v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("xmpbee_core=info")),
        )
        .init();

    println!(
        r#"
  __  ___  __ __  ____ __
 ( /,'( ) (  )  )(  _ ( ((  _
  )(  )(   )(__)( )(_) ))  )_)
 (__)(__) (______)(____/(____)
                         v{}
"#,
        env!("CARGO_PKG_VERSION")
    );

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config/account.toml".to_string());
    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)?;

    let data_root = data_root();
    info!("Data root: {}", data_root.display());
    let secret_store = std::sync::Arc::new(FileSecretStore::new(&data_root));
    let kv_store = std::sync::Arc::new(FileKeyValueStore::new(&data_root));
    let log_store = std::sync::Arc::new(LogStore::new(&data_root));

    let Some(account_config) = config.account.into_iter().next() else {
        error!("No [[account]] entries in configuration");
        anyhow::bail!("configuration must define at least one account");
    };
    let (account, password) = account_config.into_account();
    info!("Account: {}", account.jid);
    if !account.rooms.is_empty() {
        info!("MUC rooms: {}", account.rooms.join(", "));
    }

    // The Supervisor owns the reconnection ladder itself (§4.4); this
    // loop just drives one Supervisor to completion or Ctrl-C, the way
    // the teacher's main.rs drives one connection attempt at a time.
    let supervisor = SessionSupervisor::new(account, password, secret_store, kv_store, log_store);

    let (event_tx, mut event_rx) = tokio::sync::mpsc::channel::<SupervisorEvent>(256);
    let (cmd_tx, cmd_rx) = tokio::sync::mpsc::channel(64);
    let supervisor_task = tokio::spawn(supervisor.run(event_tx, cmd_rx));

    tokio::select! {
        _ = async {
            while let Some(event) = event_rx.recv().await {
                match event {
                    SupervisorEvent::Connected => info!("Connected"),
                    SupervisorEvent::Disconnected { retrying } => warn!("Disconnected (retrying: {retrying})"),
                    SupervisorEvent::PermanentFailure(reason) => error!("Permanent failure: {reason}"),
                    SupervisorEvent::RoomUpdated(room) => info!("Room updated: {room}"),
                    SupervisorEvent::RoomList { items } => info!("Room list: {} rooms", items.len()),
                }
            }
        } => {
            info!("Supervisor finished");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, disconnecting");
            let _ = cmd_tx.send(SupervisorCommand::Disconnect).await;
        }
    }

    let _ = supervisor_task.await;
    Ok(())
}
