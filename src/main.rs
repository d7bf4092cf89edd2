use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use waengine::{
    Client, ConnectionState, SocketConfig, WebSocketTransportFactory, use_multi_file_auth_state,
};

/// Opens one connection with a persisted auth state and logs its lifecycle.
///
/// Usage:
///   cargo run -- --auth-dir ./auth
///   cargo run -- --auth-dir ./auth --keep-alive-secs 10
#[derive(Parser)]
#[command(name = "waengine")]
#[command(about = "Connects to the messaging server and reports connection updates")]
struct Cli {
    /// Directory holding creds.json and the key files
    #[arg(long, default_value = "auth_info")]
    auth_dir: PathBuf,

    /// WebSocket endpoint
    #[arg(long)]
    url: Option<String>,

    #[arg(long)]
    keep_alive_secs: Option<u64>,
}

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build tokio runtime: {e}");
            return;
        }
    };

    if let Err(e) = rt.block_on(run(cli)) {
        error!("{e:#}");
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = SocketConfig::default();
    if let Some(url) = cli.url {
        config.url = url;
    }
    if let Some(secs) = cli.keep_alive_secs {
        config.keep_alive_interval = Duration::from_secs(secs);
    }

    let auth = use_multi_file_auth_state(&cli.auth_dir).await?;
    let creds = auth.creds.snapshot().await;
    info!(
        "Loaded auth state from {} (registration id {}, noise key {})",
        cli.auth_dir.display(),
        creds.registration_id,
        hex::encode(creds.noise_key.public_key)
    );

    let client = Client::new(config, auth, Arc::new(WebSocketTransportFactory::new())).await?;
    let mut updates = client.events().connection_update.subscribe();
    let mut creds_updates = client.events().creds_update.subscribe();
    client.start();

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(update) => {
                    info!("Connection update: {update:?}");
                    if update.connection == Some(ConnectionState::Close) {
                        if let Some(error) = update.last_disconnect.and_then(|d| d.error) {
                            warn!("Connection closed: {error}");
                        }
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("Missed {n} connection updates"),
                Err(RecvError::Closed) => break,
            },
            creds = creds_updates.recv() => {
                if creds.is_ok() {
                    client.auth().creds.save().await;
                    info!("Credentials saved");
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, closing connection");
                client.end(None);
            },
        }
    }

    Ok(())
}
