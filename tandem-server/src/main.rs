//! tandem-server — collaborative editing sync server.
//!
//! Configuration comes from the environment (and `.env`), see
//! [`tandem_collab::config`]. Logging is controlled with `RUST_LOG`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;

use tandem_collab::bus::{BusRelay, RedisBus, RelayBus, RelayConfig};
use tandem_collab::storage::{DocumentStore, EventLog, MemoryStore, RocksStore, StoreConfig};
use tandem_collab::{
    issue_token, AccessGate, Backends, FanoutBus, JwtAuthenticator, Permission, ServerConfig,
    SyncServer,
};

#[derive(Parser)]
#[command(name = "tandem-server", about = "Real-time collaborative editing server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the sync server.
    Serve {
        /// Overrides TANDEM_BIND_ADDR.
        #[arg(long)]
        bind: Option<String>,
        /// Create a document owned by this user at startup (useful in memory mode).
        #[arg(long)]
        seed_owner: Option<i64>,
    },
    /// Run a standalone bus relay for multi-instance deployments.
    Relay {
        #[arg(long, default_value = "127.0.0.1:7070")]
        bind: String,
        #[arg(long, default_value_t = 1024)]
        capacity: usize,
    },
    /// Mint a credential for a user.
    Token {
        #[arg(long)]
        user_id: i64,
        #[arg(long, default_value_t = 86_400)]
        ttl_secs: u64,
    },
    /// Create a document in persistent storage. The server must not be running.
    CreateDocument {
        #[arg(long)]
        title: String,
        #[arg(long)]
        owner: i64,
    },
    /// Grant a user access to a document. The server must not be running.
    Share {
        #[arg(long)]
        document: i64,
        /// Acting user; must own the document.
        #[arg(long)]
        owner: i64,
        #[arg(long)]
        user: i64,
        /// `view` or `edit`
        #[arg(long, default_value = "edit")]
        permission: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let mut config = ServerConfig::from_env()?;

    info!("tandem-server {} starting", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Serve { bind, seed_owner } => {
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            serve(config, seed_owner).await
        }
        Commands::Relay { bind, capacity } => {
            BusRelay::new(bind, capacity).run().await?;
            Ok(())
        }
        Commands::Token { user_id, ttl_secs } => {
            let token = issue_token(&config.jwt_secret, user_id, Duration::from_secs(ttl_secs))?;
            println!("{token}");
            Ok(())
        }
        Commands::CreateDocument { title, owner } => {
            let store = open_rocks(&config)?;
            let document = store.create_document(&title, owner).await?;
            store.flush()?;
            println!("{}", document.id);
            Ok(())
        }
        Commands::Share {
            document,
            owner,
            user,
            permission,
        } => {
            let permission: Permission = permission.parse()?;
            let store = Arc::new(open_rocks(&config)?);
            AccessGate::new(store.clone())
                .add_collaborator(owner, document, user, permission)
                .await?;
            store.flush()?;
            println!("user {user} can now {permission} document {document}");
            Ok(())
        }
    }
}

fn open_rocks(config: &ServerConfig) -> anyhow::Result<RocksStore> {
    let path = config
        .storage_path
        .clone()
        .context("TANDEM_STORAGE_PATH must be set for this command")?;
    Ok(RocksStore::open(StoreConfig::new(path))?)
}

async fn serve(config: ServerConfig, seed_owner: Option<i64>) -> anyhow::Result<()> {
    let (documents, events): (Arc<dyn DocumentStore>, Arc<dyn EventLog>) =
        match &config.storage_path {
            Some(_) => {
                let store = Arc::new(open_rocks(&config)?);
                info!("Using RocksDB storage at {}", store.path().display());
                let documents: Arc<dyn DocumentStore> = store.clone();
                (documents, store as Arc<dyn EventLog>)
            }
            None => {
                info!("Using in-memory storage; documents are lost on exit");
                let store = Arc::new(MemoryStore::new());
                let documents: Arc<dyn DocumentStore> = store.clone();
                (documents, store as Arc<dyn EventLog>)
            }
        };

    if let Some(owner) = seed_owner {
        let document = documents.create_document("Untitled", owner).await?;
        info!("Seeded document {} owned by user {owner}", document.id);
    }

    if let Some(relay_bind) = config.relay_bind_addr.clone() {
        let relay = BusRelay::new(relay_bind, 1024);
        tokio::spawn(async move {
            if let Err(e) = relay.run().await {
                log::error!("Embedded bus relay stopped: {e}");
            }
        });
    }

    let bus: Option<Arc<dyn FanoutBus>> = match (&config.redis_url, &config.relay_url) {
        (Some(url), relay) => {
            if relay.is_some() {
                log::warn!("Both REDIS_URL and TANDEM_RELAY_URL are set, using Redis");
            }
            let redis = RedisBus::connect(url)
                .await
                .with_context(|| format!("connecting to Redis at {url}"))?;
            Some(Arc::new(redis))
        }
        (None, Some(url)) => {
            let relay = RelayBus::connect(RelayConfig::new(url.clone()));
            if !relay.wait_connected(Duration::from_secs(5)).await {
                log::warn!("Bus relay at {url} not reachable yet, retrying in background");
            }
            Some(Arc::new(relay))
        }
        (None, None) => None,
    };

    let backends = Backends {
        documents,
        events,
        authenticator: Arc::new(JwtAuthenticator::new(&config.jwt_secret)),
        bus,
    };

    SyncServer::new(config, backends).run().await?;
    Ok(())
}
