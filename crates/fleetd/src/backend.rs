//! Backend mode and user seeding.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::info;

use fleet_backend::{BackendState, BroadcastNotifier, TokenIssuer, build_router, merge};
use fleet_state::{StateStore, UserRecord, epoch_secs};

use crate::BackendArgs;

const API_KEY_LEN: usize = 64;
const PUSH_BUFFER: usize = 256;

fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)?;
    let db_path: PathBuf = data_dir.join("fleet.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

/// Serve the backend API until Ctrl-C.
pub async fn run_backend(args: BackendArgs) -> anyhow::Result<()> {
    info!("fleet backend starting");
    if args.jwt_secret.is_empty() {
        anyhow::bail!("JWT secret must not be empty");
    }

    let store = open_store(&args.data_dir)?;
    let tokens = TokenIssuer::new(
        args.jwt_secret.as_bytes(),
        Duration::from_secs(args.token_ttl),
    );
    let notifier = BroadcastNotifier::new(PUSH_BUFFER);
    let state = BackendState::new(store, tokens, Arc::new(notifier));

    let router = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
        })
        .await?;

    info!("fleet backend stopped");
    Ok(())
}

/// Create a user and print its API key to stdout.
pub fn add_user(email: &str, data_dir: &Path) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;
    let mut rng = rand::thread_rng();
    let now = epoch_secs();
    let api_key: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(API_KEY_LEN)
        .map(char::from)
        .collect();
    let user = UserRecord {
        id: merge::new_id(&mut rng),
        email: email.to_string(),
        api_key,
        controllers: vec![],
        created_at: now,
        updated_at: now,
    };
    store.create_user(&user)?;
    info!(user = %user.id, %email, "user created");

    println!("{}", user.api_key);
    Ok(())
}
