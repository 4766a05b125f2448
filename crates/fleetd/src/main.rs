//! fleetd — the runner fleet daemon.
//!
//! One binary, two roles:
//! - `controller`: receives webhooks for one repository, provisions and
//!   tracks runners, scrapes their metrics, and syncs to a backend
//! - `backend`: accepts controller registrations and snapshot syncs
//!
//! # Usage
//!
//! ```text
//! fleetd controller --repo acme/app --backend-url https://fleet.example.com
//! fleetd backend --port 8080 --data-dir /var/lib/fleet
//! fleetd add-user --email ops@example.com --data-dir /var/lib/fleet
//! ```

mod backend;
mod controller;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "fleetd", about = "Runner fleet daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a controller for one repository.
    Controller(ControllerArgs),

    /// Run the backend API.
    Backend(BackendArgs),

    /// Create a user and print its API key.
    AddUser {
        #[arg(long)]
        email: String,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/fleet")]
        data_dir: PathBuf,
    },
}

#[derive(Args)]
pub struct ControllerArgs {
    /// Repository in owner/repo form.
    #[arg(long, env = "REPO")]
    pub repo: String,

    /// GitHub token allowed to manage the repository's webhooks.
    #[arg(long, env = "GITHUB_PAT", hide_env_values = true)]
    pub github_pat: String,

    /// Backend API key of the owning user.
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    pub api_key: String,

    #[arg(long, env = "BACKEND_URL")]
    pub backend_url: String,

    /// Address GitHub should deliver webhooks to. Read from the task
    /// metadata endpoint when omitted.
    #[arg(long, env = "PUBLIC_ADDRESS")]
    pub public_address: Option<String>,

    /// TOML file with loop tuning.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Port for the webhook endpoint.
    #[arg(long, default_value = "80")]
    pub port: u16,

    /// Shell command that starts a runner task and prints its address.
    #[arg(long, env = "PROVISION_COMMAND")]
    pub provision_command: Option<String>,
}

#[derive(Args)]
pub struct BackendArgs {
    /// Port to listen on.
    #[arg(long, default_value = "8080")]
    pub port: u16,

    /// Data directory for persistent state.
    #[arg(long, default_value = "/var/lib/fleet")]
    pub data_dir: PathBuf,

    /// HS256 secret for controller tokens.
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: String,

    /// Controller token lifetime in seconds.
    #[arg(long, default_value = "86400")]
    pub token_ttl: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fleetd=debug,fleet=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Controller(args) => controller::run_controller(args).await,
        Command::Backend(args) => backend::run_backend(args).await,
        Command::AddUser { email, data_dir } => backend::add_user(&email, &data_dir),
    }
}
