mod commands;
mod config;
mod gemini;
mod remote;
mod server;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use crate::commands::{
    ExitStatus, ProfileEdit, ReceiptEdit, cmd_add, cmd_admin_users, cmd_chat, cmd_chat_log,
    cmd_cloud, cmd_edit, cmd_export_csv, cmd_history, cmd_insights, cmd_logout, cmd_profile_set,
    cmd_profile_show, cmd_scan, cmd_show, cmd_signin, cmd_signup, cmd_status, cmd_sync_pull,
    cmd_sync_push,
};
use crate::config::Config;
use crate::gemini::GeminiClient;
use crate::remote::HttpRemote;
use basket_core::controller::{Controller, SignUp};
use basket_core::db::Database;
use basket_core::remote::{DocumentStore, RemoteStore};

#[derive(Parser)]
#[command(
    name = "basket",
    version,
    about = "Scan grocery receipts and keep your monthly food budget on track"
)]
struct Cli {
    /// More log output on stderr (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Session(SessionCommands),
    /// Start the document-store server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
        /// Disable API key authentication (for development/testing)
        #[arg(long)]
        no_auth: bool,
    },
}

/// Commands that run against the signed-in session.
#[derive(Subcommand)]
enum SessionCommands {
    /// Create an account with an access code
    Signup {
        /// Email address (the account identity)
        #[arg(long)]
        email: String,
        /// Display name
        #[arg(long)]
        name: String,
        /// Access code (master key or promo code)
        #[arg(long)]
        code: String,
        /// Monthly grocery budget
        #[arg(long)]
        budget: Option<f64>,
        /// Dietary regime (e.g. "vegetarian", "no restrictions")
        #[arg(long)]
        diet: Option<String>,
        /// Household context (e.g. "2 adults, 1 child")
        #[arg(long)]
        family: Option<String>,
        /// Shopping goals
        #[arg(long)]
        goals: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Sign in to an existing account
    Signin {
        /// Email address
        email: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Sign out and clear everything stored on this device
    Logout,
    /// Show the signed-in account and sync state
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Read receipt images and save them
    Scan {
        /// Receipt images (jpg, png, webp, heic)
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Record a receipt by hand
    Add {
        /// Store name
        #[arg(long)]
        store: String,
        /// Purchase date (YYYY-MM-DD or today/yesterday, default: today)
        #[arg(long)]
        date: Option<String>,
        /// Line item as NAME:PRICE[:QTY[:CATEGORY]] (repeatable)
        #[arg(short, long = "item", required = true)]
        items: Vec<String>,
        /// Amount saved through discounts
        #[arg(long)]
        saved: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List saved receipts, newest first
    History {
        /// Number of receipts to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one receipt with its items and analysis
    Show {
        /// Receipt ID or unique ID prefix
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Correct a saved receipt
    Edit {
        /// Receipt ID or unique ID prefix
        id: String,
        /// New store name
        #[arg(long)]
        store: Option<String>,
        /// New purchase date (YYYY-MM-DD or today/yesterday)
        #[arg(long)]
        date: Option<String>,
        /// Item number (as listed by `basket show`) the item fields apply to
        #[arg(long)]
        item: Option<usize>,
        /// New item name
        #[arg(long)]
        name: Option<String>,
        /// New item category
        #[arg(long)]
        category: Option<String>,
        /// New item line total
        #[arg(long)]
        price: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Month-to-date spending against the budget
    Insights {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// View or change the profile
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    /// Turn cloud sync on or off
    Cloud {
        #[command(subcommand)]
        command: CloudCommands,
    },
    /// Ask the budget coach a question, or review the conversation
    Chat {
        #[command(subcommand)]
        command: ChatCommands,
    },
    /// Push or pull the account document now
    Sync {
        #[command(subcommand)]
        command: SyncCommands,
    },
    /// Export receipt data
    Export {
        #[command(subcommand)]
        command: ExportCommands,
    },
    /// Owner-only account administration
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },
}

#[derive(Subcommand)]
enum ProfileCommands {
    /// Show the profile
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change profile fields
    Set {
        /// Display name
        #[arg(long)]
        name: Option<String>,
        /// Monthly grocery budget
        #[arg(long)]
        budget: Option<f64>,
        /// Dietary regime
        #[arg(long)]
        diet: Option<String>,
        /// Household context
        #[arg(long)]
        family: Option<String>,
        /// Shopping goals
        #[arg(long)]
        goals: Option<String>,
        /// Extra item categories, comma-separated
        #[arg(long, value_delimiter = ',')]
        categories: Option<Vec<String>>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum CloudCommands {
    /// Push changes to the document store
    On,
    /// Keep changes on this device only
    Off,
}

#[derive(Subcommand)]
enum ChatCommands {
    /// Send a message to the coach
    Ask {
        /// Message text
        message: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the conversation so far
    Log {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum SyncCommands {
    /// Push pending local changes now
    Push,
    /// Pull the account document and merge it
    Pull,
}

#[derive(Subcommand)]
enum ExportCommands {
    /// One CSV row per receipt item
    Csv {
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum AdminCommands {
    /// List every account in the document store
    Users {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn gemini(config: &Config) -> Result<GeminiClient> {
    let Some(key) = config.gemini_api_key.clone() else {
        anyhow::bail!("GEMINI_API_KEY is not set (or add gemini_api_key to config.toml)");
    };
    GeminiClient::new(key, config.gemini_model.clone())
}

fn open_remote(config: &Config) -> Result<Arc<dyn RemoteStore>> {
    if let Some(url) = &config.remote_url {
        let remote = HttpRemote::new(url, config.remote_api_key.clone())?;
        return Ok(Arc::new(remote));
    }
    // Local-only mode keeps account documents next to the cache
    let store = DocumentStore::open(&config.db_path)
        .with_context(|| format!("Failed to open {}", config.db_path.display()))?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        if let Some(ExitStatus(code)) = e.downcast_ref::<ExitStatus>() {
            process::exit(*code);
        }
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    match cli.command {
        Commands::Serve {
            port,
            bind,
            no_auth,
        } => serve(&config, port, &bind, no_auth).await,
        Commands::Session(command) => run_session(&config, command).await,
    }
}

async fn serve(config: &Config, port: u16, bind: &str, no_auth: bool) -> Result<()> {
    let store = DocumentStore::open(&config.db_path)?;
    let api_key = if no_auth {
        None
    } else {
        let (key, _) = config.load_or_create_api_key()?;
        Some(key)
    };
    server::start_server(store, port, bind, api_key).await
}

async fn run_session(config: &Config, command: SessionCommands) -> Result<()> {
    let db = Database::open(&config.db_path)?;
    let remote = open_remote(config)?;
    let mut ctl = Controller::new(Box::new(db), remote).with_debounce(config.sync_debounce);
    ctl.boot().await;

    let result = dispatch(&mut ctl, config, command).await;

    // A short-lived process would otherwise drop the debounced push
    if let Err(e) = ctl.flush().await {
        warn!("cloud push failed, changes are saved locally: {e:#}");
    }
    result
}

#[allow(clippy::too_many_lines)]
async fn dispatch(ctl: &mut Controller, config: &Config, command: SessionCommands) -> Result<()> {
    match command {
        SessionCommands::Signup {
            email,
            name,
            code,
            budget,
            diet,
            family,
            goals,
            json,
        } => {
            let form = SignUp {
                name,
                email,
                access_code: code,
                monthly_budget: budget,
                dietary_regime: diet,
                family_context: family,
                goals,
            };
            cmd_signup(ctl, form, json).await
        }
        SessionCommands::Signin { email, json } => cmd_signin(ctl, &email, json).await,
        SessionCommands::Logout => cmd_logout(ctl),
        SessionCommands::Status { json } => cmd_status(ctl, json),
        SessionCommands::Scan { files, json } => {
            let client = gemini(config)?;
            cmd_scan(ctl, &client, &files, json).await
        }
        SessionCommands::Add {
            store,
            date,
            items,
            saved,
            json,
        } => cmd_add(ctl, &store, date, &items, saved.as_deref(), json),
        SessionCommands::History { limit, json } => cmd_history(ctl, limit, json),
        SessionCommands::Show { id, json } => cmd_show(ctl, &id, json),
        SessionCommands::Edit {
            id,
            store,
            date,
            item,
            name,
            category,
            price,
            json,
        } => {
            let edit = ReceiptEdit {
                store,
                date,
                item,
                name,
                category,
                price,
            };
            cmd_edit(ctl, &id, edit, json)
        }
        SessionCommands::Insights { json } => cmd_insights(ctl, json),
        SessionCommands::Profile { command } => match command {
            ProfileCommands::Show { json } => cmd_profile_show(ctl, json),
            ProfileCommands::Set {
                name,
                budget,
                diet,
                family,
                goals,
                categories,
                json,
            } => {
                let edit = ProfileEdit {
                    name,
                    budget,
                    diet,
                    family,
                    goals,
                    categories,
                };
                cmd_profile_set(ctl, edit, json)
            }
        },
        SessionCommands::Cloud { command } => match command {
            CloudCommands::On => cmd_cloud(ctl, true),
            CloudCommands::Off => cmd_cloud(ctl, false),
        },
        SessionCommands::Chat { command } => match command {
            ChatCommands::Ask { message, json } => {
                let client = gemini(config)?;
                cmd_chat(ctl, &client, &message, json).await
            }
            ChatCommands::Log { json } => cmd_chat_log(ctl, json),
        },
        SessionCommands::Sync { command } => match command {
            SyncCommands::Push => cmd_sync_push(ctl).await,
            SyncCommands::Pull => cmd_sync_pull(ctl).await,
        },
        SessionCommands::Export { command } => match command {
            ExportCommands::Csv { output } => cmd_export_csv(ctl, output.as_deref()),
        },
        SessionCommands::Admin { command } => match command {
            AdminCommands::Users { json } => cmd_admin_users(ctl, json).await,
        },
    }
}
