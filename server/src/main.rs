mod auth;
mod config;
mod context;
mod db;
mod recycle;
mod registry;
mod server;
mod session;
mod store;

#[cfg(test)]
mod tests;

use std::fs;
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use config::ServerConfig;
use context::ServerContext;
use krypton_misc::config::ConfigArgs;
use krypton_misc::{display, logs};
use log::{error, info};
use serde_json::json;
use server::Server;

#[derive(Parser, Debug)]
#[command(author, version, about = "Krypton clipboard sync server")]
struct ServerArgs {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a default config file.
    Setup(SetupArgs),

    /// Run the sync server.
    Start(StartArgs),

    /// Manage users.
    User(UserArgs),

    /// Manage API keys.
    Apikey(ApikeyArgs),

    /// Delete entries older than the retention window.
    Cleanup(CleanupArgs),
}

#[derive(Args, Debug)]
struct SetupArgs {
    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Args, Debug)]
struct StartArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Print server configuration data (JSON) and exit.
    #[arg(long)]
    print_config: bool,

    /// Enable debug logging.
    #[arg(long)]
    verbose: bool,

    /// Enable trace logging (implies --verbose).
    #[arg(long)]
    debug: bool,
}

#[derive(Args, Debug)]
struct UserArgs {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: UserCommand,
}

#[derive(Subcommand, Debug)]
enum UserCommand {
    /// List all users.
    List,

    /// Create a new user.
    Add {
        name: String,

        #[arg(long)]
        password: String,

        /// Grant the admin flag.
        #[arg(long)]
        admin: bool,
    },

    /// Delete a user.
    Delete { name: String },

    /// Grant (or with --remove, revoke) the admin flag.
    SetAdmin {
        name: String,

        #[arg(long)]
        remove: bool,
    },
}

#[derive(Args, Debug)]
struct ApikeyArgs {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: ApikeyCommand,
}

#[derive(Subcommand, Debug)]
enum ApikeyCommand {
    /// List API keys. Key values are never displayed.
    List {
        /// Restrict to one user.
        #[arg(long)]
        user: Option<String>,
    },

    /// Mint a new API key. The key value is printed exactly once.
    Generate {
        #[arg(long)]
        user: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        expire_days: Option<u64>,
    },

    /// Revoke an API key by id.
    Revoke { id: String },
}

#[derive(Args, Debug)]
struct CleanupArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Retention window in days, defaults to the configured value.
    #[arg(long)]
    days: Option<u64>,

    /// Report what would be deleted without deleting anything.
    #[arg(long)]
    dry_run: bool,
}

const CONFIG_TEMPLATE: &str = r#"# Krypton server configuration.

# bind = "0.0.0.0:6789"
# max_connections = 1000
# connection_timeout_secs = 120

[db]
# type = "sqlite"
# [db.sqlite]
# path = ""           # default: {data}/server.db

[cleanup]
# enable = false
# interval_hours = 1
# retention_days = 30
# image_retention_days = 0

[tls]
# enable = false
# required = false
# cert_path = ""      # default: {config}/pki/cert.pem
# key_path = ""       # default: {config}/pki/key.pem

[images]
# external = false
# root = ""           # default: {data}

[logs]
# level = "info"
"#;

async fn run(args: ServerArgs) -> Result<()> {
    match args.command {
        Command::Setup(args) => run_setup(args),
        Command::Start(args) => run_start(args).await,
        Command::User(args) => run_user(args),
        Command::Apikey(args) => run_apikey(args),
        Command::Cleanup(args) => run_cleanup(args),
    }
}

fn run_setup(args: SetupArgs) -> Result<()> {
    let ps = args.config.build_path_set()?;
    let path = ps.config_path.join("server.toml");
    if path.exists() {
        bail!("config file {} already exists", path.display());
    }
    fs::write(&path, CONFIG_TEMPLATE)
        .with_context(|| format!("write config file {}", path.display()))?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

async fn run_start(args: StartArgs) -> Result<()> {
    let cfg: ServerConfig = args.config.load("server")?;

    if args.print_config {
        return display::pretty_json(cfg);
    }

    let level = if args.debug {
        "trace"
    } else if args.verbose {
        "debug"
    } else {
        &cfg.logs.level
    };
    logs::init(level)?;

    let ctx = cfg.build_ctx()?;
    let server = Server::new(ctx)?;

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, shutting down");
            shutdown.cancel();
        }
    });

    server.run().await.context("run server")?;

    info!("Server exited");
    Ok(())
}

fn load_ctx(config: &ConfigArgs) -> Result<std::sync::Arc<ServerContext>> {
    let cfg: ServerConfig = config.load("server")?;
    cfg.build_ctx()
}

fn run_user(args: UserArgs) -> Result<()> {
    let ctx = load_ctx(&args.config)?;
    match args.command {
        UserCommand::List => {
            let users = ctx
                .db
                .with_transaction(|tx| tx.list_users())
                .map(db::strip_users)?;
            display::pretty_json(users)
        }
        UserCommand::Add {
            name,
            password,
            admin,
        } => {
            let outcome = auth::register(&ctx, &name, &password, Some("CLI"))?;
            let result = match outcome {
                auth::AuthOutcome::Allowed(result) => result,
                auth::AuthOutcome::Denied(msg) => bail!("{msg}"),
            };
            if admin {
                ctx.db.with_transaction(|tx| tx.set_user_admin(&name, true))?;
            }
            let key = result.api_key.unwrap_or_default();
            display::pretty_json(json!({
                "user": result.user,
                "api_key": key.key,
            }))
        }
        UserCommand::Delete { name } => {
            let deleted = ctx.db.with_transaction(|tx| tx.delete_user(&name))?;
            if !deleted {
                bail!("user '{name}' not found");
            }
            println!("Deleted user '{name}'");
            Ok(())
        }
        UserCommand::SetAdmin { name, remove } => {
            let updated = ctx
                .db
                .with_transaction(|tx| tx.set_user_admin(&name, !remove))?;
            if !updated {
                bail!("user '{name}' not found");
            }
            println!("Updated user '{name}'");
            Ok(())
        }
    }
}

fn run_apikey(args: ApikeyArgs) -> Result<()> {
    let ctx = load_ctx(&args.config)?;
    match args.command {
        ApikeyCommand::List { user } => {
            let keys = ctx.db.with_transaction(|tx| {
                let user_id = match user {
                    Some(ref name) => match tx.get_user_by_name(name)? {
                        Some(user) => Some(user.id),
                        None => bail!("user '{name}' not found"),
                    },
                    None => None,
                };
                tx.list_api_keys(user_id.as_deref())
            })?;
            // The stored secrets stay in the database.
            let keys: Vec<_> = keys
                .into_iter()
                .map(|mut k| {
                    k.key = String::new();
                    k
                })
                .collect();
            display::pretty_json(keys)
        }
        ApikeyCommand::Generate {
            user,
            name,
            expire_days,
        } => {
            let record = ctx.db.with_transaction(|tx| {
                match tx.get_user_by_name(&user)? {
                    Some(record) => Ok(record),
                    None => bail!("user '{user}' not found"),
                }
            })?;
            let expire_time = match expire_days {
                Some(days) => krypton_misc::time::now_millis() + days * 24 * 60 * 60 * 1000,
                None => 0,
            };
            let name = name.unwrap_or_else(|| String::from("CLI Key"));
            let key = auth::mint_key(&ctx, &record.id, &name, expire_time)?;
            display::pretty_json(key)
        }
        ApikeyCommand::Revoke { id } => {
            let revoked = ctx.db.with_transaction(|tx| tx.revoke_api_key(&id))?;
            if !revoked {
                bail!("api key '{id}' not found");
            }
            println!("Revoked api key '{id}'");
            Ok(())
        }
    }
}

fn run_cleanup(args: CleanupArgs) -> Result<()> {
    let cfg: ServerConfig = args.config.load("server")?;
    let ctx = cfg.build_ctx()?;
    let days = args.days.unwrap_or(cfg.cleanup.retention_days);
    if days == 0 {
        bail!("retention days must be greater than 0");
    }

    if args.dry_run {
        let count = ctx.store.count_older_than(days)?;
        println!("Would delete {count} entries older than {days} days");
        return Ok(());
    }

    let count = ctx.store.cleanup_older_than(days, None)?;
    println!("Deleted {count} entries older than {days} days");
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = ServerArgs::parse();
    match run(args).await {
        Ok(()) => {}
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}
