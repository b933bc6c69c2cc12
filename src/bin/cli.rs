//! Realm Sync CLI
//!
//! Local execution entry point: long-running daemon plus one-shot maintenance commands.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use realm_sync::{
    config,
    error::Result,
    models::{CharacterJob, GuildJob, JobPayload},
    pipeline::{self, Engine, ResyncTarget},
    utils,
};

/// Realm Sync - game world crawler and reconciler
#[derive(Parser, Debug)]
#[command(name = "realm-sync", version, about = "Game world crawl-and-reconcile engine")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the sweeper, periodic resyncs and fetch workers until Ctrl-C
    Run,

    /// Drain and rebuild one bulk resync, then work the queues until idle
    Resync {
        #[arg(value_enum)]
        target: Target,
    },

    /// Refresh a single character or guild on demand
    Refresh {
        #[arg(value_enum)]
        kind: EntityKind,

        #[arg(long)]
        name: String,

        #[arg(long)]
        realm: String,

        /// Override the staleness window, in seconds
        #[arg(long)]
        force_update_secs: Option<u64>,

        /// Only register the entity if it is missing
        #[arg(long)]
        create_only: bool,
    },

    /// Sweep the credential pool once and show its state
    Sweep,

    /// Print the change history of a character or guild
    Audit {
        #[arg(long)]
        name: String,

        #[arg(long)]
        realm: String,
    },

    /// Validate the configuration file
    Validate,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Target {
    Realms,
    Characters,
    Guilds,
    Items,
    Auctions,
    Commodity,
}

impl From<Target> for ResyncTarget {
    fn from(target: Target) -> Self {
        match target {
            Target::Realms => ResyncTarget::Realms,
            Target::Characters => ResyncTarget::Characters,
            Target::Guilds => ResyncTarget::Guilds,
            Target::Items => ResyncTarget::Items,
            Target::Auctions => ResyncTarget::Auctions,
            Target::Commodity => ResyncTarget::Commodity,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum EntityKind {
    Character,
    Guild,
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Command::Validate = cli.command {
        log::info!("Validating configuration...");
        let loaded = config::load_config(&cli.config)?;
        if let Err(e) = loaded.validate() {
            log::error!("Config validation failed: {}", e);
            return Err(e);
        }
        log::info!("Config OK: {} credentials", loaded.credentials.len());
        return Ok(());
    }

    let config = config::load_validated(&cli.config)?;
    let engine = Arc::new(Engine::open(config).await?);

    match cli.command {
        Command::Run => pipeline::run_daemon(engine).await?,

        Command::Resync { target } => {
            let (scheduled, worked) = pipeline::run_resync(engine, target.into()).await?;
            log::info!("Scheduled: {}", scheduled);
            log::info!("Worked: {}", worked);
        }

        Command::Refresh {
            kind,
            name,
            realm,
            force_update_secs,
            create_only,
        } => {
            let label = format!("{} ({})", name, realm);
            let payload = match kind {
                EntityKind::Character => {
                    let mut job = CharacterJob::new(name, realm);
                    job.force_update_secs = force_update_secs;
                    job.create_only_unique = create_only;
                    job.source = "cli".to_string();
                    JobPayload::Character(job)
                }
                EntityKind::Guild => {
                    let mut job = GuildJob::new(name, realm);
                    job.force_update_secs = force_update_secs;
                    job.create_only_unique = create_only;
                    job.source = "cli".to_string();
                    JobPayload::Guild(job)
                }
            };
            let (outcome, worked) = pipeline::run_refresh(engine, payload).await?;
            log::info!("{}: {:?}; {}", label, outcome, worked);
        }

        Command::Sweep => {
            let report = pipeline::sweep_once(&engine).await;
            log::info!("{} reset, {} tripped", report.reset, report.tripped);
            for credential in engine.pool.snapshot().await {
                println!(
                    "{:<24} {:<18} errors={:<4} token={}",
                    credential.client_id,
                    format!("{:?}", credential.status),
                    credential.error_counts,
                    credential
                        .expires_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "none".to_string())
                );
            }
        }

        Command::Audit { name, realm } => {
            let slug = match engine.realms.find_realm(&realm).await? {
                Some(found) => found.slug,
                None => {
                    log::warn!("Realm '{}' is not in the directory; using it as given", realm);
                    realm
                }
            };
            let guid = utils::guid(&name, &slug);
            let entries = engine.store.audit_for(&guid).await?;
            if entries.is_empty() {
                log::info!("No recorded changes for {}", guid);
            }
            for entry in entries {
                println!(
                    "{}  {:<10} {} -> {}",
                    entry.created_at.to_rfc3339(),
                    entry.action.to_string(),
                    entry.original,
                    entry.updated
                );
            }
        }

        Command::Validate => {}
    }

    Ok(())
}
