//! ChainView CLI: replay blocks, run workers and inspect indexer state.
//!
//! # Commands
//! ```text
//! chainview init
//! chainview seed-challenges  [--definitions <path.json>]
//! chainview replay           --blocks <blocks.json> [--skip-challenges]
//! chainview run              --blocks <blocks.json> [--redis-url <url>] [--holder <name>]
//! chainview process-events   [--drain]
//! chainview status
//! chainview skipped          [--level node|network]
//! chainview reverts          [--block <n>]
//! chainview user-challenges  --user <id>
//! chainview eligible         [--limit <n>]
//! chainview disburse         --challenge <id> --specifier <s> --signature <sig> --slot <n>
//! chainview revert           --to <height>
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use chainview_challenges::definitions::default_definitions;
use chainview_challenges::{load_definitions, ChallengeDefinition, ChallengeEventBus, ChallengeRegistry};
use chainview_core::config::IndexerConfig;
use chainview_storage::{SkipLevel, SqliteStorage};

mod cmd_index;
mod cmd_inspect;
mod logging;

use logging::{init_tracing, LogConfig};

#[derive(Parser)]
#[command(
    name = "chainview",
    about = "Reorg-aware entity indexer with a challenge rewards pipeline",
    version
)]
struct Cli {
    /// SQLite database path or URL
    #[arg(long, global = true, default_value = "chainview.db")]
    db: String,

    /// Indexer config (JSON). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Challenge definitions (JSON). The built-in set applies when omitted.
    #[arg(long, global = true)]
    definitions: Option<PathBuf>,

    /// Default log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit JSON logs
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema and seed challenge definitions
    Init,

    /// Upsert challenge definitions into the database
    #[command(name = "seed-challenges")]
    SeedChallenges,

    /// Index a JSON block file until caught up
    Replay {
        /// JSON array of blocks
        #[arg(long)]
        blocks: PathBuf,
        /// Leave dispatched challenge events unprocessed
        #[arg(long)]
        skip_challenges: bool,
    },

    /// Run the block and challenge workers until Ctrl-C
    Run {
        /// JSON array of blocks served as the canonical chain
        #[arg(long)]
        blocks: PathBuf,
        /// Redis URL for the worker leases (in-process leases when omitted)
        #[arg(long)]
        redis_url: Option<String>,
        /// Lease holder name of this process
        #[arg(long, default_value = "chainview")]
        holder: String,
    },

    /// Process pending challenge events
    #[command(name = "process-events")]
    ProcessEvents {
        /// Keep processing batches until none are pending
        #[arg(long)]
        drain: bool,
    },

    /// Show head, checkpoints and queue depth
    Status,

    /// List skipped transactions
    Skipped {
        #[arg(long, value_enum)]
        level: Option<LevelArg>,
    },

    /// Show the revert log
    Reverts {
        /// Only entries for this block height
        #[arg(long)]
        block: Option<u64>,
    },

    /// Show a user's challenge progress
    #[command(name = "user-challenges")]
    UserChallenges {
        #[arg(long)]
        user: u64,
    },

    /// List complete, unpaid challenge instances
    Eligible {
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },

    /// Record the payment of a completed challenge instance
    Disburse {
        #[arg(long)]
        challenge: String,
        #[arg(long)]
        specifier: String,
        /// Payment transaction signature
        #[arg(long)]
        signature: String,
        #[arg(long)]
        slot: u64,
    },

    /// Revert indexed blocks down to (and including) a height
    Revert {
        #[arg(long)]
        to: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LevelArg {
    Node,
    Network,
}

impl From<LevelArg> for SkipLevel {
    fn from(level: LevelArg) -> Self {
        match level {
            LevelArg::Node => SkipLevel::Node,
            LevelArg::Network => SkipLevel::Network,
        }
    }
}

/// Everything a command needs, loaded once from the global flags.
pub(crate) struct App {
    pub config: IndexerConfig,
    pub definitions: Vec<ChallengeDefinition>,
    pub storage: SqliteStorage,
}

impl App {
    async fn load(cli: &Cli) -> Result<Self> {
        let config = match &cli.config {
            Some(path) => IndexerConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => IndexerConfig::default(),
        };
        let definitions = match &cli.definitions {
            Some(path) => load_definitions(path)
                .with_context(|| format!("loading challenge definitions {}", path.display()))?,
            None => default_definitions()?,
        };
        let storage = SqliteStorage::open(&cli.db)
            .await
            .with_context(|| format!("opening database {}", cli.db))?;
        Ok(Self {
            config,
            definitions,
            storage,
        })
    }

    pub fn registry(&self) -> Result<Arc<ChallengeRegistry>> {
        Ok(Arc::new(ChallengeRegistry::from_definitions(&self.definitions)?))
    }

    pub fn bus(&self) -> Result<Arc<ChallengeEventBus>> {
        Ok(Arc::new(ChallengeEventBus::new(
            self.registry()?,
            self.config.challenge_batch_size,
        )))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&LogConfig {
        level: cli.log_level.clone(),
        json: cli.log_json,
        ..LogConfig::default()
    });

    let app = App::load(&cli).await?;

    match cli.command {
        Commands::Init => cmd_index::init(&app).await,
        Commands::SeedChallenges => cmd_index::seed(&app).await,
        Commands::Replay { blocks, skip_challenges } => cmd_index::replay(&app, &blocks, !skip_challenges).await,
        Commands::Run { blocks, redis_url, holder } => {
            cmd_index::run(&app, &blocks, redis_url.as_deref(), &holder).await
        }
        Commands::ProcessEvents { drain } => cmd_index::process_events(&app, drain).await,
        Commands::Status => cmd_inspect::status(&app).await,
        Commands::Skipped { level } => cmd_inspect::skipped(&app, level.map(SkipLevel::from)).await,
        Commands::Reverts { block } => cmd_inspect::reverts(&app, block).await,
        Commands::UserChallenges { user } => cmd_inspect::user_challenges(&app, user).await,
        Commands::Eligible { limit } => cmd_inspect::eligible(&app, limit).await,
        Commands::Disburse {
            challenge,
            specifier,
            signature,
            slot,
        } => cmd_inspect::disburse(&app, &challenge, &specifier, &signature, slot).await,
        Commands::Revert { to } => cmd_index::revert(&app, to).await,
    }
}
