use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vote_tracker::auth::SqliteAuthenticator;
use vote_tracker::config::{Config, ConfigOverrides};
use vote_tracker::history::{
    current_by_board, run_query, AccessTier, HistoryPolicy, HistoryQuery, Interval,
};
use vote_tracker::ingest::Pipeline;
use vote_tracker::output::json::render_json;
use vote_tracker::output::table::{render_current_table, render_history_table, render_tick_table};
use vote_tracker::server::run_server;
use vote_tracker::snapshot::legacy::import_history_file;
use vote_tracker::snapshot::now_in;
use vote_tracker::snapshot::store::SnapshotStore;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "vote-tracker", about = "Scheduled vote snapshots with a history API")]
struct Cli {
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, env = "VOTE_TRACKER_DB", global = true)]
    db: Option<String>,
    #[arg(long, env = "VOTE_TRACKER_SECRET", hide_env_values = true, global = true)]
    session_secret: Option<String>,
    #[arg(long, env = "VOTE_TRACKER_UTC_OFFSET", global = true)]
    utc_offset: Option<String>,
    #[arg(long, env = "VOTE_TRACKER_RETENTION_DAYS", global = true)]
    retention_days: Option<u32>,
    #[arg(long, env = "VOTE_TRACKER_ANONYMOUS_CAP", global = true)]
    anonymous_cap: Option<usize>,
    #[arg(long, env = "VOTE_TRACKER_INTERVAL_SECS", global = true)]
    interval_secs: Option<u64>,
    #[arg(long, env = "VOTE_TRACKER_INGESTION", global = true)]
    ingestion: Option<bool>,
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table, global = true)]
    output: OutputFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP server and, when enabled, the ingestion scheduler.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a single ingestion tick now.
    Tick,
    /// Delete observations past the retention horizon.
    Prune,
    /// Show the latest snapshot of one board, or of every configured board.
    Current {
        #[arg(long)]
        board: Option<String>,
    },
    /// Show windowed history for one board, with full detail.
    History {
        #[arg(long, default_value = "1d")]
        interval: String,
        #[arg(long)]
        board: Option<String>,
        #[arg(long = "candidate")]
        candidates: Vec<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Create a user, or reset the password of an existing one.
    AddUser {
        username: String,
        #[arg(long, env = "VOTE_TRACKER_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long, default_value_t = bcrypt::DEFAULT_COST)]
        cost: u32,
    },
    /// Load a legacy history.json file into the store.
    ImportHistory {
        file: PathBuf,
        #[arg(long)]
        board: Option<String>,
    },
    Config {
        #[arg(long)]
        init: bool,
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load(Some(&config_path))?;
    config.apply_overrides(ConfigOverrides {
        db_path: cli.db.clone(),
        session_secret: cli.session_secret.clone(),
        utc_offset: cli.utc_offset.clone(),
        retention_days: cli.retention_days,
        anonymous_cap: cli.anonymous_cap,
        interval_secs: cli.interval_secs,
        ingestion_enabled: cli.ingestion,
    });

    if matches!(cli.command, Commands::Config { .. }) {
        return handle_config_command(&cli.command, &config, &config_path);
    }
    config.validate()?;

    if let Commands::Serve { host, port } = &cli.command {
        let host = host.clone().unwrap_or_else(|| config.server.host.clone());
        let port = port.unwrap_or(config.server.port);
        let bind = format!("{host}:{port}");
        let addr: SocketAddr = bind
            .parse()
            .map_err(|e| anyhow!("invalid bind address {bind}: {e}"))?;
        return run_server(config, addr).await;
    }

    let offset = config.canonical_offset()?;
    let db_path = config.resolved_db_path();
    let store = SnapshotStore::open(&db_path, offset)
        .with_context(|| format!("failed opening store: {}", db_path.display()))?;

    match &cli.command {
        Commands::Tick => {
            let pipeline = Pipeline::from_config(&config, store)?;
            let report = pipeline.run_tick().await?;
            match cli.output {
                OutputFormat::Table => println!("{}", render_tick_table(&report)),
                OutputFormat::Json => println!("{}", render_json(&report)?),
            }
        }
        Commands::Prune => {
            let pipeline = Pipeline::from_config(&config, store)?;
            let deleted = pipeline.prune().await?;
            println!(
                "Removed {deleted} observations older than {} days",
                config.storage.retention_days
            );
        }
        Commands::Current { board } => {
            let boards = match board {
                Some(board) => vec![resolve_board(&config, Some(board))?],
                None => {
                    let configured: Vec<String> =
                        config.boards.iter().map(|b| b.id.clone()).collect();
                    for stored in store.boards()? {
                        if !configured.contains(&stored) {
                            warn!("board {stored} has stored observations but is not configured");
                        }
                    }
                    configured
                }
            };
            let current = current_by_board(&store, &boards)?;
            match cli.output {
                OutputFormat::Table => {
                    for (board, snapshot) in &current {
                        println!("{}", render_current_table(board, snapshot.as_ref()));
                    }
                }
                OutputFormat::Json => println!("{}", render_json(&current)?),
            }
        }
        Commands::History {
            interval,
            board,
            candidates,
            limit,
        } => {
            let query = HistoryQuery {
                interval: Interval::parse_or_default(Some(interval.as_str())),
                board: Some(resolve_board(&config, board.as_deref())?),
                candidates: candidates.clone(),
                limit: *limit,
                tier: AccessTier::Authenticated,
            };
            let policy = HistoryPolicy::from_config(&config);
            let snapshots = run_query(&store, &policy, &query, now_in(offset))?;
            match cli.output {
                OutputFormat::Table => println!("{}", render_history_table(&snapshots)),
                OutputFormat::Json => println!("{}", render_json(&snapshots)?),
            }
        }
        Commands::AddUser {
            username,
            password,
            cost,
        } => {
            SqliteAuthenticator::new(store).create_user(username, password, *cost)?;
            println!("User {username} saved");
        }
        Commands::ImportHistory { file, board } => {
            let board = resolve_board(&config, board.as_deref())?;
            let summary = import_history_file(&store, file, &board)?;
            info!(
                "imported {} snapshots ({} rows) into board {board}, skipped {}",
                summary.snapshots, summary.rows, summary.skipped
            );
            println!(
                "Imported {} snapshots, {} rows, {} skipped",
                summary.snapshots, summary.rows, summary.skipped
            );
        }
        Commands::Serve { .. } | Commands::Config { .. } => {}
    }

    Ok(())
}

fn handle_config_command(command: &Commands, config: &Config, config_path: &Path) -> Result<()> {
    let Commands::Config { init, show } = command else {
        return Ok(());
    };
    if *init {
        Config::write_template(config_path)?;
        println!("Wrote config template to {}", config_path.display());
    }
    if *show || !*init {
        println!("{}", render_json(config)?);
    }
    Ok(())
}

/// Defaults to the first configured board.
fn resolve_board(config: &Config, board: Option<&str>) -> Result<String> {
    match board {
        Some(id) if config.boards.iter().any(|b| b.id == id) => Ok(id.to_string()),
        Some(id) => Err(anyhow!("unknown board: {id}")),
        None => config
            .boards
            .first()
            .map(|b| b.id.clone())
            .ok_or_else(|| anyhow!("no boards configured")),
    }
}
