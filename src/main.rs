use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::collections::HashSet;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use dice_stats::channel::NullChannel;
use dice_stats::config::resolve_data_root;
use dice_stats::identity::{Directory, Identity};
use dice_stats::logging;
use dice_stats::query::{self, SessionFilter, UserFilter};
use dice_stats::renderer;
use dice_stats::stats::GlobalStats;
use dice_stats::store::SqliteStore;
use dice_stats::streaks::ALL;
use dice_stats::timefmt::today_key;
use dice_stats::tracker::{Outcome, Tracker};

#[derive(Parser)]
#[command(name = "dice-stats")]
#[command(about = "Dice roll statistics for tabletop sessions", long_about = None)]
struct Cli {
    /// Data directory (defaults to $DICE_STATS_DATA_DIR or .dice-stats)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Roster JSON with users and actors. Without it a single local GM is assumed.
    #[arg(long, global = true)]
    roster: Option<PathBuf>,

    /// User id this process runs as (defaults to the roster's current user)
    #[arg(long = "as", value_name = "USER_ID", global = true)]
    as_user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record rolls from a JSON Lines file of chat messages and workflows
    Ingest {
        /// One event per line: {"message": .., "hookUserId": ..}, {"workflow": ..} or a bare message
        events: PathBuf,
    },
    /// Render a Markdown report
    Report {
        /// User id, or "all"
        #[arg(long, default_value = "all")]
        user: String,
        /// "all", "today" or a YYYY-MM-DD session date
        #[arg(long, default_value = "all")]
        session: String,
        /// Action type filter (attack, damage, save, ...)
        #[arg(long, default_value = "all")]
        action: String,
        /// Detail filter for save, skill, check and ability rolls
        #[arg(long, default_value = "all")]
        detail: String,
        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Reset statistics for one user or everyone
    Reset {
        #[arg(long, conflicts_with = "all", required_unless_present = "all")]
        user: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Hide a user from aggregate views
    Hide { user: String },
    /// Show a previously hidden user again
    Unhide { user: String },
    /// Show settings, or change them with --set key=value
    Settings {
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },
    /// Generate demo statistics for a user
    Generate {
        #[arg(long)]
        user: String,
    },
    /// Write all statistics to a JSON file
    Export { path: PathBuf },
    /// Replace all statistics with a JSON export
    Import { path: PathBuf },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Ingest { .. } => "ingest",
            Commands::Report { .. } => "report",
            Commands::Reset { .. } => "reset",
            Commands::Hide { .. } => "hide",
            Commands::Unhide { .. } => "unhide",
            Commands::Settings { .. } => "settings",
            Commands::Generate { .. } => "generate",
            Commands::Export { .. } => "export",
            Commands::Import { .. } => "import",
        }
    }
}

fn load_identity(roster: Option<&Path>, as_user: Option<&str>) -> Result<Arc<dyn Identity>> {
    let directory = match roster {
        Some(path) => Directory::load(path)?,
        None => Directory::local_gm(),
    };
    let directory = match as_user {
        Some(user_id) => directory.as_user(user_id),
        None => directory,
    };
    if directory.current_user.is_none() {
        bail!("No current user: pass --as <USER_ID> or set currentUser in the roster");
    }
    Ok(Arc::new(directory))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => resolve_data_root()?,
    };
    logging::init_logging(&data_dir, cli.command.name())?;

    let identity = load_identity(cli.roster.as_deref(), cli.as_user.as_deref())?;
    let store = Arc::new(SqliteStore::init(&data_dir)?);

    tokio::runtime::Runtime::new()
        .context("Failed to create Tokio runtime")?
        .block_on(run(cli.command, identity, store))
}

async fn run(command: Commands, identity: Arc<dyn Identity>, store: Arc<SqliteStore>) -> Result<()> {
    let tracker = Tracker::new(identity.clone(), store, Arc::new(NullChannel))?;

    match command {
        Commands::Ingest { events } => ingest(&tracker, &events).await?,
        Commands::Report {
            user,
            session,
            action,
            detail,
            output,
        } => {
            let markdown = report(&tracker, identity.as_ref(), &user, &session, &action, &detail)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, markdown)
                        .with_context(|| format!("Failed to write report: {}", path.display()))?;
                    eprintln!("Markdown report written to: {}", path.display());
                }
                None => print!("{}", markdown),
            }
        }
        Commands::Reset { user, all } => {
            if all {
                tracker.reset_all()?;
                eprintln!("All statistics reset");
            } else if let Some(user) = user {
                if tracker.reset_user(&user)? {
                    eprintln!("Statistics reset for {}", user);
                } else {
                    eprintln!("No statistics recorded for {}", user);
                }
            }
        }
        Commands::Hide { user } => {
            let mut changed = false;
            tracker.update_settings(|settings| changed = settings.hide_player(&user))?;
            eprintln!("{} {}", user, if changed { "is now hidden" } else { "was already hidden" });
        }
        Commands::Unhide { user } => {
            let mut changed = false;
            tracker.update_settings(|settings| changed = settings.unhide_player(&user))?;
            eprintln!("{} {}", user, if changed { "is visible again" } else { "was not hidden" });
        }
        Commands::Settings { set } => {
            let mut settings = tracker.settings();
            if !set.is_empty() {
                for assignment in &set {
                    settings.apply_override(assignment)?;
                }
                let updated = settings.clone();
                settings = tracker.update_settings(|current| *current = updated)?;
            }
            println!(
                "{}",
                serde_json::to_string_pretty(&settings).context("Failed to serialize settings")?
            );
            if !settings.hidden_players.is_empty() {
                println!("Hidden players: {}", settings.hidden_players.join(", "));
            }
        }
        Commands::Generate { user } => {
            let summary = tracker.generate_fake_data(&user)?;
            eprintln!(
                "Generated {} rolls over {} sessions for {}",
                summary.rolls, summary.sessions, user
            );
        }
        Commands::Export { path } => {
            tracker.global_stats().save_to_file(&path)?;
            eprintln!("Statistics exported to: {}", path.display());
        }
        Commands::Import { path } => {
            let global = GlobalStats::load_from_file(&path)?;
            let rolls = global.aggregate.totals.rolls;
            tracker.import(global)?;
            eprintln!("Imported {} rolls from: {}", rolls, path.display());
        }
    }

    tracker.flush().await;
    Ok(())
}

#[derive(Default)]
struct IngestSummary {
    events: usize,
    recorded: usize,
    forwarded: usize,
    display_only: usize,
    skipped: usize,
    empty: usize,
}

async fn ingest(tracker: &Tracker, events: &Path) -> Result<()> {
    let file = std::fs::File::open(events)
        .with_context(|| format!("Failed to open events file: {}", events.display()))?;
    if !tracker.is_writer() {
        warn!("This process is not the writer; rolls are relayed and not stored here");
        eprintln!("Warning: not running as the primary GM, rolls will not be stored");
    }

    let mut summary = IngestSummary::default();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read line {}", index + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let event: Value = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(err) => {
                warn!("Skipping malformed event on line {}: {}", index + 1, err);
                summary.skipped += 1;
                continue;
            }
        };
        summary.events += 1;

        let outcome = if let Some(workflow) = event.get("workflow") {
            tracker.handle_workflow(workflow).await
        } else if let Some(message) = event.get("message") {
            let hook_user = event.get("hookUserId").and_then(Value::as_str);
            tracker.handle_chat_message(message, hook_user).await
        } else {
            tracker.handle_chat_message(&event, None).await
        };

        match outcome {
            Outcome::Recorded(count) => summary.recorded += count,
            Outcome::Forwarded(count) => summary.forwarded += count,
            Outcome::DisplayOnly => summary.display_only += 1,
            Outcome::Skipped(_) => summary.skipped += 1,
            Outcome::Empty => summary.empty += 1,
        }
    }

    info!(
        "Ingested {} events: {} recorded, {} forwarded, {} skipped",
        summary.events, summary.recorded, summary.forwarded, summary.skipped
    );
    eprintln!("Events:       {}", summary.events);
    eprintln!("Recorded:     {}", summary.recorded);
    eprintln!("Forwarded:    {}", summary.forwarded);
    eprintln!("Display only: {}", summary.display_only);
    eprintln!("Skipped:      {}", summary.skipped);
    eprintln!("No dice:      {}", summary.empty);

    if let Some(latest) = tracker.visible_latest() {
        let who = latest.user_name.or(latest.user_id).unwrap_or_else(|| "Unknown".to_string());
        eprintln!("Latest roll:  {} ({})", who, query::action_label(&latest.action_type));
    }
    Ok(())
}

fn report(
    tracker: &Tracker,
    identity: &dyn Identity,
    user: &str,
    session: &str,
    action: &str,
    detail: &str,
) -> Result<String> {
    let user_filter = UserFilter::parse(user);
    let session_filter = SessionFilter::parse(session);
    let action = if action.trim().is_empty() { ALL } else { action.trim() };
    let detail = if detail.trim().is_empty() { ALL } else { detail.trim() };

    let global = tracker.global_stats();
    let settings = tracker.settings();
    let hidden = query::hidden_user_ids(&settings, identity);
    let today = today_key();

    let stats = tracker.view(&user_filter, &session_filter);
    let stats = query::filtered_view(&stats, action, detail);

    let streak_users: Vec<String> = match &user_filter {
        UserFilter::User(user_id) => vec![user_id.clone()],
        UserFilter::All => global
            .users
            .keys()
            .filter(|user_id| !hidden.contains(*user_id))
            .cloned()
            .collect(),
    };
    let streaks = query::streak_source(&global, &streak_users, &session_filter, &today);

    let sessions = match session_filter.date_key(&today) {
        Some(_) => Default::default(),
        None => {
            let visible: HashSet<String> = query::visible_session_dates(&global, &hidden)
                .into_iter()
                .collect();
            let mut sessions = query::all_session_stats(&global, &user_filter, &hidden);
            sessions.retain(|date_key, _| visible.contains(date_key));
            sessions
        }
    };

    let user_label = match &user_filter {
        UserFilter::All => "All players".to_string(),
        UserFilter::User(user_id) => identity.user_name(user_id).unwrap_or_else(|| user_id.clone()),
    };
    let session_label = session_filter
        .date_key(&today)
        .unwrap_or_else(|| "All sessions".to_string());

    let latest = tracker.visible_latest();
    let report = renderer::md::Report {
        title: "Dice Stats".to_string(),
        scope: format!("{} · {}", user_label, session_label),
        stats: &stats,
        streaks: &streaks,
        action_filter: action,
        detail_filter: detail,
        sessions: &sessions,
        latest: latest.as_ref(),
    };
    renderer::md::render(&report)
}
