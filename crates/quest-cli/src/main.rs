use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use quest_core::{ActionKind, ActionMetadata, Catalog, LeaderboardDisplay, SystemClock, TimePeriod};
use quest_engine::{EngineConfig, LeaderboardRow, LeaderboardView, ProgressionEngine};
use quest_storage::{LearnerProfile, ProgressRepository, SqliteStore};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_DB_PATH: &str = "quest.db";

#[derive(Parser, Debug)]
#[command(name = "quest")]
#[command(about = "Learner progression and leaderboard engine", long_about = None)]
struct Args {
    /// SQLite database (falls back to QUEST_DB, then ./quest.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Signed-in learner id (falls back to QUEST_LEARNER)
    #[arg(long, global = true)]
    learner: Option<String>,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the learner record if it does not exist yet
    Init {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "student")]
        role: String,
    },
    /// Record one learner action
    Track {
        kind: String,
        #[arg(long)]
        minutes: Option<u64>,
        #[arg(long)]
        count: Option<u64>,
        #[arg(long)]
        score: Option<u32>,
        #[arg(long, default_value_t = false)]
        perfect: bool,
    },
    /// Equip an unlocked title
    Equip { title_id: String },
    /// Show the ranked leaderboard
    Leaderboard {
        #[arg(long, default_value = "week")]
        period: String,
        #[arg(long, default_value_t = 10)]
        max_visible: usize,
        #[arg(long, default_value_t = false)]
        compact: bool,
    },
    /// Show level, unlocks and missions
    Level,
    /// Print the effective badge and title catalog
    Catalog {
        /// Store the built-in catalog as the remote one
        #[arg(long, default_value_t = false)]
        seed_defaults: bool,
    },
    /// Run the engine until Ctrl-C; stdin lines are tracked as actions
    Watch,
}

#[derive(Debug, Clone)]
struct Config {
    db_path: PathBuf,
    learner_id: Option<String>,
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args);
    init_logging(&config);

    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("failed to open {}", config.db_path.display()))?,
    );
    info!(event = "store_opened", path = %config.db_path.display());

    match args.command {
        Command::Init { name, role } => {
            let learner_id = require_learner(&config)?;
            let progress = store
                .initialize_learner(&LearnerProfile {
                    learner_id: learner_id.to_string(),
                    name,
                    role,
                })
                .context("failed to initialize learner")?;
            print_json(&progress)?;
        }
        Command::Catalog { seed_defaults } => {
            if seed_defaults {
                store
                    .seed_catalog(&Catalog::default().to_raw())
                    .context("failed to seed catalog")?;
            }
            let engine = connect(store, &config, EngineConfig::default());
            let snapshot = engine.snapshot();
            println!("source: {:?}", snapshot.catalog_source);
            print_json(&snapshot.catalog)?;
        }
        Command::Track {
            kind,
            minutes,
            count,
            score,
            perfect,
        } => {
            require_learner(&config)?;
            let kind = kind.parse::<ActionKind>().map_err(|err| anyhow!(err))?;
            let metadata = ActionMetadata {
                minutes,
                count,
                score,
                perfect: perfect.then_some(true),
            };
            let mut engine = connect(store, &config, EngineConfig::default());
            let outcome = engine.track_action(kind, metadata);
            engine.refresh();
            print_json(&outcome)?;
            engine.shutdown();
        }
        Command::Equip { title_id } => {
            require_learner(&config)?;
            let mut engine = connect(store, &config, EngineConfig::default());
            let change = engine.change_title(&title_id);
            print_json(&change)?;
            engine.shutdown();
            if !change.success {
                bail!("title {title_id} was not equipped");
            }
        }
        Command::Leaderboard {
            period,
            max_visible,
            compact,
        } => {
            let period = period.parse::<TimePeriod>().map_err(|err| anyhow!(err))?;
            let engine_config = EngineConfig {
                leaderboard: LeaderboardDisplay {
                    time_period: period,
                    max_visible,
                    compact,
                },
                ..EngineConfig::default()
            };
            let mut engine = connect(store, &config, engine_config);
            print_leaderboard(period, &engine.leaderboard_view());
            engine.shutdown();
        }
        Command::Level => {
            require_learner(&config)?;
            let mut engine = connect(store, &config, EngineConfig::default());
            engine.refresh();
            let status = engine.level_status();
            let progress = &engine.snapshot().progress;
            println!(
                "level {} ({} xp, {}% to next, {} xp needed)",
                status.level, status.xp, status.level_progress, status.xp_to_next_level
            );
            println!("title: {}", progress.equipped_title_id);
            let hints = engine.activity_insights();
            let at_risk = if hints.streak_at_risk {
                " (study today to keep it)"
            } else {
                ""
            };
            println!("streak: {} days{at_risk}", hints.streak_days.max(progress.streak));
            if let Some(score) = hints.average_quiz_score {
                println!("average quiz score: {score}%");
            }
            println!(
                "badges: {}",
                progress
                    .unlocked_badges
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            for mission in engine.missions() {
                let mark = if mission.is_completed() { "x" } else { " " };
                println!(
                    "[{mark}] {} {}/{} (+{} xp, {})",
                    mission.title,
                    mission.current.min(mission.target),
                    mission.target,
                    mission.xp_reward,
                    mission.window_key
                );
            }
            engine.shutdown();
        }
        Command::Watch => {
            let mut engine = connect(store, &config, EngineConfig::default());
            watch(&mut engine).await?;
        }
    }

    Ok(())
}

fn load_config(args: &Args) -> Config {
    let db_path = args
        .db
        .clone()
        .or_else(|| env_non_empty("QUEST_DB").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));
    let learner_id = args
        .learner
        .clone()
        .filter(|learner| !learner.trim().is_empty())
        .or_else(|| env_non_empty("QUEST_LEARNER"));
    Config {
        db_path,
        learner_id,
        debug: args.debug,
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn init_logging(config: &Config) {
    let level = if config.debug {
        "debug".to_string()
    } else if let Some(level) = env_non_empty("QUEST_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn require_learner(config: &Config) -> Result<&str> {
    config
        .learner_id
        .as_deref()
        .context("no learner: pass --learner or set QUEST_LEARNER")
}

fn connect(store: Arc<SqliteStore>, config: &Config, engine_config: EngineConfig) -> ProgressionEngine {
    ProgressionEngine::new(
        store,
        Arc::new(SystemClock),
        engine_config,
        config.learner_id.clone(),
    )
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to encode output")?;
    println!("{text}");
    Ok(())
}

fn print_leaderboard(period: TimePeriod, view: &LeaderboardView) {
    println!("{period} leaderboard ({} ranked)", view.total_entries);
    for row in &view.rows {
        print_row(row);
    }
    if let Some(row) = &view.pinned_local {
        println!("   ...");
        print_row(row);
    }
}

fn print_row(row: &LeaderboardRow) {
    let marker = if row.is_local { ">" } else { " " };
    let delta = match row.delta {
        Some(delta) if delta > 0 => format!(" (+{delta})"),
        Some(delta) => format!(" ({delta})"),
        None => String::new(),
    };
    println!(
        "{marker}{:>3}. {:<20} {:>7} pts  lvl {:>2}  streak {}{delta}",
        row.entry.rank, row.entry.name, row.entry.points, row.entry.level, row.entry.streak
    );
}

/// Parses `KIND [minutes=N] [count=N] [score=N] [perfect]`.
fn parse_action_line(line: &str) -> Result<(ActionKind, ActionMetadata)> {
    let mut parts = line.split_whitespace();
    let kind = parts
        .next()
        .context("empty action line")?
        .parse::<ActionKind>()
        .map_err(|err| anyhow!(err))?;
    let mut metadata = ActionMetadata::default();
    for part in parts {
        match part.split_once('=') {
            Some(("minutes", value)) => metadata.minutes = Some(value.parse()?),
            Some(("count", value)) => metadata.count = Some(value.parse()?),
            Some(("score", value)) => metadata.score = Some(value.parse()?),
            None if part == "perfect" => metadata.perfect = Some(true),
            _ => bail!("unrecognized action argument: {part}"),
        }
    }
    Ok((kind, metadata))
}

async fn watch(engine: &mut ProgressionEngine) -> Result<()> {
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut shown = HashSet::new();

    info!(event = "watch_started", learner_id = ?engine.learner_id());
    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("failed to listen for ctrl-c")?;
                break;
            }
            line = lines.next_line(), if stdin_open => {
                match line.context("failed to read stdin")? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => match parse_action_line(&line) {
                        Ok((kind, metadata)) => {
                            let outcome = engine.track_action(kind, metadata);
                            print_json(&outcome)?;
                        }
                        Err(err) => warn!(event = "invalid_action_line", error = %err),
                    },
                    None => stdin_open = false,
                }
            }
            changes = engine.wait() => {
                if changes.learner {
                    let status = engine.level_status();
                    println!("level {} ({} xp)", status.level, status.xp);
                }
                if changes.leaderboard {
                    print_leaderboard(
                        engine.leaderboard_display().time_period,
                        &engine.leaderboard_view(),
                    );
                }
            }
        }

        for notification in engine.visible_notifications() {
            if shown.insert(notification.id.clone()) {
                println!("* {}", notification.payload.headline());
            }
        }
    }

    engine.shutdown();
    info!(event = "watch_stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_action_lines() {
        let (kind, metadata) = parse_action_line("quiz-completed score=100").expect("parse");
        assert_eq!(kind, ActionKind::QuizCompleted);
        assert_eq!(metadata.score, Some(100));

        let (kind, metadata) = parse_action_line("STUDY_SESSION minutes=25 perfect").expect("parse");
        assert_eq!(kind, ActionKind::StudySession);
        assert_eq!(metadata.minutes, Some(25));
        assert_eq!(metadata.perfect, Some(true));

        assert!(parse_action_line("").is_err());
        assert!(parse_action_line("NOT_A_KIND").is_err());
        assert!(parse_action_line("QUIZ_COMPLETED bogus=1").is_err());
    }

    #[test]
    fn cli_arguments_parse() {
        let args = Args::try_parse_from([
            "quest",
            "--learner",
            "amy",
            "track",
            "STUDY_SESSION",
            "--minutes",
            "30",
        ])
        .expect("args");
        assert_eq!(args.learner.as_deref(), Some("amy"));
        assert!(matches!(
            args.command,
            Command::Track {
                minutes: Some(30),
                ..
            }
        ));
    }
}
