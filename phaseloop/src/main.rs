//! `phaseloop` command line.
//!
//! Sessions live under the home directory (`--home`, `PHASELOOP_HOME`, or
//! `.phaseloop`). Exit codes are listed in [`phaseloop::exit_codes`].

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use phaseloop::control;
use phaseloop::core::circuit_breaker::CircuitBreakerState;
use phaseloop::core::rate_limit::{LimitDecision, RateLimitState};
use phaseloop::core::session::Session;
use phaseloop::core::types::SessionStatus;
use phaseloop::exit_codes;
use phaseloop::io::clock::{AbortSignal, Clock, SystemClock};
use phaseloop::io::config::{LoopConfig, load_config_with_env, resolve_home, write_config};
use phaseloop::io::shutdown;
use phaseloop::io::status_log::{StatusBlock, read_last_block};
use phaseloop::io::store::SessionStore;
use phaseloop::io::worker::CommandWorker;
use phaseloop::logging;
use phaseloop::looping::{LoopStop, run_loop};
use phaseloop::orchestrator::{LoopDecision, Orchestrator};
use phaseloop::start::{open_for_resume, start_session};

#[derive(Parser)]
#[command(
    name = "phaseloop",
    version,
    about = "Autonomous multi-phase loop supervisor"
)]
struct Cli {
    /// Session home directory.
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write `config.toml` with defaults if missing.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Create a new session for a target and print its id.
    Start {
        #[arg(long)]
        target: String,
    },
    /// Tick a session until it completes, halts or pauses.
    Run {
        #[arg(long)]
        session: String,
        /// Must match the target the session was created for.
        #[arg(long)]
        target: String,
        /// Stop after this many ticks.
        #[arg(long)]
        max_ticks: Option<u32>,
    },
    /// Show a session's state and its latest status block.
    Status {
        #[arg(long)]
        session: String,
        #[arg(long)]
        json: bool,
    },
    /// List stored sessions.
    List,
    /// Clear the circuit breaker and rate limiter; reopens halted sessions.
    Reset {
        #[arg(long)]
        session: String,
        #[arg(long, default_value = "")]
        reason: String,
    },
    /// Force the current phase to complete, bypassing the gates.
    Skip {
        #[arg(long)]
        session: String,
        #[arg(long)]
        reason: String,
    },
    /// Halt a session permanently.
    Abort {
        #[arg(long)]
        session: String,
        #[arg(long)]
        reason: String,
    },
    Pause {
        #[arg(long)]
        session: String,
        #[arg(long)]
        reason: String,
    },
    Resume {
        #[arg(long)]
        session: String,
    },
    /// Answer a reached hourly limit.
    Decide {
        #[arg(long)]
        session: String,
        decision: LimitDecision,
    },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let home = resolve_home(cli.home.as_deref(), |key| std::env::var(key).ok());
    let store = SessionStore::new(home);
    let config_path = store.home().config_path.clone();

    if let Command::Init { force } = cli.command {
        return cmd_init(&store, force);
    }
    let config = load_config_with_env(&config_path)
        .with_context(|| format!("load config {}", config_path.display()))?;
    let now = SystemClock.now();

    match cli.command {
        Command::Init { .. } => Ok(exit_codes::OK),
        Command::Start { target } => {
            let state = start_session(&store, &config, &target, now)?;
            println!("{}", state.session.session_id);
            Ok(exit_codes::OK)
        }
        Command::Run {
            session,
            target,
            max_ticks,
        } => cmd_run(store, config, &session, &target, max_ticks),
        Command::Status { session, json } => cmd_status(&store, &session, json),
        Command::List => cmd_list(&store),
        Command::Reset { session, reason } => {
            let mut state = store.load(&session)?;
            control::reset(&store, &mut state, &reason, now)?;
            Ok(status_code(state.session.status))
        }
        Command::Skip { session, reason } => {
            let mut state = store.load(&session)?;
            let change = control::skip_phase(&store, &mut state, &reason, now)?;
            match change.to {
                Some(next) => println!("skipped {} -> {next}", change.from),
                None => println!("skipped {}; session completed", change.from),
            }
            Ok(status_code(state.session.status))
        }
        Command::Abort { session, reason } => {
            let mut state = store.load(&session)?;
            control::abort(&store, &mut state, &reason, now)?;
            Ok(status_code(state.session.status))
        }
        Command::Pause { session, reason } => {
            let mut state = store.load(&session)?;
            control::pause(&store, &mut state, &reason, now)?;
            Ok(status_code(state.session.status))
        }
        Command::Resume { session } => {
            let mut state = store.load(&session)?;
            control::resume(&store, &mut state, now)?;
            Ok(status_code(state.session.status))
        }
        Command::Decide { session, decision } => {
            let mut state = store.load(&session)?;
            control::decide_limit(&store, &mut state, decision, now)?;
            Ok(status_code(state.session.status))
        }
    }
}

fn cmd_init(store: &SessionStore, force: bool) -> Result<i32> {
    let path = &store.home().config_path;
    if path.exists() && !force {
        println!("{} already exists", path.display());
        return Ok(exit_codes::OK);
    }
    write_config(path, &LoopConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_run(
    store: SessionStore,
    config: LoopConfig,
    session_id: &str,
    target: &str,
    max_ticks: Option<u32>,
) -> Result<i32> {
    let mut state = open_for_resume(&store, session_id, target)?;
    if state.session.status == SessionStatus::Paused {
        eprintln!(
            "session {session_id} is paused: {}; run `phaseloop resume` first",
            state.session.pause_reason.as_deref().unwrap_or("no reason recorded")
        );
        return Ok(exit_codes::PAUSED);
    }

    let abort = AbortSignal::new();
    shutdown::install(abort.clone())?;
    let worker = CommandWorker::new(config.worker.clone(), store.home().clone());
    let orchestrator = Orchestrator::new(store, worker, SystemClock, config, abort);

    let outcome = run_loop(&orchestrator, &mut state, max_ticks, |tick, state| {
        let decision = match &tick.decision {
            LoopDecision::Continue => "continue".to_string(),
            LoopDecision::Transition { from, to } => format!("transition {from} -> {to}"),
            LoopDecision::Complete => "complete".to_string(),
            LoopDecision::Pause { reason } => format!("pause: {reason}"),
            LoopDecision::Halt { reason } => format!("halt: {reason}"),
        };
        println!(
            "{} #{} [{}] {} ({}%)",
            tick.phase,
            tick.iteration,
            tick.circuit,
            decision,
            state.session.progress_percent()
        );
    })?;

    Ok(match outcome.stop {
        LoopStop::Complete => exit_codes::COMPLETE,
        LoopStop::Halted { .. } => exit_codes::HALTED,
        LoopStop::Paused { .. } => exit_codes::PAUSED,
        LoopStop::MaxTicks { .. } => exit_codes::OK,
    })
}

#[derive(Serialize)]
struct StatusView<'a> {
    session: &'a Session,
    circuit_breaker: &'a CircuitBreakerState,
    rate_limit: &'a RateLimitState,
    last_status: Option<StatusBlock>,
}

fn cmd_status(store: &SessionStore, session_id: &str, json: bool) -> Result<i32> {
    let state = store.load(session_id)?;
    let last_status = read_last_block(&store.paths(session_id).status_log_path)?;
    let session = &state.session;

    if json {
        let view = StatusView {
            session,
            circuit_breaker: &state.breaker,
            rate_limit: &state.rate_limit,
            last_status,
        };
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        println!("session:    {}", session.session_id);
        println!("target:     {}", session.target);
        println!("status:     {}", session.status);
        println!(
            "phase:      {} (iteration {}, {}% complete)",
            session.current_phase,
            session.current_iteration,
            session.progress_percent()
        );
        println!("breaker:    {}", state.breaker.state);
        println!(
            "calls:      {}/{} until {}",
            state.rate_limit.hourly.calls_made,
            state.rate_limit.hourly.limit,
            state.rate_limit.hourly.next_reset.to_rfc3339()
        );
        if let Some(reason) = session.halt_reason.as_deref().or(session.pause_reason.as_deref()) {
            println!("reason:     {reason}");
        }
        if let Some(block) = last_status {
            println!("last:       {}", block.recommendation);
        }
    }
    Ok(status_code(session.status))
}

fn cmd_list(store: &SessionStore) -> Result<i32> {
    for id in store.list()? {
        match store.load(&id) {
            Ok(state) => println!(
                "{id}\t{}\t{}#{}\t{}",
                state.session.status,
                state.session.current_phase,
                state.session.current_iteration,
                state.session.target
            ),
            Err(err) => println!("{id}\tinvalid\t{err:#}"),
        }
    }
    Ok(exit_codes::OK)
}

fn status_code(status: SessionStatus) -> i32 {
    match status {
        SessionStatus::Running => exit_codes::OK,
        SessionStatus::Completed => exit_codes::COMPLETE,
        SessionStatus::Halted => exit_codes::HALTED,
        SessionStatus::Paused => exit_codes::PAUSED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_budget() {
        let cli = Cli::parse_from([
            "phaseloop",
            "--home",
            "/tmp/pl",
            "run",
            "--session",
            "s1",
            "--target",
            "crate://demo",
            "--max-ticks",
            "3",
        ]);
        assert_eq!(cli.home, Some(PathBuf::from("/tmp/pl")));
        assert!(matches!(
            cli.command,
            Command::Run { ref session, max_ticks: Some(3), .. } if session == "s1"
        ));
    }

    #[test]
    fn parse_decide_value() {
        let cli = Cli::parse_from(["phaseloop", "decide", "--session", "s1", "override"]);
        assert!(matches!(
            cli.command,
            Command::Decide {
                decision: LimitDecision::Override,
                ..
            }
        ));
        assert!(Cli::try_parse_from(["phaseloop", "decide", "--session", "s1", "later"]).is_err());
    }

    #[test]
    fn home_flag_is_global() {
        let cli = Cli::parse_from(["phaseloop", "list", "--home", "/x"]);
        assert_eq!(cli.home, Some(PathBuf::from("/x")));
    }

    #[test]
    fn status_codes_follow_session_status() {
        assert_eq!(status_code(SessionStatus::Running), exit_codes::OK);
        assert_eq!(status_code(SessionStatus::Completed), exit_codes::COMPLETE);
        assert_eq!(status_code(SessionStatus::Halted), exit_codes::HALTED);
        assert_eq!(status_code(SessionStatus::Paused), exit_codes::PAUSED);
    }
}
