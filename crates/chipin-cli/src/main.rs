//! chipin - a terminal client for the chipin event funding service.
//!
//! Logs in, browses events, creates events, joins them and contributes
//! funds. Session handling (stored tokens, refresh on expiry) lives in
//! `chipin-core`; this binary only turns commands into calls and session
//! signals into messages.

use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chipin_core::auth::EndReason;
use chipin_core::models::NewEvent;
use chipin_core::{ApiError, Config, Session, SessionSignal, SessionState};
use futures::stream::{self, StreamExt};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Event details fetched concurrently by `events --details`
const MAX_CONCURRENT_REQUESTS: usize = 4;

const USAGE: &str = "\
Usage: chipin <command> [args]

Commands:
  login [username]                 Log in (password is prompted)
  register <username>              Create an account
  logout                           End the session
  whoami                           Show the logged-in user
  events [--details]               List events
  event <id>                       Show an event with participants
  create <title> <location> <time> [funds] [participants]
                                   Create an event (time in RFC 3339)
  join <id>                        Join an event
  contribute <id> <amount>         Contribute to an event";

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr (filtered by RUST_LOG, default `warn`) and to a daily
/// rolling file in `log_dir` when one is available.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "chipin.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let mut config = match Config::load() {
        Ok(c) => c.apply_env(),
        Err(e) => {
            eprintln!("Warning: failed to load config ({}), using defaults", e);
            Config::default().apply_env()
        }
    };

    let log_dir = config.data_dir().ok();
    if let Some(ref dir) = log_dir {
        let _ = std::fs::create_dir_all(dir);
    }
    let _log_guard = init_tracing(log_dir.as_deref());
    info!(api = %config.api_base_url, "chipin starting");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        println!("{}", USAGE);
        return Ok(());
    };

    let session = Session::connect(&config).context("Failed to set up session")?;
    let mut signals = session.signals();

    match session.restore() {
        Ok(state) => info!(%state, "Session initialized"),
        Err(e) => warn!(error = %e, "Could not read stored session"),
    }

    let result = run_command(&session, &mut config, command, &args[1..]).await;
    report_signals(&mut signals);

    if let Err(e) = result {
        if let Some(api) = e.downcast_ref::<ApiError>() {
            if api.requires_login() {
                eprintln!("Session expired. Please run `chipin login`.");
                std::process::exit(2);
            }
        }
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn run_command(
    session: &Session,
    config: &mut Config,
    command: &str,
    args: &[String],
) -> Result<()> {
    match command {
        "login" => login(session, config, args.first().cloned()).await,
        "register" => {
            let username = args.first().context("register needs a username")?;
            let password = prompt_new_password()?;
            session
                .register(username, &password)
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            Ok(())
        }
        "logout" => {
            session.logout()?;
            Ok(())
        }
        "whoami" => {
            match session.current_user() {
                Some(user) => println!("{} (id {})", user.username, user.user_id),
                None => println!("Not logged in"),
            }
            Ok(())
        }
        "events" => list_events(session, args.iter().any(|a| a == "--details")).await,
        "event" => {
            let id = parse_id(args.first())?;
            show_event(session, id).await
        }
        "create" => create_event(session, args).await,
        "join" => {
            let id = parse_id(args.first())?;
            require_login(session)?;
            let ack = session.events().join_event(id).await?;
            println!("{}", ack.status.as_deref().unwrap_or("Joined"));
            Ok(())
        }
        "contribute" => {
            let id = parse_id(args.first())?;
            let amount: f64 = args
                .get(1)
                .context("contribute needs an amount")?
                .parse()
                .context("amount must be a number")?;
            require_login(session)?;
            let ack = session.events().contribute(id, amount).await?;
            println!("{}", ack.status.as_deref().unwrap_or("Contribution accepted"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => Err(anyhow::anyhow!("unknown command `{}`\n\n{}", other, USAGE)),
    }
}

async fn login(session: &Session, config: &mut Config, username: Option<String>) -> Result<()> {
    let username = match username
        .or_else(|| std::env::var("CHIPIN_USERNAME").ok())
        .or_else(|| config.last_username.clone())
    {
        Some(name) if !name.trim().is_empty() => name,
        _ => prompt_username()?,
    };

    let password = rpassword::prompt_password("Password: ")?;
    if password.is_empty() {
        return Err(anyhow::anyhow!("Username and password required"));
    }

    let claims = session
        .login(&username, &password)
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;

    config.last_username = Some(claims.username.clone());
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }
    Ok(())
}

fn prompt_username() -> Result<String> {
    print!("Username: ");
    io::stdout().flush()?;

    let mut username = String::new();
    io::stdin().read_line(&mut username)?;
    Ok(username.trim().to_string())
}

fn prompt_new_password() -> Result<String> {
    let password = rpassword::prompt_password("Password: ")?;
    let confirm = rpassword::prompt_password("Confirm password: ")?;
    if password != confirm {
        return Err(anyhow::anyhow!("Passwords do not match"));
    }
    if password.is_empty() {
        return Err(anyhow::anyhow!("Password required"));
    }
    Ok(password)
}

fn parse_id(arg: Option<&String>) -> Result<i64> {
    arg.context("missing event id")?
        .parse()
        .context("event id must be a number")
}

fn require_login(session: &Session) -> Result<()> {
    if matches!(session.state(), SessionState::Authenticated(_)) {
        Ok(())
    } else {
        Err(anyhow::anyhow!("Not logged in. Run `chipin login` first."))
    }
}

async fn list_events(session: &Session, details: bool) -> Result<()> {
    require_login(session)?;
    let api = session.events();
    let events = api.list_events().await?;

    if events.is_empty() {
        println!("No events yet.");
        return Ok(());
    }

    for event in &events {
        println!(
            "#{:<4} {} @ {} ({} participants{})",
            event.id,
            event.title,
            event.location.as_deref().unwrap_or("-"),
            event.participants_count,
            event
                .organizer
                .as_deref()
                .map(|o| format!(", by {}", o))
                .unwrap_or_default()
        );
    }

    if details {
        let fetched: Vec<_> = stream::iter(events.iter().map(|e| e.id))
            .map(|id| {
                let api = api.clone();
                async move { (id, api.event(id).await) }
            })
            .buffered(MAX_CONCURRENT_REQUESTS)
            .collect()
            .await;

        println!();
        for (id, result) in fetched {
            match result {
                Ok(event) => println!(
                    "#{:<4} collected {:.2} of {}",
                    id,
                    event.total_collected,
                    event.required_funds.as_deref().unwrap_or("-")
                ),
                Err(e) => println!("#{:<4} details unavailable: {}", id, e),
            }
        }
    }
    Ok(())
}

async fn show_event(session: &Session, id: i64) -> Result<()> {
    require_login(session)?;
    let event = session.events().event(id).await?;

    println!("{}", event.title);
    if let Some(location) = &event.location {
        println!("Location: {}", location);
    }
    if let Some(time) = &event.event_time {
        println!("When: {}", time.format("%Y-%m-%d %H:%M UTC"));
    }
    if let Some(description) = &event.description {
        println!("{}", description);
    }
    match event.funding_progress() {
        Some(progress) => println!(
            "Collected: {:.2} of {} ({:.0}%)",
            event.total_collected,
            event.required_funds.as_deref().unwrap_or("-"),
            progress * 100.0
        ),
        None => println!("Collected: {:.2}", event.total_collected),
    }

    println!("Participants ({}):", event.participants.len());
    for p in &event.participants {
        println!(
            "  {:<20} paid {:.2}{}",
            p.participant_username,
            p.paid_amount_value(),
            p.status
                .as_deref()
                .map(|s| format!(" [{}]", s))
                .unwrap_or_default()
        );
    }

    if let Some(user) = session.current_user() {
        if event.is_participant(&user.username) {
            println!("You are participating.");
        }
    }
    Ok(())
}

async fn create_event(session: &Session, args: &[String]) -> Result<()> {
    require_login(session)?;
    let title = args.first().context("create needs a title")?;
    let location = args.get(1).context("create needs a location")?;
    let event_time = args
        .get(2)
        .context("create needs a time")?
        .parse::<chrono::DateTime<chrono::Utc>>()
        .context("time must be RFC 3339, e.g. 2026-11-01T09:00:00Z")?;
    let required_funds = args
        .get(3)
        .map(|s| s.parse::<f64>())
        .transpose()
        .context("funds must be a number")?;
    let required_participants = args
        .get(4)
        .map(|s| s.parse::<u32>())
        .transpose()
        .context("participants must be a whole number")?;

    let new_event = NewEvent {
        title: title.clone(),
        description: None,
        location: location.clone(),
        event_time,
        required_participants,
        required_funds,
    };
    let created = session.events().create_event(&new_event).await?;
    println!("Created event #{} {}", created.id, created.title);
    Ok(())
}

/// Turn session signals into routing messages.
fn report_signals(signals: &mut broadcast::Receiver<SessionSignal>) {
    while let Ok(signal) = signals.try_recv() {
        match signal {
            SessionSignal::SessionRestored(claims) => {
                info!(user = %claims.username, "Session restored")
            }
            SessionSignal::SessionStarted(claims) => {
                println!("Logged in as {}.", claims.username)
            }
            SessionSignal::SessionEnded(EndReason::LoggedOut) => println!("Logged out."),
            SessionSignal::SessionEnded(EndReason::Expired) => {
                println!("Your session has expired. Please log in again.")
            }
            SessionSignal::Registered { username } => {
                println!("Account {} created. You can now log in.", username)
            }
        }
    }
}
