//! chronicle - live monitor for concurrent coding-agent sessions
//!
//! Commands:
//! - `status`: backend reachability, metadata and live-link state
//! - `sessions`: sessions with their summaries, optionally grouped by project
//! - `tail`: recent events, then new ones as the backend pushes them
//!
//! Uses XDG Base Directory specification for file locations:
//! - Config: $XDG_CONFIG_HOME/chronicle/config.toml (~/.config/chronicle/config.toml)
//! - Log: $XDG_STATE_HOME/chronicle/chronicle.log.YYYY-MM-DD, written only with --verbose

use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;

use chronicle_core::{
    create_backend, BackendKind, BackendMetadata, Config, ConnectionState, ConnectionStatus,
    Dashboard, DashboardChange, Event, EventFilter, EventType, SessionFilter, SessionView,
};

#[derive(Parser)]
#[command(name = "chronicle")]
#[command(about = "Live monitor for concurrent coding-agent sessions")]
#[command(version)]
struct Args {
    /// Write a debug log under $XDG_STATE_HOME/chronicle
    #[arg(short, long)]
    verbose: bool,

    /// Backend to use (local or cloud), overriding the config file
    #[arg(long)]
    backend: Option<BackendKind>,

    /// Server URL of the selected backend, overriding the config file
    #[arg(long)]
    url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show backend health, metadata and connection state
    Status {
        /// Print a JSON report instead of text
        #[arg(long)]
        json: bool,
    },

    /// List sessions with their summaries
    Sessions {
        /// Only sessions that have not ended
        #[arg(short, long)]
        active: bool,

        /// Group sessions by project path
        #[arg(short = 'p', long)]
        by_project: bool,

        /// Maximum number of sessions to load
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Print recent events, then follow live ones until Ctrl-C
    Tail {
        /// Only events of this session (repeatable)
        #[arg(short, long = "session")]
        sessions: Vec<String>,

        /// Only events of this type (repeatable)
        #[arg(short = 't', long = "type")]
        types: Vec<EventType>,

        /// Free-text search
        #[arg(long)]
        search: Option<String>,

        /// Number of recent events to print before following
        #[arg(short = 'n', long, default_value_t = 20)]
        lines: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load().context("failed to load configuration")?;
    apply_cli_overrides(&mut config, &args)?;

    // Logging goes to a file so it never interleaves with command output
    let _log_guard = if args.verbose {
        Some(chronicle_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    tracing::info!(mode = %config.backend.mode, "chronicle starting");

    match args.command {
        Command::Status { json } => cmd_status(&config, json).await,
        Command::Sessions {
            active,
            by_project,
            limit,
        } => cmd_sessions(&config, active, by_project, limit).await,
        Command::Tail {
            sessions,
            types,
            search,
            lines,
        } => {
            let filter = EventFilter {
                session_ids: sessions,
                event_types: types,
                search,
                ..Default::default()
            };
            cmd_tail(&config, filter, lines).await
        }
    }
}

fn apply_cli_overrides(config: &mut Config, args: &Args) -> Result<()> {
    if let Some(mode) = args.backend {
        config.backend.mode = mode;
    }
    if let Some(url) = &args.url {
        match config.backend.mode {
            BackendKind::Local => config.local.server_url = url.clone(),
            BackendKind::Cloud => config.cloud.url = Some(url.clone()),
        }
    }
    config.validate().context("invalid configuration")?;
    Ok(())
}

fn server_url(config: &Config) -> &str {
    match config.backend.mode {
        BackendKind::Local => &config.local.server_url,
        BackendKind::Cloud => config.cloud.url.as_deref().unwrap_or("(unset)"),
    }
}

// ============================================
// status
// ============================================

#[derive(Serialize)]
struct StatusReport {
    backend: BackendKind,
    server: String,
    healthy: bool,
    metadata: Option<BackendMetadata>,
    connection: ConnectionStatus,
}

async fn cmd_status(config: &Config, json: bool) -> Result<()> {
    let backend = create_backend(config).context("failed to create backend")?;

    let healthy = backend.health_check().await;
    let metadata = if healthy {
        match backend.get_metadata().await {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to fetch backend metadata");
                None
            }
        }
    } else {
        None
    };
    if healthy {
        if let Err(e) = backend.connect().await {
            tracing::warn!(error = %e, "Live connection failed");
        }
    }
    let connection = backend.connection_status();
    backend.disconnect();

    let report = StatusReport {
        backend: config.backend.mode,
        server: server_url(config).to_string(),
        healthy,
        metadata,
        connection,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Chronicle Backend Status");
    println!("========================");
    println!();
    println!("Backend:      {}", report.backend);
    println!("Server:       {}", report.server);
    println!(
        "Health:       {}",
        if report.healthy { "ok" } else { "unreachable" }
    );
    if let Some(metadata) = &report.metadata {
        println!(
            "Version:      {}",
            metadata.version.as_deref().unwrap_or("unknown")
        );
        println!("Capabilities: {}", metadata.capabilities.join(", "));
    }
    println!("Live link:    {}", report.connection.state);
    if let Some(error) = &report.connection.error {
        println!("Last error:   {}", error);
    }
    Ok(())
}

// ============================================
// sessions
// ============================================

async fn cmd_sessions(config: &Config, active: bool, by_project: bool, limit: usize) -> Result<()> {
    let backend = create_backend(config).context("failed to create backend")?;
    let dashboard = Dashboard::new(backend, &config.cache);

    // Recent events feed the awaiting-input flag and last activity
    dashboard
        .load_events(EventFilter::default())
        .await
        .context("failed to load events")?;
    dashboard
        .refresh_sessions(SessionFilter {
            active_only: active,
            limit: Some(limit),
            ..Default::default()
        })
        .await
        .context("failed to load sessions")?;

    if by_project {
        let groups = dashboard.sessions_by_project();
        if groups.is_empty() {
            println!("No sessions.");
        }
        for group in groups {
            println!(
                "{} ({} active of {}) {}",
                group.name,
                group.active_count(),
                group.sessions.len(),
                group.key
            );
            for view in &group.sessions {
                println!("  {}", session_line(view));
            }
        }
    } else {
        let sessions = dashboard.sessions();
        if sessions.is_empty() {
            println!("No sessions.");
        }
        for view in &sessions {
            println!("{}", session_line(view));
        }
    }

    let waiting = dashboard.awaiting_input().len();
    if waiting > 0 {
        println!();
        println!("{} session(s) awaiting input (marked !)", waiting);
    }
    Ok(())
}

fn session_line(view: &SessionView) -> String {
    let marker = if view.awaiting_input {
        '!'
    } else if view.is_active {
        '*'
    } else {
        ' '
    };
    let summary = &view.summary;
    let avg = summary
        .avg_response_time
        .map(|ms| format!("{:.0}ms", ms))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{} {:<24} {:<20} events {:>5}  tools {:>4}  errors {:>3}  avg {:>7}  last {}",
        marker,
        view.session.id,
        view.session.project_name().unwrap_or("(unknown)"),
        summary.total_events,
        summary.tool_usage_count,
        summary.error_count,
        avg,
        view.last_activity()
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S"),
    )
}

// ============================================
// tail
// ============================================

async fn cmd_tail(config: &Config, filter: EventFilter, lines: usize) -> Result<()> {
    let backend = create_backend(config).context("failed to create backend")?;
    let dashboard = Dashboard::new(backend, &config.cache).with_event_filter(filter);

    let (tx, mut changes) = mpsc::unbounded_channel();
    let _changes = dashboard.on_change(move |change: &DashboardChange| {
        let _ = tx.send(*change);
    });

    dashboard.start().await.context("failed to start")?;

    let events = dashboard.events();
    for event in events.iter().take(lines).rev() {
        println!("{}", event_line(event));
    }
    let mut seen: HashSet<String> = events.into_iter().map(|e| e.id).collect();
    let mut shown = dashboard.connection().display_state;
    eprintln!("-- following {} ({}), Ctrl-C to stop --", server_url(config), shown);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            change = changes.recv() => match change {
                Some(DashboardChange::Events) => {
                    let events = dashboard.events();
                    for event in events.iter().rev().filter(|e| !seen.contains(&e.id)) {
                        println!("{}", event_line(event));
                    }
                    // Evicted events are never re-admitted, so the cache is enough
                    seen = events.into_iter().map(|e| e.id).collect();
                }
                Some(DashboardChange::Connection) => {
                    let status = dashboard.connection();
                    if status.display_state != shown {
                        shown = status.display_state;
                        match (&status.error, shown) {
                            (Some(error), ConnectionState::Error) => {
                                eprintln!("-- connection {}: {} --", shown, error)
                            }
                            _ => eprintln!("-- connection {} --", shown),
                        }
                    }
                }
                Some(DashboardChange::Sessions) => {}
                None => break,
            },
        }
    }

    dashboard.stop();
    tracing::info!("chronicle tail stopped");
    Ok(())
}

fn event_line(event: &Event) -> String {
    let detail = event
        .tool_name
        .clone()
        .or_else(|| {
            event
                .metadata
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_default();
    let flag = if event.indicates_failure() {
        " [failed]"
    } else if event.is_blocking_notification() {
        " [needs input]"
    } else {
        ""
    };
    format!(
        "{} {:<12} {:<18} {}{}",
        event.timestamp.with_timezone(&Local).format("%H:%M:%S"),
        short_id(&event.session_id),
        event.event_type.as_str(),
        detail,
        flag
    )
}

fn short_id(id: &str) -> &str {
    match id.char_indices().nth(12) {
        Some((end, _)) => &id[..end],
        None => id,
    }
}
