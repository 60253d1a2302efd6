//! tilespace-client binary
//!
//! Headless client: joins a space, then drives movement and chat from stdin.
//!
//! ## Configuration (env / TOML via `config` crate)
//!
//! | Key / flag                         | Default                  | Description               |
//! |------------------------------------|--------------------------|---------------------------|
//! | `TILESPACE_ENDPOINT` / `--endpoint`| settings file or `http://localhost:8000` | Server base URL |
//! | `TILESPACE_SPACE` / `--space`      | *(required)*             | Space to join             |
//! | `TILESPACE_TOKEN` / `--token`      | *(required)*             | Bearer token              |
//! | `TILESPACE_USER_ID` / `--user-id`  | *(required)*             | Local identity            |
//! | `TILESPACE_USERNAME` / `--username`| none                     | Display name              |
//! | `TILESPACE_CONFIG` / `--config`    | none                     | TOML settings file        |
//! | `TILESPACE_MAP` / `--map`          | open 40×30 grid          | Tiled JSON map            |
//!
//! ## Commands
//!
//! | Input            | Action                          |
//! |------------------|---------------------------------|
//! | `w` `a` `s` `d`  | step up / left / down / right   |
//! | `say <text>`     | nearby chat (zone or proximity) |
//! | `shout <text>`   | space-wide chat                 |
//! | `dm <user> <text>` | direct message                |
//! | `leave`          | leave the current zone          |
//! | `who`            | print the roster                |
//! | `mic on\|off`    | toggle microphone               |
//! | `quit`           | disconnect and exit             |

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tilespace::{
    bus::{BusEvent, Topic},
    ChatTarget, ClientSettings, CommunicationSession, Direction, EventBus, NullMedia,
    SessionHost, SessionOptions, TransportConnection, WorldMap,
};
use tokio::io::{AsyncBufReadExt, BufReader};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "tilespace-client", about = "Tilespace headless client", version)]
struct Args {
    /// Server base URL (overrides the settings file)
    #[arg(long, env = "TILESPACE_ENDPOINT")]
    endpoint: Option<String>,

    /// Space to join
    #[arg(long, env = "TILESPACE_SPACE")]
    space: String,

    /// Bearer token
    #[arg(long, env = "TILESPACE_TOKEN")]
    token: String,

    /// Local user id
    #[arg(long, env = "TILESPACE_USER_ID")]
    user_id: String,

    /// Display name sent with position frames
    #[arg(long, env = "TILESPACE_USERNAME")]
    username: Option<String>,

    /// TOML settings file
    #[arg(long, env = "TILESPACE_CONFIG")]
    config: Option<PathBuf>,

    /// Tiled JSON map with `Collision` and `Zones` layers
    #[arg(long, env = "TILESPACE_MAP")]
    map: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tilespace=debug".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut settings =
        ClientSettings::load(args.config.as_deref()).context("loading settings")?;
    if let Some(endpoint) = &args.endpoint {
        settings.transport.endpoint = endpoint.clone();
    }

    let map = match &args.map {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading map {}", path.display()))?;
            WorldMap::from_tiled_json(&text).context("parsing map")?
        }
        None => WorldMap::open(
            settings.movement.default_width,
            settings.movement.default_height,
        ),
    };

    log::info!(
        "Starting tilespace-client (space='{}', user='{}', endpoint='{}')",
        args.space,
        args.user_id,
        settings.transport.endpoint,
    );

    let bus = EventBus::new();
    let _printer = print_events(&bus);

    let step_time = Duration::from_secs_f32(1.0 / settings.movement.walk_speed.max(1.0));
    let tick_every = settings.movement.throttle_interval();
    let link = Arc::new(TransportConnection::new(
        settings.transport.clone(),
        bus.clone(),
    ));

    let host = SessionHost::new(bus.clone());
    let session = host
        .create_session(
            link,
            Box::new(NullMedia),
            SessionOptions {
                space_id: args.space.clone(),
                token: args.token.clone(),
                local_id: args.user_id.clone(),
                username: args.username.clone(),
                settings,
                map,
            },
        )
        .context("starting session")?;

    let ticker = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_every);
            loop {
                interval.tick().await;
                if !session.is_active() {
                    break;
                }
                session.tick();
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else { break };
                if !run_command(&session, line.trim(), step_time).await {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted");
                break;
            }
        }
    }

    host.destroy();
    ticker.abort();
    Ok(())
}

/// Execute one stdin command. Returns `false` to quit.
async fn run_command(session: &CommunicationSession, line: &str, step_time: Duration) -> bool {
    let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
    let direction = match cmd {
        "w" => Some(Direction::Up),
        "a" => Some(Direction::Left),
        "s" => Some(Direction::Down),
        "d" => Some(Direction::Right),
        _ => None,
    };
    if let Some(direction) = direction {
        if session.step(direction) {
            tokio::time::sleep(step_time).await;
            session.finish_step();
        }
        println!("at {}", session.position());
        return true;
    }

    match cmd {
        "" => {}
        "say" => session.send_chat(&ChatTarget::Nearby, rest),
        "shout" => session.send_chat(&ChatTarget::Everyone, rest),
        "dm" => match rest.split_once(' ') {
            Some((user, text)) => session.send_chat(
                &ChatTarget::Direct {
                    user_id: user.to_string(),
                },
                text,
            ),
            None => println!("usage: dm <user> <text>"),
        },
        "leave" => session.leave_zone(),
        "who" => {
            session.request_users();
            for entry in session.roster() {
                let name = entry.username.as_deref().unwrap_or("?");
                match entry.position() {
                    Some(p) => println!("{} ({}) at {}", entry.user_id, name, p),
                    None => println!("{} ({})", entry.user_id, name),
                }
            }
        }
        "mic" => session.set_microphone(rest == "on"),
        "quit" | "exit" => return false,
        other => println!("unknown command `{}`", other),
    }
    true
}

/// Log interesting bus traffic. The subscriptions live for the whole run.
fn print_events(bus: &EventBus) -> Vec<tilespace::Subscription> {
    let topics = [
        Topic::Connected,
        Topic::Disconnected,
        Topic::TransportError,
        Topic::Reconnect,
        Topic::Proximity,
        Topic::CommMode,
        Topic::Chat,
        Topic::MediaFault,
    ];
    topics
        .into_iter()
        .map(|topic| {
            bus.on(topic, |ev| match ev {
                BusEvent::Chat { surface, message } => tracing::info!(
                    "[{:?}] {}: {}",
                    surface,
                    message.username.as_deref().unwrap_or("?"),
                    message.message
                ),
                other => tracing::info!("{:?}", other),
            })
        })
        .collect()
}
