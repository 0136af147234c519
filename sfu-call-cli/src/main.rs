//! SFU call CLI
//!
//! Drives the call core against the in-memory loopback SFU and exposes the
//! pure decision functions (reconnect strategy, ringing state) for inspection.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sfu_call_core::prelude::*;
use sfu_call_core::{derive_ringing_state, select_strategy, ParticipantInfo, RingingInputs};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Log filter (tracing-subscriber env-filter syntax)
    #[arg(long, env = "SFU_CALL_LOG", default_value = "sfu_call=info")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a call on the loopback SFU and walk through reconnects
    Simulate {
        /// Client configuration file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of loopback SFUs
        #[arg(long, default_value_t = 2)]
        sfus: usize,

        /// Remote participants already in the call
        #[arg(long, default_value_t = 2)]
        participants: usize,

        /// Simulate a network outage of this many milliseconds
        #[arg(long)]
        outage_ms: Option<u64>,

        /// Have the SFU send a go-away and migrate
        #[arg(long)]
        go_away: bool,
    },

    /// Show which reconnect strategy an outage would use
    Strategy {
        /// How long the network was gone
        #[arg(long)]
        offline_ms: u64,

        /// Fast-reconnect window
        #[arg(long, default_value_t = 10_000)]
        deadline_ms: u64,

        /// Pretend there is no live session
        #[arg(long)]
        no_session: bool,
    },

    /// Derive the ringing state from a set of inputs
    Ringing {
        /// Local user
        #[arg(long, default_value = "me")]
        me: String,

        /// Call creator
        #[arg(long)]
        created_by: String,

        /// Members, comma separated
        #[arg(long, value_delimiter = ',')]
        members: Vec<String>,

        /// Users who accepted, comma separated
        #[arg(long, value_delimiter = ',')]
        accepted: Vec<String>,

        /// Users who rejected, comma separated
        #[arg(long, value_delimiter = ',')]
        rejected: Vec<String>,

        /// Users joined as participants, comma separated
        #[arg(long, value_delimiter = ',')]
        joined: Vec<String>,

        /// The auto-cancel deadline passed
        #[arg(long)]
        timed_out: bool,
    },

    /// Print the effective configuration
    Config {
        /// Configuration file (JSON); defaults when omitted
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&cli.log))
        .init();

    match cli.command {
        Commands::Simulate {
            config,
            sfus,
            participants,
            outage_ms,
            go_away,
        } => {
            let config = load_config(config)?;
            handle_simulate(config, sfus, participants, outage_ms, go_away).await?;
        }
        Commands::Strategy {
            offline_ms,
            deadline_ms,
            no_session,
        } => {
            let strategy = select_strategy(
                Duration::from_millis(offline_ms),
                Duration::from_millis(deadline_ms),
                !no_session,
            );
            println!("{strategy}");
        }
        Commands::Ringing {
            me,
            created_by,
            members,
            accepted,
            rejected,
            joined,
            timed_out,
        } => {
            let inputs = RingingInputs {
                local_user_id: me,
                created_by,
                members: members.into_iter().collect(),
                ringing: true,
                accepted_by: accepted.into_iter().collect(),
                rejected_by: rejected.into_iter().collect(),
                participants: joined.into_iter().collect(),
                auto_cancel_elapsed: timed_out,
            };
            println!("{}", serde_json::to_string(&derive_ringing_state(&inputs))?);
        }
        Commands::Config { path } => {
            let config = load_config(path)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<ClientConfig> {
    match path {
        Some(path) => ClientConfig::from_json_file(&path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(ClientConfig::default()),
    }
}

async fn handle_simulate(
    config: ClientConfig,
    sfus: usize,
    participants: usize,
    outage_ms: Option<u64>,
    go_away: bool,
) -> Result<()> {
    let urls: Vec<String> = (1..=sfus.max(1))
        .map(|n| format!("https://sfu-{n}.loopback"))
        .collect();
    let remote: Vec<ParticipantInfo> = (1..=participants)
        .map(|n| ParticipantInfo {
            user_id: format!("user-{n}"),
            session_id: SessionId::from(format!("remote-{n}").as_str()),
            published_tracks: vec![TrackType::Audio, TrackType::Video],
        })
        .collect();

    let api = Arc::new(LoopbackCoordinator::new(urls.clone()));
    api.set_participants(remote.clone());
    let sfu = Arc::new(LoopbackSfu::new());
    let coordinator = ReconnectCoordinator::new(
        "cli-user",
        api,
        sfu.clone(),
        Arc::new(LoopbackMediaEngine::new()),
        config,
    )?;

    let printer = tokio::spawn(print_events(coordinator.events()));

    println!("📞 Joining on {} loopback SFU(s)", urls.len());
    coordinator
        .join(JoinCallRequest::new("default:simulation"))
        .await?;
    coordinator.set_visible(
        remote
            .iter()
            .map(|p| (p.session_id.clone(), VideoDimension::MEDIUM))
            .collect::<BTreeMap<_, _>>(),
    )?;

    if let Some(outage_ms) = outage_ms {
        println!("📴 Network lost for {outage_ms}ms");
        coordinator.on_network_lost();
        tokio::time::sleep(Duration::from_millis(outage_ms)).await;
        coordinator.on_network_available().await?;
    }

    if go_away {
        if let Some(session) = coordinator.session() {
            println!("🚧 {} is going away", session.endpoint().url);
            let mut state = coordinator.subscribe_state();
            sfu.inject(
                &session.endpoint().url,
                SfuEvent::GoAway {
                    reason: "simulated maintenance".into(),
                },
            );
            let _ = tokio::time::timeout(Duration::from_secs(10), async {
                while state.changed().await.is_ok() {
                    if *state.borrow() == ConnectionState::Connected {
                        break;
                    }
                }
            })
            .await;
        }
    }

    // let the debounced sync go out
    tokio::time::sleep(Duration::from_millis(500)).await;
    if let Some(session) = coordinator.session() {
        let stats = session.collect_stats();
        println!("📊 {}", serde_json::to_string(&stats)?);
    }

    coordinator.leave("simulation finished");
    coordinator.wait_left().await;
    drop(coordinator);
    printer.abort();

    println!("📨 {} signaling requests", sfu.rpcs().len());
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<CallEvent>) {
    loop {
        match events.recv().await {
            Ok(CallEvent::ConnectionChanged(state)) => println!("➡️  {state:?}"),
            Ok(CallEvent::RingingChanged(state)) => println!("🔔 {state:?}"),
            Ok(CallEvent::ParticipantJoined(p)) => println!("👋 {} joined", p.user_id),
            Ok(CallEvent::ParticipantLeft(p)) => println!("👋 {} left", p.user_id),
            Ok(other) => tracing::debug!(event = ?other, "Call event"),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "Event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn ringing_lists_are_comma_separated() {
        let cli = Cli::parse_from([
            "sfu-call",
            "ringing",
            "--created-by",
            "me",
            "--members",
            "me,a,b",
            "--rejected",
            "a,b",
        ]);
        match cli.command {
            Commands::Ringing {
                members, rejected, ..
            } => {
                assert_eq!(members, vec!["me", "a", "b"]);
                assert_eq!(rejected, vec!["a", "b"]);
            }
            _ => panic!("expected ringing"),
        }
    }
}
