//! Line-oriented call console
//!
//! Drives a running engine from stdin and prints each state change.

use std::str::FromStr;

use anyhow::{bail, Result};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use crate::calling::machine::CallHandle;
use crate::calling::snapshot::CallSnapshot;
use crate::calling::{CallState, CallType};

const HELP: &str = "Commands: call <peer> [video] [conversation], join <conversation>, answer, decline, end, mute, camera, camera-on, camera-off, screen, status, help, quit";

/// One line of console input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Call {
        peer: String,
        call_type: CallType,
        /// Defaults to the conversation the engine was started in.
        conversation: Option<String>,
    },
    Join(String),
    Answer,
    Decline,
    End,
    Mute,
    Camera,
    CameraOn,
    CameraOff,
    Screen,
    Status,
    Help,
    Quit,
}

impl FromStr for ConsoleCommand {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut words = s.split_whitespace();
        let Some(verb) = words.next() else {
            bail!("Empty command");
        };
        let args: Vec<&str> = words.collect();
        Ok(match (verb.to_ascii_lowercase().as_str(), args.as_slice()) {
            ("call", [peer, rest @ ..]) => {
                let (call_type, rest) = match rest {
                    ["video", rest @ ..] => (CallType::Video, rest),
                    ["audio", rest @ ..] => (CallType::Audio, rest),
                    _ => (CallType::Audio, rest),
                };
                if rest.len() > 1 {
                    bail!("Usage: call <peer> [video] [conversation]");
                }
                ConsoleCommand::Call {
                    peer: peer.to_string(),
                    call_type,
                    conversation: rest.first().map(|c| c.to_string()),
                }
            }
            ("call", []) => bail!("Usage: call <peer> [video] [conversation]"),
            ("join", [conversation]) => ConsoleCommand::Join(conversation.to_string()),
            ("join", _) => bail!("Usage: join <conversation>"),
            ("answer" | "a", []) => ConsoleCommand::Answer,
            ("decline" | "d", []) => ConsoleCommand::Decline,
            ("end" | "hangup" | "e", []) => ConsoleCommand::End,
            ("mute" | "m", []) => ConsoleCommand::Mute,
            ("camera" | "c", []) => ConsoleCommand::Camera,
            ("camera-on", []) => ConsoleCommand::CameraOn,
            ("camera-off", []) => ConsoleCommand::CameraOff,
            ("screen" | "s", []) => ConsoleCommand::Screen,
            ("status", []) => ConsoleCommand::Status,
            ("help" | "?", []) => ConsoleCommand::Help,
            ("quit" | "exit" | "q", []) => ConsoleCommand::Quit,
            _ => bail!("Unknown command: {}", s.trim()),
        })
    }
}

impl ConsoleCommand {
    /// Send this command to the engine. Local commands (`status`, `help`,
    /// `quit`) do nothing here.
    pub fn dispatch(self, handle: &CallHandle) -> Result<()> {
        match self {
            ConsoleCommand::Call {
                peer,
                call_type,
                conversation: Some(conversation),
            } => handle.start_in(&conversation, &peer, call_type),
            ConsoleCommand::Call {
                peer,
                call_type,
                conversation: None,
            } => handle.start(&peer, call_type),
            ConsoleCommand::Join(conversation) => handle.join(&conversation),
            ConsoleCommand::Answer => handle.answer(),
            ConsoleCommand::Decline => handle.decline(),
            ConsoleCommand::End => handle.end(),
            ConsoleCommand::Mute => handle.toggle_mute(),
            ConsoleCommand::Camera => handle.toggle_camera(),
            ConsoleCommand::CameraOn => handle.enable_camera(),
            ConsoleCommand::CameraOff => handle.disable_camera(),
            ConsoleCommand::Screen => handle.toggle_screen_share(),
            ConsoleCommand::Status | ConsoleCommand::Help | ConsoleCommand::Quit => Ok(()),
        }
    }
}

/// Multi-line status block for `status`.
pub fn describe(snap: &CallSnapshot) -> String {
    let mut out = format!("state={}", snap.state);
    if snap.state == CallState::Idle {
        return out;
    }
    if let Some(peer) = &snap.peer_id {
        out.push_str(&format!("\npeer={}", peer));
    }
    if let Some(call_type) = snap.call_type {
        out.push_str(&format!("\ntype={}", call_type));
    }
    if let Some(call_id) = &snap.call_id {
        out.push_str(&format!("\ncall_id={}", call_id));
    }
    out.push_str(&format!("\nstatus={}", snap.status_text()));
    out.push_str(&format!(
        "\nmuted={} camera_off={} screen_sharing={} remote_video={}",
        snap.is_muted, snap.is_camera_off, snap.is_screen_sharing, snap.remote_has_video
    ));
    out
}

/// One-line summary printed when something visible changes.
fn change_line(prev: &CallSnapshot, snap: &CallSnapshot) -> Option<String> {
    if snap.state != prev.state {
        let mut line = format!("{} -> {}", prev.state, snap.state);
        match snap.state {
            CallState::Ringing => {
                if let Some(peer) = &snap.peer_id {
                    line.push_str(&format!(" ({} is calling, type 'answer' or 'decline')", peer));
                }
            }
            CallState::Ended => line.push_str(&format!(" ({})", snap.status_text())),
            _ => {}
        }
        return Some(line);
    }
    if snap.notice != prev.notice {
        return snap.notice.as_ref().map(|n| n.to_string());
    }
    if (snap.is_muted, snap.is_camera_off, snap.is_screen_sharing)
        != (prev.is_muted, prev.is_camera_off, prev.is_screen_sharing)
    {
        return Some(format!(
            "muted={} camera_off={} screen_sharing={}",
            snap.is_muted, snap.is_camera_off, snap.is_screen_sharing
        ));
    }
    None
}

/// Read commands from stdin until `quit`, EOF or Ctrl-C, then stop the engine.
pub async fn run(handle: CallHandle, engine: JoinHandle<()>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut updates = handle.updates();
    let mut last = handle.snapshot();
    println!("{}", HELP);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<ConsoleCommand>() {
                    Ok(ConsoleCommand::Quit) => break,
                    Ok(ConsoleCommand::Status) => println!("{}", describe(&handle.snapshot())),
                    Ok(ConsoleCommand::Help) => println!("{}", HELP),
                    Ok(cmd) => cmd.dispatch(&handle)?,
                    Err(e) => println!("{}", e),
                }
            }
            snap = updates.next() => {
                let Some(snap) = snap else {
                    tracing::warn!("Call engine stopped");
                    return Ok(());
                };
                if let Some(line) = change_line(&last, &snap) {
                    println!("{}", line);
                }
                last = snap;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    handle.shutdown()?;
    let _ = engine.await;
    Ok(())
}
