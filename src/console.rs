//! Line-oriented driver for running a session from a terminal.

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::session::{SessionController, SessionSnapshot};

const HELP: &str = "commands: calibrate | capture | start | stop | status | help | quit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    Calibrate,
    Capture,
    Start,
    Stop,
    Status,
    Help,
    Quit,
}

pub fn parse_command(line: &str) -> Option<ConsoleCommand> {
    let command = match line.trim().to_ascii_lowercase().as_str() {
        "calibrate" | "cal" => ConsoleCommand::Calibrate,
        "capture" | "c" => ConsoleCommand::Capture,
        "start" | "measure" => ConsoleCommand::Start,
        "stop" => ConsoleCommand::Stop,
        "status" | "s" => ConsoleCommand::Status,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" | "q" => ConsoleCommand::Quit,
        _ => return None,
    };
    Some(command)
}

/// One-line summary of the parts of a snapshot a person cares about.
pub fn summarize(snapshot: &SessionSnapshot) -> String {
    let mut summary = format!(
        "phase={:?} connection={:?} focal={:.2}",
        snapshot.phase, snapshot.connection_state, snapshot.focal_length
    );
    let distance = snapshot.current_distance_display();
    if !distance.is_empty() {
        summary.push_str(&format!(" distance={distance}"));
    }
    if snapshot.measurement_stalled {
        summary.push_str(" (stalled)");
    }
    if !snapshot.status_message.is_empty() {
        let label = if snapshot.status_is_error { "error" } else { "status" };
        summary.push_str(&format!(" {label}=\"{}\"", snapshot.status_message));
    }
    summary
}

/// Read commands from stdin until `quit`, end of input or Ctrl-C.
pub async fn run_console(controller: &SessionController) -> Result<()> {
    let mut updates = controller.subscribe();
    let watcher = tokio::spawn(async move {
        let mut last = String::new();
        while updates.changed().await.is_ok() {
            let summary = summarize(&updates.borrow_and_update());
            if summary != last {
                info!("{summary}");
                last = summary;
            }
        }
    });

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let result = match parse_command(&line) {
            Some(ConsoleCommand::Calibrate) => controller.request_calibration().await,
            Some(ConsoleCommand::Capture) => controller.request_capture().await,
            Some(ConsoleCommand::Start) => controller.request_start_measuring().await,
            Some(ConsoleCommand::Stop) => controller.request_stop_measuring().await,
            Some(ConsoleCommand::Status) => {
                let snapshot = controller.snapshot();
                println!("{} fps={}", summarize(&snapshot), snapshot.fps);
                Ok(())
            }
            Some(ConsoleCommand::Help) => {
                println!("{HELP}");
                Ok(())
            }
            Some(ConsoleCommand::Quit) => break,
            None => {
                println!("unknown command '{}'; {HELP}", line.trim());
                Ok(())
            }
        };

        if let Err(err) = result {
            warn!("{err}");
        }
    }

    watcher.abort();
    Ok(())
}
