pub mod panel;

use anyhow::{Context, Result};
use assist_session::{JsonFilePreferences, PanelCommand, StateStore, spawn_session};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::config::{AssistConfig, FileConfig, session_config_from_file};
use panel::{HELP, Input, Renderer, parse_line};

/// Run the interactive panel until `/quit`, end of input or ctrl-c.
pub async fn run(config: &AssistConfig, file_config: &FileConfig) -> Result<()> {
    let prefs = JsonFilePreferences::new(config.preferences_path());
    let store = StateStore::new(Box::new(prefs));
    let session = spawn_session(session_config_from_file(file_config), store)
        .context("Failed to start session")?;
    info!(
        ws_url = %file_config.backend.ws_url,
        base_url = %file_config.backend.base_url,
        "session started"
    );

    let mut events = session.subscribe();
    // Anything emitted before the subscription is covered by a fresh snapshot.
    session.send(PanelCommand::RequestState)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut renderer = Renderer::new();
    println!("type /help for commands");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                debug!("ctrl-c");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => match parse_line(&line) {
                    Ok(Input::Command(command)) => {
                        if session.send(command).is_err() {
                            warn!("session stopped");
                            break;
                        }
                    }
                    Ok(Input::Help) => println!("{HELP}"),
                    Ok(Input::Quit) => break,
                    Ok(Input::Empty) => {}
                    Err(msg) => eprintln!("{msg}"),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("stdin read failed: {}", e);
                    break;
                }
            },
            event = events.recv() => match event {
                Ok(event) => {
                    for line in renderer.render(&event) {
                        println!("{line}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "panel fell behind, resyncing state");
                    let _ = session.send(PanelCommand::RequestState);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    session.shutdown().await;
    info!("session stopped");
    Ok(())
}
