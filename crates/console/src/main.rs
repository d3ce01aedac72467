//! Terminal front-end for the support desk chat
//!
//! Owns exactly one chat session for the lifetime of the process. Lines typed
//! on stdin are sent as messages; a few slash commands drive the rest of the
//! session API.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use supportdesk_realtime::{ChatSession, ConnectionState, FileUpload, RealtimeConfig};
use supportdesk_shared::Message;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const HELP: &str = "\
commands:
  /more                     load older messages
  /clear                    clear the conversation view
  /ask <prompt>             ask the AI assistant
  /attach <file> [message]  send a message with one attachment
  /retry                    reconnect after a connection failure
  /quit                     leave";

fn init_tracing() {
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter_layer)
        .with_writer(std::io::stderr)
        .with_target(false);

    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn render(message: &Message) -> String {
    let mut line = format!(
        "[{}] {}: {}",
        message.timestamp,
        message.sender,
        message.content.as_deref().unwrap_or("")
    );
    for attachment in &message.attachments {
        line.push_str(&format!(" <{}: {}>", attachment.name, attachment.url));
    }
    line
}

/// Print messages that were not printed before, oldest first
fn print_new(messages: &[Message], printed: &mut HashSet<String>) {
    let mut fresh: Vec<&Message> = messages
        .iter()
        .filter(|m| !printed.contains(&m.id))
        .collect();
    fresh.sort_by_key(|m| m.timestamp);

    for message in fresh {
        printed.insert(message.id.clone());
        println!("{}", render(message));
    }
}

async fn read_attachment(path: &str) -> Result<FileUpload> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path))?;
    let name = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
        .to_string();
    Ok(FileUpload::new(name, data))
}

/// Handle one input line; returns false when the user wants to leave
async fn handle_line(session: &ChatSession, line: &str) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return true;
    }

    let (command, rest) = match line.split_once(' ') {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    let outcome: Result<()> = match command {
        "/quit" | "/exit" => return false,
        "/help" => {
            println!("{}", HELP);
            Ok(())
        }
        "/more" => session
            .load_more_messages()
            .await
            .map(|count| println!("-- loaded {} older messages", count))
            .map_err(Into::into),
        "/clear" => {
            session.clear_messages();
            Ok(())
        }
        "/ask" => session.ask_assistant(rest).await.map(|_| ()).map_err(Into::into),
        "/retry" => session.reconnect().await.map_err(Into::into),
        "/attach" => {
            let (path, text) = rest.split_once(' ').unwrap_or((rest, ""));
            match read_attachment(path).await {
                Ok(file) => session
                    .send_message(text, vec![file])
                    .await
                    .map_err(Into::into),
                Err(e) => Err(e),
            }
        }
        _ => session.send_message(line, Vec::new()).await.map_err(Into::into),
    };

    if let Err(e) = outcome {
        eprintln!("error: {:#}", e);
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = RealtimeConfig::from_env().context("loading configuration")?;
    tracing::info!(
        api_url = %config.api_url,
        hub_path = %config.hub_path,
        user_id = config.user_id.as_ref().map(|u| u.as_str()).unwrap_or("anonymous"),
        "Starting support desk console"
    );

    let session = ChatSession::from_config(&config).context("building chat session")?;
    if let Err(e) = session.activate().await {
        tracing::warn!(error = %e, "Chat history unavailable");
    }

    let mut messages = session.subscribe_messages();
    let mut connection = session.watch_connection();
    let mut printed = HashSet::new();
    print_new(&session.messages(), &mut printed);
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if !handle_line(&session, &line).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
            changed = messages.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = messages.borrow_and_update().clone();
                print_new(&snapshot, &mut printed);
            }
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = connection.borrow_and_update().clone();
                match state {
                    ConnectionState::Failed(error) => eprintln!("-- connection failed: {} (/retry to reconnect)", error),
                    ConnectionState::Reconnecting { attempt } if attempt > 0 => eprintln!("-- reconnecting (attempt {})", attempt),
                    ConnectionState::Connected => eprintln!("-- connected"),
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.close();
    Ok(())
}
