//! Line-oriented chat console
//!
//! `chat <id>` opens a session, prints updates as they arrive and sends each
//! stdin line. Lines starting with `/` are commands.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::time;

use crate::api::{ChatApi, ImageFile};
use crate::config::Config;
use crate::error::ChatError;
use crate::session::{ConnectionPhase, ConversationSession, SessionUpdate};
use crate::socket::ChatSocket;

/// How long one-shot sends wait for the server echo.
const ECHO_WAIT: Duration = Duration::from_secs(5);

const HELP: &str = "\
Commands:
  /image <path>   send an image (jpeg, png, gif, webp; max 5 MB)
  /retry          resend the last message that failed
  /more           load older messages
  /read           mark the conversation as read
  /delete <id>    delete a message
  /clear          delete the whole conversation history
  /reconnect      reconnect now
  /help           show this help
  /quit           leave";

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Text(String),
    Image(PathBuf),
    Retry,
    More,
    Read,
    Delete(String),
    Clear,
    Reconnect,
    Help,
    Quit,
    Empty,
    Unknown(String),
}

impl Input {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Input::Empty;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Input::Text(line.to_string());
        };
        let (name, arg) = match command.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (command, ""),
        };
        match (name, arg) {
            ("image", path) if !path.is_empty() => Input::Image(PathBuf::from(path)),
            ("delete", id) if !id.is_empty() => Input::Delete(id.to_string()),
            ("retry", _) => Input::Retry,
            ("more", _) => Input::More,
            ("read", _) => Input::Read,
            ("clear", _) => Input::Clear,
            ("reconnect", _) => Input::Reconnect,
            ("help", _) => Input::Help,
            ("quit" | "exit", _) => Input::Quit,
            _ => Input::Unknown(line.to_string()),
        }
    }
}

fn open_session(conversation_id: &str) -> Result<(ChatSocket, ConversationSession)> {
    let config = Config::load()?;
    let api = ChatApi::from_config(&config)?;
    let socket = ChatSocket::new(&config.socket_url, &config.chat);
    let session = ConversationSession::open(socket.clone(), api, &config.chat, conversation_id);
    Ok((socket, session))
}

const LOGIN_HINT: &str = "Run 'hallchat login --token <TOKEN>' with a fresh token.";

fn report(e: &ChatError) {
    println!("! {}", e.user_message());
    if e.is_unauthorized() {
        println!("  {}", LOGIN_HINT);
    }
}

/// Session error as a CLI error, with a login hint on 401/403.
fn cli_error(e: ChatError) -> anyhow::Error {
    if e.is_unauthorized() {
        anyhow::anyhow!("{} {}", e.user_message(), LOGIN_HINT)
    } else {
        anyhow::anyhow!("{}", e.user_message())
    }
}

fn render(session: &ConversationSession, update: &SessionUpdate) {
    match update {
        SessionUpdate::MessageAdded(m) => println!("{}", m.display_line()),
        SessionUpdate::MessageUpdated(m) => println!("~ {}", m.display_line()),
        SessionUpdate::HistoryLoaded { count } => {
            let snapshot = session.snapshot();
            println!("--- {} messages ---", count);
            for m in &snapshot.messages {
                println!("{}", m.display_line());
            }
            if snapshot.has_more {
                println!("(older messages available: /more)");
            }
        }
        SessionUpdate::OlderLoaded { count } => println!("--- loaded {} older messages ---", count),
        SessionUpdate::Cleared => println!("--- conversation cleared ---"),
        SessionUpdate::ConversationChanged(id) => println!("--- conversation {} ---", id),
        SessionUpdate::Typing {
            user_name,
            is_typing: true,
            ..
        } => println!("  {} is typing...", user_name),
        SessionUpdate::Typing { .. } => {}
        SessionUpdate::Presence { user_id, online } => {
            println!("  {} {}", user_id, if *online { "joined" } else { "left" })
        }
        SessionUpdate::Connection(ConnectionPhase::Joined) => println!("* connected"),
        SessionUpdate::Connection(ConnectionPhase::Disconnected) => println!("* disconnected"),
        SessionUpdate::Connection(_) => {}
        SessionUpdate::Reconnecting { attempt, delay } => {
            println!("* reconnecting in {:.1}s (attempt {})", delay.as_secs_f32(), attempt)
        }
        SessionUpdate::ReconnectExhausted => {
            println!("* could not reconnect; use /reconnect or send to retry")
        }
        SessionUpdate::Error(message) => println!("! {}", message),
    }
}

/// Run the interactive chat for one conversation until `/quit`, EOF or Ctrl+C.
pub async fn run(conversation_id: &str) -> Result<()> {
    let (socket, session) = open_session(conversation_id)?;
    let mut updates = session.subscribe_updates();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    // Last text that failed to send, kept for /retry.
    let mut draft: Option<String> = None;

    println!("Chat {} (/help for commands)", conversation_id);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match Input::parse(&line) {
                    Input::Text(text) => draft = send_text(&session, text).await,
                    Input::Retry => match draft.take() {
                        Some(text) => draft = send_text(&session, text).await,
                        None => println!("Nothing to retry."),
                    },
                    Input::Image(path) => send_image(&session, &path).await,
                    Input::More => {
                        if let Err(e) = session.load_more().await {
                            report(&e);
                        }
                    }
                    Input::Read => match session.mark_as_read(None).await {
                        Ok(()) => println!("Marked as read."),
                        Err(e) => report(&e),
                    },
                    Input::Delete(id) => {
                        if let Err(e) = session.delete_message(&id).await {
                            report(&e);
                        }
                    }
                    Input::Clear => {
                        if let Err(e) = session.clear_chat().await {
                            report(&e);
                        }
                    }
                    Input::Reconnect => {
                        if let Err(e) = session.reconnect().await {
                            report(&e);
                        }
                    }
                    Input::Help => println!("{}", HELP),
                    Input::Quit => break,
                    Input::Empty => {}
                    Input::Unknown(line) => println!("Unknown command: {} (try /help)", line),
                }
            }
            update = updates.recv() => match update {
                Ok(update) => render(&session, &update),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Console fell behind, skipped {} updates", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                break;
            }
        }
    }

    session.close();
    socket.disconnect();
    Ok(())
}

/// Returns the text back as a draft when the send failed.
async fn send_text(session: &ConversationSession, text: String) -> Option<String> {
    match session.send_message(&text).await {
        Ok(()) => None,
        Err(e) => {
            report(&e);
            println!("  (draft kept, /retry to resend)");
            Some(text)
        }
    }
}

async fn send_image(session: &ConversationSession, path: &Path) {
    let image = match ImageFile::from_path(path).await {
        Ok(image) => image,
        Err(e) => {
            report(&e);
            return;
        }
    };
    if let Err(e) = session.send_image(&image).await {
        report(&e);
    }
}

/// `send --to <id> <text>`: send one message and wait briefly for the echo.
pub async fn send_once(conversation_id: &str, text: &str) -> Result<()> {
    let (socket, session) = open_session(conversation_id)?;
    let mut updates = session.subscribe_updates();

    let result = session.send_message(text).await;
    if let Err(e) = result {
        session.close();
        socket.disconnect();
        return Err(cli_error(e));
    }

    let wanted = text.trim().to_string();
    let echoed = time::timeout(ECHO_WAIT, async {
        loop {
            match updates.recv().await {
                Ok(SessionUpdate::MessageAdded(m)) if m.content == wanted => return Some(m),
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten();

    match echoed {
        Some(m) => println!("Sent: {}", m.display_line()),
        None => println!("Sent (no confirmation from the server yet)."),
    }

    session.close();
    socket.disconnect();
    Ok(())
}

/// `send-image --to <id> <path>`
pub async fn send_image_once(conversation_id: &str, path: &Path) -> Result<()> {
    let image = ImageFile::from_path(path)
        .await
        .map_err(cli_error)?;
    let (socket, session) = open_session(conversation_id)?;

    let result = session.send_image(&image).await;
    session.close();
    socket.disconnect();

    let message = result.map_err(cli_error)?;
    println!("Sent: {}", message.display_line());
    Ok(())
}
