//! hallchat - support chat client for the event-hall booking platform
//!
//! Talks to the booking backend's chat API over REST and Socket.IO.

mod api;
mod auth;
mod config;
mod console;
mod error;
mod models;
mod session;
mod socket;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "hallchat")]
#[command(about = "Customer/admin support chat for the hall booking platform", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Store the bearer token issued by the booking site
    Login {
        #[arg(short, long)]
        token: String,

        /// Account id the token belongs to
        #[arg(long)]
        user_id: Option<String>,

        /// Display name of the account
        #[arg(long)]
        name: Option<String>,

        /// Token lifetime in seconds, if known
        #[arg(long)]
        expires_in: Option<u64>,
    },

    /// Forget the stored token
    Logout,

    /// Show configuration and token status
    Status,

    /// List conversations
    Conversations,

    /// Start (or fetch) your support conversation
    Start,

    /// Show a page of conversation history
    History {
        /// Conversation ID (from `conversations` output)
        conversation_id: String,

        /// Page number, 1 is the most recent
        #[arg(short, long, default_value = "1")]
        page: u32,

        /// Messages per page
        #[arg(short, long, default_value = "50")]
        limit: u32,
    },

    /// Send a text message
    Send {
        /// Conversation ID
        #[arg(short, long)]
        to: String,

        /// Message content
        message: String,
    },

    /// Send an image (jpeg, png, gif, webp; max 5 MB)
    SendImage {
        /// Conversation ID
        #[arg(short, long)]
        to: String,

        path: PathBuf,
    },

    /// Mark a conversation as read
    Read { conversation_id: String },

    /// Delete the whole history of a conversation
    Clear { conversation_id: String },

    /// Delete a single message
    Delete { message_id: String },

    /// Show the unread message count
    Unread,

    /// Open an interactive chat
    Chat { conversation_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Login {
            token,
            user_id,
            name,
            expires_in,
        } => {
            auth::login(token, user_id, name, expires_in)?;
        }
        Commands::Logout => {
            tracing::info!("Logging out...");
            auth::logout()?;
        }
        Commands::Status => {
            auth::status()?;
        }
        Commands::Conversations => {
            tracing::info!("Fetching conversations...");
            api::chat::print_conversations().await?;
        }
        Commands::Start => {
            api::chat::print_started_conversation().await?;
        }
        Commands::History {
            conversation_id,
            page,
            limit,
        } => {
            api::chat::print_history(&conversation_id, page, limit).await?;
        }
        Commands::Send { to, message } => {
            tracing::info!("Sending message...");
            console::send_once(&to, &message).await?;
        }
        Commands::SendImage { to, path } => {
            tracing::info!("Sending image {}...", path.display());
            console::send_image_once(&to, &path).await?;
        }
        Commands::Read { conversation_id } => {
            api::chat::mark_read_command(&conversation_id).await?;
        }
        Commands::Clear { conversation_id } => {
            api::chat::clear_command(&conversation_id).await?;
        }
        Commands::Delete { message_id } => {
            api::chat::delete_command(&message_id).await?;
        }
        Commands::Unread => {
            api::chat::print_unread().await?;
        }
        Commands::Chat { conversation_id } => {
            console::run(&conversation_id).await?;
        }
    }

    Ok(())
}
