//! Chat REST endpoints: conversations, history, read state, images
//!
//! Stateless request/response wrappers. Live delivery goes over the socket;
//! these calls cover everything the socket does not persist or replay.

use anyhow::Result;
use serde::Deserialize;

use super::client::{read_data, ChatApi};
use super::validation::ImageFile;
use crate::config::Config;
use crate::error::ChatResult;
use crate::models::{Conversation, Message};

/// Pagination block returned with a history page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub pages: u32,
}

/// One page of conversation history, oldest message first.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub pagination: Pagination,
}

impl HistoryPage {
    pub fn has_more(&self) -> bool {
        self.pagination.page < self.pagination.pages
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnreadCount {
    unread_count: u64,
}

/// Upload responses come back either bare or wrapped in `{ message }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UploadedMessage {
    Wrapped { message: Message },
    Bare(Message),
}

/// List the caller's conversations (customers see one, admins see all).
pub async fn list_conversations(api: &ChatApi) -> ChatResult<Vec<Conversation>> {
    let url = api.endpoint(&["chat", "conversations"])?;
    read_data(api.get(url).await?).await
}

/// Create the caller's support conversation, or return the existing one.
pub async fn start_conversation(api: &ChatApi) -> ChatResult<Conversation> {
    let url = api.endpoint(&["chat", "conversations"])?;
    read_data(api.post(url, &serde_json::json!({})).await?).await
}

/// Fetch one page of history. Page 1 is the most recent page.
pub async fn get_history(
    api: &ChatApi,
    conversation_id: &str,
    page: u32,
    limit: u32,
) -> ChatResult<HistoryPage> {
    let mut url = api.endpoint(&["chat", "conversations", conversation_id, "messages"])?;
    url.query_pairs_mut()
        .append_pair("page", &page.to_string())
        .append_pair("limit", &limit.to_string());
    read_data(api.get(url).await?).await
}

/// Mark every message in the conversation as read by the caller.
pub async fn mark_read(api: &ChatApi, conversation_id: &str) -> ChatResult<()> {
    let url = api.endpoint(&["chat", "conversations", conversation_id, "read"])?;
    api.put(url, &serde_json::json!({})).await?;
    Ok(())
}

/// Delete the whole history of a conversation on the server.
pub async fn clear_conversation(api: &ChatApi, conversation_id: &str) -> ChatResult<()> {
    let url = api.endpoint(&["chat", "conversations", conversation_id, "messages"])?;
    api.delete(url).await?;
    Ok(())
}

/// Total unread messages across the caller's conversations.
pub async fn unread_count(api: &ChatApi) -> ChatResult<u64> {
    let url = api.endpoint(&["chat", "unread-count"])?;
    let count: UnreadCount = read_data(api.get(url).await?).await?;
    Ok(count.unread_count)
}

/// Soft-delete a single message.
pub async fn delete_message(api: &ChatApi, message_id: &str) -> ChatResult<()> {
    let url = api.endpoint(&["chat", "messages", message_id])?;
    api.delete(url).await?;
    Ok(())
}

/// Upload an image as multipart form data; the server stores it and returns the message.
pub async fn upload_image(
    api: &ChatApi,
    conversation_id: &str,
    image: &ImageFile,
) -> ChatResult<Message> {
    image.validate()?;

    let part = reqwest::multipart::Part::bytes(image.data.clone())
        .file_name(image.file_name.clone())
        .mime_str(&image.file_type)?;
    let form = reqwest::multipart::Form::new().part("image", part);

    let url = api.endpoint(&["chat", "conversations", conversation_id, "images"])?;
    let uploaded: UploadedMessage = read_data(api.post_multipart(url, form).await?).await?;
    Ok(match uploaded {
        UploadedMessage::Wrapped { message } => message,
        UploadedMessage::Bare(message) => message,
    })
}

// ---------------------------------------------------------------------------
// CLI commands (print to stdout)
// ---------------------------------------------------------------------------

fn client() -> Result<ChatApi> {
    let config = Config::load()?;
    ChatApi::from_config(&config)
}

pub async fn print_conversations() -> Result<()> {
    let api = client()?;
    let conversations = list_conversations(&api).await?;

    println!("\nConversations:");
    println!("{:-<60}", "");

    if conversations.is_empty() {
        println!("  (no conversations)");
        return Ok(());
    }

    for conv in &conversations {
        println!("{}", conv.display_name());
        println!("  ID: {}", conv.id);
        if conv.unread_count > 0 {
            println!("  Unread: {}", conv.unread_count);
        }
        if let Some(ref last) = conv.last_message {
            let sender = last.sender_name.as_deref().unwrap_or("?");
            println!("  [{}]: {}", sender, last.content.trim());
        }
        println!();
    }

    Ok(())
}

pub async fn print_started_conversation() -> Result<()> {
    let api = client()?;
    let conv = start_conversation(&api).await?;
    println!("Conversation: {}", conv.id);
    Ok(())
}

pub async fn print_history(conversation_id: &str, page: u32, limit: u32) -> Result<()> {
    let api = client()?;
    let history = get_history(&api, conversation_id, page, limit).await?;

    if history.messages.is_empty() {
        println!("(no messages)");
        return Ok(());
    }

    for msg in &history.messages {
        println!("{}", msg.display_line());
    }
    if history.has_more() {
        println!(
            "-- page {}/{}, use --page {} for older messages --",
            history.pagination.page,
            history.pagination.pages,
            history.pagination.page + 1
        );
    }

    Ok(())
}

pub async fn mark_read_command(conversation_id: &str) -> Result<()> {
    let api = client()?;
    mark_read(&api, conversation_id).await?;
    println!("Marked as read.");
    Ok(())
}

pub async fn clear_command(conversation_id: &str) -> Result<()> {
    let api = client()?;
    clear_conversation(&api, conversation_id).await?;
    println!("Conversation cleared.");
    Ok(())
}

pub async fn delete_command(message_id: &str) -> Result<()> {
    let api = client()?;
    delete_message(&api, message_id).await?;
    println!("Message deleted.");
    Ok(())
}

pub async fn print_unread() -> Result<()> {
    let api = client()?;
    let count = unread_count(&api).await?;
    println!("Unread messages: {}", count);
    Ok(())
}
