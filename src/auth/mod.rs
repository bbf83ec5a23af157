//! Credential handling
//!
//! Tokens are issued by the booking platform's login flow; this client only
//! stores one and presents it to the chat API and socket.

pub mod tokens;

use anyhow::Result;

use crate::config::Config;
pub use tokens::{StoredToken, TokenStore};

/// Store a bearer token (and optionally who it belongs to).
pub fn login(
    token: String,
    user_id: Option<String>,
    user_name: Option<String>,
    expires_in: Option<u64>,
) -> Result<()> {
    let mut config = Config::load()?;
    config.set_token(token, expires_in);
    config.user_id = user_id;
    config.user_name = user_name;
    config.save()?;
    println!("Token saved.");
    Ok(())
}

/// Forget the stored token.
pub fn logout() -> Result<()> {
    let mut config = Config::load()?;
    config.clear_tokens();
    config.save()?;
    println!("Logged out.");
    Ok(())
}

/// Show what is stored and where it points.
pub fn status() -> Result<()> {
    let config = Config::load()?;

    println!("API:    {}", config.api_url);
    println!("Socket: {}", config.socket_url);
    match config.get_token() {
        Some(token) if token.is_expired() => println!("Token:  expired"),
        Some(token) => match token.expires_at {
            Some(exp) => println!("Token:  valid (expires at unix {})", exp),
            None => println!("Token:  valid"),
        },
        None => println!("Token:  none (run `hallchat login --token <TOKEN>`)"),
    }
    if let Some(ref name) = config.user_name {
        println!(
            "User:   {} ({})",
            name,
            config.user_id.as_deref().unwrap_or("?")
        );
    }

    Ok(())
}
