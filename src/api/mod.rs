//! REST client for the chat API

pub mod chat;
pub mod client;
pub mod validation;

pub use chat::{HistoryPage, Pagination};
pub use client::ChatApi;
pub use validation::{validate_image_file, ImageFile, ValidationError};
