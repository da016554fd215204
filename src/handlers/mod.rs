pub mod chat_completions;
pub mod messages;
pub mod models;
