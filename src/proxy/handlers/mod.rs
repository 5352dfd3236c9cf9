pub mod admin;
pub mod chat;
pub mod errors;
pub mod health;
pub mod streaming;
