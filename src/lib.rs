pub mod backends;
pub mod config;
pub mod openai;
pub mod server;
pub mod sessions;
