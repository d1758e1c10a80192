pub mod config;
pub mod conversation;
pub mod error;
pub mod http;
pub mod llm;
pub mod render;
pub mod session;
pub mod stream;

pub use error::{Error, Result};
