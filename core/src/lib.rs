/// Chatline - realtime chat client core
///
/// Keeps a live, recency-ordered conversation list and a paginated message
/// window for the open conversation, fed by WebSocket push feeds and a REST
/// backend.

pub mod error;
pub mod config;
pub mod types;
pub mod room_list;
pub mod thread;
pub mod feed;
pub mod backend;
pub mod session;
pub mod runtime;
pub mod view_api;
pub mod cli_app;

pub use error::{ChatError, Result};
pub use config::Config;
pub use backend::Backend;
pub use runtime::{ChatHandle, ChatRuntime};
pub use session::{Session, SessionStore};
