//! Client-side synchronization engine for realtime conversations.
//!
//! [`services::ChatService`] keeps a local model of conversations, members,
//! message timelines and uploads consistent with a server reached over a
//! bulk REST API and a live WebSocket channel. [`commands`] holds the call
//! sites a UI drives it through.

pub mod commands;
pub mod error;
pub mod services;
pub mod state;

pub use error::{Result, SyncError};
pub use services::chat_types;
pub use services::{ChatDeps, ChatService};
pub use state::AppState;
