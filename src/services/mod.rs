// Sync engine components and their network implementations

pub mod attachment_store;
pub mod chat_service;
pub mod chat_types;
pub mod config;
pub mod connection;
pub mod directory;
pub mod http_api;
pub mod live_channel;
pub mod participants;
pub mod read_receipts;
pub mod timeline;
pub mod transport;
pub mod uploads;
pub mod viewport;

pub use attachment_store::HttpAttachmentStore;
pub use chat_service::{ChatDeps, ChatService};
pub use config::{AppConfig, ChatSettings, ConfigService};
pub use connection::{ConnectionHandle, ConnectionManager};
pub use directory::ConversationDirectory;
pub use http_api::RestChatApi;
pub use live_channel::WsConnector;
pub use participants::ParticipantCache;
pub use timeline::MessageTimeline;
pub use uploads::{UploadPipeline, UploadReport};
pub use viewport::{ScrollCommand, ViewportController, ViewportMetrics};
