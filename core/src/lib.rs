pub mod auth;
pub mod chat;
pub mod config;
pub mod conversation;
pub mod identity;
pub mod remote;
pub mod render;
pub mod signal;
pub mod storage;
pub mod telemetry;

pub use auth::{AuthCoordinator, AuthFlowError, AuthState, BrowserContext, LoginOutcome};
pub use chat::{ConversationClient, SendError};
pub use config::{ClientSettings, ConfigError};
pub use conversation::{Conversation, ConversationStore, Turn, TurnRole};
pub use identity::{ClientIdentity, IdentityStore};
pub use remote::{ChatReply, ChatRequest, HttpRemote, MockRemote, ProtocolError, RemoteService};
pub use render::{MarkupRenderer, PlainRenderer, RenderedTurn};
pub use signal::{SignalBus, AUTH_SUCCESS_MARKER};
pub use storage::{FileStore, KeyValueStore, MemoryStore, StorageError};
