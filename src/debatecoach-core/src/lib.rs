//! DebateCoach Core Library
//!
//! Session engine for realtime voice debate practice: the connection
//! lifecycle, conversation reconciliation from realtime server events,
//! model-invoked tools, and post-debate analysis.

pub mod analysis;
pub mod config;
pub mod context;
pub mod conversation;
pub mod error;
pub mod loopback;
pub mod media;
pub mod protocol;
pub mod reconciler;
pub mod session;
pub mod signaling;
pub mod timer;
pub mod tools;
pub mod transport;
pub mod volume;

pub use analysis::{Analyzer, DebateAnalysis};
pub use config::Config;
pub use context::{DebateContext, Stance};
pub use conversation::{ConversationLog, ConversationTurn, Role};
pub use error::DebateError;
pub use protocol::{ClientEvent, RawEvent, ServerEvent, TokenUsage};
pub use session::{SessionController, SessionPhase, SessionSnapshot};
pub use tools::{ToolDefinition, ToolRegistry};
pub use transport::TransportDeps;
