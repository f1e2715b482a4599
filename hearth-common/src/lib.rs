//! Shared types for the hearth message delivery core
//!
//! Identifiers, the outbound [`Message`], its lifecycle [`MessageStatus`],
//! the process-wide shutdown [`Signal`], and the logging setup used by every
//! other crate in the workspace.

pub mod ids;
pub mod logging;
pub mod message;
pub mod status;

pub use ids::{InvalidMessageId, MessageId, ThreadId, UserId};
pub use message::Message;
pub use status::MessageStatus;
pub use tracing;

#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
    Finalised,
}
