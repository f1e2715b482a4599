use core::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// Lifecycle of a message as seen by the store
///
/// ```text
/// Pending ──> Sent
///    │
///    └──> Failed ──> Recovered
///            │
///            └──> TransitionPending ──> TransitionFailed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Failed,
    Recovered,
    TransitionPending,
    TransitionFailed,
}

impl MessageStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Recovered => "recovered",
            Self::TransitionPending => "transition_pending",
            Self::TransitionFailed => "transition_failed",
        }
    }

    /// `Sent` and `Recovered`
    #[must_use]
    pub const fn is_delivered(self) -> bool {
        matches!(self, Self::Sent | Self::Recovered)
    }

    /// Statuses that mark an abandoned delivery awaiting recovery
    #[must_use]
    pub const fn is_dead_lettered(self) -> bool {
        matches!(self, Self::Failed | Self::TransitionFailed)
    }
}

impl Display for MessageStatus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}
