use std::fmt::{Display, Formatter};

/// Reason a claim could not make progress right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureKind {
    /// The claim would move the publisher past the current publisher limit.
    PublisherLimit,
    /// The active partition is exhausted and the producer must re-attempt
    /// in the freshly activated one.
    Rollover,
}

impl Display for BackpressureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BackpressureKind::PublisherLimit => write!(f, "publisher limit"),
            BackpressureKind::Rollover => write!(f, "rollover"),
        }
    }
}

/// A specialized error type for dispatcher operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The operation cannot proceed right now; the caller should retry
    /// after consumers make progress.
    #[error("would block: {0}")]
    WouldBlock(BackpressureKind),
    /// The payload cannot ever fit a single claim.
    #[error("fragment too large: framed length {framed} exceeds max {max}")]
    FragmentTooLarge { framed: usize, max: usize },
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A subscription with this name is already open.
    #[error("subscription already open: {0}")]
    SubscriptionExists(String),
    /// Invalid state transition or operation.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl DispatchError {
    /// Create a would-block error annotated with the given backpressure kind.
    pub fn would_block(kind: BackpressureKind) -> Self {
        Self::WouldBlock(kind)
    }

    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Create an invalid state error from a displayable value.
    pub fn invalid_state<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidState(msg.to_string())
    }
}

/// A Result type alias for dispatcher operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_helper() {
        let err = DispatchError::invalid_config("bad window");
        assert!(matches!(err, DispatchError::InvalidConfig(msg) if msg == "bad window"));
    }

    #[test]
    fn would_block_formats_kind() {
        let err = DispatchError::would_block(BackpressureKind::PublisherLimit);
        assert_eq!(err.to_string(), "would block: publisher limit");
    }
}
