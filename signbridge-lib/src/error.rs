use thiserror::Error;

use crate::negotiator::NegotiationState;

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("engine rejected {op}: {reason}")]
    Rejected { op: &'static str, reason: String },
    #[error("cannot {op} in state {state:?}")]
    InvalidState {
        op: &'static str,
        state: NegotiationState,
    },
    #[error("{0} was cancelled")]
    Cancelled(&'static str),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to append to feed: {0}")]
    Append(#[source] anyhow::Error),
    #[error("failed to listen to feed: {0}")]
    Listen(#[source] anyhow::Error),
    #[error("failed to fetch feed: {0}")]
    Fetch(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
#[error("malformed signaling message: {0}")]
pub struct MalformedMessage(pub String);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("operation attempted after teardown")]
pub struct ClosedError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Closed(#[from] ClosedError),
    #[error("capture devices failed: {0}")]
    Capture(#[source] anyhow::Error),
    #[error("call records failed: {0}")]
    Records(#[source] anyhow::Error),
}

impl Error {
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Self::Closed(_) | Self::Negotiation(NegotiationError::Cancelled(_))
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
