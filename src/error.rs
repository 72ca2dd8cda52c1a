//! Error taxonomy for the actor core.
//!
//! Two layers: [`Error`] covers recoverable runtime failures that travel as
//! message payloads (a response that never came, a request bounced off a
//! closed mailbox), while [`ExitReason`] records why an actor terminated
//! and is what links and monitors observe.

use std::fmt;

use crate::message::Message;

/// Runtime errors surfaced through response handlers or the actor's error
/// handler.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// No handler matched an ordinary message and the default handler
    /// elected to drop it.
    #[error("unexpected message")]
    UnexpectedMessage,

    /// A response arrived whose payload did not match the stored handler.
    /// Carries the original response payload.
    #[error("unexpected response")]
    UnexpectedResponse(Box<Message>),

    /// A pending multiplexed response's duration elapsed.
    #[error("request timed out")]
    RequestTimeout,

    /// The request was enqueued after the receiver closed its mailbox.
    #[error("request receiver is down")]
    QueueClosed,

    /// A `(sys, get, key)` request named a key the actor does not serve.
    #[error("unsupported system message key")]
    UnsupportedSysKey,
}

impl Error {
    /// Discriminant-only comparison; `UnexpectedResponse` payloads are
    /// ignored.
    pub fn kind_eq(&self, other: &Error) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.kind_eq(other)
    }
}

/// Why an actor terminated. Propagated to linked and monitoring peers.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ExitReason {
    /// Regular shutdown; by default an exit message with this reason does
    /// not terminate the receiver.
    #[default]
    Normal,

    /// The kill sentinel. Always fatal, bypasses the exit handler.
    Kill,

    /// Cooperative shutdown requested by the user.
    UserShutdown,

    /// User code escaped via a panic that no exception handler translated.
    UnhandledException,

    /// The actor became unreachable before running to completion.
    Unreachable,

    /// Terminated with a runtime error.
    Error(Error),
}

impl ExitReason {
    /// `true` for every reason except [`ExitReason::Normal`].
    pub fn is_failure(&self) -> bool {
        !matches!(self, ExitReason::Normal)
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Normal => write!(f, "normal"),
            ExitReason::Kill => write!(f, "killed"),
            ExitReason::UserShutdown => write!(f, "user shutdown"),
            ExitReason::UnhandledException => write!(f, "unhandled exception"),
            ExitReason::Unreachable => write!(f, "unreachable"),
            ExitReason::Error(e) => write!(f, "error: {e}"),
        }
    }
}

impl From<Error> for ExitReason {
    fn from(e: Error) -> Self {
        ExitReason::Error(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_eq_ignores_payload() {
        let a = Error::UnexpectedResponse(Box::new(Message::new(1_u32)));
        let b = Error::UnexpectedResponse(Box::new(Message::new("x")));
        assert_eq!(a, b);
        assert_ne!(a, Error::RequestTimeout);
    }

    #[test]
    fn normal_is_not_a_failure() {
        assert!(!ExitReason::Normal.is_failure());
        assert!(ExitReason::Kill.is_failure());
        assert!(ExitReason::Error(Error::QueueClosed).is_failure());
    }
}
