use thiserror::Error;

use crate::config::ConfigError;
use crate::connect::launch::StartError;
use crate::connect::ConnectError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over canonical capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Start(#[from] StartError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Connect(e) => e.transience(),
            Error::Start(_) => Transience::Permanent,
            Error::Config(_) => Transience::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupted_is_not_retryable() {
        let err = Error::from(ConnectError::Interrupted);
        assert!(!err.transience().is_retryable());
    }

    #[test]
    fn dial_failure_is_retryable() {
        let addr = std::net::SocketAddr::from(([127, 0, 0, 1], 7));
        let err = Error::from(ConnectError::Dial {
            addr,
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        });
        assert!(err.transience().is_retryable());
    }
}
