use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

type Source = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The failure taxonomy every operation reports through. Callers branch on
/// [`ErrorKind`], never on message text; the message plus the wrapped source
/// chain is what surfaces to the user.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not valid: {0}")]
    NotValid(String),

    #[error("{msg}")]
    TransportFailed {
        msg: String,
        #[source]
        source: Option<Source>,
    },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    NotValid,
    TransportFailed,
    Timeout,
    Cancelled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::NotValid(_) => ErrorKind::NotValid,
            Error::TransportFailed { .. } => ErrorKind::TransportFailed,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Wraps a lower-level failure while keeping it on the source chain.
    pub fn transport(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::TransportFailed {
            msg: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// A transport failure with no underlying error worth chaining.
    pub fn transport_msg(msg: impl Into<String>) -> Self {
        Error::TransportFailed {
            msg: msg.into(),
            source: None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_variants() {
        assert_eq!(Error::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(Error::AlreadyExists("x".into()).kind(), ErrorKind::AlreadyExists);
        assert_eq!(Error::NotValid("x".into()).kind(), ErrorKind::NotValid);
        assert_eq!(Error::Timeout("x".into()).kind(), ErrorKind::Timeout);
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn transport_keeps_the_cause_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err = Error::transport("writing to guest", io);
        assert_eq!(err.kind(), ErrorKind::TransportFailed);
        assert_eq!(err.to_string(), "writing to guest");
        let source = std::error::Error::source(&err).expect("source retained");
        assert!(source.to_string().contains("pipe closed"));
    }

    #[test]
    fn display_is_surface_ready() {
        assert_eq!(
            Error::NotValid("smaller than base image".into()).to_string(),
            "not valid: smaller than base image"
        );
        assert_eq!(Error::Cancelled.to_string(), "operation cancelled");
    }
}
