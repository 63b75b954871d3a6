use std::fmt;

/// Failure class. The orchestrator only looks at the kind to decide whether
/// another attempt is worth spending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unclassified failure (io, encoding, ...). Retried.
    Other,
    /// Network hiccup, registry lock, filesystem race.
    Transient,
    /// Will not succeed without a config or environment change.
    Permanent,
    /// The program to run is not installed.
    NotFound,
    /// `apply` reported success but the artifact does not work.
    Verification,
    /// An external call exceeded its deadline.
    Timeout,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Other => "error",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Verification => "verification",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Other, msg)
    }

    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn transient<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Transient, msg)
    }

    pub fn permanent<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Permanent, msg)
    }

    pub fn verification<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Verification, msg)
    }

    pub fn timeout<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Timeout, msg)
    }

    pub fn not_found<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled")
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.kind,
            ErrorKind::Permanent | ErrorKind::NotFound | ErrorKind::Cancelled
        )
    }

    /// Prefix the message while keeping the failure class.
    pub fn context(self, prefix: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            msg: format!("{prefix}: {}", self.msg),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::permanent(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::msg(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_and_cancelled_are_not_retried() {
        assert!(Error::transient("registry busy").is_retryable());
        assert!(Error::verification("bad version").is_retryable());
        assert!(Error::timeout("slow").is_retryable());
        assert!(Error::msg("io").is_retryable());
        assert!(!Error::permanent("missing input").is_retryable());
        assert!(!Error::not_found("command not found: npm").is_retryable());
        assert!(!Error::cancelled().is_retryable());
    }

    #[test]
    fn context_keeps_kind() {
        let e = Error::permanent("no such template").context("zsh-theme");
        assert_eq!(e.kind(), ErrorKind::Permanent);
        assert_eq!(e.to_string(), "zsh-theme: no such template");
    }
}
