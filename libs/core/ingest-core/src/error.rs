//! The error classifier: a total, deterministic function from any error to
//! an [`ErrorKind`].

use std::fmt;

/// The two-valued classification every failure observed by the core is
/// reduced to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retrying may succeed (network fault, timeout, backend unavailable).
    Transient,
    /// Retrying can never succeed (malformed input, constraint violation).
    Permanent,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// A structured error carrying its own classification.
///
/// Adapters (the store, the log) construct `ProcessingError` directly when
/// they know the kind with certainty (e.g. a recognized Postgres SQLSTATE
/// class); the classifier's string-matching rules are a fallback for
/// errors that did not arrive pre-classified.
#[derive(Debug)]
pub struct ProcessingError {
    pub kind: ErrorKind,
    pub message: String,
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ProcessingError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

impl fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProcessingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|c| c.as_ref() as &(dyn std::error::Error + 'static))
    }
}

const PERMANENT_SUBSTRINGS: &[&str] = &[
    "unique constraint",
    "violates check constraint",
    "invalid input syntax",
];

const TRANSIENT_SUBSTRINGS: &[&str] =
    &["connection refused", "connection reset", "timeout", "too many clients"];

/// Classify an arbitrary error, applying the rules in order (first match
/// wins):
///
/// 1. A [`ProcessingError`] anywhere in the `source()` chain yields its own
///    declared kind.
/// 2. A recognized network-layer fault yields `Transient`.
/// 3. The stringified error containing a permanent substring (constraint
///    violation, bad input syntax) yields `Permanent`.
/// 4. The stringified error containing a transient substring yields
///    `Transient`.
/// 5. Default: `Transient` — an unknown failure is safer retried than
///    discarded, and is still bounded by the retry budget.
///
/// Total: every call returns an `ErrorKind`, never panics.
pub fn classify(err: &(dyn std::error::Error + 'static)) -> ErrorKind {
    let mut cursor: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cursor {
        if let Some(processing_error) = e.downcast_ref::<ProcessingError>() {
            return processing_error.kind;
        }
        cursor = e.source();
    }

    if is_network_fault(err) {
        return ErrorKind::Transient;
    }

    let text = err.to_string().to_lowercase();
    if PERMANENT_SUBSTRINGS.iter().any(|s| text.contains(s)) {
        return ErrorKind::Permanent;
    }
    if TRANSIENT_SUBSTRINGS.iter().any(|s| text.contains(s)) {
        return ErrorKind::Transient;
    }

    ErrorKind::Transient
}

fn is_network_fault(err: &(dyn std::error::Error + 'static)) -> bool {
    err.downcast_ref::<std::io::Error>()
        .map(|io_err| {
            use std::io::ErrorKind as IoKind;
            matches!(
                io_err.kind(),
                IoKind::TimedOut
                    | IoKind::ConnectionRefused
                    | IoKind::ConnectionReset
                    | IoKind::ConnectionAborted
                    | IoKind::NotConnected
                    | IoKind::UnexpectedEof
            )
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[derive(Debug)]
    struct Opaque(String);
    impl fmt::Display for Opaque {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }
    impl std::error::Error for Opaque {}

    #[test]
    fn classifier_respects_explicit_processing_error_kind() {
        let p = ProcessingError::permanent("bad event");
        assert_eq!(classify(&p), ErrorKind::Permanent);

        let p = ProcessingError::transient("db down");
        assert_eq!(classify(&p), ErrorKind::Transient);
    }

    #[test]
    fn classifier_detects_network_io_errors_as_transient() {
        let err = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(classify(&err), ErrorKind::Transient);
    }

    #[test]
    fn classifier_matches_permanent_substrings() {
        let err =
            Opaque("pq: value too long violates check constraint \"events_type_len\"".into());
        assert_eq!(classify(&err), ErrorKind::Permanent);

        let err = Opaque("ERROR: duplicate key value violates unique constraint".into());
        assert_eq!(classify(&err), ErrorKind::Permanent);
    }

    #[test]
    fn classifier_matches_transient_substrings() {
        for msg in [
            "connection refused",
            "connection reset by peer",
            "connection timeout",
            "too many clients",
        ] {
            let err = Opaque(msg.to_string());
            assert_eq!(classify(&err), ErrorKind::Transient, "{msg}");
        }
    }

    #[test]
    fn classifier_defaults_unknown_errors_to_transient() {
        let err = Opaque("something bizarre happened".into());
        assert_eq!(classify(&err), ErrorKind::Transient);
    }

    #[test]
    fn classifier_is_deterministic() {
        let err = Opaque("connection refused".into());
        assert_eq!(classify(&err), classify(&err));
    }
}
