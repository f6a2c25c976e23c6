use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;

/// Stable error kinds from the connection/worker error taxonomy.
///
/// Each variant corresponds 1:1 to an error kind named by the framework
/// contract: a failing client connect, a fatal read, a fatal send, a TLS
/// handshake failure, a frame or raw buffer that outgrew its budget, a
/// codec that signalled a framing violation, an unknown watcher id, and a
/// user callback that raised through the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectFail,
    ReadFail,
    SendFail,
    SslHandshakeFail,
    PackageTooBig,
    ProtocolError,
    InvalidCallbackId,
    Uncaught,
}

impl ErrorKind {
    pub const fn code(self) -> &'static str {
        match self {
            ErrorKind::ConnectFail => "wireframe.connect_fail",
            ErrorKind::ReadFail => "wireframe.read_fail",
            ErrorKind::SendFail => "wireframe.send_fail",
            ErrorKind::SslHandshakeFail => "wireframe.ssl_handshake_fail",
            ErrorKind::PackageTooBig => "wireframe.package_too_big",
            ErrorKind::ProtocolError => "wireframe.protocol_error",
            ErrorKind::InvalidCallbackId => "wireframe.invalid_callback_id",
            ErrorKind::Uncaught => "wireframe.uncaught",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// The framework-wide error type. Carries a stable [`ErrorKind`], a
/// human-readable message, and an optional underlying cause.
///
/// Built with the same append-only builder shape used throughout the
/// codebase: construct with [`CoreError::new`], attach a cause with
/// [`CoreError::with_cause`].
#[derive(Debug)]
pub struct CoreError {
    kind: ErrorKind,
    message: Cow<'static, str>,
    cause: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Wraps this error as it crosses the dispatcher boundary from a user
    /// callback, preserving the original kind, the callback's description,
    /// and the underlying message — per the `UNCAUGHT` contract.
    pub fn into_uncaught(self, callback: impl Into<Cow<'static, str>>) -> UncaughtThrowable {
        UncaughtThrowable {
            callback: callback.into(),
            original_kind: self.kind,
            original_message: self.message.clone(),
            source: self,
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl StdError for CoreError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn StdError + 'static))
    }
}

/// An error that escaped a user callback (`onMessage`, `onConnect`, ...)
/// instead of being handled inline. Preserves enough of the original fault
/// to let an installed loop-level error handler make sense of it.
#[derive(Debug)]
pub struct UncaughtThrowable {
    callback: Cow<'static, str>,
    original_kind: ErrorKind,
    original_message: Cow<'static, str>,
    source: CoreError,
}

impl UncaughtThrowable {
    pub fn callback(&self) -> &str {
        &self.callback
    }

    pub fn original_kind(&self) -> ErrorKind {
        self.original_kind
    }
}

impl fmt::Display for UncaughtThrowable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "uncaught {} in callback {}: {}",
            self.original_kind, self.callback, self.original_message
        )
    }
}

impl StdError for UncaughtThrowable {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&self.source)
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Maps an [`std::io::Error`] into a [`CoreError`] of the given kind —
/// the seam every transport implementation funnels OS errors through
/// before they reach a user callback.
pub fn map_io_error(kind: ErrorKind, err: std::io::Error) -> CoreError {
    let message = err.to_string();
    CoreError::new(kind, message).with_cause(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncaught_preserves_original_kind_and_message() {
        let err = CoreError::new(ErrorKind::ProtocolError, "bad frame");
        let uncaught = err.into_uncaught("onMessage");
        assert_eq!(uncaught.original_kind(), ErrorKind::ProtocolError);
        assert_eq!(uncaught.callback(), "onMessage");
        assert!(uncaught.to_string().contains("bad frame"));
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = CoreError::new(ErrorKind::ConnectFail, "refused");
        assert_eq!(err.to_string(), "wireframe.connect_fail: refused");
    }
}
