use crate::http::types::StatusCode;
use std::{io, path::PathBuf};
use thiserror::Error;

/// Startup failures. Any of these aborts the process with exit code 1
/// before the listener accepts a single connection.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to bind listener: {0}")]
    Bind(#[source] io::Error),
    #[error("resource root does not exist or is not readable: {}", .0.display())]
    ResourceRoot(PathBuf),
    #[error("upload directory unusable: {}", .0.display())]
    UploadDir(PathBuf, #[source] io::Error),
    #[error("invalid argument: {0}")]
    InvalidArg(String),
}

/// Per-request rejection taxonomy.
///
/// The parser and the admission layer return one of these instead of a
/// response; the connection handler maps it to a [`Response`] and a
/// keep/close disposition at a single point. Diagnostics are short and
/// taxonomic and never carry filesystem paths or backtraces.
///
/// [`Response`]: crate::http::response::Response
#[derive(Debug)]
pub(crate) enum Reject {
    /// Framing violations: bad request line, malformed header, invalid
    /// Content-Length, disallowed Transfer-Encoding. Closes the connection.
    BadRequest(&'static str),
    /// Request target longer than the URL cap. Closes the connection.
    UriTooLong,
    /// `Host` header absent. The connection is kept.
    MissingHost,
    /// `Host` header names a host or port this server does not answer for.
    /// Closes the connection and raises a security-violation event.
    HostMismatch,
    /// Declared or actual body larger than the body cap. Closes the
    /// connection.
    BodyTooLarge,
    /// Path traversal or a resolved path escaping the resource root.
    /// Keeps the connection; raises a security-violation event.
    Forbidden(&'static str),
    NotFound,
    /// Method outside {GET, POST, OPTIONS}. Answered with an `Allow` header.
    MethodNotAllowed,
    /// POST with a content type other than `application/json`.
    UnsupportedMediaType,
    /// Client exceeded a rate window. Carries the `Retry-After` seconds.
    RateLimited(u64),
    /// Unexpected dispatcher failure. Closes the connection.
    Internal,
    /// Socket died mid-request. No response is possible.
    Io(io::Error),
}

impl Reject {
    pub(crate) fn status(&self) -> StatusCode {
        match self {
            Reject::BadRequest(_) | Reject::UriTooLong | Reject::MissingHost => {
                StatusCode::BadRequest
            }
            Reject::HostMismatch | Reject::Forbidden(_) => StatusCode::Forbidden,
            Reject::BodyTooLarge => StatusCode::PayloadTooLarge,
            Reject::NotFound => StatusCode::NotFound,
            Reject::MethodNotAllowed => StatusCode::MethodNotAllowed,
            Reject::UnsupportedMediaType => StatusCode::UnsupportedMediaType,
            Reject::RateLimited(_) => StatusCode::TooManyRequests,
            Reject::Internal | Reject::Io(_) => StatusCode::InternalServerError,
        }
    }

    /// Short diagnostic appended to the reason phrase in the error body.
    pub(crate) fn diagnostic(&self) -> &'static str {
        match self {
            Reject::BadRequest(msg) | Reject::Forbidden(msg) => msg,
            Reject::UriTooLong => "request target too long",
            Reject::MissingHost => "missing Host header",
            Reject::HostMismatch => "host not allowed",
            Reject::BodyTooLarge => "body too large",
            Reject::NotFound => "no such resource",
            Reject::MethodNotAllowed => "method not supported",
            Reject::UnsupportedMediaType => "expected application/json",
            Reject::RateLimited(_) => "rate limit exceeded",
            Reject::Internal => "internal error",
            Reject::Io(_) => "i/o error",
        }
    }

    /// Whether this rejection forces `Connection: close`.
    pub(crate) fn closes_connection(&self) -> bool {
        match self {
            Reject::BadRequest(_)
            | Reject::UriTooLong
            | Reject::HostMismatch
            | Reject::BodyTooLarge
            | Reject::Internal
            | Reject::Io(_) => true,
            Reject::MissingHost
            | Reject::Forbidden(_)
            | Reject::NotFound
            | Reject::MethodNotAllowed
            | Reject::UnsupportedMediaType
            | Reject::RateLimited(_) => false,
        }
    }

    /// Rejections that indicate probable attack intent and go to the
    /// dedicated security-violation channel. Rate-limit denials are
    /// reported at the admission site instead, once per fresh block.
    pub(crate) fn is_security_violation(&self) -> bool {
        matches!(self, Reject::HostMismatch | Reject::Forbidden(_))
    }
}

impl From<io::Error> for Reject {
    fn from(err: io::Error) -> Self {
        Reject::Io(err)
    }
}
