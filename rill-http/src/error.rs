//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Result type often returned from methods that can have rill `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents errors that can occur handling HTTP streams.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Box<dyn StdError + Send + Sync>>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    Parse(Parse),
    Io,
}

/// Wire-grammar violations, with their server-side disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Parse {
    /// Malformed request line or header block.
    BadRequest,
    /// Header block exceeds the configured ceiling.
    HeadersTooLarge,
    /// POST/PUT with neither Content-Length nor chunked framing.
    LengthRequired,
    /// A transfer-coding other than identity/chunked, or a feature this
    /// engine does not speak.
    NotImplemented,
    /// Malformed status line.
    Status,
    /// Malformed chunk-size line.
    ChunkSize,
}

impl Parse {
    /// The response code a server sends back for this violation.
    /// Framing-uncertain codes force a connection close as well.
    pub(crate) fn reject_code(self) -> u16 {
        match self {
            Self::BadRequest | Self::Status | Self::ChunkSize => 400,
            Self::HeadersTooLarge => 403,
            Self::LengthRequired => 411,
            Self::NotImplemented => 501,
        }
    }

    pub(crate) fn reject_text(self) -> &'static str {
        match self {
            Self::BadRequest => "Invalid request line or headers",
            Self::HeadersTooLarge => "Headers exceed the configured limit",
            Self::LengthRequired => "Content-Length is required",
            Self::NotImplemented => "Not implemented by this server",
            Self::Status => "Invalid status line",
            Self::ChunkSize => "Chunked header is unparseable",
        }
    }
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Self {
        Self {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn new_parse(parse: Parse) -> Self {
        Self::new(Kind::Parse(parse))
    }

    pub(crate) fn new_io(cause: io::Error) -> Self {
        let mut err = Self::new(Kind::Io);
        err.inner.cause = Some(Box::new(cause));
        err
    }

    /// Whether this error comes from a wire-grammar violation.
    #[must_use]
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Whether this error wraps an I/O failure.
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::BadRequest) => "invalid request line or headers",
            Kind::Parse(Parse::HeadersTooLarge) => "header block too large",
            Kind::Parse(Parse::LengthRequired) => "message length is required",
            Kind::Parse(Parse::NotImplemented) => "unsupported protocol feature",
            Kind::Parse(Parse::Status) => "invalid status line",
            Kind::Parse(Parse::ChunkSize) => "invalid chunk size line",
            Kind::Io => "i/o error",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tuple = f.debug_tuple("rill_http::Error");
        tuple.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            tuple.field(cause);
        }
        tuple.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::new_io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_codes_match_disposition_table() {
        assert_eq!(Parse::BadRequest.reject_code(), 400);
        assert_eq!(Parse::HeadersTooLarge.reject_code(), 403);
        assert_eq!(Parse::LengthRequired.reject_code(), 411);
        assert_eq!(Parse::NotImplemented.reject_code(), 501);
    }

    #[test]
    fn io_errors_keep_their_source() {
        let err = Error::new_io(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(err.is_io());
        assert!(err.source().is_some());
    }

    #[test]
    fn parse_errors_identify_themselves() {
        let err = Error::new_parse(Parse::BadRequest);
        assert!(err.is_parse());
        assert!(!err.is_io());
        assert_eq!(err.to_string(), "invalid request line or headers");
    }
}
