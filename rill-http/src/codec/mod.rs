//! Stateless HTTP/1.x grammar helpers.
//!
//! Request-line / status-line / header-block parsing (tokenization by
//! `httparse`), the well-known header taxonomy, canonical reason
//! phrases, case-insensitive header token matching, and chunk-size line
//! parsing. The parsed head is snapshotted into [`QInfo`] (requests) or
//! [`RInfo`] (responses): owned raw header bytes plus index entries, so
//! the snapshot stays valid for as long as a query does.

use std::mem::MaybeUninit;
use std::ops::Range;

use bytes::Bytes;
use smallvec::{smallvec, SmallVec};

use crate::error::Parse;

pub(crate) mod date;
mod url;

pub(crate) use url::{urldecode_target, urlencode_into};
pub use url::path_simplify;

const MAX_HEADERS: usize = 128;

/// The closed set of request methods this engine speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Options,
    Get,
    Head,
    Post,
    Put,
    Delete,
    Trace,
    Connect,
}

impl Method {
    pub(crate) const COUNT: usize = 8;

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Options => "OPTIONS",
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Trace => "TRACE",
            Self::Connect => "CONNECT",
        }
    }

    /// Exact (case-sensitive) method lookup; methods are tokens and the
    /// grammar is case-sensitive here.
    #[must_use]
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        Some(match b {
            b"OPTIONS" => Self::Options,
            b"GET" => Self::Get,
            b"HEAD" => Self::Head,
            b"POST" => Self::Post,
            b"PUT" => Self::Put,
            b"DELETE" => Self::Delete,
            b"TRACE" => Self::Trace,
            b"CONNECT" => Self::Connect,
            _ => return None,
        })
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An HTTP version, `major.minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const HTTP_10: Self = Self { major: 1, minor: 0 };
    pub const HTTP_11: Self = Self { major: 1, minor: 1 };
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// Canonical reason phrase for a status code.
#[must_use]
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",

        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",

        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        307 => "Temporary Redirect",

        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Time-out",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Large",
        415 => "Unsupported Media Type",
        416 => "Requested range not satisfiable",
        417 => "Expectation Failed",
        429 => "Too many requests",

        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Time-out",
        505 => "HTTP Version not supported",

        _ => "<unknown>",
    }
}

/// Well-known headers: the RFC 2616 general, request, response and
/// entity sets, plus `SOAPAction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WkHdr {
    // rfc 2616: §4.5: General Header Fields
    CacheControl,
    Connection,
    Date,
    Pragma,
    Trailer,
    TransferEncoding,
    Upgrade,
    Via,
    Warning,
    // rfc 2616: §5.3: Request Header Fields
    Accept,
    AcceptCharset,
    AcceptEncoding,
    AcceptLanguage,
    Authorization,
    Expect,
    From,
    Host,
    IfMatch,
    IfModifiedSince,
    IfNoneMatch,
    IfRange,
    IfUnmodifiedSince,
    MaxForwards,
    ProxyAuthorization,
    Range,
    Referer,
    Te,
    UserAgent,
    // rfc 2616: §6.2: Response Header Fields
    AcceptRanges,
    Age,
    Etag,
    Location,
    ProxyAuthenticate,
    RetryAfter,
    Server,
    Vary,
    WwwAuthenticate,
    // rfc 2616: §7.1: Entity Header Fields
    Allow,
    ContentEncoding,
    ContentLanguage,
    ContentLength,
    ContentLocation,
    ContentMd5,
    ContentRange,
    ContentType,
    Expires,
    LastModified,
    // Useful headers
    SoapAction,
}

static WKHDR_TABLE: &[(&str, WkHdr)] = &[
    ("cache-control", WkHdr::CacheControl),
    ("connection", WkHdr::Connection),
    ("date", WkHdr::Date),
    ("pragma", WkHdr::Pragma),
    ("trailer", WkHdr::Trailer),
    ("transfer-encoding", WkHdr::TransferEncoding),
    ("upgrade", WkHdr::Upgrade),
    ("via", WkHdr::Via),
    ("warning", WkHdr::Warning),
    ("accept", WkHdr::Accept),
    ("accept-charset", WkHdr::AcceptCharset),
    ("accept-encoding", WkHdr::AcceptEncoding),
    ("accept-language", WkHdr::AcceptLanguage),
    ("authorization", WkHdr::Authorization),
    ("expect", WkHdr::Expect),
    ("from", WkHdr::From),
    ("host", WkHdr::Host),
    ("if-match", WkHdr::IfMatch),
    ("if-modified-since", WkHdr::IfModifiedSince),
    ("if-none-match", WkHdr::IfNoneMatch),
    ("if-range", WkHdr::IfRange),
    ("if-unmodified-since", WkHdr::IfUnmodifiedSince),
    ("max-forwards", WkHdr::MaxForwards),
    ("proxy-authorization", WkHdr::ProxyAuthorization),
    ("range", WkHdr::Range),
    ("referer", WkHdr::Referer),
    ("te", WkHdr::Te),
    ("user-agent", WkHdr::UserAgent),
    ("accept-ranges", WkHdr::AcceptRanges),
    ("age", WkHdr::Age),
    ("etag", WkHdr::Etag),
    ("location", WkHdr::Location),
    ("proxy-authenticate", WkHdr::ProxyAuthenticate),
    ("retry-after", WkHdr::RetryAfter),
    ("server", WkHdr::Server),
    ("vary", WkHdr::Vary),
    ("www-authenticate", WkHdr::WwwAuthenticate),
    ("allow", WkHdr::Allow),
    ("content-encoding", WkHdr::ContentEncoding),
    ("content-language", WkHdr::ContentLanguage),
    ("content-length", WkHdr::ContentLength),
    ("content-location", WkHdr::ContentLocation),
    ("content-md5", WkHdr::ContentMd5),
    ("content-range", WkHdr::ContentRange),
    ("content-type", WkHdr::ContentType),
    ("expires", WkHdr::Expires),
    ("last-modified", WkHdr::LastModified),
    ("soapaction", WkHdr::SoapAction),
];

impl WkHdr {
    /// Case-insensitive lookup of a header name.
    #[must_use]
    pub fn from_name(name: &[u8]) -> Option<Self> {
        WKHDR_TABLE
            .iter()
            .find(|(s, _)| s.len() == name.len() && name.eq_ignore_ascii_case(s.as_bytes()))
            .map(|&(_, wk)| wk)
    }
}

fn trim_lws(mut b: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = b {
        b = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = b {
        b = rest;
    }
    b
}

/// Case-insensitive comparison of a (trimmed) header value with a token.
#[must_use]
pub fn hdr_equals(value: &[u8], token: &str) -> bool {
    let value = trim_lws(value);
    value.len() == token.len() && value.eq_ignore_ascii_case(token.as_bytes())
}

/// Whether a comma-separated header value contains `token`,
/// case-insensitively (e.g. `Connection: keep-alive, close`).
#[must_use]
pub fn hdr_contains(value: &[u8], token: &str) -> bool {
    value.split(|&b| b == b',').any(|part| hdr_equals(part, token))
}

/// One indexed header of a parsed head.
#[derive(Debug, Clone)]
pub struct QHdr {
    pub(crate) wkhdr: Option<WkHdr>,
    key: Range<usize>,
    val: Range<usize>,
}

/// Framing facts extracted from a header block while indexing it.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct HeadFacts {
    pub(crate) content_length: Option<u64>,
    pub(crate) chunked: bool,
    pub(crate) conn_close: bool,
    pub(crate) expect_100: bool,
}

/// Immutable snapshot of a parsed request head.
#[derive(Debug)]
pub struct QInfo {
    method: Method,
    version: Version,
    host: Option<Range<usize>>,
    path: String,
    prefix_len: usize,
    query_string: Option<String>,
    raw: Bytes,
    hdrs: Vec<QHdr>,
}

impl QInfo {
    #[must_use]
    pub fn method(&self) -> Method {
        self.method
    }

    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    /// The host from an absolute-form target or the `Host:` header.
    #[must_use]
    pub fn host(&self) -> &str {
        self.host
            .clone()
            .map(|r| {
                // httparse validated the charset of both spans.
                unsafe { std::str::from_utf8_unchecked(&self.raw[r]) }
            })
            .unwrap_or("")
    }

    /// The decoded, simplified path (prefix + tail).
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The part of the path a trigger was mounted on.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.path[..self.prefix_len]
    }

    /// The path below the matched trigger.
    #[must_use]
    pub fn tail(&self) -> &str {
        &self.path[self.prefix_len..]
    }

    /// The query string behind `?`, percent-decoded.
    #[must_use]
    pub fn query_string(&self) -> Option<&str> {
        self.query_string.as_deref()
    }

    /// The raw head bytes, request line through the blank line.
    #[must_use]
    pub fn raw_head(&self) -> &[u8] {
        &self.raw
    }

    /// Iterate over the indexed headers as `(wkhdr, name, value)`.
    pub fn headers(&self) -> impl Iterator<Item = (Option<WkHdr>, &str, &[u8])> {
        self.hdrs.iter().map(move |h| {
            // httparse validated header names against the token charset.
            let key = unsafe { std::str::from_utf8_unchecked(&self.raw[h.key.clone()]) };
            (h.wkhdr, key, &self.raw[h.val.clone()])
        })
    }

    /// The value of the first header tagged `wk`.
    #[must_use]
    pub fn header(&self, wk: WkHdr) -> Option<&[u8]> {
        self.hdrs
            .iter()
            .find(|h| h.wkhdr == Some(wk))
            .map(|h| &self.raw[h.val.clone()])
    }

    pub(crate) fn set_prefix_len(&mut self, len: usize) {
        self.prefix_len = len;
    }
}

/// Immutable snapshot of a parsed response head.
#[derive(Debug)]
pub struct RInfo {
    code: u16,
    version: Version,
    reason: Range<usize>,
    raw: Bytes,
    hdrs: Vec<QHdr>,
}

impl RInfo {
    #[must_use]
    pub fn code(&self) -> u16 {
        self.code
    }

    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    #[must_use]
    pub fn reason(&self) -> &str {
        unsafe { std::str::from_utf8_unchecked(&self.raw[self.reason.clone()]) }
    }

    #[must_use]
    pub fn raw_head(&self) -> &[u8] {
        &self.raw
    }

    pub fn headers(&self) -> impl Iterator<Item = (Option<WkHdr>, &str, &[u8])> {
        self.hdrs.iter().map(move |h| {
            let key = unsafe { std::str::from_utf8_unchecked(&self.raw[h.key.clone()]) };
            (h.wkhdr, key, &self.raw[h.val.clone()])
        })
    }

    #[must_use]
    pub fn header(&self, wk: WkHdr) -> Option<&[u8]> {
        self.hdrs
            .iter()
            .find(|h| h.wkhdr == Some(wk))
            .map(|h| &self.raw[h.val.clone()])
    }
}

fn span_of(src: &[u8], sub: &[u8]) -> Range<usize> {
    let start = sub.as_ptr() as usize - src.as_ptr() as usize;
    start..start + sub.len()
}

fn parse_content_length(val: &[u8]) -> Result<u64, Parse> {
    let val = trim_lws(val);
    if val.is_empty() || !val.iter().all(u8::is_ascii_digit) {
        return Err(Parse::BadRequest);
    }
    std::str::from_utf8(val)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(Parse::BadRequest)
}

/// Index a header slice into `QHdr` entries and fold the framing facts.
fn index_headers(
    src: &[u8],
    headers: &[httparse::Header<'_>],
    facts: &mut HeadFacts,
    host: &mut Option<Range<usize>>,
    capture_host: bool,
) -> Result<Vec<QHdr>, Parse> {
    let mut hdrs = Vec::with_capacity(headers.len());
    for h in headers {
        let wkhdr = WkHdr::from_name(h.name.as_bytes());
        match wkhdr {
            Some(WkHdr::Host) if capture_host => {
                if host.is_none() {
                    *host = Some(span_of(src, h.value));
                }
                // The host is promoted into the request info proper.
                continue;
            }
            Some(WkHdr::Expect) => {
                facts.expect_100 |= hdr_equals(h.value, "100-continue");
            }
            Some(WkHdr::Connection) => {
                facts.conn_close |= hdr_contains(h.value, "close");
            }
            Some(WkHdr::TransferEncoding) => {
                // rfc 2616: §4.4: != "identity" means chunked encoding
                if hdr_equals(h.value, "chunked") {
                    facts.chunked = true;
                } else if hdr_equals(h.value, "identity") {
                    facts.chunked = false;
                } else {
                    return Err(Parse::NotImplemented);
                }
            }
            Some(WkHdr::ContentLength) => {
                facts.content_length = Some(parse_content_length(h.value)?);
            }
            _ => {}
        }
        hdrs.push(QHdr {
            wkhdr,
            key: span_of(src, h.name.as_bytes()),
            val: span_of(src, h.value),
        });
    }
    Ok(hdrs)
}

/// Parse a full request head out of `src`.
///
/// Returns `Ok(None)` when the terminator has not arrived yet, and the
/// parsed snapshot plus consumed byte count once it has.
pub(crate) fn parse_request_head(
    src: &[u8],
) -> Result<Option<(QInfo, HeadFacts, usize)>, Parse> {
    let mut headers: SmallVec<[MaybeUninit<httparse::Header<'_>>; MAX_HEADERS]> =
        smallvec![MaybeUninit::uninit(); MAX_HEADERS];
    let mut req = httparse::Request::new(&mut []);
    let len = match req.parse_with_uninit_headers(src, &mut headers) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(httparse::Error::TooManyHeaders) => return Err(Parse::HeadersTooLarge),
        Err(_) => return Err(Parse::BadRequest),
    };

    let method =
        Method::from_bytes(req.method.unwrap_or("").as_bytes()).ok_or(Parse::BadRequest)?;
    let version = Version {
        major: 1,
        minor: req.version.unwrap_or(0),
    };

    let mut target = req.path.unwrap_or("").as_bytes();
    let mut host = None;
    let scheme_len = if target.starts_with(b"http://") {
        Some(7)
    } else if target.starts_with(b"https://") {
        Some(8)
    } else {
        None
    };
    if let Some(scheme_len) = scheme_len {
        let rest = &target[scheme_len..];
        let slash = memchr::memchr(b'/', rest).ok_or(Parse::BadRequest)?;
        host = Some(span_of(src, &rest[..slash]));
        target = &rest[slash..];
    } else if target != b"*" && !target.starts_with(b"/") {
        return Err(Parse::BadRequest);
    }
    let (path, query_string) = urldecode_target(target)?;

    let mut facts = HeadFacts::default();
    let hdrs = index_headers(src, req.headers, &mut facts, &mut host, true)?;

    let info = QInfo {
        method,
        version,
        host,
        path,
        prefix_len: 0,
        query_string,
        raw: Bytes::copy_from_slice(&src[..len]),
        hdrs,
    };
    Ok(Some((info, facts, len)))
}

/// Parse a full response head out of `src`.
pub(crate) fn parse_response_head(
    src: &[u8],
) -> Result<Option<(RInfo, HeadFacts, usize)>, Parse> {
    let mut headers: SmallVec<[MaybeUninit<httparse::Header<'_>>; MAX_HEADERS]> =
        smallvec![MaybeUninit::uninit(); MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut []);
    let mut config = httparse::ParserConfig::default();
    config.allow_obsolete_multiline_headers_in_responses(true);
    let len = match config.parse_response_with_uninit_headers(&mut resp, src, &mut headers) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(httparse::Error::TooManyHeaders) => return Err(Parse::Status),
        Err(_) => return Err(Parse::Status),
    };

    let code = resp.code.unwrap_or(0);
    if !(100..600).contains(&code) {
        return Err(Parse::Status);
    }
    let version = Version {
        major: 1,
        minor: resp.version.unwrap_or(0),
    };
    let reason = resp
        .reason
        .map(|r| span_of(src, r.as_bytes()))
        .unwrap_or(0..0);

    let mut facts = HeadFacts::default();
    let mut host = None;
    let hdrs = index_headers(src, resp.headers, &mut facts, &mut host, false)?;

    let info = RInfo {
        code,
        version,
        reason,
        raw: Bytes::copy_from_slice(&src[..len]),
        hdrs,
    };
    Ok(Some((info, facts, len)))
}

/// Outcome of scanning for one chunk-size line.
pub(crate) enum ChunkStatus {
    Complete { consumed: usize, size: u64 },
    Partial,
}

/// Parse one `HEX [; ext]* CRLF` chunk-size line. `line_max` bounds how
/// long an unterminated line may grow before it is an error.
pub(crate) fn parse_chunk_size(src: &[u8], line_max: usize) -> Result<ChunkStatus, Parse> {
    match httparse::parse_chunk_size(src) {
        Ok(httparse::Status::Complete((consumed, size))) => Ok(ChunkStatus::Complete {
            consumed,
            size,
        }),
        Ok(httparse::Status::Partial) => {
            if src.len() > line_max {
                return Err(Parse::ChunkSize);
            }
            Ok(ChunkStatus::Partial)
        }
        Err(_) => Err(Parse::ChunkSize),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_table_is_closed() {
        assert_eq!(Method::from_bytes(b"GET"), Some(Method::Get));
        assert_eq!(Method::from_bytes(b"get"), None);
        assert_eq!(Method::from_bytes(b"BREW"), None);
        assert_eq!(Method::Connect.index(), Method::COUNT - 1);
    }

    #[test]
    fn wkhdr_lookup_is_case_insensitive() {
        assert_eq!(WkHdr::from_name(b"content-length"), Some(WkHdr::ContentLength));
        assert_eq!(WkHdr::from_name(b"CONTENT-LENGTH"), Some(WkHdr::ContentLength));
        assert_eq!(WkHdr::from_name(b"SoapAction"), Some(WkHdr::SoapAction));
        assert_eq!(WkHdr::from_name(b"X-Custom"), None);
    }

    #[test]
    fn hdr_contains_splits_on_commas() {
        assert!(hdr_contains(b"close", "close"));
        assert!(hdr_contains(b"keep-alive, Close", "close"));
        assert!(hdr_contains(b" ClOsE ", "close"));
        assert!(!hdr_contains(b"keep-alive", "close"));
        assert!(!hdr_contains(b"closed", "close"));
    }

    #[test]
    fn hdr_matching_survives_case_changes() {
        // Arbitrary case flips on either side must not change the result.
        let values: &[&[u8]] = &[b"cLoSe", b"CLOSE", b"close"];
        for v in values {
            assert!(hdr_equals(v, "close"));
            assert!(hdr_equals(v, "CLOSE"));
            assert!(hdr_contains(v, "cLOse"));
        }
    }

    #[test]
    fn parses_simple_request_head() {
        let src = b"GET /hello?x=1 HTTP/1.1\r\nHost: example.com\r\nUser-Agent: t\r\n\r\n";
        let (info, facts, len) = parse_request_head(src).unwrap().expect("complete");
        assert_eq!(len, src.len());
        assert_eq!(info.method(), Method::Get);
        assert_eq!(info.version(), Version::HTTP_11);
        assert_eq!(info.path(), "/hello");
        assert_eq!(info.query_string(), Some("x=1"));
        assert_eq!(info.host(), "example.com");
        // Host was promoted out of the header list.
        assert!(info.header(WkHdr::Host).is_none());
        assert_eq!(info.header(WkHdr::UserAgent), Some(&b"t"[..]));
        assert!(!facts.chunked);
        assert!(!facts.conn_close);
        assert_eq!(facts.content_length, None);
    }

    #[test]
    fn partial_head_asks_for_more() {
        assert!(parse_request_head(b"GET / HTTP/1.1\r\nHost:")
            .unwrap()
            .is_none());
    }

    #[test]
    fn absolute_form_captures_host() {
        let src = b"GET http://h.example:80/a/b HTTP/1.1\r\n\r\n";
        let (info, _, _) = parse_request_head(src).unwrap().unwrap();
        assert_eq!(info.host(), "h.example:80");
        assert_eq!(info.path(), "/a/b");
    }

    #[test]
    fn unknown_method_is_rejected() {
        let src = b"BREW /pot HTTP/1.1\r\n\r\n";
        assert!(matches!(
            parse_request_head(src),
            Err(Parse::BadRequest)
        ));
    }

    #[test]
    fn exotic_transfer_encoding_is_not_implemented() {
        let src = b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n";
        assert!(matches!(
            parse_request_head(src),
            Err(Parse::NotImplemented)
        ));
    }

    #[test]
    fn chunked_overrides_content_length() {
        let src =
            b"POST / HTTP/1.1\r\nContent-Length: 10\r\nTransfer-Encoding: chunked\r\n\r\n";
        let (_, facts, _) = parse_request_head(src).unwrap().unwrap();
        assert!(facts.chunked);
        // The facts still carry the length; framing decisions ignore it
        // when chunked is set.
        assert_eq!(facts.content_length, Some(10));
    }

    #[test]
    fn expect_100_continue_is_detected() {
        let src = b"POST / HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 5\r\n\r\n";
        let (_, facts, _) = parse_request_head(src).unwrap().unwrap();
        assert!(facts.expect_100);
    }

    #[test]
    fn parses_status_line() {
        let src = b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n";
        let (info, facts, len) = parse_response_head(src).unwrap().unwrap();
        assert_eq!(len, src.len());
        assert_eq!(info.code(), 204);
        assert_eq!(info.reason(), "No Content");
        assert_eq!(info.version(), Version::HTTP_11);
        assert!(facts.conn_close);
    }

    #[test]
    fn status_code_out_of_range_is_rejected() {
        let src = b"HTTP/1.1 999 Nope\r\n\r\n";
        assert!(matches!(parse_response_head(src), Err(Parse::Status)));
    }

    #[test]
    fn chunk_size_lines() {
        match parse_chunk_size(b"5\r\nhello", 1024).unwrap() {
            ChunkStatus::Complete { consumed, size } => {
                assert_eq!(consumed, 3);
                assert_eq!(size, 5);
            }
            ChunkStatus::Partial => panic!("complete line"),
        }
        // Extensions are skipped.
        match parse_chunk_size(b"a;name=val\r\n", 1024).unwrap() {
            ChunkStatus::Complete { consumed, size } => {
                assert_eq!(consumed, 12);
                assert_eq!(size, 10);
            }
            ChunkStatus::Partial => panic!("complete line"),
        }
        assert!(matches!(
            parse_chunk_size(b"5", 1024),
            Ok(ChunkStatus::Partial)
        ));
        assert!(parse_chunk_size(b"zz\r\n", 1024).is_err());
        // An unterminated line cannot grow forever.
        assert!(parse_chunk_size(&[b'1'; 64], 16).is_err());
    }

    #[test]
    fn reason_phrases_match_the_table() {
        assert_eq!(reason_phrase(200), "OK");
        assert_eq!(reason_phrase(416), "Requested range not satisfiable");
        assert_eq!(reason_phrase(505), "HTTP Version not supported");
        assert_eq!(reason_phrase(299), "<unknown>");
    }
}
