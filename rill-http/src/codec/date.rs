//! Date header cache.
//!
//! Formatting an RFC 1123 date is not free and every response carries
//! one, so the full `Date: ...\r\n` line is memoized per thread, keyed
//! by the integer second. Safe because the loop is single-threaded.

use std::cell::RefCell;
use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use httpdate::HttpDate;

use crate::outbuf::Outbuf;

// "Date: Sun, 06 Nov 1994 08:49:37 GMT\r\n".len()
const DATE_LINE_LEN: usize = 37;

struct CachedDate {
    sec: u64,
    line: [u8; DATE_LINE_LEN],
}

thread_local!(static CACHED: RefCell<CachedDate> = const {
    RefCell::new(CachedDate {
        sec: 0,
        line: [0; DATE_LINE_LEN],
    })
});

/// Append the cached `Date: ...\r\n` line, refreshing it lazily.
pub(crate) fn extend(ob: &mut Outbuf) {
    let now = SystemTime::now();
    let sec = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    CACHED.with(|cache| {
        let mut cache = cache.borrow_mut();
        if cache.sec != sec {
            let mut buf = String::with_capacity(DATE_LINE_LEN);
            let _ = write!(buf, "Date: {}\r\n", HttpDate::from(now));
            debug_assert_eq!(buf.len(), DATE_LINE_LEN);
            cache.line.copy_from_slice(buf.as_bytes());
            cache.sec = sec;
        }
        ob.add(&cache.line);
    });
}

/// Append an arbitrary date header, e.g. `Last-Modified`.
pub(crate) fn put_date_hdr(ob: &mut Outbuf, name: &str, when: SystemTime) {
    let _ = write!(ob, "{name}: {}\r\n", HttpDate::from(when));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_has_expected_shape() {
        let mut ob = Outbuf::new();
        extend(&mut ob);
        assert_eq!(ob.len(), DATE_LINE_LEN);

        // Cached within the same second: identical output again.
        let mut ob2 = Outbuf::new();
        extend(&mut ob2);
        assert_eq!(ob2.len(), DATE_LINE_LEN);
    }

    #[test]
    fn put_date_hdr_formats_rfc1123() {
        let mut ob = Outbuf::new();
        put_date_hdr(&mut ob, "Last-Modified", UNIX_EPOCH);
        // 1970-01-01 is a Thursday.
        assert_eq!(ob.len(), "Last-Modified: Thu, 01 Jan 1970 00:00:00 GMT\r\n".len());
    }
}
