//! Static file and directory-index replies.

use std::fmt::Write as _;
use std::fs::{self, File};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::SystemTime;

use rill_core::El;

use crate::codec::{self, Method, QInfo};
use crate::outbuf::{MmapRegion, Outbuf};

use super::{Query, Trigger};

/// Files larger than this are served from a memory mapping instead of
/// being copied through the builder.
const MMAP_THRESHOLD: u64 = 16 << 10;

/// Extension → content-type (and implied content-encoding) table.
fn mime_put_ctype(ob: &mut Outbuf, path: &str) {
    static MAP: &[(&str, &str, Option<&str>)] = &[
        ("dbg", "text/plain", None),
        ("cfg", "text/plain", None),
        ("err", "text/plain", None),
        ("log", "text/plain", None),
        ("lst", "text/plain", None),
        ("txt", "text/plain", None),
        ("wsdl", "text/xml", None),
        ("xml", "text/xml", None),
        ("xsd", "text/xml", None),
        ("xsl", "text/xml", None),
        ("htm", "text/html", None),
        ("html", "text/html", None),
        ("pcap", "application/x-pcap", None),
        ("pdf", "application/pdf", None),
        ("tar", "application/x-tar", None),
        ("tgz", "application/x-tar", Some("gzip")),
        ("tbz2", "application/x-tar", Some("bzip2")),
        ("rar", "application/rar", None),
        ("zip", "application/zip", None),
    ];

    let name = path.rsplit('/').next().unwrap_or(path);
    let mut name = name.to_owned();
    let mut has_enc = false;

    // A trailing compression extension is stripped and reported as the
    // content encoding of the file behind it.
    for (suffix, enc) in [(".gz", "gzip"), (".Z", "compress"), (".bz2", "bzip2")] {
        if let Some(stripped) = name.strip_suffix(suffix) {
            let _ = write!(ob, "Content-Encoding: {enc}\r\n");
            has_enc = true;
            name = stripped.to_owned();
            break;
        }
    }

    let ext = name.rsplit('.').next().unwrap_or("");
    if !ext.is_empty() && ext.len() < name.len() {
        for &(e, ct, ce) in MAP {
            if e.eq_ignore_ascii_case(ext) {
                let _ = write!(ob, "Content-Type: {ct}\r\n");
                if !has_enc {
                    if let Some(ce) = ce {
                        let _ = write!(ob, "Content-Encoding: {ce}\r\n");
                    }
                }
                return;
            }
        }
    }
    ob.adds("Content-Type: application/octet-stream\r\n");
}

fn put_etag(ob: &mut Outbuf, meta: &fs::Metadata) {
    let mtime = meta.mtime();
    let recent = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64 - 10 <= mtime)
        .unwrap_or(false);
    // A very fresh mtime may still change within the same second, so
    // only claim a weak validator for it.
    let weak = if recent { "W/" } else { "" };
    let _ = write!(
        ob,
        "ETag: {weak}\"{:x}-{:x}-{:x}\"\r\n",
        meta.ino(),
        meta.size(),
        mtime
    );
}

/// Reply with the contents of `file` under `dir`.
///
/// Large files are memory-mapped into the outbuf; smaller ones are read
/// inline. `Content-Type`/`Content-Encoding` come from the extension,
/// validators from the inode. With `head_only` the body is omitted but
/// the headers still describe it.
pub fn reply_file(el: &mut El, q: &Rc<Query>, dir: &Path, file: &str, head_only: bool) {
    let path = dir.join(file.trim_start_matches('/'));
    let Ok(handle) = File::open(&path) else {
        q.reject(el, 404, "");
        return;
    };
    let Ok(meta) = handle.metadata() else {
        q.reject(el, 404, "");
        return;
    };
    if meta.is_dir() {
        if !file.ends_with('/') && !file.is_empty() {
            q.reject(el, 404, "");
            return;
        }
        reply_make_index(el, q, &path, head_only);
        return;
    }
    if !meta.is_file() {
        q.reject(el, 404, "");
        return;
    }

    let size = meta.size();
    let map = if !head_only && size > MMAP_THRESHOLD {
        match MmapRegion::map_file(&handle, size as usize) {
            Ok(map) => Some(map),
            Err(err) => {
                q.reject(el, 500, format_args!("mmap failed: {err}"));
                return;
            }
        }
    } else {
        None
    };

    q.reply_hdrs_start(200, false);
    q.with_ob(|ob| {
        codec::date::put_date_hdr(
            ob,
            "Last-Modified",
            meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        );
        put_etag(ob, &meta);
        mime_put_ctype(ob, file);
    });
    q.reply_hdrs_done(size as i64, false);
    if !head_only {
        // A read failure here truncates the body; the framing already
        // promised `size` bytes, so the peer will notice.
        let _ = q.with_ob(|ob| match map {
            Some(map) => {
                ob.add_memmap(map);
                Ok(())
            }
            None => ob.xread(handle.as_raw_fd(), size as usize),
        });
    }
    q.reply_done(el);
}

/// Reply with a generated HTML index of `dir`.
pub fn reply_make_index(el: &mut El, q: &Rc<Query>, dir: &Path, head_only: bool) {
    let Ok(meta) = fs::metadata(dir) else {
        q.reject(el, 404, "");
        return;
    };
    let Ok(entries) = fs::read_dir(dir) else {
        q.reject(el, 404, "");
        return;
    };

    q.reply_hdrs_start(200, false);
    q.with_ob(|ob| {
        codec::date::put_date_hdr(
            ob,
            "Last-Modified",
            meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        );
        ob.adds("Content-Type: text/html\r\n");
    });
    q.reply_hdrs_done(-1, true);
    if !head_only {
        q.reply_chunk_start();
        q.with_ob(|ob| {
            ob.adds("<html><body><h1>Index</h1>");
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with('.') {
                    continue;
                }
                let Ok(ft) = entry.file_type() else { continue };
                if ft.is_dir() {
                    let _ = write!(ob, "<a href=\"{name}/\">{name}/</a><br>");
                } else if ft.is_file() {
                    let _ = write!(ob, "<a href=\"{name}\">{name}</a><br>");
                }
            }
            ob.adds("</body></html>");
        });
        q.reply_chunk_done();
    }
    q.reply_done(el);
}

/// A trigger serving a directory subtree: `GET`/`HEAD` of the path tail
/// below the mount point, directory indexes included.
pub struct StaticDirTrigger {
    root: PathBuf,
}

impl StaticDirTrigger {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Trigger for StaticDirTrigger {
    fn on_query(&self, el: &mut El, q: &Rc<Query>, info: &Rc<QInfo>) {
        let head_only = info.method() == Method::Head;
        let tail = info.tail();
        if tail.is_empty() || tail == "/" {
            reply_make_index(el, q, &self.root, head_only);
        } else {
            reply_file(el, q, &self.root, tail, head_only);
        }
    }
}
