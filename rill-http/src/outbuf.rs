//! Append-only write buffer with zero-copy segments.
//!
//! An [`Outbuf`] is an inline byte builder plus an ordered queue of
//! external segments (borrowed [`Bytes`] or memory-mapped regions).
//! Draining batches everything through `writev` until `EAGAIN`, keeping
//! partial-write bookkeeping so a later drain resumes exactly where the
//! kernel stopped.
//!
//! The chunked-encoding primitives live here too: a 12-byte reservation
//! laid out by `reserve` is later patched in place with the
//! `\r\n%08x\r\n` size prefix once the chunk body length is known.

use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use bytes::Bytes;

/// Size of a chunked-encoding size reservation: `"\r\n%08x\r\n"`.
pub const CHUNK_HDR_LEN: usize = 12;

const IOV_BATCH: usize = 64;

/// A read-only memory-mapped region, unmapped on drop.
pub struct MmapRegion {
    ptr: *mut libc::c_void,
    len: usize,
}

impl MmapRegion {
    /// Map the first `len` bytes of `file` read-only, hinting sequential
    /// access.
    pub fn map_file(file: &File, len: usize) -> io::Result<Self> {
        debug_assert!(len > 0, "cannot map an empty region");
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        unsafe { libc::madvise(ptr, len, libc::MADV_SEQUENTIAL) };
        Ok(Self { ptr, len })
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.cast::<u8>(), self.len) }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.ptr, self.len) };
    }
}

enum Segment {
    /// A sealed range of the inline builder.
    Sb { start: usize, len: usize },
    Extern(Bytes),
    Mmap(MmapRegion),
}

impl Segment {
    fn len(&self) -> usize {
        match self {
            Self::Sb { len, .. } => *len,
            Self::Extern(bytes) => bytes.len(),
            Self::Mmap(region) => region.len,
        }
    }
}

/// The per-connection write queue.
#[derive(Default)]
pub struct Outbuf {
    sb: Vec<u8>,
    segs: VecDeque<Segment>,
    /// Bytes of the front segment already written out.
    front_written: usize,
    /// Offset in `sb` where the not-yet-sealed trailing region begins.
    tail_start: usize,
    /// Drained prefix of the trailing region; non-zero only when `segs`
    /// is empty.
    tail_written: usize,
    /// Total pending bytes.
    length: usize,
}

impl Outbuf {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total pending bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.length
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Bytes appended to the inline builder since the last external
    /// segment.
    #[must_use]
    pub fn sb_trailing(&self) -> usize {
        self.sb.len() - self.tail_start
    }

    /// Append raw bytes to the inline builder.
    pub fn add(&mut self, bytes: &[u8]) {
        self.sb.extend_from_slice(bytes);
        self.length += bytes.len();
    }

    /// Append a string to the inline builder.
    pub fn adds(&mut self, s: &str) {
        self.add(s.as_bytes());
    }

    /// Append `n` uninitialized (zeroed) bytes and return their offset,
    /// to be patched later with [`Outbuf::chunk_patch`].
    pub fn reserve(&mut self, n: usize) -> usize {
        let offset = self.sb.len();
        self.sb.resize(offset + n, 0);
        self.length += n;
        offset
    }

    /// Patch a [`CHUNK_HDR_LEN`] reservation with the chunked-encoding
    /// size prefix for `body_len` bytes. A zero-length chunk is elided by
    /// shrinking the reservation, which is only legal while it is still
    /// trailing in the builder.
    pub fn chunk_patch(&mut self, offset: usize, body_len: usize) {
        const HEX: &[u8; 16] = b"0123456789abcdef";

        if body_len == 0 {
            assert!(
                offset + CHUNK_HDR_LEN == self.sb.len() && offset >= self.tail_start,
                "chunk reservation is no longer trailing"
            );
            self.sb.truncate(offset);
            self.length -= CHUNK_HDR_LEN;
            return;
        }
        let buf = &mut self.sb[offset..offset + CHUNK_HDR_LEN];
        buf[0] = b'\r';
        buf[1] = b'\n';
        for (i, slot) in buf[2..10].iter_mut().enumerate() {
            *slot = HEX[(body_len >> (28 - 4 * i)) & 0xf];
        }
        buf[10] = b'\r';
        buf[11] = b'\n';
    }

    /// Seal the trailing builder region into the segment queue so an
    /// external segment can be appended behind it.
    fn seal_tail(&mut self) {
        let start = self.tail_start + self.tail_written;
        let len = self.sb.len() - start;
        if len > 0 {
            self.segs.push_back(Segment::Sb { start, len });
        }
        self.tail_start = self.sb.len();
        self.tail_written = 0;
    }

    /// Append an externally-owned chunk; the bytes are not copied.
    pub fn add_extern(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.seal_tail();
        self.length += bytes.len();
        self.segs.push_back(Segment::Extern(bytes));
    }

    /// Attach a memory-mapped region; ownership (and the eventual
    /// munmap) transfers to the outbuf.
    pub fn add_memmap(&mut self, region: MmapRegion) {
        if region.len == 0 {
            return;
        }
        self.seal_tail();
        self.length += region.len;
        self.segs.push_back(Segment::Mmap(region));
    }

    /// Read exactly `n` bytes from `fd` into the inline builder.
    pub fn xread(&mut self, fd: RawFd, n: usize) -> io::Result<()> {
        let offset = self.sb.len();
        self.sb.resize(offset + n, 0);
        let mut got = 0;
        while got < n {
            let res = unsafe {
                libc::read(
                    fd,
                    self.sb.as_mut_ptr().add(offset + got).cast(),
                    n - got,
                )
            };
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.sb.truncate(offset);
                return Err(err);
            }
            if res == 0 {
                self.sb.truncate(offset);
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            got += res as usize;
        }
        self.length += n;
        Ok(())
    }

    /// Move all of `other`'s content behind this buffer's, preserving
    /// order, and leave `other` empty.
    pub fn merge(&mut self, other: &mut Self) {
        debug_assert_eq!(other.front_written, 0, "merging a partially drained outbuf");
        debug_assert_eq!(other.tail_written, 0, "merging a partially drained outbuf");
        if other.is_empty() {
            other.reset();
            return;
        }
        self.seal_tail();
        let base = self.sb.len();
        self.sb.extend_from_slice(&other.sb);
        for seg in other.segs.drain(..) {
            self.segs.push_back(match seg {
                Segment::Sb { start, len } => Segment::Sb {
                    start: start + base,
                    len,
                },
                external => external,
            });
        }
        self.tail_start = base + other.tail_start;
        self.length += other.length;
        other.reset();
    }

    fn reset(&mut self) {
        self.sb.clear();
        self.segs.clear();
        self.front_written = 0;
        self.tail_start = 0;
        self.tail_written = 0;
        self.length = 0;
    }

    fn consume(&mut self, mut n: usize) {
        self.length -= n;
        while n > 0 {
            match self.segs.front() {
                Some(front) => {
                    let avail = front.len() - self.front_written;
                    if n >= avail {
                        n -= avail;
                        self.segs.pop_front();
                        self.front_written = 0;
                    } else {
                        self.front_written += n;
                        n = 0;
                    }
                }
                None => {
                    self.tail_written += n;
                    n = 0;
                }
            }
        }
        if self.length == 0 {
            debug_assert!(self.segs.is_empty());
            debug_assert_eq!(self.tail_start + self.tail_written, self.sb.len());
            self.reset();
        }
    }

    /// Drain pending bytes into `fd` with vectored writes until either
    /// everything is out or the fd stops accepting. Returns the number
    /// of bytes written; `EAGAIN` is not an error, partial progress is
    /// preserved.
    pub fn write_to(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut total = 0;
        while !self.is_empty() {
            let mut iovs: [libc::iovec; IOV_BATCH] = unsafe { std::mem::zeroed() };
            let mut count = 0;

            for (i, seg) in self.segs.iter().enumerate() {
                if count == IOV_BATCH {
                    break;
                }
                let slice = match seg {
                    Segment::Sb { start, len } => &self.sb[*start..*start + *len],
                    Segment::Extern(bytes) => &bytes[..],
                    Segment::Mmap(region) => region.as_slice(),
                };
                let slice = if i == 0 { &slice[self.front_written..] } else { slice };
                iovs[count] = libc::iovec {
                    iov_base: slice.as_ptr() as *mut libc::c_void,
                    iov_len: slice.len(),
                };
                count += 1;
            }
            if count < IOV_BATCH {
                let tail_from = self.tail_start
                    + if self.segs.is_empty() { self.tail_written } else { 0 };
                let tail = &self.sb[tail_from..];
                if !tail.is_empty() {
                    iovs[count] = libc::iovec {
                        iov_base: tail.as_ptr() as *mut libc::c_void,
                        iov_len: tail.len(),
                    };
                    count += 1;
                }
            }
            debug_assert!(count > 0);

            let res = unsafe { libc::writev(fd, iovs.as_ptr(), count as libc::c_int) };
            if res < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock => break,
                    _ => return Err(err),
                }
            }
            self.consume(res as usize);
            total += res as usize;
        }
        Ok(total)
    }
}

#[cfg(test)]
impl Outbuf {
    /// Flatten the pending bytes for assertions.
    pub(crate) fn test_contents(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.length);
        for (i, seg) in self.segs.iter().enumerate() {
            let slice = match seg {
                Segment::Sb { start, len } => &self.sb[*start..*start + *len],
                Segment::Extern(bytes) => &bytes[..],
                Segment::Mmap(region) => region.as_slice(),
            };
            let skip = if i == 0 { self.front_written } else { 0 };
            out.extend_from_slice(&slice[skip..]);
        }
        let tail_from =
            self.tail_start + if self.segs.is_empty() { self.tail_written } else { 0 };
        out.extend_from_slice(&self.sb[tail_from..]);
        out
    }
}

impl fmt::Write for Outbuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.adds(s);
        Ok(())
    }
}

impl fmt::Debug for Outbuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbuf")
            .field("length", &self.length)
            .field("segments", &self.segs.len())
            .field("sb_trailing", &self.sb_trailing())
            .finish()
    }
}
