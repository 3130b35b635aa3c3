//! Sparse-file access: positioned I/O, hole punching and extent iteration.
//!
//! Platform-specific sparse support (hole punching, extent discovery) lives
//! behind [`SparseFile`] so the rest of the crate never touches raw fds.
//! Where the platform cannot punch a real hole the region is overwritten
//! with zeros instead, which preserves logical content at the cost of
//! physical usage.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// A logically-zero region of a file that may be physically absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseExtent {
    pub offset: i64,
    pub size: i64,
}

impl SparseExtent {
    pub fn end(&self) -> i64 {
        self.offset + self.size
    }

    /// Serialize as the 16-byte wire/hash record.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.offset.to_le_bytes());
        out[8..].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    pub fn from_bytes(raw: &[u8; 16]) -> Self {
        SparseExtent {
            offset: i64::from_le_bytes(raw[..8].try_into().unwrap()),
            size: i64::from_le_bytes(raw[8..].try_into().unwrap()),
        }
    }
}

/// Forward iterator over a sorted list of sparse extents, resettable so a
/// caller can walk the same layout twice (hash pass, then punch pass).
#[derive(Debug, Clone, Default)]
pub struct ExtentIterator {
    extents: Vec<SparseExtent>,
    next: usize,
}

impl ExtentIterator {
    pub fn new(mut extents: Vec<SparseExtent>) -> Self {
        extents.sort_by_key(|e| e.offset);
        ExtentIterator { extents, next: 0 }
    }

    pub fn next_extent(&mut self) -> Option<SparseExtent> {
        let e = self.extents.get(self.next).copied();
        if e.is_some() {
            self.next += 1;
        }
        e
    }

    pub fn reset(&mut self) {
        self.next = 0;
    }

    pub fn extents(&self) -> &[SparseExtent] {
        &self.extents
    }
}

/// Positioned file access plus sparse operations.
pub trait SparseFile {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;
    fn len(&self) -> io::Result<u64>;
    fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }
    fn resize(&mut self, size: u64) -> io::Result<()>;
    fn punch_hole(&mut self, offset: u64, size: u64) -> io::Result<()>;
}

impl SparseFile for File {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < buf.len() {
            match self.read(&mut buf[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(read)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(buf)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn resize(&mut self, size: u64) -> io::Result<()> {
        self.set_len(size)
    }

    fn punch_hole(&mut self, offset: u64, size: u64) -> io::Result<()> {
        if size == 0 {
            return Ok(());
        }

        #[cfg(target_os = "linux")]
        {
            use std::os::fd::AsRawFd;
            let rc = unsafe {
                libc::fallocate(
                    self.as_raw_fd(),
                    libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                    offset as libc::off_t,
                    size as libc::off_t,
                )
            };
            if rc == 0 {
                return Ok(());
            }
            // fall through to zero fill (e.g. tmpfs without punch support)
        }

        zero_fill(self, offset, size)
    }
}

/// Copy-on-write clone of `src`'s content into `dest` (`FICLONE`).
///
/// Returns false when the filesystem cannot clone; the caller falls back
/// to writing the bytes itself.
pub fn reflink(src: &File, dest: &File) -> bool {
    #[cfg(target_os = "linux")]
    {
        use std::os::fd::AsRawFd;
        const FICLONE: libc::c_ulong = 0x4004_9409;
        let rc = unsafe { libc::ioctl(dest.as_raw_fd(), FICLONE as _, src.as_raw_fd()) };
        rc == 0
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (src, dest);
        false
    }
}

/// Overwrite a region with zeros, the portable stand-in for a hole punch.
pub fn zero_fill(file: &mut File, offset: u64, size: u64) -> io::Result<()> {
    const ZEROES: [u8; 32 * 1024] = [0u8; 32 * 1024];
    file.seek(SeekFrom::Start(offset))?;
    let mut written = 0u64;
    while written < size {
        let n = (size - written).min(ZEROES.len() as u64) as usize;
        file.write_all(&ZEROES[..n])?;
        written += n as u64;
    }
    Ok(())
}

/// Discover the hole extents of a file via `SEEK_HOLE`/`SEEK_DATA`.
///
/// On platforms without the seek flags this returns an empty list, which
/// degrades to "no known holes".
pub fn scan_extents(file: &mut File) -> io::Result<Vec<SparseExtent>> {
    #[cfg(target_os = "linux")]
    {
        use std::os::fd::AsRawFd;

        let len = file.metadata()?.len() as i64;
        let fd = file.as_raw_fd();
        let mut extents = Vec::new();
        let mut pos: i64 = 0;

        while pos < len {
            let hole = unsafe { libc::lseek(fd, pos, libc::SEEK_HOLE) };
            if hole < 0 {
                // filesystem without hole reporting
                return Ok(Vec::new());
            }
            if hole >= len {
                break;
            }
            let data = unsafe { libc::lseek(fd, hole, libc::SEEK_DATA) };
            let end = if data < 0 { len } else { data };
            // every file has an implicit hole at EOF; skip zero-size results
            if end > hole {
                extents.push(SparseExtent {
                    offset: hole,
                    size: end - hole,
                });
            }
            pos = end;
        }

        file.seek(SeekFrom::Start(0))?;
        Ok(extents)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = file;
        Ok(Vec::new())
    }
}

/// Free bytes on the filesystem containing `path`, or `None` when the
/// platform cannot tell.
pub fn free_space(path: &std::path::Path) -> Option<u64> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return None;
        }
        Some(stat.f_bavail as u64 * stat.f_frsize as u64)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn extent_iterator_sorts_and_resets() {
        let mut it = ExtentIterator::new(vec![
            SparseExtent { offset: 100, size: 10 },
            SparseExtent { offset: 0, size: 10 },
        ]);
        assert_eq!(it.next_extent().unwrap().offset, 0);
        assert_eq!(it.next_extent().unwrap().offset, 100);
        assert!(it.next_extent().is_none());
        it.reset();
        assert_eq!(it.next_extent().unwrap().offset, 0);
    }

    #[test]
    fn extent_record_roundtrip() {
        let e = SparseExtent {
            offset: 1 << 40,
            size: 4096,
        };
        assert_eq!(SparseExtent::from_bytes(&e.to_bytes()), e);
    }

    #[test]
    fn read_at_and_write_at() {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(b"0123456789").unwrap();

        let mut buf = [0u8; 4];
        let n = f.read_at(3, &mut buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"3456");

        f.write_at(3, b"XY").unwrap();
        let n = f.read_at(0, &mut buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"012X");
    }

    #[test]
    fn punch_hole_zeroes_region() {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(&[0xFFu8; 8192]).unwrap();
        f.punch_hole(1024, 4096).unwrap();

        let mut buf = vec![0u8; 8192];
        let n = f.read_at(0, &mut buf).unwrap();
        assert_eq!(n, 8192);
        assert!(buf[..1024].iter().all(|&b| b == 0xFF));
        assert!(buf[1024..5120].iter().all(|&b| b == 0));
        assert!(buf[5120..].iter().all(|&b| b == 0xFF));
        assert_eq!(SparseFile::len(&mut f).unwrap(), 8192);
    }

    #[test]
    fn zero_fill_covers_odd_sizes() {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(&[1u8; 100_000]).unwrap();
        zero_fill(&mut f, 10, 70_001).unwrap();
        let mut buf = vec![0u8; 100_000];
        f.read_at(0, &mut buf).unwrap();
        assert!(buf[..10].iter().all(|&b| b == 1));
        assert!(buf[10..70_011].iter().all(|&b| b == 0));
        assert!(buf[70_011..].iter().all(|&b| b == 1));
    }
}
