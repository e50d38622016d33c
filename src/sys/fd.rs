use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

/// Owned file descriptor with positioned I/O.
///
/// Positioned reads and writes leave the file cursor alone, so one descriptor
/// can serve interleaved block requests without seeking back and forth.
#[derive(Debug)]
pub struct FileDesc(File);

impl FileDesc {
    /// Opens `path` read-write, creating it if it does not exist yet.
    pub fn open_rw<P: AsRef<Path>>(path: P) -> io::Result<FileDesc> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        Ok(FileDesc(file))
    }

    pub fn open_ro<P: AsRef<Path>>(path: P) -> io::Result<FileDesc> {
        Ok(FileDesc(File::open(path)?))
    }

    pub fn len(&self) -> io::Result<u64> {
        Ok(self.0.metadata()?.len())
    }

    /// Single positioned read; returns how many bytes landed in `buf`.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.0.read_at(buf, offset)
    }

    /// Reads `buf.len()` bytes at `offset`. Bytes past the end of the file
    /// come back as zeroes, matching sparse block device semantics.
    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let mut pos = 0;

        while pos < buf.len() {
            match self.0.read_at(&mut buf[pos..], offset + pos as u64) {
                Ok(0) => {
                    for b in &mut buf[pos..] {
                        *b = 0;
                    }
                    return Ok(());
                }
                Ok(n) => pos += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    pub fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut pos = 0;

        while pos < buf.len() {
            match self.0.write_at(&buf[pos..], offset + pos as u64) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => pos += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    pub fn sync_data(&self) -> io::Result<()> {
        self.0.sync_data()
    }
}

impl AsRawFd for FileDesc {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}
