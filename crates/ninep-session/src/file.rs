//! File handle descriptors and the I/O boundary to the backing tree.

use {
    crate::fcall::{dm, om},
    async_trait::async_trait,
    nix::{fcntl::OFlag, libc},
    std::{fmt, io, sync::Arc},
};

/// An open file supplied by the application when it accepts a Topen or
/// Tcreate. All I/O is positioned; implementations must not rely on a cursor.
#[async_trait]
pub trait FileIo: Send + Sync {
    /// Read into `buf` starting at `offset`. A short count is allowed;
    /// `Ok(0)` means end of file.
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Write from `buf` starting at `offset`. A short count is allowed.
    async fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;

    /// Release the file. Called once, on clunk, remove or session cleanup.
    async fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

/// What a fid is bound to.
#[derive(Clone, Default)]
pub struct FileHandle {
    pub(crate) path: String,
    pub(crate) io: Option<Arc<dyn FileIo>>,
    pub(crate) auth: bool,
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.path)
            .field("open", &self.io.is_some())
            .field("auth", &self.auth)
            .finish()
    }
}

impl FileHandle {
    pub fn new<S: Into<String>>(path: S) -> Self {
        FileHandle {
            path: path.into(),
            io: None,
            auth: false,
        }
    }

    /// The authentication pseudo-file.
    pub fn auth() -> Self {
        FileHandle {
            path: String::new(),
            io: None,
            auth: true,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.io.is_some()
    }

    pub fn is_auth(&self) -> bool {
        self.auth
    }
}

/// Translate a 9P open mode into unix open flags.
pub fn open_flag(mode: u8) -> OFlag {
    let mut flag = match mode & 3 {
        om::WRITE => OFlag::O_WRONLY,
        om::RDWR => OFlag::O_RDWR,
        // READ, and EXEC which reads with an execute permission check
        _ => OFlag::O_RDONLY,
    };
    if mode & om::TRUNC != 0 {
        flag |= OFlag::O_TRUNC;
    }
    flag
}

/// Translate 9P permission bits into a unix `st_mode` value.
pub fn unix_mode(perm: u32) -> u32 {
    let typ = if perm & dm::DIR != 0 {
        libc::S_IFDIR
    } else if perm & dm::SYMLINK != 0 {
        libc::S_IFLNK
    } else {
        libc::S_IFREG
    };
    typ as u32 | (perm & 0o777)
}

/// Read until `buf` is full or the file ends.
///
/// Returns the bytes read and the error that stopped the read, if any.
/// `UnexpectedEof` counts as end of file.
pub(crate) async fn read_full_at(
    file: &dyn FileIo,
    buf: &mut [u8],
    offset: u64,
) -> (usize, Option<io::Error>) {
    let mut n = 0;
    while n < buf.len() {
        match file.read_at(&mut buf[n..], offset + n as u64).await {
            Ok(0) => break,
            Ok(m) => n += m,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return (n, Some(e)),
        }
    }
    (n, None)
}

/// Write all of `buf` at `offset`, stopping at the first error or at a
/// write that makes no progress.
pub(crate) async fn write_all_at(
    file: &dyn FileIo,
    buf: &[u8],
    offset: u64,
) -> (usize, Option<io::Error>) {
    let mut n = 0;
    while n < buf.len() {
        match file.write_at(&buf[n..], offset + n as u64).await {
            Ok(0) => return (n, Some(io::Error::from(io::ErrorKind::WriteZero))),
            Ok(m) => n += m,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return (n, Some(e)),
        }
    }
    (n, None)
}


#[cfg(test)]
mod tests {
    use super::testing::MemFile;
    use super::*;

    #[test]
    fn open_modes() {
        assert_eq!(open_flag(om::READ), OFlag::O_RDONLY);
        assert_eq!(open_flag(om::WRITE), OFlag::O_WRONLY);
        assert_eq!(open_flag(om::RDWR), OFlag::O_RDWR);
        assert_eq!(open_flag(om::EXEC), OFlag::O_RDONLY);
        assert_eq!(
            open_flag(om::WRITE | om::TRUNC),
            OFlag::O_WRONLY | OFlag::O_TRUNC
        );
        assert_eq!(open_flag(om::READ | om::RCLOSE), OFlag::O_RDONLY);
    }

    #[test]
    fn create_perm_to_unix_mode() {
        assert_eq!(unix_mode(0o644), libc::S_IFREG as u32 | 0o644);
        assert_eq!(unix_mode(dm::DIR | 0o755), libc::S_IFDIR as u32 | 0o755);
    }

    #[tokio::test]
    async fn read_full_stops_at_eof() {
        let file = MemFile::with(b"hello world");
        let mut buf = vec![0; 64];
        let (n, err) = read_full_at(&file, &mut buf, 6).await;
        assert!(err.is_none());
        assert_eq!(&buf[..n], b"world");
    }

    #[tokio::test]
    async fn write_all_reports_partial_progress() {
        let file = MemFile {
            write_limit: Some(4),
            ..Default::default()
        };
        let (n, err) = write_all_at(&file, b"abcdef", 0).await;
        assert_eq!(n, 4);
        assert!(err.is_some());
        assert_eq!(&*file.data.lock().unwrap(), b"abcd");
    }
}
