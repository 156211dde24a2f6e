//! Async file access through the event driver.

use std::cell::Cell;
use std::path::Path;

use crate::runtime::Handle;
use crate::sys::{self, FileFd};
use crate::{Error, Result};

/// How a file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read only; the file must exist.
    Read,
    /// Write only; created if missing, truncated otherwise.
    Write,
    /// Read and write; created if missing.
    ReadWrite,
    /// Append; created if missing.
    Append,
    /// Open a directory for reading.
    Directory,
}

#[cfg(unix)]
fn open_flags(mode: OpenMode) -> i32 {
    let base = match mode {
        OpenMode::Read => libc::O_RDONLY,
        OpenMode::Write => libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
        OpenMode::ReadWrite => libc::O_RDWR | libc::O_CREAT,
        OpenMode::Append => libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND,
        OpenMode::Directory => libc::O_RDONLY | libc::O_DIRECTORY,
    };
    base | libc::O_LARGEFILE | libc::O_CLOEXEC
}

/// A file bound to an event loop, with an explicit read/write cursor.
///
/// Reads and writes are positional at the driver level; `File` tracks
/// the offset itself and advances it per call, so sequential use reads
/// like ordinary file I/O. [`set_offset`] rewinds or seeks.
///
/// [`set_offset`]: File::set_offset
pub struct File {
    fd: Cell<FileFd>,
    offset: Cell<u64>,
    handle: Handle,
}

impl File {
    /// Read chunk size used by the streaming helpers.
    pub const BUF_MAX_SIZE: usize = 1 << 12;

    /// Opens `path` in `mode` with permissions `0o644` when creating.
    pub async fn open<P: AsRef<Path>>(path: P, mode: OpenMode, handle: &Handle) -> Result<File> {
        let fd = open_fd(path.as_ref(), mode, handle).await?;
        Ok(File {
            fd: Cell::new(fd),
            offset: Cell::new(0),
            handle: handle.clone(),
        })
    }

    fn checked_fd(&self) -> Result<FileFd> {
        let fd = self.fd.get();
        if fd == sys::INVALID_FILE {
            return Err(Error::Kernel(std::io::Error::from_raw_os_error(
                bad_fd_errno(),
            )));
        }
        Ok(fd)
    }

    /// Reads at the cursor, advancing it. `Ok(0)` means end of file.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let fd = self.checked_fd()?;
        let res = self.handle.read_at(fd, buf, self.offset.get()).await;
        let n = Error::check(res)? as usize;
        self.offset.set(self.offset.get() + n as u64);
        Ok(n)
    }

    /// Reads at most `n` bytes at the cursor.
    pub async fn read_n(&self, buf: &mut [u8], n: usize) -> Result<usize> {
        self.read(&mut buf[..n]).await
    }

    /// Writes the whole buffer at the cursor, advancing it.
    pub async fn write(&self, mut buf: &[u8]) -> Result<()> {
        let fd = self.checked_fd()?;
        while !buf.is_empty() {
            let res = self.handle.write_at(fd, buf, self.offset.get()).await;
            let n = Error::check(res)? as usize;
            self.offset.set(self.offset.get() + n as u64);
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Moves the cursor.
    pub fn set_offset(&self, offset: u64) {
        self.offset.set(offset);
    }

    /// Reads from the cursor to end of file.
    pub async fn read_to_end(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; Self::BUF_MAX_SIZE];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Closes the file; the descriptor is poisoned.
    pub async fn close(&self) -> Result<()> {
        let fd = self.fd.replace(sys::INVALID_FILE);
        if fd == sys::INVALID_FILE {
            return Ok(());
        }
        Error::check(self.handle.close_file(fd).await).map(drop)
    }
}

/// Reads a whole file asynchronously.
pub async fn read<P: AsRef<Path>>(path: P, handle: &Handle) -> Result<Vec<u8>> {
    let file = File::open(path, OpenMode::Read, handle).await?;
    let out = file.read_to_end().await;
    file.close().await?;
    out
}

/// Writes `content` to `path`, truncating it first.
pub async fn write<P: AsRef<Path>>(path: P, content: &[u8], handle: &Handle) -> Result<()> {
    let file = File::open(path, OpenMode::Write, handle).await?;
    file.write(content).await?;
    file.close().await
}

#[cfg(unix)]
fn bad_fd_errno() -> i32 {
    libc::EBADF
}

#[cfg(windows)]
fn bad_fd_errno() -> i32 {
    // ERROR_INVALID_HANDLE
    6
}

#[cfg(unix)]
async fn open_fd(path: &Path, mode: OpenMode, handle: &Handle) -> Result<FileFd> {
    use std::os::unix::ffi::OsStrExt;
    let path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::Protocol("path contains an interior nul byte"))?;
    let res = handle.openat(path, open_flags(mode), 0o644).await;
    Error::check(res).map(|fd| fd as FileFd)
}

#[cfg(windows)]
async fn open_fd(path: &Path, mode: OpenMode, _handle: &Handle) -> Result<FileFd> {
    use std::os::windows::ffi::OsStrExt;
    use windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE;
    use windows_sys::Win32::Storage::FileSystem::{
        CreateFileW, CREATE_ALWAYS, FILE_APPEND_DATA, FILE_ATTRIBUTE_NORMAL,
        FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED, FILE_GENERIC_READ, FILE_GENERIC_WRITE,
        FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_ALWAYS, OPEN_EXISTING,
    };

    // Opening is synchronous on this platform; only reads and writes
    // go through the completion port.
    let wide: Vec<u16> = path.as_os_str().encode_wide().chain(Some(0)).collect();
    let (access, creation, mut flags) = match mode {
        OpenMode::Read => (FILE_GENERIC_READ, OPEN_EXISTING, 0),
        OpenMode::Write => (FILE_GENERIC_WRITE, CREATE_ALWAYS, 0),
        OpenMode::ReadWrite => (FILE_GENERIC_READ | FILE_GENERIC_WRITE, OPEN_ALWAYS, 0),
        OpenMode::Append => (FILE_APPEND_DATA, OPEN_ALWAYS, 0),
        OpenMode::Directory => (FILE_GENERIC_READ, OPEN_EXISTING, FILE_FLAG_BACKUP_SEMANTICS),
    };
    flags |= FILE_FLAG_OVERLAPPED | FILE_ATTRIBUTE_NORMAL;
    let handle_raw = unsafe {
        CreateFileW(
            wide.as_ptr(),
            access,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            std::ptr::null(),
            creation,
            flags,
            std::ptr::null_mut(),
        )
    };
    if handle_raw == INVALID_HANDLE_VALUE {
        return Err(Error::Kernel(std::io::Error::last_os_error()));
    }
    Ok(handle_raw as FileFd)
}
