//! Platform-specific durable sync
//!
//! The double-write protocol is only as strong as the flush underneath it:
//! a staging batch counts as durable when [`durable_sync`] returns, and only
//! then may the writer overwrite pages in the data file. Each platform maps
//! to the strongest guarantee it offers.

use std::fs::File;
use std::io;
use std::path::Path;

/// Ensures file data has reached persistent storage before returning.
///
/// - Linux: `fdatasync()` (data, not timestamps)
/// - macOS/iOS: `fcntl(F_FULLFSYNC)`; plain `fsync` stops at the drive cache
/// - Windows: `FlushFileBuffers()`
/// - Other: `File::sync_data()`
///
/// May block for a long time under heavy I/O; do not hold locks that other
/// writers need while calling it.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fdatasync on a descriptor borrowed from a live File.
        let result = unsafe { libc::fdatasync(fd) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fcntl(F_FULLFSYNC) on a descriptor borrowed from a live File.
        let result = unsafe { libc::fcntl(fd, libc::F_FULLFSYNC) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        let handle = file.as_raw_handle();
        // SAFETY: FlushFileBuffers on a handle borrowed from a live File.
        let result = unsafe { FlushFileBuffers(handle as *mut _) };
        if result != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "windows")))]
    {
        file.sync_data()
    }
}

/// Make a newly created file's directory entry durable.
///
/// Staging files are created once per writer; without this a crash right
/// after creation could lose the file even though its contents were synced.
/// A no-op on Windows, where directories cannot be opened as files.
pub fn sync_directory(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir)?;
        handle.sync_all()
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}
