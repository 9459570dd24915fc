//! Aligned direct-I/O reads and writes of fixed 8 KiB blocks against the
//! device's command file.
//!
//! The device implements command exchange as memory-mapped "magic sectors"
//! that change content on every read; the kernel's page cache would return
//! stale bytes, so every access here bypasses it with `O_DIRECT`.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use tracing::debug;

use crate::error::{Result, TseError};

/// Size in bytes of a single block exchanged with the device.
pub const BLOCK_SIZE: usize = 8192;

/// One 8 KiB unit of direct I/O against the device file.
pub type Block = [u8; BLOCK_SIZE];

/// Truncated hex dump of a block for debug logging.
fn hex_preview(data: &[u8]) -> String {
    let take = data.len().min(100);
    data[..take]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A heap buffer aligned to the host's direct-I/O alignment requirement.
///
/// `O_DIRECT` rejects unaligned transfer buffers, so this is allocated
/// explicitly rather than relied on from the stack or general heap.
struct AlignedBuffer {
    ptr: *mut u8,
    layout: std::alloc::Layout,
}

// SAFETY: the buffer is never read or written from more than one place at a
// time; ownership moves wholesale between the async caller and the blocking
// task that performs the syscall.
unsafe impl Send for AlignedBuffer {}

impl AlignedBuffer {
    fn new(align: usize) -> io::Result<Self> {
        let layout = std::alloc::Layout::from_size_align(BLOCK_SIZE, align)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: layout has a non-zero size (BLOCK_SIZE).
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "failed to allocate a page-aligned I/O buffer",
            ));
        }
        Ok(Self { ptr, layout })
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() bytes for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr, self.layout.size()) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for layout.size() bytes for the lifetime of self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.layout.size()) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr/layout came from a matching alloc_zeroed call above.
        unsafe { std::alloc::dealloc(self.ptr, self.layout) };
    }
}

/// Reads and writes whole 8 KiB blocks at offset zero of a device file.
///
/// Expressed as a trait so the layers built on top of it (MSC transport,
/// command transport) can be driven in tests by an in-memory double instead
/// of a real device.
pub trait BlockDevice: Send {
    /// Writes exactly [`BLOCK_SIZE`] bytes to offset zero. A short write is a
    /// fatal I/O error, not retried.
    async fn write_block(&mut self, block: Block) -> Result<()>;

    /// Reads exactly [`BLOCK_SIZE`] bytes from offset zero.
    async fn read_block(&mut self) -> Result<Block>;

    /// Releases the handle and buffer. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

fn pwrite_all(fd: RawFd, data: &[u8]) -> Result<()> {
    // SAFETY: fd is a valid, open file descriptor; data is valid for its length.
    let n = unsafe { libc::pwrite(fd, data.as_ptr() as *const libc::c_void, data.len(), 0) };
    if n < 0 {
        return Err(TseError::Io(io::Error::last_os_error()));
    }
    if n as usize != data.len() {
        return Err(TseError::Io(io::Error::new(
            io::ErrorKind::WriteZero,
            "short write to the TSE device file",
        )));
    }
    Ok(())
}

fn pread_all(fd: RawFd, buf: &mut [u8]) -> Result<()> {
    // SAFETY: fd is a valid, open file descriptor; buf is valid for its length.
    let n = unsafe { libc::pread(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if n < 0 {
        return Err(TseError::Io(io::Error::last_os_error()));
    }
    if n as usize != buf.len() {
        return Err(TseError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "short read from the TSE device file",
        )));
    }
    Ok(())
}

fn page_size() -> usize {
    // SAFETY: sysconf with a well-known name is always safe to call.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n > 0 { n as usize } else { 4096 }
}

/// The real, file-backed block adapter.
///
/// Reads and writes are offloaded to a blocking task so the readiness-poll
/// loop above it remains the only suspension point visible to the async
/// runtime; there is still exactly one such offloaded operation in flight at
/// a time per session.
pub struct FileBlockDevice {
    fd: Option<OwnedFd>,
    buffer: Option<AlignedBuffer>,
}

impl FileBlockDevice {
    /// Opens `path` read-write with direct I/O. `path` should be the full
    /// path to the device's `TSE-IO.bin` command file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || Self::open_blocking(&path))
            .await
            .expect("block adapter open task panicked")
    }

    fn open_blocking(path: &Path) -> Result<Self> {
        let buffer = AlignedBuffer::new(page_size())?;

        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            TseError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "device path contains a NUL byte",
            ))
        })?;
        // SAFETY: c_path is a valid, NUL-terminated C string for the call's duration.
        let raw: RawFd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_DIRECT) };
        if raw < 0 {
            return Err(TseError::Io(io::Error::last_os_error()));
        }
        // SAFETY: raw was just returned by a successful open() call and is
        // not owned anywhere else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        Ok(Self {
            fd: Some(fd),
            buffer: Some(buffer),
        })
    }
}

impl BlockDevice for FileBlockDevice {
    async fn write_block(&mut self, block: Block) -> Result<()> {
        debug!(data = %hex_preview(&block), "write block");
        let raw_fd = self
            .fd
            .as_ref()
            .ok_or_else(|| TseError::Io(io::Error::new(io::ErrorKind::NotConnected, "block adapter is closed")))?
            .as_raw_fd();
        let mut buffer = self.buffer.take().expect("block adapter buffer missing");

        let (buffer, result) = tokio::task::spawn_blocking(move || {
            buffer.as_mut_slice().copy_from_slice(&block);
            let result = pwrite_all(raw_fd, buffer.as_slice());
            (buffer, result)
        })
        .await
        .expect("block adapter write task panicked");

        self.buffer = Some(buffer);
        result
    }

    async fn read_block(&mut self) -> Result<Block> {
        let raw_fd = self
            .fd
            .as_ref()
            .ok_or_else(|| TseError::Io(io::Error::new(io::ErrorKind::NotConnected, "block adapter is closed")))?
            .as_raw_fd();
        let mut buffer = self.buffer.take().expect("block adapter buffer missing");

        let (buffer, result) = tokio::task::spawn_blocking(move || {
            let result = pread_all(raw_fd, buffer.as_mut_slice());
            (buffer, result)
        })
        .await
        .expect("block adapter read task panicked");

        result?;
        let mut block: Block = [0u8; BLOCK_SIZE];
        block.copy_from_slice(buffer.as_slice());
        self.buffer = Some(buffer);
        debug!(data = %hex_preview(&block), "read block");
        Ok(block)
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the OwnedFd closes the descriptor; dropping the buffer
        // frees the aligned allocation. Both happen here rather than waiting
        // on the struct's own Drop so close() can be awaited explicitly.
        self.fd.take();
        self.buffer.take();
        Ok(())
    }
}
