//! Serial console plumbing.
//!
//! A console is a pair of pipes backing the VM's virtio serial port: the
//! guest writes output into one (host holds the read end), the host writes
//! input into the other (guest holds the read end). Exactly one reader of
//! the guest-output pipe ever exists (the broker), and the attached
//! client drives input through the broker's Unix socket, never the pipe
//! directly.

mod broker;
mod client;
mod escape;

pub use broker::{ConsoleBroker, ALREADY_ATTACHED_MSG};
pub use client::ConsoleClient;
pub use escape::{EscapeFilter, Filtered, ESCAPE_HELP};

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use tokio::net::unix::pipe;
use tokio_util::sync::CancellationToken;

use crate::errors::{FaizeError, FaizeResult};

/// Host ends of the console pipes. Consumed by the broker.
pub struct ConsolePipes {
    /// Guest output (host reads).
    pub output: pipe::Receiver,
    /// Guest input (host writes).
    pub input: pipe::Sender,
}

/// Guest ends of the console pipes, handed to the serial device.
pub struct GuestConsole {
    /// Guest reads its input from this end.
    pub read_fd: OwnedFd,
    /// Guest writes its output to this end.
    pub write_fd: OwnedFd,
}

/// Detach signal shared between the broker and the session manager.
///
/// Cancelling is idempotent; once fired, the broker shuts down and every
/// subsequent attach observes an immediate EOF on the socket.
#[derive(Debug, Clone)]
pub struct ConsoleHandle {
    done: CancellationToken,
}

impl ConsoleHandle {
    pub fn new() -> Self {
        Self {
            done: CancellationToken::new(),
        }
    }

    /// Signal console shutdown. Safe to call more than once.
    pub fn detach(&self) {
        self.done.cancel();
    }

    pub fn is_detached(&self) -> bool {
        self.done.is_cancelled()
    }

    pub async fn detached(&self) {
        self.done.cancelled().await;
    }
}

impl Default for ConsoleHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Create the console pipe pair plus its detach handle.
pub fn create_console() -> FaizeResult<(ConsolePipes, GuestConsole, ConsoleHandle)> {
    // Guest output: guest writes, host reads.
    let (out_read, out_write) = raw_pipe()?;
    // Guest input: host writes, guest reads.
    let (in_read, in_write) = raw_pipe()?;

    set_nonblocking(&out_read)?;
    set_nonblocking(&in_write)?;

    let output = pipe::Receiver::from_owned_fd(out_read)
        .map_err(|e| FaizeError::Console(format!("failed to register console pipe: {e}")))?;
    let input = pipe::Sender::from_owned_fd(in_write)
        .map_err(|e| FaizeError::Console(format!("failed to register console pipe: {e}")))?;

    Ok((
        ConsolePipes { output, input },
        GuestConsole {
            read_fd: in_read,
            write_fd: out_write,
        },
        ConsoleHandle::new(),
    ))
}

/// `(read end, write end)` of a fresh pipe.
fn raw_pipe() -> FaizeResult<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    // SAFETY: pipe() writes two valid FDs into the array.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(FaizeError::Console(format!(
            "failed to create console pipe: {}",
            std::io::Error::last_os_error()
        )));
    }
    // SAFETY: fds[0] / fds[1] are the valid read/write ends from pipe().
    unsafe {
        Ok((
            OwnedFd::from_raw_fd(fds[0]),
            OwnedFd::from_raw_fd(fds[1]),
        ))
    }
}

fn set_nonblocking(fd: &OwnedFd) -> FaizeResult<()> {
    // SAFETY: fd is a valid open pipe end owned by the caller.
    let res = unsafe {
        let flags = libc::fcntl(fd.as_raw_fd(), libc::F_GETFL);
        if flags < 0 {
            -1
        } else {
            libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK)
        }
    };
    if res < 0 {
        return Err(FaizeError::Console(format!(
            "failed to set console pipe non-blocking: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::IntoRawFd;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Write to a raw fd the way the guest side of the serial port would.
    fn guest_write(fd: OwnedFd, data: &[u8]) {
        let raw = fd.into_raw_fd();
        // SAFETY: raw is a valid pipe write end; we close it right after.
        unsafe {
            libc::write(raw, data.as_ptr() as *const libc::c_void, data.len());
            libc::close(raw);
        }
    }

    #[tokio::test]
    async fn test_guest_output_reaches_host_reader() {
        let (mut pipes, guest, _handle) = create_console().unwrap();
        guest_write(guest.write_fd, b"boot ok\n");

        let mut buf = [0u8; 64];
        let n = pipes.output.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"boot ok\n");

        // Guest side closed: reader observes EOF.
        let n = pipes.output.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_host_input_reaches_guest_reader() {
        let (mut pipes, guest, _handle) = create_console().unwrap();
        pipes.input.write_all(b"ls\n").await.unwrap();

        let mut buf = [0u8; 8];
        let raw = guest.read_fd.as_raw_fd();
        // SAFETY: raw is a valid pipe read end held by `guest`.
        let n = unsafe { libc::read(raw, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        assert_eq!(n, 3);
        assert_eq!(&buf[..3], b"ls\n");
    }

    #[test]
    fn test_detach_is_idempotent() {
        let handle = ConsoleHandle::new();
        assert!(!handle.is_detached());
        handle.detach();
        handle.detach();
        assert!(handle.is_detached());
    }
}
