//! Single-reader console broker over a Unix socket.
//!
//! One long-lived reader task owns the guest-output pipe and writes to
//! whichever client is current; detached output is discarded, never
//! buffered. The accept loop admits at most one client at a time;
//! a second connection is told `ERROR: session already attached` and
//! closed. This replaces the per-attach copy-task design, whose orphaned
//! readers kept consuming console output after a detach and starved the
//! next client.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::console::{ConsoleHandle, ConsolePipes};
use crate::errors::{FaizeError, FaizeResult};

/// Sent to a connection attempt while another client is attached.
pub const ALREADY_ATTACHED_MSG: &str = "ERROR: session already attached\n";

const READ_BLOCK: usize = 4096;

struct ClientSlot {
    id: u64,
    writer: OwnedWriteHalf,
}

struct Shared {
    socket_path: PathBuf,
    /// The current attached client; `None` while detached.
    client: tokio::sync::Mutex<Option<ClientSlot>>,
    /// Host→guest pipe, shared by successive per-client input tasks.
    input: tokio::sync::Mutex<pipe::Sender>,
    /// Broker shutdown signal.
    done: CancellationToken,
    /// Console detach handle; cancelled on guest EOF so the session
    /// manager observes the console closing.
    console: ConsoleHandle,
    tracker: TaskTracker,
    stopped: AtomicBool,
    next_client_id: AtomicU64,
}

impl Shared {
    /// Idempotent teardown: stop every task and remove the socket file.
    fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.done.cancel();
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(error = %e, "failed to remove console socket");
            }
        }
        tracing::debug!(socket = %self.socket_path.display(), "console broker stopped");
    }
}

/// Unix-socket proxy for one session's console.
pub struct ConsoleBroker {
    shared: Arc<Shared>,
}

impl ConsoleBroker {
    /// Bind the socket and spawn the reader, accept, and EOF-monitor tasks.
    pub fn start(
        socket_path: &Path,
        pipes: ConsolePipes,
        console: ConsoleHandle,
    ) -> FaizeResult<Self> {
        if let Some(dir) = socket_path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| {
                FaizeError::Console(format!("failed to create socket directory: {e}"))
            })?;
        }

        // A stale socket from a crashed process would block the bind.
        match std::fs::remove_file(socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(FaizeError::Console(format!(
                    "failed to remove stale socket: {e}"
                )));
            }
        }

        let listener = UnixListener::bind(socket_path)
            .map_err(|e| FaizeError::Console(format!("failed to bind console socket: {e}")))?;
        tracing::debug!(socket = %socket_path.display(), "console broker listening");

        let shared = Arc::new(Shared {
            socket_path: socket_path.to_path_buf(),
            client: tokio::sync::Mutex::new(None),
            input: tokio::sync::Mutex::new(pipes.input),
            done: CancellationToken::new(),
            console,
            tracker: TaskTracker::new(),
            stopped: AtomicBool::new(false),
            next_client_id: AtomicU64::new(1),
        });

        shared
            .tracker
            .spawn(reader_loop(pipes.output, shared.clone()));
        shared.tracker.spawn(accept_loop(listener, shared.clone()));
        shared.tracker.spawn(monitor_console(shared.clone()));

        Ok(Self { shared })
    }

    pub fn socket_path(&self) -> &Path {
        &self.shared.socket_path
    }

    /// Stop the broker and wait for every task to finish. Idempotent.
    pub async fn stop(&self) {
        self.shared.shutdown();
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
    }
}

/// The single reader of the guest-output pipe. Bytes go to the current
/// client; with no client attached they are dropped by design.
async fn reader_loop(mut output: pipe::Receiver, shared: Arc<Shared>) {
    let mut buf = [0u8; READ_BLOCK];
    loop {
        let n = tokio::select! {
            _ = shared.done.cancelled() => return,
            res = output.read(&mut buf) => match res {
                Ok(0) => {
                    tracing::debug!("console EOF, shutting down broker");
                    shared.console.detach();
                    shared.shutdown();
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(error = %e, "console read error");
                    shared.console.detach();
                    shared.shutdown();
                    return;
                }
            },
        };

        let mut slot = shared.client.lock().await;
        if let Some(client) = slot.as_mut() {
            if let Err(e) = client.writer.write_all(&buf[..n]).await {
                // Client likely disconnected; its input task cleans up.
                tracing::debug!(error = %e, "client write failed");
            }
        }
    }
}

/// Admit one client at a time; reject the rest.
async fn accept_loop(listener: UnixListener, shared: Arc<Shared>) {
    loop {
        let conn = tokio::select! {
            _ = shared.done.cancelled() => return,
            res = listener.accept() => match res {
                Ok((conn, _)) => conn,
                Err(e) => {
                    tracing::debug!(error = %e, "accept error");
                    continue;
                }
            },
        };

        let mut slot = shared.client.lock().await;
        if slot.is_some() {
            drop(slot);
            reject(conn).await;
            continue;
        }

        let id = shared.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = conn.into_split();
        *slot = Some(ClientSlot {
            id,
            writer: write_half,
        });
        drop(slot);

        tracing::debug!(client = id, "client attached to console broker");
        shared
            .tracker
            .spawn(client_input(read_half, shared.clone(), id));
    }
}

async fn reject(mut conn: UnixStream) {
    let _ = conn.write_all(ALREADY_ATTACHED_MSG.as_bytes()).await;
    let _ = conn.shutdown().await;
    tracing::debug!("rejected connection: session already attached");
}

/// Copy one client's input to the console. On exit (disconnect, console
/// failure, or broker shutdown) clears the client slot if it still points
/// at this client, which also closes the connection.
async fn client_input(mut read_half: OwnedReadHalf, shared: Arc<Shared>, id: u64) {
    let mut buf = [0u8; READ_BLOCK];
    loop {
        let n = tokio::select! {
            _ = shared.done.cancelled() => break,
            res = read_half.read(&mut buf) => match res {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(error = %e, client = id, "client read error");
                    break;
                }
            },
        };

        let mut input = shared.input.lock().await;
        if let Err(e) = input.write_all(&buf[..n]).await {
            tracing::debug!(error = %e, client = id, "console write error");
            break;
        }
    }

    let mut slot = shared.client.lock().await;
    if slot.as_ref().map(|c| c.id) == Some(id) {
        *slot = None;
    }
    tracing::debug!(client = id, "client detached from console broker");
}

/// Shut the broker down when the console is detached elsewhere (VM stop).
async fn monitor_console(shared: Arc<Shared>) {
    tokio::select! {
        _ = shared.done.cancelled() => {}
        _ = shared.console.detached() => {
            tracing::debug!("console detached, shutting down broker");
            shared.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::create_console;
    use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};
    use tempfile::tempdir;
    use tokio::time::{timeout, Duration};

    struct Fixture {
        broker: ConsoleBroker,
        guest_out: Option<OwnedFd>,
        guest_in: OwnedFd,
        handle: ConsoleHandle,
        socket: PathBuf,
        _dir: tempfile::TempDir,
    }

    fn start_broker() -> Fixture {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("test.sock");
        let (pipes, guest, handle) = create_console().unwrap();
        let broker = ConsoleBroker::start(&socket, pipes, handle.clone()).unwrap();
        Fixture {
            broker,
            guest_out: Some(guest.write_fd),
            guest_in: guest.read_fd,
            handle,
            socket,
            _dir: dir,
        }
    }

    fn guest_emit(fd: &OwnedFd, data: &[u8]) {
        // SAFETY: fd is the valid guest write end of the console pipe.
        unsafe {
            libc::write(fd.as_raw_fd(), data.as_ptr() as *const libc::c_void, data.len());
        }
    }

    fn guest_read(fd: &OwnedFd, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        // SAFETY: fd is the valid guest read end of the console pipe.
        let n = unsafe {
            libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        assert!(n >= 0);
        buf.truncate(n as usize);
        buf
    }

    async fn read_some(conn: &mut UnixStream) -> Vec<u8> {
        let mut buf = [0u8; 256];
        let n = timeout(Duration::from_secs(2), conn.read(&mut buf))
            .await
            .expect("read timed out")
            .unwrap();
        buf[..n].to_vec()
    }

    #[tokio::test]
    async fn test_single_client_receives_output() {
        let fx = start_broker();
        let mut conn = UnixStream::connect(&fx.socket).await.unwrap();
        // Give the accept loop a beat to publish the client.
        tokio::time::sleep(Duration::from_millis(50)).await;

        guest_emit(fx.guest_out.as_ref().unwrap(), b"hello from guest");
        assert_eq!(read_some(&mut conn).await, b"hello from guest");

        fx.broker.stop().await;
    }

    #[tokio::test]
    async fn test_second_client_rejected_with_error() {
        let fx = start_broker();
        let _first = UnixStream::connect(&fx.socket).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut second = UnixStream::connect(&fx.socket).await.unwrap();
        let msg = read_some(&mut second).await;
        assert_eq!(msg, ALREADY_ATTACHED_MSG.as_bytes());

        // And then EOF.
        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(2), second.read(&mut buf))
            .await
            .expect("read timed out")
            .unwrap();
        assert_eq!(n, 0);

        fx.broker.stop().await;
    }

    #[tokio::test]
    async fn test_client_input_reaches_console() {
        let fx = start_broker();
        let mut conn = UnixStream::connect(&fx.socket).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        conn.write_all(b"echo hi\n").await.unwrap();
        conn.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(guest_read(&fx.guest_in, 64), b"echo hi\n");

        fx.broker.stop().await;
    }

    #[tokio::test]
    async fn test_detached_output_is_dropped_not_replayed() {
        let fx = start_broker();

        // No client attached: these bytes must vanish.
        guest_emit(fx.guest_out.as_ref().unwrap(), b"lost output");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut conn = UnixStream::connect(&fx.socket).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        guest_emit(fx.guest_out.as_ref().unwrap(), b"fresh");

        assert_eq!(read_some(&mut conn).await, b"fresh");
        fx.broker.stop().await;
    }

    #[tokio::test]
    async fn test_reattach_after_disconnect() {
        let fx = start_broker();

        {
            let mut first = UnixStream::connect(&fx.socket).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            guest_emit(fx.guest_out.as_ref().unwrap(), b"one");
            assert_eq!(read_some(&mut first).await, b"one");
        } // first client drops

        // Wait for the input task to clear the slot.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut second = UnixStream::connect(&fx.socket).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        guest_emit(fx.guest_out.as_ref().unwrap(), b"two");
        assert_eq!(read_some(&mut second).await, b"two");

        fx.broker.stop().await;
    }

    #[tokio::test]
    async fn test_console_eof_stops_broker_and_removes_socket() {
        let mut fx = start_broker();

        // Closing the guest write end delivers EOF to the reader.
        let raw = fx.guest_out.take().unwrap().into_raw_fd();
        // SAFETY: raw is the valid guest write end, closed exactly once.
        unsafe { libc::close(raw) };

        timeout(Duration::from_secs(2), fx.handle.detached())
            .await
            .expect("console EOF should trigger detach");
        fx.broker.stop().await;
        assert!(!fx.socket.exists(), "socket file must be removed");
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let fx = start_broker();
        fx.broker.stop().await;
        fx.broker.stop().await;
        assert!(!fx.socket.exists());
    }

    #[tokio::test]
    async fn test_stop_unblocks_attached_client() {
        let fx = start_broker();
        let mut conn = UnixStream::connect(&fx.socket).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        fx.broker.stop().await;

        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(2), conn.read(&mut buf))
            .await
            .expect("client should observe EOF")
            .unwrap();
        assert_eq!(n, 0);
    }
}
