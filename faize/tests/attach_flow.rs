//! Integration tests for the console broker + attach client pair.
//!
//! These drive the real Unix socket path: a broker owning the console
//! pipes, clients connecting through `ConsoleClient`, and the guest side
//! simulated on the raw pipe fds.

use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};
use std::path::PathBuf;

use faize::console::{create_console, ConsoleBroker, ConsoleClient, ALREADY_ATTACHED_MSG};
use faize::errors::FaizeError;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Duration};

// ============================================================================
// TEST FIXTURES
// ============================================================================

struct Fixture {
    broker: ConsoleBroker,
    guest_out: OwnedFd,
    guest_in: OwnedFd,
    socket: PathBuf,
    _dir: TempDir,
}

fn start_broker() -> Fixture {
    // Sockets in /tmp directly: macOS temp paths can exceed the ~104-char
    // limit on sun_path.
    let dir = TempDir::new_in("/tmp").expect("failed to create temp dir");
    let socket = dir.path().join("console.sock");
    let (pipes, guest, handle) = create_console().unwrap();
    let broker = ConsoleBroker::start(&socket, pipes, handle).unwrap();
    Fixture {
        broker,
        guest_out: guest.write_fd,
        guest_in: guest.read_fd,
        socket,
        _dir: dir,
    }
}

fn guest_emit(fd: &OwnedFd, data: &[u8]) {
    // SAFETY: fd is the valid guest write end of the console output pipe.
    unsafe {
        libc::write(
            fd.as_raw_fd(),
            data.as_ptr() as *const libc::c_void,
            data.len(),
        );
    }
}

fn guest_read(fd: &OwnedFd, max: usize) -> Vec<u8> {
    let mut buf = vec![0u8; max];
    // SAFETY: fd is the valid guest read end of the console input pipe.
    let n = unsafe {
        libc::read(
            fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    assert!(n >= 0, "guest read failed");
    buf.truncate(n as usize);
    buf
}

// ============================================================================
// ESCAPE DETACH
// ============================================================================

/// `hi\n~.` typed at an attached client: the guest sees `hi\n`, attach
/// returns the detach sentinel, and the connection closes.
#[tokio::test]
async fn escape_detach_returns_sentinel_and_forwards_prefix() {
    let fx = start_broker();

    let (mut stdin_tx, stdin_rx) = tokio::io::duplex(64);
    let client = ConsoleClient::connect(&fx.socket).await.unwrap();

    let attach = tokio::spawn(async move { client.attach_io(stdin_rx, Vec::new()).await });

    // Let the accept loop publish the client before typing.
    tokio::time::sleep(Duration::from_millis(100)).await;
    stdin_tx.write_all(b"hi\n~.").await.unwrap();

    let result = timeout(Duration::from_secs(2), attach)
        .await
        .expect("attach should return on ~.")
        .unwrap();
    assert!(matches!(result, Err(FaizeError::UserDetach)));

    assert_eq!(guest_read(&fx.guest_in, 64), b"hi\n");
    fx.broker.stop().await;
}

/// After a detach the session is still attachable; the broker kept its
/// single reader alive throughout.
#[tokio::test]
async fn reattach_after_escape_detach_sees_new_output() {
    let fx = start_broker();

    {
        let (mut stdin_tx, stdin_rx) = tokio::io::duplex(64);
        let client = ConsoleClient::connect(&fx.socket).await.unwrap();
        let attach = tokio::spawn(async move { client.attach_io(stdin_rx, Vec::new()).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        stdin_tx.write_all(b"~.").await.unwrap();
        let result = timeout(Duration::from_secs(2), attach).await.unwrap().unwrap();
        assert!(matches!(result, Err(FaizeError::UserDetach)));
    }

    // Output while detached is dropped.
    guest_emit(&fx.guest_out, b"dropped");
    tokio::time::sleep(Duration::from_millis(150)).await;

    let mut conn = tokio::net::UnixStream::connect(&fx.socket).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    guest_emit(&fx.guest_out, b"visible");

    let mut buf = [0u8; 64];
    let n = timeout(Duration::from_secs(2), conn.read(&mut buf))
        .await
        .expect("reattached client should see new output")
        .unwrap();
    assert_eq!(&buf[..n], b"visible");

    fx.broker.stop().await;
}

// ============================================================================
// SECOND-CLIENT REJECTION
// ============================================================================

/// With a client attached, a second connection reads the ERROR line and
/// then EOF; the first client is undisturbed.
#[tokio::test]
async fn second_client_rejected_while_first_attached() {
    let fx = start_broker();

    let (_stdin_tx, stdin_rx) = tokio::io::duplex(64);
    let first = ConsoleClient::connect(&fx.socket).await.unwrap();
    let first_attach = tokio::spawn(async move { first.attach_io(stdin_rx, Vec::new()).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = ConsoleClient::connect(&fx.socket).await.unwrap();
    let err = second
        .attach_io(tokio::io::empty(), Vec::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("session already attached"));

    // Raw-socket view: exact message, then EOF.
    let mut raw = tokio::net::UnixStream::connect(&fx.socket).await.unwrap();
    let mut buf = [0u8; 64];
    let n = timeout(Duration::from_secs(2), raw.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], ALREADY_ATTACHED_MSG.as_bytes());
    let n = timeout(Duration::from_secs(2), raw.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0, "rejected connection must observe EOF");

    fx.broker.stop().await;
    let _ = timeout(Duration::from_secs(2), first_attach).await;
}

// ============================================================================
// BROKER SHUTDOWN
// ============================================================================

/// Stopping the broker unblocks an attached client with a clean exit and
/// removes the socket, so later attaches fail at connect.
#[tokio::test]
async fn stop_unblocks_client_and_removes_socket() {
    let fx = start_broker();

    let (_stdin_tx, stdin_rx) = tokio::io::duplex(64);
    let client = ConsoleClient::connect(&fx.socket).await.unwrap();
    let attach = tokio::spawn(async move { client.attach_io(stdin_rx, Vec::new()).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    fx.broker.stop().await;

    let result = timeout(Duration::from_secs(2), attach)
        .await
        .expect("attach should unblock on broker stop")
        .unwrap();
    assert!(result.is_ok(), "broker stop reads as clean EOF: {result:?}");

    assert!(!fx.socket.exists());
    assert!(ConsoleClient::connect(&fx.socket).await.is_err());
}

/// Guest closing its side of the console (poweroff) tears the broker down.
#[tokio::test]
async fn guest_eof_shuts_down_broker() {
    let fx = start_broker();

    let (_stdin_tx, stdin_rx) = tokio::io::duplex(64);
    let client = ConsoleClient::connect(&fx.socket).await.unwrap();
    let attach = tokio::spawn(async move { client.attach_io(stdin_rx, Vec::new()).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let raw = fx.guest_out.into_raw_fd();
    // SAFETY: raw is the guest write end, closed exactly once here.
    unsafe { libc::close(raw) };

    let result = timeout(Duration::from_secs(2), attach)
        .await
        .expect("attach should unblock on guest EOF")
        .unwrap();
    assert!(result.is_ok());

    fx.broker.stop().await;
    assert!(!fx.socket.exists());
}

// ============================================================================
// BIDIRECTIONAL TRAFFIC
// ============================================================================

/// Guest output reaches the client's stdout; client keystrokes reach the
/// guest; escapes are stripped from the forwarded stream.
#[tokio::test]
async fn full_duplex_with_escape_stripping() {
    let fx = start_broker();

    let (mut stdin_tx, stdin_rx) = tokio::io::duplex(256);
    let (mut stdout_rx, stdout_tx) = tokio::io::duplex(256);
    let client = ConsoleClient::connect(&fx.socket).await.unwrap();
    let attach = tokio::spawn(async move { client.attach_io(stdin_rx, stdout_tx).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    guest_emit(&fx.guest_out, b"$ ");
    let mut buf = [0u8; 64];
    let n = timeout(Duration::from_secs(2), stdout_rx.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"$ ");

    // ~~ collapses to a literal tilde on the wire.
    stdin_tx.write_all(b"echo\n~~ok\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(guest_read(&fx.guest_in, 64), b"echo\n~ok\n");

    stdin_tx.write_all(b"~.").await.unwrap();
    let result = timeout(Duration::from_secs(2), attach).await.unwrap().unwrap();
    assert!(matches!(result, Err(FaizeError::UserDetach)));

    fx.broker.stop().await;
}
