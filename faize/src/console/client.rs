//! Console attach client.
//!
//! Connects to a session's broker socket and bridges it to the local
//! stdin/stdout. Input passes through the escape filter (`~.` detaches)
//! and, when a clipboard directory is wired, a Ctrl+V tap that refreshes
//! the shared clipboard files before the byte is forwarded. Terminal
//! resizes are propagated by rewriting the bootstrap `termsize` file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::bootstrap::write_term_size_at;
use crate::console::escape::EscapeFilter;
use crate::errors::{FaizeError, FaizeResult};

/// Window for the broker's immediate `ERROR:` rejection after connect.
const INITIAL_READ_WINDOW: Duration = Duration::from_millis(100);

/// Ctrl+V: refresh the shared clipboard before forwarding.
const CTRL_V: u8 = 0x16;

pub struct ConsoleClient {
    stream: UnixStream,
    termsize_path: Option<PathBuf>,
    clipboard_dir: Option<PathBuf>,
}

impl ConsoleClient {
    /// Dial the broker socket.
    pub async fn connect(socket_path: &Path) -> FaizeResult<Self> {
        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            FaizeError::Console(format!("failed to connect to console socket: {e}"))
        })?;
        Ok(Self {
            stream,
            termsize_path: None,
            clipboard_dir: None,
        })
    }

    /// Wire terminal-resize propagation to the given `termsize` file.
    pub fn set_termsize_path(&mut self, path: PathBuf) {
        self.termsize_path = Some(path);
    }

    /// Wire Ctrl+V clipboard refresh to the given clipboard directory.
    pub fn set_clipboard_dir(&mut self, path: PathBuf) {
        self.clipboard_dir = Some(path);
    }

    /// Bridge the process stdin/stdout to the console.
    ///
    /// The caller is responsible for putting the terminal into raw mode.
    pub async fn attach(self) -> FaizeResult<()> {
        let resize_task = self.termsize_path.clone().map(spawn_resize_writer);
        let result = self
            .attach_io(tokio::io::stdin(), tokio::io::stdout())
            .await;
        if let Some(task) = resize_task {
            task.abort();
        }
        result
    }

    /// Bridge explicit input/output streams to the console until the
    /// stream ends or the operator detaches. Returns
    /// [`FaizeError::UserDetach`] on `~.`.
    pub async fn attach_io<R, W>(mut self, stdin: R, mut stdout: W) -> FaizeResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        // The broker answers a doomed connection immediately; anything else
        // arriving this early is ordinary console output.
        let mut initial = [0u8; 64];
        match tokio::time::timeout(INITIAL_READ_WINDOW, self.stream.read(&mut initial)).await {
            Ok(Ok(0)) => return Ok(()),
            Ok(Ok(n)) => {
                let msg = String::from_utf8_lossy(&initial[..n]);
                if msg.starts_with("ERROR:") {
                    return Err(FaizeError::Console(msg.trim().to_string()));
                }
                stdout.write_all(&initial[..n]).await?;
                stdout.flush().await?;
            }
            Ok(Err(e)) => {
                return Err(FaizeError::Console(format!(
                    "failed to read from console: {e}"
                )));
            }
            Err(_) => {} // no immediate data; proceed
        }

        attach_loop(self.stream, stdin, stdout, self.clipboard_dir).await
    }
}

async fn attach_loop<R, W>(
    stream: UnixStream,
    mut stdin: R,
    mut stdout: W,
    clipboard_dir: Option<PathBuf>,
) -> FaizeResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (mut from_console, mut to_console) = stream.into_split();
    let mut filter = EscapeFilter::new();
    let mut console_buf = [0u8; 4096];
    let mut stdin_buf = [0u8; 4096];

    loop {
        tokio::select! {
            res = from_console.read(&mut console_buf) => {
                let n = res.map_err(|e| {
                    FaizeError::Console(format!("console read failed: {e}"))
                })?;
                if n == 0 {
                    return Ok(()); // guest side closed
                }
                stdout.write_all(&console_buf[..n]).await?;
                stdout.flush().await?;
            }
            res = stdin.read(&mut stdin_buf) => {
                let n = res?;
                if n == 0 {
                    return Ok(()); // stdin closed
                }
                let batch = &stdin_buf[..n];

                // Refresh the shared clipboard once per batch on Ctrl+V so
                // the guest-side paste shims serve current content.
                if let Some(dir) = &clipboard_dir {
                    if batch.contains(&CTRL_V) {
                        if let Err(e) = crate::relay::sync_clipboard_to_dir(dir).await {
                            tracing::warn!(error = %e, "clipboard sync failed");
                        }
                    }
                }

                let out = filter.feed(batch);
                if !out.echo.is_empty() {
                    stdout.write_all(&out.echo).await?;
                    stdout.flush().await?;
                }
                if !out.forward.is_empty() {
                    to_console.write_all(&out.forward).await.map_err(|e| {
                        FaizeError::Console(format!("console write failed: {e}"))
                    })?;
                }
                if out.detach {
                    return Err(FaizeError::UserDetach);
                }
            }
        }
    }
}

/// Propagate SIGWINCH by rewriting the shared `termsize` file; the guest
/// watcher applies it to the first PTY slave.
fn spawn_resize_writer(termsize_path: PathBuf) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigwinch =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change()) {
                Ok(sig) => sig,
                Err(e) => {
                    tracing::debug!(error = %e, "failed to install SIGWINCH handler");
                    return;
                }
            };

        while sigwinch.recv().await.is_some() {
            if let Some((cols, rows)) = term_size::dimensions() {
                if cols > 0 && rows > 0 {
                    if let Err(e) =
                        write_term_size_at(&termsize_path, cols as u16, rows as u16)
                    {
                        tracing::debug!(error = %e, "failed to write terminal size");
                    }
                }
            }
        }
    })
}
