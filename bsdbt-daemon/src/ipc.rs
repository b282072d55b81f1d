/*!
 * IPC Server for bsdbtd
 * JSON lines over a Unix socket, one client at a time
 */

use std::fs;
use std::future::Future;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::dispatcher::{Dispatcher, Outcome};
use crate::process::CommandRunner;
use crate::protocol::{ProtocolError, Request, Response};

/// Longest request line accepted before the stream is considered corrupt.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Owner and group read/write, nothing for others.
const SOCKET_MODE: u32 = 0o660;

/// Pause after a failed `accept` so a persistent error such as EMFILE does
/// not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, PartialEq, Eq)]
pub enum ReadLine {
    Line(String),
    NotUtf8,
    Oversized,
    Eof,
}

/// Reads one newline-terminated line of at most `MAX_LINE_BYTES`.
/// A final line without a newline is still returned.
pub async fn read_line_bounded<R>(reader: &mut R) -> io::Result<ReadLine>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = (MAX_LINE_BYTES + 1) as u64;
    let n = reader.take(limit).read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(ReadLine::Eof);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() > MAX_LINE_BYTES {
        return Ok(ReadLine::Oversized);
    }
    Ok(String::from_utf8(buf).map_or(ReadLine::NotUtf8, ReadLine::Line))
}

/// How a client session ended.
#[derive(Debug, PartialEq, Eq)]
enum Session {
    Closed,
    ShutdownRequested,
    Terminated,
}

pub struct IpcServer<R> {
    listener: UnixListener,
    socket_path: PathBuf,
    dispatcher: Dispatcher<R>,
}

impl<R: CommandRunner> IpcServer<R> {
    /// Creates the socket, replacing a stale one, and restricts it to
    /// owner and group.
    ///
    /// Fails if another daemon still answers on `socket_path`.
    pub fn bind(socket_path: &Path, dispatcher: Dispatcher<R>) -> Result<Self> {
        if fs::symlink_metadata(socket_path).is_ok() {
            if std::os::unix::net::UnixStream::connect(socket_path).is_ok() {
                bail!(
                    "another daemon is already listening on {}",
                    socket_path.display()
                );
            }
            tracing::warn!(path = %socket_path.display(), "Removing stale socket");
            fs::remove_file(socket_path)
                .with_context(|| format!("failed to remove {}", socket_path.display()))?;
        }

        let listener = bind_restricted(socket_path)?;
        let server = Self {
            listener,
            socket_path: socket_path.to_path_buf(),
            dispatcher,
        };

        tracing::info!(path = %socket_path.display(), "Socket bound with mode 0660");
        Ok(server)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Serves clients one after another until a client sends `shutdown` or
    /// `shutdown` resolves. The socket file is removed when the server drops.
    pub async fn run<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        tracing::info!("IPC server listening for connections...");

        loop {
            let stream = tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Termination signal received");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            tracing::info!("Client connected");
            match self.serve_client(stream, shutdown.as_mut()).await {
                Session::Closed => tracing::info!("Client disconnected"),
                Session::ShutdownRequested => break,
                Session::Terminated => {
                    tracing::info!("Termination signal received, closing client");
                    break;
                }
            }
        }

        tracing::info!("IPC server stopped");
        Ok(())
    }

    /// Handles requests from one client strictly in order. Other clients
    /// wait in the listen backlog until this returns.
    async fn serve_client<F>(&mut self, stream: UnixStream, mut shutdown: Pin<&mut F>) -> Session
    where
        F: Future<Output = ()>,
    {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        loop {
            let read = tokio::select! {
                _ = &mut shutdown => return Session::Terminated,
                read = read_line_bounded(&mut reader) => read,
            };

            let line = match read {
                Ok(ReadLine::Line(line)) => line,
                Ok(ReadLine::Eof) => return Session::Closed,
                Ok(ReadLine::NotUtf8) => {
                    let response = Dispatcher::<R>::reject(ProtocolError::InvalidUtf8);
                    if write_response(&mut write_half, &response).await.is_err() {
                        return Session::Closed;
                    }
                    continue;
                }
                Ok(ReadLine::Oversized) => {
                    let response = Dispatcher::<R>::reject(ProtocolError::Oversized(MAX_LINE_BYTES));
                    let _ = write_response(&mut write_half, &response).await;
                    return Session::Closed;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Read error, dropping client");
                    return Session::Closed;
                }
            };

            if line.trim().is_empty() {
                continue;
            }
            tracing::debug!(request = %line, "Received request");

            let outcome = match Request::decode(&line) {
                Ok(request) => self.dispatcher.dispatch(request).await,
                Err(e) => Outcome::Reply(Dispatcher::<R>::reject(e)),
            };
            let (response, stop) = outcome.into_parts();

            if let Err(e) = write_response(&mut write_half, &response).await {
                tracing::warn!(error = %e, "Client went away before the response was sent");
                return if stop {
                    Session::ShutdownRequested
                } else {
                    Session::Closed
                };
            }

            if stop {
                return Session::ShutdownRequested;
            }
        }
    }
}

/// Binds inside a private staging directory, sets the final mode, then
/// renames the socket into place. The socket is never reachable at
/// `socket_path` with umask-derived permissions.
fn bind_restricted(socket_path: &Path) -> Result<UnixListener> {
    let parent = match socket_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let staging = tempfile::Builder::new()
        .prefix(".bsdbtd-")
        .tempdir_in(parent)
        .with_context(|| format!("failed to create staging directory in {}", parent.display()))?;
    let staged = staging.path().join("sock");

    let listener = UnixListener::bind(&staged)
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;
    fs::set_permissions(&staged, fs::Permissions::from_mode(SOCKET_MODE))
        .with_context(|| format!("failed to chmod {}", socket_path.display()))?;
    fs::rename(&staged, socket_path)
        .with_context(|| format!("failed to move socket to {}", socket_path.display()))?;

    Ok(listener)
}

impl<R> Drop for IpcServer<R> {
    fn drop(&mut self) {
        if fs::remove_file(&self.socket_path).is_ok() {
            tracing::info!(path = %self.socket_path.display(), "Cleaned up socket");
        }
    }
}

async fn write_response<W>(writer: &mut W, response: &Response) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line = response.to_line().map_err(io::Error::other)?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}
