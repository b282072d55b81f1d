/*!
 * bsdbtd Client
 * Sends one request over the daemon socket and waits for its response
 */

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::protocol::{Request, Response};

pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub async fn send_request(&self, request: &Request) -> Result<Response> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("cannot reach bsdbtd at {}", self.socket_path.display()))?;
        let (read_half, mut write_half) = stream.into_split();

        let mut line = request.to_json().to_string();
        line.push('\n');
        write_half.write_all(line.as_bytes()).await?;
        write_half.flush().await?;

        let mut reply = String::new();
        let n = BufReader::new(read_half).read_line(&mut reply).await?;
        if n == 0 {
            bail!("daemon closed the connection without a response");
        }

        let response: Response =
            serde_json::from_str(&reply).context("daemon sent a malformed response")?;
        Ok(response)
    }
}
