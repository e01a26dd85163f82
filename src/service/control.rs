//! Tor control port client
//!
//! One short-lived connection per command: authenticate, send the command,
//! read both replies, say QUIT.

use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::error::{Result, TorPoolError};

pub const SIGNAL_NEWNYM: &str = "SIGNAL NEWNYM";
pub const GETINFO_VERSION: &str = "GETINFO version";

const SUCCESS_LINE: &str = "250 OK";

/// De-duplicated reply of one control exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlReply {
    pub lines: Vec<String>,
    pub success: bool,
}

impl ControlReply {
    /// Success means the whole exchange collapsed to a single `250 OK`
    pub fn from_lines(raw: Vec<String>) -> Self {
        let mut lines: Vec<String> = Vec::with_capacity(raw.len());
        for line in raw {
            let line = line.trim_end().to_string();
            if !line.is_empty() && !lines.contains(&line) {
                lines.push(line);
            }
        }

        let success = lines.len() == 1 && lines[0] == SUCCESS_LINE;
        Self { lines, success }
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// `AUTHENTICATE "<password>"\r\n<command>\r\n`
pub fn frame_request(password: &str, command: &str) -> String {
    format!(
        "AUTHENTICATE \"{}\"\r\n{}\r\n",
        escape_quoted(password),
        command.trim_end()
    )
}

fn escape_quoted(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// A reply ends with a line of the form `NNN text` (space after the status code)
fn is_final_reply_line(line: &str) -> bool {
    let bytes = line.as_bytes();
    bytes.len() >= 4 && bytes[..3].iter().all(u8::is_ascii_digit) && bytes[3] == b' '
}

/// Run one authenticated command against the control port at `addr`
#[instrument(skip(password))]
pub async fn send_command(
    addr: &str,
    password: &str,
    command: &str,
    limit: Duration,
) -> Result<ControlReply> {
    let request = frame_request(password, command);

    let lines = timeout(limit, exchange(addr, &request))
        .await
        .map_err(|_| {
            TorPoolError::ControlConnection(format!(
                "control exchange with {} timed out after {:?}",
                addr, limit
            ))
        })?
        .map_err(|e| TorPoolError::ControlConnection(format!("{}: {}", addr, e)))?;

    let reply = ControlReply::from_lines(lines);
    debug!("Control reply for {:?}: {}", command, reply.text());
    Ok(reply)
}

async fn exchange(addr: &str, request: &str) -> std::result::Result<Vec<String>, anyhow::Error> {
    let stream = TcpStream::connect(addr).await?;
    let (read_half, mut write_half) = stream.into_split();

    write_half.write_all(request.as_bytes()).await?;
    write_half.flush().await?;

    let mut reader = BufReader::new(read_half).lines();
    let mut lines = Vec::new();
    let mut replies = 0;

    // AUTHENTICATE and the command each get exactly one reply.
    while replies < 2 {
        match reader.next_line().await? {
            Some(line) => {
                if is_final_reply_line(&line) {
                    replies += 1;
                }
                lines.push(line);
            }
            None => break,
        }
    }

    if lines.is_empty() {
        anyhow::bail!("control port closed without replying");
    }

    let _ = write_half.write_all(b"QUIT\r\n").await;
    Ok(lines)
}
