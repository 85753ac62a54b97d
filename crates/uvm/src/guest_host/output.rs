//! Entropy feed and guest log relay served over the guest host's sockets.

use rand::RngCore;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use uvm_core::Result;

/// Bytes written to the guest to seed its random number generator.
pub(crate) const ENTROPY_BYTES: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GuestLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl GuestLevel {
    fn parse(level: &str) -> Self {
        match level.to_ascii_lowercase().as_str() {
            "trace" => GuestLevel::Trace,
            "debug" => GuestLevel::Debug,
            "warn" | "warning" => GuestLevel::Warn,
            "error" | "fatal" | "panic" => GuestLevel::Error,
            _ => GuestLevel::Info,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GuestLogEntry {
    #[serde(default)]
    level: Option<String>,
    #[serde(default, alias = "message")]
    msg: String,
}

/// One line of guest output, either a structured log entry or raw text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum GuestLine {
    Entry { level: GuestLevel, msg: String },
    Raw(String),
}

pub(crate) fn classify(line: &str) -> GuestLine {
    let trimmed = line.trim_end();
    if trimmed.starts_with('{') {
        if let Ok(entry) = serde_json::from_str::<GuestLogEntry>(trimmed) {
            let level = entry
                .level
                .as_deref()
                .map(GuestLevel::parse)
                .unwrap_or(GuestLevel::Info);
            return GuestLine::Entry {
                level,
                msg: entry.msg,
            };
        }
    }
    GuestLine::Raw(trimmed.to_string())
}

fn emit(uvm_id: &str, line: GuestLine) {
    match line {
        GuestLine::Entry { level, msg } => match level {
            GuestLevel::Trace => tracing::trace!(uvm_id, guest = true, "{msg}"),
            GuestLevel::Debug => tracing::debug!(uvm_id, guest = true, "{msg}"),
            GuestLevel::Info => tracing::info!(uvm_id, guest = true, "{msg}"),
            GuestLevel::Warn => tracing::warn!(uvm_id, guest = true, "{msg}"),
            GuestLevel::Error => tracing::error!(uvm_id, guest = true, "{msg}"),
        },
        GuestLine::Raw(text) if text.is_empty() => {}
        GuestLine::Raw(text) => tracing::debug!(uvm_id, guest = true, raw = true, "{text}"),
    }
}

/// Re-emits every line read from `reader` as a tracing event. Returns the
/// number of lines relayed once the guest closes its end.
pub(crate) async fn relay_guest_output<R>(uvm_id: &str, reader: R) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut count = 0;
    while let Some(line) = lines.next_line().await? {
        emit(uvm_id, classify(&line));
        count += 1;
    }
    Ok(count)
}

pub(crate) async fn feed_entropy<W>(mut writer: W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut seed = [0u8; ENTROPY_BYTES];
    rand::thread_rng().fill_bytes(&mut seed);
    writer.write_all(&seed).await?;
    writer.shutdown().await
}

/// Accepts the guest's entropy connection and seeds it.
pub(crate) async fn serve_entropy(listener: UnixListener) -> Result<()> {
    let (stream, _) = listener.accept().await?;
    feed_entropy(stream).await?;
    Ok(())
}

/// Accepts the guest's log connection.
pub(crate) async fn accept_log(listener: UnixListener) -> Result<UnixStream> {
    let (stream, _) = listener.accept().await?;
    Ok(stream)
}
