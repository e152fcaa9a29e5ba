//! Framing and request parsing shared by the socket client and receiver
//!
//! Wire format: a `HEADER`-byte ASCII decimal length, left-padded with spaces,
//! followed by that many bytes of UTF-8 payload. Replies are bare 4-byte tokens.

use std::path::Path;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FrameError;
use crate::protocol::{status, DISCONNECT, HEADER, MAX_FRAME_SIZE, STATUS_LEN};

/// Validate frame payload size against protocol::MAX_FRAME_SIZE
pub fn validate_frame_size(size: usize) -> Result<(), FrameError> {
    if size > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(size));
    }
    Ok(())
}

/// Build the fixed-width length header for a payload of `payload_len` bytes
pub fn build_frame_header(payload_len: usize) -> Result<[u8; HEADER], FrameError> {
    validate_frame_size(payload_len)?;
    let digits = payload_len.to_string();
    let mut header = [b' '; HEADER];
    header[HEADER - digits.len()..].copy_from_slice(digits.as_bytes());
    Ok(header)
}

/// Parse a length header: spaces, then one or more ASCII digits up to the end
pub fn parse_frame_header(header: &[u8; HEADER]) -> Result<usize, FrameError> {
    let bad = || FrameError::BadHeader(String::from_utf8_lossy(header).into_owned());
    let start = header.iter().position(|&b| b != b' ').ok_or_else(bad)?;
    let digits = &header[start..];
    if !digits.iter().all(u8::is_ascii_digit) {
        return Err(bad());
    }
    // All-digit ASCII is valid UTF-8; parse can still overflow on 100 nines
    let len: usize = std::str::from_utf8(digits)
        .map_err(|_| bad())?
        .parse()
        .map_err(|_| bad())?;
    validate_frame_size(len)?;
    Ok(len)
}

/// Header + payload as a single buffer
pub fn encode_message(payload: &str) -> Result<Vec<u8>, FrameError> {
    let header = build_frame_header(payload.len())?;
    let mut out = Vec::with_capacity(HEADER + payload.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(payload.as_bytes());
    Ok(out)
}

pub async fn write_message<S>(stream: &mut S, payload: &str) -> Result<(), FrameError>
where
    S: AsyncWrite + Unpin,
{
    let buf = encode_message(payload)?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one framed message. `Ok(None)` means the peer closed cleanly between messages.
pub async fn read_message<S>(stream: &mut S) -> Result<Option<String>, FrameError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER];
    let mut filled = 0;
    while filled < HEADER {
        let n = stream.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        filled += n;
    }
    let len = parse_frame_header(&header)?;
    let mut payload = vec![0u8; len];
    if len > 0 {
        stream.read_exact(&mut payload).await?;
    }
    String::from_utf8(payload)
        .map(Some)
        .map_err(|_| FrameError::NotUtf8)
}

pub async fn write_status<S>(stream: &mut S, ok: bool) -> Result<(), FrameError>
where
    S: AsyncWrite + Unpin,
{
    let token = if ok { status::OK } else { status::FAIL };
    stream.write_all(token).await?;
    stream.flush().await?;
    Ok(())
}

/// Read the 4-byte reply; `true` for OK, `false` for FAIL, error for anything else
pub async fn read_status<S>(stream: &mut S) -> Result<bool, FrameError>
where
    S: AsyncRead + Unpin,
{
    let mut reply = [0u8; STATUS_LEN];
    stream.read_exact(&mut reply).await?;
    match &reply {
        r if r == status::OK => Ok(true),
        r if r == status::FAIL => Ok(false),
        _ => Err(FrameError::BadStatus(reply)),
    }
}

/// One decoded socket message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Transfer(TransferRequest),
    Disconnect,
}

/// A request to pull `source_path` from `origin`, stored as `destination_name`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub origin: String,
    pub source_path: String,
    pub destination_name: String,
}

impl TransferRequest {
    /// Payload sent by the client for one artifact
    pub fn payload(origin: &str, source: &Path) -> String {
        format!("{}:{}", origin, source.display())
    }

    /// `scp`-style remote spec for the source
    pub fn remote_spec(&self) -> String {
        format!("{}:{}", self.origin, self.source_path)
    }
}

pub fn parse_message(payload: &str) -> Result<Message, FrameError> {
    if payload == DISCONNECT {
        return Ok(Message::Disconnect);
    }
    parse_transfer(payload).map(Message::Transfer)
}

fn parse_transfer(payload: &str) -> Result<TransferRequest, FrameError> {
    let bad = || FrameError::BadRequest(payload.to_string());
    let (origin, source_path) = payload.split_once(':').ok_or_else(bad)?;
    // A leading '-' would reach the fetch program as an option
    if origin.is_empty() || origin.starts_with('-') || origin.contains('/') {
        return Err(bad());
    }
    let base = source_path.rsplit('/').next().ok_or_else(bad)?;
    let base = safe_file_name(base).map_err(|_| bad())?;
    let destination_name = safe_file_name(&format!("{}-{}", origin, base))
        .map_err(|_| bad())?
        .to_string();
    Ok(TransferRequest {
        origin: origin.to_string(),
        source_path: source_path.to_string(),
        destination_name,
    })
}

/// Accept a single plain file name: no separators, no NUL, not `.`/`..`, not hidden.
pub fn safe_file_name(name: &str) -> Result<&str, FrameError> {
    let bad = name.is_empty()
        || name.contains('\0')
        || name.contains('/')
        || name.contains('\\')
        || name.starts_with('.');
    if bad {
        return Err(FrameError::BadRequest(name.to_string()));
    }
    Ok(name)
}

/// Create directory with parent creation
pub fn ensure_dir_exists(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}
