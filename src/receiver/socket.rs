//! Socket lane: accept loop, per-connection handler, dedupe and fetch
//!
//! Each connection reads framed `origin:path` requests until `!DISCONNECT` or
//! peer close, answering every request with `  OK` or `FAIL`. A request whose
//! destination name is already stored is acknowledged without fetching.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::DestinationLocks;
use crate::config::ReceiverConfig;
use crate::error::{FetchError, FrameError};
use crate::protocol_core::{
    ensure_dir_exists, parse_message, read_message, write_status, Message, TransferRequest,
};

/// One accepted socket, alive until the sentinel or an I/O error
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: u64,
    pub peer: SocketAddr,
    pub opened_at: DateTime<Utc>,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Copy the requested source file to `dest`
    async fn fetch(&self, request: &TransferRequest, dest: &Path) -> Result<(), FetchError>;
}

/// Pulls with an external copy program: `<program> <args..> -- origin:path dest`
pub struct CommandFetcher {
    program: String,
    args: Vec<String>,
}

impl CommandFetcher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(cfg: &ReceiverConfig) -> Self {
        Self::new(cfg.fetch_program.clone(), cfg.fetch_args.clone())
    }
}

#[async_trait]
impl Fetcher for CommandFetcher {
    async fn fetch(&self, request: &TransferRequest, dest: &Path) -> Result<(), FetchError> {
        let remote = request.remote_spec();
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg("--")
            .arg(&remote)
            .arg(dest)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .await
            .map_err(|source| FetchError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        if !status.success() {
            return Err(FetchError::Failed {
                remote,
                status: status.to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    AlreadyStored,
    Fetched,
}

pub struct SocketReceiver {
    dest_dir: PathBuf,
    fetcher: Arc<dyn Fetcher>,
    locks: DestinationLocks,
    next_id: AtomicU64,
}

impl SocketReceiver {
    pub fn new(dest_dir: PathBuf, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
        ensure_dir_exists(&dest_dir)
            .with_context(|| format!("failed to create {}", dest_dir.display()))?;
        Ok(Self {
            dest_dir,
            fetcher,
            locks: DestinationLocks::new(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Accept connections forever. Only a dead listener ends the loop.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr().context("listener has no address")?;
        info!(addr = %local, dest = %self.dest_dir.display(), "socket lane listening");
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let conn = Connection {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                peer,
                opened_at: Utc::now(),
            };
            let receiver = self.clone();
            tokio::spawn(async move {
                if let Err(e) = receiver.handle_connection(stream, &conn).await {
                    warn!(conn = conn.id, peer = %conn.peer, error = %e, "connection ended with error");
                }
            });
        }
    }

    pub async fn handle_connection(
        &self,
        mut stream: TcpStream,
        conn: &Connection,
    ) -> Result<(), FrameError> {
        debug!(conn = conn.id, peer = %conn.peer, "connection opened");
        let mut handled = 0u32;
        loop {
            let payload = match read_message(&mut stream).await {
                Ok(Some(p)) => p,
                Ok(None) => break,
                // The frame was consumed whole; the stream is still in sync
                Err(FrameError::NotUtf8) => {
                    warn!(conn = conn.id, "non UTF-8 request");
                    write_status(&mut stream, false).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let ok = match parse_message(&payload) {
                Ok(Message::Disconnect) => break,
                Ok(Message::Transfer(request)) => match self.store(&request).await {
                    Ok(outcome) => {
                        info!(
                            conn = conn.id,
                            name = %request.destination_name,
                            ?outcome,
                            "stored"
                        );
                        true
                    }
                    Err(e) => {
                        error!(conn = conn.id, remote = %request.remote_spec(), error = %e, "fetch failed");
                        false
                    }
                },
                Err(e) => {
                    warn!(conn = conn.id, error = %e, "bad request");
                    false
                }
            };
            write_status(&mut stream, ok).await?;
            handled += 1;
        }
        let open_for = Utc::now().signed_duration_since(conn.opened_at);
        debug!(
            conn = conn.id,
            handled,
            open_ms = open_for.num_milliseconds(),
            "connection closed"
        );
        Ok(())
    }

    /// Make sure `request.destination_name` exists in the destination directory
    pub async fn store(&self, request: &TransferRequest) -> Result<StoreOutcome, FetchError> {
        let name = &request.destination_name;
        let _guard = self.locks.lock(name).await;

        let dest = self.dest_dir.join(name);
        if fs::try_exists(&dest).await? {
            return Ok(StoreOutcome::AlreadyStored);
        }

        let part = self.dest_dir.join(format!(".{name}.part"));
        if let Err(e) = self.fetcher.fetch(request, &part).await {
            let _ = fs::remove_file(&part).await;
            return Err(e);
        }
        fs::rename(&part, &dest).await?;
        Ok(StoreOutcome::Fetched)
    }

    pub fn dest_dir(&self) -> &Path {
        &self.dest_dir
    }
}
