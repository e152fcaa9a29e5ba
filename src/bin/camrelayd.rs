use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use camrelay::cli::ReceiverOpts;
use camrelay::receiver::http::{router, UploadState};
use camrelay::receiver::socket::{CommandFetcher, SocketReceiver};

fn main() -> Result<()> {
    let opts = ReceiverOpts::parse();
    camrelay::init_tracing();
    let config = opts.to_config()?;

    let dest_dir = config.dest_dir.clone();
    if !dest_dir.exists() {
        std::fs::create_dir_all(&dest_dir)
            .with_context(|| format!("failed to create {}", dest_dir.display()))?;
    }
    let dest_dir = std::fs::canonicalize(&dest_dir)
        .with_context(|| format!("failed to canonicalize {}", dest_dir.display()))?;

    for bind in [&config.socket_bind, &config.http_bind].into_iter().flatten() {
        if bind.starts_with("0.0.0.0") {
            warn!(bind = %bind, "listening on all interfaces without encryption or authentication");
        }
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    rt.block_on(async move {
        let mut lanes = tokio::task::JoinSet::new();

        if let Some(bind) = &config.socket_bind {
            let listener = TcpListener::bind(bind)
                .await
                .with_context(|| format!("failed to bind socket lane on {bind}"))?;
            let fetcher = Arc::new(CommandFetcher::from_config(&config));
            let receiver = Arc::new(SocketReceiver::new(dest_dir.clone(), fetcher)?);
            lanes.spawn(receiver.serve(listener));
        }

        if let Some(bind) = &config.http_bind {
            let listener = TcpListener::bind(bind)
                .await
                .with_context(|| format!("failed to bind HTTP lane on {bind}"))?;
            info!(addr = %bind, dest = %dest_dir.display(), "HTTP lane listening");
            let app = router(UploadState::new(dest_dir.clone(), config.checksum));
            lanes.spawn(async move { axum::serve(listener, app).await.context("HTTP lane failed") });
        }

        // Lanes only return on a fatal listener error
        match lanes.join_next().await {
            Some(Ok(result)) => result,
            Some(Err(e)) => Err(e).context("receiver lane panicked"),
            None => Ok(()),
        }
    })
}
