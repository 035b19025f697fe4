//! # Frame Echo Server
//!
//! Purpose: Echo every length-prefixed frame back to its sender, over plain
//! TCP or TLS. Useful as a peer when exercising clients by hand.
//!
//! Logging follows `RUST_LOG` (default `info`).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tcpkit_common::{Connection, FrameOption};
use tcpkit_server::Server;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Length-prefixed frame echo server")]
struct Cli {
    /// Listen address.
    #[arg(long, default_value = "127.0.0.1:9000")]
    addr: String,
    /// Frame header width in bytes (1-4).
    #[arg(long, default_value_t = 2)]
    header_size: usize,
    /// Largest accepted payload; 0 derives it from the header width.
    #[arg(long, default_value_t = 0)]
    max_size: usize,
    /// PEM certificate chain; enables TLS together with --key.
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,
    /// PEM private key.
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,
}

async fn echo(mut conn: Connection, option: FrameOption) {
    let peer = conn.peer_addr();
    loop {
        let frame = match conn.recv_pkg(option).await {
            Ok(frame) => frame,
            Err(err) => {
                debug!(?peer, error = %err, "echo session ended");
                return;
            }
        };
        if let Err(err) = conn.send_pkg(&frame, option).await {
            debug!(?peer, error = %err, "echo reply failed");
            return;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let option = FrameOption::new()
        .with_header_size(cli.header_size)
        .with_max_data_size(cli.max_size)
        .resolve()
        .context("invalid frame option")?;

    let handler = move |conn| echo(conn, option);
    let server = match (&cli.cert, &cli.key) {
        (Some(cert), Some(key)) => Server::with_key_crt(cli.addr.as_str(), cert, key, handler)
            .context("failed to load TLS certificate")?,
        (None, None) => Server::new(cli.addr.as_str(), handler),
        _ => bail!("--cert and --key must be given together"),
    };
    let server = Arc::new(server);

    let addr = server.bind().await.context("failed to bind")?;
    info!(
        %addr,
        header_size = option.header_size,
        max_size = option.max_data_size,
        "echo server ready"
    );

    let stopper = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            stopper.close();
        }
    });

    server.run().await?;
    Ok(())
}
