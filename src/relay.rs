use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use hostsniff::{ConnectionInfo, ConnectionSniffer, ReplayConnection, SniffError};

use crate::settings::Settings;

pub const CONNECT_TIMEOUT: u64 = 3000;

pub async fn relay_worker(settings: Arc<Settings>) -> Result<()> {
    let listener = TcpListener::bind(&settings.listen)
        .await
        .with_context(|| format!("failed to bind {}", settings.listen))?;
    info!("listening on {}", listener.local_addr()?);

    accept_socket_loop(listener, settings).await
}

async fn accept_socket_loop(listener: TcpListener, settings: Arc<Settings>) -> Result<()> {
    let sniffer = Arc::new(ConnectionSniffer::new(settings.sniff.clone()));

    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                let settings = settings.clone();
                let sniffer = sniffer.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_tcp(socket, &settings, &sniffer).await {
                        error!("{}: {:#}", peer, e);
                    }
                });
            }
            Err(e) => warn!("couldn't get client: {:?}", e),
        }
    }
}

async fn handle_tcp(
    inbound: TcpStream,
    settings: &Settings,
    sniffer: &ConnectionSniffer,
) -> Result<()> {
    let (host, mut conn) = match timeout(settings.sniff_timeout, sniffer.sniff(inbound)).await {
        Err(_) => {
            return Err(anyhow!(
                "no client bytes within {}ms",
                settings.sniff_timeout.as_millis()
            ))
        }
        Ok(Ok(sniffed)) => (Some(sniffed.host), sniffed.conn),
        Ok(Err(SniffError::Read(err))) => {
            return Err(err).context("failed to read client prefix");
        }
        Ok(Err(SniffError::HostNotFound { cause, conn })) => {
            debug!("unknown destination ({}), {} bytes held", cause, conn.buffered().len());
            (None, conn)
        }
    };

    let peer = conn.peer_addr()?;
    let upstream = match host.as_deref() {
        Some(host) => settings.routes.match_route(host),
        None => settings.routes.default.as_ref(),
    };
    let upstream = match upstream {
        Some(upstream) => upstream,
        None => {
            info!("{} -> {} -> rejected", peer, host.as_deref().unwrap_or("?"));
            if let Err(e) = conn.close().await {
                debug!("{}: failed to close rejected connection: {}", peer, e);
            }
            return Ok(());
        }
    };
    info!("{} -> {} -> {}", peer, host.as_deref().unwrap_or("?"), upstream);

    let mut outbound = timeout(
        Duration::from_millis(CONNECT_TIMEOUT),
        TcpStream::connect(&upstream.addr),
    )
    .await
    .map_err(|_| anyhow!("timed out connecting {}", upstream))?
    .with_context(|| format!("failed to connect {}", upstream))?;

    transfer_tcp(&mut conn, &mut outbound).await
}

/// Pipes both directions until either side closes. The replayed prefix is the
/// first thing the upstream receives.
async fn transfer_tcp(
    inbound: &mut ReplayConnection<TcpStream>,
    outbound: &mut TcpStream,
) -> Result<()> {
    let (up, down) = tokio::io::copy_bidirectional(inbound, outbound).await?;
    debug!("relay finished, {} bytes up, {} bytes down", up, down);
    Ok(())
}
