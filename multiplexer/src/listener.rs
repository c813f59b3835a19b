use crate::session::{SessionContext, run_session};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Accepts worker connections and runs one session per stream until shutdown.
pub(crate) async fn accept_workers(
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "accepting worker streams");

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.wait_for(|stopping| *stopping) => {
                tracing::info!(%local_addr, "worker listener stopped");
                return Ok(());
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                // Usually fd exhaustion; back off instead of spinning.
                tracing::warn!(error = %e, "failed to accept worker stream");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let _ = stream.set_nodelay(true);

        let ctx = ctx.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tracing::debug!(%peer_addr, "worker connected");
            let (reader, writer) = stream.into_split();
            let reason = run_session(ctx, reader, writer, shutdown).await;
            tracing::debug!(%peer_addr, reason = %reason, "worker stream finished");
        });
    }
}
