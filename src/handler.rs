//! Per-connection handler.
//!
//! Drives one agency's session: receive a frame, dispatch its requests in
//! order, go back to receiving, until the peer leaves, a fatal error
//! occurs or the server shuts down.

use crate::barrier::BarrierError;
use crate::connection::Session;
use crate::ledger::LedgerError;
use crate::protocol::{self, Request, Response};
use crate::server::ServerContext;
use crate::shutdown::ShutdownListener;
use crate::storage::Bet;
use crate::transport::{self, FrameError, FrameReader};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Transport(#[from] FrameError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("draw failed: {0}")]
    Barrier(#[from] BarrierError),
    #[error("server shutting down")]
    Shutdown,
}

/// Run a connection to completion, then drop it from the registry.
pub async fn handle_connection(stream: TcpStream, mut session: Session, ctx: Arc<ServerContext>) {
    let (reader, mut writer) = stream.into_split();
    let mut frames = FrameReader::new(reader, ctx.max_frame_size);
    let mut shutdown = ctx.shutdown.subscribe();

    let result = serve(&mut session, &mut frames, &mut writer, &ctx, &mut shutdown).await;

    ctx.registry().remove(session.id);

    match result {
        Ok(()) | Err(ConnectionError::Transport(FrameError::ConnectionClosed)) => {
            debug!(peer = %session.peer, "Connection closed by client");
        }
        Err(e) if ctx.shutdown.is_triggered() => {
            debug!(peer = %session.peer, reason = %e, "Connection closed by server shutdown");
        }
        Err(e) => {
            warn!(peer = %session.peer, state = ?session.state, error = %e, "Connection failed");
        }
    }
    session.close();
}

/// Session loop over any framed byte stream.
async fn serve<R, W>(
    session: &mut Session,
    frames: &mut FrameReader<R>,
    writer: &mut W,
    ctx: &ServerContext,
    shutdown: &mut ShutdownListener,
) -> Result<(), ConnectionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        session.start_receiving();
        let frame = until_shutdown(shutdown, frames.receive_frame()).await?;

        session.start_dispatching();
        let text = match std::str::from_utf8(&frame) {
            Ok(text) => text,
            Err(e) => {
                warn!(peer = %session.peer, error = %e, "Skipping frame that is not UTF-8");
                continue;
            }
        };

        let mut pending = Vec::new();
        for request in protocol::parse_frame(text) {
            match request {
                Ok(Request::Bet(bet)) => {
                    pending.push(bet);
                    session.batch_bets += 1;
                }
                Ok(Request::EndOfBatch) => {
                    store_pending(ctx, &mut pending).await?;
                    let bets = session.finish_batch();
                    if bets == 0 {
                        debug!(peer = %session.peer, "Empty batch, nothing to confirm");
                        continue;
                    }
                    info!(peer = %session.peer, bets, "Batch received");
                    reply(writer, &Response::BetConfirmation, shutdown).await?;
                }
                Ok(Request::Winners { agency }) => {
                    store_pending(ctx, &mut pending).await?;
                    if let Some(winners) = draw(session, agency, ctx, shutdown).await? {
                        reply(writer, &Response::Winners(winners), shutdown).await?;
                    }
                }
                Err(e) => {
                    warn!(peer = %session.peer, error = %e, "Skipping malformed request");
                }
            }
        }
        store_pending(ctx, &mut pending).await?;
    }
}

/// Wait for the draw and compute this agency's winners.
///
/// Returns `None` when the request is rejected without touching the barrier.
async fn draw(
    session: &mut Session,
    agency: u32,
    ctx: &ServerContext,
    shutdown: &mut ShutdownListener,
) -> Result<Option<Vec<String>>, ConnectionError> {
    let agencies = ctx.barrier.parties();
    if agency == 0 || agency as usize > agencies {
        warn!(peer = %session.peer, agency, agencies, "Skipping draw request from unknown agency");
        return Ok(None);
    }
    if session.draw_requested {
        warn!(peer = %session.peer, agency, "Skipping repeated draw request");
        return Ok(None);
    }
    if !ctx.claim_draw(agency) {
        warn!(peer = %session.peer, agency, "Skipping draw request, agency already asked");
        return Ok(None);
    }
    session.draw_requested = true;

    debug!(peer = %session.peer, agency, "Waiting for the draw");
    let released = until_shutdown(shutdown, ctx.barrier.arrive()).await?;
    if released.is_leader() {
        info!(agencies, "Draw performed");
    }

    let winners = ctx.ledger.winners_blocking(agency).await?;
    info!(agency, winners = winners.len(), "Winners sent");
    Ok(Some(winners))
}

/// Append the bets collected so far in this frame.
async fn store_pending(ctx: &ServerContext, pending: &mut Vec<Bet>) -> Result<(), ConnectionError> {
    if pending.is_empty() {
        return Ok(());
    }
    ctx.ledger.append_blocking(std::mem::take(pending)).await?;
    Ok(())
}

async fn reply<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &Response,
    shutdown: &mut ShutdownListener,
) -> Result<(), ConnectionError> {
    let payload = response.encode();
    until_shutdown(shutdown, transport::send_frame(writer, &payload)).await
}

/// Race a blocking step against the shutdown signal.
async fn until_shutdown<T, E, F>(shutdown: &mut ShutdownListener, step: F) -> Result<T, ConnectionError>
where
    F: Future<Output = Result<T, E>>,
    ConnectionError: From<E>,
{
    tokio::select! {
        result = step => Ok(result?),
        _ = shutdown.wait() => Err(ConnectionError::Shutdown),
    }
}
