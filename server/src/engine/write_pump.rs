use std::fmt::Display;

use futures_util::{Sink, SinkExt};
use tracing::debug;

use super::connection::Outlet;
use super::events::{CloseReason, Frame};

/// How a write pump ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// Every sender was dropped (normal disconnect path).
    QueueClosed,
    /// Idle reaper, kick or shutdown.
    Teardown(CloseReason),
    /// The socket refused a write.
    SocketError,
}

/// The only task allowed to write to a client's socket.
///
/// Drains the outbound queue in FIFO order until either the teardown signal fires
/// or the queue closes, then sends a close frame (best effort) and returns.
pub async fn run_write_pump<S>(sink: S, mut outlet: Outlet) -> PumpExit
where
    S: Sink<Frame>,
    S::Error: Display,
{
    tokio::pin!(sink);

    loop {
        tokio::select! {
            biased;

            Some(reason) = outlet.teardown.recv() => {
                if let Err(e) = sink.send(Frame::Close(Some(reason))).await {
                    debug!(error = %e, "close frame not delivered");
                }
                return PumpExit::Teardown(reason);
            }

            payload = outlet.outbound.recv() => match payload {
                Some(payload) => {
                    if let Err(e) = sink.send(Frame::Text(payload)).await {
                        debug!(error = %e, "socket write failed");
                        return PumpExit::SocketError;
                    }
                }
                None => {
                    if let Err(e) = sink.send(Frame::Close(None)).await {
                        debug!(error = %e, "close frame not delivered");
                    }
                    return PumpExit::QueueClosed;
                }
            }
        }
    }
}
