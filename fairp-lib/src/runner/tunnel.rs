use std::fmt;
use std::sync::OnceLock;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::Runner;
use crate::ratelimit::{CopyError, HostKey};

/// The end of a tunnel whose stream ended first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The proxy client stopped sending
    Client,
    /// The destination stopped sending
    Destination,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Destination => write!(f, "destination"),
        }
    }
}

/// Outcome of a finished tunnel
#[derive(Debug)]
pub struct TunnelReport {
    /// Bytes relayed from the client to the destination
    pub sent: u64,
    /// Bytes relayed from the destination to the client
    pub received: u64,
    /// The side whose stream ended first, `None` if the tunnel was shut
    /// down from the outside
    pub closing_side: Option<Side>,
    /// Why the client to destination direction failed
    pub send_error: Option<CopyError>,
    /// Why the destination to client direction failed
    pub recv_error: Option<CopyError>,
}

impl TunnelReport {
    /// Whether both directions ended without an error
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.send_error.is_none() && self.recv_error.is_none()
    }
}

/// Turn the result of one tunnel direction into its byte count and error.
///
/// A direction that was cancelled because the other side closed first
/// ended normally.
fn settle(result: Result<u64, CopyError>, closed_by_peer: bool) -> (u64, Option<CopyError>) {
    match result {
        Ok(written) => (written, None),
        Err(CopyError::Cancelled { written }) if closed_by_peer => (written, None),
        Err(err) => (err.written(), Some(err)),
    }
}

impl Runner {
    /// Relay bytes between `client` and `destination` in both directions.
    ///
    /// Uploads are paid for with the send limiters of `remote_host`,
    /// downloads with its receive limiters. When either stream ends or
    /// fails, the write half it was feeding is shut down and the other
    /// direction is stopped; the report is returned once both directions
    /// have finished.
    pub async fn tunnel<C, D>(&self, client: C, destination: D, remote_host: &HostKey) -> TunnelReport
    where
        C: AsyncRead + AsyncWrite + Send + Unpin,
        D: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut destination_read, mut destination_write) = tokio::io::split(destination);

        let cancel = self.shutdown.child_token();
        let closing_side = OnceLock::new();

        let send = async {
            let result = self
                .transfer(
                    &self.send,
                    &mut destination_write,
                    &mut client_read,
                    remote_host,
                    &cancel,
                )
                .await;
            if !matches!(result, Err(CopyError::Cancelled { .. })) {
                let _ = closing_side.set(Side::Client);
            }
            let _ = destination_write.shutdown().await;
            cancel.cancel();
            result
        };

        let recv = async {
            let result = self
                .transfer(
                    &self.recv,
                    &mut client_write,
                    &mut destination_read,
                    remote_host,
                    &cancel,
                )
                .await;
            if !matches!(result, Err(CopyError::Cancelled { .. })) {
                let _ = closing_side.set(Side::Destination);
            }
            let _ = client_write.shutdown().await;
            cancel.cancel();
            result
        };

        let (send, recv) = tokio::join!(send, recv);

        let closing_side = closing_side.get().copied();
        let (sent, send_error) = settle(send, closing_side == Some(Side::Destination));
        let (received, recv_error) = settle(recv, closing_side == Some(Side::Client));

        log::debug!(
            "Tunnel finished remote_host={remote_host} sent={sent} received={received} closing_side={}",
            closing_side.map_or_else(|| "none".to_string(), |side| side.to_string())
        );

        TunnelReport {
            sent,
            received,
            closing_side,
            send_error,
            recv_error,
        }
    }
}
