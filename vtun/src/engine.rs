//! Accept loop of the tunnel.
//!
//! The engine waits for a connection, runs exactly one [`Session`] on it and
//! only goes back to accepting once that session is fully closed. The tun
//! device and the NAT rules are provisioned for a single peer, so sessions
//! never overlap.

use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{error, info};

use crate::iface::PacketInterface;
use crate::session::{Session, SessionReport};
use crate::stats::TunnelStats;

/// Delay before retrying after a failed accept.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Source of tunnel connections.
#[async_trait]
pub trait Acceptor: Send {
    type Conn: AsyncRead + AsyncWrite + Send + 'static;

    /// Wait for the next connection and return it with a printable peer
    /// address.
    async fn accept(&mut self) -> io::Result<(Self::Conn, String)>;
}

/// Serializes sessions over connections produced by an [`Acceptor`].
pub struct TunnelEngine<A, I: ?Sized> {
    acceptor: A,
    iface: Arc<I>,
    stats: Arc<TunnelStats>,
    retry_delay: Duration,
}

impl<A, I> TunnelEngine<A, I>
where
    A: Acceptor,
    I: PacketInterface + ?Sized + 'static,
{
    pub fn new(acceptor: A, iface: Arc<I>) -> Self {
        Self {
            acceptor,
            iface,
            stats: Arc::new(TunnelStats::new()),
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_stats(mut self, stats: Arc<TunnelStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn stats(&self) -> Arc<TunnelStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections and run sessions forever.
    pub async fn run(mut self) {
        loop {
            self.serve_one().await;
        }
    }

    /// Accept one connection and run its session to completion.
    ///
    /// Returns `None` if accepting failed; the failure has been logged and
    /// the retry delay has elapsed.
    pub async fn serve_one(&mut self) -> Option<SessionReport> {
        info!("Waiting for new connection from enclave");
        let (conn, peer) = match self.acceptor.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                self.stats.accept_failed();
                tokio::time::sleep(self.retry_delay).await;
                return None;
            }
        };

        let id = self.stats.session_opened();
        info!(session = id, peer = %peer, "Accepted new connection");

        let session = Session::new(
            id,
            peer,
            conn,
            Arc::clone(&self.iface),
            Arc::clone(&self.stats),
        );
        let report = session.run().await;
        self.stats.session_closed();
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;
    use crate::session::SessionState;
    use crate::test_util::{MemoryInterface, channel_acceptor};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    /// Fails a fixed number of times before handing out connections.
    struct FlakyAcceptor {
        failures: usize,
        conns: Vec<DuplexStream>,
    }

    #[async_trait]
    impl Acceptor for FlakyAcceptor {
        type Conn = DuplexStream;

        async fn accept(&mut self) -> io::Result<(DuplexStream, String)> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(io::Error::other("listener hiccup"));
            }
            self.conns
                .pop()
                .map(|c| (c, "flaky".to_string()))
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no more connections"))
        }
    }

    #[tokio::test]
    async fn test_accept_failures_are_retried() {
        let (iface, _handle) = MemoryInterface::new();
        let (client, server) = tokio::io::duplex(64);
        let acceptor = FlakyAcceptor {
            failures: 2,
            conns: vec![server],
        };
        let mut engine =
            TunnelEngine::new(acceptor, Arc::new(iface)).with_retry_delay(Duration::from_millis(1));

        assert!(engine.serve_one().await.is_none());
        assert!(engine.serve_one().await.is_none());

        drop(client);
        let report = timeout(WAIT, engine.serve_one()).await.unwrap().unwrap();
        assert_eq!(report.state, SessionState::Closed);

        let snap = engine.stats().snapshot();
        assert_eq!(snap.accept_errors, 2);
        assert_eq!(snap.sessions_accepted, 1);
        assert_eq!(snap.sessions_closed, 1);
        assert!(!snap.session_active);
    }

    #[tokio::test]
    async fn test_reconnect_after_session_ends() {
        let (iface, mut handle) = MemoryInterface::new();
        let (connector, acceptor) = channel_acceptor(1024);
        let engine = TunnelEngine::new(acceptor, Arc::new(iface));
        let stats = engine.stats();
        let task = tokio::spawn(engine.run());

        for round in 0u8..3 {
            let mut conn = connector.connect().unwrap();
            conn.write_all(&frame::encode(&[round; 20]).unwrap())
                .await
                .unwrap();
            assert_eq!(timeout(WAIT, handle.next_sent()).await.unwrap().unwrap(), vec![round; 20]);

            handle.inject(vec![round; 30]);
            let payload = timeout(WAIT, frame::decode(&mut conn)).await.unwrap().unwrap();
            assert_eq!(payload, vec![round; 30]);

            // Hang up and wait until the engine is back to accepting.
            drop(conn);
            timeout(WAIT, async {
                while stats.snapshot().sessions_closed < u64::from(round) + 1 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();
        }

        assert_eq!(stats.snapshot().sessions_accepted, 3);
        task.abort();
    }

    #[tokio::test]
    async fn test_client_half_close_ends_session() {
        let (iface, _handle) = MemoryInterface::new();
        let (connector, acceptor) = channel_acceptor(1024);
        let task = tokio::spawn(TunnelEngine::new(acceptor, Arc::new(iface)).run());

        let mut first = connector.connect().unwrap();
        first.shutdown().await.unwrap();

        // The session shuts its write side down once it is over.
        let mut rest = Vec::new();
        timeout(WAIT, first.read_to_end(&mut rest)).await.unwrap().unwrap();
        assert!(rest.is_empty());
        task.abort();
    }
}
