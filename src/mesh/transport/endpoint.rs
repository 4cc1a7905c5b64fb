//! Iroh QUIC transport.

use iroh::{
    endpoint::{Connection as QuicConnection, RecvStream as QuicRecv, SendStream as QuicSend, VarInt},
    Endpoint, NodeId, SecretKey,
};
use tracing::{debug, info, warn};

use super::{Connection, RecvStream, SendStream, Transport};
use crate::error::TransportError;

/// An iroh endpoint speaking a single application ALPN.
#[derive(Clone)]
pub struct IrohTransport {
    endpoint: Endpoint,
    alpn: Vec<u8>,
}

impl IrohTransport {
    /// Binds a new endpoint with n0 discovery.
    pub async fn bind(secret_key: Option<SecretKey>, alpn: &[u8]) -> anyhow::Result<Self> {
        let secret_key = secret_key.unwrap_or_else(|| SecretKey::generate(rand::rngs::OsRng));
        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .discovery_n0()
            .alpns(vec![alpn.to_vec()])
            .bind()
            .await?;

        info!("endpoint bound");
        info!("node id: {:#?}", endpoint.node_id());
        Ok(Self::from_endpoint(endpoint, alpn))
    }

    /// Wraps an endpoint that already accepts `alpn`.
    pub fn from_endpoint(endpoint: Endpoint, alpn: &[u8]) -> Self {
        Self {
            endpoint,
            alpn: alpn.to_vec(),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl Transport for IrohTransport {
    type Connection = IrohConnection;

    fn node_id(&self) -> NodeId {
        self.endpoint.node_id()
    }

    async fn online(&self) {
        // Resolves once the endpoint knows its own addresses.
        match self.endpoint.node_addr().await {
            Ok(addr) => info!(relay = ?addr.relay_url(), "endpoint online"),
            Err(err) => warn!("could not determine own node address: {err}"),
        }
    }

    async fn connect(&self, node_id: NodeId) -> Result<IrohConnection, TransportError> {
        debug!("connecting to node: {}", node_id.fmt_short());
        let inner = self
            .endpoint
            .connect(node_id, &self.alpn)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(IrohConnection {
            inner,
            remote: node_id,
        })
    }

    /// Waits for the next connection that completes its handshake. A failed
    /// handshake is logged and skipped; `None` means the endpoint closed.
    async fn accept(&self) -> Result<Option<IrohConnection>, TransportError> {
        while let Some(incoming) = self.endpoint.accept().await {
            let inner = match incoming.await {
                Ok(inner) => inner,
                Err(err) => {
                    warn!("incoming connection failed: {err}");
                    continue;
                }
            };
            match inner.remote_node_id() {
                Ok(remote) => {
                    debug!("accepted connection from: {}", remote.fmt_short());
                    return Ok(Some(IrohConnection { inner, remote }));
                }
                Err(err) => {
                    warn!("could not identify incoming peer: {err}");
                    inner.close(VarInt::from_u32(1), b"unknown peer");
                }
            }
        }
        Ok(None)
    }

    async fn close(&self) {
        self.endpoint.close().await;
        info!("endpoint closed");
    }
}

/// Adapter: iroh connection -> [`Connection`].
#[derive(Clone)]
pub struct IrohConnection {
    inner: QuicConnection,
    remote: NodeId,
}

impl Connection for IrohConnection {
    type Send = IrohSend;
    type Recv = IrohRecv;

    fn remote_node_id(&self) -> NodeId {
        self.remote
    }

    fn id(&self) -> usize {
        self.inner.stable_id()
    }

    async fn open_bi(&self) -> Result<(IrohSend, IrohRecv), TransportError> {
        let (send, recv) = self
            .inner
            .open_bi()
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))?;
        Ok((IrohSend(send), IrohRecv(recv)))
    }

    async fn accept_bi(&self) -> Result<(IrohSend, IrohRecv), TransportError> {
        let (send, recv) = self
            .inner
            .accept_bi()
            .await
            .map_err(|e| TransportError::Closed(e.to_string()))?;
        Ok((IrohSend(send), IrohRecv(recv)))
    }

    fn close(&self, code: u32, reason: &[u8]) {
        self.inner.close(VarInt::from_u32(code), reason);
    }
}

pub struct IrohSend(QuicSend);

impl SendStream for IrohSend {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.0
            .write_all(bytes)
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))
    }

    async fn finish(&mut self) -> Result<(), TransportError> {
        self.0
            .finish()
            .map_err(|e| TransportError::Stream(e.to_string()))
    }
}

pub struct IrohRecv(QuicRecv);

impl RecvStream for IrohRecv {
    async fn read_to_end(&mut self, max_bytes: usize) -> Result<Vec<u8>, TransportError> {
        self.0
            .read_to_end(max_bytes)
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use iroh::endpoint::RelayMode;
    use tokio::time::timeout;

    use super::*;

    const TEST_ALPN: &[u8] = b"chatter/test";

    async fn local_endpoint(alpns: Vec<Vec<u8>>) -> anyhow::Result<Endpoint> {
        Endpoint::builder()
            .relay_mode(RelayMode::Disabled)
            .alpns(alpns)
            .bind()
            .await
    }

    #[tokio::test]
    async fn failed_handshakes_do_not_stop_accepting() -> anyhow::Result<()> {
        let server =
            IrohTransport::from_endpoint(local_endpoint(vec![TEST_ALPN.to_vec()]).await?, TEST_ALPN);
        let addr = timeout(Duration::from_secs(10), server.endpoint().node_addr()).await??;

        let accepting = tokio::spawn({
            let server = server.clone();
            async move { server.accept().await }
        });

        // Wrong protocol: the server side handshake fails and is skipped.
        let stranger = local_endpoint(vec![]).await?;
        let refused = timeout(
            Duration::from_secs(10),
            stranger.connect(addr.clone(), b"other/1"),
        )
        .await?;
        assert!(refused.is_err());

        let client = local_endpoint(vec![]).await?;
        let _conn = timeout(Duration::from_secs(10), client.connect(addr, TEST_ALPN)).await??;

        let accepted = timeout(Duration::from_secs(10), accepting).await???;
        let accepted = accepted.expect("endpoint still open");
        assert_eq!(accepted.remote_node_id(), client.node_id());

        stranger.close().await;
        client.close().await;
        server.close().await;
        Ok(())
    }
}
