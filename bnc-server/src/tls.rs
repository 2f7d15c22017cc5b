//! TLS for the session listener.
//!
//! When the document names both `tlsCert` and `tlsKey`, sessions are served
//! as `wss://`. Handshakes run concurrently so one stalled client cannot hold
//! up the accept loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::rustls;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

/// Drop clients that do not finish the handshake in time.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Build an acceptor from a PEM certificate chain and private key.
pub fn load_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor> {
    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("Failed to read TLS cert: {cert_path}"))?;
    let key_pem = std::fs::read(key_path)
        .with_context(|| format!("Failed to read TLS key: {key_path}"))?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse TLS certificates")?;
    anyhow::ensure!(!certs.is_empty(), "No certificates found in {cert_path}");
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .context("Failed to parse TLS private key")?
        .context("No private key found in PEM file")?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Invalid TLS configuration")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

type Handshake = (std::io::Result<TlsStream<TcpStream>>, SocketAddr);

/// A TCP listener that hands axum only connections that completed a TLS
/// handshake.
pub struct TlsListener {
    inner: TcpListener,
    acceptor: TlsAcceptor,
    handshakes: JoinSet<Handshake>,
}

impl TlsListener {
    pub fn new(inner: TcpListener, acceptor: TlsAcceptor) -> Self {
        Self { inner, acceptor, handshakes: JoinSet::new() }
    }

    fn start_handshake(&mut self, stream: TcpStream, addr: SocketAddr) {
        let acceptor = self.acceptor.clone();
        self.handshakes.spawn(async move {
            let handshake = acceptor.accept(stream);
            let result = match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await {
                Ok(result) => result,
                Err(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "handshake timed out",
                )),
            };
            (result, addr)
        });
    }
}

impl axum::serve::Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            tokio::select! {
                accepted = self.inner.accept() => match accepted {
                    Ok((stream, addr)) => self.start_handshake(stream, addr),
                    Err(e) => {
                        tracing::error!(error = %e, "TLS accept error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(done) = self.handshakes.join_next(), if !self.handshakes.is_empty() => {
                    match done {
                        Ok((Ok(stream), addr)) => return (stream, addr),
                        Ok((Err(e), addr)) => {
                            tracing::warn!(peer = %addr, error = %e, "TLS handshake failed");
                        }
                        Err(e) => tracing::error!(error = %e, "TLS handshake task failed"),
                    }
                }
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}
