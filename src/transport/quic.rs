//! QUIC transport between the two shaped processes
//!
//! One quinn connection per middlebox pair; every flow, the control stream
//! and the dummy stream are bidirectional streams on it. The initiating
//! peer dials, the responding peer listens. TLS identities come from PEM
//! files; a self-signed pair is generated when they are missing.

use super::{
    deliver_with_backoff, write_queue, EventSlot, ShapedTransport, StreamEnd, StreamEvents, StreamId, WriteOp,
    WriteQueue, WriteQueueReceiver,
};
use crate::config::ShapedConfig;
use crate::constants::WRITE_WINDOW;
use crate::error::{FlowError, TransportError};
use anyhow::{anyhow, Context, Result};
use quinn::{ClientConfig, Connection, Endpoint, IdleTimeout, RecvStream, SendStream, ServerConfig, TransportConfig, VarInt};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::HashMap;
use std::fs;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Stream transport over a single QUIC connection
pub struct QuicStreams {
    me: Weak<QuicStreams>,
    runtime: Handle,
    endpoint: OnceLock<Endpoint>,
    connection: OnceLock<Connection>,
    events: EventSlot<dyn StreamEvents>,
    writers: Mutex<HashMap<StreamId, WriteQueue>>,
    read_chunk: usize,
    backoff: Duration,
}

impl QuicStreams {
    /// `read_chunk` must stay below the queue capacity
    pub fn new(runtime: Handle, read_chunk: usize, backoff: Duration) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            runtime,
            endpoint: OnceLock::new(),
            connection: OnceLock::new(),
            events: EventSlot::new(),
            writers: Mutex::new(HashMap::new()),
            read_chunk: read_chunk.max(1),
            backoff,
        })
    }

    pub fn set_events(&self, events: Weak<dyn StreamEvents>) -> bool {
        self.events.set(events)
    }

    fn writers(&self) -> MutexGuard<'_, HashMap<StreamId, WriteQueue>> {
        self.writers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Dial the responding peer
    pub async fn dial(self: &Arc<Self>, config: &ShapedConfig) -> Result<()> {
        let bind: SocketAddr = format!("{}:{}", config.bind_address, config.bind_port)
            .parse()
            .context("Invalid shaped bind address")?;
        let peer = resolve(&config.peer_address, config.peer_port).await?;

        let mut endpoint = Endpoint::client(bind).context("Failed to bind QUIC client endpoint")?;
        endpoint.set_default_client_config(client_config(config)?);
        let connection = endpoint
            .connect(peer, &config.server_name)
            .context("Failed to start QUIC handshake")?
            .await
            .with_context(|| format!("QUIC handshake with {} failed", peer))?;
        info!(%peer, "connected to peer middlebox");
        self.install(endpoint, connection);
        Ok(())
    }

    /// Wait for the initiating peer on a server endpoint from [`server_endpoint`]
    pub async fn accept_peer(self: &Arc<Self>, endpoint: Endpoint) -> Result<()> {
        let incoming = endpoint
            .accept()
            .await
            .ok_or_else(|| anyhow!("QUIC endpoint closed before a peer connected"))?;
        let connection = incoming.await.context("QUIC handshake failed")?;
        info!(peer = %connection.remote_address(), "accepted peer middlebox");

        // Only one peer per middlebox
        let extra = endpoint.clone();
        self.runtime.spawn(async move {
            while let Some(incoming) = extra.accept().await {
                warn!(peer = %incoming.remote_address(), "refusing second peer connection");
                incoming.refuse();
            }
        });
        self.install(endpoint, connection);
        Ok(())
    }

    fn install(self: &Arc<Self>, endpoint: Endpoint, connection: Connection) {
        let _ = self.endpoint.set(endpoint);
        if self.connection.set(connection.clone()).is_err() {
            warn!("QUIC transport already connected, ignoring new connection");
            return;
        }
        let this = self.clone();
        self.runtime.spawn(async move {
            loop {
                match connection.accept_bi().await {
                    Ok((send, recv)) => {
                        this.attach(send, recv);
                    }
                    Err(e) => {
                        info!(error = %e, "peer connection closed");
                        break;
                    }
                }
            }
        });
    }

    /// Resolves once the peer connection is gone
    pub async fn closed(&self) {
        if let Some(connection) = self.connection.get() {
            connection.closed().await;
        }
    }

    /// Close the connection and wait for the peer to be notified
    pub async fn shutdown(&self) {
        if let Some(connection) = self.connection.get() {
            connection.close(VarInt::from_u32(0), b"shutdown");
        }
        if let Some(endpoint) = self.endpoint.get() {
            endpoint.wait_idle().await;
        }
    }

    fn attach(&self, send: SendStream, recv: RecvStream) -> StreamId {
        let stream = VarInt::from(send.id()).into_inner();
        let (queue, rx) = write_queue(WRITE_WINDOW);
        self.writers().insert(stream, queue);
        self.runtime.spawn(write_stream(stream, send, rx));
        if let Some(this) = self.me.upgrade() {
            self.runtime.spawn(async move { this.read_stream(stream, recv).await });
        }
        debug!(stream_id = stream, "stream attached");
        stream
    }

    async fn read_stream(&self, stream: StreamId, mut recv: RecvStream) {
        let mut buf = vec![0u8; self.read_chunk];
        let end = loop {
            match recv.read(&mut buf).await {
                Ok(Some(0)) => continue,
                Ok(Some(n)) => {
                    if let Err(e) = self.deliver(stream, &buf[..n]).await {
                        debug!(stream_id = stream, error = %e, "stream refused");
                        let _ = recv.stop(VarInt::from_u32(0));
                        break StreamEnd::Reset;
                    }
                }
                Ok(None) => break StreamEnd::Finished,
                Err(e) => {
                    debug!(stream_id = stream, error = %e, "stream read failed");
                    break StreamEnd::Reset;
                }
            }
        };
        if let Some(events) = self.events.get() {
            events.on_stream_closed(stream, end);
        }
    }

    async fn deliver(&self, stream: StreamId, bytes: &[u8]) -> Result<(), FlowError> {
        deliver_with_backoff(
            || self.events.get().map(|events| events.on_stream_data(stream, bytes)),
            self.backoff,
        )
        .await
    }
}

async fn write_stream(stream: StreamId, mut send: SendStream, mut rx: WriteQueueReceiver) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Data(bytes) => {
                if let Err(e) = send.write_all(&bytes).await {
                    warn!(stream_id = stream, error = %e, "stream write failed");
                    break;
                }
                rx.written(bytes.len());
            }
            WriteOp::Finish => {
                if let Err(e) = send.finish() {
                    debug!(stream_id = stream, error = %e, "stream finish failed");
                }
                break;
            }
        }
    }
}

impl ShapedTransport for QuicStreams {
    fn open_stream(&self) -> Result<StreamId, TransportError> {
        let connection = self.connection.get().cloned().ok_or(TransportError::NotConnected)?;
        let (send, recv) = self
            .runtime
            .block_on(connection.open_bi())
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(self.attach(send, recv))
    }

    fn send_on_stream(&self, stream: StreamId, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.writers()
            .get(&stream)
            .ok_or(TransportError::UnknownStream(stream))?
            .send(bytes)
    }

    fn close_stream(&self, stream: StreamId) -> Result<(), TransportError> {
        self.writers()
            .remove(&stream)
            .ok_or(TransportError::UnknownStream(stream))?
            .finish()
    }

    /// Unknown streams report unlimited room; the write that follows fails
    fn write_capacity(&self, stream: StreamId) -> usize {
        self.writers().get(&stream).map_or(usize::MAX, WriteQueue::capacity)
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("Failed to resolve {}:{}", host, port))?
        .next()
        .ok_or_else(|| anyhow!("No address found for {}:{}", host, port))
}

/// Bind the listening endpoint of the responding peer
pub fn server_endpoint(config: &ShapedConfig) -> Result<Endpoint> {
    let bind: SocketAddr = format!("{}:{}", config.bind_address, config.bind_port)
        .parse()
        .context("Invalid shaped bind address")?;
    let (cert_chain, key) = load_or_generate_identity(config)?;
    let mut server_config = ServerConfig::with_single_cert(cert_chain, key).context("Invalid QUIC server identity")?;
    server_config.transport_config(Arc::new(transport_config(config)?));
    let endpoint = Endpoint::server(server_config, bind).context("Failed to bind QUIC server endpoint")?;
    info!(address = ?endpoint.local_addr().ok(), "QUIC endpoint listening");
    Ok(endpoint)
}

fn client_config(config: &ShapedConfig) -> Result<ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in read_certs(&config.ca_cert_path)? {
        roots.add(cert).context("Invalid CA certificate")?;
    }
    let mut client_config = ClientConfig::with_root_certificates(Arc::new(roots)).context("Invalid QUIC client trust roots")?;
    client_config.transport_config(Arc::new(transport_config(config)?));
    Ok(client_config)
}

fn transport_config(config: &ShapedConfig) -> Result<TransportConfig> {
    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(Some(IdleTimeout::try_from(Duration::from_millis(config.idle_timeout_ms))?));
    // Control and dummy streams come on top of the flows
    transport.max_concurrent_bidi_streams(VarInt::from_u32(config.max_streams.saturating_add(2)));
    transport.keep_alive_interval(Some(Duration::from_millis(config.idle_timeout_ms / 3)));
    Ok(transport)
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path).with_context(|| format!("Failed to open certificate file {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certificate")?;
    if certs.is_empty() {
        return Err(anyhow!("No certificate found in {}", path.display()));
    }
    Ok(certs)
}

/// Load the server identity, generating a self-signed one when absent
pub fn load_or_generate_identity(config: &ShapedConfig) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    if !config.cert_path.exists() || !config.key_path.exists() {
        generate_self_signed(config)?;
    }
    let certs = read_certs(&config.cert_path)?;
    let key_file = fs::File::open(&config.key_path)
        .with_context(|| format!("Failed to open private key file {}", config.key_path.display()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .context("Failed to parse private key")?
        .ok_or_else(|| anyhow!("No private key found in {}", config.key_path.display()))?;
    Ok((certs, key))
}

fn generate_self_signed(config: &ShapedConfig) -> Result<()> {
    let names = vec![config.server_name.clone(), "localhost".to_string(), "127.0.0.1".to_string()];
    let certified_key = rcgen::generate_simple_self_signed(names).context("Failed to generate certificate")?;
    for path in [&config.cert_path, &config.key_path] {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    fs::write(&config.cert_path, certified_key.cert.pem())
        .with_context(|| format!("Failed to write {}", config.cert_path.display()))?;
    fs::write(&config.key_path, certified_key.signing_key.serialize_pem())
        .with_context(|| format!("Failed to write {}", config.key_path.display()))?;
    warn!(cert = %config.cert_path.display(), "generated self-signed QUIC certificate");
    Ok(())
}
