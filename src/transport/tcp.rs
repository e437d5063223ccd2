//! Tokio transport: TCP and TLS byte streams, HTTP exchanges over reqwest.
//!
//! Raw templates get a bidirectional byte stream, wrapped in rustls when the
//! template requires TLS. HTTP templates send one request built from the
//! template and report the response status and mapped response headers with
//! `Connected`, then the body as `Data`, then `Closed`.
//!
//! TLS connections trust only the certificates of the template's trust
//! store; a TLS template without one fails with [`TransportError::Tls`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

use super::event::{ConnectRequest, ConnectionId, TransportEvent};
use super::provider::{EventSink, Transport};
use crate::core::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_RECV_BUFFER_SIZE, TransportError};
use crate::policy::TrustChain;

#[derive(Debug)]
enum Command {
    Send(Vec<u8>),
    Close,
}

#[derive(Debug)]
struct ConnectionTask {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

/// Tokio TCP / TLS / HTTP provider.
#[derive(Debug)]
pub struct TcpTransport {
    connections: HashMap<ConnectionId, ConnectionTask>,
    connect_timeout: Duration,
    recv_buffer_size: usize,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransport {
    /// Create a transport with default settings.
    pub fn new() -> Self {
        TcpTransportBuilder::new().build()
    }

    /// Start configuring a transport.
    pub fn builder() -> TcpTransportBuilder {
        TcpTransportBuilder::new()
    }

    /// Connections with a live task.
    pub fn active_connections(&self) -> usize {
        self.connections
            .values()
            .filter(|connection| !connection.task.is_finished())
            .count()
    }

    fn reap(&mut self) {
        self.connections.retain(|_, connection| !connection.task.is_finished());
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self, conn: ConnectionId, request: ConnectRequest, sink: EventSink) {
        self.reap();

        let (commands, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_connection(
            conn,
            request,
            sink,
            receiver,
            self.connect_timeout,
            self.recv_buffer_size,
        ));
        self.connections.insert(conn, ConnectionTask { commands, task });
    }

    fn send(&mut self, conn: ConnectionId, payload: Vec<u8>) {
        match self.connections.get(&conn) {
            Some(connection) => {
                let _ = connection.commands.send(Command::Send(payload));
            }
            None => trace!(%conn, "send on unknown connection"),
        }
    }

    fn close(&mut self, conn: ConnectionId) {
        if let Some(connection) = self.connections.remove(&conn) {
            let _ = connection.commands.send(Command::Close);
            connection.task.abort();
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        for (_, connection) in self.connections.drain() {
            connection.task.abort();
        }
    }
}

/// Builder for [`TcpTransport`].
#[derive(Debug, Clone)]
pub struct TcpTransportBuilder {
    connect_timeout: Duration,
    recv_buffer_size: usize,
}

impl Default for TcpTransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransportBuilder {
    /// Create a builder with default options.
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
        }
    }

    /// Set the connect timeout, applied to the TCP connect and the TLS
    /// handshake.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the receive buffer size.
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size.max(1);
        self
    }

    /// Build the transport.
    pub fn build(self) -> TcpTransport {
        TcpTransport {
            connections: HashMap::new(),
            connect_timeout: self.connect_timeout,
            recv_buffer_size: self.recv_buffer_size,
        }
    }
}

async fn run_connection(
    conn: ConnectionId,
    request: ConnectRequest,
    sink: EventSink,
    mut commands: mpsc::UnboundedReceiver<Command>,
    connect_timeout: Duration,
    buffer_size: usize,
) {
    let result = if request.protocol.is_http() {
        http_exchange(conn, &request, &sink, &mut commands, connect_timeout).await
    } else {
        raw_connection(conn, &request, &sink, &mut commands, connect_timeout, buffer_size).await
    };

    if let Err(error) = result {
        debug!(%conn, %error, "connection failed");
        sink.post(conn, TransportEvent::Failed(error));
    }
}

async fn open(request: &ConnectRequest, timeout: Duration) -> Result<TcpStream, TransportError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((request.endpoint.as_str(), request.port))
        .await
        .map_err(|e| TransportError::Dns(format!("{}: {e}", request.endpoint)))?
        .collect();
    if addrs.is_empty() {
        return Err(TransportError::Dns(format!("{}: no addresses", request.endpoint)));
    }

    let mut last_error = String::new();
    for addr in addrs {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = format!("timed out after {timeout:?}"),
        }
    }
    Err(TransportError::Connect(format!(
        "{}:{}: {last_error}",
        request.endpoint, request.port
    )))
}

fn io_error(error: std::io::Error) -> TransportError {
    TransportError::Io(error.to_string())
}

fn trust_chain(request: &ConnectRequest) -> Result<&TrustChain, TransportError> {
    request.trust.as_ref().ok_or_else(|| {
        TransportError::Tls(format!("{}: no trust store bound", request.endpoint))
    })
}

/// Client config trusting exactly the chain's certificates.
fn tls_config(trust: &TrustChain) -> Result<Arc<ClientConfig>, TransportError> {
    let mut roots = RootCertStore::empty();
    for certificate in &trust.certificates {
        roots
            .add(CertificateDer::from(certificate.der().to_vec()))
            .map_err(|e| TransportError::Tls(format!("certificate {}: {e}", certificate.name)))?;
    }

    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| TransportError::Tls(e.to_string()))?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(Arc::new(config))
}

async fn raw_connection(
    conn: ConnectionId,
    request: &ConnectRequest,
    sink: &EventSink,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    connect_timeout: Duration,
    buffer_size: usize,
) -> Result<(), TransportError> {
    // Bad trust material fails before touching the network.
    let connector = if request.tls {
        Some(TlsConnector::from(tls_config(trust_chain(request)?)?))
    } else {
        None
    };

    let stream = open(request, connect_timeout).await?;
    debug!(%conn, endpoint = %request.endpoint, port = request.port, "tcp connected");

    let Some(connector) = connector else {
        return raw_session(conn, stream, sink, commands, buffer_size).await;
    };

    let name = ServerName::try_from(request.endpoint.clone())
        .map_err(|e| TransportError::Tls(format!("server name {}: {e}", request.endpoint)))?;
    let stream = tokio::time::timeout(connect_timeout, connector.connect(name, stream))
        .await
        .map_err(|_| TransportError::Tls(format!("handshake timed out after {connect_timeout:?}")))?
        .map_err(|e| TransportError::Tls(format!("handshake failed: {e}")))?;
    debug!(%conn, endpoint = %request.endpoint, "tls established");

    raw_session(conn, stream, sink, commands, buffer_size).await
}

async fn raw_session<S>(
    conn: ConnectionId,
    stream: S,
    sink: &EventSink,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    buffer_size: usize,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    sink.post(conn, TransportEvent::connected(None));
    sink.post(conn, TransportEvent::Writable);

    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buffer = vec![0u8; buffer_size];
    loop {
        tokio::select! {
            read = reader.read(&mut buffer) => match read.map_err(io_error)? {
                0 => {
                    sink.post(conn, TransportEvent::Closed);
                    return Ok(());
                }
                n => {
                    sink.post(conn, TransportEvent::Data { data: buffer[..n].to_vec(), eom: false });
                }
            },
            command = commands.recv() => match command {
                Some(Command::Send(payload)) => {
                    writer.write_all(&payload).await.map_err(io_error)?;
                    writer.flush().await.map_err(io_error)?;
                    sink.post(conn, TransportEvent::Writable);
                }
                Some(Command::Close) | None => {
                    let _ = writer.shutdown().await;
                    return Ok(());
                }
            },
        }
    }
}

/// Resolves once the connection is closed locally.
async fn closed(commands: &mut mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Send(payload) => {
                trace!(len = payload.len(), "ignoring payload on http connection");
            }
            Command::Close => return,
        }
    }
}

async fn http_exchange(
    conn: ConnectionId,
    request: &ConnectRequest,
    sink: &EventSink,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    connect_timeout: Duration,
) -> Result<(), TransportError> {
    let client = http_client(request, connect_timeout)?;
    let method = reqwest::Method::from_bytes(request.http_method.as_deref().unwrap_or("GET").as_bytes())
        .map_err(|e| TransportError::Protocol(format!("http method: {e}")))?;
    let url = request_url(request);
    trace!(%conn, %method, %url, "http request");

    let pending = client
        .request(method, url.as_str())
        .headers(request_headers(conn, request))
        .send();
    let mut response = tokio::select! {
        response = pending => response.map_err(request_error)?,
        () = closed(commands) => return Ok(()),
    };

    let status = response.status().as_u16();
    let metadata = response_metadata(request, response.headers());
    trace!(%conn, status, mapped = metadata.len(), "response head");
    sink.post(conn, TransportEvent::Connected { status: Some(status), metadata });

    loop {
        tokio::select! {
            chunk = response.chunk() => match chunk.map_err(request_error)? {
                Some(data) => {
                    sink.post(conn, TransportEvent::Data { data: data.to_vec(), eom: false });
                }
                None => {
                    sink.post(conn, TransportEvent::Data { data: Vec::new(), eom: true });
                    sink.post(conn, TransportEvent::Closed);
                    return Ok(());
                }
            },
            () = closed(commands) => return Ok(()),
        }
    }
}

/// One client per request: the trust roots differ per template.
fn http_client(
    request: &ConnectRequest,
    connect_timeout: Duration,
) -> Result<reqwest::Client, TransportError> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .tls_built_in_root_certs(false)
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(connect_timeout)
        .user_agent(concat!("secure-streams/", env!("CARGO_PKG_VERSION")));

    if request.tls {
        for certificate in &trust_chain(request)?.certificates {
            let root = reqwest::Certificate::from_der(certificate.der())
                .map_err(|e| TransportError::Tls(format!("certificate {}: {e}", certificate.name)))?;
            builder = builder.add_root_certificate(root);
        }
    }

    builder
        .build()
        .map_err(|e| TransportError::Tls(error_chain(&e)))
}

fn request_url(request: &ConnectRequest) -> String {
    let scheme = if request.tls { "https" } else { "http" };
    let path = request.http_url.as_deref().unwrap_or_default().trim_start_matches('/');
    if request.endpoint.contains(':') {
        format!("{scheme}://[{}]:{}/{path}", request.endpoint, request.port)
    } else {
        format!("{scheme}://{}:{}/{path}", request.endpoint, request.port)
    }
}

/// Stream metadata as request headers, under the mapped header name when
/// the template has one. Names or values that are not valid in a header
/// (CR, LF and other controls) are skipped.
fn request_headers(conn: ConnectionId, request: &ConnectRequest) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &request.metadata {
        let header = request.metadata_headers.get(name).unwrap_or(name);
        match (HeaderName::from_bytes(header.as_bytes()), HeaderValue::from_bytes(value)) {
            (Ok(header), Ok(value)) => {
                headers.insert(header, value);
            }
            _ => warn!(%conn, metadata = %name, "skipping metadata that is not a valid http header"),
        }
    }
    headers
}

fn response_metadata(request: &ConnectRequest, headers: &HeaderMap) -> HashMap<String, Vec<u8>> {
    request
        .metadata_headers
        .iter()
        .filter_map(|(name, header)| {
            let value = headers.get(header.as_str())?;
            Some((name.clone(), value.as_bytes().to_vec()))
        })
        .collect()
}

fn request_error(error: reqwest::Error) -> TransportError {
    let message = error_chain(&error);
    if is_tls_error(&error) {
        TransportError::Tls(message)
    } else if error.is_connect() || error.is_timeout() {
        TransportError::Connect(message)
    } else if error.is_body() || error.is_decode() {
        TransportError::Io(message)
    } else {
        TransportError::Protocol(message)
    }
}

fn is_tls_error(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = Some(error);
    while let Some(error) = source {
        if error.is::<rustls::Error>() {
            return true;
        }
        if let Some(io) = error.downcast_ref::<std::io::Error>() {
            if io.get_ref().is_some_and(|inner| inner.is::<rustls::Error>()) {
                return true;
            }
        }
        source = error.source();
    }
    false
}

fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(error) = source {
        message.push_str(": ");
        message.push_str(&error.to_string());
        source = error.source();
    }
    message
}
