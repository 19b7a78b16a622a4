use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Once};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use quinn::crypto::rustls::QuicServerConfig;
use quinn::{ConnectionError, Endpoint, RecvStream, SendStream};
use rustls::crypto::ring::default_provider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Registers a global default tracing subscriber when called for the first time. This is intended
/// for use in tests.
pub fn subscribe() {
    static INSTALL_TRACING_SUBSCRIBER: Once = Once::new();
    INSTALL_TRACING_SUBSCRIBER.call_once(|| {
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .finish();
        tracing::subscriber::set_global_default(subscriber).unwrap();
    });
}

/// The name in the certificate of every test server
pub const SERVER_NAME: &str = "dns.example.com";

/// Name with A records on the test servers
pub const GOOGLE_NAME: &str = "dns.google.";

/// Addresses served for [`GOOGLE_NAME`]
pub const GOOGLE_ADDRS: [Ipv4Addr; 2] = [Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)];

/// A self-signed certificate for [`SERVER_NAME`]
pub struct TestPki {
    cert: CertificateDer<'static>,
    key: PrivatePkcs8KeyDer<'static>,
}

impl TestPki {
    pub fn new() -> Self {
        let certified = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_owned()]).unwrap();
        Self {
            cert: certified.cert.der().clone(),
            key: PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()),
        }
    }

    /// A client configuration which trusts only this certificate
    pub fn client_config(&self, alpn: &[u8]) -> ClientConfig {
        let mut roots = RootCertStore::empty();
        roots.add(self.cert.clone()).unwrap();

        let mut config = ClientConfig::builder_with_provider(Arc::new(default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![alpn.to_vec()];
        config
    }

    fn server_config(&self, alpn: &[u8]) -> ServerConfig {
        let mut config = ServerConfig::builder_with_provider(Arc::new(default_provider()))
            .with_protocol_versions(&[&rustls::version::TLS13])
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(
                vec![self.cert.clone()],
                PrivateKeyDer::Pkcs8(self.key.clone_key()),
            )
            .unwrap();
        config.alpn_protocols = vec![alpn.to_vec()];
        config
    }
}

impl Default for TestPki {
    fn default() -> Self {
        Self::new()
    }
}

/// How a test server replies to queries
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behavior {
    /// Answers [`GOOGLE_NAME`] with [`GOOGLE_ADDRS`], everything else with NXDOMAIN
    Answer,
    /// Replies REFUSED with an ID that does not match the query
    ForgeRefused,
    /// Reads queries and never replies
    Silent,
}

/// Builds the reply to `raw_query`, `None` when the server stays silent
pub fn reply(raw_query: &[u8], behavior: Behavior) -> Option<Vec<u8>> {
    if behavior == Behavior::Silent {
        return None;
    }

    let query = Message::from_vec(raw_query).unwrap();
    let mut reply = Message::new();
    reply
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(query.op_code())
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(true)
        .add_queries(query.queries().to_vec());

    if behavior == Behavior::ForgeRefused {
        reply
            .set_id(query.id().wrapping_add(1))
            .set_response_code(ResponseCode::Refused);
        return Some(reply.to_vec().unwrap());
    }

    let google = Name::from_ascii(GOOGLE_NAME).unwrap();
    for question in query.queries() {
        if question.name() == &google && question.query_type() == RecordType::A {
            for addr in GOOGLE_ADDRS {
                reply.add_answer(Record::from_rdata(google.clone(), 300, RData::A(A(addr))));
            }
        } else {
            reply.set_response_code(ResponseCode::NXDomain);
        }
    }

    Some(reply.to_vec().unwrap())
}

fn frame(raw: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(raw.len() + 2);
    framed.extend_from_slice(&(raw.len() as u16).to_be_bytes());
    framed.extend_from_slice(raw);
    framed
}

/// Serves length-prefixed queries until the client closes the connection
async fn serve_stream<S: AsyncRead + AsyncWrite + Unpin>(mut stream: S, behavior: Behavior) {
    loop {
        let length = match stream.read_u16().await {
            Ok(length) => length,
            Err(e) => {
                debug!("stream closed: {e}");
                return;
            }
        };

        let mut raw_query = vec![0; usize::from(length)];
        if let Err(e) = stream.read_exact(&mut raw_query).await {
            error!("failed to read query: {e}");
            return;
        }

        let Some(raw_reply) = reply(&raw_query, behavior) else {
            continue;
        };
        if let Err(e) = stream.write_all(&frame(&raw_reply)).await {
            error!("failed to write reply: {e}");
            return;
        }
        let _ = stream.flush().await;
    }
}

/// A DNS over TCP server on a random local port
pub struct TcpServer {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl TcpServer {
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        info!("TCP server listening on {addr}");

        let task = tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                debug!("TCP connection from {peer}");
                tokio::spawn(serve_stream(stream, behavior));
            }
        });

        Self { addr, task }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A DNS over TLS server on a random local port
pub struct TlsServer {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl TlsServer {
    pub async fn start(pki: &TestPki, behavior: Behavior) -> Self {
        let acceptor = TlsAcceptor::from(Arc::new(pki.server_config(b"dot")));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        info!("TLS server listening on {addr}");

        let task = tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(stream) => serve_stream(stream, behavior).await,
                        Err(e) => error!("TLS handshake with {peer} failed: {e}"),
                    }
                });
            }
        });

        Self { addr, task }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for TlsServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A DNS over QUIC server on a random local port.
///
/// Queries are only answered once the client finished its side of the stream, as RFC 9250
/// requires. The application error code of every connection the client closes is recorded.
pub struct QuicServer {
    addr: SocketAddr,
    task: JoinHandle<()>,
    closes: Mutex<mpsc::UnboundedReceiver<Option<u64>>>,
}

impl QuicServer {
    pub async fn start(pki: &TestPki, behavior: Behavior) -> Self {
        let crypto = QuicServerConfig::try_from(pki.server_config(b"doq")).unwrap();
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        let endpoint = Endpoint::server(server_config, ([127, 0, 0, 1], 0).into()).unwrap();
        let addr = endpoint.local_addr().unwrap();
        info!("QUIC server listening on {addr}");

        let (closes_tx, closes) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Some(incoming) = endpoint.accept().await {
                let closes_tx = closes_tx.clone();
                tokio::spawn(async move {
                    let connection = match incoming.await {
                        Ok(connection) => connection,
                        Err(e) => {
                            error!("QUIC handshake failed: {e}");
                            return;
                        }
                    };

                    loop {
                        match connection.accept_bi().await {
                            Ok((send, recv)) => {
                                tokio::spawn(serve_quic_stream(send, recv, behavior));
                            }
                            Err(ConnectionError::ApplicationClosed(close)) => {
                                debug!("client closed connection: {close}");
                                let _ = closes_tx.send(Some(close.error_code.into_inner()));
                                return;
                            }
                            Err(e) => {
                                debug!("connection lost: {e}");
                                let _ = closes_tx.send(None);
                                return;
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            task,
            closes: Mutex::new(closes),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Waits for the next connection to end, returning the application error code the client
    /// closed it with, or `None` if it ended otherwise
    pub async fn next_close(&self) -> Option<u64> {
        let mut closes = self.closes.lock().await;
        tokio::time::timeout(Duration::from_secs(5), closes.recv())
            .await
            .expect("timed out waiting for the connection to close")
            .flatten()
    }
}

impl Drop for QuicServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_quic_stream(mut send: SendStream, mut recv: RecvStream, behavior: Behavior) {
    // resolves only after the STREAM FIN
    let raw = match recv.read_to_end(usize::from(u16::MAX) + 2).await {
        Ok(raw) => raw,
        Err(e) => {
            debug!("failed to read query: {e}");
            return;
        }
    };

    if raw.len() < 2 || usize::from(u16::from_be_bytes([raw[0], raw[1]])) != raw.len() - 2 {
        error!("malformed query frame of {} bytes", raw.len());
        return;
    }

    let Some(raw_reply) = reply(&raw[2..], behavior) else {
        let _ = send.stopped().await;
        return;
    };

    if let Err(e) = send.write_all(&frame(&raw_reply)).await {
        error!("failed to write reply: {e}");
        return;
    }
    let _ = send.finish();
    let _ = send.stopped().await;
}
