//! Cluster transport: TCP listener (incoming), dialer (outbound to configured endpoints),
//! identity handshake, then hand the socket to the core as a framed `Stream`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use peerlink_core::{ApiService, ConnectionRole, Stream, LOG_TARGET, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_IDENTITY_LEN: usize = 255;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

fn invalid(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_owned())
}

/// version (u8) + identity length (u16 LE) + UTF-8 identity.
pub async fn write_identity<W: AsyncWrite + Unpin>(w: &mut W, identity: &str) -> std::io::Result<()> {
    if identity.is_empty() || identity.len() > MAX_IDENTITY_LEN {
        return Err(invalid("identity length out of range"));
    }
    let mut out = Vec::with_capacity(3 + identity.len());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&(identity.len() as u16).to_le_bytes());
    out.extend_from_slice(identity.as_bytes());
    w.write_all(&out).await?;
    w.flush().await
}

pub async fn read_identity<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<String> {
    let mut head = [0u8; 3];
    r.read_exact(&mut head).await?;
    if head[0] != PROTOCOL_VERSION {
        return Err(invalid("unsupported protocol version"));
    }
    let len = u16::from_le_bytes([head[1], head[2]]) as usize;
    if len == 0 || len > MAX_IDENTITY_LEN {
        return Err(invalid("identity length out of range"));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| invalid("identity is not UTF-8"))
}

/// Acceptor side: read the peer's identity first, then send ours.
pub async fn handshake_accept<S: AsyncRead + AsyncWrite + Unpin>(
    io: &mut S,
    identity: &str,
) -> std::io::Result<String> {
    let peer = read_identity(io).await?;
    write_identity(io, identity).await?;
    Ok(peer)
}

/// Dialer side: send our identity, then read the peer's.
pub async fn handshake_connect<S: AsyncRead + AsyncWrite + Unpin>(
    io: &mut S,
    identity: &str,
) -> std::io::Result<String> {
    write_identity(io, identity).await?;
    read_identity(io).await
}

async fn with_timeout<T>(
    fut: impl Future<Output = std::io::Result<T>>,
) -> std::io::Result<T> {
    tokio::time::timeout(HANDSHAKE_TIMEOUT, fut)
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake timed out"))?
}

/// Accept incoming connections for as long as the task runs.
pub async fn run_listener(service: Arc<ApiService>, listener: TcpListener, identity: String) {
    let listener = Arc::new(listener);
    serve(service, identity, move || {
        let listener = listener.clone();
        async move {
            let (socket, addr) = listener.accept().await?;
            Ok::<_, std::io::Error>((socket, addr.to_string()))
        }
    })
    .await
}

/// Accept loop over any source of incoming streams. Accept errors (EMFILE,
/// ECONNABORTED, ...) are logged and retried after a short pause.
async fn serve<S, F, Fut>(service: Arc<ApiService>, identity: String, mut accept: F)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<(S, String)>>,
{
    loop {
        let (mut socket, addr) = match accept().await {
            Ok(incoming) => incoming,
            Err(e) => {
                warn!(target: LOG_TARGET, "Cannot accept incoming connection: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let service = service.clone();
        let identity = identity.clone();
        tokio::spawn(async move {
            match with_timeout(handshake_accept(&mut socket, &identity)).await {
                Ok(peer) => {
                    service.add_connection(peer, Stream::new(socket), ConnectionRole::Server);
                }
                Err(e) => {
                    warn!(target: LOG_TARGET, %addr, "Handshake with incoming connection failed: {}", e);
                }
            }
        });
    }
}

/// Periodically dial every configured endpoint that has an address, lives outside the
/// local zone and has no connection yet.
pub async fn run_reconnect(service: Arc<ApiService>, identity: String, interval: Duration) {
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        timer.tick().await;
        let mut attempts = JoinSet::new();
        let topology = service.topology();
        for endpoint in topology.endpoints() {
            if endpoint.name() == identity
                || topology.is_local_zone(endpoint.zone_name())
                || endpoint.is_connected()
            {
                continue;
            }
            let Some(host) = endpoint.host() else {
                continue;
            };
            let addr = format!("{}:{}", host, endpoint.port());
            let expected = endpoint.name().to_owned();
            let service = service.clone();
            let identity = identity.clone();
            attempts.spawn(async move {
                debug!(target: LOG_TARGET, endpoint = %expected, %addr, "Reconnecting to endpoint '{}'", expected);
                if let Err(e) = connect(&service, &addr, &identity, &expected).await {
                    warn!(target: LOG_TARGET, endpoint = %expected, %addr, "Cannot connect to endpoint '{}': {}", expected, e);
                }
            });
        }
        while attempts.join_next().await.is_some() {}
    }
}

async fn connect(
    service: &Arc<ApiService>,
    addr: &str,
    identity: &str,
    expected: &str,
) -> std::io::Result<()> {
    let mut socket = with_timeout(async { TcpStream::connect(addr).await }).await?;
    let peer = with_timeout(handshake_connect(&mut socket, identity)).await?;
    if peer != expected {
        warn!(
            target: LOG_TARGET,
            "Endpoint at {} identified as '{}', expected '{}'", addr, peer, expected
        );
    }
    service.add_connection(peer, Stream::new(socket), ConnectionRole::Client);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_core::{Endpoint, RpcFunctionRegistry, Topology};
    use std::io;

    #[tokio::test]
    async fn handshake_exchanges_identities() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let (acc, dial) = tokio::join!(
            handshake_accept(&mut a, "master1"),
            handshake_connect(&mut b, "sat1"),
        );
        assert_eq!(acc.unwrap(), "sat1");
        assert_eq!(dial.unwrap(), "master1");
    }

    #[tokio::test]
    async fn wrong_version_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        b.write_all(&[PROTOCOL_VERSION + 1, 1, 0, b'x']).await.unwrap();
        let err = read_identity(&mut a).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn empty_identity_is_rejected() {
        let (mut a, _b) = tokio::io::duplex(1024);
        assert!(write_identity(&mut a, "").await.is_err());
    }

    #[tokio::test]
    async fn truncated_identity_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        b.write_all(&[PROTOCOL_VERSION, 5, 0, b'a', b'b']).await.unwrap();
        drop(b);
        let err = read_identity(&mut a).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn accept_errors_do_not_stop_the_listener() {
        let topology = Topology::builder("master")
            .zone("master", None)
            .endpoint(Endpoint::new("master1", "master"))
            .endpoint(Endpoint::new("sat1", "master"))
            .build()
            .unwrap();
        let service = ApiService::new(Arc::new(topology), RpcFunctionRegistry::with_builtins());

        let (mut dialer, accepted) = tokio::io::duplex(1024);
        let mut incoming = vec![
            Err(io::Error::from(io::ErrorKind::ConnectionAborted)),
            Err(io::Error::new(io::ErrorKind::Other, "too many open files")),
            Ok((accepted, "duplex".to_owned())),
        ]
        .into_iter();
        let server = tokio::spawn(serve(service.clone(), "master1".to_owned(), move || {
            let next = incoming.next();
            async move {
                match next {
                    Some(result) => result,
                    None => std::future::pending().await,
                }
            }
        }));

        let peer = handshake_connect(&mut dialer, "sat1").await.unwrap();
        assert_eq!(peer, "master1");
        let sat1 = service.topology().endpoint("sat1").unwrap();
        for _ in 0..100 {
            if sat1.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(sat1.is_connected());

        server.abort();
        service.shutdown().await;
    }
}
