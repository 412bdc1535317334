/// Integration tests for the saturn SOCKS5 proxy server.
///
/// These tests start a server on an ephemeral port and exercise the
/// SOCKS5 protocol over real TCP connections.
use saturn::auth::encode_credentials;
use saturn::codec::{self, SocksRequest};
use saturn::{
    Address, AuthRegistry, Command, Config, NoAuth, ReplyCode, Socks5Server, Timeouts, UserPass,
    UserPassAuth,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Start a server with the given registry and return its address
async fn start_server(registry: AuthRegistry) -> SocketAddr {
    let timeouts = Timeouts {
        handshake: Duration::from_millis(500),
        connect: Duration::from_secs(2),
    };
    let mut server = Socks5Server::new("127.0.0.1:0", registry)
        .unwrap()
        .with_timeouts(timeouts);
    let addr = server.bind().await.unwrap();
    tokio::spawn(async move { server.run().await });
    addr
}

fn no_auth() -> AuthRegistry {
    let mut registry = AuthRegistry::new();
    registry.register(NoAuth).unwrap();
    registry
}

fn userpass_only() -> AuthRegistry {
    let mut registry = AuthRegistry::new();
    registry
        .register(UserPassAuth::new(vec![UserPass {
            username: "user".into(),
            password: "pass".into(),
        }]))
        .unwrap();
    registry
}

/// Start a TCP echo server that echoes back whatever it receives
async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
                let _ = wr.shutdown().await;
            });
        }
    });
    addr
}

async fn read_exact_timeout(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(IO_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    buf
}

/// Read until the proxy closes the connection
async fn read_to_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = timeout(IO_TIMEOUT, stream.read_to_end(&mut buf))
        .await
        .expect("proxy did not close the connection");
    buf
}

/// Helper: perform SOCKS5 handshake with NO_AUTH
async fn handshake_no_auth(stream: &mut TcpStream) {
    stream.write_all(&[5, 1, 0]).await.unwrap();
    assert_eq!(read_exact_timeout(stream, 2).await, vec![5, 0]);
}

/// Helper: send a CONNECT and return the decoded reply status
async fn connect(stream: &mut TcpStream, target: Address) -> ReplyCode {
    let request = codec::encode_request(&SocksRequest {
        command: Command::Connect,
        address: target,
    });
    stream.write_all(&request).await.unwrap();

    // VER REP RSV ATYP, then the bound address
    let head = read_exact_timeout(stream, 4).await;
    let rest_len = match head[3] {
        0x01 => 4 + 2,
        0x04 => 16 + 2,
        other => panic!("unexpected ATYP in reply: {other}"),
    };
    let mut reply = head;
    reply.extend(read_exact_timeout(stream, rest_len).await);
    codec::decode_reply(&reply).unwrap().status
}

#[tokio::test]
async fn test_connect_echo_no_auth() {
    let proxy = start_server(no_auth()).await;
    let echo = start_echo_server().await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    handshake_no_auth(&mut stream).await;
    assert_eq!(connect(&mut stream, echo.into()).await, ReplyCode::Succeeded);

    stream.write_all(b"hello through saturn").await.unwrap();
    assert_eq!(read_exact_timeout(&mut stream, 20).await, b"hello through saturn");
}

#[tokio::test]
async fn test_connect_by_domain_name() {
    let proxy = start_server(no_auth()).await;
    let echo = start_echo_server().await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    handshake_no_auth(&mut stream).await;
    let target = Address::DomainName("localhost".into(), echo.port());
    assert_eq!(connect(&mut stream, target).await, ReplyCode::Succeeded);

    stream.write_all(b"dns").await.unwrap();
    assert_eq!(read_exact_timeout(&mut stream, 3).await, b"dns");
}

#[tokio::test]
async fn test_half_close_through_proxy() {
    let proxy = start_server(no_auth()).await;
    let echo = start_echo_server().await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    handshake_no_auth(&mut stream).await;
    assert_eq!(connect(&mut stream, echo.into()).await, ReplyCode::Succeeded);

    // Send everything, half-close, and still receive the full echo
    stream.write_all(b"request body").await.unwrap();
    stream.shutdown().await.unwrap();
    assert_eq!(read_to_close(&mut stream).await, b"request body");
}

#[tokio::test]
async fn test_connection_refused() {
    let proxy = start_server(no_auth()).await;
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    handshake_no_auth(&mut stream).await;
    assert_eq!(
        connect(&mut stream, closed.into()).await,
        ReplyCode::ConnectionRefused
    );
    assert!(read_to_close(&mut stream).await.is_empty());
}

#[tokio::test]
async fn test_no_acceptable_method() {
    let proxy = start_server(no_auth()).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[5, 1, 2]).await.unwrap();
    assert_eq!(read_to_close(&mut stream).await, vec![5, 0xFF]);
}

#[tokio::test]
async fn test_userpass_auth() {
    let proxy = start_server(userpass_only()).await;
    let echo = start_echo_server().await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[5, 2, 0, 2]).await.unwrap();
    assert_eq!(read_exact_timeout(&mut stream, 2).await, vec![5, 2]);

    stream
        .write_all(&encode_credentials("user", "pass"))
        .await
        .unwrap();
    assert_eq!(read_exact_timeout(&mut stream, 2).await, vec![1, 0]);

    assert_eq!(connect(&mut stream, echo.into()).await, ReplyCode::Succeeded);
    stream.write_all(b"authed").await.unwrap();
    assert_eq!(read_exact_timeout(&mut stream, 6).await, b"authed");
}

#[tokio::test]
async fn test_userpass_wrong_password() {
    let proxy = start_server(userpass_only()).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[5, 1, 2]).await.unwrap();
    assert_eq!(read_exact_timeout(&mut stream, 2).await, vec![5, 2]);

    stream
        .write_all(&encode_credentials("user", "wrong"))
        .await
        .unwrap();
    let status = read_to_close(&mut stream).await;
    assert_eq!(status.len(), 2);
    assert_eq!(status[0], 1);
    assert_ne!(status[1], 0);
}

#[tokio::test]
async fn test_pipelined_handshake() {
    let proxy = start_server(userpass_only()).await;
    let echo = start_echo_server().await;

    let mut input = vec![5, 1, 2];
    input.extend(encode_credentials("user", "pass"));
    input.extend(codec::encode_request(&SocksRequest {
        command: Command::Connect,
        address: echo.into(),
    }));
    input.extend_from_slice(b"payload");

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&input).await.unwrap();

    let out = read_exact_timeout(&mut stream, 2 + 2 + 10 + 7).await;
    assert_eq!(&out[..4], &[5, 2, 1, 0]);
    assert_eq!(out[5], ReplyCode::Succeeded as u8);
    assert_eq!(&out[14..], b"payload");
}

#[tokio::test]
async fn test_bind_not_supported() {
    let proxy = start_server(no_auth()).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    handshake_no_auth(&mut stream).await;
    stream
        .write_all(&[5, 2, 0, 1, 127, 0, 0, 1, 0, 80])
        .await
        .unwrap();
    let reply = read_to_close(&mut stream).await;
    assert_eq!(&reply[..2], &[5, ReplyCode::CommandNotSupported as u8]);
}

#[tokio::test]
async fn test_idle_client_is_dropped() {
    let proxy = start_server(no_auth()).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    // Partial greeting, then silence
    stream.write_all(&[5]).await.unwrap();
    assert!(read_to_close(&mut stream).await.is_empty());
}

#[tokio::test]
async fn test_one_bad_client_does_not_affect_others() {
    let proxy = start_server(no_auth()).await;
    let echo = start_echo_server().await;

    let mut bad = TcpStream::connect(proxy).await.unwrap();
    bad.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    assert!(read_to_close(&mut bad).await.is_empty());

    let mut good = TcpStream::connect(proxy).await.unwrap();
    handshake_no_auth(&mut good).await;
    assert_eq!(connect(&mut good, echo.into()).await, ReplyCode::Succeeded);
}

#[tokio::test]
async fn test_server_from_config() {
    let config = Config::from_toml(
        r#"
        listen = "127.0.0.1:0"

        [[auth]]
        method = "userpass"
        users = [{ username = "alice", password = "secret" }]
        "#,
    )
    .unwrap();
    let mut server = Socks5Server::from_config(&config).unwrap();
    let proxy = server.bind().await.unwrap();
    tokio::spawn(async move { server.run().await });

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[5, 1, 2]).await.unwrap();
    assert_eq!(read_exact_timeout(&mut stream, 2).await, vec![5, 2]);
    stream
        .write_all(&encode_credentials("alice", "secret"))
        .await
        .unwrap();
    assert_eq!(read_exact_timeout(&mut stream, 2).await, vec![1, 0]);
}
