use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{sleep, timeout};

use sipnet::config::ListenerConfig;
use sipnet::sip::SipMethod;
use sipnet::transport::transaction_branch;
use sipnet::{Incoming, Listener, ListenerError, Transport};

const ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn options(branch: Option<&str>, call_id: &str) -> String {
    let via = match branch {
        Some(b) => format!("Via: SIP/2.0/UDP 127.0.0.1:5062;branch={}\r\n", b),
        None => String::new(),
    };
    format!(
        "OPTIONS sip:bob@127.0.0.1 SIP/2.0\r\n\
         {via}\
         From: <sip:alice@127.0.0.1>;tag=a1\r\n\
         To: <sip:bob@127.0.0.1>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 OPTIONS\r\n\
         Content-Length: 0\r\n\r\n"
    )
}

async fn next(listener: &Listener) -> Result<Incoming, ListenerError> {
    timeout(ACCEPT_TIMEOUT, listener.accept_request())
        .await
        .expect("accept_request timed out")
}

async fn bind_local(config: ListenerConfig) -> Result<Listener, ListenerError> {
    Listener::bind_with("127.0.0.1:0", config).await
}

#[tokio::test]
async fn tcp_and_udp_share_the_bound_port() -> TestResult {
    let listener = Listener::bind("127.0.0.1:0").await?;
    assert_ne!(listener.local_addr().port(), 0);
    assert_eq!(listener.local_addr(), listener.udp_local_addr());
    listener.close().await?;
    Ok(())
}

#[tokio::test]
async fn udp_retransmission_is_delivered_once_per_window() -> TestResult {
    let listener = bind_local(ListenerConfig {
        branch_retention: Duration::from_millis(300),
        branch_sweep_interval: Duration::from_millis(100),
        ..ListenerConfig::default()
    })
    .await?;
    let client = UdpSocket::bind("127.0.0.1:0").await?;
    client.connect(listener.udp_local_addr()).await?;

    let first = options(Some("z9hG4bK-abc123"), "call-1");
    client.send(first.as_bytes()).await?;
    let got = next(&listener).await?;
    assert_eq!(got.request.method, SipMethod::Options);
    assert_eq!(transaction_branch(&got.request).as_deref(), Some("z9hG4bK-abc123"));
    assert_eq!(got.conn.transport(), Transport::Udp);
    assert_eq!(got.conn.peer_addr(), client.local_addr()?);

    // 同一バイト列の再送は捨てられ、次のリクエストが先に出てくる
    client.send(first.as_bytes()).await?;
    client.send(options(Some("z9hG4bK-next"), "call-2").as_bytes()).await?;
    let second = next(&listener).await?;
    assert_eq!(second.request.header_value("Call-ID"), Some("call-2"));
    assert!(Arc::ptr_eq(&got.conn, &second.conn));

    sleep(Duration::from_millis(500)).await;
    client.send(first.as_bytes()).await?;
    let again = next(&listener).await?;
    assert_eq!(again.request.header_value("Call-ID"), Some("call-1"));
    assert_eq!(listener.udp_peer_count(), 1);

    listener.close().await?;
    Ok(())
}

#[tokio::test]
async fn udp_peers_get_their_own_connection() -> TestResult {
    let listener = Listener::bind("127.0.0.1:0").await?;
    let a = UdpSocket::bind("127.0.0.1:0").await?;
    let b = UdpSocket::bind("127.0.0.1:0").await?;

    a.send_to(options(Some("z9hG4bK-peer-a"), "a").as_bytes(), listener.udp_local_addr())
        .await?;
    let from_a = next(&listener).await?;
    b.send_to(options(Some("z9hG4bK-peer-b"), "b").as_bytes(), listener.udp_local_addr())
        .await?;
    let from_b = next(&listener).await?;

    assert_eq!(from_a.conn.peer_addr(), a.local_addr()?);
    assert_eq!(from_b.conn.peer_addr(), b.local_addr()?);
    assert_ne!(from_a.conn.id(), from_b.conn.id());
    assert_eq!(listener.udp_peer_count(), 2);

    listener.close().await?;
    Ok(())
}

#[tokio::test]
async fn udp_response_goes_back_through_conn() -> TestResult {
    let listener = Listener::bind("127.0.0.1:0").await?;
    let client = UdpSocket::bind("127.0.0.1:0").await?;
    client
        .send_to(options(Some("z9hG4bK-reply"), "r").as_bytes(), listener.udp_local_addr())
        .await?;
    let got = next(&listener).await?;

    got.conn.write(b"SIP/2.0 200 OK\r\n");
    got.conn.write(b"Content-Length: 0\r\n\r\n");
    got.conn.flush().await?;

    let mut buf = [0u8; 128];
    let (n, from) = timeout(ACCEPT_TIMEOUT, client.recv_from(&mut buf)).await??;
    assert_eq!(&buf[..n], b"SIP/2.0 200 OK\r\nContent-Length: 0\r\n\r\n");
    assert_eq!(from, listener.udp_local_addr());

    listener.close().await?;
    Ok(())
}

#[tokio::test]
async fn missing_or_malformed_branch_is_reported_every_time() -> TestResult {
    let listener = Listener::bind("127.0.0.1:0").await?;
    let client = UdpSocket::bind("127.0.0.1:0").await?;
    let target = listener.udp_local_addr();

    for branch in [None, Some("short"), Some("abcdefgh-no-cookie"), Some("z9hG4bK")] {
        let raw = options(branch, "bad");
        // 2 回送っても両方エラーで返る (キャッシュされない)
        for _ in 0..2 {
            client.send_to(raw.as_bytes(), target).await?;
            match next(&listener).await {
                Err(ListenerError::InvalidBranch { request, conn }) => {
                    assert_eq!(request.header_value("Call-ID"), Some("bad"));
                    assert_eq!(conn.peer_addr(), client.local_addr()?);
                }
                other => panic!("expected invalid branch for {:?}, got {:?}", branch, other),
            }
        }
    }

    listener.close().await?;
    Ok(())
}

#[tokio::test]
async fn undecodable_datagram_does_not_stop_listener() -> TestResult {
    let listener = Listener::bind("127.0.0.1:0").await?;
    let client = UdpSocket::bind("127.0.0.1:0").await?;
    let target = listener.udp_local_addr();

    client.send_to(b"definitely not sip", target).await?;
    match next(&listener).await {
        Err(err @ ListenerError::Codec { .. }) => {
            assert!(!err.is_fatal());
            assert_eq!(err.conn().map(|c| c.peer_addr()), Some(client.local_addr()?));
        }
        other => panic!("expected codec error, got {:?}", other),
    }

    client
        .send_to(options(Some("z9hG4bK-after-garbage"), "ok").as_bytes(), target)
        .await?;
    let got = next(&listener).await?;
    assert_eq!(got.request.header_value("Call-ID"), Some("ok"));

    listener.close().await?;
    Ok(())
}

#[tokio::test]
async fn tcp_short_branch_comes_back_with_its_connection() -> TestResult {
    let listener = Listener::bind("127.0.0.1:0").await?;
    let mut stream = TcpStream::connect(listener.local_addr()).await?;
    stream.write_all(options(Some("short"), "tcp-bad").as_bytes()).await?;

    let conn = match next(&listener).await {
        Err(ListenerError::InvalidBranch { request, conn }) => {
            assert_eq!(request.method, SipMethod::Options);
            conn
        }
        other => panic!("expected invalid branch, got {:?}", other),
    };
    assert_eq!(conn.transport(), Transport::Tcp);
    assert_eq!(conn.peer_addr(), stream.local_addr()?);

    conn.send(b"SIP/2.0 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
        .await?;
    let mut buf = [0u8; 64];
    let n = timeout(ACCEPT_TIMEOUT, stream.read(&mut buf)).await??;
    assert!(buf[..n].starts_with(b"SIP/2.0 400 Bad Request"));

    listener.close().await?;
    Ok(())
}

#[tokio::test]
async fn tcp_pipelined_requests_keep_order_then_report_close() -> TestResult {
    let listener = Listener::bind("127.0.0.1:0").await?;
    let mut stream = TcpStream::connect(listener.local_addr()).await?;

    let mut burst = options(Some("z9hG4bK-tcp-1"), "one");
    burst.push_str(&options(Some("z9hG4bK-tcp-2"), "two"));
    burst.push_str(&options(Some("z9hG4bK-tcp-3"), "three"));
    stream.write_all(burst.as_bytes()).await?;

    let mut conn = None;
    for expected in ["one", "two", "three"] {
        let got = next(&listener).await?;
        assert_eq!(got.request.header_value("Call-ID"), Some(expected));
        if let Some(prev) = &conn {
            assert!(Arc::ptr_eq(prev, &got.conn));
        }
        conn = Some(got.conn);
    }

    drop(stream);
    match next(&listener).await {
        Err(ListenerError::PeerClosed { conn: closed }) => {
            assert!(Arc::ptr_eq(&closed, conn.as_ref().expect("conn")));
        }
        other => panic!("expected peer closed, got {:?}", other),
    }

    listener.close().await?;
    Ok(())
}

#[tokio::test]
async fn close_unblocks_waiting_consumer() -> TestResult {
    let listener = Arc::new(Listener::bind("127.0.0.1:0").await?);
    let waiter = {
        let listener = listener.clone();
        tokio::spawn(async move { listener.accept_request().await })
    };

    sleep(Duration::from_millis(100)).await;
    listener.close().await?;

    let res = timeout(ACCEPT_TIMEOUT, waiter).await??;
    assert!(matches!(res, Err(ListenerError::Closed)));
    assert!(listener.is_closed());
    Ok(())
}

#[tokio::test]
async fn accept_after_close_fails_immediately_and_close_is_idempotent() -> TestResult {
    let listener = Listener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr();

    let (a, b) = tokio::join!(listener.close(), listener.close());
    a?;
    b?;
    listener.close().await?;

    for _ in 0..3 {
        let res = timeout(Duration::from_millis(200), listener.accept_request()).await?;
        assert!(matches!(res, Err(ListenerError::Closed)));
    }

    // ソケットが解放されていれば同じアドレスに再バインドできる
    let rebound = Listener::bind(&addr.to_string()).await?;
    assert_eq!(rebound.local_addr(), addr);
    rebound.close().await?;
    Ok(())
}

#[tokio::test]
async fn bind_failure_releases_tcp_socket() -> TestResult {
    let blocker = UdpSocket::bind("127.0.0.1:0").await?;
    let addr = blocker.local_addr()?;

    // UDP 側が使用中なら bind 全体が失敗する
    let res = Listener::bind(&addr.to_string()).await;
    assert!(matches!(res, Err(ListenerError::Transport(_))));

    drop(blocker);
    let listener = Listener::bind(&addr.to_string()).await?;
    listener.close().await?;
    Ok(())
}

#[tokio::test]
async fn udp_crlf_keepalive_is_ignored() -> TestResult {
    let listener = Listener::bind("127.0.0.1:0").await?;
    let client = UdpSocket::bind("127.0.0.1:0").await?;
    let target = listener.udp_local_addr();

    client.send_to(b"\r\n\r\n", target).await?;
    client
        .send_to(options(Some("z9hG4bK-after-ping"), "ping").as_bytes(), target)
        .await?;
    let got = next(&listener).await?;
    assert_eq!(got.request.header_value("Call-ID"), Some("ping"));

    listener.close().await?;
    Ok(())
}

#[tokio::test]
async fn tcp_reset_is_reported_as_peer_closed() -> TestResult {
    let listener = Listener::bind("127.0.0.1:0").await?;
    let stream = TcpStream::connect(listener.local_addr()).await?;
    let local = stream.local_addr()?;

    // linger 0 で close すると RST が飛ぶ
    stream.set_linger(Some(Duration::ZERO))?;
    drop(stream);

    match next(&listener).await {
        Err(ListenerError::PeerClosed { conn }) => {
            assert_eq!(conn.peer_addr(), local);
            assert_eq!(conn.transport(), Transport::Tcp);
        }
        other => panic!("expected peer closed, got {:?}", other),
    }

    listener.close().await?;
    Ok(())
}

#[tokio::test]
async fn tcp_idle_timeout_closes_both_directions() -> TestResult {
    let listener = bind_local(ListenerConfig {
        tcp_idle: Some(Duration::from_millis(100)),
        ..ListenerConfig::default()
    })
    .await?;
    let mut stream = TcpStream::connect(listener.local_addr()).await?;
    stream.write_all(options(Some("z9hG4bK-idle"), "idle").as_bytes()).await?;
    let got = next(&listener).await?;

    // サーバ側から FIN が届く
    let mut buf = [0u8; 16];
    let n = timeout(ACCEPT_TIMEOUT, stream.read(&mut buf)).await??;
    assert_eq!(n, 0);

    let err = got.conn.send(b"SIP/2.0 200 OK\r\n\r\n").await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);

    listener.close().await?;
    Ok(())
}
