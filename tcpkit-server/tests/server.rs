use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tcpkit_common::{Connection, FrameOption, NetError, tls};
use tcpkit_server::Server;
use tempfile::NamedTempFile;

async fn echo_frames(mut conn: Connection, delay: Duration, option: FrameOption) {
    while let Ok(frame) = conn.recv_pkg(option).await {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if conn.send_pkg(&frame, option).await.is_err() {
            break;
        }
    }
}

async fn start(server: Server) -> anyhow::Result<(Arc<Server>, String)> {
    let server = Arc::new(server);
    let addr = server.bind().await?;
    let runner = Arc::clone(&server);
    tokio::spawn(async move { runner.run().await });
    Ok((server, addr.to_string()))
}

async fn start_echo(delay: Duration, option: FrameOption) -> anyhow::Result<(Arc<Server>, String)> {
    start(Server::new("127.0.0.1:0", move |conn| echo_frames(conn, delay, option))).await
}

fn write_pem(contents: &str) -> anyhow::Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(contents.as_bytes())?;
    Ok(file)
}

#[tokio::test]
async fn echoes_frames_with_default_option() -> anyhow::Result<()> {
    let (server, addr) = start_echo(Duration::ZERO, FrameOption::new()).await?;
    let mut conn = Connection::connect(&addr).await?;

    for i in 100..200 {
        let data = i.to_string().into_bytes();
        let reply = conn.send_recv_pkg(&data, FrameOption::new()).await?;
        assert_eq!(reply, data);
    }

    server.close();
    Ok(())
}

#[tokio::test]
async fn oversize_frame_is_rejected_before_sending() -> anyhow::Result<()> {
    let (server, addr) = start_echo(Duration::ZERO, FrameOption::new()).await?;
    let mut conn = Connection::connect(&addr).await?;

    let big = vec![0u8; 65_536];
    let err = conn.send_pkg(&big, FrameOption::new()).await.unwrap_err();
    assert!(matches!(err, NetError::DataTooLong(65_536)));

    let err = conn.send_recv_pkg(&big, FrameOption::new()).await.unwrap_err();
    assert!(matches!(err.error(), NetError::DataTooLong(65_536)));
    assert!(err.data().is_empty());

    // Nothing reached the wire, so the stream is still in sync.
    let reply = conn.send_recv_pkg(b"after", FrameOption::new()).await?;
    assert_eq!(reply, b"after");

    server.close();
    Ok(())
}

#[tokio::test]
async fn one_byte_header_caps_payload() -> anyhow::Result<()> {
    let option = FrameOption::new().with_header_size(1);
    let (server, addr) = start_echo(Duration::ZERO, option).await?;
    let mut conn = Connection::connect(&addr).await?;

    let err = conn.send_recv_pkg(&[0u8; 0x100], option).await.unwrap_err();
    assert!(matches!(err.error(), NetError::DataTooLong(0x100)));
    assert!(err.data().is_empty());

    let mut data = vec![0u8; 0xFF];
    data[100] = b'A';
    data[200] = b'U';
    assert_eq!(conn.send_recv_pkg(&data, option).await?, data);

    server.close();
    Ok(())
}

#[tokio::test]
async fn reply_timeout_and_success() -> anyhow::Result<()> {
    let (server, addr) = start_echo(Duration::from_secs(1), FrameOption::new()).await?;

    let mut slow = Connection::connect(&addr).await?;
    let err = slow
        .send_recv_pkg_with_timeout(b"10000", Duration::from_millis(1), FrameOption::new())
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(err.data().is_empty());
    assert_eq!(slow.receive_deadline(), None);

    let mut patient = Connection::connect(&addr).await?;
    let reply = patient
        .send_recv_pkg_with_timeout(b"10000", Duration::from_millis(2000), FrameOption::new())
        .await?;
    assert_eq!(reply, b"10000");

    server.close();
    Ok(())
}

#[tokio::test]
async fn line_protocol_over_tcp() -> anyhow::Result<()> {
    let server = Server::new("127.0.0.1:0", |mut conn: Connection| async move {
        while let Ok(line) = conn.recv_line(None).await {
            let mut reply = line.to_ascii_uppercase();
            reply.extend_from_slice(b"\r\nEND");
            if conn.send(&reply, None).await.is_err() {
                break;
            }
        }
    });
    let (server, addr) = start(server).await?;
    let mut conn = Connection::connect(&addr).await?;

    conn.send(b"hello\r\n", None).await?;
    assert_eq!(conn.recv_line(None).await?, b"HELLO");
    assert_eq!(conn.recv_til(b"end", None).await?, b"END");

    server.close();
    Ok(())
}

#[tokio::test]
async fn handler_sees_peer_address() -> anyhow::Result<()> {
    let server = Server::new("127.0.0.1:0", |mut conn: Connection| async move {
        let peer = conn.peer_addr().map(|addr| addr.to_string()).unwrap_or_default();
        let _ = conn.send_pkg(peer.as_bytes(), FrameOption::new()).await;
    });
    let (server, addr) = start(server).await?;
    let mut conn = Connection::connect(&addr).await?;

    let reported = conn.recv_pkg(FrameOption::new()).await?;
    let local = conn.local_addr().map(|addr| addr.to_string()).unwrap_or_default();
    assert_eq!(String::from_utf8(reported)?, local);

    server.close();
    Ok(())
}

#[tokio::test]
async fn tls_echo_round_trip() -> anyhow::Result<()> {
    let cert = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])?;
    let crt = write_pem(&cert.cert.pem())?;
    let key = write_pem(&cert.key_pair.serialize_pem())?;

    let server = Server::with_key_crt("127.0.0.1:0", crt.path(), key.path(), |conn| {
        echo_frames(conn, Duration::ZERO, FrameOption::new())
    })?;
    assert!(server.is_tls());
    let (server, addr) = start(server).await?;

    let mut conn = Connection::connect_key_crt(&addr, crt.path(), key.path()).await?;
    assert!(conn.peer_addr().is_some());
    for payload in [&b"secure"[..], &[7u8; 4096][..]] {
        assert_eq!(conn.send_recv_pkg(payload, FrameOption::new()).await?, payload);
    }

    let config = tls::load_client_config(crt.path(), key.path())?;
    let mut second = Connection::connect_tls(&addr, config).await?;
    assert_eq!(second.send_recv_pkg(b"again", FrameOption::new()).await?, b"again");

    server.close();
    Ok(())
}

#[tokio::test]
async fn plain_client_cannot_talk_to_tls_server() -> anyhow::Result<()> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
    let crt = write_pem(&cert.cert.pem())?;
    let key = write_pem(&cert.key_pair.serialize_pem())?;

    let server = Server::with_key_crt("127.0.0.1:0", crt.path(), key.path(), |conn| {
        echo_frames(conn, Duration::ZERO, FrameOption::new())
    })?;
    let (server, addr) = start(server).await?;

    let mut conn = Connection::connect(&addr).await?;
    let result = conn
        .send_recv_pkg_with_timeout(b"plain", Duration::from_secs(2), FrameOption::new())
        .await;
    assert!(result.is_err());

    // The failed handshake did not stop the accept loop.
    let config = tls::load_client_config(crt.path(), key.path())?;
    let port = server.local_addr().map(|bound| bound.port()).unwrap_or_default();
    let mut secure = Connection::connect_tls(&format!("localhost:{port}"), config).await?;
    assert_eq!(secure.send_recv_pkg(b"ok", FrameOption::new()).await?, b"ok");

    server.close();
    Ok(())
}

#[test]
fn missing_certificate_is_reported() {
    let result = Server::with_key_crt(
        "127.0.0.1:0",
        "/nonexistent/crt.pem",
        "/nonexistent/key.pem",
        |_conn| async {},
    );
    assert!(result.is_err());
}
