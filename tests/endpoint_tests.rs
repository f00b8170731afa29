use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use futures::StreamExt;
use sha1::{Digest, Sha1};
use socket_tide::config::ClientConfig;
use socket_tide::connection::ConnectionStatus;
use socket_tide::error::Error;
use socket_tide::event::Event;
use socket_tide::handshake::{accept_upgraded, connect_async, connect_async_with_config, Negotiated};
use socket_tide::message::Message;
use socket_tide::server::start_server;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// Spawns an event loop that echoes every message back to its sender
fn spawn_echo_loop(mut events: socket_tide::event::EventStream) {
    tokio::spawn(async move {
        let mut writers = HashMap::new();
        while let Some(event) = events.next().await {
            match event {
                Event::NewClient(id, writer) => {
                    writers.insert(id, writer);
                }
                Event::NewMessage(id, message) => {
                    if let Some(writer) = writers.get_mut(&id) {
                        let _ = writer.send_message(message).await;
                    }
                }
                Event::Disconnect(id) => {
                    writers.remove(&id);
                }
                Event::Error(_, _) => {}
            }
        }
    });
}

// Reads an HTTP head from the stream, up to the blank line
async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).to_string()
}

// Plays the server side of the upgrade exchange by hand
async fn raw_upgrade(stream: &mut TcpStream) {
    let head = read_head(stream).await;
    let key = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("sec-websocket-key") {
                Some(value.trim().to_string())
            } else {
                None
            }
        })
        .expect("request carried no Sec-WebSocket-Key");

    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(GUID.as_bytes());
    let accept = BASE64_STANDARD.encode(sha1.finalize());

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Accept: {}\r\n\r\n",
        accept
    );
    stream.write_all(response.as_bytes()).await.unwrap();
}

// Reads one frame off the wire, unmasking if needed, and returns the first
// header byte together with the payload
async fn read_raw_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.unwrap();

    let masked = header[1] & 0x80 != 0;
    let mut length = (header[1] & 0x7F) as usize;
    if length == 126 {
        let mut ext = [0u8; 2];
        stream.read_exact(&mut ext).await.unwrap();
        length = u16::from_be_bytes(ext) as usize;
    } else if length == 127 {
        let mut ext = [0u8; 8];
        stream.read_exact(&mut ext).await.unwrap();
        length = u64::from_be_bytes(ext) as usize;
    }

    let mask = if masked {
        let mut mask = [0u8; 4];
        stream.read_exact(&mut mask).await.unwrap();
        Some(mask)
    } else {
        None
    };

    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload).await.unwrap();
    if let Some(mask) = mask {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
    }

    (header[0], payload)
}

#[tokio::test]
async fn echo_roundtrip_and_clean_close() {
    init_logs();
    let port = free_port().await;
    let events = start_server(port).await.unwrap();
    let registry = events.registry();
    spawn_echo_loop(events);

    let mut connection = connect_async(&format!("ws://127.0.0.1:{}", port))
        .await
        .unwrap();
    assert_eq!(connection.status(), ConnectionStatus::Open);

    connection.send_as_text(String::from("hello")).await.unwrap();
    let echoed = timeout(Duration::from_secs(5), connection.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(echoed, Message::Text(String::from("hello")));

    connection.close_connection().await.unwrap();
    assert_eq!(connection.status(), ConnectionStatus::Closed);

    // the server must drop the connection from its registry as well
    timeout(Duration::from_secs(5), registry.wait_empty())
        .await
        .expect("registry did not drain after the close");
}

#[tokio::test]
async fn large_binary_message_survives_fragmentation() {
    init_logs();
    let port = free_port().await;
    let mut events = start_server(port).await.unwrap();

    let (result_tx, result_rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut result_tx = Some(result_tx);
        while let Some(event) = events.next().await {
            if let Event::NewMessage(_, Message::Binary(data)) = event {
                if let Some(tx) = result_tx.take() {
                    let _ = tx.send(data);
                }
            }
        }
    });

    let mut config = ClientConfig::default();
    config.web_socket_config.fragment_size = Some(4096);
    let mut connection =
        connect_async_with_config(&format!("ws://127.0.0.1:{}", port), Some(config))
            .await
            .unwrap();

    let payload: Vec<u8> = (0..100_000).map(|i| (i % 241) as u8).collect();
    connection.send_as_binary(payload.clone()).await.unwrap();

    let received = timeout(Duration::from_secs(10), result_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.len(), 100_000);
    assert_eq!(received, payload);

    connection.close_connection().await.unwrap();
}

#[tokio::test]
async fn server_rejects_unmasked_client_frame() {
    init_logs();
    let port = free_port().await;
    let mut events = start_server(port).await.unwrap();

    let (seen_tx, seen_rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut seen_tx = Some(seen_tx);
        while let Some(event) = events.next().await {
            if let Event::Error(_, _) = event {
                if let Some(tx) = seen_tx.take() {
                    let _ = tx.send(());
                }
            }
        }
    });

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let key = BASE64_STANDARD.encode([7u8; 16]);
    let request = format!(
        "GET / HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n\r\n",
        port, key
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 101"));

    // an unmasked text frame from a client is a protocol violation
    stream.write_all(&[0x81, 0x02, b'h', b'i']).await.unwrap();

    timeout(Duration::from_secs(5), seen_rx)
        .await
        .expect("server never reported the protocol violation")
        .unwrap();
}

#[tokio::test]
async fn client_rejects_masked_server_frame() {
    init_logs();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        raw_upgrade(&mut stream).await;
        // a masked frame from a server is a protocol violation
        stream
            .write_all(&[0x81, 0x82, 1, 2, 3, 4, b'h' ^ 1, b'i' ^ 2])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let mut connection = connect_async(&format!("ws://127.0.0.1:{}", port))
        .await
        .unwrap();
    let result = timeout(Duration::from_secs(5), connection.next())
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_err());
    assert_eq!(connection.wait_close(2_000).await, ConnectionStatus::Closed);

    server.await.unwrap();
}

#[tokio::test]
async fn ping_is_answered_with_echoed_pong() {
    init_logs();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        raw_upgrade(&mut stream).await;

        stream
            .write_all(&[0x89, 0x03, b'a', b'b', b'c'])
            .await
            .unwrap();

        let (first_byte, payload) = read_raw_frame(&mut stream).await;
        assert_eq!(first_byte, 0x8A);
        assert_eq!(payload, b"abc");
    });

    let _connection = connect_async(&format!("ws://127.0.0.1:{}", port))
        .await
        .unwrap();

    timeout(Duration::from_secs(5), server)
        .await
        .expect("no pong arrived within the deadline")
        .unwrap();
}

#[tokio::test]
async fn close_completes_against_unresponsive_peer() {
    init_logs();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        raw_upgrade(&mut stream).await;
        // hold the socket open but never answer anything
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(stream);
    });

    let mut connection = connect_async(&format!("ws://127.0.0.1:{}", port))
        .await
        .unwrap();

    timeout(Duration::from_secs(5), connection.close_connection())
        .await
        .expect("close did not finish within its bound")
        .unwrap();
    assert_eq!(connection.status(), ConnectionStatus::Closed);

    server.abort();
}

#[tokio::test]
async fn close_signal_is_idempotent() {
    init_logs();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (count_tx, count_rx) = oneshot::channel();
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        raw_upgrade(&mut stream).await;

        // exactly one close frame must arrive
        let (first_byte, _) = read_raw_frame(&mut stream).await;
        assert_eq!(first_byte & 0x0F, 0x8);
        stream.write_all(&[0x88, 0x00]).await.unwrap();

        // nothing else may follow the close
        let mut extra = [0u8; 1];
        let followup = timeout(Duration::from_millis(700), stream.read_exact(&mut extra)).await;
        let _ = count_tx.send(followup.is_err() || followup.unwrap().is_err());
    });

    let connection = connect_async(&format!("ws://127.0.0.1:{}", port))
        .await
        .unwrap();

    connection.send_close_signal().unwrap();
    connection.send_close_signal().unwrap();
    assert_eq!(connection.wait_close(3_000).await, ConnectionStatus::Closed);

    let only_one_close = timeout(Duration::from_secs(5), count_rx)
        .await
        .unwrap()
        .unwrap();
    assert!(only_one_close, "a second close frame reached the peer");

    server.await.unwrap();
}

#[tokio::test]
async fn rejected_upgrade_reports_the_response() {
    init_logs();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_head(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\noops")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let result = connect_async(&format!("ws://127.0.0.1:{}", port)).await;
    match result {
        Err(Error::HandshakeFailed { response }) => {
            assert_eq!(response.status, 200);
            assert_eq!(response.body, b"oops");
        }
        Ok(_) => panic!("upgrade unexpectedly succeeded"),
        Err(other) => panic!("unexpected error kind: {}", other),
    }

    server.await.unwrap();
}

#[tokio::test]
async fn abrupt_peer_disconnect_closes_the_connection() {
    init_logs();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        raw_upgrade(&mut stream).await;
        // connection torn down right after the upgrade, mid-session
    });

    let mut connection = connect_async(&format!("ws://127.0.0.1:{}", port))
        .await
        .unwrap();
    server.await.unwrap();

    // the stream ends, possibly with a disconnect error item first
    let first = timeout(Duration::from_secs(5), connection.next())
        .await
        .unwrap();
    if let Some(item) = first {
        assert!(item.is_err());
    }
    assert_eq!(connection.wait_close(2_000).await, ConnectionStatus::Closed);
}

#[tokio::test]
async fn adopted_socket_behaves_as_server_connection() {
    init_logs();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    // the "host" answers the upgrade itself and then hands the raw socket
    // over to the library
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        raw_upgrade(&mut stream).await;

        let connection = accept_upgraded(stream, Negotiated::default(), None);
        let (mut reader, mut writer) = connection.split();
        while let Some(Ok(message)) = reader.next().await {
            if writer.send_message(message).await.is_err() {
                break;
            }
        }
    });

    let mut connection = connect_async(&format!("ws://127.0.0.1:{}", port))
        .await
        .unwrap();
    connection
        .send_as_text(String::from("adopted"))
        .await
        .unwrap();
    let echoed = timeout(Duration::from_secs(5), connection.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(echoed, Message::Text(String::from("adopted")));

    connection.close_connection().await.unwrap();
    timeout(Duration::from_secs(5), server)
        .await
        .expect("adopted connection did not shut down")
        .unwrap();
}

#[tokio::test]
async fn negotiated_protocol_is_captured_verbatim() {
    init_logs();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        assert!(head.contains("Sec-WebSocket-Protocol: chat"));
        let key = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                if name.eq_ignore_ascii_case("sec-websocket-key") {
                    Some(value.trim().to_string())
                } else {
                    None
                }
            })
            .unwrap();
        let mut sha1 = Sha1::new();
        sha1.update(key.as_bytes());
        sha1.update(GUID.as_bytes());
        let accept = BASE64_STANDARD.encode(sha1.finalize());
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Accept: {}\r\nSec-WebSocket-Protocol: chat\r\n\r\n",
            accept
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let mut config = ClientConfig::default();
    config.protocol = Some(String::from("chat"));
    let connection = connect_async_with_config(&format!("ws://127.0.0.1:{}", port), Some(config))
        .await
        .unwrap();
    assert_eq!(connection.negotiated_protocol(), "chat");
    assert_eq!(connection.negotiated_extensions(), "");

    drop(connection);
    server.await.unwrap();
}

#[tokio::test]
async fn offered_protocol_must_be_echoed() {
    init_logs();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        // a plain 101 without the protocol echo the client asked for
        raw_upgrade(&mut stream).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let mut config = ClientConfig::default();
    config.protocol = Some(String::from("chat"));
    let result = connect_async_with_config(&format!("ws://127.0.0.1:{}", port), Some(config)).await;
    assert!(matches!(result, Err(Error::HandshakeFailed { .. })));

    server.await.unwrap();
}

#[tokio::test]
async fn concurrent_senders_do_not_interleave_frames() {
    init_logs();
    let port = free_port().await;
    let events = start_server(port).await.unwrap();
    spawn_echo_loop(events);

    let mut config = ClientConfig::default();
    config.web_socket_config.fragment_size = Some(512);
    let connection = connect_async_with_config(&format!("ws://127.0.0.1:{}", port), Some(config))
        .await
        .unwrap();
    let (mut reader, writer) = connection.split();

    let first = vec![0x11u8; 20_000];
    let second = vec![0x22u8; 20_000];

    let mut writer_a = writer.clone();
    let mut writer_b = writer;
    let payload_a = first.clone();
    let payload_b = second.clone();
    let (sent_a, sent_b) = tokio::join!(
        tokio::spawn(async move { writer_a.send_as_binary(payload_a).await }),
        tokio::spawn(async move { writer_b.send_as_binary(payload_b).await }),
    );
    sent_a.unwrap().unwrap();
    sent_b.unwrap().unwrap();

    // both messages must come back whole; interleaved fragments would have
    // broken the server-side assembly
    let mut payloads = Vec::new();
    for _ in 0..2 {
        let message = timeout(Duration::from_secs(5), reader.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        payloads.push(message.as_binary());
    }
    payloads.sort();
    let mut expected = vec![first, second];
    expected.sort();
    assert_eq!(payloads, expected);
}
