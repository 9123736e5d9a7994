// ABOUTME: Transport integration tests against a raw-socket WebSocket peer
// ABOUTME: Covers the upgrade, fragment reassembly, ping/pong and the close handshake

use futures_util::{SinkExt, StreamExt};
use lavawire::transport::{
    close_code, CloseFrame, Frame, FrameCodec, HandshakeError, Message, OpCode, Transport,
    TransportError, TransportEvent,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_util::codec::Framed;

type Peer = Framed<TcpStream, FrameCodec>;

async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "client hung up during the handshake");
        head.extend_from_slice(&buf[..n]);
    }
    String::from_utf8(head).unwrap()
}

fn header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

/// Accept one client, answer the upgrade and hand back the framed socket and
/// the request head
async fn accept(listener: &TcpListener) -> (Peer, String) {
    let (mut stream, _) = listener.accept().await.unwrap();
    let head = read_head(&mut stream).await;
    let key = header(&head, "Sec-WebSocket-Key").unwrap();

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        derive_accept_key(key.as_bytes())
    );
    stream.write_all(response.as_bytes()).await.unwrap();

    (Framed::new(stream, FrameCodec::unmasked()), head)
}

async fn pair(headers: &[(String, String)]) -> (Transport, Peer, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let (transport, (peer, head)) = tokio::join!(
        async { Transport::connect(&url, headers).await.unwrap() },
        accept(&listener)
    );
    (transport, peer, head)
}

async fn next_frame(peer: &mut Peer) -> Frame {
    timeout(Duration::from_secs(5), peer.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("peer stream ended")
        .expect("invalid frame")
}

#[tokio::test]
async fn test_handshake_sends_extra_headers() {
    let headers = vec![
        ("Authorization".to_string(), "youshallnotpass".to_string()),
        ("User-Id".to_string(), "42".to_string()),
    ];
    let (_transport, _peer, head) = pair(&headers).await;

    assert!(head.starts_with("GET / HTTP/1.1\r\n"));
    assert_eq!(header(&head, "Authorization"), Some("youshallnotpass"));
    assert_eq!(header(&head, "User-Id"), Some("42"));
    assert_eq!(header(&head, "Sec-WebSocket-Version"), Some("13"));
}

#[tokio::test]
async fn test_rejected_upgrade() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_head(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
    });

    let err = Transport::connect(&url, &[]).await.unwrap_err();
    assert!(matches!(
        err,
        HandshakeError::UnexpectedStatus { status: 401, .. }
    ));
    server.await.unwrap();
}

#[tokio::test]
async fn test_writes_arrive_in_order_and_masked() {
    let (transport, mut peer, _) = pair(&[]).await;
    let sender = transport.sender();

    let first = sender.send(Message::Text("one".to_string()));
    let second = sender.clone().send(Message::Text("two".to_string()));
    let third = sender.send(Message::Binary(vec![1u8, 2, 3].into()));

    first.await.unwrap();
    second.await.unwrap();
    third.await.unwrap();

    assert_eq!(next_frame(&mut peer).await, Frame::text("one"));
    assert_eq!(next_frame(&mut peer).await, Frame::text("two"));
    assert_eq!(next_frame(&mut peer).await, Frame::binary(vec![1u8, 2, 3]));
}

#[tokio::test]
async fn test_fragmented_message_with_interleaved_ping() {
    let (transport, mut peer, _) = pair(&[]).await;
    let (_sender, mut receiver) = transport.split();

    peer.send(Frame {
        fin: false,
        opcode: OpCode::Text,
        payload: "hello ".into(),
    })
    .await
    .unwrap();
    peer.send(Frame::ping("p")).await.unwrap();
    peer.send(Frame {
        fin: true,
        opcode: OpCode::Continuation,
        payload: "world".into(),
    })
    .await
    .unwrap();

    assert_eq!(
        receiver.next_event().await,
        Some(TransportEvent::Ping("p".into()))
    );
    assert_eq!(
        receiver.next_event().await,
        Some(TransportEvent::Message(Message::Text("hello world".to_string())))
    );

    // the ping was answered automatically
    assert_eq!(next_frame(&mut peer).await, Frame::pong("p"));
}

#[tokio::test]
async fn test_remote_close_is_echoed() {
    let (transport, mut peer, _) = pair(&[]).await;
    let (sender, mut receiver) = transport.split();

    peer.send(Frame::close(4000, "bye")).await.unwrap();

    assert_eq!(
        receiver.next_event().await,
        Some(TransportEvent::Close(CloseFrame::new(4000, "bye")))
    );
    assert_eq!(receiver.next_event().await, None);

    let echo = next_frame(&mut peer).await;
    assert_eq!(echo.opcode, OpCode::Close);
    assert_eq!(CloseFrame::parse(&echo.payload).unwrap().code, 4000);

    let result = sender.send(Message::Text("late".to_string())).await;
    assert!(matches!(result, Err(TransportError::ConnectionReset)));
    assert!(sender.is_closed());
}

#[tokio::test]
async fn test_local_close() {
    let (transport, mut peer, _) = pair(&[]).await;
    let (sender, mut receiver) = transport.split();

    sender.close(close_code::NORMAL, "done").await.unwrap();

    assert_eq!(
        receiver.next_event().await,
        Some(TransportEvent::Close(CloseFrame::new(close_code::NORMAL, "done")))
    );
    assert_eq!(receiver.next_event().await, None);
    assert_eq!(next_frame(&mut peer).await, Frame::close(close_code::NORMAL, "done"));
}

#[tokio::test]
async fn test_invalid_utf8_text_fails_the_connection() {
    let (transport, mut peer, _) = pair(&[]).await;
    let (_sender, mut receiver) = transport.split();

    peer.send(Frame::new(OpCode::Text, vec![0xffu8, 0xfe]))
        .await
        .unwrap();

    match receiver.next_event().await {
        Some(TransportEvent::Close(close)) => assert_eq!(close.code, close_code::INVALID_DATA),
        other => panic!("expected close, got {:?}", other),
    }
    let frame = next_frame(&mut peer).await;
    assert_eq!(
        CloseFrame::parse(&frame.payload).unwrap().code,
        close_code::INVALID_DATA
    );
}

#[tokio::test]
async fn test_masked_server_frame_fails_the_connection() {
    let (transport, mut peer, _) = pair(&[]).await;
    let (_sender, mut receiver) = transport.split();

    *peer.codec_mut() = FrameCodec::client([7, 7, 7, 7]);
    peer.send(Frame::text("masked")).await.unwrap();
    *peer.codec_mut() = FrameCodec::unmasked();

    match receiver.next_event().await {
        Some(TransportEvent::Close(close)) => {
            assert_eq!(close.code, close_code::PROTOCOL_ERROR)
        }
        other => panic!("expected close, got {:?}", other),
    }
    let frame = next_frame(&mut peer).await;
    assert_eq!(frame.opcode, OpCode::Close);
    assert_eq!(
        CloseFrame::parse(&frame.payload).unwrap().code,
        close_code::PROTOCOL_ERROR
    );
}

#[tokio::test]
async fn test_dropped_socket_ends_the_stream() {
    let (transport, peer, _) = pair(&[]).await;
    let (sender, mut receiver) = transport.split();

    drop(peer);

    assert_eq!(receiver.next_event().await, None);
    assert!(sender.is_closed());
}
