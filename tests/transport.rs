use anyhow::{Context, Result};
use otagent::message::{ControlMessage, Envelope};
use otagent::protocol::opcode;
use otagent::protocol_core::{encode_frame, FrameDecoder};
use otagent::transport::{ConnectionState, Transport, TransportCallbacks, TransportOptions};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn fast_options() -> TransportOptions {
    TransportOptions {
        connect_timeout: Duration::from_millis(500),
        reconnect_initial: Duration::from_millis(20),
        reconnect_max: Duration::from_millis(100),
        max_queue: None,
    }
}

fn numbered(n: i64) -> ControlMessage {
    Envelope::new(n, 1).report(opcode::REPORT_VERSION, json!({"Version": format!("TX2-{}", n)}))
}

fn free_port() -> Result<u16> {
    let sock = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(sock.local_addr()?.port())
}

async fn accept(listener: &TcpListener) -> Result<TcpStream> {
    let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .context("no connection within 5s")??;
    Ok(stream)
}

/// Read until `count` frames have been decoded.
async fn read_frames(stream: &mut TcpStream, count: usize) -> Result<Vec<ControlMessage>> {
    let mut decoder = FrameDecoder::new();
    let mut frames = Vec::new();
    let mut buf = [0u8; 4096];
    while frames.len() < count {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .context("read timed out")??;
        anyhow::ensure!(n > 0, "transport closed the connection");
        decoder.push(&buf[..n]);
        while let Some(frame) = decoder.next_frame()? {
            frames.push(ControlMessage::from_json(&frame)?);
        }
    }
    Ok(frames)
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..250u32 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queued_frames_arrive_in_order() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let transport = Transport::new("127.0.0.1", port, fast_options(), TransportCallbacks::default())?;

    for i in 0..200 {
        transport.send(encode_frame(&numbered(i))?)?;
    }
    transport.connect();
    let mut peer = accept(&listener).await?;

    let frames = read_frames(&mut peer, 200).await?;
    let ids: Vec<i64> = frames.iter().map(|m| m.id).collect();
    assert_eq!(ids, (0..200).collect::<Vec<_>>());
    assert!(wait_until(|| transport.queued() == 0).await);
    transport.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queue_survives_connect_failures() -> Result<()> {
    let port = free_port()?;
    let transport = Transport::new("127.0.0.1", port, fast_options(), TransportCallbacks::default())?;
    for i in 0..3 {
        transport.send(encode_frame(&numbered(i))?)?;
    }
    transport.connect();

    // nobody listening yet: several attempts fail
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(transport.queued(), 3);
    assert_ne!(transport.state(), ConnectionState::Connected);

    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    let mut peer = accept(&listener).await?;
    let frames = read_frames(&mut peer, 3).await?;
    assert_eq!(frames.iter().map(|m| m.id).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert!(wait_until(|| transport.is_connected()).await);
    transport.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnects_after_peer_closes() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let connects = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connects);
    let callbacks = TransportCallbacks {
        on_connected: Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
        ..Default::default()
    };
    let transport = Transport::new("127.0.0.1", port, fast_options(), callbacks)?;
    transport.connect();

    let mut first = accept(&listener).await?;
    transport.send(encode_frame(&numbered(1))?)?;
    assert_eq!(read_frames(&mut first, 1).await?[0].id, 1);
    drop(first);

    let mut second = accept(&listener).await?;
    assert!(wait_until(|| connects.load(Ordering::SeqCst) == 2).await);
    transport.send(encode_frame(&numbered(2))?)?;
    assert_eq!(read_frames(&mut second, 1).await?[0].id, 2);
    transport.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn in_flight_frame_is_resent_after_connection_loss() -> Result<()> {
    const FRAMES: i64 = 400;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let transport = Transport::new("127.0.0.1", port, fast_options(), TransportCallbacks::default())?;

    let pad = "x".repeat(32 * 1024);
    for i in 0..FRAMES {
        let msg = Envelope::new(i, 1).report(opcode::REPORT_VERSION, json!({"Pad": pad}));
        transport.send(encode_frame(&msg)?)?;
    }
    transport.connect();

    // a peer that never reads: the socket buffers fill and one write stalls
    let stalled = accept(&listener).await?;
    let mut remaining = transport.queued();
    for _ in 0..100u32 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let now = transport.queued();
        if now == remaining {
            break;
        }
        remaining = now;
    }
    assert!(remaining > 0, "every frame fit in the socket buffers");
    drop(stalled);

    let mut peer = accept(&listener).await?;
    let mut decoder = FrameDecoder::new();
    let mut ids = Vec::new();
    let mut buf = vec![0u8; 64 * 1024];
    while ids.last() != Some(&(FRAMES - 1)) {
        let n = tokio::time::timeout(Duration::from_secs(5), peer.read(&mut buf))
            .await
            .context("read timed out")??;
        anyhow::ensure!(n > 0, "transport closed the connection");
        decoder.push(&buf[..n]);
        while let Some(frame) = decoder.next_frame()? {
            ids.push(ControlMessage::from_json(&frame)?.id);
        }
    }

    let first = ids[0];
    assert_eq!(ids, (first..FRAMES).collect::<Vec<_>>());
    assert!(
        ids.len() >= remaining,
        "{} frames delivered, {} were still queued",
        ids.len(),
        remaining
    );
    assert!(wait_until(|| transport.queued() == 0).await);
    transport.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_replaces_the_connection() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let connects = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connects);
    let callbacks = TransportCallbacks {
        on_connected: Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
        ..Default::default()
    };
    let transport = Transport::new("127.0.0.1", port, fast_options(), callbacks)?;
    transport.connect();

    let mut first = accept(&listener).await?;
    assert!(wait_until(|| transport.is_connected()).await);
    transport.reconnect();

    let mut second = accept(&listener).await?;
    assert!(wait_until(|| connects.load(Ordering::SeqCst) == 2).await);
    // the old socket was shut by the transport
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), first.read(&mut buf)).await?;
    assert!(matches!(n, Ok(0) | Err(_)));

    transport.send(encode_frame(&numbered(7))?)?;
    assert_eq!(read_frames(&mut second, 1).await?[0].id, 7);
    transport.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn received_bytes_reach_callback() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let received = Arc::new(parking_lot::Mutex::new(Vec::<u8>::new()));
    let sink = Arc::clone(&received);
    let callbacks = TransportCallbacks {
        on_receive: Some(Box::new(move |data: &[u8]| {
            sink.lock().extend_from_slice(data);
        })),
        ..Default::default()
    };
    let transport = Transport::new("127.0.0.1", port, fast_options(), callbacks)?;
    transport.connect();

    let mut peer = accept(&listener).await?;
    let frame = encode_frame(&numbered(42))?;
    // split the frame across two writes
    peer.write_all(&frame[..3]).await?;
    peer.flush().await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    peer.write_all(&frame[3..]).await?;

    assert!(wait_until(|| received.lock().len() == frame.len()).await);
    let mut decoder = FrameDecoder::new();
    decoder.push(&received.lock());
    let body = decoder.next_frame()?.context("no frame")?;
    assert_eq!(ControlMessage::from_json(&body)?.id, 42);
    transport.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_from_receive_callback() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let cell: Arc<OnceLock<Weak<Transport>>> = Arc::new(OnceLock::new());
    let closed = Arc::new(AtomicUsize::new(0));

    let cb_cell = Arc::clone(&cell);
    let cb_closed = Arc::clone(&closed);
    let callbacks = TransportCallbacks {
        on_receive: Some(Box::new(move |_data: &[u8]| {
            if let Some(transport) = cb_cell.get().and_then(Weak::upgrade) {
                transport.close();
            }
        })),
        on_closed: Some(Box::new(move || {
            cb_closed.fetch_add(1, Ordering::SeqCst);
        })),
        ..Default::default()
    };
    let transport = Arc::new(Transport::new("127.0.0.1", port, fast_options(), callbacks)?);
    let _ = cell.set(Arc::downgrade(&transport));
    transport.connect();

    let mut peer = accept(&listener).await?;
    peer.write_all(b"bye").await?;

    assert!(wait_until(|| closed.load(Ordering::SeqCst) == 1).await);
    assert_eq!(transport.state(), ConnectionState::Disconnected);
    assert!(transport.send(vec![1u8]).is_err());

    // a second close is a no-op
    transport.close();
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    Ok(())
}
