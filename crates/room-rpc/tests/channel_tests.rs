use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use room_proto::{
    decode_payload, encode_payload, CallKind, Frame, FrameCodec, FrameKind, KeyPair, RoomError,
};
use room_rpc::{CallIo, ChannelConfig, IncomingCall, RpcChannel, RpcError, RpcHandler, UnhandledCalls};
use room_transport::memory::pipe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Test handler covering every call kind
struct TestHandler {
    events: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl RpcHandler for TestHandler {
    async fn handle(&self, mut call: IncomingCall) {
        match call.method.as_str() {
            "echo" => {
                let _ = call.responder.send(call.args.clone()).await;
            }
            "count" => {
                let n: u32 = decode_payload(&call.args).unwrap();
                for i in 0..n {
                    let _ = call.responder.send_value(&i).await;
                }
                let _ = call.responder.end().await;
            }
            "forever" => {
                let mut i = 0u32;
                loop {
                    tokio::select! {
                        _ = call.cancel.cancelled() => {
                            let _ = self.events.send("forever cancelled".to_string());
                            return;
                        }
                        _ = tokio::time::sleep(Duration::from_millis(5)) => {
                            let _ = call.responder.send_value(&i).await;
                            i += 1;
                        }
                    }
                }
            }
            "mirror" => {
                let mut incoming = call.incoming.take().unwrap();
                while let Some(item) = incoming.next().await {
                    match item {
                        Ok(bytes) => {
                            let _ = call.responder.send(bytes).await;
                        }
                        Err(_) => break,
                    }
                }
                let _ = call.responder.end().await;
            }
            "sum" => {
                let mut incoming = call.incoming.take().unwrap();
                let mut total = 0u32;
                while let Some(Ok(value)) = incoming.next_value::<u32>().await {
                    total += value;
                }
                let _ = call.responder.send_value(&total).await;
            }
            "fail" => {
                let _ = call
                    .responder
                    .error(RoomError::NotOwner("somebody else's".into()))
                    .await;
            }
            "silent" => {}
            "note" => {
                let text = String::from_utf8_lossy(&call.args).to_string();
                let _ = self.events.send(text);
            }
            "hang" => {
                call.cancel.cancelled().await;
                let _ = self.events.send("hang cancelled".to_string());
            }
            other => {
                let _ = call
                    .responder
                    .error(RoomError::ProtocolViolation(other.to_string()))
                    .await;
            }
        }
    }
}

/// Streams numbers and counts how many left the handler
struct Producer {
    sent: Arc<AtomicU32>,
}

#[async_trait]
impl RpcHandler for Producer {
    async fn handle(&self, call: IncomingCall) {
        let n: u32 = decode_payload(&call.args).unwrap();
        for i in 0..n {
            if call.responder.send_value(&i).await.is_err() {
                return;
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
        }
        let _ = call.responder.end().await;
    }
}

/// Copies the bytes of a duplex call back to the caller
struct ByteEcho;

#[async_trait]
impl RpcHandler for ByteEcho {
    async fn handle(&self, call: IncomingCall) {
        let Some(stream) = call.incoming else {
            return;
        };
        let (mut reader, mut writer) = tokio::io::split(CallIo::callee(call.responder, stream));
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
        let _ = writer.shutdown().await;
    }
}

struct Pair {
    client: RpcChannel,
    server: RpcChannel,
    events: mpsc::UnboundedReceiver<String>,
}

fn channel_pair() -> Pair {
    init_tracing();
    let (a, b) = pipe();
    let (tx, events) = mpsc::unbounded_channel();

    let client = RpcChannel::spawn(
        a,
        KeyPair::generate().identity(),
        Arc::new(UnhandledCalls),
        ChannelConfig::default(),
    );
    let server = RpcChannel::spawn(
        b,
        KeyPair::generate().identity(),
        Arc::new(TestHandler { events: tx }),
        ChannelConfig::default(),
    );

    Pair {
        client,
        server,
        events,
    }
}

/// A channel whose remote end is driven frame by frame by the test
fn raw_pair() -> (RpcChannel, Framed<room_transport::BoxedIo, FrameCodec>) {
    init_tracing();
    let (a, b) = pipe();
    let channel = RpcChannel::spawn(
        a,
        KeyPair::generate().identity(),
        Arc::new(UnhandledCalls),
        ChannelConfig::default(),
    );
    (channel, Framed::new(b, FrameCodec::new()))
}

#[tokio::test]
async fn test_async_call() {
    let pair = channel_pair();
    let reply = timeout(WAIT, pair.client.call("echo", Bytes::from_static(b"hello")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"hello"));
    assert_eq!(pair.client.pending_calls(), 0);
}

#[tokio::test]
async fn test_concurrent_calls() {
    let pair = channel_pair();

    let calls = (0..20u32).map(|i| {
        let client = pair.client.clone();
        async move {
            let reply: u32 = client.request("echo", &i).await.unwrap();
            (i, reply)
        }
    });
    let results = timeout(WAIT, futures::future::join_all(calls)).await.unwrap();

    for (sent, got) in results {
        assert_eq!(sent, got);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_calls_from_many_threads_keep_channel_open() {
    let pair = channel_pair();

    for round in 0..20u32 {
        let tasks: Vec<_> = (0..200u32)
            .map(|i| {
                let client = pair.client.clone();
                let value = round * 1000 + i;
                tokio::spawn(async move { (value, client.request::<_, u32>("echo", &value).await) })
            })
            .collect();

        for task in tasks {
            let (sent, reply) = timeout(WAIT, task).await.unwrap().unwrap();
            assert_eq!(reply, Ok(sent), "round {}", round);
        }
    }

    assert!(!pair.client.is_closed());
    assert!(!pair.server.is_closed());
}

#[tokio::test]
async fn test_unread_stream_stalls_sender() {
    init_tracing();
    const TOTAL: u32 = 100_000;

    let (a, b) = pipe();
    let sent = Arc::new(AtomicU32::new(0));
    let client = RpcChannel::spawn(
        a,
        KeyPair::generate().identity(),
        Arc::new(UnhandledCalls),
        ChannelConfig::default(),
    );
    let _server = RpcChannel::spawn(
        b,
        KeyPair::generate().identity(),
        Arc::new(Producer { sent: sent.clone() }),
        ChannelConfig::default(),
    );

    let mut stream = client
        .stream("count", encode_payload(&TOTAL).unwrap())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let stalled = sent.load(Ordering::SeqCst);
    assert!(stalled < TOTAL, "sender finished all {} items unread", stalled);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sent.load(Ordering::SeqCst), stalled);

    // Reading resumes the sender and nothing is lost
    for expected in 0..TOTAL {
        let value = timeout(WAIT, stream.next_value::<u32>())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(value, expected);
    }
    assert!(timeout(WAIT, stream.next()).await.unwrap().is_none());
    assert_eq!(sent.load(Ordering::SeqCst), TOTAL);
}

#[tokio::test]
async fn test_source_stream() {
    let pair = channel_pair();
    let mut stream = pair
        .client
        .stream("count", encode_payload(&4u32).unwrap())
        .await
        .unwrap();

    let mut values = Vec::new();
    while let Some(value) = timeout(WAIT, stream.next_value::<u32>()).await.unwrap() {
        values.push(value.unwrap());
    }
    assert_eq!(values, vec![0, 1, 2, 3]);
    assert!(stream.is_finished());
}

#[tokio::test]
async fn test_abort_stream_stops_remote_and_keeps_channel() {
    let mut pair = channel_pair();
    let mut stream = pair.client.stream("forever", Bytes::new()).await.unwrap();

    for _ in 0..3 {
        let item = timeout(WAIT, stream.next()).await.unwrap();
        assert!(item.unwrap().is_ok());
    }
    stream.abort();
    assert!(timeout(WAIT, stream.next()).await.unwrap().is_none());

    let event = timeout(WAIT, pair.events.recv()).await.unwrap();
    assert_eq!(event.as_deref(), Some("forever cancelled"));

    // Frames still in flight for the aborted id must not break the channel
    tokio::time::sleep(Duration::from_millis(50)).await;
    let reply = timeout(WAIT, pair.client.call("echo", Bytes::from_static(b"still here")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"still here"));
    assert!(!pair.client.is_closed());
}

#[tokio::test]
async fn test_dropping_stream_aborts() {
    let mut pair = channel_pair();
    let mut stream = pair.client.stream("forever", Bytes::new()).await.unwrap();
    let _ = timeout(WAIT, stream.next()).await.unwrap();
    drop(stream);

    let event = timeout(WAIT, pair.events.recv()).await.unwrap();
    assert_eq!(event.as_deref(), Some("forever cancelled"));
}

#[tokio::test]
async fn test_duplex_mirror() {
    let pair = channel_pair();
    let (sink, mut stream) = pair.client.duplex("mirror", Bytes::new()).await.unwrap();

    for chunk in [&b"one"[..], b"two", b"three"] {
        sink.send(Bytes::copy_from_slice(chunk)).await.unwrap();
        let echoed = timeout(WAIT, stream.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(&echoed[..], chunk);
    }

    sink.end().await.unwrap();
    assert!(timeout(WAIT, stream.next()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_sink_call() {
    let pair = channel_pair();
    let (sink, reply) = pair.client.sink("sum", Bytes::new()).await.unwrap();
    for value in [1u32, 2, 3, 4] {
        sink.send_value(&value).await.unwrap();
    }
    sink.end().await.unwrap();

    let total: u32 = decode_payload(&timeout(WAIT, reply.response()).await.unwrap().unwrap()).unwrap();
    assert_eq!(total, 10);
}

#[tokio::test]
async fn test_remote_error_is_typed() {
    let pair = channel_pair();
    let err = pair.client.call("fail", Bytes::new()).await.unwrap_err();
    assert_eq!(
        err,
        RpcError::Remote(RoomError::NotOwner("somebody else's".into()))
    );
}

#[tokio::test]
async fn test_handler_without_reply_yields_internal_error() {
    let pair = channel_pair();
    let err = pair.client.call("silent", Bytes::new()).await.unwrap_err();
    assert!(matches!(err, RpcError::Remote(RoomError::Internal(_))));
}

#[tokio::test]
async fn test_notify() {
    let mut pair = channel_pair();
    pair.client
        .notify("note", Bytes::from_static(b"heads up"))
        .await
        .unwrap();
    let event = timeout(WAIT, pair.events.recv()).await.unwrap();
    assert_eq!(event.as_deref(), Some("heads up"));
    assert_eq!(pair.client.pending_calls(), 0);
}

#[tokio::test]
async fn test_unhandled_calls_are_refused() {
    let pair = channel_pair();
    // The client side serves nothing
    let err = pair.server.call("echo", Bytes::new()).await.unwrap_err();
    assert!(matches!(err, RpcError::Remote(RoomError::PermissionDenied(_))));
}

#[tokio::test]
async fn test_close_fails_pending_and_cancels_remote() {
    let mut pair = channel_pair();

    let client = pair.client.clone();
    let call = tokio::spawn(async move { client.call("hang", Bytes::new()).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pair.client.pending_calls(), 1);

    pair.client.close();
    pair.client.close();

    let result = timeout(WAIT, call).await.unwrap().unwrap();
    assert_eq!(result, Err(RpcError::ConnectionClosed));
    timeout(WAIT, pair.client.closed()).await.unwrap();

    // The server notices the stream going away and cancels the handler
    let event = timeout(WAIT, pair.events.recv()).await.unwrap();
    assert_eq!(event.as_deref(), Some("hang cancelled"));
    timeout(WAIT, pair.server.closed()).await.unwrap();

    assert_eq!(
        pair.client.call("echo", Bytes::new()).await,
        Err(RpcError::ConnectionClosed)
    );
}

#[tokio::test]
async fn test_reply_for_unknown_request_is_violation() {
    let (channel, mut raw) = raw_pair();

    let client = channel.clone();
    let call = tokio::spawn(async move { client.call("whoami", Bytes::new()).await });

    let opened = timeout(WAIT, raw.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(opened.kind, FrameKind::Async);
    assert_eq!(opened.method, "whoami");
    assert_eq!(opened.request_id, 1);

    raw.send(Frame::data(99, Bytes::from_static(b"bogus")).as_reply())
        .await
        .unwrap();

    timeout(WAIT, channel.closed()).await.unwrap();
    assert!(channel.is_closed());
    let result = timeout(WAIT, call).await.unwrap().unwrap();
    assert_eq!(result, Err(RpcError::ConnectionClosed));
}

#[tokio::test]
async fn test_reused_request_id_is_violation() {
    let (channel, mut raw) = raw_pair();

    raw.send(Frame::call(5, CallKind::Async, "echo", Bytes::new()))
        .await
        .unwrap();
    // UnhandledCalls refuses it
    let reply = timeout(WAIT, raw.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(reply.kind, FrameKind::Error);
    assert!(reply.is_reply());
    assert_eq!(reply.request_id, 5);

    raw.send(Frame::call(3, CallKind::Async, "echo", Bytes::new()))
        .await
        .unwrap();
    timeout(WAIT, channel.closed()).await.unwrap();
}

#[tokio::test]
async fn test_late_frames_for_finished_call_are_dropped() {
    let (channel, mut raw) = raw_pair();

    raw.send(Frame::call(1, CallKind::Duplex, "tunnel.connect", Bytes::new()))
        .await
        .unwrap();
    // UnhandledCalls answers with an error which finishes the call
    let reply = timeout(WAIT, raw.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(reply.kind, FrameKind::Error);

    // Late frames for the finished call are dropped
    raw.send(Frame::data(1, Bytes::from_static(b"late")))
        .await
        .unwrap();
    raw.send(Frame::abort(1)).await.unwrap();
    assert!(!channel_closed_soon(&channel).await);
}

#[tokio::test]
async fn test_request_ids_start_at_one_and_increase() {
    let (channel, mut raw) = raw_pair();

    let a = channel.clone();
    tokio::spawn(async move { a.notify("first", Bytes::new()).await });
    let first = timeout(WAIT, raw.next()).await.unwrap().unwrap().unwrap();

    let b = channel.clone();
    tokio::spawn(async move { b.notify("second", Bytes::new()).await });
    let second = timeout(WAIT, raw.next()).await.unwrap().unwrap().unwrap();

    assert_eq!(first.request_id, 1);
    assert_eq!(second.request_id, 2);
    assert_eq!(second.kind, FrameKind::Notify);
}

#[tokio::test]
async fn test_remote_disconnect_fails_pending_streams() {
    let (channel, mut raw) = raw_pair();
    let mut stream = channel.stream("tunnel.endpoints", Bytes::new()).await.unwrap();
    let _ = timeout(WAIT, raw.next()).await.unwrap();

    drop(raw);
    let item = timeout(WAIT, stream.next()).await.unwrap();
    assert_eq!(item, Some(Err(RpcError::ConnectionClosed)));
    timeout(WAIT, channel.closed()).await.unwrap();
}

async fn channel_closed_soon(channel: &RpcChannel) -> bool {
    timeout(Duration::from_millis(100), channel.closed())
        .await
        .is_ok()
}

#[tokio::test]
async fn test_byte_stream_over_duplex_call() {
    init_tracing();
    let (a, b) = pipe();
    let client = RpcChannel::spawn(
        a,
        KeyPair::generate().identity(),
        Arc::new(UnhandledCalls),
        ChannelConfig::default(),
    );
    let _server = RpcChannel::spawn(
        b,
        KeyPair::generate().identity(),
        Arc::new(ByteEcho),
        ChannelConfig::default(),
    );

    let (sink, stream) = client.duplex("bytes", Bytes::new()).await.unwrap();
    let mut io = CallIo::caller(sink, stream);

    // Larger than one frame's chunk so the write is split
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let writer = {
        let payload = payload.clone();
        async move {
            io.write_all(&payload).await.unwrap();
            io.shutdown().await.unwrap();
            let mut echoed = Vec::new();
            io.read_to_end(&mut echoed).await.unwrap();
            echoed
        }
    };
    let echoed = timeout(WAIT, writer).await.unwrap();
    assert_eq!(echoed, payload);
}
