//! Call shape conformance tests.
//!
//! Every test runs a full client session against a full server session, over
//! the in-process transport and over the byte-stream transport.

use std::cell::Cell;
use std::time::Duration;

use futures_util::StreamExt;
use tandem::{
    BidiStream, CallContext, Client, ClientStreamingCall, Code, Encoding, ResponseSink, Router,
    Server, SessionConfig, Status, Streaming, Transport,
};
use tokio::sync::mpsc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Reports handler lifecycle to the test.
type Events = mpsc::UnboundedSender<&'static str>;

/// Sends `"dropped"` when the handler future holding it is torn down.
struct DropSignal(Events);

impl DropSignal {
    fn start(events: &Events) -> Self {
        let _ = events.send("started");
        Self(events.clone())
    }
}

impl Drop for DropSignal {
    fn drop(&mut self) {
        let _ = self.0.send("dropped");
    }
}

fn test_router(events: Events) -> Router {
    let mut router = Router::new();
    router
        .unary("test.Echo", |_ctx, text: String| async move { Ok(text) })
        .unwrap()
        .unary("test.Fail", |_ctx, _req: ()| async move {
            Err::<(), Status>(Status::invalid_argument("no thanks"))
        })
        .unwrap()
        .unary("test.Panic", |_ctx, fail: bool| async move {
            if fail {
                panic!("handler blew up");
            }
            Ok::<u32, Status>(1)
        })
        .unwrap()
        .unary("test.Context", |ctx: CallContext, _req: ()| async move {
            Ok((
                ctx.metadata_value("user").map(str::to_string),
                ctx.deadline().is_some(),
            ))
        })
        .unwrap();

    let block_events = events.clone();
    router
        .unary("test.Block", move |_ctx, _req: ()| {
            let guard = DropSignal::start(&block_events);
            async move {
                let _guard = guard;
                std::future::pending::<Result<(), Status>>().await
            }
        })
        .unwrap();

    router
        .server_streaming("test.Count", |_ctx, n: u32, sink: ResponseSink<u32>| async move {
            for i in 0..n {
                sink.send(i).await?;
            }
            Ok(())
        })
        .unwrap()
        .server_streaming(
            "test.CountThenFail",
            |_ctx, n: u32, sink: ResponseSink<u32>| async move {
                for i in 0..n {
                    sink.send(i).await?;
                }
                Err(Status::invalid_argument(format!("stopped at {}", n)))
            },
        )
        .unwrap();

    let stall_events = events.clone();
    router
        .server_streaming(
            "test.Stall",
            move |_ctx, _req: (), sink: ResponseSink<u32>| {
                let guard = DropSignal::start(&stall_events);
                async move {
                    let _guard = guard;
                    let _sink = sink;
                    std::future::pending::<Result<(), Status>>().await
                }
            },
        )
        .unwrap();

    let hold_events = events.clone();
    router
        .client_streaming("test.Hold", move |_ctx, reqs: Streaming<Vec<u8>>| {
            let guard = DropSignal::start(&hold_events);
            async move {
                let _guard = guard;
                let _reqs = reqs;
                std::future::pending::<Result<u32, Status>>().await
            }
        })
        .unwrap();

    let silent_events = events.clone();
    router
        .bidi_streaming(
            "test.Silent",
            move |_ctx, reqs: Streaming<i64>, sink: ResponseSink<i64>| {
                let guard = DropSignal::start(&silent_events);
                async move {
                    let _guard = guard;
                    let _held = (reqs, sink);
                    std::future::pending::<Result<(), Status>>().await
                }
            },
        )
        .unwrap();

    // Messages that are Send but not Sync.
    router
        .unary("test.Tally", |_ctx, n: Cell<u32>| async move {
            Ok(Cell::new(n.get() + 1))
        })
        .unwrap()
        .client_streaming("test.TallyAll", |_ctx, mut values: Streaming<Cell<u32>>| async move {
            let total = Cell::new(0u32);
            while let Some(value) = values.message().await? {
                total.set(total.get() + value.get());
            }
            Ok(total)
        })
        .unwrap()
        .server_streaming(
            "test.TallyUp",
            |_ctx, n: u32, sink: ResponseSink<Cell<u32>>| async move {
                for i in 0..n {
                    sink.send(Cell::new(i)).await?;
                }
                Ok(())
            },
        )
        .unwrap();

    let ticker_events = events;
    router
        .server_streaming(
            "test.Ticker",
            move |_ctx, _req: (), sink: ResponseSink<u64>| {
                let guard = DropSignal::start(&ticker_events);
                async move {
                    let _guard = guard;
                    let mut tick = 0u64;
                    loop {
                        sink.send(tick).await?;
                        tick += 1;
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                }
            },
        )
        .unwrap();

    router
        .client_streaming("test.Sum", |_ctx, mut values: Streaming<i64>| async move {
            let mut total = 0i64;
            while let Some(value) = values.message().await? {
                total += value;
            }
            Ok(total)
        })
        .unwrap()
        .bidi_streaming(
            "test.Mirror",
            |_ctx, mut values: Streaming<i64>, sink: ResponseSink<i64>| async move {
                while let Some(value) = values.message().await? {
                    if value < 0 {
                        return Err(Status::invalid_argument(format!("negative value: {}", value)));
                    }
                    sink.send(value).await?;
                }
                Ok(())
            },
        )
        .unwrap();

    router
}

struct Harness {
    client: Client,
    server_transport: Transport,
    events: mpsc::UnboundedReceiver<&'static str>,
}

impl Harness {
    fn start(make_pair: impl FnOnce() -> (Transport, Transport)) -> Self {
        Self::start_with_config(make_pair, SessionConfig::default())
    }

    fn start_with_config(
        make_pair: impl FnOnce() -> (Transport, Transport),
        config: SessionConfig,
    ) -> Self {
        init_tracing();
        let (client_transport, server_transport) = make_pair();
        let (events_tx, events) = mpsc::unbounded_channel();

        let server = Server::new(test_router(events_tx));
        let serving = server_transport.clone();
        tokio::spawn(async move { server.serve(serving).await });

        Self {
            client: Client::connect_with_config(client_transport, config),
            server_transport,
            events,
        }
    }

    async fn expect_event(&mut self, expected: &'static str) {
        let event = tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("timed out waiting for handler event");
        assert_eq!(event, Some(expected));
    }
}

async fn run_unary_round_trip(make_pair: fn() -> (Transport, Transport)) {
    let h = Harness::start(make_pair);
    let ctx = CallContext::new();

    let reply: String = h
        .client
        .unary("test.Echo", &ctx, "hello".to_string())
        .await
        .expect("unary call failed");
    assert_eq!(reply, "hello");
    assert_eq!(h.client.session().open_calls(), 0);

    h.client.close();
}

async fn run_unary_error_status(make_pair: fn() -> (Transport, Transport)) {
    let h = Harness::start(make_pair);

    let err = h
        .client
        .unary::<(), ()>("test.Fail", &CallContext::new(), ())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(err.message(), "no thanks");

    h.client.close();
}

async fn run_server_streaming_in_order(make_pair: fn() -> (Transport, Transport)) {
    let h = Harness::start(make_pair);

    let mut stream: Streaming<u32> = h
        .client
        .server_streaming("test.Count", &CallContext::new(), 4u32)
        .await
        .unwrap();
    let mut received = Vec::new();
    while let Some(value) = stream.message().await.unwrap() {
        received.push(value);
    }
    assert_eq!(received, vec![0, 1, 2, 3]);
    assert_eq!(stream.outcome(), Some(Ok(())));
    // Completed streams stay completed.
    assert_eq!(stream.message().await.unwrap(), None);

    h.client.close();
}

async fn run_server_streaming_failure_after_values(make_pair: fn() -> (Transport, Transport)) {
    let h = Harness::start(make_pair);

    let mut stream: Streaming<u32> = h
        .client
        .server_streaming("test.CountThenFail", &CallContext::new(), 2u32)
        .await
        .unwrap();
    assert_eq!(stream.message().await.unwrap(), Some(0));
    assert_eq!(stream.message().await.unwrap(), Some(1));

    let err = stream.message().await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(err.message(), "stopped at 2");

    // The failure is reported once, then kept as the outcome.
    assert_eq!(stream.message().await.unwrap(), None);
    assert_eq!(stream.outcome().unwrap().unwrap_err().code(), Code::InvalidArgument);

    h.client.close();
}

async fn run_client_streaming_aggregate(make_pair: fn() -> (Transport, Transport)) {
    let h = Harness::start(make_pair);
    let ctx = CallContext::new();

    let mut call: ClientStreamingCall<i64, i64> =
        h.client.client_streaming("test.Sum", &ctx).await.unwrap();
    for value in [1, 2, 3, 4] {
        call.send(value).await.unwrap();
    }
    assert_eq!(call.close_and_recv().await.unwrap(), 10);

    let empty: ClientStreamingCall<i64, i64> =
        h.client.client_streaming("test.Sum", &ctx).await.unwrap();
    assert_eq!(empty.close_and_recv().await.unwrap(), 0);

    h.client.close();
}

async fn run_bidi_exchange(make_pair: fn() -> (Transport, Transport)) {
    let h = Harness::start(make_pair);

    let call: BidiStream<i64, i64> = h
        .client
        .bidi_streaming("test.Mirror", &CallContext::new())
        .await
        .unwrap();
    let mut completion = call.completion();
    let (requests, responses) = call.into_parts();

    let sender = tokio::spawn(async move {
        for value in [1, 4, 3, 5] {
            requests.send(value).unwrap();
        }
        requests.close_send();
    });
    let received = responses.collect_all().await.unwrap();
    sender.await.unwrap();

    assert_eq!(received, vec![1, 4, 3, 5]);
    assert_eq!(completion.wait().await, Ok(()));

    h.client.close();
}

async fn run_bidi_receive_failure_halts_sends(make_pair: fn() -> (Transport, Transport)) {
    let h = Harness::start(make_pair);

    let mut call: BidiStream<i64, i64> = h
        .client
        .bidi_streaming("test.Mirror", &CallContext::new())
        .await
        .unwrap();
    call.send(7).unwrap();
    assert_eq!(call.message().await.unwrap(), Some(7));

    call.send(-1).unwrap();
    let err = call.message().await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let mut completion = call.completion();
    assert_eq!(completion.wait().await.unwrap_err().code(), Code::InvalidArgument);
    assert_eq!(call.send(8).unwrap_err().code(), Code::InvalidArgument);
    assert_eq!(call.message().await.unwrap(), None);

    h.client.close();
}

async fn run_send_after_close(make_pair: fn() -> (Transport, Transport)) {
    let h = Harness::start(make_pair);

    let mut call: BidiStream<i64, i64> = h
        .client
        .bidi_streaming("test.Mirror", &CallContext::new())
        .await
        .unwrap();
    call.send(2).unwrap();
    call.close_send();

    let err = call.send(3).unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert_eq!(err.message(), "send after close");

    assert_eq!(call.message().await.unwrap(), Some(2));
    assert_eq!(call.message().await.unwrap(), None);

    h.client.close();
}

async fn run_unknown_method(make_pair: fn() -> (Transport, Transport)) {
    let h = Harness::start(make_pair);

    let err = h
        .client
        .unary::<(), ()>("test.Missing", &CallContext::new(), ())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
    assert!(err.message().contains("test.Missing"));

    h.client.close();
}

async fn run_kind_mismatch(make_pair: fn() -> (Transport, Transport)) {
    let h = Harness::start(make_pair);

    let mut stream: Streaming<String> = h
        .client
        .server_streaming("test.Echo", &CallContext::new(), "hi".to_string())
        .await
        .unwrap();
    assert_eq!(stream.message().await.unwrap_err().code(), Code::Internal);

    h.client.close();
}

async fn run_handler_panic(make_pair: fn() -> (Transport, Transport)) {
    let h = Harness::start(make_pair);
    let ctx = CallContext::new();

    let err = h.client.unary::<bool, u32>("test.Panic", &ctx, true).await.unwrap_err();
    assert_eq!(err.code(), Code::Internal);

    // The session survives the panic.
    let ok: u32 = h.client.unary("test.Panic", &ctx, false).await.unwrap();
    assert_eq!(ok, 1);

    h.client.close();
}

async fn run_deadline_exceeded(make_pair: fn() -> (Transport, Transport)) {
    let mut h = Harness::start(make_pair);
    let ctx = CallContext::new().with_timeout(Duration::from_millis(100));

    let started = tokio::time::Instant::now();
    let err = h.client.unary::<(), ()>("test.Block", &ctx, ()).await.unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);
    assert!(started.elapsed() < Duration::from_secs(2));

    // The deadline travelled with the call, so the handler is torn down too.
    h.expect_event("started").await;
    h.expect_event("dropped").await;

    h.client.close();
}

async fn run_cancel_unary(make_pair: fn() -> (Transport, Transport)) {
    let mut h = Harness::start(make_pair);
    let ctx = CallContext::new();

    let client = h.client.clone();
    let call_ctx = ctx.clone();
    let pending =
        tokio::spawn(async move { client.unary::<(), ()>("test.Block", &call_ctx, ()).await });

    h.expect_event("started").await;
    ctx.cancel();

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.code(), Code::Cancelled);
    h.expect_event("dropped").await;

    h.client.close();
}

async fn run_cancel_mid_stream(make_pair: fn() -> (Transport, Transport)) {
    let mut h = Harness::start(make_pair);
    let ctx = CallContext::new();

    let mut stream: Streaming<u64> = h
        .client
        .server_streaming("test.Ticker", &ctx, ())
        .await
        .unwrap();
    assert_eq!(stream.message().await.unwrap(), Some(0));
    assert_eq!(stream.message().await.unwrap(), Some(1));

    ctx.cancel();
    assert_eq!(stream.message().await.unwrap_err().code(), Code::Cancelled);
    assert_eq!(stream.message().await.unwrap(), None);

    h.expect_event("started").await;
    h.expect_event("dropped").await;

    h.client.close();
}

async fn run_transport_close_fails_open_calls(make_pair: fn() -> (Transport, Transport)) {
    let mut h = Harness::start(make_pair);

    let client = h.client.clone();
    let pending = tokio::spawn(async move {
        client
            .unary::<(), ()>("test.Block", &CallContext::new(), ())
            .await
    });
    h.expect_event("started").await;

    h.server_transport.close();

    let err = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("open call hung after transport close")
        .unwrap()
        .unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
}

async fn run_server_streaming_deadline(make_pair: fn() -> (Transport, Transport)) {
    let mut h = Harness::start(make_pair);
    let ctx = CallContext::new().with_timeout(Duration::from_millis(100));

    let mut stream: Streaming<u32> = h
        .client
        .server_streaming("test.Stall", &ctx, ())
        .await
        .unwrap();
    let started = tokio::time::Instant::now();
    assert_eq!(stream.message().await.unwrap_err().code(), Code::DeadlineExceeded);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(stream.message().await.unwrap(), None);

    h.expect_event("started").await;
    h.expect_event("dropped").await;

    h.client.close();
}

async fn run_client_streaming_deadline(make_pair: fn() -> (Transport, Transport)) {
    let mut h = Harness::start(make_pair);
    let ctx = CallContext::new().with_timeout(Duration::from_millis(100));

    let mut call: ClientStreamingCall<Vec<u8>, u32> =
        h.client.client_streaming("test.Hold", &ctx).await.unwrap();
    call.send(vec![1, 2, 3]).await.unwrap();
    let err = call.close_and_recv().await.unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);

    h.expect_event("started").await;
    h.expect_event("dropped").await;

    h.client.close();
}

async fn run_bidi_deadline(make_pair: fn() -> (Transport, Transport)) {
    let mut h = Harness::start(make_pair);
    let ctx = CallContext::new().with_timeout(Duration::from_millis(100));

    let mut call: BidiStream<i64, i64> = h
        .client
        .bidi_streaming("test.Silent", &ctx)
        .await
        .unwrap();
    let mut completion = call.completion();
    call.send(1).unwrap();

    assert_eq!(call.message().await.unwrap_err().code(), Code::DeadlineExceeded);
    assert_eq!(completion.wait().await.unwrap_err().code(), Code::DeadlineExceeded);
    assert_eq!(call.send(2).unwrap_err().code(), Code::DeadlineExceeded);

    h.expect_event("started").await;
    h.expect_event("dropped").await;

    h.client.close();
}

async fn run_unread_stream_leaves_other_calls_alone(make_pair: fn() -> (Transport, Transport)) {
    let h = Harness::start(make_pair);
    let ctx = CallContext::new().with_timeout(Duration::from_secs(10));

    // Far more than one receive window, and nobody reading yet.
    let mut flood: Streaming<u32> = h
        .client
        .server_streaming("test.Count", &ctx, 1000u32)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let reply: String = tokio::time::timeout(
        Duration::from_secs(2),
        h.client.unary("test.Echo", &ctx, "still here".to_string()),
    )
    .await
    .expect("a call stuck behind an unread stream")
    .unwrap();
    assert_eq!(reply, "still here");

    // The flooding call resumes once it is read, in order and complete.
    let mut expected = 0u32;
    while let Some(value) = flood.message().await.unwrap() {
        assert_eq!(value, expected);
        expected += 1;
    }
    assert_eq!(expected, 1000);

    h.client.close();
}

async fn run_long_client_stream(make_pair: fn() -> (Transport, Transport)) {
    let h = Harness::start(make_pair);
    let ctx = CallContext::new().with_timeout(Duration::from_secs(10));

    // Several receive windows' worth, so the server has to keep granting.
    let mut call: ClientStreamingCall<i64, i64> =
        h.client.client_streaming("test.Sum", &ctx).await.unwrap();
    for value in 1..=500 {
        call.send(value).await.unwrap();
    }
    assert_eq!(call.close_and_recv().await.unwrap(), 125_250);

    h.client.close();
}

async fn run_abandoned_large_sends(make_pair: fn() -> (Transport, Transport)) {
    let mut h = Harness::start(make_pair);
    let ctx = CallContext::new().with_timeout(Duration::from_millis(100));

    let mut call: ClientStreamingCall<Vec<u8>, u32> =
        h.client.client_streaming("test.Hold", &ctx).await.unwrap();
    // The handler never reads, so sends eventually stall until the deadline
    // cuts one off partway.
    let err = loop {
        if let Err(status) = call.send(vec![0x42; 256 * 1024]).await {
            break status;
        }
    };
    assert_eq!(err.code(), Code::DeadlineExceeded);
    drop(call);
    h.expect_event("started").await;
    h.expect_event("dropped").await;

    // The connection still carries whole frames.
    let ctx = CallContext::new().with_timeout(Duration::from_secs(5));
    let reply: String = h.client.unary("test.Echo", &ctx, "after".to_string()).await.unwrap();
    assert_eq!(reply, "after");

    h.client.close();
}

async fn run_messages_need_not_be_sync(make_pair: fn() -> (Transport, Transport)) {
    let h = Harness::start(make_pair);
    let ctx = CallContext::new().with_timeout(Duration::from_secs(5));

    // Spawning demands Send futures from every call shape used here.
    let client = h.client.clone();
    let call_ctx = ctx.clone();
    let tallied = tokio::spawn(async move {
        let one: Cell<u32> = client.unary("test.Tally", &call_ctx, Cell::new(41)).await?;

        let mut call: ClientStreamingCall<Cell<u32>, Cell<u32>> =
            client.client_streaming("test.TallyAll", &call_ctx).await?;
        for value in [1, 2, 3] {
            call.send(Cell::new(value)).await?;
        }
        let all = call.close_and_recv().await?;

        let up: Vec<Cell<u32>> = client
            .server_streaming("test.TallyUp", &call_ctx, 3u32)
            .await?
            .collect_all()
            .await?;
        Ok::<_, Status>((one.get(), all.get(), up.iter().map(Cell::get).collect::<Vec<_>>()))
    });

    let (one, all, up) = tallied.await.unwrap().unwrap();
    assert_eq!(one, 42);
    assert_eq!(all, 6);
    assert_eq!(up, vec![0, 1, 2]);

    h.client.close();
}

#[tokio::test]
async fn mem_unary_round_trip() {
    run_unary_round_trip(Transport::mem_pair).await;
}

#[tokio::test]
async fn mem_unary_error_status() {
    run_unary_error_status(Transport::mem_pair).await;
}

#[tokio::test]
async fn mem_server_streaming_in_order() {
    run_server_streaming_in_order(Transport::mem_pair).await;
}

#[tokio::test]
async fn mem_server_streaming_failure_after_values() {
    run_server_streaming_failure_after_values(Transport::mem_pair).await;
}

#[tokio::test]
async fn mem_client_streaming_aggregate() {
    run_client_streaming_aggregate(Transport::mem_pair).await;
}

#[tokio::test]
async fn mem_bidi_exchange() {
    run_bidi_exchange(Transport::mem_pair).await;
}

#[tokio::test]
async fn mem_bidi_receive_failure_halts_sends() {
    run_bidi_receive_failure_halts_sends(Transport::mem_pair).await;
}

#[tokio::test]
async fn mem_send_after_close() {
    run_send_after_close(Transport::mem_pair).await;
}

#[tokio::test]
async fn mem_unknown_method() {
    run_unknown_method(Transport::mem_pair).await;
}

#[tokio::test]
async fn mem_kind_mismatch() {
    run_kind_mismatch(Transport::mem_pair).await;
}

#[tokio::test]
async fn mem_handler_panic() {
    run_handler_panic(Transport::mem_pair).await;
}

#[tokio::test]
async fn mem_deadline_exceeded() {
    run_deadline_exceeded(Transport::mem_pair).await;
}

#[tokio::test]
async fn mem_cancel_unary() {
    run_cancel_unary(Transport::mem_pair).await;
}

#[tokio::test]
async fn mem_cancel_mid_stream() {
    run_cancel_mid_stream(Transport::mem_pair).await;
}

#[tokio::test]
async fn mem_transport_close_fails_open_calls() {
    run_transport_close_fails_open_calls(Transport::mem_pair).await;
}

#[tokio::test]
async fn mem_server_streaming_deadline() {
    run_server_streaming_deadline(Transport::mem_pair).await;
}

#[tokio::test]
async fn mem_client_streaming_deadline() {
    run_client_streaming_deadline(Transport::mem_pair).await;
}

#[tokio::test]
async fn mem_bidi_deadline() {
    run_bidi_deadline(Transport::mem_pair).await;
}

#[tokio::test]
async fn mem_unread_stream_leaves_other_calls_alone() {
    run_unread_stream_leaves_other_calls_alone(Transport::mem_pair).await;
}

#[tokio::test]
async fn mem_long_client_stream() {
    run_long_client_stream(Transport::mem_pair).await;
}

#[tokio::test]
async fn mem_abandoned_large_sends() {
    run_abandoned_large_sends(Transport::mem_pair).await;
}

#[tokio::test]
async fn mem_messages_need_not_be_sync() {
    run_messages_need_not_be_sync(Transport::mem_pair).await;
}

#[cfg(feature = "stream")]
#[tokio::test]
async fn stream_unary_round_trip() {
    run_unary_round_trip(Transport::stream_pair).await;
}

#[cfg(feature = "stream")]
#[tokio::test]
async fn stream_server_streaming_in_order() {
    run_server_streaming_in_order(Transport::stream_pair).await;
}

#[cfg(feature = "stream")]
#[tokio::test]
async fn stream_client_streaming_aggregate() {
    run_client_streaming_aggregate(Transport::stream_pair).await;
}

#[cfg(feature = "stream")]
#[tokio::test]
async fn stream_bidi_exchange() {
    run_bidi_exchange(Transport::stream_pair).await;
}

#[cfg(feature = "stream")]
#[tokio::test]
async fn stream_bidi_receive_failure_halts_sends() {
    run_bidi_receive_failure_halts_sends(Transport::stream_pair).await;
}

#[cfg(feature = "stream")]
#[tokio::test]
async fn stream_deadline_exceeded() {
    run_deadline_exceeded(Transport::stream_pair).await;
}

#[cfg(feature = "stream")]
#[tokio::test]
async fn stream_cancel_mid_stream() {
    run_cancel_mid_stream(Transport::stream_pair).await;
}

#[cfg(feature = "stream")]
#[tokio::test]
async fn stream_transport_close_fails_open_calls() {
    run_transport_close_fails_open_calls(Transport::stream_pair).await;
}

#[cfg(feature = "stream")]
#[tokio::test]
async fn stream_server_streaming_deadline() {
    run_server_streaming_deadline(Transport::stream_pair).await;
}

#[cfg(feature = "stream")]
#[tokio::test]
async fn stream_client_streaming_deadline() {
    run_client_streaming_deadline(Transport::stream_pair).await;
}

#[cfg(feature = "stream")]
#[tokio::test]
async fn stream_bidi_deadline() {
    run_bidi_deadline(Transport::stream_pair).await;
}

#[cfg(feature = "stream")]
#[tokio::test]
async fn stream_unread_stream_leaves_other_calls_alone() {
    run_unread_stream_leaves_other_calls_alone(Transport::stream_pair).await;
}

#[cfg(feature = "stream")]
#[tokio::test]
async fn stream_long_client_stream() {
    run_long_client_stream(Transport::stream_pair).await;
}

#[cfg(feature = "stream")]
#[tokio::test]
async fn stream_abandoned_large_sends() {
    run_abandoned_large_sends(Transport::stream_pair).await;
}

#[tokio::test]
async fn already_cancelled_context_never_opens_a_call() {
    let h = Harness::start(Transport::mem_pair);
    let ctx = CallContext::new();
    ctx.cancel();

    let err = h
        .client
        .unary::<String, String>("test.Echo", &ctx, "late".to_string())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Cancelled);
    assert_eq!(h.client.session().open_calls(), 0);
}

#[tokio::test]
async fn metadata_and_deadline_reach_the_handler() {
    let h = Harness::start(Transport::mem_pair);

    let ctx = CallContext::new().with_metadata("user", "ada");
    let (user, has_deadline): (Option<String>, bool) =
        h.client.unary("test.Context", &ctx, ()).await.unwrap();
    assert_eq!(user.as_deref(), Some("ada"));
    assert!(!has_deadline);

    let ctx = ctx.with_timeout(Duration::from_secs(30));
    let (_, has_deadline): (Option<String>, bool) =
        h.client.unary("test.Context", &ctx, ()).await.unwrap();
    assert!(has_deadline);
}

#[tokio::test]
async fn default_timeout_bounds_calls_without_deadline() {
    let h = Harness::start_with_config(
        Transport::mem_pair,
        SessionConfig::default().with_default_timeout(Duration::from_millis(50)),
    );

    let err = h
        .client
        .unary::<(), ()>("test.Block", &CallContext::new(), ())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);
}

#[tokio::test]
async fn json_encoding_is_negotiated_per_call() {
    let h = Harness::start_with_config(
        Transport::mem_pair,
        SessionConfig::default().with_encoding(Encoding::Json),
    );

    let stream: Streaming<u32> = h
        .client
        .server_streaming("test.Count", &CallContext::new(), 3u32)
        .await
        .unwrap();
    assert_eq!(stream.collect_all().await.unwrap(), vec![0, 1, 2]);
}

#[tokio::test]
async fn concurrent_calls_share_one_connection() {
    let h = Harness::start(Transport::mem_pair);
    let ctx = CallContext::new();

    let calls = (0..16).map(|i| {
        let client = h.client.clone();
        let ctx = ctx.clone();
        async move {
            let reply: String = client.unary("test.Echo", &ctx, format!("call {}", i)).await?;
            Ok::<_, Status>(reply)
        }
    });
    let replies = futures_util::future::join_all(calls).await;
    for (i, reply) in replies.into_iter().enumerate() {
        assert_eq!(reply.unwrap(), format!("call {}", i));
    }
}

#[tokio::test]
async fn streaming_adapts_to_futures_stream() {
    let h = Harness::start(Transport::mem_pair);

    let stream: Streaming<u32> = h
        .client
        .server_streaming("test.CountThenFail", &CallContext::new(), 2u32)
        .await
        .unwrap();
    let items: Vec<Result<u32, Status>> = stream.into_stream().collect().await;
    assert_eq!(items.len(), 3);
    assert_eq!(items[0], Ok(0));
    assert_eq!(items[1], Ok(1));
    assert_eq!(items[2].as_ref().unwrap_err().code(), Code::InvalidArgument);
}

#[tokio::test]
async fn one_message_window_still_streams_everything() {
    let h = Harness::start_with_config(
        Transport::mem_pair,
        SessionConfig::default().with_channel_capacity(1),
    );

    let stream: Streaming<u32> = h
        .client
        .server_streaming("test.Count", &CallContext::new(), 100u32)
        .await
        .unwrap();
    let values = stream.collect_all().await.unwrap();
    assert_eq!(values, (0..100).collect::<Vec<_>>());
}
