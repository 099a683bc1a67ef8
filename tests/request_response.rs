//! End-to-end request/response flows over the in-memory transport.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{TestCodec, TestMessage, TestSink, init_tracing};
use signalbus::config::{ClientConfig, ServerConfig};
use signalbus::error::CallError;
use signalbus::transport::{Connection, MemoryBroker};
use signalbus::{RequestClient, ServerProxy, wall_clock};

const DESTINATION: &str = "signals";

struct Runtime {
    broker: Option<MemoryBroker>,
    client: RequestClient<TestMessage, TestCodec>,
    server: Option<signalbus::ServerProxyHandle<TestMessage, TestCodec, TestSink>>,
}

impl Runtime {
    fn start(sink: Arc<TestSink>, client_config: ClientConfig, server_config: ServerConfig) -> Self {
        init_tracing();
        let broker = MemoryBroker::start();
        let server_conn = broker.connect("server") as Arc<dyn Connection>;
        let client_conn = broker.connect("client") as Arc<dyn Connection>;

        let server = ServerProxy::new(
            vec![server_conn],
            sink,
            Arc::new(TestCodec),
            server_config,
            wall_clock(),
        )
        .start()
        .expect("server starts");

        let client = RequestClient::start(
            vec![client_conn],
            Arc::new(TestCodec),
            client_config,
            wall_clock(),
        )
        .expect("client starts");

        Self {
            broker: Some(broker),
            client,
            server: Some(server),
        }
    }

    fn stop(mut self) {
        self.client.stop();
        if let Some(server) = self.server.take() {
            server.shutdown();
        }
        if let Some(broker) = self.broker.take() {
            broker.shutdown();
        }
    }
}

fn client_config() -> ClientConfig {
    ClientConfig {
        destination_name: DESTINATION.to_string(),
        reaper_interval_millis: 100,
        ..ClientConfig::default()
    }
}

fn server_config() -> ServerConfig {
    ServerConfig {
        destination_name: DESTINATION.to_string(),
        ..ServerConfig::default()
    }
}

#[test]
fn single_response_then_end_of_stream() {
    let sink = TestSink::new(|msg, ctx, _| {
        ctx.add_response(TestMessage::reply(&msg.call_id, "r0"));
        ctx.end_of_stream();
        Ok(())
    });
    let runtime = Runtime::start(sink, client_config(), server_config());

    let handler = runtime
        .client
        .signal(TestMessage::new("t1"), true, 1_000)
        .expect("signal");
    let responses = handler.get_responses(1_000, 10).expect("responses");
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].id, "r0");
    assert!(handler.wait_for_end_of_stream(100));

    runtime.stop();
}

#[test]
fn hundred_responses_arrive_in_order() {
    let sink = TestSink::new(|msg, ctx, _| {
        for i in 0..100 {
            assert!(ctx.add_response(TestMessage::reply(&msg.call_id, &format!("r{i}"))));
        }
        ctx.end_of_stream();
        Ok(())
    });
    let runtime = Runtime::start(sink, client_config(), server_config());

    let handler = runtime
        .client
        .signal(TestMessage::new("t1"), true, 5_000)
        .expect("signal");

    let mut seen = Vec::new();
    while let Some(msg) = handler.get_next_response(2_000).expect("next") {
        seen.push(msg.id);
    }
    assert_eq!(seen.len(), 100);
    for (i, id) in seen.iter().enumerate() {
        assert_eq!(id, &format!("r{i}"));
    }
    assert!(handler.wait_for_end_of_stream(100));

    runtime.stop();
}

#[test]
fn keep_alive_extends_past_the_initial_deadline() {
    let sink = TestSink::new(|msg, ctx, _| {
        for _ in 0..5 {
            thread::sleep(Duration::from_millis(200));
            ctx.keep_alive(wall_clock().now_millis() + 800);
        }
        ctx.add_response(TestMessage::reply(&msg.call_id, "resp"));
        ctx.end_of_stream();
        Ok(())
    });
    let runtime = Runtime::start(sink, client_config(), server_config());

    let handler = runtime
        .client
        .signal(TestMessage::new("t1"), true, 700)
        .expect("signal");
    let response = handler
        .get_next_response_blocking()
        .expect("kept alive")
        .expect("one response");
    assert_eq!(response.id, "resp");
    assert!(handler.wait_for_end_of_stream(500));

    runtime.stop();
}

#[test]
fn keep_alive_is_ignored_without_opt_in() {
    let sink = TestSink::new(|msg, ctx, _| {
        thread::sleep(Duration::from_millis(300));
        ctx.keep_alive(wall_clock().now_millis() + 5_000);
        thread::sleep(Duration::from_millis(600));
        ctx.add_response(TestMessage::reply(&msg.call_id, "late"));
        ctx.end_of_stream();
        Ok(())
    });
    let runtime = Runtime::start(sink, client_config(), server_config());

    let handler = runtime
        .client
        .signal(TestMessage::new("t1"), false, 400)
        .expect("signal");
    // the call closes at its initial deadline despite the keep-alive
    assert!(handler.wait_for_end_of_stream(2_000));
    assert!(handler.get_next_response(10).expect("no error").is_none());

    runtime.stop();
}

#[test]
fn server_watchdog_keeps_slow_sinks_alive() {
    let sink = TestSink::new(|msg, ctx, _| {
        // slower than the client deadline; the watchdog must cover for us
        thread::sleep(Duration::from_millis(600));
        ctx.add_response(TestMessage::reply(&msg.call_id, "slow"));
        ctx.end_of_stream();
        Ok(())
    });
    let server_config = ServerConfig {
        keep_alive_interval_millis: 150,
        ..server_config()
    };
    let runtime = Runtime::start(sink, client_config(), server_config);

    let handler = runtime
        .client
        .signal(TestMessage::new("t1"), true, 300)
        .expect("signal");
    let response = handler
        .get_next_response_blocking()
        .expect("no error")
        .expect("watchdog kept the call open");
    assert_eq!(response.id, "slow");

    runtime.stop();
}

#[test]
fn sink_error_reaches_the_caller_with_its_type_token() {
    let sink = TestSink::new(|_, _, _| {
        Err(CallError::remote("IllegalStateException", "sink refused"))
    });
    let runtime = Runtime::start(sink, client_config(), server_config());

    let handler = runtime
        .client
        .signal(TestMessage::new("t1"), true, 2_000)
        .expect("signal");
    let err = loop {
        match handler.get_next_response(2_000) {
            Err(err) => break err,
            Ok(Some(_)) => panic!("no responses expected"),
            Ok(None) => panic!("expected an error before the deadline"),
        }
    };
    assert_eq!(err.error_type(), "IllegalStateException");
    assert!(err.to_string().contains("sink refused"));

    runtime.stop();
}

#[test]
fn context_error_reaches_the_caller() {
    let sink = TestSink::new(|_, ctx, _| {
        ctx.notify_error(CallError::remote("IllegalStateException", "async failure"));
        Ok(())
    });
    let runtime = Runtime::start(sink, client_config(), server_config());

    let handler = runtime
        .client
        .signal(TestMessage::new("t1"), true, 2_000)
        .expect("signal");
    let err = handler.get_next_response(2_000).expect_err("error expected");
    assert_eq!(err.error_type(), "IllegalStateException");

    runtime.stop();
}

#[test]
fn terminal_events_are_observed_at_most_once() {
    let sink = TestSink::new(|msg, ctx, _| {
        ctx.add_response(TestMessage::reply(&msg.call_id, "r0"));
        ctx.end_of_stream();
        // losers of the terminal race are no-ops
        ctx.notify_error(CallError::remote("IllegalStateException", "ignored"));
        ctx.end_of_stream();
        assert!(!ctx.add_response(TestMessage::reply(&msg.call_id, "late")));
        Ok(())
    });
    let runtime = Runtime::start(sink, client_config(), server_config());

    let handler = runtime
        .client
        .signal(TestMessage::new("t1"), true, 2_000)
        .expect("signal");
    let responses = handler.get_responses(2_000, 10).expect("no error surfaced");
    assert_eq!(responses.len(), 1);
    assert!(handler.wait_for_end_of_stream(500));
    // the stream closed cleanly; the late error never surfaced
    assert!(handler.get_responses_no_wait().is_ok());

    runtime.stop();
}

#[test]
fn large_responses_are_fragmented_and_reassembled() {
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let sink = TestSink::new(move |msg, ctx, _| {
        ctx.add_response(TestMessage::reply(&msg.call_id, "big").with_data(payload.clone()));
        ctx.end_of_stream();
        Ok(())
    });
    let runtime = Runtime::start(sink, client_config(), server_config());

    let handler = runtime
        .client
        .signal(TestMessage::new("t1"), true, 5_000)
        .expect("signal");
    let response = handler
        .get_next_response(5_000)
        .expect("no error")
        .expect("fragmented response arrives");
    assert_eq!(response.id, "big");
    assert_eq!(response.data, expected);
    assert!(handler.wait_for_end_of_stream(1_000));

    runtime.stop();
}

#[test]
fn concurrent_calls_multiplex_over_one_reply_destination() {
    let sink = TestSink::new(|msg, ctx, _| {
        ctx.add_response(TestMessage::reply(&msg.call_id, &format!("echo-{}", msg.id)));
        ctx.end_of_stream();
        Ok(())
    });
    let runtime = Runtime::start(sink, client_config(), server_config());

    let mut handlers = Vec::new();
    for i in 0..16 {
        let handler = runtime
            .client
            .signal(TestMessage::new(&format!("m{i}")), true, 5_000)
            .expect("signal");
        handlers.push((i, handler));
    }
    for (i, handler) in handlers {
        let response = handler
            .get_next_response(5_000)
            .expect("no error")
            .expect("response");
        assert_eq!(response.id, format!("echo-m{i}"));
    }

    runtime.stop();
}

#[test]
fn signal_through_the_request_sink_trait() {
    let sink = TestSink::new(|msg, ctx, _| {
        ctx.add_response(TestMessage::reply(&msg.call_id, "via-trait"));
        ctx.end_of_stream();
        Ok(())
    });
    let runtime = Runtime::start(sink, client_config(), server_config());

    let handler = signalbus::RequestHandler::signal(
        &runtime.client,
        TestMessage::new("t1"),
        true,
        2_000,
    )
    .expect("signal through trait");
    let response = handler
        .get_next_response(2_000)
        .expect("no error")
        .expect("response");
    assert_eq!(response.id, "via-trait");

    runtime.stop();
}
