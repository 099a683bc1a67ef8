//! Channel-upload flows: oversized signals travel through a server-allocated
//! upload channel as digest-checked fragments.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{TestCodec, TestMessage, TestSink, init_tracing};
use crossbeam::channel::{Receiver as ChannelReceiver, unbounded};
use signalbus::config::{ClientConfig, ProtocolRevision, ServerConfig};
use signalbus::error::CallError;
use signalbus::transport::{
    Connection, Destination, MemoryBroker, SendOptions, Sender, TransportMessage,
};
use signalbus::wire::{
    Envelope, MessageType, ProtocolVersion, decode_envelope, encode_envelope, md5_hex, split,
};
use signalbus::{MessageCodec, RequestClient, ServerProxy, wall_clock};

const DESTINATION: &str = "signals";

fn capture_sink() -> (Arc<TestSink>, ChannelReceiver<TestMessage>) {
    let (tx, rx) = unbounded();
    let sink = TestSink::new(move |msg: TestMessage, ctx, _| {
        tx.send(msg.clone()).unwrap();
        ctx.add_response(TestMessage::reply(&msg.call_id, "ack"));
        ctx.end_of_stream();
        Ok(())
    });
    (sink, rx)
}

fn start_server(
    broker: &MemoryBroker,
    sink: Arc<TestSink>,
    config: ServerConfig,
) -> signalbus::ServerProxyHandle<TestMessage, TestCodec, TestSink> {
    ServerProxy::new(
        vec![broker.connect("server") as Arc<dyn Connection>],
        sink,
        Arc::new(TestCodec),
        config,
        wall_clock(),
    )
    .start()
    .expect("server starts")
}

fn server_config() -> ServerConfig {
    ServerConfig {
        destination_name: DESTINATION.to_string(),
        ..ServerConfig::default()
    }
}

#[test]
fn oversized_signal_travels_through_an_upload_channel() {
    init_tracing();
    let broker = MemoryBroker::start();
    let (sink, received) = capture_sink();
    let server = start_server(&broker, sink, server_config());

    let client = RequestClient::start(
        vec![broker.connect("client") as Arc<dyn Connection>],
        Arc::new(TestCodec),
        ClientConfig {
            destination_name: DESTINATION.to_string(),
            max_message_size: 64,
            reaper_interval_millis: 100,
            ..ClientConfig::default()
        },
        wall_clock(),
    )
    .expect("client starts");

    let payload: Vec<u8> = (0..200u8).collect();
    let sent = TestMessage::new("big upload").with_data(payload);
    let handler = client.signal(sent.clone(), true, 5_000).expect("signal");

    let delivered = received
        .recv_timeout(Duration::from_secs(5))
        .expect("sink invoked after upload");
    assert_eq!(delivered, sent);
    // invoked exactly once
    assert!(received.try_recv().is_err());

    let response = handler
        .get_next_response(5_000)
        .expect("no error")
        .expect("ack response");
    assert_eq!(response.id, "ack");

    client.stop();
    server.shutdown();
    broker.shutdown();
}

/// Raw transport client, mirroring a foreign implementation driving the
/// channel handshake directly.
struct RawClient {
    sender: Arc<dyn Sender>,
    reply_to: Destination,
    replies: ChannelReceiver<TransportMessage>,
    server_destination: Destination,
}

impl RawClient {
    fn connect(broker: &MemoryBroker) -> Self {
        let conn = broker.connect("raw");
        let session = conn.create_session(false).expect("session");
        let server_destination = session.lookup_destination(DESTINATION).expect("lookup");
        let sender = session.create_sender(&server_destination).expect("sender");
        let reply_to = session.create_temporary_destination().expect("reply queue");
        let (tx, replies) = unbounded();
        session
            .create_receiver(&reply_to, Arc::new(move |msg| {
                let _ = tx.send(msg);
            }))
            .expect("reply receiver");
        Self {
            sender,
            reply_to,
            replies,
            server_destination,
        }
    }

    fn send(&self, to: &Destination, envelope: &Envelope) {
        self.sender
            .send(to, encode_envelope(envelope), SendOptions::default())
            .expect("send");
    }

    fn request_channel(&self, call_id: &str) -> Destination {
        let request = Envelope::new(ProtocolVersion::V2, MessageType::ChannelRequest, call_id)
            .with_text("channel request")
            .with_reply_to(self.reply_to.clone())
            .with_req_timeout(wall_clock().now_millis() + 2_000);
        self.send(&self.server_destination, &request);

        let setup = self
            .replies
            .recv_timeout(Duration::from_secs(2))
            .expect("channel setup");
        let envelope = decode_envelope(&setup).expect("setup decodes");
        assert_eq!(envelope.message_type, MessageType::ChannelSetup);
        assert_eq!(envelope.call_id, call_id);
        envelope.reply_to.expect("channel destination")
    }

    fn upload(&self, channel: &Destination, call_id: &str, data: &[u8], digest: &str) {
        let slices = split(&bytes::Bytes::copy_from_slice(data), 10);
        let total = slices.len();
        for (index, slice) in slices.into_iter().enumerate() {
            let mut fragment =
                Envelope::new(ProtocolVersion::V2, MessageType::SignalFragment, call_id)
                    .with_body(slice)
                    .with_req_timeout(wall_clock().now_millis() + 10_000);
            fragment.fragment_index = Some(index as i32);
            self.send(channel, &fragment);
        }
        let mut trailer = Envelope::new(ProtocolVersion::V2, MessageType::StreamClosed, call_id)
            .with_text("channel end");
        trailer.fragments_total = Some(total as i32);
        trailer.checksum_md5 = Some(digest.to_string());
        self.send(channel, &trailer);
    }
}

#[test]
fn raw_upload_with_matching_digest_invokes_the_sink_once() {
    init_tracing();
    let broker = MemoryBroker::start();
    let (sink, received) = capture_sink();
    let server = start_server(&broker, sink, server_config());

    let raw = RawClient::connect(&broker);
    let sent = TestMessage::new("fragmented").with_data((0..40u8).collect());
    let payload = TestCodec.encode(&sent).expect("encode");

    let channel = raw.request_channel(&sent.call_id);
    raw.upload(&channel, &sent.call_id, &payload, &md5_hex(&payload));

    let delivered = received
        .recv_timeout(Duration::from_secs(2))
        .expect("sink invoked");
    assert_eq!(delivered, sent);
    assert!(received.try_recv().is_err());

    server.shutdown();
    broker.shutdown();
}

#[test]
fn digest_mismatch_discards_the_upload() {
    init_tracing();
    let broker = MemoryBroker::start();
    let (sink, received) = capture_sink();
    let server = start_server(&broker, sink, server_config());

    let raw = RawClient::connect(&broker);
    let sent = TestMessage::new("corrupted").with_data((0..40u8).collect());
    let payload = TestCodec.encode(&sent).expect("encode");

    let channel = raw.request_channel(&sent.call_id);
    raw.upload(
        &channel,
        &sent.call_id,
        &payload,
        "00000000000000000000000000000000",
    );

    // the sink is never invoked and no response is emitted
    assert!(received.recv_timeout(Duration::from_millis(400)).is_err());
    assert!(raw.replies.try_recv().is_err());

    server.shutdown();
    broker.shutdown();
}

#[test]
fn inactive_uploads_are_discarded() {
    init_tracing();
    let broker = MemoryBroker::start();
    let (sink, received) = capture_sink();
    let server = start_server(
        &broker,
        sink,
        ServerConfig {
            channel_inactivity_timeout_millis: 100,
            keep_alive_interval_millis: 100,
            ..server_config()
        },
    );

    let raw = RawClient::connect(&broker);
    let sent = TestMessage::new("stalled").with_data((0..40u8).collect());
    let payload = TestCodec.encode(&sent).expect("encode");

    let channel = raw.request_channel(&sent.call_id);
    let slices = split(&bytes::Bytes::copy_from_slice(&payload), 10);
    let mut first = Envelope::new(
        ProtocolVersion::V2,
        MessageType::SignalFragment,
        &sent.call_id,
    )
    .with_body(slices[0].clone());
    first.fragment_index = Some(0);
    raw.send(&channel, &first);

    // stall past the inactivity timeout, then finish the upload
    std::thread::sleep(Duration::from_millis(500));
    raw.upload(&channel, &sent.call_id, &payload, &md5_hex(&payload));

    assert!(received.recv_timeout(Duration::from_millis(400)).is_err());

    server.shutdown();
    broker.shutdown();
}

#[test]
fn v1_clients_reject_oversized_signals() {
    init_tracing();
    let broker = MemoryBroker::start();
    let (sink, _received) = capture_sink();
    let server = start_server(&broker, sink, server_config());

    let client = RequestClient::start(
        vec![broker.connect("client") as Arc<dyn Connection>],
        Arc::new(TestCodec),
        ClientConfig {
            destination_name: DESTINATION.to_string(),
            protocol: ProtocolRevision::V1,
            max_message_size: 16,
            ..ClientConfig::default()
        },
        wall_clock(),
    )
    .expect("client starts");

    let err = client
        .signal(TestMessage::new("too big").with_data(vec![0u8; 256]), true, 1_000)
        .expect_err("oversized V1 signal fails");
    match err {
        signalbus::Error::Call(CallError::MessageTooLarge { .. }) => {}
        other => panic!("unexpected error: {other}"),
    }

    client.stop();
    server.shutdown();
    broker.shutdown();
}
