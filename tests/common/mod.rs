//! Shared fixtures for the integration tests: a CBOR-framed test message,
//! its codec, and a closure-backed request sink.
#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;
use minicbor::{Decoder, Encoder};
use signalbus::error::{CallError, CodecError};
use signalbus::{Message, MessageCodec, RequestContext, RequestSink};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestMessage {
    pub call_id: String,
    pub id: String,
    pub data: Vec<u8>,
}

impl TestMessage {
    pub fn new(id: &str) -> Self {
        Self {
            call_id: Uuid::new_v4().to_string(),
            id: id.to_string(),
            data: Vec::new(),
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    pub fn reply(call_id: &str, id: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            id: id.to_string(),
            data: Vec::new(),
        }
    }
}

impl Message for TestMessage {
    fn call_id(&self) -> &str {
        &self.call_id
    }

    fn message_timestamp(&self) -> u64 {
        0
    }
}

pub struct TestCodec;

impl MessageCodec<TestMessage> for TestCodec {
    fn encode(&self, msg: &TestMessage) -> Result<Bytes, CodecError> {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(3)
            .and_then(|e| e.str("call_id"))
            .and_then(|e| e.str(&msg.call_id))
            .and_then(|e| e.str("id"))
            .and_then(|e| e.str(&msg.id))
            .and_then(|e| e.str("data"))
            .and_then(|e| e.bytes(&msg.data))
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(buf.into())
    }

    fn decode(&self, bytes: &[u8]) -> Result<TestMessage, CodecError> {
        let mut dec = Decoder::new(bytes);
        let decode = |dec: &mut Decoder| -> Result<TestMessage, minicbor::decode::Error> {
            let len = dec
                .map()?
                .ok_or(minicbor::decode::Error::message("indefinite map"))?;
            let mut call_id = None;
            let mut id = None;
            let mut data = Vec::new();
            for _ in 0..len {
                match dec.str()? {
                    "call_id" => call_id = Some(dec.str()?.to_string()),
                    "id" => id = Some(dec.str()?.to_string()),
                    "data" => data = dec.bytes()?.to_vec(),
                    _ => dec.skip()?,
                }
            }
            Ok(TestMessage {
                call_id: call_id
                    .ok_or(minicbor::decode::Error::message("missing call_id"))?,
                id: id.ok_or(minicbor::decode::Error::message("missing id"))?,
                data,
            })
        };
        decode(&mut dec).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

type SinkFn = dyn Fn(TestMessage, Arc<dyn RequestContext<TestMessage>>, u64) -> Result<(), CallError>
    + Send
    + Sync;

/// Request sink driven by a closure.
pub struct TestSink {
    f: Box<SinkFn>,
}

impl TestSink {
    pub fn new(
        f: impl Fn(TestMessage, Arc<dyn RequestContext<TestMessage>>, u64) -> Result<(), CallError>
        + Send
        + Sync
        + 'static,
    ) -> Arc<Self> {
        Arc::new(Self { f: Box::new(f) })
    }
}

impl RequestSink<TestMessage> for TestSink {
    fn signal(
        &self,
        msg: TestMessage,
        ctx: Arc<dyn RequestContext<TestMessage>>,
        max_wait_millis: u64,
    ) -> Result<(), CallError> {
        (self.f)(msg, ctx, max_wait_millis)
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
