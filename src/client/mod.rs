//! Client side: per-call handlers, the reply dispatcher, and the
//! transport-backed request sink.

pub mod dispatcher;
pub mod handler;
pub mod request_client;

pub use dispatcher::{ClientDispatcher, DispatcherConfig, PendingUpload};
pub use handler::{KEEPALIVE_PERIOD_MILLIS, RequestHandler};
pub use request_client::RequestClient;
