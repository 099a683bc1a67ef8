//! Server side: the request proxy and the per-call response context.

pub mod context;
pub mod proxy;

pub use context::ServerResponseContext;
pub use proxy::{ServerProxy, ServerProxyHandle};
