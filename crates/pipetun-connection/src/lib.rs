//! Dialing primitives
//!
//! Every relay variant opens its sockets through this crate: either straight
//! to the target or through an HTTP CONNECT tunnel on the edge proxy, always
//! under a bounded retry policy.

pub mod dialer;
pub mod retry;

pub use dialer::{direct_connect, proxy_connect, ConnectError, Dialer, ProxyCredentials, Route};
pub use retry::{with_retry, RetryPolicy};
