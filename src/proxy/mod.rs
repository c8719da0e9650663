pub mod dispatcher;
pub mod forwarder;
pub mod health_check;
pub mod registry;
pub mod upstream;

use std::{fmt, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use hickory_proto::op::Message;
use pingora_error::Result;

use crate::config;

pub use dispatcher::Dispatcher;
pub use forwarder::DnsForwarder;
pub use registry::ForwarderRegistry;

/// Transport a query arrived on, or is sent over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Udp => write!(f, "udp"),
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// An inbound query together with where it came from.
#[derive(Clone, Debug)]
pub struct DnsRequest {
    pub message: Message,
    pub client: SocketAddr,
    pub protocol: Protocol,
}

/// A completed upstream exchange.
#[derive(Clone, Debug)]
pub struct Exchange {
    pub response: Message,
    /// `address:port` of the upstream that answered.
    pub upstream: String,
}

/// Settings every forwarder is built with.
#[derive(Clone, Debug, PartialEq)]
pub struct ForwardOptions {
    /// Idle time after which a cached upstream connection is dropped.
    pub expire: Duration,
    /// Interval between upstream health checks.
    pub health_check: Duration,
    pub force_tcp: bool,
    pub prefer_udp: bool,
    pub health_check_domain: String,
    pub health_check_recursion: bool,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        (&config::Forward::default()).into()
    }
}

impl From<&config::Forward> for ForwardOptions {
    fn from(value: &config::Forward) -> Self {
        Self {
            expire: value.expire,
            health_check: value.health_check,
            force_tcp: value.force_tcp,
            prefer_udp: value.prefer_udp,
            health_check_domain: value.health_check_domain.clone(),
            health_check_recursion: value.health_check_recursion,
        }
    }
}

/// A forwarding target set: bound to one target list for its whole life.
///
/// Implementations own per-target resources. `stop` releases them and may be
/// called while other tasks still hold the instance; those keep forwarding on
/// a best-effort basis.
#[async_trait]
pub trait Forward: Send + Sync + 'static {
    fn build(targets: Vec<String>, options: &ForwardOptions) -> Result<Self>
    where
        Self: Sized;

    async fn forward(&self, request: &DnsRequest) -> Result<Exchange>;

    fn stop(&self);

    fn targets(&self) -> &[String];
}
