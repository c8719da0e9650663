use std::{sync::Arc, time::Instant};

use hickory_proto::op::ResponseCode;
use pingora_error::Result;

use super::{DnsRequest, Exchange, Forward, ForwarderRegistry};
use crate::metrics::{RequestObserver, RequestOutcome};

const UNKNOWN_UPSTREAM: &str = "unknown";

/// Per-query entry point: current forwarder, forward, observe.
pub struct Dispatcher<F> {
    registry: Arc<ForwarderRegistry<F>>,
    observer: RequestObserver,
}

impl<F: Forward> Dispatcher<F> {
    pub fn new(registry: Arc<ForwarderRegistry<F>>, observer: RequestObserver) -> Self {
        Self { registry, observer }
    }

    /// Forwards `request` through the current forwarder.
    ///
    /// Waits for the first target list to be installed. The outcome is
    /// observed with `default_rcode` when no answer was produced, and the
    /// forwarder's result is returned unchanged. No retries happen here.
    pub async fn handle(&self, request: &DnsRequest, default_rcode: ResponseCode) -> Result<Exchange> {
        let forwarder = self.registry.current().await;

        let start = Instant::now();
        let result = forwarder.forward(request).await;
        let elapsed = start.elapsed();

        let (rcode, upstream) = match &result {
            Ok(exchange) => (exchange.response.response_code(), exchange.upstream.as_str()),
            Err(_) => (default_rcode, UNKNOWN_UPSTREAM),
        };

        self.observer.observe(&RequestOutcome {
            request: &request.message,
            rcode,
            elapsed,
            upstream,
            client: request.client.ip(),
        });

        result
    }
}
