use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use pingora_core::services::background::BackgroundService;
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use pingora_load_balancing::{selection::RoundRobin, Backend, LoadBalancer};
use tokio::sync::watch;

use super::{
    health_check::DnsHealthCheck, upstream::UpstreamProxy, DnsRequest, Exchange, Forward,
    ForwardOptions, Protocol,
};

const MAX_ITERATIONS: usize = 256;

/// Forwards queries to a fixed set of DNS upstreams.
pub struct DnsForwarder {
    targets: Vec<String>,
    options: ForwardOptions,
    lb: Arc<LoadBalancer<RoundRobin>>,
    proxies: HashMap<SocketAddr, Arc<UpstreamProxy>>,
    health_shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl DnsForwarder {
    fn spawn_health_check(lb: &Arc<LoadBalancer<RoundRobin>>) -> Option<watch::Sender<bool>> {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log::warn!("No runtime available, upstream health checks disabled");
            return None;
        };

        let (tx, rx) = watch::channel(false);
        let lb = lb.clone();
        handle.spawn(async move { lb.start(rx).await });
        Some(tx)
    }

    /// Picks the next untried upstream, healthy ones first.
    ///
    /// When nothing healthy is left on the first attempt every target is
    /// considered, so a query is never refused only because all checks fail.
    fn next_upstream(&self, tried: &[SocketAddr]) -> Option<SocketAddr> {
        let untried = |backend: &Backend| {
            backend
                .addr
                .as_inet()
                .is_some_and(|addr| !tried.contains(addr))
        };

        let backend = self
            .lb
            .select_with(b"", MAX_ITERATIONS, |backend, healthy| {
                healthy && untried(backend)
            })
            .or_else(|| {
                if !tried.is_empty() {
                    return None;
                }
                log::warn!("All upstreams unhealthy, trying {:?} anyway", self.targets);
                self.lb
                    .select_with(b"", MAX_ITERATIONS, |backend, _| untried(backend))
            })?;

        backend.addr.as_inet().copied()
    }

    fn protocol(&self, request: &DnsRequest) -> Protocol {
        if self.options.force_tcp {
            return Protocol::Tcp;
        }
        if request.protocol == Protocol::Tcp && !self.options.prefer_udp {
            return Protocol::Tcp;
        }
        Protocol::Udp
    }

    async fn exchange(&self, proxy: &UpstreamProxy, request: &DnsRequest) -> Result<Exchange> {
        let protocol = self.protocol(request);
        let mut response = proxy.exchange(&request.message, protocol).await?;

        if protocol == Protocol::Udp && response.truncated() && !self.options.prefer_udp {
            log::debug!("Truncated answer from {}, retrying over tcp", proxy.addr());
            response = proxy.exchange(&request.message, Protocol::Tcp).await?;
        }

        Ok(Exchange {
            response,
            upstream: proxy.addr().to_string(),
        })
    }
}

#[async_trait]
impl Forward for DnsForwarder {
    fn build(targets: Vec<String>, options: &ForwardOptions) -> Result<Self> {
        let addrs = targets
            .iter()
            .map(|target| {
                target
                    .parse::<SocketAddr>()
                    .or_err_with(InternalError, || format!("Invalid forward target {target}"))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut lb = LoadBalancer::<RoundRobin>::try_from_iter(addrs.iter().copied())
            .or_err(InternalError, "Unable to build upstream set")?;

        let health_check = !options.health_check.is_zero() && !addrs.is_empty();
        if health_check {
            lb.set_health_check(Box::new(DnsHealthCheck::new(options)?));
            lb.health_check_frequency = Some(options.health_check);
        }
        let lb = Arc::new(lb);

        let health_shutdown = if health_check {
            Self::spawn_health_check(&lb)
        } else {
            None
        };

        let proxies = addrs
            .iter()
            .map(|addr| (*addr, Arc::new(UpstreamProxy::new(*addr, options.expire))))
            .collect();

        Ok(Self {
            targets,
            options: options.clone(),
            lb,
            proxies,
            health_shutdown: Mutex::new(health_shutdown),
        })
    }

    async fn forward(&self, request: &DnsRequest) -> Result<Exchange> {
        let mut tried = Vec::with_capacity(self.proxies.len());
        let mut last_error = None;

        while let Some(addr) = self.next_upstream(&tried) {
            tried.push(addr);
            let Some(proxy) = self.proxies.get(&addr) else {
                continue;
            };

            match self.exchange(proxy, request).await {
                Ok(exchange) => return Ok(exchange),
                Err(e) => {
                    log::debug!("Forwarding to {addr} failed: {e}");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Error::e_explain(ConnectNoRoute, "No upstream to forward to"),
        }
    }

    fn stop(&self) {
        let sender = self
            .health_shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(true);
        }

        for proxy in self.proxies.values() {
            proxy.stop();
        }
    }

    fn targets(&self) -> &[String] {
        &self.targets
    }
}
