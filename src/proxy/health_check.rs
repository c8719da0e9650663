use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::{
    op::{Message, MessageType, OpCode, Query},
    rr::{Name, RecordType},
};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use pingora_load_balancing::{health_check::HealthCheck, Backend};

use super::{upstream::UpstreamProxy, ForwardOptions, Protocol};

/// Probes a DNS upstream with `<domain> IN NS`.
///
/// Any well-formed answer counts as healthy, whatever its response code;
/// only transport failures and timeouts count against the target.
pub struct DnsHealthCheck {
    domain: Name,
    recursion_desired: bool,
    protocol: Protocol,

    /// Consecutive successes to flip a target back to healthy.
    pub consecutive_success: usize,
    /// Consecutive failures to mark a target unhealthy.
    pub consecutive_failure: usize,
}

impl DnsHealthCheck {
    pub fn new(options: &ForwardOptions) -> Result<Self> {
        let domain = Name::from_ascii(&options.health_check_domain).or_err_with(InternalError, || {
            format!("Invalid health check domain {}", options.health_check_domain)
        })?;

        Ok(Self {
            domain,
            recursion_desired: options.health_check_recursion,
            protocol: if options.force_tcp {
                Protocol::Tcp
            } else {
                Protocol::Udp
            },
            consecutive_success: 1,
            consecutive_failure: 2,
        })
    }

    pub fn probe(&self) -> Message {
        let mut message = Message::new();
        message
            .set_id(rand::random())
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(self.recursion_desired)
            .add_query(Query::query(self.domain.clone(), RecordType::NS));
        message
    }
}

#[async_trait]
impl HealthCheck for DnsHealthCheck {
    async fn check(&self, target: &Backend) -> Result<()> {
        let addr = target
            .addr
            .as_inet()
            .copied()
            .ok_or_else(|| Error::explain(InternalError, "Health check target is not inet"))?;

        // a throwaway proxy: health probes never share cached connections
        let proxy = UpstreamProxy::new(addr, Duration::ZERO);
        let response = proxy.exchange(&self.probe(), self.protocol).await?;
        log::trace!(
            "Health check of {addr} answered {}",
            response.response_code()
        );
        Ok(())
    }

    fn health_threshold(&self, success: bool) -> usize {
        if success {
            self.consecutive_success
        } else {
            self.consecutive_failure
        }
    }
}
