pub mod domain;

use std::{net::IpAddr, time::Duration};

use hickory_proto::op::{Message, ResponseCode};
use once_cell::sync::Lazy;
use prometheus::{
    exponential_buckets, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
};

use crate::config;

pub use domain::registrable_domain;

// Request latency in seconds
pub static REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "sliceforward_request_duration_seconds",
        "Histogram of forwarded DNS request duration, in seconds",
    )
    .buckets(exponential_buckets(0.01, 2.0, 10).unwrap());
    register_histogram_vec!(opts, &["qtype", "rcode"]).unwrap()
});

// Requests slower than the configured threshold
pub static SLOW_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sliceforward_slow_requests_total",
        "DNS requests slower than the configured threshold",
        &["qtype", "rcode", "upstream"]
    )
    .unwrap()
});

pub static NXDOMAIN_BY_IP_DOMAIN: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sliceforward_nxdomain_by_ip_domain_total",
        "NXDOMAIN responses grouped by client IP and registrable domain",
        &["src_ip", "qname"]
    )
    .unwrap()
});

pub static TARGETS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "sliceforward_targets",
        "Number of forward targets currently installed"
    )
    .unwrap()
});

pub static TARGET_UPDATES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "sliceforward_target_updates_total",
        "Number of forward target lists installed"
    )
    .unwrap()
});

/// Records an installed target list.
pub fn record_targets(count: usize) {
    TARGETS.set(count as i64);
    TARGET_UPDATES.inc();
}

/// What the observer needs to know about one handled query.
pub struct RequestOutcome<'a> {
    pub request: &'a Message,
    pub rcode: ResponseCode,
    pub elapsed: Duration,
    /// Upstream that answered, `unknown` when none did.
    pub upstream: &'a str,
    pub client: IpAddr,
}

/// Turns request outcomes into metric observations.
#[derive(Clone, Debug, Default)]
pub struct RequestObserver {
    slow_threshold: Option<Duration>,
    slow_log: bool,
    nxdomain_tracking: bool,
}

impl RequestObserver {
    pub fn new(config: &config::Forward) -> Self {
        Self {
            slow_threshold: config.slow_threshold(),
            slow_log: config.slow_log,
            nxdomain_tracking: config.nxdomain_tracking,
        }
    }

    pub fn observe(&self, outcome: &RequestOutcome) {
        let Some(query) = outcome.request.queries().first() else {
            return;
        };

        let qtype = query.query_type().to_string();
        let rcode = rcode_label(outcome.rcode);

        REQUEST_DURATION
            .with_label_values(&[qtype.as_str(), rcode.as_str()])
            .observe(outcome.elapsed.as_secs_f64());

        if let Some(threshold) = self.slow_threshold {
            if outcome.elapsed > threshold {
                SLOW_REQUESTS
                    .with_label_values(&[qtype.as_str(), rcode.as_str(), outcome.upstream])
                    .inc();
                if self.slow_log {
                    log::warn!(
                        "slow query {qtype} {} took {:?} (rcode={rcode}, upstream={})",
                        query.name(),
                        outcome.elapsed,
                        outcome.upstream
                    );
                }
            }
        }

        if self.nxdomain_tracking && outcome.rcode == ResponseCode::NXDomain {
            let qname = registrable_domain(&query.name().to_ascii());
            NXDOMAIN_BY_IP_DOMAIN
                .with_label_values(&[outcome.client.to_string().as_str(), qname.as_str()])
                .inc();
        }
    }
}

/// Mnemonic of a response code as it appears in zone files and dig output.
pub fn rcode_label(rcode: ResponseCode) -> String {
    let label = match u16::from(rcode) {
        0 => "NOERROR",
        1 => "FORMERR",
        2 => "SERVFAIL",
        3 => "NXDOMAIN",
        4 => "NOTIMP",
        5 => "REFUSED",
        6 => "YXDOMAIN",
        7 => "YXRRSET",
        8 => "NXRRSET",
        9 => "NOTAUTH",
        10 => "NOTZONE",
        16 => "BADSIG",
        17 => "BADKEY",
        18 => "BADTIME",
        19 => "BADMODE",
        20 => "BADNAME",
        21 => "BADALG",
        22 => "BADTRUNC",
        23 => "BADCOOKIE",
        other => return other.to_string(),
    };
    label.to_string()
}
