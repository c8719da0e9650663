use std::sync::Arc;

use pingora::services::{background::background_service, listening::Service};
use pingora_core::server::{configuration::Opt, Server};
use sentry::IntoDsn;

use sliceforward::{
    config::Config,
    core::status,
    discovery::{etcd::EndpointSliceWatcher, EndpointAggregator},
    metrics::{self, RequestObserver},
    proxy::{Dispatcher, DnsForwarder, ForwardOptions, ForwarderRegistry},
    service::{dns::DnsListener, status::ReadinessApp},
};

fn main() {
    // Initialize logging
    env_logger::init();

    // Read command-line arguments
    let opt = Opt::parse_args();

    // Load configuration with optional override
    let mut config = Config::load_yaml_with_opt_override(&opt).expect("Failed to load configuration");

    let registry = Arc::new(ForwarderRegistry::<DnsForwarder>::new());
    let options = ForwardOptions::from(&config.forward);

    // Every recomputed target list replaces the current forwarder
    let aggregator = EndpointAggregator::new(config.forward.port_name.clone(), {
        let registry = registry.clone();
        move |targets: Vec<String>| {
            let count = targets.len();
            match registry.replace(targets, &options) {
                Ok(()) => {
                    metrics::record_targets(count);
                    status::mark_ready(count);
                }
                Err(e) => log::error!("Failed to install forward targets: {e}"),
            }
        }
    });

    log::info!(
        "Watching endpoint slices of {}/{}...",
        config.forward.namespace,
        config.forward.service_name
    );
    let watcher = EndpointSliceWatcher::new(
        config.etcd.clone(),
        config.forward.namespace.clone(),
        config.forward.service_name.clone(),
        Arc::new(aggregator),
    );

    let dispatcher = Arc::new(Dispatcher::new(
        registry,
        RequestObserver::new(&config.forward),
    ));

    // Create Pingora server with optional configuration
    let mut server = Server::new_with_opt_and_conf(Some(opt), std::mem::take(&mut config.pingora));

    add_optional_services(&mut server, &config);

    log::info!("Bootstrapping...");
    server.bootstrap();

    log::info!("Bootstrapped. Adding Services...");
    server.add_service(background_service("endpoint slice watcher", watcher));

    log::info!("Adding listeners...");
    for listener in &config.listeners {
        let dns = DnsListener::new(listener.address, dispatcher.clone());
        server.add_service(background_service(
            &format!("dns listener {}", listener.address),
            dns,
        ));
    }

    log::info!("Starting Server...");
    server.run_forever();
}

/// Add optional services (Sentry, Prometheus, readiness)
fn add_optional_services(server: &mut Server, cfg: &Config) {
    if let Some(sentry_cfg) = &cfg.sentry {
        log::info!("Adding Sentry config...");
        match sentry_cfg.dsn.clone().into_dsn() {
            Ok(Some(dsn)) => {
                server.sentry = Some(sentry::ClientOptions {
                    dsn: Some(dsn),
                    ..Default::default()
                });
            }
            Ok(None) => log::warn!("Sentry DSN is empty or invalid, Sentry disabled."),
            Err(e) => log::error!("Error parsing Sentry DSN: {e}"),
        }
    }

    if let Some(prometheus_cfg) = &cfg.prometheus {
        log::info!("Adding Prometheus HTTP...");
        let mut prometheus_service_http = Service::prometheus_http_service();
        prometheus_service_http.add_tcp(&prometheus_cfg.address.to_string());
        server.add_service(prometheus_service_http);
    }

    if let Some(status_cfg) = &cfg.status {
        log::info!("Adding readiness HTTP...");
        server.add_service(ReadinessApp::readiness_service(status_cfg));
    }
}
