use std::{future::Future, pin::pin, sync::Arc, time::Duration};

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, Event, EventType, GetOptions, KeyValue, WatchOptions};
use pingora_core::{server::ShutdownWatch, services::background::BackgroundService};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use tokio::{sync::Mutex, time::sleep};

use crate::config::Etcd;

use super::{EndpointSlice, Notification, Object, SliceEventHandler, SliceKey};

/// Watches endpoint groups of one service stored in etcd.
///
/// Groups live under `<prefix>/<namespace>/<name>` as JSON documents. The
/// watcher lists the namespace prefix, hands the listing to the handler as a
/// resync, then streams changes from the next revision on.
pub struct EndpointSliceWatcher {
    config: Etcd,
    namespace: String,
    service_name: String,
    client: Arc<Mutex<Option<Client>>>,
    revision: Arc<Mutex<i64>>,

    handler: Arc<dyn SliceEventHandler>,
}

enum WatchExit {
    Shutdown,
    Restart,
}

impl EndpointSliceWatcher {
    pub fn new(
        config: Etcd,
        namespace: impl Into<String>,
        service_name: impl Into<String>,
        handler: Arc<dyn SliceEventHandler>,
    ) -> Self {
        Self {
            config,
            namespace: namespace.into(),
            service_name: service_name.into(),
            client: Arc::new(Mutex::new(None)),
            revision: Arc::new(Mutex::new(0)),
            handler,
        }
    }

    fn prefix(&self) -> String {
        format!(
            "{}/{}/",
            self.config.prefix.trim_end_matches('/'),
            self.namespace
        )
    }

    async fn create_client(&self) -> Result<Client> {
        let mut options = ConnectOptions::default();
        if let Some(timeout) = self.config.timeout {
            options = options.with_timeout(Duration::from_secs(timeout as u64));
        };
        if let Some(connect_timeout) = self.config.connect_timeout {
            options = options.with_connect_timeout(Duration::from_secs(connect_timeout as u64));
        };
        if let (Some(user), Some(password)) = (&self.config.user, &self.config.password) {
            options = options.with_user(user.clone(), password.clone());
        };

        Client::connect(self.config.host.clone(), Some(options))
            .await
            .or_err(ConnectError, "Failed to connect etcd")
    }

    /// Lists every group under the namespace prefix and resyncs the handler.
    async fn list(&self) -> Result<()> {
        let options = GetOptions::new().with_prefix();

        let mut client_guard = self.client.lock().await;
        let client = client_guard
            .as_mut()
            .ok_or_else(|| Error::explain(InternalError, "Etcd client is not initialized"))?;

        let response = client
            .get(self.prefix(), Some(options))
            .await
            .or_err(ReadError, "Etcd list failed")?;
        let revision = response
            .header()
            .map(|header| header.revision())
            .ok_or_else(|| Error::explain(ReadError, "Etcd list response without header"))?;
        *self.revision.lock().await = revision;

        let slices: Vec<EndpointSlice> = response
            .kvs()
            .iter()
            .filter_map(|kv| match decode(kv.key(), kv.value()) {
                Object::Slice(slice) if self.is_watched(&slice) => Some(slice),
                Object::Slice(_) => None,
                other => {
                    log::warn!("Skipping listed {}", other.describe());
                    None
                }
            })
            .collect();

        log::info!(
            "Listed {} endpoint slices for service {} in namespace {} at revision {revision}",
            slices.len(),
            self.service_name,
            self.namespace
        );
        self.handler.handle_resync(slices);

        Ok(())
    }

    async fn watch(&self, shutdown: &mut ShutdownWatch) -> Result<WatchExit> {
        let start_revision = *self.revision.lock().await + 1;
        let options = WatchOptions::new()
            .with_start_revision(start_revision)
            .with_prefix()
            .with_prev_key();

        let mut client_guard = self.client.lock().await;
        let client = client_guard
            .as_mut()
            .ok_or_else(|| Error::explain(InternalError, "Etcd client is not initialized"))?;

        let (mut watcher, mut stream) = client
            .watch(self.prefix(), Some(options))
            .await
            .or_err(ReadError, "Etcd watch failed")?;

        log::info!(
            "Endpoint slice watcher for service {} in namespace {} is running",
            self.service_name,
            self.namespace
        );

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = watcher.cancel().await;
                        return Ok(WatchExit::Shutdown);
                    }
                }

                message = stream.message() => {
                    let Some(response) = message.or_err(ReadError, "Etcd watch stream failed")? else {
                        return Ok(WatchExit::Restart);
                    };

                    if response.compact_revision() > 0 {
                        log::warn!(
                            "Watch revision {start_revision} compacted at {}, relisting",
                            response.compact_revision()
                        );
                        return Ok(WatchExit::Restart);
                    }
                    if response.canceled() {
                        return Ok(WatchExit::Restart);
                    }

                    for event in response.events() {
                        if let Some(notification) = self.notification(event) {
                            self.handler.handle_notification(notification);
                        }
                    }
                }
            }
        }
    }

    /// Translates one etcd event, `None` when it does not concern the watched service.
    fn notification(&self, event: &Event) -> Option<Notification> {
        let Some(kv) = event.kv() else {
            log::warn!("Event does not contain a key-value pair");
            return None;
        };

        self.translate(
            event.event_type(),
            kv.key(),
            kv.value(),
            event.prev_kv().map(KeyValue::value),
        )
    }

    /// Decides the notification for a change of `key` from `prev` to `value`.
    fn translate(
        &self,
        event_type: EventType,
        key: &[u8],
        value: &[u8],
        prev: Option<&[u8]>,
    ) -> Option<Notification> {
        match event_type {
            EventType::Put => match decode(key, value) {
                Object::Slice(slice) if self.is_watched(&slice) => {
                    if prev.is_some() {
                        Some(Notification::Update(Object::Slice(slice)))
                    } else {
                        Some(Notification::Add(Object::Slice(slice)))
                    }
                }
                // relabelled away from the watched service
                Object::Slice(slice) => match prev.map(|prev| decode(key, prev)) {
                    Some(Object::Slice(prev)) if self.is_watched(&prev) => {
                        Some(Notification::Delete(Object::Slice(slice)))
                    }
                    _ => None,
                },
                other if prev.is_some() => Some(Notification::Update(other)),
                other => Some(Notification::Add(other)),
            },
            EventType::Delete => match prev.map(|prev| decode(key, prev)) {
                Some(Object::Slice(slice)) if self.is_watched(&slice) => {
                    Some(Notification::Delete(Object::Slice(slice)))
                }
                Some(Object::Slice(_)) => None,
                Some(other) => Some(Notification::Delete(Object::Tombstone {
                    key: self.store_key(key),
                    obj: Box::new(other),
                })),
                None => Some(Notification::Delete(Object::Tombstone {
                    key: self.store_key(key),
                    obj: Box::new(Object::Malformed("final state unknown".to_string())),
                })),
            },
        }
    }

    fn is_watched(&self, slice: &EndpointSlice) -> bool {
        slice.metadata.namespace == self.namespace
            && slice.service_name() == Some(self.service_name.as_str())
    }

    /// Maps an etcd key back to `namespace/name`, or the raw key when it does not fit.
    fn store_key(&self, key: &[u8]) -> String {
        let key = String::from_utf8_lossy(key);
        match key.strip_prefix(&self.prefix()) {
            Some(name) => format!("{}/{name}", self.namespace),
            None => key.into_owned(),
        }
    }

    /// Creates the etcd client if the previous one was dropped.
    async fn ensure_client(&self) -> Result<()> {
        let mut client_guard = self.client.lock().await;

        if client_guard.is_none() {
            log::info!("Creating new etcd client...");
            *client_guard = Some(self.create_client().await?);
        }
        Ok(())
    }

    async fn reset_client(&self) {
        *self.client.lock().await = None;
    }
}

/// Decodes a stored group, falling back to its key for the namespace.
fn decode(key: &[u8], value: &[u8]) -> Object {
    match EndpointSlice::from_json(value) {
        Ok(mut slice) => {
            if slice.metadata.namespace.is_empty() {
                if let Some(namespace) = namespace_from_key(key) {
                    slice.metadata.namespace = namespace;
                }
            }
            Object::Slice(slice)
        }
        Err(e) => Object::Malformed(format!("{}: {}", String::from_utf8_lossy(key), e)),
    }
}

fn namespace_from_key(key: &[u8]) -> Option<String> {
    let key = std::str::from_utf8(key).ok()?;
    let mut parts = key.rsplit('/');
    let name = parts.next()?;
    let namespace = parts.next()?;
    format!("{namespace}/{name}")
        .parse::<SliceKey>()
        .ok()
        .map(|key| key.namespace)
}

/// Runs `step` unless shutdown is signalled first, `None` on shutdown.
async fn until_shutdown<T>(
    shutdown: &mut ShutdownWatch,
    step: impl Future<Output = T>,
) -> Option<T> {
    if *shutdown.borrow() {
        return None;
    }

    let mut step = pin!(step);
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return None;
                }
            }
            output = &mut step => return Some(output),
        }
    }
}

#[async_trait]
impl BackgroundService for EndpointSliceWatcher {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        loop {
            log::info!("Ensuring etcd client...");
            let Some(ensured) = until_shutdown(&mut shutdown, self.ensure_client()).await else {
                break;
            };
            if let Err(err) = ensured {
                log::error!("Failed to create etcd client: {err}");
                if until_shutdown(&mut shutdown, sleep(Duration::from_secs(3)))
                    .await
                    .is_none()
                {
                    break;
                }
                continue;
            }

            log::info!("Executing etcd list operation...");
            let Some(listed) = until_shutdown(&mut shutdown, self.list()).await else {
                break;
            };
            if let Err(err) = listed {
                log::error!("List operation failed: {err}");
                self.reset_client().await;
                if until_shutdown(&mut shutdown, sleep(Duration::from_secs(3)))
                    .await
                    .is_none()
                {
                    break;
                }
                continue;
            }

            log::info!("Executing etcd watch operation...");
            match self.watch(&mut shutdown).await {
                Ok(WatchExit::Shutdown) => break,
                Ok(WatchExit::Restart) => {
                    log::info!("Endpoint slice watch ended, relisting");
                }
                Err(err) => {
                    log::error!("Watch operation failed: {err}");
                    self.reset_client().await;
                    if until_shutdown(&mut shutdown, sleep(Duration::from_secs(1)))
                        .await
                        .is_none()
                    {
                        break;
                    }
                }
            }
        }

        log::info!("Shutdown signal received, stopping endpoint slice watch");
        self.reset_client().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        notifications: StdMutex<Vec<Notification>>,
    }

    impl SliceEventHandler for Recorder {
        fn handle_notification(&self, notification: Notification) {
            self.notifications.lock().unwrap().push(notification);
        }

        fn handle_resync(&self, _slices: Vec<EndpointSlice>) {}
    }

    fn watcher() -> EndpointSliceWatcher {
        EndpointSliceWatcher::new(
            Etcd::default(),
            "kube-system",
            "d8-kube-dns",
            Arc::new(Recorder::default()),
        )
    }

    #[test]
    fn test_prefix_and_store_key() {
        let watcher = watcher();
        assert_eq!(watcher.prefix(), "/registry/endpointslices/kube-system/");
        assert_eq!(
            watcher.store_key(b"/registry/endpointslices/kube-system/dns-abc"),
            "kube-system/dns-abc"
        );
        assert_eq!(watcher.store_key(b"/elsewhere/dns-abc"), "/elsewhere/dns-abc");
    }

    #[test]
    fn test_namespace_from_key() {
        assert_eq!(
            namespace_from_key(b"/registry/endpointslices/kube-system/dns-abc"),
            Some("kube-system".to_string())
        );
        assert_eq!(namespace_from_key(b"dns-abc"), None);
    }

    #[test]
    fn test_is_watched() {
        let watcher = watcher();
        let mut slice = EndpointSlice::default();
        slice.metadata.name = "dns-abc".to_string();
        slice.metadata.namespace = "kube-system".to_string();
        assert!(!watcher.is_watched(&slice));

        slice.metadata.labels.insert(
            crate::discovery::SERVICE_NAME_LABEL.to_string(),
            "d8-kube-dns".to_string(),
        );
        assert!(watcher.is_watched(&slice));

        slice.metadata.namespace = "default".to_string();
        assert!(!watcher.is_watched(&slice));
    }

    const KEY: &[u8] = b"/registry/endpointslices/kube-system/dns-abc";

    fn slice_json(service: &str) -> Vec<u8> {
        format!(
            r#"{{"metadata":{{"name":"dns-abc","labels":{{"kubernetes.io/service-name":"{service}"}}}},"endpoints":[{{"addresses":["10.0.0.1"]}}],"ports":[{{"name":"dns","port":53}}]}}"#
        )
        .into_bytes()
    }

    fn summary(notification: Option<Notification>) -> Option<String> {
        fn object(obj: &Object) -> String {
            match obj {
                Object::Slice(slice) => format!("slice {}", slice.key()),
                Object::Tombstone { key, obj } => format!("tombstone {key} ({})", object(obj)),
                Object::Malformed(_) => "malformed".to_string(),
            }
        }

        notification.map(|notification| match notification {
            Notification::Add(obj) => format!("add {}", object(&obj)),
            Notification::Update(obj) => format!("update {}", object(&obj)),
            Notification::Delete(obj) => format!("delete {}", object(&obj)),
        })
    }

    #[test]
    fn test_translate_events() {
        let watcher = watcher();
        let watched: &[u8] = &slice_json("d8-kube-dns");
        let other: &[u8] = &slice_json("kube-dns");
        let garbage: &[u8] = b"{not json";
        let empty: &[u8] = b"";

        let cases: Vec<(&str, EventType, &[u8], Option<&[u8]>, Option<&str>)> = vec![
            (
                "put new",
                EventType::Put,
                watched,
                None,
                Some("add slice kube-system/dns-abc"),
            ),
            (
                "put over previous",
                EventType::Put,
                watched,
                Some(watched),
                Some("update slice kube-system/dns-abc"),
            ),
            (
                "put relabelled away",
                EventType::Put,
                other,
                Some(watched),
                Some("delete slice kube-system/dns-abc"),
            ),
            ("put other service", EventType::Put, other, Some(other), None),
            ("put other service new", EventType::Put, other, None, None),
            (
                "put malformed new",
                EventType::Put,
                garbage,
                None,
                Some("add malformed"),
            ),
            (
                "put malformed over previous",
                EventType::Put,
                garbage,
                Some(watched),
                Some("update malformed"),
            ),
            (
                "delete watched",
                EventType::Delete,
                empty,
                Some(watched),
                Some("delete slice kube-system/dns-abc"),
            ),
            ("delete other service", EventType::Delete, empty, Some(other), None),
            (
                "delete malformed previous",
                EventType::Delete,
                empty,
                Some(garbage),
                Some("delete tombstone kube-system/dns-abc (malformed)"),
            ),
            (
                "delete without previous",
                EventType::Delete,
                empty,
                None,
                Some("delete tombstone kube-system/dns-abc (malformed)"),
            ),
        ];

        for (name, event_type, value, prev, expected) in cases {
            let got = summary(watcher.translate(event_type, KEY, value, prev));
            assert_eq!(got.as_deref(), expected, "case: {name}");
        }
    }

    #[test]
    fn test_translate_fills_namespace_from_key() {
        let watcher = watcher();
        let Some(Notification::Add(Object::Slice(slice))) =
            watcher.translate(EventType::Put, KEY, &slice_json("d8-kube-dns"), None)
        else {
            panic!("expected an added slice");
        };
        assert_eq!(slice.metadata.namespace, "kube-system");
        assert_eq!(slice.metadata.name, "dns-abc");
    }

    #[tokio::test]
    async fn test_start_stops_on_shutdown_while_unreachable() {
        let watcher = Arc::new(EndpointSliceWatcher::new(
            Etcd {
                host: vec!["http://127.0.0.1:1".to_string()],
                connect_timeout: Some(30),
                ..Default::default()
            },
            "kube-system",
            "d8-kube-dns",
            Arc::new(Recorder::default()),
        ));
        let (tx, rx) = tokio::sync::watch::channel(false);

        let task = tokio::spawn({
            let watcher = watcher.clone();
            async move { watcher.start(rx).await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!task.is_finished());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("watcher did not stop after shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_returns_when_already_shut_down() {
        let watcher = watcher();
        let (_tx, rx) = tokio::sync::watch::channel(true);
        tokio::time::timeout(Duration::from_secs(1), watcher.start(rx))
            .await
            .unwrap();
    }
}
