use std::{
    collections::{BTreeSet, HashMap},
    net::IpAddr,
    sync::{Mutex, PoisonError},
};

use super::{EndpointSlice, Notification, Object, SliceEventHandler, SliceKey};

type TargetCallback = Box<dyn Fn(Vec<String>) + Send + Sync>;

/// Reconciles endpoint-group notifications into one deduplicated target list.
///
/// Every accepted notification mutates the store, recomputes the full
/// `address:port` list and hands it to the callback. All of this happens
/// under one lock, so callbacks observe updates in the order they were applied.
pub struct EndpointAggregator {
    port_name: String,
    store: Mutex<HashMap<SliceKey, EndpointSlice>>,
    on_update: TargetCallback,
}

impl EndpointAggregator {
    pub fn new<F>(port_name: impl Into<String>, on_update: F) -> Self
    where
        F: Fn(Vec<String>) + Send + Sync + 'static,
    {
        Self {
            port_name: port_name.into(),
            store: Mutex::new(HashMap::new()),
            on_update: Box::new(on_update),
        }
    }

    pub fn on_add(&self, obj: Object) {
        let slice = match obj {
            Object::Slice(slice) => slice,
            other => {
                log::error!("Error handling endpoint slice add: unexpected {}", other.describe());
                return;
            }
        };

        let key = slice.key();
        self.apply(|store| {
            store.insert(key.clone(), slice);
        });
        log::info!("Added endpoint slice {key}");
    }

    pub fn on_update(&self, obj: Object) {
        let slice = match obj {
            Object::Slice(slice) => slice,
            other => {
                log::error!("Error handling endpoint slice update: unexpected {}", other.describe());
                return;
            }
        };

        let key = slice.key();
        self.apply(|store| {
            store.insert(key.clone(), slice);
        });
        log::info!("Updated endpoint slice {key}");
    }

    pub fn on_delete(&self, obj: Object) {
        let key = match obj {
            Object::Slice(slice) => slice.key(),
            Object::Tombstone { key, obj } => match *obj {
                Object::Slice(slice) => slice.key(),
                other => match key.parse::<SliceKey>() {
                    Ok(key) => {
                        log::warn!(
                            "Tombstone {key} carried {}, deleting by key",
                            other.describe()
                        );
                        key
                    }
                    Err(e) => {
                        log::error!(
                            "Error handling endpoint slice delete: tombstone carried {}: {e}",
                            other.describe()
                        );
                        return;
                    }
                },
            },
            Object::Malformed(reason) => {
                log::error!("Error handling endpoint slice delete: malformed payload ({reason})");
                return;
            }
        };

        self.apply(|store| {
            store.remove(&key);
        });
        log::info!("Deleted endpoint slice {key}");
    }

    fn apply<F>(&self, mutate: F)
    where
        F: FnOnce(&mut HashMap<SliceKey, EndpointSlice>),
    {
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        mutate(&mut store);

        let targets = compute_targets(store.values(), &self.port_name);
        log::debug!(
            "{} endpoint slices in store, {} targets",
            store.len(),
            targets.len()
        );
        (self.on_update)(targets);
    }
}

impl SliceEventHandler for EndpointAggregator {
    fn handle_notification(&self, notification: Notification) {
        match notification {
            Notification::Add(obj) => self.on_add(obj),
            Notification::Update(obj) => self.on_update(obj),
            Notification::Delete(obj) => self.on_delete(obj),
        }
    }

    fn handle_resync(&self, slices: Vec<EndpointSlice>) {
        let count = slices.len();
        self.apply(|store| {
            store.clear();
            store.extend(slices.into_iter().map(|slice| (slice.key(), slice)));
        });
        log::info!("Resynced {count} endpoint slices");
    }
}

/// Builds the sorted, deduplicated `address:port` list for `port_name`.
pub fn compute_targets<'a, I>(slices: I, port_name: &str) -> Vec<String>
where
    I: IntoIterator<Item = &'a EndpointSlice>,
{
    let mut targets = BTreeSet::new();

    for slice in slices {
        let ports: Vec<u16> = slice
            .ports
            .iter()
            .filter(|port| port.name.as_deref() == Some(port_name))
            .filter_map(|port| port.port.and_then(|p| u16::try_from(p).ok()))
            .filter(|port| *port != 0)
            .collect();

        for endpoint in slice.endpoints.iter() {
            for address in endpoint.addresses.iter() {
                for port in ports.iter() {
                    targets.insert(join_host_port(address, *port));
                }
            }
        }
    }

    targets.into_iter().collect()
}

fn join_host_port(address: &str, port: u16) -> String {
    match address.parse::<IpAddr>() {
        Ok(IpAddr::V6(ip)) => format!("[{ip}]:{port}"),
        Ok(IpAddr::V4(ip)) => format!("{ip}:{port}"),
        Err(_) => format!("{address}:{port}"),
    }
}
