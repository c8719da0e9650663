//! Endpoint groups and the notifications that carry them.
//!
//! Endpoint groups follow the shape of a `discovery.k8s.io/v1` EndpointSlice,
//! reduced to the fields that decide where queries may be forwarded.

pub mod aggregator;
pub mod etcd;

use std::{collections::BTreeMap, fmt, str::FromStr};

use pingora_error::{Error, ErrorType::InternalError, OrErr, Result};
use serde::{Deserialize, Serialize};

pub use aggregator::EndpointAggregator;

/// Label binding an endpoint group to the service it belongs to.
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointPort {
    pub name: Option<String>,
    pub port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// One endpoint group: a set of addresses sharing a set of named ports.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSlice {
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_type: Option<String>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub ports: Vec<EndpointPort>,
}

impl EndpointSlice {
    pub fn from_json(value: &[u8]) -> Result<Self> {
        let slice: EndpointSlice =
            serde_json::from_slice(value).or_err(InternalError, "Invalid endpoint slice")?;
        if slice.metadata.name.is_empty() {
            return Error::e_explain(InternalError, "Endpoint slice without a name");
        }
        Ok(slice)
    }

    pub fn key(&self) -> SliceKey {
        SliceKey {
            namespace: self.metadata.namespace.clone(),
            name: self.metadata.name.clone(),
        }
    }

    pub fn service_name(&self) -> Option<&str> {
        self.metadata
            .labels
            .get(SERVICE_NAME_LABEL)
            .map(String::as_str)
    }
}

/// Namespace-scoped identity of an endpoint group, rendered as `namespace/name`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SliceKey {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for SliceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for SliceKey {
    type Err = Box<Error>;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
            }
            _ => Error::e_explain(InternalError, format!("Invalid endpoint slice key {s:?}")),
        }
    }
}

/// Payload of a watch notification.
#[derive(Clone, Debug, PartialEq)]
pub enum Object {
    Slice(EndpointSlice),
    /// A deletion observed without its final state; `key` is the store key
    /// (`namespace/name`) and `obj` whatever was last known about the group.
    Tombstone { key: String, obj: Box<Object> },
    /// A payload that could not be decoded into an endpoint group.
    Malformed(String),
}

impl Object {
    pub fn describe(&self) -> String {
        match self {
            Object::Slice(slice) => format!("slice {}", slice.key()),
            Object::Tombstone { key, .. } => format!("tombstone {key}"),
            Object::Malformed(reason) => format!("malformed payload ({reason})"),
        }
    }
}

/// A change notification delivered by the watch source.
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    Add(Object),
    Update(Object),
    Delete(Object),
}

/// Consumer of the watch source.
pub trait SliceEventHandler: Send + Sync {
    fn handle_notification(&self, notification: Notification);

    /// Replaces everything known with a fresh listing.
    fn handle_resync(&self, slices: Vec<EndpointSlice>);
}
