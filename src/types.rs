//! Data structures used throughout the envoy daemon.
//!
//! Container-side types ([`ContainerDescriptor`], [`NpmConfig`],
//! [`ContainerEvent`]) are derived from Docker inspection data and never
//! mutated.  Proxy-side types ([`ProxyHost`], [`ProxyHostPayload`],
//! [`HostUpdate`]) mirror the JSON bodies exchanged with Nginx Proxy
//! Manager.  Ownership metadata is kept typed internally and only turned
//! into JSON at the API boundary.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Value of `meta.managed_by` on every host this service creates.
pub const MANAGED_BY_TAG: &str = "EnvoyNPM";

/// Container lifecycle events the service reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Start,
    Stop,
    Die,
}

impl EventKind {
    /// Map a Docker event action onto a kind we care about.
    pub fn from_action(action: &str) -> Option<Self> {
        match action {
            "start" => Some(EventKind::Start),
            "stop" => Some(EventKind::Stop),
            "die" => Some(EventKind::Die),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self {
            EventKind::Start => "start",
            EventKind::Stop => "stop",
            EventKind::Die => "die",
        };
        f.write_str(action)
    }
}

/// A single container lifecycle event as delivered by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    pub kind: EventKind,
    pub container_id: String,
}

/// Address information for one network a container is attached to.
/// An empty `ip_address` means the network has no usable address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkEndpoint {
    pub ip_address: String,
    pub gateway: String,
    pub network_id: String,
}

/// Snapshot of an inspected container.
///
/// Networks are keyed by name in ascending order, which is also the order
/// Docker reports them in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerDescriptor {
    pub id: String,
    pub name: String,
    pub status: String,
    pub image: String,
    pub env: HashMap<String, String>,
    pub networks: BTreeMap<String, NetworkEndpoint>,
}

impl ContainerDescriptor {
    /// Proxy settings declared by the container, if it opted in.
    pub fn npm_config(&self) -> Option<NpmConfig> {
        crate::extract::npm_config(&self.env)
    }
}

/// Certificate selection for a proxy host: an existing certificate id
/// (0 = none) or `"new"` to request one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateId {
    New,
    Id(u64),
}

impl Default for CertificateId {
    fn default() -> Self {
        CertificateId::Id(0)
    }
}

impl CertificateId {
    /// Parse `"new"` (any case) or a non-negative integer.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("new") {
            return Some(CertificateId::New);
        }
        raw.parse().ok().map(CertificateId::Id)
    }
}

impl Serialize for CertificateId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CertificateId::New => serializer.serialize_str("new"),
            CertificateId::Id(id) => serializer.serialize_u64(*id),
        }
    }
}

impl<'de> Deserialize<'de> for CertificateId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Id(u64),
            Text(String),
            Other(Value),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Id(id) => CertificateId::Id(id),
            Raw::Text(text) => CertificateId::parse(&text).unwrap_or_default(),
            Raw::Other(_) => CertificateId::default(),
        })
    }
}

/// Desired proxy settings extracted from a container's `NPM_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpmConfig {
    pub host: String,
    pub port: u16,
    /// Explicit upstream port; wins over `port` when set.
    pub forward_port: Option<u16>,
    pub scheme: String,
    pub ssl_forced: bool,
    pub hsts_enabled: bool,
    pub hsts_subdomains: bool,
    pub http2_support: bool,
    pub block_exploits: bool,
    pub caching_enabled: bool,
    pub allow_websocket_upgrade: bool,
    pub access_list_id: u64,
    pub certificate_id: CertificateId,
    pub preferred_network: Option<String>,
    pub advanced_config: String,
    /// `NPM_*` keys this version does not interpret, kept verbatim.
    pub extra: BTreeMap<String, String>,
}

impl NpmConfig {
    /// Port the proxy should forward to.
    pub fn upstream_port(&self) -> u16 {
        self.forward_port.unwrap_or(self.port)
    }
}

/// Marker stored in a host's `meta` field identifying it as ours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipMetadata {
    pub managed_by: String,
    pub container_id: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
}

impl OwnershipMetadata {
    pub fn new(container_id: &str) -> Self {
        Self {
            managed_by: MANAGED_BY_TAG.to_string(),
            container_id: container_id.to_string(),
            created_at: Some(Utc::now()),
        }
    }

    /// Read ownership from a host's raw `meta` value.
    ///
    /// The API hands back either an object or a JSON-encoded string.
    /// Anything that does not parse, or carries a different tag, yields
    /// `None`: the host is then treated as manually created.
    pub fn from_meta(meta: &Value) -> Option<Self> {
        let parsed = match meta {
            Value::Null => return None,
            Value::String(raw) if raw.trim().is_empty() => return None,
            Value::String(raw) => serde_json::from_str::<Self>(raw),
            other => Self::deserialize(other),
        };

        match parsed {
            Ok(ownership) if ownership.managed_by == MANAGED_BY_TAG => Some(ownership),
            Ok(_) => None,
            Err(e) => {
                debug!("Host metadata carries no ownership tag: {}", e);
                None
            }
        }
    }
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_timestamp))
}

/// Accepts RFC 3339 and naive ISO-8601 timestamps (read as UTC).
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|ts| ts.and_utc())
        })
}

// Older NPM releases return 0/1 instead of booleans.
fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(flag) => flag,
        Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    })
}

// NPM returns null for columns that were never set.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn null_as_scheme<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?
        .filter(|scheme| !scheme.is_empty())
        .unwrap_or_else(default_scheme))
}

fn default_true() -> bool {
    true
}

fn default_scheme() -> String {
    "http".to_string()
}

/// A proxy host as returned by `GET /nginx/proxy-hosts`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProxyHost {
    pub id: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub domain_names: Vec<String>,
    #[serde(default = "default_scheme", deserialize_with = "null_as_scheme")]
    pub forward_scheme: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub forward_host: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub forward_port: u16,
    #[serde(default, deserialize_with = "null_as_default")]
    pub access_list_id: u64,
    #[serde(default)]
    pub certificate_id: CertificateId,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub ssl_forced: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub hsts_enabled: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub hsts_subdomains: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub http2_support: bool,
    #[serde(default = "default_true", deserialize_with = "lenient_bool")]
    pub block_exploits: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub caching_enabled: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub allow_websocket_upgrade: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub advanced_config: String,
    #[serde(default)]
    pub meta: Value,
    #[serde(default = "default_true", deserialize_with = "lenient_bool")]
    pub enabled: bool,
}

impl ProxyHost {
    /// The first domain name, used as the cache key.
    pub fn canonical_domain(&self) -> Option<&str> {
        self.domain_names.first().map(String::as_str)
    }

    pub fn ownership(&self) -> Option<OwnershipMetadata> {
        OwnershipMetadata::from_meta(&self.meta)
    }

    /// Decode one entry of the remote host list.
    ///
    /// An entry whose id is readable but whose other fields are not is kept
    /// with its domains and no metadata, so it still claims its domain as an
    /// unmanaged host.  Only entries without an id are rejected.
    pub fn from_remote(entry: &Value) -> Result<Self, serde_json::Error> {
        let full_error = match ProxyHost::deserialize(entry) {
            Ok(host) => return Ok(host),
            Err(e) => e,
        };

        #[derive(Deserialize)]
        struct Identity {
            id: u64,
            #[serde(default, deserialize_with = "null_as_default")]
            domain_names: Vec<Value>,
        }

        let identity = Identity::deserialize(entry)?;
        warn!(
            "Proxy host {} could not be fully decoded ({}); treating it as unmanaged",
            identity.id, full_error
        );
        let mut host = Self::blank(identity.id);
        host.domain_names = identity
            .domain_names
            .into_iter()
            .filter_map(|name| match name {
                Value::String(name) => Some(name),
                _ => None,
            })
            .collect();
        Ok(host)
    }

    /// Local copy of a host freshly created from `payload`.
    pub fn from_payload(id: u64, payload: &ProxyHostPayload) -> Self {
        let mut host = Self::blank(id);
        host.apply(payload);
        host
    }

    fn blank(id: u64) -> Self {
        Self {
            id,
            domain_names: Vec::new(),
            forward_scheme: String::new(),
            forward_host: String::new(),
            forward_port: 0,
            access_list_id: 0,
            certificate_id: CertificateId::default(),
            ssl_forced: false,
            hsts_enabled: false,
            hsts_subdomains: false,
            http2_support: false,
            block_exploits: true,
            caching_enabled: false,
            allow_websocket_upgrade: false,
            advanced_config: String::new(),
            meta: Value::Null,
            enabled: true,
        }
    }

    /// Overwrite every field carried by `payload`.
    pub fn apply(&mut self, payload: &ProxyHostPayload) {
        self.domain_names = payload.domain_names.clone();
        self.forward_scheme = payload.forward_scheme.clone();
        self.forward_host = payload.forward_host.clone();
        self.forward_port = payload.forward_port;
        self.access_list_id = payload.access_list_id;
        self.certificate_id = payload.certificate_id;
        self.ssl_forced = payload.ssl_forced;
        self.hsts_enabled = payload.hsts_enabled;
        self.hsts_subdomains = payload.hsts_subdomains;
        self.http2_support = payload.http2_support;
        self.block_exploits = payload.block_exploits;
        self.caching_enabled = payload.caching_enabled;
        self.allow_websocket_upgrade = payload.allow_websocket_upgrade;
        self.advanced_config = payload.advanced_config.clone();
        self.meta = serde_json::to_value(&payload.meta).unwrap_or_default();
        self.enabled = payload.enabled;
    }
}

/// Full desired state of a managed host, sent on create and refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyHostPayload {
    pub domain_names: Vec<String>,
    pub forward_scheme: String,
    pub forward_host: String,
    pub forward_port: u16,
    pub access_list_id: u64,
    pub certificate_id: CertificateId,
    pub ssl_forced: bool,
    pub hsts_enabled: bool,
    pub hsts_subdomains: bool,
    pub http2_support: bool,
    pub block_exploits: bool,
    pub caching_enabled: bool,
    pub allow_websocket_upgrade: bool,
    pub advanced_config: String,
    pub meta: OwnershipMetadata,
    pub enabled: bool,
}

/// Body of a `PUT /nginx/proxy-hosts/{id}` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum HostUpdate {
    /// Rewrite the host with fresh desired state.
    Refresh(ProxyHostPayload),
    /// Toggle the host without touching any other field.
    Enabled { enabled: bool },
}
