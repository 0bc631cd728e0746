//! Container descriptor extraction.
//!
//! Pure mapping from Docker inspection data to [`ContainerDescriptor`] and
//! from a container's environment to its [`NpmConfig`].  Nothing here talks
//! to Docker or to the proxy manager.

use std::collections::{BTreeMap, HashMap};

use bollard::models::ContainerInspectResponse;
use log::warn;

use crate::types::{CertificateId, ContainerDescriptor, NetworkEndpoint, NpmConfig};

pub const ENV_HOST: &str = "NPM_HOST";
pub const ENV_PORT: &str = "NPM_PORT";

const ENV_PREFIX: &str = "NPM_";

/// Keys with a dedicated `NpmConfig` field.  Every other `NPM_*` key ends
/// up in `NpmConfig::extra`.
const KNOWN_KEYS: &[&str] = &[
    ENV_HOST,
    ENV_PORT,
    "NPM_FORWARD_PORT",
    "NPM_SCHEME",
    "NPM_SSL",
    "NPM_ENABLE_HSTS",
    "NPM_HSTS_SUBDOMAINS",
    "NPM_HTTP2",
    "NPM_BLOCK_EXPLOITS",
    "NPM_CACHING",
    "NPM_ENABLE_WS",
    "NPM_ACCESS_LIST_ID",
    "NPM_CERTIFICATE_ID",
    "NPM_NETWORK",
    "NPM_ADVANCED_CONFIG",
];

/// Split `KEY=value` entries on the first `=`.  Entries without `=` are
/// dropped; an empty value stays an empty string.
pub fn parse_env<S: AsRef<str>>(entries: &[S]) -> HashMap<String, String> {
    entries
        .iter()
        .filter_map(|entry| entry.as_ref().split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Only a case-insensitive `"true"` counts as true.  `"yes"` and `"1"` are
/// false.
pub fn parse_bool(raw: &str) -> bool {
    raw.eq_ignore_ascii_case("true")
}

fn flag(env: &HashMap<String, String>, key: &str, default: bool) -> bool {
    env.get(key).map(|raw| parse_bool(raw)).unwrap_or(default)
}

/// Build the proxy settings for a container, or `None` when it did not opt
/// in (missing `NPM_HOST`/`NPM_PORT`) or declared an unusable port.
pub fn npm_config(env: &HashMap<String, String>) -> Option<NpmConfig> {
    let host = env.get(ENV_HOST)?;
    let raw_port = env.get(ENV_PORT)?;

    let port = match raw_port.trim().parse::<u16>() {
        Ok(port) => port,
        Err(e) => {
            warn!("Ignoring {}: invalid {} {:?}: {}", host, ENV_PORT, raw_port, e);
            return None;
        }
    };

    let forward_port = env.get("NPM_FORWARD_PORT").and_then(|raw| {
        raw.trim()
            .parse::<u16>()
            .map_err(|e| warn!("Invalid NPM_FORWARD_PORT {:?} for {}: {}", raw, host, e))
            .ok()
    });

    let access_list_id = match env.get("NPM_ACCESS_LIST_ID") {
        Some(raw) => raw.trim().parse::<u64>().unwrap_or_else(|e| {
            warn!("Invalid NPM_ACCESS_LIST_ID {:?} for {}: {}. Using 0.", raw, host, e);
            0
        }),
        None => 0,
    };

    let certificate_id = match env.get("NPM_CERTIFICATE_ID") {
        Some(raw) => CertificateId::parse(raw).unwrap_or_else(|| {
            warn!("Invalid certificate_id {:?} for {}. Using 0.", raw, host);
            CertificateId::default()
        }),
        None => CertificateId::default(),
    };

    let scheme = env
        .get("NPM_SCHEME")
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "http".to_string());

    let extra = env
        .iter()
        .filter(|(key, _)| key.starts_with(ENV_PREFIX) && !KNOWN_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    Some(NpmConfig {
        host: host.clone(),
        port,
        forward_port,
        scheme,
        ssl_forced: flag(env, "NPM_SSL", false),
        hsts_enabled: flag(env, "NPM_ENABLE_HSTS", false),
        hsts_subdomains: flag(env, "NPM_HSTS_SUBDOMAINS", false),
        http2_support: flag(env, "NPM_HTTP2", false),
        block_exploits: flag(env, "NPM_BLOCK_EXPLOITS", true),
        caching_enabled: flag(env, "NPM_CACHING", false),
        allow_websocket_upgrade: flag(env, "NPM_ENABLE_WS", false),
        access_list_id,
        certificate_id,
        preferred_network: env.get("NPM_NETWORK").filter(|n| !n.is_empty()).cloned(),
        advanced_config: env.get("NPM_ADVANCED_CONFIG").cloned().unwrap_or_default(),
        extra,
    })
}

/// Convert a Docker inspection payload.  Returns `None` only when the
/// payload has no container id.
pub fn descriptor_from_inspect(detail: &ContainerInspectResponse) -> Option<ContainerDescriptor> {
    let id = detail.id.clone()?;
    let name = detail
        .name
        .as_deref()
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_else(|| id.clone());

    let status = detail
        .state
        .as_ref()
        .and_then(|state| state.status.as_ref())
        .map(|status| status.to_string())
        .unwrap_or_default();

    let image = detail
        .config
        .as_ref()
        .and_then(|config| config.image.clone())
        .or_else(|| detail.image.clone())
        .unwrap_or_default();

    let env = detail
        .config
        .as_ref()
        .and_then(|config| config.env.as_deref())
        .map(parse_env)
        .unwrap_or_default();

    let networks: BTreeMap<String, NetworkEndpoint> = detail
        .network_settings
        .as_ref()
        .and_then(|settings| settings.networks.as_ref())
        .map(|networks| {
            networks
                .iter()
                .map(|(name, endpoint)| {
                    (
                        name.clone(),
                        NetworkEndpoint {
                            ip_address: endpoint.ip_address.clone().unwrap_or_default(),
                            gateway: endpoint.gateway.clone().unwrap_or_default(),
                            network_id: endpoint.network_id.clone().unwrap_or_default(),
                        },
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    Some(ContainerDescriptor {
        id,
        name,
        status,
        image,
        env,
        networks,
    })
}
