//! Local projection of the remote proxy host list.
//!
//! Hosts are keyed by their first domain name; `owned` holds the ids whose
//! metadata carried our ownership tag at last observation.  The cache is
//! rebuilt from scratch on every full sync and patched after each
//! successful create/update, so `owned` is always a subset of the cached
//! host ids.

use std::collections::{HashMap, HashSet};

use log::{debug, warn};

use crate::types::{ProxyHost, ProxyHostPayload};

#[derive(Debug, Default)]
pub struct HostStateCache {
    by_domain: HashMap<String, ProxyHost>,
    owned: HashSet<u64>,
}

impl HostStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole cache with a fresh host list.
    ///
    /// Hosts without domain names are skipped.  If two hosts share a first
    /// domain, the first one listed wins.
    pub fn rebuild(&mut self, hosts: Vec<ProxyHost>) {
        self.by_domain.clear();
        self.owned.clear();

        for host in hosts {
            let domain = match host.canonical_domain() {
                Some(domain) => domain.to_string(),
                None => {
                    debug!("Skipping proxy host {} without domain names", host.id);
                    continue;
                }
            };
            if let Some(existing) = self.by_domain.get(&domain) {
                warn!(
                    "Proxy hosts {} and {} both claim {}; keeping {}",
                    existing.id, host.id, domain, existing.id
                );
                continue;
            }
            if host.ownership().is_some() {
                debug!("Found managed host {} (ID {})", domain, host.id);
                self.owned.insert(host.id);
            }
            self.by_domain.insert(domain, host);
        }
    }

    pub fn get(&self, domain: &str) -> Option<&ProxyHost> {
        self.by_domain.get(domain)
    }

    pub fn is_owned(&self, id: u64) -> bool {
        self.owned.contains(&id)
    }

    pub fn owned_ids(&self) -> &HashSet<u64> {
        &self.owned
    }

    pub fn len(&self) -> usize {
        self.by_domain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_domain.is_empty()
    }

    /// Record a host this service just created.
    pub fn record_created(&mut self, host: ProxyHost) {
        let domain = match host.canonical_domain() {
            Some(domain) => domain.to_string(),
            None => return,
        };
        if let Some(previous) = self.by_domain.get(&domain) {
            if previous.id != host.id {
                self.owned.remove(&previous.id);
            }
        }
        if host.ownership().is_some() {
            self.owned.insert(host.id);
        }
        self.by_domain.insert(domain, host);
    }

    /// Apply a successful full refresh to the cached host under `domain`.
    pub fn record_refreshed(&mut self, domain: &str, payload: &ProxyHostPayload) {
        if let Some(host) = self.by_domain.get_mut(domain) {
            host.apply(payload);
            if host.ownership().is_some() {
                self.owned.insert(host.id);
            } else {
                self.owned.remove(&host.id);
            }
        }
    }

    /// Apply a successful enable/disable to the cached host under `domain`.
    pub fn record_enabled(&mut self, domain: &str, enabled: bool) {
        if let Some(host) = self.by_domain.get_mut(domain) {
            host.enabled = enabled;
        }
    }

    /// Every owned host bound to `container_id`, with its domain, in id
    /// order.
    pub fn find_by_container(&self, container_id: &str) -> Vec<(&str, &ProxyHost)> {
        let mut bound: Vec<(&str, &ProxyHost)> = self
            .by_domain
            .iter()
            .filter(|(_, host)| self.owned.contains(&host.id))
            .filter(|(_, host)| {
                host.ownership()
                    .map(|meta| meta.container_id == container_id)
                    .unwrap_or(false)
            })
            .map(|(domain, host)| (domain.as_str(), host))
            .collect();
        bound.sort_by_key(|(_, host)| host.id);
        bound
    }
}
