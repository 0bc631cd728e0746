//! Reconciliation between running containers and NPM proxy hosts.
//!
//! The [`Reconciler`] owns the [`HostStateCache`] outright.  Scheduler ticks
//! and lifecycle events both arrive in [`Reconciler::run`] and are handled
//! one at a time, so the cache has a single writer and needs no lock.
//!
//! Mutations are gated on ownership: a host is only created, refreshed or
//! disabled by this service if its metadata carries our tag.  Manually
//! created hosts are never touched.

use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::cache::HostStateCache;
use crate::error::ReconcileError;
use crate::npm_api::ProxyHostApi;
use crate::runtime::ContainerRuntime;
use crate::types::{
    ContainerDescriptor, ContainerEvent, EventKind, HostUpdate, NpmConfig, OwnershipMetadata,
    ProxyHost, ProxyHostPayload,
};

/// Why a reconciliation did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The container declares no `NPM_HOST`/`NPM_PORT`.
    NotProxyEnabled,
    /// None of the container's networks has an address.
    NoUsableAddress,
    /// The container vanished before it could be inspected.
    ContainerGone,
    /// No owned host is bound to the stopped container.
    NoManagedHost,
    /// Every owned host bound to the stopped container is already off.
    AlreadyDisabled,
}

/// Result of a single container reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Created(u64),
    Updated(u64),
    /// Ids of the hosts that were switched off.
    Disabled(Vec<u64>),
    /// The domain belongs to a host we do not own.
    Refused { domain: String },
    Skipped(SkipReason),
    /// An API or runtime call failed; the cache was left untouched.
    Failed,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub hosts: usize,
    pub owned: usize,
    pub containers: usize,
    pub created: usize,
    pub updated: usize,
    pub refused: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl SyncReport {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Created(_) => self.created += 1,
            Outcome::Updated(_) => self.updated += 1,
            Outcome::Refused { .. } => self.refused += 1,
            Outcome::Skipped(_) => self.skipped += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Disabled(_) => {}
        }
    }
}

pub struct Reconciler<A, R> {
    api: A,
    runtime: R,
    cache: HostStateCache,
}

impl<A, R> Reconciler<A, R>
where
    A: ProxyHostApi,
    R: ContainerRuntime,
{
    pub fn new(api: A, runtime: R) -> Self {
        Self {
            api,
            runtime,
            cache: HostStateCache::new(),
        }
    }

    pub fn cache(&self) -> &HostStateCache {
        &self.cache
    }

    /// Authenticate, then run the initial full sync.
    ///
    /// Only a failed login is an error; a failed initial sync is logged and
    /// left for the next scheduled pass.
    pub async fn start(&mut self) -> Result<(), ReconcileError> {
        info!("Starting EnvoyNPM reconciler");
        if !self.api.authenticate().await {
            error!("NPM API login failed, refusing to start");
            return Err(ReconcileError::AuthenticationFailed);
        }

        info!("Running initial full sync");
        if let Err(e) = self.full_sync().await {
            error!("Initial full sync failed: {}", e);
        }
        Ok(())
    }

    /// Rebuild the cache from the remote host list, then re-apply desired
    /// state for every running proxy-enabled container.
    ///
    /// If the host list cannot be fetched the previous cache is kept and no
    /// container is touched.
    pub async fn full_sync(&mut self) -> Result<SyncReport, ReconcileError> {
        info!("Full sync started");
        let hosts = self
            .api
            .list_hosts()
            .await
            .ok_or(ReconcileError::HostListUnavailable)?;
        self.cache.rebuild(hosts);

        let mut report = SyncReport {
            hosts: self.cache.len(),
            owned: self.cache.owned_ids().len(),
            ..Default::default()
        };
        info!(
            "Loaded {} NPM hosts ({} managed by EnvoyNPM)",
            report.hosts, report.owned
        );

        let containers = self.runtime.running_containers().await?;
        for container in &containers {
            if container.npm_config().is_none() {
                continue;
            }
            report.containers += 1;
            let outcome = self.reconcile_start(container).await;
            report.record(&outcome);
        }

        info!(
            "Full sync finished: {} containers, {} created, {} updated, {} refused, {} failed",
            report.containers, report.created, report.updated, report.refused, report.failed
        );
        Ok(report)
    }

    /// Handle one lifecycle event.
    pub async fn handle_event(&mut self, event: ContainerEvent) -> Outcome {
        debug!("Handling {} event for {}", event.kind, event.container_id);
        match event.kind {
            EventKind::Start => match self.runtime.inspect(&event.container_id).await {
                Ok(Some(descriptor)) => self.reconcile_start(&descriptor).await,
                Ok(None) => Outcome::Skipped(SkipReason::ContainerGone),
                Err(e) => {
                    error!("Failed to inspect container {}: {}", event.container_id, e);
                    Outcome::Failed
                }
            },
            EventKind::Stop | EventKind::Die => self.reconcile_stop(&event.container_id).await,
        }
    }

    /// Bring the host for a running container in line with its settings.
    pub async fn reconcile_start(&mut self, container: &ContainerDescriptor) -> Outcome {
        let npm = match container.npm_config() {
            Some(npm) => npm,
            None => return Outcome::Skipped(SkipReason::NotProxyEnabled),
        };
        let domain = npm.host.clone();

        let ip = match resolve_target_ip(container, &npm) {
            Some(ip) => ip.to_string(),
            None => {
                error!(
                    "No usable IP address for container {} ({}), skipping {}",
                    container.name, container.id, domain
                );
                return Outcome::Skipped(SkipReason::NoUsableAddress);
            }
        };
        info!(
            "Reconciling {} -> {}:{} for container {} ({}, {})",
            domain,
            ip,
            npm.upstream_port(),
            container.name,
            container.image,
            container.status
        );

        let payload = desired_host(&npm, &ip, &container.id);

        let existing = self.cache.get(&domain).map(|host| host.id);
        match existing {
            None => match self.api.create_host(&payload).await {
                Some(id) => {
                    self.cache
                        .record_created(ProxyHost::from_payload(id, &payload));
                    Outcome::Created(id)
                }
                None => {
                    error!("Could not create proxy host for {}", domain);
                    Outcome::Failed
                }
            },
            Some(id) if self.cache.is_owned(id) => {
                info!("Refreshing managed host {} (ID {})", domain, id);
                let update = HostUpdate::Refresh(payload.clone());
                if self.api.update_host(id, &update).await {
                    self.cache.record_refreshed(&domain, &payload);
                    Outcome::Updated(id)
                } else {
                    error!("Could not refresh proxy host {} (ID {})", domain, id);
                    Outcome::Failed
                }
            }
            Some(id) => {
                warn!(
                    "A manually created host already exists for {} (ID {}). \
                     Delete it in NPM to let EnvoyNPM manage this domain.",
                    domain, id
                );
                Outcome::Refused { domain }
            }
        }
    }

    /// Disable every owned host bound to a stopped container.
    ///
    /// Hosts already disabled in the cache are left alone, so the `die` and
    /// `stop` pair Docker emits for one stop costs a single update.
    pub async fn reconcile_stop(&mut self, container_id: &str) -> Outcome {
        let bound = self.cache.find_by_container(container_id);
        if bound.is_empty() {
            debug!("No managed host bound to container {}", container_id);
            return Outcome::Skipped(SkipReason::NoManagedHost);
        }

        let targets: Vec<(String, u64)> = bound
            .into_iter()
            .filter(|(_, host)| host.enabled)
            .map(|(domain, host)| (domain.to_string(), host.id))
            .collect();
        if targets.is_empty() {
            debug!("Hosts for container {} are already disabled", container_id);
            return Outcome::Skipped(SkipReason::AlreadyDisabled);
        }

        let mut disabled = Vec::with_capacity(targets.len());
        for (domain, id) in targets {
            info!(
                "Disabling host {} (ID {}) for stopped container {}",
                domain, id, container_id
            );
            if self
                .api
                .update_host(id, &HostUpdate::Enabled { enabled: false })
                .await
            {
                self.cache.record_enabled(&domain, false);
                disabled.push(id);
            } else {
                error!("Could not disable proxy host {} (ID {})", domain, id);
            }
        }

        if disabled.is_empty() {
            Outcome::Failed
        } else {
            Outcome::Disabled(disabled)
        }
    }

    /// Serve scheduler ticks and lifecycle events until `cancel` fires.
    ///
    /// The first tick lands one `sync_interval` from now; the initial sync is
    /// expected to have run in [`Reconciler::start`].  If the event channel
    /// closes, periodic syncs keep running.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<ContainerEvent>,
        sync_interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = interval_at(Instant::now() + sync_interval, sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        info!("Reconciler running, full sync every {:?}", sync_interval);
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Reconciler stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.full_sync().await {
                        error!("Scheduled full sync failed: {}", e);
                    }
                }
                event = events.recv(), if events_open => match event {
                    Some(event) => {
                        let outcome = self.handle_event(event).await;
                        debug!("Event outcome: {:?}", outcome);
                    }
                    None => {
                        warn!("Container event channel closed; continuing with scheduled syncs only");
                        events_open = false;
                    }
                },
            }
        }
    }
}

/// Pick the address NPM should forward to: the preferred network if it has
/// an address, otherwise the first network (by name) that does.
pub fn resolve_target_ip<'a>(container: &'a ContainerDescriptor, npm: &NpmConfig) -> Option<&'a str> {
    if let Some(preferred) = npm.preferred_network.as_deref() {
        match container.networks.get(preferred) {
            Some(endpoint) if !endpoint.ip_address.is_empty() => {
                return Some(endpoint.ip_address.as_str())
            }
            _ => debug!(
                "Preferred network {} has no address on {}, falling back",
                preferred, container.name
            ),
        }
    }

    container
        .networks
        .values()
        .map(|endpoint| endpoint.ip_address.as_str())
        .find(|ip| !ip.is_empty())
}

/// Full host record for a container's desired state.
pub fn desired_host(npm: &NpmConfig, forward_host: &str, container_id: &str) -> ProxyHostPayload {
    ProxyHostPayload {
        domain_names: vec![npm.host.clone()],
        forward_scheme: npm.scheme.clone(),
        forward_host: forward_host.to_string(),
        forward_port: npm.upstream_port(),
        access_list_id: npm.access_list_id,
        certificate_id: npm.certificate_id,
        ssl_forced: npm.ssl_forced,
        hsts_enabled: npm.hsts_enabled,
        hsts_subdomains: npm.hsts_subdomains,
        http2_support: npm.http2_support,
        block_exploits: npm.block_exploits,
        caching_enabled: npm.caching_enabled,
        allow_websocket_upgrade: npm.allow_websocket_upgrade,
        advanced_config: npm.advanced_config.clone(),
        meta: OwnershipMetadata::new(container_id),
        enabled: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;
    use crate::types::{CertificateId, NetworkEndpoint, MANAGED_BY_TAG};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::{BTreeMap, HashMap};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Authenticate,
        List,
        Create(ProxyHostPayload),
        Update(u64, HostUpdate),
        Delete(u64),
    }

    #[derive(Default)]
    struct ApiState {
        hosts: Vec<ProxyHost>,
        calls: Vec<Call>,
        next_id: u64,
        auth_ok: bool,
        list_fails: bool,
        create_fails: bool,
        update_fails: bool,
    }

    /// In-memory NPM recording every call.  Created and updated hosts are
    /// written back so a following `list_hosts` sees them.
    #[derive(Clone)]
    struct FakeApi(Arc<Mutex<ApiState>>);

    impl FakeApi {
        fn new(hosts: Vec<ProxyHost>) -> Self {
            Self(Arc::new(Mutex::new(ApiState {
                hosts,
                next_id: 100,
                auth_ok: true,
                ..Default::default()
            })))
        }

        fn calls(&self) -> Vec<Call> {
            self.0.lock().unwrap().calls.clone()
        }

        fn mutations(&self) -> Vec<Call> {
            self.calls()
                .into_iter()
                .filter(|c| !matches!(c, Call::Authenticate | Call::List))
                .collect()
        }

        fn clear_calls(&self) {
            self.0.lock().unwrap().calls.clear();
        }

        fn set(&self, f: impl FnOnce(&mut ApiState)) {
            f(&mut self.0.lock().unwrap());
        }
    }

    #[async_trait]
    impl ProxyHostApi for FakeApi {
        async fn authenticate(&self) -> bool {
            let mut state = self.0.lock().unwrap();
            state.calls.push(Call::Authenticate);
            state.auth_ok
        }

        async fn list_hosts(&self) -> Option<Vec<ProxyHost>> {
            let mut state = self.0.lock().unwrap();
            state.calls.push(Call::List);
            if state.list_fails {
                None
            } else {
                Some(state.hosts.clone())
            }
        }

        async fn create_host(&self, host: &ProxyHostPayload) -> Option<u64> {
            let mut state = self.0.lock().unwrap();
            state.calls.push(Call::Create(host.clone()));
            if state.create_fails {
                return None;
            }
            state.next_id += 1;
            let id = state.next_id;
            state.hosts.push(ProxyHost::from_payload(id, host));
            Some(id)
        }

        async fn update_host(&self, id: u64, update: &HostUpdate) -> bool {
            let mut state = self.0.lock().unwrap();
            state.calls.push(Call::Update(id, update.clone()));
            if state.update_fails {
                return false;
            }
            if let Some(host) = state.hosts.iter_mut().find(|h| h.id == id) {
                match update {
                    HostUpdate::Refresh(payload) => host.apply(payload),
                    HostUpdate::Enabled { enabled } => host.enabled = *enabled,
                }
            }
            true
        }

        async fn delete_host(&self, id: u64) -> bool {
            let mut state = self.0.lock().unwrap();
            state.calls.push(Call::Delete(id));
            state.hosts.retain(|h| h.id != id);
            true
        }
    }

    #[derive(Clone, Default)]
    struct FakeRuntime(Arc<Mutex<HashMap<String, ContainerDescriptor>>>);

    impl FakeRuntime {
        fn with(containers: Vec<ContainerDescriptor>) -> Self {
            let runtime = Self::default();
            for c in containers {
                runtime.put(c);
            }
            runtime
        }

        fn put(&self, container: ContainerDescriptor) {
            self.0
                .lock()
                .unwrap()
                .insert(container.id.clone(), container);
        }

        fn remove(&self, id: &str) {
            self.0.lock().unwrap().remove(id);
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn inspect(&self, id: &str) -> Result<Option<ContainerDescriptor>, RuntimeError> {
            Ok(self.0.lock().unwrap().get(id).cloned())
        }

        async fn running_containers(&self) -> Result<Vec<ContainerDescriptor>, RuntimeError> {
            let mut all: Vec<_> = self.0.lock().unwrap().values().cloned().collect();
            all.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(all)
        }

        async fn monitor(
            &self,
            _event_tx: mpsc::Sender<ContainerEvent>,
            cancel: CancellationToken,
        ) -> Result<(), RuntimeError> {
            cancel.cancelled().await;
            Ok(())
        }
    }

    fn container(id: &str, env: &[(&str, &str)], networks: &[(&str, &str)]) -> ContainerDescriptor {
        ContainerDescriptor {
            id: id.to_string(),
            name: format!("{}-name", id),
            status: "running".to_string(),
            image: "app:latest".to_string(),
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            networks: networks
                .iter()
                .map(|(name, ip)| {
                    (
                        name.to_string(),
                        NetworkEndpoint {
                            ip_address: ip.to_string(),
                            ..Default::default()
                        },
                    )
                })
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn app_container(id: &str, ip: &str) -> ContainerDescriptor {
        container(
            id,
            &[("NPM_HOST", "app.example.com"), ("NPM_PORT", "3000")],
            &[("bridge", ip)],
        )
    }

    fn remote_host(id: u64, domain: &str, meta: Value) -> ProxyHost {
        serde_json::from_value(json!({
            "id": id,
            "domain_names": [domain],
            "forward_host": "10.0.0.1",
            "forward_port": 80,
            "meta": meta,
        }))
        .unwrap()
    }

    fn start(id: &str) -> ContainerEvent {
        ContainerEvent {
            kind: EventKind::Start,
            container_id: id.to_string(),
        }
    }

    fn stop(id: &str) -> ContainerEvent {
        ContainerEvent {
            kind: EventKind::Stop,
            container_id: id.to_string(),
        }
    }

    async fn synced(api: &FakeApi, runtime: &FakeRuntime) -> Reconciler<FakeApi, FakeRuntime> {
        let mut reconciler = Reconciler::new(api.clone(), runtime.clone());
        reconciler.full_sync().await.unwrap();
        api.clear_calls();
        reconciler
    }

    #[tokio::test]
    async fn test_start_creates_host_for_new_domain() {
        let api = FakeApi::new(vec![]);
        let runtime = FakeRuntime::default();
        let mut reconciler = synced(&api, &runtime).await;
        runtime.put(app_container("c1", "10.0.0.5"));

        let outcome = reconciler.handle_event(start("c1")).await;

        assert_eq!(outcome, Outcome::Created(101));
        let calls = api.mutations();
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            Call::Create(payload) => {
                assert_eq!(payload.domain_names, vec!["app.example.com".to_string()]);
                assert_eq!(payload.forward_port, 3000);
                assert_eq!(payload.forward_host, "10.0.0.5");
                assert_eq!(payload.forward_scheme, "http");
                assert_eq!(payload.meta.managed_by, MANAGED_BY_TAG);
                assert_eq!(payload.meta.container_id, "c1");
                assert!(payload.block_exploits);
                assert!(payload.enabled);
            }
            other => panic!("unexpected call {:?}", other),
        }
        assert!(reconciler.cache().is_owned(101));
        assert_eq!(reconciler.cache().get("app.example.com").unwrap().id, 101);
    }

    #[tokio::test]
    async fn test_restart_with_new_address_updates_instead_of_creating() {
        let api = FakeApi::new(vec![]);
        let runtime = FakeRuntime::with(vec![app_container("c1", "10.0.0.5")]);
        let mut reconciler = synced(&api, &runtime).await;
        assert!(reconciler.cache().is_owned(101));

        runtime.remove("c1");
        runtime.put(app_container("c2", "10.0.0.9"));
        let outcome = reconciler.handle_event(start("c2")).await;

        assert_eq!(outcome, Outcome::Updated(101));
        let calls = api.mutations();
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            Call::Update(101, HostUpdate::Refresh(payload)) => {
                assert_eq!(payload.forward_host, "10.0.0.9");
                assert!(payload.enabled);
                assert_eq!(payload.meta.container_id, "c2");
            }
            other => panic!("unexpected call {:?}", other),
        }
        let cached = reconciler.cache().get("app.example.com").unwrap();
        assert_eq!(cached.forward_host, "10.0.0.9");
        assert_eq!(cached.ownership().unwrap().container_id, "c2");
    }

    #[tokio::test]
    async fn test_stop_disables_owned_host_only() {
        let api = FakeApi::new(vec![]);
        let runtime = FakeRuntime::with(vec![app_container("c1", "10.0.0.5")]);
        let mut reconciler = synced(&api, &runtime).await;

        let outcome = reconciler.handle_event(stop("c1")).await;

        assert_eq!(outcome, Outcome::Disabled(vec![101]));
        assert_eq!(
            api.mutations(),
            vec![Call::Update(101, HostUpdate::Enabled { enabled: false })]
        );
        let cached = reconciler.cache().get("app.example.com").unwrap();
        assert!(!cached.enabled);
        assert_eq!(cached.forward_host, "10.0.0.5");
    }

    #[tokio::test]
    async fn test_die_event_behaves_like_stop() {
        let api = FakeApi::new(vec![]);
        let runtime = FakeRuntime::with(vec![app_container("c1", "10.0.0.5")]);
        let mut reconciler = synced(&api, &runtime).await;

        let outcome = reconciler
            .handle_event(ContainerEvent {
                kind: EventKind::Die,
                container_id: "c1".to_string(),
            })
            .await;
        assert_eq!(outcome, Outcome::Disabled(vec![101]));
    }

    #[tokio::test]
    async fn test_stop_then_die_disables_once() {
        let api = FakeApi::new(vec![]);
        let runtime = FakeRuntime::with(vec![app_container("c1", "10.0.0.5")]);
        let mut reconciler = synced(&api, &runtime).await;

        assert_eq!(
            reconciler.handle_event(stop("c1")).await,
            Outcome::Disabled(vec![101])
        );
        let die = ContainerEvent {
            kind: EventKind::Die,
            container_id: "c1".to_string(),
        };
        assert_eq!(
            reconciler.handle_event(die).await,
            Outcome::Skipped(SkipReason::AlreadyDisabled)
        );
        assert_eq!(api.mutations().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_disables_every_host_bound_to_container() {
        let managed = json!({"managed_by": "EnvoyNPM", "container_id": "c1"});
        let api = FakeApi::new(vec![
            remote_host(7, "b.example.com", managed.clone()),
            remote_host(3, "a.example.com", managed),
            remote_host(9, "c.example.com", Value::Null),
        ]);
        let runtime = FakeRuntime::default();
        let mut reconciler = synced(&api, &runtime).await;

        let outcome = reconciler.handle_event(stop("c1")).await;

        assert_eq!(outcome, Outcome::Disabled(vec![3, 7]));
        assert_eq!(
            api.mutations(),
            vec![
                Call::Update(3, HostUpdate::Enabled { enabled: false }),
                Call::Update(7, HostUpdate::Enabled { enabled: false }),
            ]
        );
        assert!(!reconciler.cache().get("a.example.com").unwrap().enabled);
        assert!(!reconciler.cache().get("b.example.com").unwrap().enabled);
        assert!(reconciler.cache().get("c.example.com").unwrap().enabled);
    }

    #[tokio::test]
    async fn test_manual_host_with_null_columns_is_refused() {
        let manual = ProxyHost::from_remote(&json!({
            "id": 5,
            "domain_names": ["app.example.com"],
            "forward_host": null,
            "advanced_config": null,
            "meta": {}
        }))
        .unwrap();
        let api = FakeApi::new(vec![manual]);
        let runtime = FakeRuntime::with(vec![app_container("c1", "10.0.0.5")]);
        let mut reconciler = Reconciler::new(api.clone(), runtime);

        let report = reconciler.full_sync().await.unwrap();

        assert_eq!(report.refused, 1);
        assert_eq!(report.created, 0);
        assert!(api.mutations().is_empty());
        assert_eq!(reconciler.cache().get("app.example.com").unwrap().id, 5);
    }

    #[tokio::test]
    async fn test_manual_host_is_never_touched() {
        let api = FakeApi::new(vec![remote_host(
            5,
            "app.example.com",
            json!({"letsencrypt_agree": false}),
        )]);
        let runtime = FakeRuntime::default();
        let mut reconciler = synced(&api, &runtime).await;
        runtime.put(app_container("c1", "10.0.0.5"));

        let outcome = reconciler.handle_event(start("c1")).await;
        assert_eq!(
            outcome,
            Outcome::Refused {
                domain: "app.example.com".to_string()
            }
        );

        let outcome = reconciler.handle_event(stop("c1")).await;
        assert_eq!(outcome, Outcome::Skipped(SkipReason::NoManagedHost));
        assert!(api.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_meta_counts_as_manual() {
        let api = FakeApi::new(vec![remote_host(5, "app.example.com", json!("{oops"))]);
        let runtime = FakeRuntime::with(vec![app_container("c1", "10.0.0.5")]);
        let mut reconciler = Reconciler::new(api.clone(), runtime);

        let report = reconciler.full_sync().await.unwrap();
        assert_eq!(report.refused, 1);
        assert!(api.mutations().is_empty());
        assert!(!reconciler.cache().is_owned(5));
    }

    #[tokio::test]
    async fn test_stop_for_unknown_container_is_noop() {
        let api = FakeApi::new(vec![remote_host(
            1,
            "other.example.com",
            json!({"managed_by": "EnvoyNPM", "container_id": "someone"}),
        )]);
        let runtime = FakeRuntime::default();
        let mut reconciler = synced(&api, &runtime).await;

        let outcome = reconciler.handle_event(stop("ghost")).await;
        assert_eq!(outcome, Outcome::Skipped(SkipReason::NoManagedHost));
        assert!(api.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_failed_create_leaves_cache_untouched() {
        let api = FakeApi::new(vec![]);
        api.set(|s| s.create_fails = true);
        let runtime = FakeRuntime::default();
        let mut reconciler = synced(&api, &runtime).await;
        runtime.put(app_container("c1", "10.0.0.5"));

        let outcome = reconciler.handle_event(start("c1")).await;

        assert_eq!(outcome, Outcome::Failed);
        assert!(reconciler.cache().is_empty());
        assert!(reconciler.cache().owned_ids().is_empty());
    }

    #[tokio::test]
    async fn test_failed_update_leaves_cache_untouched() {
        let api = FakeApi::new(vec![]);
        let runtime = FakeRuntime::with(vec![app_container("c1", "10.0.0.5")]);
        let mut reconciler = synced(&api, &runtime).await;
        api.set(|s| s.update_fails = true);

        runtime.put(app_container("c1", "10.0.0.9"));
        assert_eq!(reconciler.handle_event(start("c1")).await, Outcome::Failed);
        assert_eq!(
            reconciler
                .cache()
                .get("app.example.com")
                .unwrap()
                .forward_host,
            "10.0.0.5"
        );

        assert_eq!(reconciler.handle_event(stop("c1")).await, Outcome::Failed);
        assert!(reconciler.cache().get("app.example.com").unwrap().enabled);
    }

    #[tokio::test]
    async fn test_no_usable_address_makes_no_call() {
        let api = FakeApi::new(vec![]);
        let runtime = FakeRuntime::default();
        let mut reconciler = synced(&api, &runtime).await;
        runtime.put(container(
            "c1",
            &[("NPM_HOST", "app.example.com"), ("NPM_PORT", "3000")],
            &[("bridge", ""), ("backend", "")],
        ));

        let outcome = reconciler.handle_event(start("c1")).await;
        assert_eq!(outcome, Outcome::Skipped(SkipReason::NoUsableAddress));
        assert!(api.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_container_without_npm_env_is_ignored() {
        let api = FakeApi::new(vec![]);
        let runtime = FakeRuntime::with(vec![container(
            "c1",
            &[("NPM_HOST", "app.example.com")],
            &[("bridge", "10.0.0.5")],
        )]);
        let mut reconciler = synced(&api, &runtime).await;

        let outcome = reconciler.handle_event(start("c1")).await;
        assert_eq!(outcome, Outcome::Skipped(SkipReason::NotProxyEnabled));
        assert!(api.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_vanished_container_is_skipped() {
        let api = FakeApi::new(vec![]);
        let runtime = FakeRuntime::default();
        let mut reconciler = synced(&api, &runtime).await;

        let outcome = reconciler.handle_event(start("gone")).await;
        assert_eq!(outcome, Outcome::Skipped(SkipReason::ContainerGone));
    }

    #[test]
    fn test_resolve_target_ip_prefers_named_network() {
        let c = container(
            "c1",
            &[
                ("NPM_HOST", "a.example.com"),
                ("NPM_PORT", "80"),
                ("NPM_NETWORK", "frontend"),
            ],
            &[("bridge", "172.17.0.2"), ("frontend", "10.1.0.2")],
        );
        let npm = c.npm_config().unwrap();
        assert_eq!(resolve_target_ip(&c, &npm), Some("10.1.0.2"));
    }

    #[test]
    fn test_resolve_target_ip_falls_back_to_first_with_address() {
        let c = container(
            "c1",
            &[
                ("NPM_HOST", "a.example.com"),
                ("NPM_PORT", "80"),
                ("NPM_NETWORK", "frontend"),
            ],
            &[("alpha", ""), ("bridge", "172.17.0.2"), ("frontend", ""), ("zeta", "10.9.0.2")],
        );
        let npm = c.npm_config().unwrap();
        assert_eq!(resolve_target_ip(&c, &npm), Some("172.17.0.2"));
    }

    #[test]
    fn test_desired_host_maps_every_field() {
        let c = container(
            "c1",
            &[
                ("NPM_HOST", "a.example.com"),
                ("NPM_PORT", "80"),
                ("NPM_FORWARD_PORT", "8080"),
                ("NPM_SCHEME", "https"),
                ("NPM_SSL", "true"),
                ("NPM_HTTP2", "TRUE"),
                ("NPM_CACHING", "1"),
                ("NPM_CERTIFICATE_ID", "new"),
                ("NPM_ACCESS_LIST_ID", "4"),
                ("NPM_ADVANCED_CONFIG", "gzip on;"),
            ],
            &[("bridge", "172.17.0.2")],
        );
        let npm = c.npm_config().unwrap();
        let payload = desired_host(&npm, "172.17.0.2", "c1");

        assert_eq!(payload.forward_port, 8080);
        assert_eq!(payload.forward_scheme, "https");
        assert!(payload.ssl_forced);
        assert!(payload.http2_support);
        assert!(!payload.caching_enabled);
        assert_eq!(payload.certificate_id, CertificateId::New);
        assert_eq!(payload.access_list_id, 4);
        assert_eq!(payload.advanced_config, "gzip on;");
        assert!(payload.enabled);
    }

    #[tokio::test]
    async fn test_full_sync_is_idempotent() {
        let api = FakeApi::new(vec![remote_host(
            5,
            "manual.example.com",
            Value::Null,
        )]);
        let runtime = FakeRuntime::with(vec![
            app_container("c1", "10.0.0.5"),
            container(
                "c2",
                &[("NPM_HOST", "api.example.com"), ("NPM_PORT", "8000")],
                &[("bridge", "10.0.0.6")],
            ),
            container(
                "c3",
                &[("NPM_HOST", "manual.example.com"), ("NPM_PORT", "80")],
                &[("bridge", "10.0.0.7")],
            ),
            container("c4", &[], &[("bridge", "10.0.0.8")]),
        ]);
        let mut reconciler = Reconciler::new(api.clone(), runtime);

        let first = reconciler.full_sync().await.unwrap();
        assert_eq!(first.created, 2);
        assert_eq!(first.refused, 1);
        assert_eq!(first.containers, 3);
        let owned_after_first = reconciler.cache().owned_ids().clone();

        api.clear_calls();
        let second = reconciler.full_sync().await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 2);
        assert_eq!(second.refused, 1);
        assert_eq!(reconciler.cache().owned_ids(), &owned_after_first);

        let mutations = api.mutations();
        assert_eq!(mutations.len(), 2);
        assert!(mutations
            .iter()
            .all(|c| matches!(c, Call::Update(_, HostUpdate::Refresh(_)))));
        assert!(!mutations.iter().any(|c| matches!(c, Call::Update(5, _))));
    }

    #[tokio::test]
    async fn test_full_sync_keeps_cache_when_list_fails() {
        let api = FakeApi::new(vec![]);
        let runtime = FakeRuntime::with(vec![app_container("c1", "10.0.0.5")]);
        let mut reconciler = synced(&api, &runtime).await;
        api.set(|s| s.list_fails = true);

        let result = reconciler.full_sync().await;
        assert!(matches!(result, Err(ReconcileError::HostListUnavailable)));
        assert!(reconciler.cache().is_owned(101));
        assert!(api.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_full_sync_continues_after_single_failure() {
        let api = FakeApi::new(vec![]);
        api.set(|s| s.create_fails = true);
        let runtime = FakeRuntime::with(vec![
            app_container("c1", "10.0.0.5"),
            container(
                "c2",
                &[("NPM_HOST", "api.example.com"), ("NPM_PORT", "8000")],
                &[("bridge", "10.0.0.6")],
            ),
        ]);
        let mut reconciler = Reconciler::new(api.clone(), runtime);

        let report = reconciler.full_sync().await.unwrap();
        assert_eq!(report.failed, 2);
        assert_eq!(api.mutations().len(), 2);
    }

    #[tokio::test]
    async fn test_start_requires_authentication() {
        let api = FakeApi::new(vec![]);
        api.set(|s| s.auth_ok = false);
        let mut reconciler = Reconciler::new(api.clone(), FakeRuntime::default());

        let result = reconciler.start().await;
        assert!(matches!(result, Err(ReconcileError::AuthenticationFailed)));
        assert_eq!(api.calls(), vec![Call::Authenticate]);
    }

    #[tokio::test]
    async fn test_start_survives_failed_initial_sync() {
        let api = FakeApi::new(vec![]);
        api.set(|s| s.list_fails = true);
        let mut reconciler = Reconciler::new(api.clone(), FakeRuntime::default());

        assert!(reconciler.start().await.is_ok());
        assert_eq!(api.calls(), vec![Call::Authenticate, Call::List]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_handles_events_and_scheduled_syncs() {
        let api = FakeApi::new(vec![]);
        let runtime = FakeRuntime::default();
        let reconciler = synced(&api, &runtime).await;
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(reconciler.run(rx, Duration::from_secs(60), cancel.clone()));

        runtime.put(app_container("c1", "10.0.0.5"));
        tx.send(start("c1")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(api.mutations().len(), 1);
        assert!(!api.calls().contains(&Call::List));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(api.calls().contains(&Call::List));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_survives_closed_event_channel() {
        let api = FakeApi::new(vec![]);
        let runtime = FakeRuntime::default();
        let reconciler = synced(&api, &runtime).await;
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(reconciler.run(rx, Duration::from_secs(10), cancel.clone()));

        tokio::time::sleep(Duration::from_secs(25)).await;
        let lists = api.calls().iter().filter(|c| **c == Call::List).count();
        assert_eq!(lists, 2);

        cancel.cancel();
        handle.await.unwrap();
    }
}
