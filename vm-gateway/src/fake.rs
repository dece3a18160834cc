//! In-memory gateways for tests.
//!
//! Each fake records what it was asked to do and can be scripted to fail or
//! stall for particular VM names.

use crate::address::AddressAllocator;
use crate::environment::{CloneSpec, EnvironmentGateway, EnvironmentKind, VmHandle};
use crate::error::{GatewayError, Result};
use crate::registry::{EnvironmentInfo, GatewayProvider};
use crate::ticketing::{TicketDecision, TicketRef, TicketRequest, TicketingGateway};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct EnvScript {
    clone_failures: HashMap<String, GatewayError>,
    never_ready: HashSet<String>,
    reported_address: Option<String>,
}

/// Scriptable hypervisor.
///
/// A VM counts as an active build from the start of `clone_template` until
/// `is_ready` first reports it ready or the clone fails. The highest number
/// of simultaneous active builds is kept in [`max_active`](Self::max_active).
#[derive(Debug)]
pub struct FakeEnvironment {
    kind: EnvironmentKind,
    clone_delay: Mutex<Duration>,
    script: Mutex<EnvScript>,
    cloned: Mutex<Vec<CloneSpec>>,
    names: Mutex<HashMap<String, String>>,
    deleted: Mutex<Vec<VmHandle>>,
    building: Mutex<HashSet<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    next_vmid: AtomicUsize,
}

impl Default for FakeEnvironment {
    fn default() -> Self {
        Self::new(EnvironmentKind::Proxmox)
    }
}

impl FakeEnvironment {
    pub fn new(kind: EnvironmentKind) -> Self {
        Self {
            kind,
            clone_delay: Mutex::new(Duration::ZERO),
            script: Mutex::new(EnvScript::default()),
            cloned: Mutex::new(Vec::new()),
            names: Mutex::new(HashMap::new()),
            deleted: Mutex::new(Vec::new()),
            building: Mutex::new(HashSet::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            next_vmid: AtomicUsize::new(100),
        }
    }

    /// Sleep this long inside every `clone_template` call.
    pub fn set_clone_delay(&self, delay: Duration) {
        *lock(&self.clone_delay) = delay;
    }

    pub fn fail_clone(&self, vm_name: &str, err: GatewayError) {
        lock(&self.script)
            .clone_failures
            .insert(vm_name.to_string(), err);
    }

    pub fn never_ready(&self, vm_name: &str) {
        lock(&self.script).never_ready.insert(vm_name.to_string());
    }

    pub fn clear_failures(&self) {
        let mut script = lock(&self.script);
        script.clone_failures.clear();
        script.never_ready.clear();
    }

    /// Address the guest agent reports for every VM.
    pub fn set_reported_address(&self, ip: &str) {
        lock(&self.script).reported_address = Some(ip.to_string());
    }

    pub fn clone_count(&self) -> usize {
        lock(&self.cloned).len()
    }

    pub fn clone_count_for(&self, vm_name: &str) -> usize {
        lock(&self.cloned).iter().filter(|s| s.name == vm_name).count()
    }

    pub fn cloned_specs(&self) -> Vec<CloneSpec> {
        lock(&self.cloned).clone()
    }

    pub fn deleted(&self) -> Vec<VmHandle> {
        lock(&self.deleted).clone()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn finish_build(&self, vm_name: &str) {
        if lock(&self.building).remove(vm_name) {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl EnvironmentGateway for FakeEnvironment {
    fn kind(&self) -> EnvironmentKind {
        self.kind
    }

    async fn clone_template(&self, spec: &CloneSpec) -> Result<VmHandle> {
        if lock(&self.building).insert(spec.name.clone()) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
        }

        let delay = *lock(&self.clone_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        lock(&self.cloned).push(spec.clone());
        let failure = lock(&self.script).clone_failures.get(&spec.name).cloned();
        if let Some(err) = failure {
            self.finish_build(&spec.name);
            return Err(err);
        }

        let vm_id = self.next_vmid.fetch_add(1, Ordering::SeqCst).to_string();
        lock(&self.names).insert(vm_id.clone(), spec.name.clone());
        Ok(VmHandle {
            vm_id,
            host: "node-1".to_string(),
        })
    }

    async fn is_ready(&self, vm: &VmHandle) -> Result<bool> {
        let name = lock(&self.names).get(&vm.vm_id).cloned().unwrap_or_default();
        if lock(&self.script).never_ready.contains(&name) {
            return Ok(false);
        }
        self.finish_build(&name);
        Ok(true)
    }

    async fn get_address(&self, _vm: &VmHandle) -> Result<Option<String>> {
        Ok(lock(&self.script).reported_address.clone())
    }

    async fn delete_vm(&self, vm: &VmHandle) -> Result<()> {
        lock(&self.deleted).push(vm.clone());
        Ok(())
    }
}

/// Ticketing system that keeps issues in memory, keyed by external key.
#[derive(Debug, Default)]
pub struct FakeTicketing {
    unavailable: AtomicBool,
    issues: Mutex<HashMap<String, TicketRef>>,
    upserts: Mutex<Vec<TicketRequest>>,
    comments: Mutex<Vec<(String, String)>>,
    decisions: Mutex<Vec<(String, TicketDecision)>>,
    next_issue: AtomicUsize,
}

impl FakeTicketing {
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn upserts(&self) -> Vec<TicketRequest> {
        lock(&self.upserts).clone()
    }

    pub fn issue_count(&self) -> usize {
        lock(&self.issues).len()
    }

    pub fn comments(&self) -> Vec<(String, String)> {
        lock(&self.comments).clone()
    }

    pub fn decisions(&self) -> Vec<(String, TicketDecision)> {
        lock(&self.decisions).clone()
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::TicketingUnavailable(
                "fake ticketing is down".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl TicketingGateway for FakeTicketing {
    async fn create_or_update_ticket(&self, request: &TicketRequest) -> Result<TicketRef> {
        self.check()?;
        lock(&self.upserts).push(request.clone());

        let mut issues = lock(&self.issues);
        if let Some(key) = &request.existing_key {
            if let Some(found) = issues.values().find(|t| &t.key == key) {
                return Ok(found.clone());
            }
        }
        if let Some(found) = issues.get(&request.external_key()) {
            return Ok(found.clone());
        }

        let n = self.next_issue.fetch_add(1, Ordering::SeqCst) + 1;
        let ticket = TicketRef {
            key: format!("INFRA-{n}"),
            url: format!("https://tickets.test/browse/INFRA-{n}"),
        };
        issues.insert(request.external_key(), ticket.clone());
        Ok(ticket)
    }

    async fn add_comment(&self, key: &str, body: &str) -> Result<()> {
        self.check()?;
        lock(&self.comments).push((key.to_string(), body.to_string()));
        Ok(())
    }

    async fn record_decision(&self, key: &str, decision: TicketDecision) -> Result<bool> {
        self.check()?;
        lock(&self.decisions).push((key.to_string(), decision));
        Ok(true)
    }
}

/// Address pool handing out `10.<subnet>.0.<n>` addresses.
#[derive(Debug, Default)]
pub struct FakeAllocator {
    unavailable: AtomicBool,
    capacity: Mutex<Option<usize>>,
    held: Mutex<HashSet<(i64, String)>>,
    released: Mutex<Vec<(i64, String)>>,
    allocations: AtomicUsize,
    next_host: AtomicUsize,
}

impl FakeAllocator {
    /// Limit the number of addresses held at once per subnet.
    pub fn set_capacity(&self, capacity: Option<usize>) {
        *lock(&self.capacity) = capacity;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn held(&self) -> HashSet<(i64, String)> {
        lock(&self.held).clone()
    }

    pub fn released(&self) -> Vec<(i64, String)> {
        lock(&self.released).clone()
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AddressAllocator for FakeAllocator {
    async fn allocate(&self, subnet_id: i64, _hostname: &str) -> Result<String> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::AllocatorUnavailable(
                "fake IPAM is down".to_string(),
            ));
        }

        let mut held = lock(&self.held);
        if let Some(cap) = *lock(&self.capacity) {
            if held.iter().filter(|(s, _)| *s == subnet_id).count() >= cap {
                return Err(GatewayError::NoAddressAvailable(format!(
                    "subnet {subnet_id} is full"
                )));
            }
        }

        let host = self.next_host.fetch_add(1, Ordering::SeqCst) + 10;
        let ip = format!("10.{}.{}.{}", subnet_id % 256, host / 256, host % 256);
        held.insert((subnet_id, ip.clone()));
        self.allocations.fetch_add(1, Ordering::SeqCst);
        Ok(ip)
    }

    async fn release(&self, subnet_id: i64, ip: &str) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::AllocatorUnavailable(
                "fake IPAM is down".to_string(),
            ));
        }
        lock(&self.held).remove(&(subnet_id, ip.to_string()));
        lock(&self.released).push((subnet_id, ip.to_string()));
        Ok(())
    }
}

/// [`GatewayProvider`] over the fakes above.
#[derive(Debug)]
pub struct FakeGateways {
    environments: Mutex<Vec<EnvironmentInfo>>,
    fakes: Mutex<HashMap<String, Arc<FakeEnvironment>>>,
    unreachable: Mutex<HashSet<String>>,
    ticketing: Option<Arc<FakeTicketing>>,
    allocator: Option<Arc<FakeAllocator>>,
}

impl Default for FakeGateways {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeGateways {
    /// No environments, with ticketing and IPAM configured.
    pub fn new() -> Self {
        Self {
            environments: Mutex::new(Vec::new()),
            fakes: Mutex::new(HashMap::new()),
            unreachable: Mutex::new(HashSet::new()),
            ticketing: Some(Arc::new(FakeTicketing::default())),
            allocator: Some(Arc::new(FakeAllocator::default())),
        }
    }

    pub fn with_environment(self, name: &str, max_concurrent: Option<usize>) -> Self {
        self.add_environment(name, true, max_concurrent);
        self
    }

    pub fn with_disabled_environment(self, name: &str) -> Self {
        self.add_environment(name, false, None);
        self
    }

    pub fn without_ticketing(mut self) -> Self {
        self.ticketing = None;
        self
    }

    pub fn without_allocator(mut self) -> Self {
        self.allocator = None;
        self
    }

    fn add_environment(&self, name: &str, enabled: bool, max_concurrent: Option<usize>) {
        lock(&self.environments).push(EnvironmentInfo {
            name: name.to_string(),
            display_name: None,
            kind: EnvironmentKind::Proxmox,
            enabled,
            max_concurrent,
        });
        lock(&self.fakes).insert(name.to_string(), Arc::new(FakeEnvironment::default()));
    }

    /// The fake hypervisor behind `name`.
    ///
    /// # Panics
    /// When `name` was never added.
    pub fn env(&self, name: &str) -> Arc<FakeEnvironment> {
        lock(&self.fakes)
            .get(name)
            .cloned()
            .unwrap_or_else(|| panic!("fake environment {name} not configured"))
    }

    /// Change `max_concurrent` for `name`, as an edited settings file would.
    pub fn set_max_concurrent(&self, name: &str, max_concurrent: Option<usize>) {
        for env in lock(&self.environments).iter_mut().filter(|e| e.name == name) {
            env.max_concurrent = max_concurrent;
        }
    }

    /// Make `environment()` fail for `name` as if its API were down.
    pub fn set_unreachable(&self, name: &str, unreachable: bool) {
        let mut set = lock(&self.unreachable);
        if unreachable {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
    }

    /// # Panics
    /// When built `without_ticketing`.
    pub fn tickets(&self) -> Arc<FakeTicketing> {
        self.ticketing.clone().expect("ticketing not configured")
    }

    /// # Panics
    /// When built `without_allocator`.
    pub fn addresses(&self) -> Arc<FakeAllocator> {
        self.allocator.clone().expect("allocator not configured")
    }
}

impl GatewayProvider for FakeGateways {
    fn environments(&self) -> Result<Vec<EnvironmentInfo>> {
        Ok(lock(&self.environments).clone())
    }

    fn environment(&self, name: &str) -> Result<Arc<dyn EnvironmentGateway>> {
        let info = self.environment_info(name)?.ok_or_else(|| {
            GatewayError::EnvironmentUnavailable(format!("environment {name} is not configured"))
        })?;
        if !info.enabled || lock(&self.unreachable).contains(name) {
            return Err(GatewayError::EnvironmentUnavailable(format!(
                "environment {name} is unreachable"
            )));
        }
        let env: Arc<dyn EnvironmentGateway> = self.env(name);
        Ok(env)
    }

    fn ticketing(&self) -> Result<Option<Arc<dyn TicketingGateway>>> {
        Ok(self
            .ticketing
            .clone()
            .map(|t| t as Arc<dyn TicketingGateway>))
    }

    fn allocator(&self) -> Result<Option<Arc<dyn AddressAllocator>>> {
        Ok(self
            .allocator
            .clone()
            .map(|a| a as Arc<dyn AddressAllocator>))
    }
}
