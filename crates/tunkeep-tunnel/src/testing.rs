//! Scripted collaborators for unit tests

use crate::backend::{BackendCapabilities, BackendKind, StatusStream, TargetState, TunnelBackend};
use crate::config::{TunnelConfig, TunnelDefinition, TunnelId};
use crate::error::BackendError;
use crate::kill_switch::BackendMode;
use crate::state::{TunnelStatistics, TunnelStatus};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tunkeep_network::{DnsError, HostResolver, PingError, PingStats, Pinger};

/// What `set_state(Up)` does
#[derive(Debug, Clone)]
pub(crate) enum UpBehavior {
    /// Report Starting then Up and keep the stream open
    Succeed,
    Fail(BackendError),
    /// Report Starting and never progress
    StayStarting,
    /// Never return from `set_state`
    Hang,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Up(TunnelId),
    Down(TunnelId),
    ForceStop(TunnelId),
    Apply(TunnelId, TunnelDefinition),
    ResolveDns(TunnelId),
    SetMode(BackendMode),
}

pub(crate) struct MockBackend {
    kind: BackendKind,
    capabilities: BackendCapabilities,
    up: Mutex<UpBehavior>,
    hang_on_down: AtomicBool,
    hang_on_apply: AtomicBool,
    streams: Mutex<HashMap<TunnelId, mpsc::Sender<Result<TunnelStatus, BackendError>>>>,
    calls: Mutex<Vec<Call>>,
    statistics: Mutex<HashMap<TunnelId, TunnelStatistics>>,
    apply_results: Mutex<VecDeque<Result<(), BackendError>>>,
    resolve_results: Mutex<VecDeque<Result<bool, BackendError>>>,
    mode: Mutex<BackendMode>,
}

impl MockBackend {
    pub(crate) fn new(kind: BackendKind) -> Self {
        let capabilities = BackendCapabilities {
            max_concurrent_tunnels: None,
            self_manages_endpoints: false,
            native_roaming: false,
            requires_kernel_name: false,
        };
        Self::with_capabilities(kind, capabilities)
    }

    pub(crate) fn with_capabilities(kind: BackendKind, capabilities: BackendCapabilities) -> Self {
        Self {
            kind,
            capabilities,
            up: Mutex::new(UpBehavior::Succeed),
            hang_on_down: AtomicBool::new(false),
            hang_on_apply: AtomicBool::new(false),
            streams: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            statistics: Mutex::new(HashMap::new()),
            apply_results: Mutex::new(VecDeque::new()),
            resolve_results: Mutex::new(VecDeque::new()),
            mode: Mutex::new(BackendMode::Inactive),
        }
    }

    pub(crate) fn set_up_behavior(&self, behavior: UpBehavior) {
        *self.up.lock().unwrap() = behavior;
    }

    pub(crate) fn hang_on_down(&self, hang: bool) {
        self.hang_on_down.store(hang, Ordering::SeqCst);
    }

    pub(crate) fn hang_on_apply(&self, hang: bool) {
        self.hang_on_apply.store(hang, Ordering::SeqCst);
    }

    pub(crate) fn set_statistics(&self, id: TunnelId, stats: TunnelStatistics) {
        self.statistics.lock().unwrap().insert(id, stats);
    }

    /// Queue results for the next `apply_definition` calls; default is Ok
    pub(crate) fn queue_apply(&self, result: Result<(), BackendError>) {
        self.apply_results.lock().unwrap().push_back(result);
    }

    /// Queue results for the next `resolve_dns` calls; default is Ok(true)
    pub(crate) fn queue_resolve(&self, result: Result<bool, BackendError>) {
        self.resolve_results.lock().unwrap().push_back(result);
    }

    /// Push a status onto a running tunnel's stream
    pub(crate) async fn push_status(&self, id: TunnelId, status: Result<TunnelStatus, BackendError>) {
        let tx = self.streams.lock().unwrap().get(&id).cloned();
        if let Some(tx) = tx {
            let _ = tx.send(status).await;
        }
    }

    /// Close a running tunnel's stream as if the backend died
    pub(crate) fn close_stream(&self, id: TunnelId) {
        self.streams.lock().unwrap().remove(&id);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl TunnelBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    async fn set_state(&self, config: &TunnelConfig, target: TargetState) -> Result<StatusStream, BackendError> {
        let id = config.id;
        match target {
            TargetState::Up => {
                self.record(Call::Up(id));
                let behavior = self.up.lock().unwrap().clone();
                let (tx, rx) = mpsc::channel(8);
                match behavior {
                    UpBehavior::Succeed => {
                        let _ = tx.send(Ok(TunnelStatus::Starting)).await;
                        let _ = tx.send(Ok(TunnelStatus::Up)).await;
                    }
                    UpBehavior::Fail(e) => return Err(e),
                    UpBehavior::StayStarting => {
                        let _ = tx.send(Ok(TunnelStatus::Starting)).await;
                    }
                    UpBehavior::Hang => std::future::pending::<()>().await,
                }
                self.streams.lock().unwrap().insert(id, tx);
                Ok(rx)
            }
            TargetState::Down => {
                self.record(Call::Down(id));
                if self.hang_on_down.load(Ordering::SeqCst) {
                    std::future::pending::<()>().await;
                }
                self.streams.lock().unwrap().remove(&id);
                let (tx, rx) = mpsc::channel(1);
                let _ = tx.send(Ok(TunnelStatus::Down)).await;
                Ok(rx)
            }
        }
    }

    async fn force_stop(&self, id: TunnelId) -> Result<(), BackendError> {
        self.record(Call::ForceStop(id));
        self.streams.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn statistics(&self, id: TunnelId) -> Result<TunnelStatistics, BackendError> {
        self.statistics
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| BackendError::Unknown(format!("no statistics for {}", id)))
    }

    async fn resolve_dns(&self, config: &TunnelConfig) -> Result<bool, BackendError> {
        self.record(Call::ResolveDns(config.id));
        self.resolve_results.lock().unwrap().pop_front().unwrap_or(Ok(true))
    }

    async fn apply_definition(&self, id: TunnelId, definition: &TunnelDefinition) -> Result<(), BackendError> {
        self.record(Call::Apply(id, definition.clone()));
        if self.hang_on_apply.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.apply_results.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn running_tunnel_names(&self) -> Result<BTreeSet<String>, BackendError> {
        Ok(BTreeSet::new())
    }

    async fn set_mode(&self, mode: BackendMode) -> Result<(), BackendError> {
        self.record(Call::SetMode(mode.clone()));
        *self.mode.lock().unwrap() = mode;
        Ok(())
    }

    fn mode(&self) -> BackendMode {
        self.mode.lock().unwrap().clone()
    }
}

/// Resolver answering from a fixed table
#[derive(Default)]
pub(crate) struct MockResolver {
    answers: Mutex<HashMap<String, IpAddr>>,
    pub(crate) lookups: AtomicUsize,
}

impl MockResolver {
    pub(crate) fn set(&self, host: &str, ip: IpAddr) {
        self.answers.lock().unwrap().insert(host.to_string(), ip);
    }
}

#[async_trait]
impl HostResolver for MockResolver {
    async fn resolve_host(&self, host: &str, _prefer_ipv4: bool) -> Result<IpAddr, DnsError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.answers
            .lock()
            .unwrap()
            .get(host)
            .copied()
            .ok_or_else(|| DnsError::NoAddresses(host.to_string()))
    }
}

/// Pinger with per-target scripted reachability; unknown targets reply
#[derive(Default)]
pub(crate) struct MockPinger {
    unreachable: Mutex<BTreeSet<String>>,
    targets: Mutex<Vec<String>>,
}

impl MockPinger {
    pub(crate) fn set_unreachable(&self, target: &str) {
        self.unreachable.lock().unwrap().insert(target.to_string());
    }

    pub(crate) fn targets(&self) -> Vec<String> {
        self.targets.lock().unwrap().clone()
    }
}

#[async_trait]
impl Pinger for MockPinger {
    async fn ping(&self, target: &str, attempts: u32, _timeout: Duration) -> Result<PingStats, PingError> {
        self.targets.lock().unwrap().push(target.to_string());
        if self.unreachable.lock().unwrap().contains(target) {
            return Err(PingError::Timeout(target.to_string()));
        }
        Ok(PingStats {
            transmitted: attempts,
            received: attempts,
            packet_loss: 0.0,
            rtt_min: 10.0,
            rtt_avg: 12.0,
            rtt_max: 15.0,
            rtt_stddev: 1.5,
        })
    }
}
