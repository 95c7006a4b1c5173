//! The sync loop.
//!
//! Every cycle walks FETCH -> DIFF -> APPLY_NODES -> APPLY_USERS ->
//! COLLECT_STATS -> REPORT -> RESET_COUNTERS. The store only records what the
//! engine confirmed, so anything that failed shows up again in the next diff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use xnode_db::{Plan, Store};
use xnode_shared::{Node, OnlineIpRecord, Snapshot, TrafficRecord, User, UserKey};

use crate::panel::local::LOCAL_PANEL;
use crate::panel::{LocalCatalog, PanelAdapter, PanelError};
use crate::xray::{self, ControlPlane, Convergence, Direction, XrayError, user_traffic_counter};

/// Where the desired state comes from.
pub enum Source {
    Remote(Box<dyn PanelAdapter>),
    Local(LocalCatalog),
}

impl Source {
    pub fn name(&self) -> &str {
        match self {
            Source::Remote(panel) => panel.panel_name(),
            Source::Local(_) => LOCAL_PANEL,
        }
    }

    async fn fetch(&self) -> Result<Snapshot, PanelError> {
        match self {
            Source::Remote(panel) => {
                let node = panel.fetch_node_info().await?;
                let users = panel.fetch_user_list(&node).await?;
                Ok(Snapshot::assemble(vec![node], users))
            }
            Source::Local(catalog) => Ok(Snapshot::assemble(
                catalog.nodes.clone(),
                catalog.users.clone(),
            )),
        }
    }
}

/// Wait between cycles. Returns early once `cancel` fires.
#[async_trait]
pub trait Pacer: Send + Sync {
    async fn pause(&self, cancel: &CancellationToken);
}

pub struct FixedDelay(pub Duration);

#[async_trait]
impl Pacer for FixedDelay {
    async fn pause(&self, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.0) => {}
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] PanelError),

    #[error("cycle interrupted by shutdown")]
    Cancelled,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counts {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    pub nodes: Counts,
    pub users: Counts,
    /// Entities dropped while assembling the snapshot.
    pub rejected: usize,
    /// Users left for later because their node is not live.
    pub skipped: usize,
    /// Mutations the engine refused.
    pub failures: usize,
    /// Traffic records the panel accepted.
    pub reported: usize,
}

/// A user's counters as read during COLLECT_STATS.
#[derive(Debug, Clone)]
struct Reading {
    key: UserKey,
    email: String,
    upload: u64,
    download: u64,
    /// `reading + carry`, what goes to the panel.
    record: TrafficRecord,
}

pub struct Orchestrator {
    source: Source,
    control: Arc<dyn ControlPlane>,
    store: Store,
    pacer: Box<dyn Pacer>,
}

impl Orchestrator {
    pub fn new(source: Source, control: Arc<dyn ControlPlane>, pacer: Box<dyn Pacer>) -> Self {
        Self {
            source,
            control,
            store: Store::new(),
            pacer,
        }
    }

    #[cfg(test)]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Run cycles until `cancel` fires. A cycle that already started its
    /// report finishes before the loop exits.
    pub async fn run(&mut self, cancel: CancellationToken) {
        info!("🔄 Sync loop started for {}", self.source.name());

        while !cancel.is_cancelled() {
            match self.run_cycle(&cancel).await {
                Ok(summary) => info!(
                    nodes_created = summary.nodes.created,
                    nodes_updated = summary.nodes.updated,
                    nodes_deleted = summary.nodes.deleted,
                    users_created = summary.users.created,
                    users_updated = summary.users.updated,
                    users_deleted = summary.users.deleted,
                    rejected = summary.rejected,
                    skipped = summary.skipped,
                    failures = summary.failures,
                    reported = summary.reported,
                    "✅ Sync cycle finished"
                ),
                Err(CycleError::Cancelled) => break,
                Err(e) => warn!("⚠️ Sync cycle aborted: {e}"),
            }
            self.pacer.pause(&cancel).await;
        }

        info!("🛑 Sync loop stopped");
    }

    pub async fn run_cycle(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<CycleSummary, CycleError> {
        let snapshot = self.source.fetch().await?;
        for e in &snapshot.rejected {
            warn!(error = %e, "⚠️ Dropped from this cycle");
        }

        let mut summary = CycleSummary {
            rejected: snapshot.rejected.len(),
            ..Default::default()
        };

        checkpoint(cancel)?;
        let nodes = self.store.nodes.diff(&snapshot.nodes);
        if !nodes.is_empty() {
            debug!(changes = nodes.len(), "node diff");
        }
        self.apply_nodes(nodes, &mut summary).await;

        checkpoint(cancel)?;
        let users = self.store.users.diff(&snapshot.users);
        if !users.is_empty() {
            debug!(changes = users.len(), "user diff");
        }
        self.apply_users(users, &mut summary).await;

        if matches!(self.source, Source::Local(_)) {
            return Ok(summary);
        }

        checkpoint(cancel)?;
        let (readings, online) = self.collect_stats().await;
        // REPORT and RESET_COUNTERS run as one unit: stopping between them
        // would report the same traffic twice.
        summary.reported = self.report_and_reset(readings, online).await;

        Ok(summary)
    }

    async fn apply_nodes(&mut self, plan: Plan<Node>, summary: &mut CycleSummary) {
        let cp = Arc::clone(&self.control);

        // Deletes first so their ports are free for creates.
        for node in plan.deletes {
            let tag = node.tag();
            match xray::ensure_no_inbound(cp.as_ref(), &tag).await {
                Ok(outcome) => {
                    let key = node.key();
                    if let Err(e) = self.store.nodes.mark_deleted(&key) {
                        error!("❌ Store out of step for {tag}: {e}");
                    }
                    let dropped = self.store.users.mark_node_users_deleted(&key);
                    summary.nodes.deleted += 1;
                    info!(tag = %tag, users = dropped.len(), ?outcome, "🗑️ Removed inbound");
                }
                Err(e) => {
                    summary.failures += 1;
                    error!(tag = %tag, error = %e, "❌ Failed to remove inbound");
                }
            }
        }

        for change in plan.updates {
            let tag = change.current.tag();
            let key = change.current.key();
            match replace_inbound(cp.as_ref(), &change.previous, &change.current).await {
                Replace::Done(outcome) => {
                    self.store.nodes.upsert(change.current);
                    // A rebuilt inbound starts empty.
                    let dropped = self.store.users.mark_node_users_deleted(&key);
                    summary.nodes.updated += 1;
                    info!(tag = %tag, users = dropped.len(), ?outcome, "🔁 Rebuilt inbound");
                }
                Replace::RemoveFailed(e) => {
                    summary.failures += 1;
                    error!(tag = %tag, error = %e, "❌ Failed to rebuild inbound");
                }
                Replace::AddFailed(e) => {
                    // The engine no longer has the old inbound either, so
                    // the next diff has to see a create.
                    if let Err(se) = self.store.nodes.mark_deleted(&key) {
                        error!("❌ Store out of step for {tag}: {se}");
                    }
                    let dropped = self.store.users.mark_node_users_deleted(&key);
                    summary.failures += 1;
                    error!(
                        tag = %tag,
                        port = change.current.listen_port,
                        users = dropped.len(),
                        error = %e,
                        "❌ Removed inbound but could not re-add it"
                    );
                }
            }
        }

        for node in plan.creates {
            let tag = node.tag();
            match xray::ensure_inbound(cp.as_ref(), &node).await {
                Ok(outcome) => {
                    info!(tag = %tag, port = node.listen_port, ?outcome, "🚀 Added inbound");
                    self.store.nodes.upsert(node);
                    summary.nodes.created += 1;
                }
                Err(e) => {
                    summary.failures += 1;
                    error!(
                        tag = %tag,
                        port = node.listen_port,
                        error = %e,
                        "❌ Failed to add inbound"
                    );
                }
            }
        }
    }

    async fn apply_users(&mut self, plan: Plan<User>, summary: &mut CycleSummary) {
        let cp = Arc::clone(&self.control);

        for user in plan.deletes {
            let key = user.key();
            let result = match self.live_node(&user) {
                Some(node) => xray::ensure_no_user(cp.as_ref(), &node.tag(), user.email()).await,
                // The inbound is already gone and took the user with it.
                None => Ok(Convergence::AlreadyConverged),
            };
            match result {
                Ok(outcome) => {
                    if let Err(e) = self.store.users.mark_deleted(&key) {
                        error!("❌ Store out of step for {key}: {e}");
                    }
                    summary.users.deleted += 1;
                    debug!(user = %key, ?outcome, "removed user");
                }
                Err(e) => {
                    summary.failures += 1;
                    error!(user = %key, error = %e, "❌ Failed to remove user");
                }
            }
        }

        for change in plan.updates {
            let key = change.current.key();
            let Some(node) = self.live_node(&change.current) else {
                summary.skipped += 1;
                debug!(user = %key, "node not live, update deferred");
                continue;
            };
            let previous_tag = self.live_node(&change.previous).map(|n| n.tag());
            let replaced = replace_user(
                cp.as_ref(),
                previous_tag.as_deref(),
                &change.previous,
                &node,
                &change.current,
            )
            .await;
            match replaced {
                Replace::Done(outcome) => {
                    self.store.users.upsert(change.current);
                    summary.users.updated += 1;
                    debug!(user = %key, ?outcome, "updated user");
                }
                Replace::RemoveFailed(e) => {
                    summary.failures += 1;
                    error!(user = %key, error = %e, "❌ Failed to update user");
                }
                Replace::AddFailed(e) => {
                    if let Err(se) = self.store.users.mark_deleted(&change.previous.key()) {
                        error!("❌ Store out of step for {key}: {se}");
                    }
                    summary.failures += 1;
                    error!(user = %key, error = %e, "❌ Removed user but could not re-add it");
                }
            }
        }

        for user in plan.creates {
            let key = user.key();
            let Some(node) = self.live_node(&user) else {
                summary.skipped += 1;
                debug!(user = %key, "node not live, add deferred");
                continue;
            };
            match xray::ensure_user(cp.as_ref(), &node, &user).await {
                Ok(outcome) => {
                    self.store.users.upsert(user);
                    summary.users.created += 1;
                    debug!(user = %key, ?outcome, "added user");
                }
                Err(e) => {
                    summary.failures += 1;
                    error!(user = %key, error = %e, "❌ Failed to add user");
                }
            }
        }
    }

    /// The stored node `user` belongs to, if the engine has its inbound.
    fn live_node(&self, user: &User) -> Option<Node> {
        self.store
            .nodes
            .get(&user.node_key())
            .filter(|r| !r.is_deleted)
            .map(|r| r.node.clone())
    }

    async fn collect_stats(&self) -> (Vec<Reading>, Vec<OnlineIpRecord>) {
        let cp = self.control.as_ref();

        let users: Vec<(UserKey, i64, String)> = self
            .store
            .users
            .get_active()
            .filter(|r| self.store.nodes.is_active(&r.user.node_key()))
            .map(|r| (r.user.key(), r.user.user_id(), r.user.email().to_string()))
            .collect();

        let mut readings = Vec::with_capacity(users.len());
        let mut online = Vec::new();

        for (key, user_id, email) in users {
            let up = cp.get_stat(&user_traffic_counter(&email, Direction::Uplink), false).await;
            let down = cp.get_stat(&user_traffic_counter(&email, Direction::Downlink), false).await;
            match (up, down) {
                (Ok(up), Ok(down)) => {
                    let (upload, download) = (up.unwrap_or(0), down.unwrap_or(0));
                    let (carry_up, carry_down) = self.store.users.carry(&key);
                    readings.push(Reading {
                        record: TrafficRecord {
                            user_id,
                            upload: upload.saturating_add(carry_up),
                            download: download.saturating_add(carry_down),
                        },
                        key,
                        email: email.clone(),
                        upload,
                        download,
                    });
                }
                (Err(e), _) | (_, Err(e)) => {
                    warn!(email = %email, error = %e, "⚠️ Could not read traffic");
                }
            }

            match cp.online_ips(&email).await {
                Ok(ips) if !ips.is_empty() => online.push(OnlineIpRecord { user_id, ips }),
                Ok(_) => {}
                Err(e) => warn!(email = %email, error = %e, "⚠️ Could not read online ips"),
            }
        }

        (readings, online)
    }

    /// Report, then zero what was reported. Returns the number of traffic
    /// records the panel accepted.
    async fn report_and_reset(
        &mut self,
        readings: Vec<Reading>,
        online: Vec<OnlineIpRecord>,
    ) -> usize {
        let Source::Remote(panel) = &self.source else {
            return 0;
        };

        if !online.is_empty() {
            match panel.report_user_online_ip(&online).await {
                Ok(true) => debug!(users = online.len(), "reported online ips"),
                Ok(false) => debug!("panel does not take online ips"),
                Err(e) => warn!("⚠️ Failed to report online ips: {e}"),
            }
        }

        let reported: Vec<Reading> = readings
            .into_iter()
            .filter(|r| !r.record.is_empty())
            .collect();
        let accepted = if reported.is_empty() {
            false
        } else {
            let records: Vec<TrafficRecord> = reported.iter().map(|r| r.record.clone()).collect();
            match panel.report_user_traffic(&records).await {
                Ok(true) => {
                    info!("📊 Reported traffic for {} users", records.len());
                    true
                }
                Ok(false) => {
                    warn!("⚠️ Panel does not take traffic reports, counters kept");
                    false
                }
                Err(e) => {
                    error!("❌ Failed to report traffic, counters kept for next cycle: {e}");
                    false
                }
            }
        };

        match panel.report_node_stats().await {
            Ok(_) => {}
            Err(e) => warn!("⚠️ Failed to report node status: {e}"),
        }

        if !accepted {
            return 0;
        }

        let cp = Arc::clone(&self.control);
        for reading in &reported {
            let up = cp
                .get_stat(&user_traffic_counter(&reading.email, Direction::Uplink), true)
                .await;
            let down = cp
                .get_stat(&user_traffic_counter(&reading.email, Direction::Downlink), true)
                .await;
            let carry_up = residual(up, reading.upload, &reading.email);
            let carry_down = residual(down, reading.download, &reading.email);
            if let Err(e) = self.store.users.set_carry(&reading.key, carry_up, carry_down) {
                error!("❌ Store out of step for {}: {e}", reading.key);
            }
        }
        reported.len()
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), CycleError> {
    if cancel.is_cancelled() {
        return Err(CycleError::Cancelled);
    }
    Ok(())
}

/// How far a remove-then-add got.
enum Replace {
    Done(Convergence),
    /// The engine still holds the previous entry.
    RemoveFailed(XrayError),
    /// The previous entry is gone and the new one was refused.
    AddFailed(XrayError),
}

async fn replace_inbound(cp: &dyn ControlPlane, previous: &Node, current: &Node) -> Replace {
    if let Err(e) = xray::ensure_no_inbound(cp, &previous.tag()).await {
        return Replace::RemoveFailed(e);
    }
    match xray::ensure_inbound(cp, current).await {
        Ok(outcome) => Replace::Done(outcome),
        Err(e) => Replace::AddFailed(e),
    }
}

/// `previous_tag` is `None` when the old user's inbound is already gone.
async fn replace_user(
    cp: &dyn ControlPlane,
    previous_tag: Option<&str>,
    previous: &User,
    node: &Node,
    current: &User,
) -> Replace {
    if let Some(tag) = previous_tag {
        if let Err(e) = xray::ensure_no_user(cp, tag, previous.email()).await {
            return Replace::RemoveFailed(e);
        }
    }
    match xray::ensure_user(cp, node, current).await {
        Ok(outcome) => Replace::Done(outcome),
        Err(e) => Replace::AddFailed(e),
    }
}

/// Traffic that arrived between the read and the reset. It was zeroed at the
/// engine without being reported, so it rides along with the next report.
fn residual(reset: Result<Option<u64>, XrayError>, reported: u64, email: &str) -> u64 {
    match reset {
        Ok(value) => {
            let value = value.unwrap_or(0);
            // Below the reading means the engine restarted in between.
            value.checked_sub(reported).unwrap_or(value)
        }
        Err(e) => {
            error!(email, error = %e, "❌ Failed to reset counter");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use xnode_shared::entities::default_email;
    use xnode_shared::{Credential, NodeSettings, UserIdentity, V2rayOptions};

    use super::*;
    use crate::xray::fake::FakeControlPlane;

    const PANEL: &str = "panel.test";

    #[derive(Default)]
    struct PanelState {
        node: Option<Node>,
        users: Vec<User>,
        fetch_fails: bool,
        traffic_fails: bool,
        traffic: Vec<Vec<TrafficRecord>>,
        online: Vec<Vec<OnlineIpRecord>>,
        node_reports: usize,
    }

    #[derive(Clone, Default)]
    struct ScriptedPanel(Arc<Mutex<PanelState>>);

    #[async_trait]
    impl PanelAdapter for ScriptedPanel {
        fn panel_name(&self) -> &str {
            PANEL
        }

        async fn fetch_node_info(&self) -> Result<Node, PanelError> {
            let state = self.0.lock().unwrap();
            if state.fetch_fails {
                return Err(PanelError::Status {
                    status: 502,
                    body: "bad gateway".to_string(),
                });
            }
            state
                .node
                .clone()
                .ok_or_else(|| PanelError::Unsupported("no node".to_string()))
        }

        async fn fetch_user_list(&self, _node: &Node) -> Result<Vec<User>, PanelError> {
            Ok(self.0.lock().unwrap().users.clone())
        }

        async fn report_node_stats(&self) -> Result<bool, PanelError> {
            self.0.lock().unwrap().node_reports += 1;
            Ok(true)
        }

        async fn report_user_online_ip(
            &self,
            records: &[OnlineIpRecord],
        ) -> Result<bool, PanelError> {
            self.0.lock().unwrap().online.push(records.to_vec());
            Ok(true)
        }

        async fn report_user_traffic(&self, records: &[TrafficRecord]) -> Result<bool, PanelError> {
            let mut state = self.0.lock().unwrap();
            if state.traffic_fails {
                return Err(PanelError::Rejected {
                    payload: "{\"ret\":0}".to_string(),
                });
            }
            state.traffic.push(records.to_vec());
            Ok(true)
        }
    }

    fn vmess_node(panel: &str, node_id: i64, port: u16) -> Node {
        Node {
            panel_name: panel.to_string(),
            node_id,
            listen_host: "0.0.0.0".to_string(),
            listen_port: port,
            settings: NodeSettings::VMess(V2rayOptions {
                transport: "tcp".to_string(),
                ..Default::default()
            }),
        }
    }

    fn vmess_user(panel: &str, node_id: i64, user_id: i64, uuid: &str) -> User {
        User {
            identity: UserIdentity {
                panel_name: panel.to_string(),
                node_id,
                user_id,
                email: default_email(user_id, panel),
                speed_limit: 0,
            },
            credential: Credential::VMess {
                uuid: uuid.to_string(),
            },
        }
    }

    const UUID_A: &str = "595abb61-be40-4cee-afb4-d889dcd510cb";
    const UUID_B: &str = "0fbd0d4a-4cc1-4a4f-9c5b-6e4f3b1f4d2a";

    fn remote(panel: &ScriptedPanel, cp: &Arc<FakeControlPlane>) -> Orchestrator {
        Orchestrator::new(
            Source::Remote(Box::new(panel.clone())),
            cp.clone(),
            Box::new(FixedDelay(Duration::from_millis(1))),
        )
    }

    fn scripted(node: Node, users: Vec<User>) -> ScriptedPanel {
        let panel = ScriptedPanel::default();
        {
            let mut state = panel.0.lock().unwrap();
            state.node = Some(node);
            state.users = users;
        }
        panel
    }

    fn local(nodes: Vec<Node>, users: Vec<User>) -> Source {
        Source::Local(LocalCatalog {
            nodes,
            users,
            rejected: Vec::new(),
        })
    }

    #[tokio::test]
    async fn first_cycle_adds_node_and_users() {
        let cp = Arc::new(FakeControlPlane::default());
        let panel = scripted(
            vmess_node(PANEL, 1, 443),
            vec![vmess_user(PANEL, 1, 1, UUID_A), vmess_user(PANEL, 1, 2, UUID_B)],
        );
        let mut orchestrator = remote(&panel, &cp);

        let summary = orchestrator.run_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(summary.nodes.created, 1);
        assert_eq!(summary.users.created, 2);
        assert_eq!(summary.failures, 0);
        assert_eq!(cp.inbound_tags(), vec!["panel.test-vmess-1"]);
        assert_eq!(cp.emails("panel.test-vmess-1"), vec!["1@panel.test", "2@panel.test"]);
        assert_eq!(orchestrator.store().users.get_active().count(), 2);
    }

    #[tokio::test]
    async fn unchanged_snapshot_sends_no_mutations() {
        let cp = Arc::new(FakeControlPlane::default());
        let panel = scripted(vmess_node(PANEL, 1, 443), vec![vmess_user(PANEL, 1, 1, UUID_A)]);
        let mut orchestrator = remote(&panel, &cp);
        let cancel = CancellationToken::new();

        orchestrator.run_cycle(&cancel).await.unwrap();
        cp.clear_calls();
        let summary = orchestrator.run_cycle(&cancel).await.unwrap();

        assert_eq!(summary, CycleSummary::default());
        assert!(cp.calls().is_empty(), "{:?}", cp.calls());
    }

    #[tokio::test]
    async fn node_change_rebuilds_inbound_and_readds_users() {
        let cp = Arc::new(FakeControlPlane::default());
        let panel = scripted(vmess_node(PANEL, 1, 443), vec![vmess_user(PANEL, 1, 1, UUID_A)]);
        let mut orchestrator = remote(&panel, &cp);
        let cancel = CancellationToken::new();
        orchestrator.run_cycle(&cancel).await.unwrap();

        panel.0.lock().unwrap().node = Some(vmess_node(PANEL, 1, 8443));
        cp.clear_calls();
        let summary = orchestrator.run_cycle(&cancel).await.unwrap();

        assert_eq!(summary.nodes.updated, 1);
        assert_eq!(summary.users.created, 1);
        assert_eq!(
            cp.calls(),
            vec![
                "remove_inbound panel.test-vmess-1",
                "add_inbound panel.test-vmess-1",
                "add_user panel.test-vmess-1 1@panel.test",
            ]
        );
        assert_eq!(cp.port("panel.test-vmess-1"), Some(8443));
        assert_eq!(cp.emails("panel.test-vmess-1"), vec!["1@panel.test"]);
    }

    #[tokio::test]
    async fn credential_change_replaces_user() {
        let cp = Arc::new(FakeControlPlane::default());
        let panel = scripted(vmess_node(PANEL, 1, 443), vec![vmess_user(PANEL, 1, 1, UUID_A)]);
        let mut orchestrator = remote(&panel, &cp);
        let cancel = CancellationToken::new();
        orchestrator.run_cycle(&cancel).await.unwrap();

        panel.0.lock().unwrap().users = vec![vmess_user(PANEL, 1, 1, UUID_B)];
        cp.clear_calls();
        let summary = orchestrator.run_cycle(&cancel).await.unwrap();

        assert_eq!(summary.users.updated, 1);
        assert_eq!(
            cp.calls(),
            vec![
                "remove_user panel.test-vmess-1 1@panel.test",
                "add_user panel.test-vmess-1 1@panel.test",
            ]
        );
        let stored = orchestrator
            .store()
            .users
            .get(&vmess_user(PANEL, 1, 1, UUID_B).key())
            .unwrap();
        assert_eq!(stored.user.credential, Credential::VMess { uuid: UUID_B.to_string() });
    }

    #[tokio::test]
    async fn failed_rebuild_then_revert_restores_inbound() {
        let cp = Arc::new(FakeControlPlane::default());
        let panel = scripted(vmess_node(PANEL, 1, 443), vec![vmess_user(PANEL, 1, 1, UUID_A)]);
        let mut orchestrator = remote(&panel, &cp);
        let cancel = CancellationToken::new();
        orchestrator.run_cycle(&cancel).await.unwrap();

        cp.occupy_port(8443);
        panel.0.lock().unwrap().node = Some(vmess_node(PANEL, 1, 8443));
        let summary = orchestrator.run_cycle(&cancel).await.unwrap();

        assert_eq!(summary.failures, 1);
        assert_eq!(summary.nodes.updated, 0);
        assert!(cp.inbound_tags().is_empty());
        assert!(!orchestrator.store().nodes.is_active(&vmess_node(PANEL, 1, 443).key()));
        assert_eq!(orchestrator.store().users.get_active().count(), 0);

        panel.0.lock().unwrap().node = Some(vmess_node(PANEL, 1, 443));
        let summary = orchestrator.run_cycle(&cancel).await.unwrap();

        assert_eq!(summary.failures, 0);
        assert_eq!(summary.nodes.created, 1);
        assert_eq!(summary.users.created, 1);
        assert_eq!(cp.inbound_tags(), vec!["panel.test-vmess-1"]);
        assert_eq!(cp.port("panel.test-vmess-1"), Some(443));
        assert_eq!(cp.emails("panel.test-vmess-1"), vec!["1@panel.test"]);
    }

    #[tokio::test]
    async fn refused_readd_is_retried_as_a_create() {
        let cp = Arc::new(FakeControlPlane::default());
        let panel = scripted(vmess_node(PANEL, 1, 443), vec![vmess_user(PANEL, 1, 1, UUID_A)]);
        let mut orchestrator = remote(&panel, &cp);
        let cancel = CancellationToken::new();
        orchestrator.run_cycle(&cancel).await.unwrap();

        cp.reject_user("1@panel.test");
        panel.0.lock().unwrap().users = vec![vmess_user(PANEL, 1, 1, UUID_B)];
        let summary = orchestrator.run_cycle(&cancel).await.unwrap();

        assert_eq!(summary.failures, 1);
        assert_eq!(summary.users.updated, 0);
        assert!(cp.emails("panel.test-vmess-1").is_empty());
        assert_eq!(orchestrator.store().users.get_active().count(), 0);

        // Reverting must not look like "no change".
        cp.allow_user("1@panel.test");
        panel.0.lock().unwrap().users = vec![vmess_user(PANEL, 1, 1, UUID_A)];
        cp.clear_calls();
        let summary = orchestrator.run_cycle(&cancel).await.unwrap();

        assert_eq!(summary.failures, 0);
        assert_eq!(summary.users.created, 1);
        assert_eq!(cp.calls(), vec!["add_user panel.test-vmess-1 1@panel.test"]);
        let stored = orchestrator
            .store()
            .users
            .get(&vmess_user(PANEL, 1, 1, UUID_A).key())
            .unwrap();
        assert!(!stored.is_deleted);
        assert_eq!(stored.user.credential, Credential::VMess { uuid: UUID_A.to_string() });
    }

    #[tokio::test]
    async fn empty_user_list_removes_every_user() {
        let cp = Arc::new(FakeControlPlane::default());
        let panel = scripted(
            vmess_node(PANEL, 1, 443),
            vec![vmess_user(PANEL, 1, 1, UUID_A), vmess_user(PANEL, 1, 2, UUID_B)],
        );
        let mut orchestrator = remote(&panel, &cp);
        let cancel = CancellationToken::new();
        orchestrator.run_cycle(&cancel).await.unwrap();

        panel.0.lock().unwrap().users.clear();
        let summary = orchestrator.run_cycle(&cancel).await.unwrap();

        assert_eq!(summary.users.deleted, 2);
        assert!(cp.emails("panel.test-vmess-1").is_empty());
        assert_eq!(cp.inbound_tags(), vec!["panel.test-vmess-1"]);
        assert_eq!(orchestrator.store().users.get_active().count(), 0);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_store_and_engine_alone() {
        let cp = Arc::new(FakeControlPlane::default());
        let panel = scripted(vmess_node(PANEL, 1, 443), vec![vmess_user(PANEL, 1, 1, UUID_A)]);
        let mut orchestrator = remote(&panel, &cp);
        let cancel = CancellationToken::new();
        orchestrator.run_cycle(&cancel).await.unwrap();

        panel.0.lock().unwrap().fetch_fails = true;
        cp.clear_calls();
        let result = orchestrator.run_cycle(&cancel).await;

        assert!(matches!(result, Err(CycleError::Fetch(PanelError::Status { status: 502, .. }))));
        assert!(cp.calls().is_empty());
        assert_eq!(orchestrator.store().nodes.get_active().count(), 1);
        assert_eq!(orchestrator.store().users.get_active().count(), 1);
    }

    #[tokio::test]
    async fn port_conflict_only_blocks_that_node() {
        let cp = Arc::new(FakeControlPlane::default());
        cp.occupy_port(443);
        let mut orchestrator = Orchestrator::new(
            local(
                vec![vmess_node(LOCAL_PANEL, 1, 443), vmess_node(LOCAL_PANEL, 2, 8443)],
                vec![
                    vmess_user(LOCAL_PANEL, 1, 1, UUID_A),
                    vmess_user(LOCAL_PANEL, 2, 2, UUID_B),
                ],
            ),
            cp.clone(),
            Box::new(FixedDelay(Duration::from_millis(1))),
        );
        let cancel = CancellationToken::new();

        let summary = orchestrator.run_cycle(&cancel).await.unwrap();

        assert_eq!(summary.nodes.created, 1);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(cp.inbound_tags(), vec!["local-vmess-2"]);
        assert_eq!(cp.emails("local-vmess-2"), vec!["2@local"]);

        // Still pending, so the next cycle tries again.
        let summary = orchestrator.run_cycle(&cancel).await.unwrap();
        assert_eq!(summary.failures, 1);
        assert!(!orchestrator.store().nodes.is_active(&vmess_node(LOCAL_PANEL, 1, 443).key()));
    }

    #[tokio::test]
    async fn reordered_history_converges_to_the_same_engine_state() {
        let node_a = vmess_node(LOCAL_PANEL, 1, 1000);
        let node_a2 = vmess_node(LOCAL_PANEL, 1, 2000);
        let node_b = vmess_node(LOCAL_PANEL, 2, 3000);
        let users = vec![
            vmess_user(LOCAL_PANEL, 1, 1, UUID_A),
            vmess_user(LOCAL_PANEL, 2, 2, UUID_B),
        ];
        let cancel = CancellationToken::new();

        let stepped = Arc::new(FakeControlPlane::default());
        let mut orchestrator = Orchestrator::new(
            local(vec![node_a, node_b.clone()], users.clone()),
            stepped.clone(),
            Box::new(FixedDelay(Duration::from_millis(1))),
        );
        orchestrator.run_cycle(&cancel).await.unwrap();
        orchestrator.source = local(vec![node_b.clone(), node_a2.clone()], users.clone());
        orchestrator.run_cycle(&cancel).await.unwrap();

        let direct = Arc::new(FakeControlPlane::default());
        let mut orchestrator = Orchestrator::new(
            local(vec![node_b, node_a2], users),
            direct.clone(),
            Box::new(FixedDelay(Duration::from_millis(1))),
        );
        orchestrator.run_cycle(&cancel).await.unwrap();

        assert_eq!(stepped.inbound_tags(), direct.inbound_tags());
        for tag in direct.inbound_tags() {
            assert_eq!(stepped.port(&tag), direct.port(&tag));
            assert_eq!(stepped.emails(&tag), direct.emails(&tag));
        }
    }

    #[tokio::test]
    async fn engine_state_from_a_previous_run_counts_as_converged() {
        let cp = Arc::new(FakeControlPlane::default());
        let node = vmess_node(LOCAL_PANEL, 1, 443);
        let user = vmess_user(LOCAL_PANEL, 1, 1, UUID_A);
        cp.add_inbound(&node).await.unwrap();
        cp.add_user(&node, &user).await.unwrap();

        let mut orchestrator = Orchestrator::new(
            local(vec![node], vec![user]),
            cp.clone(),
            Box::new(FixedDelay(Duration::from_millis(1))),
        );
        let summary = orchestrator.run_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(summary.failures, 0);
        assert_eq!(summary.nodes.created, 1);
        assert_eq!(summary.users.created, 1);
        assert_eq!(orchestrator.store().users.get_active().count(), 1);
    }

    #[tokio::test]
    async fn reports_traffic_then_resets_with_carry() {
        let cp = Arc::new(FakeControlPlane::default());
        let panel = scripted(vmess_node(PANEL, 1, 443), vec![vmess_user(PANEL, 1, 1, UUID_A)]);
        let mut orchestrator = remote(&panel, &cp);
        let cancel = CancellationToken::new();
        orchestrator.run_cycle(&cancel).await.unwrap();

        cp.add_traffic("1@panel.test", 100, 200);
        cp.add_late_traffic("1@panel.test", 5, 7);
        cp.set_online("1@panel.test", &["10.0.0.1"]);
        let summary = orchestrator.run_cycle(&cancel).await.unwrap();
        assert_eq!(summary.reported, 1);

        let key = vmess_user(PANEL, 1, 1, UUID_A).key();
        assert_eq!(orchestrator.store().users.carry(&key), (5, 7));
        assert_eq!(cp.counter("user>>>1@panel.test>>>traffic>>>uplink"), Some(0));

        cp.add_traffic("1@panel.test", 1, 1);
        orchestrator.run_cycle(&cancel).await.unwrap();
        assert_eq!(orchestrator.store().users.carry(&key), (0, 0));

        let state = panel.0.lock().unwrap();
        assert_eq!(
            state.traffic,
            vec![
                vec![TrafficRecord { user_id: 1, upload: 100, download: 200 }],
                vec![TrafficRecord { user_id: 1, upload: 6, download: 8 }],
            ]
        );
        let expected = OnlineIpRecord {
            user_id: 1,
            ips: vec!["10.0.0.1".to_string()],
        };
        assert_eq!(state.online[0], vec![expected]);
        assert_eq!(state.node_reports, 3);
    }

    #[tokio::test]
    async fn rejected_report_keeps_counters() {
        let cp = Arc::new(FakeControlPlane::default());
        let panel = scripted(vmess_node(PANEL, 1, 443), vec![vmess_user(PANEL, 1, 1, UUID_A)]);
        let mut orchestrator = remote(&panel, &cp);
        let cancel = CancellationToken::new();
        orchestrator.run_cycle(&cancel).await.unwrap();

        cp.add_traffic("1@panel.test", 100, 200);
        panel.0.lock().unwrap().traffic_fails = true;
        let summary = orchestrator.run_cycle(&cancel).await.unwrap();

        assert_eq!(summary.reported, 0);
        assert_eq!(cp.counter("user>>>1@panel.test>>>traffic>>>uplink"), Some(100));

        panel.0.lock().unwrap().traffic_fails = false;
        cp.add_traffic("1@panel.test", 1, 0);
        orchestrator.run_cycle(&cancel).await.unwrap();
        assert_eq!(
            panel.0.lock().unwrap().traffic,
            vec![vec![TrafficRecord { user_id: 1, upload: 101, download: 200 }]]
        );
    }

    #[tokio::test]
    async fn local_mode_never_touches_counters() {
        let cp = Arc::new(FakeControlPlane::default());
        let mut orchestrator = Orchestrator::new(
            local(
                vec![vmess_node(LOCAL_PANEL, 1, 443)],
                vec![vmess_user(LOCAL_PANEL, 1, 1, UUID_A)],
            ),
            cp.clone(),
            Box::new(FixedDelay(Duration::from_millis(1))),
        );
        let cancel = CancellationToken::new();
        orchestrator.run_cycle(&cancel).await.unwrap();
        cp.add_traffic("1@local", 10, 10);

        let summary = orchestrator.run_cycle(&cancel).await.unwrap();

        assert_eq!(summary.reported, 0);
        assert_eq!(cp.counter("user>>>1@local>>>traffic>>>uplink"), Some(10));
    }

    #[tokio::test]
    async fn shadowsocks_carrier_end_to_end() {
        use axum::routing::{get, post};
        use axum::{Json, Router};
        use reqwest::Client;
        use serde_json::{Value, json};
        use url::Url;

        use crate::panel::SsPanelAdapter;
        use crate::panel::testing::serve;

        let reports: Arc<Mutex<Vec<Value>>> = Arc::default();
        let captured = reports.clone();
        let app = Router::new()
            .route(
                "/mod_mu/nodes/{id}/info",
                get(|| async { Json(json!({"ret": 1, "data": {"sort": 0, "server": "1.1.1.1"}})) })
                    .post(|| async { Json(json!({"ret": 1, "data": "ok"})) }),
            )
            .route(
                "/mod_mu/users",
                get(|| async {
                    Json(json!({"ret": 1, "data": [
                        {"id": 1, "passwd": "p1", "method": "aes-128-gcm", "is_multi_user": 0, "port": 0},
                        {"id": 2, "passwd": "p2", "method": "aes-256-gcm", "is_multi_user": 1, "port": 14001}
                    ]}))
                }),
            )
            .route(
                "/mod_mu/users/traffic",
                post(move |Json(body): Json<Value>| async move {
                    captured.lock().unwrap().push(body);
                    Json(json!({"ret": 1, "data": "ok"}))
                }),
            );
        let base = serve(app).await;
        let adapter = SsPanelAdapter::new(
            Client::new(),
            Url::parse(&base).unwrap(),
            "k".to_string(),
            3,
        )
        .unwrap();
        let panel_name = adapter.panel_name().to_string();

        let cp = Arc::new(FakeControlPlane::default());
        let mut orchestrator = Orchestrator::new(
            Source::Remote(Box::new(adapter)),
            cp.clone(),
            Box::new(FixedDelay(Duration::from_millis(1))),
        );
        let cancel = CancellationToken::new();
        let summary = orchestrator.run_cycle(&cancel).await.unwrap();

        let tag = format!("{panel_name}-shadowsocks-3");
        assert_eq!(summary.failures, 0, "{summary:?}");
        assert_eq!(cp.inbound_tags(), vec![tag.clone()]);
        assert_eq!(cp.port(&tag), Some(14001));
        assert_eq!(cp.emails(&tag).len(), 2);
        let stored = orchestrator.store().nodes.get_active().next().unwrap();
        assert_eq!(stored.cipher_method(), Some("aes-256-gcm"));

        cp.add_traffic(&format!("1@{panel_name}"), 3, 4);
        orchestrator.run_cycle(&cancel).await.unwrap();
        assert_eq!(
            reports.lock().unwrap().as_slice(),
            &[json!({"data": [{"user_id": 1, "u": 3, "d": 4}]})]
        );
    }

    struct CountingPacer {
        cycles: Arc<AtomicUsize>,
        stop_after: usize,
    }

    #[async_trait]
    impl Pacer for CountingPacer {
        async fn pause(&self, cancel: &CancellationToken) {
            if self.cycles.fetch_add(1, Ordering::SeqCst) + 1 >= self.stop_after {
                cancel.cancel();
            }
        }
    }

    #[tokio::test]
    async fn run_stops_when_cancelled() {
        let cp = Arc::new(FakeControlPlane::default());
        let panel = scripted(vmess_node(PANEL, 1, 443), Vec::new());
        panel.0.lock().unwrap().fetch_fails = true;
        let cycles = Arc::new(AtomicUsize::new(0));

        let mut orchestrator = Orchestrator::new(
            Source::Remote(Box::new(panel)),
            cp,
            Box::new(CountingPacer {
                cycles: cycles.clone(),
                stop_after: 3,
            }),
        );
        tokio::time::timeout(Duration::from_secs(5), orchestrator.run(CancellationToken::new()))
            .await
            .unwrap();

        assert_eq!(cycles.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_applying() {
        let cp = Arc::new(FakeControlPlane::default());
        let panel = scripted(vmess_node(PANEL, 1, 443), vec![vmess_user(PANEL, 1, 1, UUID_A)]);
        let mut orchestrator = remote(&panel, &cp);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(orchestrator.run_cycle(&cancel).await, Err(CycleError::Cancelled)));
        assert!(cp.calls().is_empty());
    }
}
