//! Menu-in-menu replication.
//!
//! Mirrors a window of an upstream server's tree into a submenu of the local
//! tree. Remote id `r` (for `r < maximum_range`) lives locally at
//! `r + id_offset`; remote top-level items hang under `sub_menu_id`.
//!
//! Upstream boots and changes flow into the local server, which broadcasts
//! them to local sessions. Local edits on replicated ids are sent upstream
//! and rolled back if the upstream server refuses them.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use dashmap::DashMap;
use menu_remote::{
    AckStatus, AuthStatus, BootItem, BootstrapMode, ChangeType, ConnectorListener,
    CorrelationId, MenuCommand, RemoteConnector,
};
use menu_tree::{BooleanNaming, MenuId, MenuItem, MenuState, MenuValue};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ServerError;
use crate::server::{MenuManagerListener, MenuManagerServer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationMode {
    /// Structure changes are not announced.
    #[default]
    Silently,
    /// Local sessions are re-booted after every upstream boot.
    Notify,
    /// As `Notify`, plus a read-only "connected" item in the submenu.
    AddStatusItem,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuInMenuDefinition {
    pub name: String,
    pub id_offset: u32,
    pub maximum_range: u32,
    pub sub_menu_id: MenuId,
    pub replication_mode: ReplicationMode,
}

impl MenuInMenuDefinition {
    pub fn new(
        name: impl Into<String>,
        id_offset: u32,
        maximum_range: u32,
        sub_menu_id: MenuId,
        replication_mode: ReplicationMode,
    ) -> Result<Self, ServerError> {
        let name = name.into();
        if maximum_range == 0 || id_offset.checked_add(maximum_range).is_none() {
            return Err(ServerError::InvalidReplicationRange {
                name,
                id_offset,
                maximum_range,
            });
        }
        Ok(Self {
            name,
            id_offset,
            maximum_range,
            sub_menu_id,
            replication_mode,
        })
    }

    /// Local id of the connection status item.
    pub fn status_item_id(&self) -> MenuId {
        MenuId(self.maximum_range - 1 + self.id_offset)
    }

    fn replicates(&self, remote: MenuId) -> bool {
        if remote.is_root() || remote.0 >= self.maximum_range {
            return false;
        }
        !(self.replication_mode == ReplicationMode::AddStatusItem
            && remote.0 == self.maximum_range - 1)
    }

    /// Local id for a remote item, if it falls inside the window.
    pub fn to_local(&self, remote: MenuId) -> Option<MenuId> {
        self.replicates(remote).then(|| remote.offset(self.id_offset))
    }

    /// Remote id for a local item, if it is one of the replicated ids.
    pub fn to_remote(&self, local: MenuId) -> Option<MenuId> {
        local
            .checked_sub(self.id_offset)
            .filter(|remote| self.replicates(*remote))
    }

    fn parent_to_local(&self, remote_parent: MenuId) -> Option<MenuId> {
        if remote_parent.is_root() {
            Some(self.sub_menu_id)
        } else {
            self.to_local(remote_parent)
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MenuInMenu {
    definition: MenuInMenuDefinition,
    server: Arc<MenuManagerServer>,
    connector: Arc<RemoteConnector>,
    /// Local ids currently mirrored from upstream.
    replicated: Mutex<HashSet<MenuId>>,
    /// Local ids booted since the last `Bootstrap(Start)`.
    seen: Mutex<HashSet<MenuId>>,
    /// Last value agreed with upstream, per local id.
    last_known: DashMap<MenuId, MenuValue>,
    /// Local ids being written from upstream; their change events stay local.
    applying: Mutex<HashSet<MenuId>>,
    me: Weak<MenuInMenu>,
}

impl MenuInMenu {
    /// Link `connector` into `server`'s tree under `definition.sub_menu_id`.
    /// Registers as a listener on both; call `start` to begin connecting.
    pub fn new(
        definition: MenuInMenuDefinition,
        server: Arc<MenuManagerServer>,
        connector: Arc<RemoteConnector>,
    ) -> Result<Arc<Self>, ServerError> {
        let tree = server.tree();
        let anchor = definition.sub_menu_id;
        if !tree.get_item(anchor).is_some_and(|i| i.is_sub_menu()) {
            return Err(ServerError::NotASubMenu(anchor));
        }

        if definition.replication_mode == ReplicationMode::AddStatusItem {
            let status_id = definition.status_item_id();
            if !tree.contains(status_id) {
                let item = MenuItem::boolean(
                    status_id,
                    format!("{} connected", definition.name),
                    BooleanNaming::YesNo,
                )
                .with_read_only(true);
                tree.add_item(anchor, item)?;
                tree.change_state(status_id, MenuState::new(MenuValue::Bool(false)));
            }
        }

        let this = Arc::new_cyclic(|me| Self {
            definition,
            server: Arc::clone(&server),
            connector: Arc::clone(&connector),
            replicated: Mutex::new(HashSet::new()),
            seen: Mutex::new(HashSet::new()),
            last_known: DashMap::new(),
            applying: Mutex::new(HashSet::new()),
            me: me.clone(),
        });
        server.add_listener(&this);
        connector.add_listener(&this);
        Ok(this)
    }

    pub fn definition(&self) -> &MenuInMenuDefinition {
        &self.definition
    }

    pub fn connector(&self) -> &Arc<RemoteConnector> {
        &self.connector
    }

    /// Local ids currently mirrored.
    pub fn replicated(&self) -> Vec<MenuId> {
        let mut ids: Vec<MenuId> = lock(&self.replicated).iter().copied().collect();
        ids.sort();
        ids
    }

    pub fn start(&self) -> JoinHandle<()> {
        info!(
            link = %self.definition.name,
            offset = self.definition.id_offset,
            range = self.definition.maximum_range,
            "starting replication"
        );
        self.connector.start()
    }

    pub fn stop(&self) {
        self.connector.stop();
        self.set_status(false);
    }

    fn apply_boot(&self, boot: &BootItem) {
        let remote = boot.item.id;
        let Some(local) = self.definition.to_local(remote) else {
            debug!(link = %self.definition.name, item = %remote, "boot outside replication range");
            return;
        };
        let Some(parent) = self.definition.parent_to_local(boot.parent_id) else {
            debug!(link = %self.definition.name, item = %remote, parent = %boot.parent_id, "boot parent outside replication range");
            return;
        };

        let tree = self.server.tree();
        let item = boot.item.clone().with_id(local);
        let placed = if !tree.contains(local) {
            tree.add_item(parent, item)
        } else if tree.find_parent(local).map(|p| p.id) == Some(parent) {
            tree.replace_item(item)
        } else {
            // moved upstream; its children follow in this boot
            tree.remove_item(local).and_then(|_| tree.add_item(parent, item))
        };
        if let Err(e) = placed {
            warn!(link = %self.definition.name, item = %local, error = %e, "replicated item not placed");
            return;
        }

        tree.change_state(local, MenuState::new(boot.value.clone()));
        self.last_known.insert(local, boot.value.clone());
        lock(&self.replicated).insert(local);
        lock(&self.seen).insert(local);
    }

    fn finish_boot(&self) {
        let tree = self.server.tree();
        let stale: Vec<MenuId> = {
            let seen = lock(&self.seen);
            lock(&self.replicated)
                .iter()
                .filter(|id| !seen.contains(id))
                .copied()
                .collect()
        };
        for id in &stale {
            if tree.contains(*id) {
                if let Err(e) = tree.remove_item(*id) {
                    debug!(item = %id, error = %e, "stale item not removed");
                }
            }
            self.last_known.remove(id);
        }
        let kept = {
            let mut replicated = lock(&self.replicated);
            replicated.retain(|id| tree.contains(*id));
            replicated.len()
        };
        info!(
            link = %self.definition.name,
            items = kept,
            removed = stale.len(),
            "replicated boot complete"
        );

        if self.definition.replication_mode != ReplicationMode::Silently {
            self.server.tree_structure_changed(self.definition.sub_menu_id);
        }
    }

    fn apply_upstream_change(&self, remote: MenuId, change_type: ChangeType, raw: &str) -> AckStatus {
        let Some(local) = self.definition.to_local(remote) else {
            return AckStatus::IdNotFound;
        };
        let tree = self.server.tree();
        let Some(item) = tree.get_item(local) else {
            debug!(item = %local, "change for an item not yet booted");
            return AckStatus::IdNotFound;
        };
        let parsed = match change_type {
            ChangeType::Absolute => item.parse_value(raw),
            ChangeType::Delta => raw
                .trim()
                .parse::<i32>()
                .map_err(|_| menu_tree::TreeError::InvalidValue {
                    id: local,
                    raw: raw.to_string(),
                })
                .and_then(|delta| {
                    let current = tree.get_state(local).map(|s| s.value);
                    item.apply_delta(current.as_ref(), delta)
                }),
        };
        match parsed {
            Ok(value) => {
                self.last_known.insert(local, value.clone());
                if self.write_local(local, value) {
                    AckStatus::Success
                } else {
                    AckStatus::IdNotFound
                }
            }
            Err(e) => {
                warn!(link = %self.definition.name, item = %local, error = %e, "upstream change not applied");
                AckStatus::ValueRangeWarning
            }
        }
    }

    /// Write through the local server without sending the change back up.
    fn write_local(&self, local: MenuId, value: MenuValue) -> bool {
        lock(&self.applying).insert(local);
        let result = self.server.update_menu_item(local, value);
        lock(&self.applying).remove(&local);
        match result {
            Ok(()) => true,
            Err(e) => {
                debug!(item = %local, error = %e, "local write failed");
                false
            }
        }
    }

    fn forward(&self, local: MenuId, remote: MenuId) {
        let Some(state) = self.server.tree().get_state(local) else {
            return;
        };
        let previous = self.last_known.get(&local).map(|v| v.value().clone());
        let sent = self
            .connector
            .send_change(remote, ChangeType::Absolute, state.value.to_wire());
        match sent {
            Ok((correlation, waiter)) => {
                debug!(link = %self.definition.name, local = %local, remote = %remote, %correlation, "change forwarded upstream");
                self.last_known.insert(local, state.value);
                self.await_ack(local, correlation, waiter, previous);
            }
            Err(e) => {
                warn!(link = %self.definition.name, item = %local, error = %e, "change not forwarded, rolling back");
                self.roll_back(local, previous);
            }
        }
    }

    fn await_ack(
        &self,
        local: MenuId,
        correlation: CorrelationId,
        waiter: oneshot::Receiver<AckStatus>,
        previous: Option<MenuValue>,
    ) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(%correlation, "no runtime, acknowledgement not awaited");
            return;
        };
        let me = self.me.clone();
        runtime.spawn(async move {
            match waiter.await {
                Ok(AckStatus::Success) => {}
                Ok(status) => {
                    warn!(item = %local, %correlation, code = status.code(), "upstream refused change, rolling back");
                    if let Some(this) = me.upgrade() {
                        this.roll_back(local, previous);
                    }
                }
                Err(_) => debug!(item = %local, %correlation, "acknowledgement abandoned"),
            }
        });
    }

    fn roll_back(&self, local: MenuId, previous: Option<MenuValue>) {
        let Some(previous) = previous else {
            return;
        };
        self.last_known.insert(local, previous.clone());
        self.write_local(local, previous);
    }

    fn set_status(&self, connected: bool) {
        if self.definition.replication_mode != ReplicationMode::AddStatusItem {
            return;
        }
        let id = self.definition.status_item_id();
        if let Err(e) = self.server.update_menu_item(id, MenuValue::Bool(connected)) {
            debug!(item = %id, error = %e, "status item not updated");
        }
    }
}

impl ConnectorListener for MenuInMenu {
    fn on_command(&self, cmd: &MenuCommand) {
        if let Some(boot) = cmd.as_boot() {
            self.apply_boot(boot);
            return;
        }
        match cmd {
            MenuCommand::Bootstrap {
                mode: BootstrapMode::Start,
            } => {
                lock(&self.seen).clear();
            }
            MenuCommand::Bootstrap {
                mode: BootstrapMode::End,
            } => self.finish_boot(),
            _ => {}
        }
    }

    fn on_change(&self, item_id: MenuId, change_type: ChangeType, value: &str) -> AckStatus {
        self.apply_upstream_change(item_id, change_type, value)
    }

    fn on_status(&self, status: AuthStatus) {
        match status {
            AuthStatus::ConnectionReady => self.set_status(true),
            AuthStatus::ConnectionFailed | AuthStatus::FailedAuth => self.set_status(false),
            _ => {}
        }
    }
}

impl MenuManagerListener for MenuInMenu {
    fn menu_item_changed(&self, item: &MenuItem, _remote_change: bool) {
        if lock(&self.applying).contains(&item.id) {
            return;
        }
        if !lock(&self.replicated).contains(&item.id) {
            return;
        }
        if let Some(remote) = self.definition.to_remote(item.id) {
            self.forward(item.id, remote);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::OpenAuthenticator;
    use crate::config::ManagerConfig;
    use futures::future::BoxFuture;
    use menu_remote::{
        Connection, ConnectorIdentity, ConnectorSettings, Dialer, RemoteError,
    };
    use menu_tree::MenuTree;
    use std::time::Duration;
    use tokio::sync::{mpsc, watch};
    use uuid::Uuid;

    const ANCHOR: MenuId = MenuId(100);

    struct OnceDialer {
        channel: Mutex<Option<(Connection, mpsc::Receiver<MenuCommand>)>>,
    }

    impl Dialer for OnceDialer {
        fn dial(&self) -> BoxFuture<'_, Result<(Connection, mpsc::Receiver<MenuCommand>), RemoteError>> {
            Box::pin(async move { lock(&self.channel).take().ok_or(RemoteError::NotConnected) })
        }

        fn describe(&self) -> String {
            "upstream".into()
        }
    }

    /// The upstream side, driven by hand.
    struct Upstream {
        from_link: mpsc::Receiver<MenuCommand>,
        to_link: mpsc::Sender<MenuCommand>,
    }

    impl Upstream {
        async fn send(&self, cmd: MenuCommand) {
            self.to_link.send(cmd).await.unwrap();
        }

        /// Next command other than a heartbeat or join.
        async fn next(&mut self) -> MenuCommand {
            loop {
                let cmd = tokio::time::timeout(Duration::from_secs(5), self.from_link.recv())
                    .await
                    .expect("nothing from link")
                    .expect("link closed");
                if !matches!(cmd, MenuCommand::Heartbeat { .. } | MenuCommand::Join { .. }) {
                    return cmd;
                }
            }
        }

        fn pending_changes(&mut self) -> usize {
            let mut n = 0;
            while let Ok(cmd) = self.from_link.try_recv() {
                if matches!(cmd, MenuCommand::Change { .. }) {
                    n += 1;
                }
            }
            n
        }
    }

    fn local_server() -> Arc<MenuManagerServer> {
        let tree = MenuTree::new();
        tree.add_item(MenuId::ROOT, MenuItem::sub_menu(ANCHOR, "Pump")).unwrap();
        MenuManagerServer::new(Arc::new(tree), Arc::new(OpenAuthenticator), ManagerConfig::default())
    }

    fn link(server: &Arc<MenuManagerServer>, mode: ReplicationMode) -> (Arc<MenuInMenu>, Upstream) {
        let (conn, from_link) = Connection::new("upstream", 64);
        let (to_link, inbound) = mpsc::channel(64);
        let connector = RemoteConnector::new(
            OnceDialer {
                channel: Mutex::new(Some((conn, inbound))),
            },
            ConnectorIdentity::new("replica", Uuid::new_v4()),
            ConnectorSettings::default(),
        );
        let definition = MenuInMenuDefinition::new("pump", 10000, 500, ANCHOR, mode).unwrap();
        let mim = MenuInMenu::new(definition, Arc::clone(server), connector).unwrap();
        (mim, Upstream { from_link, to_link })
    }

    fn boot(parent: MenuId, item: MenuItem, value: MenuValue) -> MenuCommand {
        MenuCommand::boot_for(parent, item, value).unwrap()
    }

    async fn wait_for(rx: &mut watch::Receiver<AuthStatus>, want: AuthStatus) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
            .await
            .expect("status timeout")
            .expect("status channel closed");
    }

    async fn wait_value(server: &MenuManagerServer, id: MenuId, want: MenuValue) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if server.tree().get_state(id).map(|s| s.value) == Some(want.clone()) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("value never arrived");
    }

    async fn handshake_and_boot(mim: &MenuInMenu, upstream: &mut Upstream, items: Vec<MenuCommand>) {
        let mut status = mim.connector().subscribe_status();
        upstream
            .send(MenuCommand::ack(CorrelationId::EMPTY, AckStatus::Success))
            .await;
        upstream.send(MenuCommand::Bootstrap { mode: BootstrapMode::Start }).await;
        for item in items {
            upstream.send(item).await;
        }
        upstream.send(MenuCommand::Bootstrap { mode: BootstrapMode::End }).await;
        wait_for(&mut status, AuthStatus::ConnectionReady).await;
    }

    #[test]
    fn ids_map_through_the_window() {
        let def = MenuInMenuDefinition::new("p", 10000, 500, ANCHOR, ReplicationMode::AddStatusItem).unwrap();
        assert_eq!(def.to_local(MenuId(5)), Some(MenuId(10005)));
        assert_eq!(def.to_local(MenuId(500)), None);
        assert_eq!(def.to_local(MenuId(499)), None);
        assert_eq!(def.status_item_id(), MenuId(10499));
        assert_eq!(def.to_remote(MenuId(10005)), Some(MenuId(5)));
        assert_eq!(def.to_remote(MenuId(42)), None);
        assert_eq!(def.parent_to_local(MenuId::ROOT), Some(ANCHOR));

        let plain = MenuInMenuDefinition { replication_mode: ReplicationMode::Notify, ..def };
        assert_eq!(plain.to_local(MenuId(499)), Some(MenuId(10499)));
        assert!(MenuInMenuDefinition::new("p", 0, 0, ANCHOR, ReplicationMode::Silently).is_err());
    }

    #[test]
    fn anchor_must_be_a_submenu() {
        let tree = MenuTree::new();
        tree.add_item(MenuId::ROOT, MenuItem::action(MenuId(3), "Go")).unwrap();
        let server =
            MenuManagerServer::new(Arc::new(tree), Arc::new(OpenAuthenticator), ManagerConfig::default());
        let connector = RemoteConnector::new(
            OnceDialer { channel: Mutex::new(None) },
            ConnectorIdentity::new("replica", Uuid::new_v4()),
            ConnectorSettings::default(),
        );
        let def = MenuInMenuDefinition::new("p", 100, 10, MenuId(3), ReplicationMode::Silently).unwrap();
        assert!(matches!(
            MenuInMenu::new(def, server, connector),
            Err(ServerError::NotASubMenu(MenuId(3)))
        ));
    }

    #[tokio::test]
    async fn remote_boot_lands_under_the_anchor_and_edits_flow_upstream() {
        let server = local_server();
        let (mim, mut upstream) = link(&server, ReplicationMode::Notify);
        let task = mim.start();

        handshake_and_boot(
            &mim,
            &mut upstream,
            vec![
                boot(MenuId::ROOT, MenuItem::analog(MenuId(5), "Pressure", 100), MenuValue::Int(7)),
                boot(MenuId::ROOT, MenuItem::sub_menu(MenuId(6), "Valves"), MenuValue::Empty),
                boot(MenuId(6), MenuItem::boolean(MenuId(8), "Inlet", BooleanNaming::OnOff), MenuValue::Bool(true)),
                boot(MenuId::ROOT, MenuItem::action(MenuId(700), "Outside"), MenuValue::Empty),
            ],
        )
        .await;

        let tree = server.tree();
        assert_eq!(tree.find_parent(MenuId(10005)).map(|p| p.id), Some(ANCHOR));
        assert_eq!(tree.find_parent(MenuId(10008)).map(|p| p.id), Some(MenuId(10006)));
        assert_eq!(tree.get_state(MenuId(10005)).unwrap().value, MenuValue::Int(7));
        assert!(!tree.contains(MenuId(10700)));
        assert_eq!(mim.replicated(), vec![MenuId(10005), MenuId(10006), MenuId(10008)]);

        server.update_menu_item(MenuId(10005), MenuValue::Int(9)).unwrap();
        match upstream.next().await {
            MenuCommand::Change {
                item_id,
                change_type,
                value,
                correlation,
            } => {
                assert_eq!(item_id, MenuId(5));
                assert_eq!(change_type, ChangeType::Absolute);
                assert_eq!(value, "9");
                assert!(!correlation.is_empty());
                upstream.send(MenuCommand::ack(correlation, AckStatus::Success)).await;
            }
            other => panic!("unexpected {other:?}"),
        }

        mim.stop();
        let _ = task.await;
    }

    #[tokio::test]
    async fn refused_edits_roll_back() {
        let server = local_server();
        let (mim, mut upstream) = link(&server, ReplicationMode::Silently);
        let task = mim.start();
        handshake_and_boot(
            &mim,
            &mut upstream,
            vec![boot(MenuId::ROOT, MenuItem::analog(MenuId(5), "Pressure", 100), MenuValue::Int(7))],
        )
        .await;

        server.update_menu_item(MenuId(10005), MenuValue::Int(90)).unwrap();
        let MenuCommand::Change { correlation, .. } = upstream.next().await else {
            panic!("expected a change");
        };
        upstream
            .send(MenuCommand::ack(correlation, AckStatus::ValueRangeWarning))
            .await;

        wait_value(&server, MenuId(10005), MenuValue::Int(7)).await;
        // the rollback itself is not forwarded
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(upstream.pending_changes(), 0);

        mim.stop();
        let _ = task.await;
    }

    #[tokio::test]
    async fn upstream_changes_apply_locally_without_echo() {
        let server = local_server();
        let (mim, mut upstream) = link(&server, ReplicationMode::Silently);
        let task = mim.start();
        handshake_and_boot(
            &mim,
            &mut upstream,
            vec![boot(MenuId::ROOT, MenuItem::analog(MenuId(5), "Pressure", 100), MenuValue::Int(7))],
        )
        .await;

        upstream
            .send(MenuCommand::Change {
                correlation: CorrelationId::EMPTY,
                item_id: MenuId(5),
                change_type: ChangeType::Absolute,
                value: "11".into(),
            })
            .await;

        wait_value(&server, MenuId(10005), MenuValue::Int(11)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(upstream.pending_changes(), 0);

        mim.stop();
        let _ = task.await;
    }

    fn pushed(correlation: u32, item: u32, value: &str) -> MenuCommand {
        MenuCommand::Change {
            correlation: CorrelationId(correlation),
            item_id: MenuId(item),
            change_type: ChangeType::Absolute,
            value: value.into(),
        }
    }

    #[tokio::test]
    async fn correlated_upstream_changes_are_acknowledged() {
        let server = local_server();
        let (mim, mut upstream) = link(&server, ReplicationMode::Silently);
        let task = mim.start();
        handshake_and_boot(
            &mim,
            &mut upstream,
            vec![boot(MenuId::ROOT, MenuItem::analog(MenuId(5), "Pressure", 100), MenuValue::Int(7))],
        )
        .await;

        upstream.send(pushed(31, 5, "12")).await;
        assert_eq!(upstream.next().await, MenuCommand::ack(CorrelationId(31), AckStatus::Success));
        assert_eq!(server.tree().get_state(MenuId(10005)).unwrap().value, MenuValue::Int(12));

        upstream.send(pushed(32, 5, "high")).await;
        assert_eq!(
            upstream.next().await,
            MenuCommand::ack(CorrelationId(32), AckStatus::ValueRangeWarning)
        );

        upstream.send(pushed(33, 700, "1")).await;
        assert_eq!(upstream.next().await, MenuCommand::ack(CorrelationId(33), AckStatus::IdNotFound));
        assert_eq!(server.tree().get_state(MenuId(10005)).unwrap().value, MenuValue::Int(12));

        mim.stop();
        let _ = task.await;
    }

    #[derive(Default)]
    struct StructureRecorder {
        changed: Mutex<Vec<MenuId>>,
    }

    impl MenuManagerListener for StructureRecorder {
        fn tree_structure_changed(&self, id: MenuId) {
            lock(&self.changed).push(id);
        }
    }

    #[tokio::test]
    async fn structure_is_announced_once_per_boot_unless_silent() {
        for (mode, per_boot) in [(ReplicationMode::Notify, 1), (ReplicationMode::Silently, 0)] {
            let server = local_server();
            let recorder = Arc::new(StructureRecorder::default());
            server.add_listener(&recorder);
            let (mim, mut upstream) = link(&server, mode);
            let task = mim.start();

            let items = || {
                vec![
                    boot(MenuId::ROOT, MenuItem::analog(MenuId(5), "Pressure", 100), MenuValue::Int(7)),
                    boot(MenuId::ROOT, MenuItem::sub_menu(MenuId(6), "Valves"), MenuValue::Empty),
                    boot(MenuId(6), MenuItem::action(MenuId(8), "Purge"), MenuValue::Empty),
                ]
            };
            handshake_and_boot(&mim, &mut upstream, items()).await;
            assert_eq!(*lock(&recorder.changed), vec![ANCHOR; per_boot], "{mode:?}");

            // a second boot on the same link
            upstream.send(MenuCommand::Bootstrap { mode: BootstrapMode::Start }).await;
            for item in items() {
                upstream.send(item).await;
            }
            upstream.send(MenuCommand::Bootstrap { mode: BootstrapMode::End }).await;
            let expected = vec![ANCHOR; per_boot * 2];
            tokio::time::timeout(Duration::from_secs(5), async {
                while *lock(&recorder.changed) != expected {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("second boot not announced");
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(*lock(&recorder.changed), expected, "{mode:?}");

            mim.stop();
            let _ = task.await;
        }
    }

    #[tokio::test]
    async fn reboot_drops_items_that_disappeared() {
        let server = local_server();
        let (mim, mut upstream) = link(&server, ReplicationMode::Silently);
        let task = mim.start();
        handshake_and_boot(
            &mim,
            &mut upstream,
            vec![
                boot(MenuId::ROOT, MenuItem::analog(MenuId(5), "Pressure", 100), MenuValue::Int(7)),
                boot(MenuId::ROOT, MenuItem::action(MenuId(9), "Flush"), MenuValue::Empty),
            ],
        )
        .await;
        assert!(server.tree().contains(MenuId(10009)));

        // a second boot on the same channel no longer lists item 9
        upstream.send(MenuCommand::Bootstrap { mode: BootstrapMode::Start }).await;
        upstream
            .send(boot(MenuId::ROOT, MenuItem::analog(MenuId(5), "Pressure", 200), MenuValue::Int(150)))
            .await;
        upstream.send(MenuCommand::Bootstrap { mode: BootstrapMode::End }).await;

        wait_value(&server, MenuId(10005), MenuValue::Int(150)).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.tree().contains(MenuId(10009)) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("stale item kept");
        assert_eq!(server.tree().get_item(MenuId(10005)).unwrap().max_int_value(), Some(200));

        mim.stop();
        let _ = task.await;
    }

    #[tokio::test]
    async fn status_item_follows_the_connection() {
        let server = local_server();
        let (mim, mut upstream) = link(&server, ReplicationMode::AddStatusItem);
        let status_id = mim.definition().status_item_id();
        let status_item = server.tree().get_item(status_id).unwrap();
        assert!(status_item.read_only);
        assert_eq!(status_item.name, "pump connected");
        assert_eq!(server.tree().get_state(status_id).unwrap().value, MenuValue::Bool(false));

        let task = mim.start();
        handshake_and_boot(&mim, &mut upstream, Vec::new()).await;
        assert_eq!(server.tree().get_state(status_id).unwrap().value, MenuValue::Bool(true));

        mim.stop();
        let _ = task.await;
        assert_eq!(server.tree().get_state(status_id).unwrap().value, MenuValue::Bool(false));
    }
}
