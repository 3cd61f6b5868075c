//! BLE Server - 向远端设备暴露 GATT 服务
//!
//! - `start` 时从声明式描述构建 [`AttributeTree`] 并注册到传输层
//! - 读写请求按属性 UUID 分发给树中的处理器，非零 offset 一律回复 invalid offset
//! - CCCD 写入维护每个特征的订阅对端集合，对端断开时从所有集合中清除
//! - 推送调度器每秒运行一次：`epoch_secs % interval == 0` 且有订阅者时调用一次取值回调，
//!   推送给所有订阅者；推送失败的对端在同一轮中被移除
//!
//! 订阅集合只在状态锁内修改。推送本身在锁外进行，失败移除时按订阅代数比对，
//! 对端在推送期间重新订阅不会被误删。

mod transport;
pub mod tree;

pub use transport::{ServerEvent, ServerTransport};
pub use tree::{
    AttributeHandler, AttributeTree, CharacteristicNode, CharacteristicSpec, DescriptorSpec, HandlerResponse,
    NotificationSpec, ServiceSpec,
};

use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::GattError;
use crate::gatt::{
    CCCD_UUID, ConnectionState, DISABLE_NOTIFICATION_VALUE, ENABLE_INDICATION_VALUE,
    ENABLE_NOTIFICATION_VALUE, GattStatus, PeerId, Properties,
};

/// 一个对端对某个特征的订阅
#[derive(Debug, Clone, Copy)]
struct Subscription {
    /// 对端写入的 CCCD 值
    value: [u8; 2],
    generation: u64,
}

#[derive(Default)]
struct ServerState {
    tree: Option<Arc<AttributeTree>>,
    subscribers: HashMap<Uuid, BTreeMap<PeerId, Subscription>>,
    peers: BTreeSet<PeerId>,
    scheduler: Option<CancellationToken>,
    next_generation: u64,
}

impl ServerState {
    fn purge_peer(&mut self, peer: &PeerId) -> usize {
        self.subscribers
            .values_mut()
            .filter_map(|set| set.remove(peer))
            .count()
    }

    /// 对到期/手动推送取订阅者快照
    fn snapshot(&self, characteristic: Uuid) -> Vec<(PeerId, u64)> {
        self.subscribers
            .get(&characteristic)
            .map(|set| {
                set.iter()
                    .map(|(peer, s)| (peer.clone(), s.generation))
                    .collect()
            })
            .unwrap_or_default()
    }
}

struct ServerInner {
    transport: Arc<dyn ServerTransport>,
    state: Mutex<ServerState>,
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        if let Some(token) = self.state.get_mut().scheduler.take() {
            token.cancel();
        }
    }
}

/// 传输层回送事件的入口，不持有服务端所有权
#[derive(Clone)]
pub struct ServerEventSink {
    inner: Weak<ServerInner>,
}

impl ServerEventSink {
    /// 投递事件；服务端已释放时返回 false
    pub fn send(&self, event: ServerEvent) -> bool {
        match self.inner.upgrade() {
            Some(inner) => {
                inner.handle_event(event);
                true
            }
            None => false,
        }
    }
}

/// GATT 服务端，可同时服务多个对端
#[derive(Clone)]
pub struct BleServer {
    inner: Arc<ServerInner>,
}

impl BleServer {
    pub fn new(transport: Arc<dyn ServerTransport>) -> Self {
        let inner = Arc::new(ServerInner {
            transport,
            state: Mutex::new(ServerState::default()),
        });
        inner.transport.bind(ServerEventSink {
            inner: Arc::downgrade(&inner),
        });
        Self { inner }
    }

    pub fn event_sink(&self) -> ServerEventSink {
        ServerEventSink {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn handle_event(&self, event: ServerEvent) {
        self.inner.handle_event(event);
    }

    /// 构建属性树、注册到传输层并启动推送调度器
    pub fn start(&self, services: Vec<ServiceSpec>) -> Result<(), GattError> {
        let inner = &self.inner;
        if inner.state.lock().tree.is_some() {
            return Err(GattError::InvalidState("Server already started".into()));
        }

        let tree = Arc::new(AttributeTree::build(services)?);
        if let Err(e) = inner.transport.open(&tree) {
            error!("Failed to open GATT server: {}", e);
            return Err(GattError::rejected(&e));
        }

        for service in tree.services() {
            debug!("Service: {}", service.uuid);
            for characteristic in tree.service_characteristics(service) {
                debug!(
                    "Characteristic: {} [{}] permissions {}",
                    characteristic.uuid, characteristic.properties, characteristic.permissions
                );
            }
        }

        let mut state = inner.state.lock();
        if state.tree.is_some() {
            drop(state);
            inner.transport.close();
            return Err(GattError::InvalidState("Server already started".into()));
        }
        state.tree = Some(tree);
        inner.start_scheduler(&mut state);
        drop(state);
        info!("GATT server started");
        Ok(())
    }

    /// 停止调度器、注销服务并清空所有订阅（幂等）
    pub fn stop(&self) {
        let was_started = {
            let mut state = self.inner.state.lock();
            if let Some(token) = state.scheduler.take() {
                token.cancel();
            }
            state.subscribers.clear();
            state.peers.clear();
            state.tree.take().is_some()
        };
        if was_started {
            self.inner.transport.close();
            info!("GATT server stopped");
        }
    }

    pub fn is_started(&self) -> bool {
        self.inner.state.lock().tree.is_some()
    }

    /// 当前订阅了某个特征的对端
    pub fn subscribers(&self, characteristic: Uuid) -> Vec<PeerId> {
        self.inner
            .state
            .lock()
            .subscribers
            .get(&characteristic)
            .map(|set| set.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner.state.lock().peers.iter().cloned().collect()
    }

    /// 执行一轮定时推送，返回成功推送的次数
    ///
    /// 调度器每秒以当前 Unix 秒数调用一次。
    pub fn run_notification_tick(&self, epoch_secs: u64) -> usize {
        self.inner.run_notification_tick(epoch_secs)
    }

    /// 立即向某个特征的所有订阅者推送给定值，返回成功推送的对端数
    pub fn notify_now(&self, characteristic: Uuid, value: &[u8]) -> Result<usize, GattError> {
        let (tree, targets) = {
            let state = self.inner.state.lock();
            let Some(tree) = state.tree.clone() else {
                return Err(GattError::InvalidState("Server not started".into()));
            };
            (tree, state.snapshot(characteristic))
        };
        let node = tree
            .characteristic(characteristic)
            .filter(|c| c.notification.is_some())
            .ok_or_else(|| {
                GattError::InvalidArgument(format!(
                    "Characteristic {characteristic} does not support notification"
                ))
            })?;
        Ok(self.inner.push(node, value, targets))
    }
}

impl ServerInner {
    fn start_scheduler(self: &Arc<Self>, state: &mut ServerState) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime, notification scheduler disabled");
            return;
        };

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let weak = Arc::downgrade(self);
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.run_notification_tick(epoch_secs());
                    }
                }
            }
            trace!("Notification scheduler stopped");
        });
        state.scheduler = Some(token);
    }

    fn run_notification_tick(&self, epoch_secs: u64) -> usize {
        let (tree, due) = {
            let state = self.state.lock();
            let Some(tree) = state.tree.clone() else {
                return 0;
            };
            let due: Vec<(Uuid, Vec<(PeerId, u64)>)> = tree
                .notifying()
                .filter(|c| c.is_due(epoch_secs))
                .map(|c| (c.uuid, state.snapshot(c.uuid)))
                .filter(|(_, targets)| !targets.is_empty())
                .collect();
            (tree, due)
        };

        let mut delivered = 0;
        for (uuid, targets) in due {
            let Some(node) = tree.characteristic(uuid) else {
                continue;
            };
            let Some(notification) = node.notification.as_ref() else {
                continue;
            };
            let value = (notification.producer)();
            delivered += self.push(node, &value, targets);
        }
        delivered
    }

    /// 推送给快照中的对端，失败者在返回前从订阅集合移除
    fn push(&self, node: &CharacteristicNode, value: &[u8], targets: Vec<(PeerId, u64)>) -> usize {
        let confirm = node.uses_indication();
        let mut delivered = 0;
        let mut failed = Vec::new();
        for (peer, generation) in targets {
            match self.transport.notify(&peer, node.uuid, value, confirm) {
                Ok(()) => {
                    trace!("Pushed {} bytes of {} to {}", value.len(), node.uuid, peer);
                    delivered += 1;
                }
                Err(e) => {
                    warn!("Failed to notify {} on {}: {}", peer, node.uuid, e);
                    failed.push((peer, generation));
                }
            }
        }

        if !failed.is_empty() {
            let mut state = self.state.lock();
            if let Some(set) = state.subscribers.get_mut(&node.uuid) {
                for (peer, generation) in failed {
                    if set.get(&peer).is_some_and(|s| s.generation == generation) {
                        set.remove(&peer);
                        debug!("Removed subscriber {} from {}", peer, node.uuid);
                    }
                }
            }
        }
        delivered
    }

    fn tree(&self) -> Option<Arc<AttributeTree>> {
        self.state.lock().tree.clone()
    }

    fn respond(&self, peer: &PeerId, request_id: u32, status: GattStatus, offset: u16, value: &[u8]) {
        if let Err(e) = self
            .transport
            .send_response(peer, request_id, status, offset, value)
        {
            error!("Failed to respond to {} (request {}): {}", peer, request_id, e);
        }
    }

    fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::PeerConnectionChanged { peer, state } => {
                self.on_peer_connection_changed(peer, state);
            }
            ServerEvent::CharacteristicReadRequest {
                peer,
                request_id,
                characteristic,
                offset,
            } => {
                debug!("Read request received from {}", peer);
                let (status, value) = self.read_characteristic(&peer, characteristic, offset);
                self.respond(&peer, request_id, status, offset, &value);
            }
            ServerEvent::CharacteristicWriteRequest {
                peer,
                request_id,
                characteristic,
                offset,
                value,
                response_needed,
                prepared,
            } => {
                debug!("Write request received from {}", peer);
                let status = self.write_characteristic(&peer, characteristic, offset, &value, prepared);
                if response_needed || status == GattStatus::INVALID_OFFSET || prepared {
                    self.respond(&peer, request_id, status, offset, &[]);
                }
            }
            ServerEvent::DescriptorReadRequest {
                peer,
                request_id,
                characteristic,
                descriptor,
                offset,
            } => {
                debug!("Descriptor read request received from {}", peer);
                let (status, value) =
                    self.read_descriptor(&peer, characteristic, descriptor, offset);
                self.respond(&peer, request_id, status, offset, &value);
            }
            ServerEvent::DescriptorWriteRequest {
                peer,
                request_id,
                characteristic,
                descriptor,
                offset,
                value,
                response_needed,
                prepared,
            } => {
                debug!("Descriptor write request received from {}", peer);
                let status =
                    self.write_descriptor(&peer, characteristic, descriptor, offset, &value, prepared);
                if response_needed || status == GattStatus::INVALID_OFFSET || prepared {
                    self.respond(&peer, request_id, status, offset, &[]);
                }
            }
            ServerEvent::NotificationSent { peer, status } => {
                if status.is_success() {
                    debug!("Indication acknowledged by {}", peer);
                } else {
                    error!("Indication to {} failed with status: {}", peer, status);
                }
            }
        }
    }

    fn on_peer_connection_changed(&self, peer: PeerId, connection: ConnectionState) {
        let mut state = self.state.lock();
        match connection {
            ConnectionState::Connected => {
                debug!("Device connected: {}", peer);
                state.peers.insert(peer);
            }
            ConnectionState::Disconnected => {
                state.peers.remove(&peer);
                let purged = state.purge_peer(&peer);
                debug!("Device disconnected: {} ({} subscription(s) dropped)", peer, purged);
            }
            ConnectionState::Connecting => {}
        }
    }

    fn read_characteristic(
        &self,
        peer: &PeerId,
        characteristic: Uuid,
        offset: u16,
    ) -> (GattStatus, Vec<u8>) {
        if offset != 0 {
            return (GattStatus::INVALID_OFFSET, Vec::new());
        }
        let Some(tree) = self.tree() else {
            return (GattStatus::ATTRIBUTE_NOT_FOUND, Vec::new());
        };
        let Some(node) = tree.characteristic(characteristic) else {
            return (GattStatus::ATTRIBUTE_NOT_FOUND, Vec::new());
        };
        if !node.permissions.allows_read() {
            return (GattStatus::READ_NOT_PERMITTED, Vec::new());
        }
        let response = node.handle(peer, &[]);
        (response.status, response.value)
    }

    fn write_characteristic(
        &self,
        peer: &PeerId,
        characteristic: Uuid,
        offset: u16,
        value: &[u8],
        prepared: bool,
    ) -> GattStatus {
        if offset != 0 {
            return GattStatus::INVALID_OFFSET;
        }
        if prepared {
            return GattStatus::REQUEST_NOT_SUPPORTED;
        }
        let Some(tree) = self.tree() else {
            return GattStatus::ATTRIBUTE_NOT_FOUND;
        };
        let Some(node) = tree.characteristic(characteristic) else {
            return GattStatus::ATTRIBUTE_NOT_FOUND;
        };
        if !node.permissions.allows_write() {
            return GattStatus::WRITE_NOT_PERMITTED;
        }
        trace!("Write of {} bytes to {} from {}", value.len(), characteristic, peer);
        node.handle(peer, value).status
    }

    fn read_descriptor(
        &self,
        peer: &PeerId,
        characteristic: Uuid,
        descriptor: Uuid,
        offset: u16,
    ) -> (GattStatus, Vec<u8>) {
        if offset != 0 {
            return (GattStatus::INVALID_OFFSET, Vec::new());
        }
        let Some(tree) = self.tree() else {
            return (GattStatus::ATTRIBUTE_NOT_FOUND, Vec::new());
        };
        let Some((node, desc)) = tree
            .characteristic(characteristic)
            .and_then(|c| c.descriptor(descriptor).map(|d| (c, d)))
        else {
            return (GattStatus::ATTRIBUTE_NOT_FOUND, Vec::new());
        };
        if !desc.permissions.allows_read() {
            return (GattStatus::READ_NOT_PERMITTED, Vec::new());
        }
        let response = desc.handle(peer, &[]);
        if descriptor == CCCD_UUID && node.notification.is_some() {
            // 处理器可以拒绝，但返回值总是对端自己的订阅状态
            if !response.status.is_success() {
                return (response.status, Vec::new());
            }
            let value = self
                .state
                .lock()
                .subscribers
                .get(&characteristic)
                .and_then(|set| set.get(peer))
                .map_or(DISABLE_NOTIFICATION_VALUE, |s| s.value);
            return (GattStatus::SUCCESS, value.to_vec());
        }
        (response.status, response.value)
    }

    fn write_descriptor(
        &self,
        peer: &PeerId,
        characteristic: Uuid,
        descriptor: Uuid,
        offset: u16,
        value: &[u8],
        prepared: bool,
    ) -> GattStatus {
        if offset != 0 {
            return GattStatus::INVALID_OFFSET;
        }
        if prepared {
            return GattStatus::REQUEST_NOT_SUPPORTED;
        }
        let Some(tree) = self.tree() else {
            return GattStatus::ATTRIBUTE_NOT_FOUND;
        };
        let Some((node, desc)) = tree
            .characteristic(characteristic)
            .and_then(|c| c.descriptor(descriptor).map(|d| (c, d)))
        else {
            return GattStatus::ATTRIBUTE_NOT_FOUND;
        };
        if !desc.permissions.allows_write() {
            return GattStatus::WRITE_NOT_PERMITTED;
        }
        let status = desc.handle(peer, value).status;
        if descriptor == CCCD_UUID && node.notification.is_some() && status.is_success() {
            return self.write_configuration(peer, node, value);
        }
        status
    }

    /// CCCD 写入：更新订阅集合
    fn write_configuration(&self, peer: &PeerId, node: &CharacteristicNode, value: &[u8]) -> GattStatus {
        let Ok(value) = <[u8; 2]>::try_from(value) else {
            return GattStatus::INVALID_ATTRIBUTE_LENGTH;
        };
        let required = match value {
            ENABLE_NOTIFICATION_VALUE => Some(Properties::NOTIFY),
            ENABLE_INDICATION_VALUE => Some(Properties::INDICATE),
            DISABLE_NOTIFICATION_VALUE => None,
            _ => return GattStatus::REQUEST_NOT_SUPPORTED,
        };

        let mut state = self.state.lock();
        match required {
            Some(property) => {
                if !node.properties.contains(property) {
                    return GattStatus::REQUEST_NOT_SUPPORTED;
                }
                state.next_generation += 1;
                let generation = state.next_generation;
                let set = state.subscribers.entry(node.uuid).or_default();
                match set.get_mut(peer) {
                    Some(existing) => existing.value = value,
                    None => {
                        set.insert(peer.clone(), Subscription { value, generation });
                    }
                }
                debug!("{} subscribed to {}", peer, node.uuid);
            }
            None => {
                if let Some(set) = state.subscribers.get_mut(&node.uuid) {
                    set.remove(peer);
                }
                debug!("{} unsubscribed from {}", peer, node.uuid);
            }
        }
        GattStatus::SUCCESS
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
