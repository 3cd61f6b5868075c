//! bluer 服务端传输层
//!
//! BlueZ 的 GATT 应用以回调方式处理读写：回调中分配请求 ID、投递事件，
//! 然后等待服务端经 `send_response` 给出结果。
//!
//! BlueZ 自己维护 CCCD，对端的每次 StartNotify 都会得到一个独立的通知会话。
//! 会话没有对端地址，因此每个会话以一个合成的对端 ID 出现：会话开始时投递
//! 一次 CCCD 写入，会话结束时投递断开事件。

use bluer::Adapter;
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotifier, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicReadRequest,
    CharacteristicWrite, CharacteristicWriteMethod, CharacteristicWriteRequest, Descriptor,
    DescriptorRead, DescriptorReadRequest, DescriptorWrite, DescriptorWriteRequest, ReqError,
    ReqResult, Service, WriteOp,
};
use futures_util::FutureExt;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::TransportError;
use crate::gatt::{
    CCCD_UUID, ConnectionState, ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE, GattStatus,
    PeerId, Properties, ServiceType,
};
use crate::server::{AttributeTree, CharacteristicNode, ServerEvent, ServerEventSink, ServerTransport};

const PEER_POLL_INTERVAL: Duration = Duration::from_secs(1);
const SESSION_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// 回调与服务端之间的桥
#[derive(Default)]
struct Bridge {
    sink: Mutex<Option<ServerEventSink>>,
    pending: Mutex<HashMap<u32, oneshot::Sender<(GattStatus, Vec<u8>)>>>,
    sessions: Mutex<HashMap<(PeerId, Uuid), mpsc::UnboundedSender<Vec<u8>>>>,
    next_request: AtomicU32,
    next_session: AtomicU64,
}

impl Bridge {
    fn emit(&self, event: ServerEvent) -> bool {
        let sink = self.sink.lock().clone();
        sink.is_some_and(|sink| sink.send(event))
    }

    fn request_id(&self) -> u32 {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    /// 投递请求并等待服务端响应
    async fn request(&self, build: impl FnOnce(u32) -> ServerEvent) -> (GattStatus, Vec<u8>) {
        let request_id = self.request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);
        if !self.emit(build(request_id)) {
            self.pending.lock().remove(&request_id);
            return (GattStatus::FAILURE, Vec::new());
        }
        rx.await.unwrap_or((GattStatus::FAILURE, Vec::new()))
    }

    async fn run_session(self: Arc<Self>, characteristic: Uuid, notifier: CharacteristicNotifier) {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let peer = PeerId::new(format!("notify-session-{id}"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.sessions
            .lock()
            .insert((peer.clone(), characteristic), tx);

        let confirming = notifier.confirming();
        let value = if confirming {
            ENABLE_INDICATION_VALUE
        } else {
            ENABLE_NOTIFICATION_VALUE
        };
        debug!("Notification session {} started for {}", peer, characteristic);
        self.emit(ServerEvent::PeerConnectionChanged {
            peer: peer.clone(),
            state: ConnectionState::Connected,
        });
        self.emit(ServerEvent::DescriptorWriteRequest {
            peer: peer.clone(),
            request_id: self.request_id(),
            characteristic,
            descriptor: CCCD_UUID,
            offset: 0,
            value: value.to_vec(),
            response_needed: false,
            prepared: false,
        });

        let mut notifier = notifier;
        loop {
            let value = tokio::select! {
                value = rx.recv() => value,
                () = tokio::time::sleep(SESSION_POLL_INTERVAL) => {
                    if notifier.is_stopped() {
                        break;
                    }
                    continue;
                }
            };
            let Some(value) = value else { break };
            if let Err(e) = notifier.notify(value).await {
                warn!("Failed to send notification to {}: {}", peer, e);
                break;
            }
            if confirming {
                self.emit(ServerEvent::NotificationSent {
                    peer: peer.clone(),
                    status: GattStatus::SUCCESS,
                });
            }
        }

        self.sessions.lock().remove(&(peer.clone(), characteristic));
        debug!("Notification session {} ended", peer);
        self.emit(ServerEvent::PeerConnectionChanged {
            peer,
            state: ConnectionState::Disconnected,
        });
    }
}

fn into_result(status: GattStatus) -> ReqResult<()> {
    match status {
        GattStatus::SUCCESS => Ok(()),
        GattStatus::READ_NOT_PERMITTED | GattStatus::WRITE_NOT_PERMITTED => {
            Err(ReqError::NotPermitted)
        }
        GattStatus::INVALID_OFFSET => Err(ReqError::InvalidOffset),
        GattStatus::INVALID_ATTRIBUTE_LENGTH => Err(ReqError::InvalidValueLength),
        GattStatus::REQUEST_NOT_SUPPORTED => Err(ReqError::NotSupported),
        _ => Err(ReqError::Failed),
    }
}

fn peer_of(address: bluer::Address) -> PeerId {
    PeerId::new(address.to_string())
}

fn characteristic(bridge: &Arc<Bridge>, node: &CharacteristicNode) -> Characteristic {
    let uuid = node.uuid;
    let props = node.properties;

    let read = props.contains(Properties::READ).then(|| {
        let bridge = bridge.clone();
        CharacteristicRead {
            read: true,
            fun: Box::new(move |req: CharacteristicReadRequest| {
                let bridge = bridge.clone();
                async move {
                    let (status, value) = bridge
                        .request(|request_id| ServerEvent::CharacteristicReadRequest {
                            peer: peer_of(req.device_address),
                            request_id,
                            characteristic: uuid,
                            offset: req.offset,
                        })
                        .await;
                    into_result(status).map(|()| value)
                }
                .boxed()
            }),
            ..Default::default()
        }
    });

    let writable = props.intersects(Properties::WRITE | Properties::WRITE_NO_RESPONSE);
    let write = writable.then(|| {
        let bridge = bridge.clone();
        CharacteristicWrite {
            write: props.contains(Properties::WRITE),
            write_without_response: props.contains(Properties::WRITE_NO_RESPONSE),
            method: CharacteristicWriteMethod::Fun(Box::new(
                move |value, req: CharacteristicWriteRequest| {
                    let bridge = bridge.clone();
                    async move {
                        let response_needed = !matches!(req.op_type, WriteOp::Command);
                        let event = |request_id| ServerEvent::CharacteristicWriteRequest {
                            peer: peer_of(req.device_address),
                            request_id,
                            characteristic: uuid,
                            offset: req.offset,
                            value,
                            response_needed,
                            prepared: matches!(req.op_type, WriteOp::Reliable),
                        };
                        if !response_needed {
                            bridge.emit(event(bridge.request_id()));
                            return Ok(());
                        }
                        let (status, _) = bridge.request(event).await;
                        into_result(status)
                    }
                    .boxed()
                },
            )),
            ..Default::default()
        }
    });

    let notify = props
        .intersects(Properties::NOTIFY | Properties::INDICATE)
        .then(|| {
            let bridge = bridge.clone();
            CharacteristicNotify {
                notify: props.contains(Properties::NOTIFY),
                indicate: props.contains(Properties::INDICATE),
                method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                    bridge.clone().run_session(uuid, notifier).boxed()
                })),
                ..Default::default()
            }
        });

    let descriptors = node
        .descriptors
        .iter()
        .filter(|d| d.uuid != CCCD_UUID)
        .map(|d| descriptor(bridge, uuid, d.uuid, d.permissions.allows_read(), d.permissions.allows_write()))
        .collect();

    Characteristic {
        uuid,
        read,
        write,
        notify,
        descriptors,
        ..Default::default()
    }
}

fn descriptor(
    bridge: &Arc<Bridge>,
    characteristic: Uuid,
    uuid: Uuid,
    readable: bool,
    writable: bool,
) -> Descriptor {
    let read = readable.then(|| {
        let bridge = bridge.clone();
        DescriptorRead {
            read: true,
            fun: Box::new(move |req: DescriptorReadRequest| {
                let bridge = bridge.clone();
                async move {
                    let (status, value) = bridge
                        .request(|request_id| ServerEvent::DescriptorReadRequest {
                            peer: peer_of(req.device_address),
                            request_id,
                            characteristic,
                            descriptor: uuid,
                            offset: req.offset,
                        })
                        .await;
                    into_result(status).map(|()| value)
                }
                .boxed()
            }),
            ..Default::default()
        }
    });

    let write = writable.then(|| {
        let bridge = bridge.clone();
        DescriptorWrite {
            write: true,
            fun: Box::new(move |value, req: DescriptorWriteRequest| {
                let bridge = bridge.clone();
                async move {
                    let (status, _) = bridge
                        .request(|request_id| ServerEvent::DescriptorWriteRequest {
                            peer: peer_of(req.device_address),
                            request_id,
                            characteristic,
                            descriptor: uuid,
                            offset: req.offset,
                            value,
                            response_needed: true,
                            prepared: false,
                        })
                        .await;
                    into_result(status)
                }
                .boxed()
            }),
            ..Default::default()
        }
    });

    Descriptor {
        uuid,
        read,
        write,
        ..Default::default()
    }
}

fn application(bridge: &Arc<Bridge>, tree: &AttributeTree) -> Application {
    let services = tree
        .services()
        .iter()
        .map(|service| Service {
            uuid: service.uuid,
            primary: service.service_type == ServiceType::Primary,
            characteristics: tree
                .service_characteristics(service)
                .map(|node| characteristic(bridge, node))
                .collect(),
            ..Default::default()
        })
        .collect();
    Application {
        services,
        ..Default::default()
    }
}

/// 轮询对端连接状态，直到被取消
async fn watch_peers(adapter: Adapter, bridge: Arc<Bridge>, cancelled: CancellationToken) {
    let mut connected: HashSet<bluer::Address> = HashSet::new();
    loop {
        tokio::select! {
            () = cancelled.cancelled() => break,
            () = tokio::time::sleep(PEER_POLL_INTERVAL) => {}
        }

        let addresses = match adapter.device_addresses().await {
            Ok(addresses) => addresses,
            Err(e) => {
                warn!("Failed to list devices: {}", e);
                continue;
            }
        };
        let mut now = HashSet::new();
        for address in addresses {
            let is_connected = match adapter.device(address) {
                Ok(device) => device.is_connected().await.unwrap_or(false),
                Err(_) => false,
            };
            if is_connected {
                now.insert(address);
            }
        }

        for address in now.difference(&connected) {
            bridge.emit(ServerEvent::PeerConnectionChanged {
                peer: peer_of(*address),
                state: ConnectionState::Connected,
            });
        }
        for address in connected.difference(&now) {
            bridge.emit(ServerEvent::PeerConnectionChanged {
                peer: peer_of(*address),
                state: ConnectionState::Disconnected,
            });
        }
        connected = now;
    }
}

struct Serving {
    token: CancellationToken,
    app: Arc<Mutex<Option<ApplicationHandle>>>,
}

pub struct BluezServerTransport {
    runtime: Handle,
    adapter: Adapter,
    bridge: Arc<Bridge>,
    serving: Mutex<Option<Serving>>,
}

impl BluezServerTransport {
    pub fn new(adapter: Adapter) -> Arc<Self> {
        Arc::new(Self {
            runtime: Handle::current(),
            adapter,
            bridge: Arc::new(Bridge::default()),
            serving: Mutex::new(None),
        })
    }
}

impl ServerTransport for BluezServerTransport {
    fn bind(&self, events: ServerEventSink) {
        *self.bridge.sink.lock() = Some(events);
    }

    fn open(&self, tree: &AttributeTree) -> Result<(), TransportError> {
        let mut serving = self.serving.lock();
        if serving.is_some() {
            return Err(TransportError::Other("GATT application already registered".into()));
        }

        let app = application(&self.bridge, tree);
        let token = CancellationToken::new();
        let slot = Arc::new(Mutex::new(None));

        let adapter = self.adapter.clone();
        let registered = slot.clone();
        let cancelled = token.clone();
        self.runtime.spawn(async move {
            debug!("Registering GATT application on {}", adapter.name());
            match adapter.serve_gatt_application(app).await {
                Ok(handle) if !cancelled.is_cancelled() => {
                    *registered.lock() = Some(handle);
                    info!("GATT application registered");
                }
                Ok(_) => debug!("GATT server closed during registration"),
                Err(e) => error!("Failed to register GATT application: {}", e),
            }
        });
        self.runtime.spawn(watch_peers(
            self.adapter.clone(),
            self.bridge.clone(),
            token.clone(),
        ));

        *serving = Some(Serving { token, app: slot });
        Ok(())
    }

    fn close(&self) {
        let Some(serving) = self.serving.lock().take() else {
            return;
        };
        serving.token.cancel();
        serving.app.lock().take();
        // 关闭会话通道，会话任务随后退出
        self.bridge.sessions.lock().clear();
        for (_, tx) in self.bridge.pending.lock().drain() {
            let _ = tx.send((GattStatus::FAILURE, Vec::new()));
        }
        debug!("GATT application unregistered");
    }

    fn send_response(
        &self,
        peer: &PeerId,
        request_id: u32,
        status: GattStatus,
        _offset: u16,
        value: &[u8],
    ) -> Result<(), TransportError> {
        match self.bridge.pending.lock().remove(&request_id) {
            Some(tx) => {
                let _ = tx.send((status, value.to_vec()));
            }
            None => debug!("No pending request {} for {}", request_id, peer),
        }
        Ok(())
    }

    fn notify(
        &self,
        peer: &PeerId,
        characteristic: Uuid,
        value: &[u8],
        _confirm: bool,
    ) -> Result<(), TransportError> {
        let sessions = self.bridge.sessions.lock();
        let tx = sessions
            .get(&(peer.clone(), characteristic))
            .ok_or_else(|| TransportError::PeerUnavailable(peer.to_string()))?;
        tx.send(value.to_vec())
            .map_err(|_| TransportError::PeerUnavailable(peer.to_string()))
    }
}
