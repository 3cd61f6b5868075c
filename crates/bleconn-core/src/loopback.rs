//! 进程内回环传输
//!
//! [`LoopbackServerTransport`] 扮演一个本地 GATT Server 的无线电，
//! 每个 [`LoopbackClientTransport`] 是一个连接到它的对端。请求和响应在调用线程上同步投递，
//! 用于测试和 CLI 演示，不依赖任何蓝牙硬件。

use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use uuid::Uuid;

use crate::client::{ClientEvent, ClientEventSink, ClientTransport};
use crate::error::TransportError;
use crate::gatt::{self, ConnectionState, GattStatus, PeerId, Service, WriteType};
use crate::server::{AttributeTree, ServerEvent, ServerEventSink, ServerTransport};

// ============================================================================
// 服务端
// ============================================================================

pub struct LoopbackServerTransport {
    address: String,
    sink: Mutex<Option<ServerEventSink>>,
    services: Mutex<Option<Vec<Service>>>,
    clients: Mutex<HashMap<PeerId, Weak<LoopbackClientTransport>>>,
    next_request: AtomicU32,
}

impl LoopbackServerTransport {
    pub fn new(address: &str) -> Arc<Self> {
        Arc::new(Self {
            address: address.to_uppercase(),
            sink: Mutex::new(None),
            services: Mutex::new(None),
            clients: Mutex::new(HashMap::new()),
            next_request: AtomicU32::new(1),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_open(&self) -> bool {
        self.services.lock().is_some()
    }

    fn emit(&self, event: ServerEvent) {
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            sink.send(event);
        }
    }

    fn client(&self, peer: &PeerId) -> Result<Arc<LoopbackClientTransport>, TransportError> {
        self.clients
            .lock()
            .get(peer)
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::PeerUnavailable(peer.to_string()))
    }

    fn request_id(&self) -> u32 {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }
}

impl ServerTransport for LoopbackServerTransport {
    fn bind(&self, events: ServerEventSink) {
        *self.sink.lock() = Some(events);
    }

    fn open(&self, tree: &AttributeTree) -> Result<(), TransportError> {
        let mut services = self.services.lock();
        if services.is_some() {
            return Err(TransportError::Other("GATT server already open".into()));
        }
        *services = Some(tree.to_services());
        debug!("Loopback GATT server open at {}", self.address);
        Ok(())
    }

    fn close(&self) {
        *self.services.lock() = None;
        let clients: Vec<_> = self
            .clients
            .lock()
            .drain()
            .filter_map(|(_, c)| c.upgrade())
            .collect();
        for client in clients {
            client.link_lost();
        }
    }

    fn send_response(
        &self,
        peer: &PeerId,
        request_id: u32,
        status: GattStatus,
        _offset: u16,
        value: &[u8],
    ) -> Result<(), TransportError> {
        self.client(peer)?.deliver_response(request_id, status, value)
    }

    fn notify(
        &self,
        peer: &PeerId,
        characteristic: Uuid,
        value: &[u8],
        confirm: bool,
    ) -> Result<(), TransportError> {
        self.client(peer)?.deliver_notification(characteristic, value)?;
        if confirm {
            self.emit(ServerEvent::NotificationSent {
                peer: peer.clone(),
                status: GattStatus::SUCCESS,
            });
        }
        Ok(())
    }
}

// ============================================================================
// 客户端
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Request {
    Read(Uuid),
    Write(Uuid),
    ReadDescriptor(Uuid, Uuid),
    WriteDescriptor(Uuid, Uuid),
}

#[derive(Default)]
struct Link {
    connected: bool,
    pending: HashMap<u32, Request>,
    notifying: HashSet<Uuid>,
}

pub struct LoopbackClientTransport {
    peer: PeerId,
    server: Arc<LoopbackServerTransport>,
    this: Weak<LoopbackClientTransport>,
    sink: Mutex<Option<ClientEventSink>>,
    link: Mutex<Link>,
}

impl LoopbackClientTransport {
    /// `address` 是本端在服务端看到的身份
    pub fn new(server: &Arc<LoopbackServerTransport>, address: &str) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            peer: PeerId::new(address.to_uppercase()),
            server: server.clone(),
            this: this.clone(),
            sink: Mutex::new(None),
            link: Mutex::new(Link::default()),
        })
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().connected
    }

    /// 模拟链路断开：两端都会收到断开事件
    pub fn drop_connection(&self) {
        if self.detach() {
            self.server.emit(ServerEvent::PeerConnectionChanged {
                peer: self.peer.clone(),
                state: ConnectionState::Disconnected,
            });
            self.emit(ClientEvent::ConnectionStateChanged(
                ConnectionState::Disconnected,
            ));
        }
    }

    /// 模拟对端悄然消失：服务端不会收到断开事件，后续推送将失败
    pub fn vanish(&self) {
        if self.detach() {
            self.emit(ClientEvent::ConnectionStateChanged(
                ConnectionState::Disconnected,
            ));
        }
    }

    fn link_lost(&self) {
        let was_connected = std::mem::take(&mut *self.link.lock()).connected;
        if was_connected {
            self.emit(ClientEvent::ConnectionStateChanged(
                ConnectionState::Disconnected,
            ));
        }
    }

    /// 断开本端并从服务端注销，返回之前是否已连接
    fn detach(&self) -> bool {
        let was_connected = std::mem::take(&mut *self.link.lock()).connected;
        if was_connected {
            self.server.clients.lock().remove(&self.peer);
        }
        was_connected
    }

    fn emit(&self, event: ClientEvent) {
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            sink.send(event);
        }
    }

    fn require_connected(&self) -> Result<(), TransportError> {
        if self.link.lock().connected {
            Ok(())
        } else {
            Err(TransportError::NotReady("not connected".into()))
        }
    }

    /// 登记一个等待服务端响应的请求
    fn track(&self, request: Option<Request>) -> Result<u32, TransportError> {
        let mut link = self.link.lock();
        if !link.connected {
            return Err(TransportError::NotReady("not connected".into()));
        }
        let id = self.server.request_id();
        if let Some(request) = request {
            link.pending.insert(id, request);
        }
        Ok(id)
    }

    fn deliver_response(
        &self,
        request_id: u32,
        status: GattStatus,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let request = self.link.lock().pending.remove(&request_id);
        let event = match request {
            Some(Request::Read(characteristic)) => ClientEvent::CharacteristicRead {
                characteristic,
                status,
                value: value.to_vec(),
            },
            Some(Request::Write(characteristic)) => ClientEvent::CharacteristicWrite {
                characteristic,
                status,
            },
            Some(Request::ReadDescriptor(characteristic, descriptor)) => {
                ClientEvent::DescriptorRead {
                    characteristic,
                    descriptor,
                    status,
                    value: value.to_vec(),
                }
            }
            Some(Request::WriteDescriptor(characteristic, descriptor)) => {
                ClientEvent::DescriptorWrite {
                    characteristic,
                    descriptor,
                    status,
                }
            }
            None => {
                return Err(TransportError::Other(format!(
                    "No outstanding request {request_id}"
                )));
            }
        };
        self.emit(event);
        Ok(())
    }

    fn deliver_notification(&self, characteristic: Uuid, value: &[u8]) -> Result<(), TransportError> {
        let forward = {
            let link = self.link.lock();
            if !link.connected {
                return Err(TransportError::PeerUnavailable(self.peer.to_string()));
            }
            link.notifying.contains(&characteristic)
        };
        if forward {
            self.emit(ClientEvent::CharacteristicChanged {
                characteristic,
                value: value.to_vec(),
            });
        } else {
            trace!("Notification for {} not enabled locally", characteristic);
        }
        Ok(())
    }
}

impl ClientTransport for LoopbackClientTransport {
    fn bind(&self, events: ClientEventSink) {
        *self.sink.lock() = Some(events);
    }

    fn connect(&self, address: &str) -> Result<(), TransportError> {
        if !address.eq_ignore_ascii_case(&self.server.address) || !self.server.is_open() {
            return Err(TransportError::PeerUnavailable(address.to_string()));
        }
        {
            let mut link = self.link.lock();
            if link.connected {
                return Err(TransportError::Other("already connected".into()));
            }
            link.connected = true;
        }
        self.server
            .clients
            .lock()
            .insert(self.peer.clone(), self.this.clone());

        self.server.emit(ServerEvent::PeerConnectionChanged {
            peer: self.peer.clone(),
            state: ConnectionState::Connected,
        });
        self.emit(ClientEvent::ConnectionStateChanged(ConnectionState::Connected));
        Ok(())
    }

    fn disconnect(&self) {
        if self.detach() {
            self.server.emit(ServerEvent::PeerConnectionChanged {
                peer: self.peer.clone(),
                state: ConnectionState::Disconnected,
            });
        }
    }

    fn discover_services(&self) -> Result<(), TransportError> {
        self.require_connected()?;
        let services = self.server.services.lock().clone().unwrap_or_default();
        self.emit(ClientEvent::ServicesDiscovered {
            status: GattStatus::SUCCESS,
            services,
        });
        Ok(())
    }

    fn request_mtu(&self, mtu: u16) -> Result<(), TransportError> {
        self.require_connected()?;
        self.emit(ClientEvent::MtuChanged {
            mtu: mtu.min(gatt::MAX_MTU),
            status: GattStatus::SUCCESS,
        });
        Ok(())
    }

    fn read_characteristic(&self, characteristic: Uuid) -> Result<(), TransportError> {
        let request_id = self.track(Some(Request::Read(characteristic)))?;
        self.server.emit(ServerEvent::CharacteristicReadRequest {
            peer: self.peer.clone(),
            request_id,
            characteristic,
            offset: 0,
        });
        Ok(())
    }

    fn write_characteristic(
        &self,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), TransportError> {
        let response_needed = write_type == WriteType::WithResponse;
        let request_id = self.track(response_needed.then_some(Request::Write(characteristic)))?;
        self.server.emit(ServerEvent::CharacteristicWriteRequest {
            peer: self.peer.clone(),
            request_id,
            characteristic,
            offset: 0,
            value: value.to_vec(),
            response_needed,
            prepared: false,
        });
        Ok(())
    }

    fn set_notification_enabled(
        &self,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), TransportError> {
        let mut link = self.link.lock();
        if !link.connected {
            return Err(TransportError::NotReady("not connected".into()));
        }
        if enabled {
            link.notifying.insert(characteristic);
        } else {
            link.notifying.remove(&characteristic);
        }
        Ok(())
    }

    fn read_descriptor(&self, characteristic: Uuid, descriptor: Uuid) -> Result<(), TransportError> {
        let request_id = self.track(Some(Request::ReadDescriptor(characteristic, descriptor)))?;
        self.server.emit(ServerEvent::DescriptorReadRequest {
            peer: self.peer.clone(),
            request_id,
            characteristic,
            descriptor,
            offset: 0,
        });
        Ok(())
    }

    fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let request_id = self.track(Some(Request::WriteDescriptor(characteristic, descriptor)))?;
        self.server.emit(ServerEvent::DescriptorWriteRequest {
            peer: self.peer.clone(),
            request_id,
            characteristic,
            descriptor,
            offset: 0,
            value: value.to_vec(),
            response_needed: true,
            prepared: false,
        });
        Ok(())
    }
}
