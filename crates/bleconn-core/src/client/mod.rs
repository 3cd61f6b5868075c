//! BLE Client - 连接远端 GATT Server
//!
//! 把回调驱动、每类请求只能有一个在途的底层协议栈，包装成可并发调用的操作：
//!
//! - 每类操作（连接、服务发现、MTU、读、写、开启/关闭订阅）对应一个 [`CallbackSlot`]，
//!   特征与描述符的读写共用读/写槽位，
//!   槽位被占用时新请求立即以 busy 失败，不会排队，也不会触碰传输层
//! - 每个操作都有回调形式（`*_with`）和 async 形式，async 形式只是对回调的包装
//! - 周期性超时扫描把超过时限仍未完成的请求以超时错误结束
//! - 断开连接时同步结束所有在途请求并清空订阅表；之后迟到的完成事件被忽略
//!
//! 状态锁不会在调用传输层或用户回调时持有，因此传输层可以同步回送事件。

mod subscriptions;
mod transport;

#[cfg(test)]
mod tests;

pub use subscriptions::{SubscriptionRegistry, ValueCallback};
pub use transport::{ClientEvent, ClientTransport};

use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::AdapterState;
use crate::config::ClientConfig;
use crate::error::{GattError, Operation, TransportError};
use crate::gatt::{
    self, Attribute, CCCD_UUID, ConnectionState, DISABLE_NOTIFICATION_VALUE, ENABLE_INDICATION_VALUE,
    ENABLE_NOTIFICATION_VALUE, GattStatus, Properties, Service, WriteType,
};
use crate::pending::{self, CallbackSlot, Deferred, Sink};

/// 连接状态观察者，连接期间每次状态变化都会调用
pub type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

const MANUAL_DISCONNECT: &str = "Manually disconnected GATT";
const LINK_LOST: &str = "Disconnected from GATT server.";
const ADAPTER_OFF: &str = "Bluetooth adapter turned off";

/// 等待确认的订阅请求
struct PendingSubscription {
    characteristic: Uuid,
    on_value: ValueCallback,
}

struct ClientState {
    connection: ConnectionState,
    address: Option<String>,
    on_state: Option<StateCallback>,
    services: Vec<Service>,
    mtu: u16,
    subscriptions: SubscriptionRegistry,
    sweep: Option<CancellationToken>,

    connect: CallbackSlot<String, ()>,
    discover: CallbackSlot<(), Vec<Service>>,
    mtu_request: CallbackSlot<(), u16>,
    read: CallbackSlot<Attribute, Vec<u8>>,
    write: CallbackSlot<Attribute, ()>,
    enable: CallbackSlot<PendingSubscription, ()>,
    disable: CallbackSlot<Uuid, ()>,
}

impl ClientState {
    fn new(config: &ClientConfig) -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            address: None,
            on_state: None,
            services: Vec::new(),
            mtu: gatt::DEFAULT_MTU,
            subscriptions: SubscriptionRegistry::new(),
            sweep: None,
            connect: CallbackSlot::new(Operation::Connect, config.timeout(Operation::Connect)),
            discover: CallbackSlot::new(Operation::Discover, config.timeout(Operation::Discover)),
            mtu_request: CallbackSlot::new(Operation::Mtu, config.timeout(Operation::Mtu)),
            read: CallbackSlot::new(Operation::Read, config.timeout(Operation::Read)),
            write: CallbackSlot::new(Operation::Write, config.timeout(Operation::Write)),
            enable: CallbackSlot::new(
                Operation::EnableNotification,
                config.timeout(Operation::EnableNotification),
            ),
            disable: CallbackSlot::new(
                Operation::DisableNotification,
                config.timeout(Operation::DisableNotification),
            ),
        }
    }

    fn require_connected(&self) -> Result<(), GattError> {
        if self.connection == ConnectionState::Connected {
            Ok(())
        } else {
            Err(GattError::NotConnected)
        }
    }

    fn characteristic(&self, uuid: Uuid) -> Result<&gatt::Characteristic, GattError> {
        gatt::find_characteristic(&self.services, uuid).ok_or_else(|| {
            GattError::InvalidArgument(format!("Characteristic {uuid} not found"))
        })
    }

    /// 读写目标必须出现在最近一次服务发现的结果中
    fn attribute(&self, attribute: Attribute) -> Result<(), GattError> {
        let found = self.characteristic(attribute.characteristic())?;
        if let Attribute::Descriptor { descriptor, .. } = attribute {
            if found.descriptor(descriptor).is_none() {
                return Err(GattError::InvalidArgument(format!(
                    "Descriptor {attribute} not found"
                )));
            }
        }
        Ok(())
    }

    fn any_pending(&self) -> bool {
        self.connect.is_set()
            || self.discover.is_set()
            || self.mtu_request.is_set()
            || self.read.is_set()
            || self.write.is_set()
            || self.enable.is_set()
            || self.disable.is_set()
    }

    /// 以同一个错误结束所有在途请求
    fn flush_all(&mut self, error: &GattError) -> Vec<Deferred> {
        [
            self.connect.flush(error),
            self.discover.flush(error),
            self.mtu_request.flush(error),
            self.read.flush(error),
            self.write.flush(error),
            self.enable.flush(error),
            self.disable.flush(error),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    fn expire_all(&mut self, now: Instant) -> Vec<Deferred> {
        [
            self.connect.expire(now),
            self.discover.expire(now),
            self.mtu_request.expire(now),
            self.read.expire(now),
            self.write.expire(now),
            self.enable.expire(now),
            self.disable.expire(now),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// 连接结束：清空订阅、服务缓存并停止超时扫描
    fn reset_link(&mut self) {
        self.connection = ConnectionState::Disconnected;
        self.subscriptions.clear();
        self.services.clear();
        self.mtu = gatt::DEFAULT_MTU;
        if let Some(token) = self.sweep.take() {
            token.cancel();
        }
    }
}

fn discover_slot(s: &mut ClientState) -> &mut CallbackSlot<(), Vec<Service>> {
    &mut s.discover
}

fn mtu_slot(s: &mut ClientState) -> &mut CallbackSlot<(), u16> {
    &mut s.mtu_request
}

fn read_slot(s: &mut ClientState) -> &mut CallbackSlot<Attribute, Vec<u8>> {
    &mut s.read
}

fn write_slot(s: &mut ClientState) -> &mut CallbackSlot<Attribute, ()> {
    &mut s.write
}

fn enable_slot(s: &mut ClientState) -> &mut CallbackSlot<PendingSubscription, ()> {
    &mut s.enable
}

fn disable_slot(s: &mut ClientState) -> &mut CallbackSlot<Uuid, ()> {
    &mut s.disable
}

struct ClientInner {
    transport: Arc<dyn ClientTransport>,
    config: ClientConfig,
    state: Mutex<ClientState>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(token) = self.state.get_mut().sweep.take() {
            token.cancel();
        }
    }
}

/// 传输层回送事件的入口，不持有客户端所有权
#[derive(Clone)]
pub struct ClientEventSink {
    inner: Weak<ClientInner>,
}

impl ClientEventSink {
    /// 投递事件；客户端已释放时返回 false
    pub fn send(&self, event: ClientEvent) -> bool {
        match self.inner.upgrade() {
            Some(inner) => {
                inner.handle_event(event);
                true
            }
            None => false,
        }
    }
}

/// GATT 客户端，同一时刻只维护一个连接
#[derive(Clone)]
pub struct BleClient {
    inner: Arc<ClientInner>,
}

impl BleClient {
    pub fn new(transport: Arc<dyn ClientTransport>, config: ClientConfig) -> Self {
        let inner = Arc::new(ClientInner {
            transport,
            state: Mutex::new(ClientState::new(&config)),
            config,
        });
        inner.transport.bind(ClientEventSink {
            inner: Arc::downgrade(&inner),
        });
        Self { inner }
    }

    pub fn event_sink(&self) -> ClientEventSink {
        ClientEventSink {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// 处理传输层事件（也可由平台回调线程直接调用）
    pub fn handle_event(&self, event: ClientEvent) {
        self.inner.handle_event(event);
    }

    /// 把适配器状态转发给客户端的回调，用于 [`crate::adapter::AdapterStateMonitor`]
    pub fn adapter_state_observer(&self) -> impl Fn(AdapterState) + Send + Sync + 'static {
        let sink = self.event_sink();
        move |state| {
            sink.send(ClientEvent::AdapterStateChanged(state));
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.lock().connection
    }

    pub fn address(&self) -> Option<String> {
        self.inner.state.lock().address.clone()
    }

    /// 最近一次服务发现的结果
    pub fn services(&self) -> Vec<Service> {
        self.inner.state.lock().services.clone()
    }

    pub fn negotiated_mtu(&self) -> u16 {
        self.inner.state.lock().mtu
    }

    pub fn is_subscribed(&self, characteristic: Uuid) -> bool {
        self.inner.state.lock().subscriptions.contains(&characteristic)
    }

    /// 立即执行一次超时检查（超时扫描任务每秒调用一次）
    pub fn check_timeouts(&self) {
        self.inner.check_timeouts(Instant::now());
    }

    // ------------------------------------------------------------------
    // connect / disconnect
    // ------------------------------------------------------------------

    /// 发起连接，`on_state` 在此后每次连接状态变化时被调用
    ///
    /// 返回请求是否已交给传输层；失败时 `callback` 已被同步调用。
    pub fn connect_with(
        &self,
        address: &str,
        on_state: impl Fn(ConnectionState) + Send + Sync + 'static,
        callback: impl FnOnce(Result<(), GattError>) + Send + 'static,
    ) -> bool {
        let inner = &self.inner;
        let sink: Sink<()> = Box::new(callback);

        let mut state = inner.state.lock();
        if state.connect.is_set() {
            drop(state);
            return fail(sink, GattError::Busy(Operation::Connect));
        }
        if state.connection == ConnectionState::Connected {
            drop(state);
            return fail(sink, GattError::AlreadyConnected);
        }
        if !gatt::is_valid_address(address) {
            drop(state);
            return fail(
                sink,
                GattError::InvalidArgument(format!("Invalid device address. {address}")),
            );
        }

        let id = match state
            .connect
            .set(Some(address.to_string()), sink, Instant::now())
        {
            Ok(id) => id,
            Err(sink) => {
                drop(state);
                return fail(sink, GattError::Busy(Operation::Connect));
            }
        };
        state.connection = ConnectionState::Connecting;
        state.address = Some(address.to_string());
        state.on_state = Some(Arc::new(on_state));
        inner.start_sweep(&mut state);
        drop(state);

        info!("Connecting to {}", address);
        if let Err(e) = inner.transport.connect(address) {
            let pending = {
                let mut state = inner.state.lock();
                let pending = state.connect.take_by_id(id);
                if pending.is_some() {
                    state.reset_link();
                    state.address = None;
                    state.on_state = None;
                }
                pending
            };
            if let Some(p) = pending {
                error!("Failed to connect to GATT server: {}", e);
                p.resolve(Err(GattError::rejected(&e)));
            }
            return false;
        }
        true
    }

    pub async fn connect(
        &self,
        address: &str,
        on_state: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> Result<(), GattError> {
        let (sink, rx) = pending::oneshot_sink();
        self.connect_with(address, on_state, sink);
        pending::wait(rx, Operation::Connect).await
    }

    /// 断开连接（幂等）
    ///
    /// 返回前所有在途请求都已以 "Manually disconnected GATT" 结束。
    pub fn disconnect(&self) {
        let inner = &self.inner;
        let error = GattError::Disconnected(MANUAL_DISCONNECT.to_string());

        let (had_link, previous, observer, deferred) = {
            let mut state = inner.state.lock();
            let previous = state.connection;
            let had_link = previous != ConnectionState::Disconnected || state.any_pending();
            let deferred = state.flush_all(&error);
            state.reset_link();
            state.address = None;
            (had_link, previous, state.on_state.take(), deferred)
        };

        if had_link {
            inner.transport.disconnect();
            debug!(
                "Disconnected from GATT server, {} pending operation(s) cancelled",
                deferred.len()
            );
        }
        pending::run_deferred(deferred);

        if previous != ConnectionState::Disconnected {
            if let Some(observer) = observer {
                observer(ConnectionState::Disconnected);
            }
        }
    }

    // ------------------------------------------------------------------
    // discover / mtu
    // ------------------------------------------------------------------

    pub fn discover_services_with(
        &self,
        callback: impl FnOnce(Result<Vec<Service>, GattError>) + Send + 'static,
    ) -> bool {
        self.inner.start(
            discover_slot,
            |state| state.require_connected().map(|()| None),
            Box::new(callback),
            |transport| transport.discover_services(),
        )
    }

    pub async fn discover_services(&self) -> Result<Vec<Service>, GattError> {
        let (sink, rx) = pending::oneshot_sink();
        self.discover_services_with(sink);
        pending::wait(rx, Operation::Discover).await
    }

    pub fn request_mtu_with(
        &self,
        mtu: u16,
        callback: impl FnOnce(Result<u16, GattError>) + Send + 'static,
    ) -> bool {
        let sink: Sink<u16> = Box::new(callback);
        if !(gatt::DEFAULT_MTU..=gatt::MAX_MTU).contains(&mtu) {
            return fail(
                sink,
                GattError::InvalidArgument(format!(
                    "MTU {mtu} outside {}..={}",
                    gatt::DEFAULT_MTU,
                    gatt::MAX_MTU
                )),
            );
        }
        self.inner.start(
            mtu_slot,
            |state| state.require_connected().map(|()| None),
            sink,
            |transport| transport.request_mtu(mtu),
        )
    }

    pub async fn request_mtu(&self, mtu: u16) -> Result<u16, GattError> {
        let (sink, rx) = pending::oneshot_sink();
        self.request_mtu_with(mtu, sink);
        pending::wait(rx, Operation::Mtu).await
    }

    // ------------------------------------------------------------------
    // read / write
    // ------------------------------------------------------------------

    /// 读取特征值；整个客户端同一时刻只允许一个读请求（特征与描述符共用）
    pub fn read_with(
        &self,
        characteristic: Uuid,
        callback: impl FnOnce(Result<Vec<u8>, GattError>) + Send + 'static,
    ) -> bool {
        self.read_attribute(
            Attribute::Characteristic(characteristic),
            Box::new(callback),
        )
    }

    pub async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, GattError> {
        let (sink, rx) = pending::oneshot_sink();
        self.read_with(characteristic, sink);
        pending::wait(rx, Operation::Read).await
    }

    /// 读取描述符
    pub fn read_descriptor_with(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        callback: impl FnOnce(Result<Vec<u8>, GattError>) + Send + 'static,
    ) -> bool {
        self.read_attribute(
            Attribute::Descriptor {
                characteristic,
                descriptor,
            },
            Box::new(callback),
        )
    }

    pub async fn read_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Result<Vec<u8>, GattError> {
        let (sink, rx) = pending::oneshot_sink();
        self.read_descriptor_with(characteristic, descriptor, sink);
        pending::wait(rx, Operation::Read).await
    }

    fn read_attribute(&self, attribute: Attribute, sink: Sink<Vec<u8>>) -> bool {
        self.inner.start(
            read_slot,
            |state| {
                state.require_connected()?;
                state.attribute(attribute)?;
                Ok(Some(attribute))
            },
            sink,
            |transport| match attribute {
                Attribute::Characteristic(uuid) => transport.read_characteristic(uuid),
                Attribute::Descriptor {
                    characteristic,
                    descriptor,
                } => transport.read_descriptor(characteristic, descriptor),
            },
        )
    }

    /// 写入特征值
    ///
    /// `WriteType::WithoutResponse` 在传输层接受后立即以成功结束，不占用写槽位。
    pub fn write_with(
        &self,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
        callback: impl FnOnce(Result<(), GattError>) + Send + 'static,
    ) -> bool {
        let sink: Sink<()> = Box::new(callback);
        if write_type == WriteType::WithResponse {
            return self.inner.start(
                write_slot,
                |state| {
                    state.require_connected()?;
                    state.characteristic(characteristic)?;
                    Ok(Some(Attribute::Characteristic(characteristic)))
                },
                sink,
                |transport| transport.write_characteristic(characteristic, value, write_type),
            );
        }

        let checked = {
            let state = self.inner.state.lock();
            state
                .require_connected()
                .and_then(|()| {
                    if state.write.is_set() {
                        Err(GattError::Busy(Operation::Write))
                    } else {
                        Ok(())
                    }
                })
                .and_then(|()| state.characteristic(characteristic).map(|_| ()))
        };
        if let Err(e) = checked {
            return fail(sink, e);
        }

        trace!(
            "Writing {} bytes to {} without response",
            value.len(),
            characteristic
        );
        match self
            .inner
            .transport
            .write_characteristic(characteristic, value, write_type)
        {
            Ok(()) => {
                sink(Ok(()));
                true
            }
            Err(e) => {
                error!("Characteristic write failed: {}", e);
                fail(sink, GattError::rejected(&e))
            }
        }
    }

    pub async fn write(
        &self,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), GattError> {
        let (sink, rx) = pending::oneshot_sink();
        self.write_with(characteristic, value, write_type, sink);
        pending::wait(rx, Operation::Write).await
    }

    /// 写入描述符（总是等待响应），与特征写入共用写槽位
    ///
    /// 订阅配置描述符只能经由 [`Self::subscribe_with`] / [`Self::unsubscribe_with`] 修改。
    pub fn write_descriptor_with(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
        callback: impl FnOnce(Result<(), GattError>) + Send + 'static,
    ) -> bool {
        let sink: Sink<()> = Box::new(callback);
        if descriptor == CCCD_UUID {
            return fail(
                sink,
                GattError::InvalidArgument(format!(
                    "Configuration descriptor of {characteristic} is managed by subscribe/unsubscribe"
                )),
            );
        }
        let attribute = Attribute::Descriptor {
            characteristic,
            descriptor,
        };
        self.inner.start(
            write_slot,
            |state| {
                state.require_connected()?;
                state.attribute(attribute)?;
                Ok(Some(attribute))
            },
            sink,
            |transport| transport.write_descriptor(characteristic, descriptor, value),
        )
    }

    pub async fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), GattError> {
        let (sink, rx) = pending::oneshot_sink();
        self.write_descriptor_with(characteristic, descriptor, value, sink);
        pending::wait(rx, Operation::Write).await
    }

    // ------------------------------------------------------------------
    // subscribe / unsubscribe
    // ------------------------------------------------------------------

    /// 订阅特征值变化
    ///
    /// `indicate` 为 true 时要求对端确认（indication），否则为 notification。
    /// 成功后 `on_value` 会在每次收到该特征的值变化时被调用，直到取消订阅或断开。
    pub fn subscribe_with(
        &self,
        characteristic: Uuid,
        indicate: bool,
        on_value: impl Fn(&[u8]) + Send + Sync + 'static,
        callback: impl FnOnce(Result<(), GattError>) + Send + 'static,
    ) -> bool {
        let inner = &self.inner;
        let sink: Sink<()> = Box::new(callback);
        let on_value: ValueCallback = Arc::new(on_value);

        let mut state = inner.state.lock();
        if let Err(e) = check_subscribe(&state, characteristic, indicate) {
            drop(state);
            return fail(sink, e);
        }
        let key = PendingSubscription {
            characteristic,
            on_value,
        };
        let id = match state.enable.set(Some(key), sink, Instant::now()) {
            Ok(id) => id,
            Err(sink) => {
                drop(state);
                return fail(sink, GattError::Busy(Operation::EnableNotification));
            }
        };
        drop(state);

        let value = if indicate {
            ENABLE_INDICATION_VALUE
        } else {
            ENABLE_NOTIFICATION_VALUE
        };
        let issued = inner
            .transport
            .set_notification_enabled(characteristic, true)
            .and_then(|()| {
                inner
                    .transport
                    .write_descriptor(characteristic, CCCD_UUID, &value)
                    .inspect_err(|_| {
                        let _ = inner.transport.set_notification_enabled(characteristic, false);
                    })
            });
        if let Err(e) = issued {
            inner.reject(enable_slot, id, &e);
            return false;
        }
        true
    }

    pub async fn subscribe(
        &self,
        characteristic: Uuid,
        indicate: bool,
        on_value: impl Fn(&[u8]) + Send + Sync + 'static,
    ) -> Result<(), GattError> {
        let (sink, rx) = pending::oneshot_sink();
        self.subscribe_with(characteristic, indicate, on_value, sink);
        pending::wait(rx, Operation::EnableNotification).await
    }

    /// 订阅并以流的形式接收值变化
    pub async fn subscribe_stream(
        &self,
        characteristic: Uuid,
        indicate: bool,
    ) -> Result<UnboundedReceiverStream<Vec<u8>>, GattError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.subscribe(characteristic, indicate, move |value| {
            let _ = tx.send(value.to_vec());
        })
        .await?;
        Ok(UnboundedReceiverStream::new(rx))
    }

    /// 取消订阅
    ///
    /// 订阅表项在向传输层发出请求之前就被移除，此后到达的值变化不再投递。
    pub fn unsubscribe_with(
        &self,
        characteristic: Uuid,
        callback: impl FnOnce(Result<(), GattError>) + Send + 'static,
    ) -> bool {
        let inner = &self.inner;
        let sink: Sink<()> = Box::new(callback);

        let mut state = inner.state.lock();
        if let Err(e) = check_unsubscribe(&state, characteristic) {
            drop(state);
            return fail(sink, e);
        }
        let id = match state
            .disable
            .set(Some(characteristic), sink, Instant::now())
        {
            Ok(id) => id,
            Err(sink) => {
                drop(state);
                return fail(sink, GattError::Busy(Operation::DisableNotification));
            }
        };
        state.subscriptions.remove(&characteristic);
        drop(state);
        debug!("Unsubscribed locally from {}", characteristic);

        let issued = inner
            .transport
            .set_notification_enabled(characteristic, false)
            .and_then(|()| {
                inner.transport.write_descriptor(
                    characteristic,
                    CCCD_UUID,
                    &DISABLE_NOTIFICATION_VALUE,
                )
            });
        if let Err(e) = issued {
            inner.reject(disable_slot, id, &e);
            return false;
        }
        true
    }

    pub async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), GattError> {
        let (sink, rx) = pending::oneshot_sink();
        self.unsubscribe_with(characteristic, sink);
        pending::wait(rx, Operation::DisableNotification).await
    }
}

fn fail<R>(sink: Sink<R>, error: GattError) -> bool {
    warn!("{}", error);
    sink(Err(error));
    false
}

fn check_subscribe(
    state: &ClientState,
    characteristic: Uuid,
    indicate: bool,
) -> Result<(), GattError> {
    state.require_connected()?;
    if state.subscriptions.contains(&characteristic) {
        return Err(GattError::InvalidState(format!(
            "Already subscribed to {characteristic}"
        )));
    }
    if state.enable.is_set() {
        return Err(GattError::Busy(Operation::EnableNotification));
    }
    if state.disable.key() == Some(&characteristic) {
        return Err(GattError::Busy(Operation::DisableNotification));
    }

    let found = state.characteristic(characteristic)?;
    let required = if indicate {
        Properties::INDICATE
    } else {
        Properties::NOTIFY
    };
    if !found.properties.contains(required) {
        return Err(GattError::InvalidArgument(format!(
            "Characteristic {characteristic} does not support {}",
            if indicate { "indication" } else { "notification" }
        )));
    }
    if found.descriptor(CCCD_UUID).is_none() {
        return Err(GattError::InvalidArgument(format!(
            "Characteristic {characteristic} has no configuration descriptor"
        )));
    }
    Ok(())
}

fn check_unsubscribe(state: &ClientState, characteristic: Uuid) -> Result<(), GattError> {
    state.require_connected()?;
    if state
        .enable
        .key()
        .is_some_and(|k| k.characteristic == characteristic)
    {
        return Err(GattError::Busy(Operation::EnableNotification));
    }
    if !state.subscriptions.contains(&characteristic) {
        return Err(GattError::InvalidState(format!(
            "Not subscribed to {characteristic}"
        )));
    }
    if state.disable.is_set() {
        return Err(GattError::Busy(Operation::DisableNotification));
    }
    Ok(())
}

impl ClientInner {
    /// 通用的"检查 - 占用槽位 - 发起请求"流程
    fn start<K: Send + 'static, R: Send + 'static>(
        &self,
        slot: fn(&mut ClientState) -> &mut CallbackSlot<K, R>,
        precheck: impl FnOnce(&ClientState) -> Result<Option<K>, GattError>,
        sink: Sink<R>,
        issue: impl FnOnce(&dyn ClientTransport) -> Result<(), TransportError>,
    ) -> bool {
        let mut state = self.state.lock();
        let key = match precheck(&state) {
            Ok(key) => key,
            Err(e) => {
                drop(state);
                return fail(sink, e);
            }
        };
        let slot_ref = slot(&mut state);
        let operation = slot_ref.operation();
        let id = match slot_ref.set(key, sink, Instant::now()) {
            Ok(id) => id,
            Err(sink) => {
                drop(state);
                return fail(sink, GattError::Busy(operation));
            }
        };
        drop(state);

        debug!("Starting {}", operation);
        if let Err(e) = issue(self.transport.as_ref()) {
            self.reject(slot, id, &e);
            return false;
        }
        true
    }

    /// 传输层拒绝请求：仅当槽位仍属于本次请求时才结束它
    fn reject<K: Send + 'static, R: Send + 'static>(
        &self,
        slot: fn(&mut ClientState) -> &mut CallbackSlot<K, R>,
        id: u64,
        err: &TransportError,
    ) {
        let (operation, pending) = {
            let mut state = self.state.lock();
            let slot_ref = slot(&mut state);
            (slot_ref.operation(), slot_ref.take_by_id(id))
        };
        if let Some(p) = pending {
            error!("Failed to {}: {}", operation, err);
            p.resolve(Err(GattError::rejected(err)));
        }
    }

    fn start_sweep(self: &Arc<Self>, state: &mut ClientState) {
        if state.sweep.is_some() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime, timeout sweep disabled");
            return;
        };

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let weak = Arc::downgrade(self);
        let period = self.config.sweep_interval();
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.check_timeouts(Instant::now());
                    }
                }
            }
            trace!("Timeout sweep stopped");
        });
        state.sweep = Some(token);
    }

    fn check_timeouts(&self, now: Instant) {
        let (deferred, observer) = {
            let mut state = self.state.lock();
            let connecting = state.connect.is_set();
            let deferred = state.expire_all(now);
            // 连接超时后放弃这次连接尝试
            let abandoned = connecting
                && !state.connect.is_set()
                && state.connection == ConnectionState::Connecting;
            let observer = if abandoned {
                state.reset_link();
                Some(state.on_state.clone())
            } else {
                None
            };
            (deferred, observer)
        };
        if !deferred.is_empty() {
            warn!("{} operation(s) timed out", deferred.len());
        }
        if observer.is_some() {
            self.transport.disconnect();
        }
        pending::run_deferred(deferred);
        if let Some(Some(observer)) = observer {
            observer(ConnectionState::Disconnected);
        }
    }

    fn handle_event(&self, event: ClientEvent) {
        match event {
            ClientEvent::ConnectionStateChanged(ConnectionState::Connected) => self.on_connected(),
            ClientEvent::ConnectionStateChanged(ConnectionState::Disconnected) => {
                self.on_link_lost(LINK_LOST);
            }
            ClientEvent::ConnectionStateChanged(ConnectionState::Connecting) => {
                let observer = {
                    let mut state = self.state.lock();
                    if state.connection != ConnectionState::Disconnected {
                        state.connection = ConnectionState::Connecting;
                    }
                    state.on_state.clone()
                };
                if let Some(observer) = observer {
                    observer(ConnectionState::Connecting);
                }
            }
            ClientEvent::AdapterStateChanged(adapter) => {
                debug!("Bluetooth adapter state: {:?}", adapter);
                if adapter.is_going_down() {
                    self.on_link_lost(ADAPTER_OFF);
                }
            }
            ClientEvent::ServicesDiscovered { status, services } => {
                self.on_services_discovered(status, services);
            }
            ClientEvent::MtuChanged { mtu, status } => {
                // 对端发起的 MTU 交换同样生效
                let pending = {
                    let mut state = self.state.lock();
                    if status.is_success() && state.connection == ConnectionState::Connected {
                        state.mtu = mtu;
                    }
                    state.mtu_request.take()
                };
                if status.is_success() {
                    debug!("MTU changed to {}", mtu);
                } else {
                    error!("MTU change failed with status {}", status);
                }
                complete(pending, Operation::Mtu, status, mtu);
            }
            ClientEvent::CharacteristicRead {
                characteristic,
                status,
                value,
            } => {
                let pending = self
                    .state
                    .lock()
                    .read
                    .take_if(|key| key == Some(&Attribute::Characteristic(characteristic)));
                if pending.is_none() {
                    debug!("Ignoring read completion for {}", characteristic);
                }
                trace!("Read {} bytes from {}", value.len(), characteristic);
                complete(pending, Operation::Read, status, value);
            }
            ClientEvent::CharacteristicWrite {
                characteristic,
                status,
            } => {
                let pending = self
                    .state
                    .lock()
                    .write
                    .take_if(|key| key == Some(&Attribute::Characteristic(characteristic)));
                if pending.is_none() {
                    debug!("Ignoring write completion for {}", characteristic);
                }
                complete(pending, Operation::Write, status, ());
            }
            ClientEvent::DescriptorRead {
                characteristic,
                descriptor,
                status,
                value,
            } => {
                let attribute = Attribute::Descriptor {
                    characteristic,
                    descriptor,
                };
                let pending = self.state.lock().read.take_if(|key| key == Some(&attribute));
                if pending.is_none() {
                    debug!("Ignoring read completion for {}", attribute);
                }
                trace!("Read {} bytes from {}", value.len(), attribute);
                complete(pending, Operation::Read, status, value);
            }
            ClientEvent::DescriptorWrite {
                characteristic,
                descriptor,
                status,
            } => self.on_descriptor_write(characteristic, descriptor, status),
            ClientEvent::CharacteristicChanged {
                characteristic,
                value,
            } => {
                let callback = self.state.lock().subscriptions.get(&characteristic);
                match callback {
                    Some(callback) => callback(&value),
                    None => trace!("Dropping value change for unsubscribed {}", characteristic),
                }
            }
        }
    }

    fn on_connected(&self) {
        let (pending, observer) = {
            let mut state = self.state.lock();
            if state.connection == ConnectionState::Disconnected && !state.connect.is_set() {
                debug!("Ignoring stale connected event");
                return;
            }
            state.connection = ConnectionState::Connected;
            (state.connect.take(), state.on_state.clone())
        };
        debug!("Connected to GATT server.");
        if let Some(p) = pending {
            p.resolve(Ok(()));
        }
        if let Some(observer) = observer {
            observer(ConnectionState::Connected);
        }
    }

    /// 非主动断开（对端断开、链路丢失、适配器关闭）
    fn on_link_lost(&self, reason: &str) {
        let (deferred, observer) = {
            let mut state = self.state.lock();
            if state.connection == ConnectionState::Disconnected && !state.any_pending() {
                return;
            }
            let deferred = state.flush_all(&GattError::Disconnected(reason.to_string()));
            state.reset_link();
            (deferred, state.on_state.clone())
        };
        warn!("{} ({} pending operation(s) failed)", reason, deferred.len());
        self.transport.disconnect();
        pending::run_deferred(deferred);
        if let Some(observer) = observer {
            observer(ConnectionState::Disconnected);
        }
    }

    fn on_services_discovered(&self, status: GattStatus, services: Vec<Service>) {
        let pending = {
            let mut state = self.state.lock();
            let pending = state.discover.take();
            if pending.is_some() && status.is_success() {
                state.services.clone_from(&services);
            }
            pending
        };
        let Some(pending) = pending else {
            debug!("Ignoring unsolicited service discovery result");
            return;
        };

        if status.is_success() {
            debug!("GATT services discovered.");
            for service in &services {
                debug!("Service: {}", service.uuid);
                for characteristic in &service.characteristics {
                    debug!(
                        "Characteristic: {} [{}]",
                        characteristic.uuid, characteristic.properties
                    );
                }
            }
            pending.resolve(Ok(services));
        } else {
            error!("Failed to discover services. (status: {})", status);
            pending.resolve(Err(GattError::TransportFailed {
                operation: Operation::Discover,
                status,
            }));
        }
    }

    fn on_descriptor_write(&self, characteristic: Uuid, descriptor: Uuid, status: GattStatus) {
        if descriptor != CCCD_UUID {
            let attribute = Attribute::Descriptor {
                characteristic,
                descriptor,
            };
            let pending = self.state.lock().write.take_if(|key| key == Some(&attribute));
            if pending.is_none() {
                debug!("Ignoring write completion for {}", attribute);
            }
            complete(pending, Operation::Write, status, ());
            return;
        }

        let mut state = self.state.lock();
        if let Some(p) = state
            .enable
            .take_if(|key| key.is_some_and(|k| k.characteristic == characteristic))
        {
            let (key, sink) = p.into_key();
            if status.is_success() {
                if let Some(key) = key {
                    state.subscriptions.insert(key.characteristic, key.on_value);
                }
                drop(state);
                debug!("Subscribed to {}", characteristic);
                sink(Ok(()));
            } else {
                drop(state);
                error!("Failed to subscribe to {} (status: {})", characteristic, status);
                sink(Err(GattError::TransportFailed {
                    operation: Operation::EnableNotification,
                    status,
                }));
            }
            return;
        }

        let pending = state.disable.take_if(|key| key == Some(&characteristic));
        drop(state);
        if pending.is_none() {
            debug!("Ignoring configuration write completion for {}", characteristic);
        }
        complete(pending, Operation::DisableNotification, status, ());
    }
}

/// 以传输层状态码结束请求
fn complete<K, R: Send + 'static>(
    pending: Option<pending::PendingOperation<K, R>>,
    operation: Operation,
    status: GattStatus,
    value: R,
) {
    let Some(pending) = pending else { return };
    if status.is_success() {
        pending.resolve(Ok(value));
    } else {
        pending.resolve(Err(GattError::TransportFailed { operation, status }));
    }
}
