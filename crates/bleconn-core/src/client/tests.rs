//! BleClient 单元测试
//!
//! 使用记录调用的假传输层，事件由测试显式投递。

use super::*;
use crate::gatt::{Characteristic, Descriptor, ServiceType};
use std::collections::HashSet;
use std::time::Duration;

// ============================================================================
// 测试用传输层
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Connect(String),
    Disconnect,
    Discover,
    Mtu(u16),
    Read(Uuid),
    ReadDescriptor(Uuid, Uuid),
    Write(Uuid, Vec<u8>, WriteType),
    SetNotify(Uuid, bool),
    WriteDescriptor(Uuid, Uuid, Vec<u8>),
}

type Responder = Box<dyn Fn(&Call) -> Option<ClientEvent> + Send>;

#[derive(Default)]
struct FakeTransport {
    calls: Mutex<Vec<Call>>,
    sink: Mutex<Option<ClientEventSink>>,
    reject: Mutex<HashSet<&'static str>>,
    responder: Mutex<Option<Responder>>,
}

impl FakeTransport {
    fn emit(&self, event: ClientEvent) {
        let sink = self.sink.lock().clone().expect("transport not bound");
        sink.send(event);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    fn reject(&self, method: &'static str) {
        self.reject.lock().insert(method);
    }

    fn respond_with(&self, responder: impl Fn(&Call) -> Option<ClientEvent> + Send + 'static) {
        *self.responder.lock() = Some(Box::new(responder));
    }

    fn record(&self, method: &'static str, call: Call) -> Result<(), TransportError> {
        self.calls.lock().push(call.clone());
        if self.reject.lock().contains(method) {
            return Err(TransportError::Other(format!("{method} rejected")));
        }
        let event = self.responder.lock().as_ref().and_then(|r| r(&call));
        if let Some(event) = event {
            self.emit(event);
        }
        Ok(())
    }
}

impl ClientTransport for FakeTransport {
    fn bind(&self, events: ClientEventSink) {
        *self.sink.lock() = Some(events);
    }

    fn connect(&self, address: &str) -> Result<(), TransportError> {
        self.record("connect", Call::Connect(address.to_string()))
    }

    fn disconnect(&self) {
        self.calls.lock().push(Call::Disconnect);
    }

    fn discover_services(&self) -> Result<(), TransportError> {
        self.record("discover", Call::Discover)
    }

    fn request_mtu(&self, mtu: u16) -> Result<(), TransportError> {
        self.record("mtu", Call::Mtu(mtu))
    }

    fn read_characteristic(&self, characteristic: Uuid) -> Result<(), TransportError> {
        self.record("read", Call::Read(characteristic))
    }

    fn write_characteristic(
        &self,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), TransportError> {
        self.record(
            "write",
            Call::Write(characteristic, value.to_vec(), write_type),
        )
    }

    fn set_notification_enabled(
        &self,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), TransportError> {
        self.record("set_notify", Call::SetNotify(characteristic, enabled))
    }

    fn read_descriptor(&self, characteristic: Uuid, descriptor: Uuid) -> Result<(), TransportError> {
        self.record("read", Call::ReadDescriptor(characteristic, descriptor))
    }

    fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        self.record(
            "write_descriptor",
            Call::WriteDescriptor(characteristic, descriptor, value.to_vec()),
        )
    }
}

// ============================================================================
// 辅助函数
// ============================================================================

const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";
const SERVICE: Uuid = Uuid::from_u128(0xc27d7b88_26a5_4d6c_be82_7d7873dad979);
const INFO_CHAR: Uuid = Uuid::from_u128(0x5efe1dfb_f80a_411c_9a6b_41caf5ac6dba);
const WIFI_CHAR: Uuid = Uuid::from_u128(0x5cef40d1_c4c5_431c_b159_a7e895fce2bc);
const STATUS_CHAR: Uuid = Uuid::from_u128(0x55bedfda_55a9_4d2e_b2df_8d7e1ae3faf3);
const UNKNOWN_CHAR: Uuid = Uuid::from_u128(0xdead);
const LABEL_DESC: Uuid = gatt::uuid16(0x2901);

fn services() -> Vec<Service> {
    let cccd = vec![Descriptor { uuid: CCCD_UUID }];
    vec![Service {
        uuid: SERVICE,
        service_type: ServiceType::Primary,
        characteristics: vec![
            Characteristic {
                uuid: INFO_CHAR,
                properties: Properties::READ | Properties::NOTIFY,
                descriptors: vec![Descriptor { uuid: CCCD_UUID }, Descriptor { uuid: LABEL_DESC }],
            },
            Characteristic {
                uuid: WIFI_CHAR,
                properties: Properties::WRITE | Properties::WRITE_NO_RESPONSE,
                descriptors: vec![],
            },
            Characteristic {
                uuid: STATUS_CHAR,
                properties: Properties::READ | Properties::NOTIFY | Properties::INDICATE,
                descriptors: cccd,
            },
        ],
    }]
}

/// 收集回调结果
struct Outcome<R>(Arc<Mutex<Vec<Result<R, GattError>>>>);

impl<R: Clone + Send + 'static> Outcome<R> {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    fn sink(&self) -> impl FnOnce(Result<R, GattError>) + Send + 'static {
        let results = self.0.clone();
        move |r| results.lock().push(r)
    }

    fn results(&self) -> Vec<Result<R, GattError>> {
        self.0.lock().clone()
    }

    fn single(&self) -> Result<R, GattError> {
        let results = self.results();
        assert_eq!(results.len(), 1, "expected exactly one resolution");
        results.into_iter().next().unwrap()
    }
}

fn new_client() -> (BleClient, Arc<FakeTransport>) {
    let transport = Arc::new(FakeTransport::default());
    let client = BleClient::new(transport.clone(), ClientConfig::default());
    (client, transport)
}

/// 已连接并完成服务发现的客户端
fn connected_client() -> (BleClient, Arc<FakeTransport>) {
    let (client, transport) = new_client();
    let connect = Outcome::new();
    assert!(client.connect_with(ADDRESS, |_| {}, connect.sink()));
    transport.emit(ClientEvent::ConnectionStateChanged(ConnectionState::Connected));
    assert_eq!(connect.single(), Ok(()));

    let discover = Outcome::new();
    assert!(client.discover_services_with(discover.sink()));
    transport.emit(ClientEvent::ServicesDiscovered {
        status: GattStatus::SUCCESS,
        services: services(),
    });
    assert!(discover.single().is_ok());
    (client, transport)
}

fn subscribed_client(characteristic: Uuid) -> (BleClient, Arc<FakeTransport>, Arc<Mutex<Vec<Vec<u8>>>>) {
    let (client, transport) = connected_client();
    let values = Arc::new(Mutex::new(Vec::new()));
    let sink = values.clone();
    let subscribe = Outcome::new();
    client.subscribe_with(
        characteristic,
        false,
        move |v: &[u8]| sink.lock().push(v.to_vec()),
        subscribe.sink(),
    );
    transport.emit(ClientEvent::DescriptorWrite {
        characteristic,
        descriptor: CCCD_UUID,
        status: GattStatus::SUCCESS,
    });
    assert_eq!(subscribe.single(), Ok(()));
    (client, transport, values)
}

// ============================================================================
// connect / disconnect
// ============================================================================

#[test]
fn test_second_connect_is_busy_without_touching_transport() {
    let (client, transport) = new_client();
    let first = Outcome::new();
    let second = Outcome::new();

    assert!(client.connect_with(ADDRESS, |_| {}, first.sink()));
    assert!(!client.connect_with(ADDRESS, |_| {}, second.sink()));

    assert_eq!(second.single(), Err(GattError::Busy(Operation::Connect)));
    assert!(first.results().is_empty());
    assert_eq!(transport.count(|c| matches!(c, Call::Connect(_))), 1);
    assert_eq!(client.connection_state(), ConnectionState::Connecting);
}

#[test]
fn test_connect_rejects_invalid_address() {
    let (client, transport) = new_client();
    let outcome = Outcome::new();

    assert!(!client.connect_with("not-an-address", |_| {}, outcome.sink()));

    assert!(matches!(outcome.single(), Err(GattError::InvalidArgument(_))));
    assert!(transport.calls().is_empty());
}

#[test]
fn test_connect_rejected_by_transport_frees_slot() {
    let (client, transport) = new_client();
    transport.reject("connect");
    let outcome = Outcome::new();

    assert!(!client.connect_with(ADDRESS, |_| {}, outcome.sink()));
    assert!(matches!(outcome.single(), Err(GattError::TransportRejected(_))));
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);

    transport.reject.lock().clear();
    let retry = Outcome::new();
    assert!(client.connect_with(ADDRESS, |_| {}, retry.sink()));
}

#[test]
fn test_connect_while_connected_fails() {
    let (client, transport) = connected_client();
    let outcome = Outcome::new();

    assert!(!client.connect_with(ADDRESS, |_| {}, outcome.sink()));
    assert_eq!(outcome.single(), Err(GattError::AlreadyConnected));
    assert_eq!(transport.count(|c| matches!(c, Call::Connect(_))), 1);
}

#[test]
fn test_state_observer_fires_on_every_transition() {
    let (client, transport) = new_client();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observer = seen.clone();
    client.connect_with(ADDRESS, move |s| observer.lock().push(s), |_| {});

    transport.emit(ClientEvent::ConnectionStateChanged(ConnectionState::Connected));
    transport.emit(ClientEvent::ConnectionStateChanged(ConnectionState::Disconnected));

    assert_eq!(
        *seen.lock(),
        vec![ConnectionState::Connected, ConnectionState::Disconnected]
    );
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}

#[test]
fn test_disconnect_event_before_connected_fails_connect() {
    let (client, transport) = new_client();
    let outcome = Outcome::new();
    client.connect_with(ADDRESS, |_| {}, outcome.sink());

    transport.emit(ClientEvent::ConnectionStateChanged(ConnectionState::Disconnected));

    assert_eq!(
        outcome.single(),
        Err(GattError::Disconnected(LINK_LOST.to_string()))
    );
}

#[test]
fn test_disconnect_resolves_every_outstanding_slot_once() {
    let (client, transport, _values) = subscribed_client(STATUS_CHAR);

    let discover = Outcome::new();
    let mtu = Outcome::new();
    let read = Outcome::new();
    let write = Outcome::new();
    let enable = Outcome::new();
    let disable = Outcome::new();
    assert!(client.discover_services_with(discover.sink()));
    assert!(client.request_mtu_with(247, mtu.sink()));
    assert!(client.read_with(INFO_CHAR, read.sink()));
    assert!(client.write_with(WIFI_CHAR, b"ssid", WriteType::WithResponse, write.sink()));
    assert!(client.subscribe_with(INFO_CHAR, false, |_| {}, enable.sink()));
    assert!(client.unsubscribe_with(STATUS_CHAR, disable.sink()));

    client.disconnect();

    let expected = GattError::Disconnected(MANUAL_DISCONNECT.to_string());
    assert_eq!(discover.single().unwrap_err(), expected);
    assert_eq!(mtu.single().unwrap_err(), expected);
    assert_eq!(read.single().unwrap_err(), expected);
    assert_eq!(write.single().unwrap_err(), expected);
    assert_eq!(enable.single().unwrap_err(), expected);
    assert_eq!(disable.single().unwrap_err(), expected);
    assert_eq!(transport.count(|c| *c == Call::Disconnect), 1);

    // 迟到的完成事件不会再次触发回调
    transport.emit(ClientEvent::CharacteristicRead {
        characteristic: INFO_CHAR,
        status: GattStatus::SUCCESS,
        value: vec![1],
    });
    transport.emit(ClientEvent::MtuChanged {
        mtu: 247,
        status: GattStatus::SUCCESS,
    });
    assert_eq!(read.results().len(), 1);
    assert_eq!(mtu.results().len(), 1);
    assert!(!client.is_subscribed(STATUS_CHAR));
    assert!(client.services().is_empty());
}

#[test]
fn test_disconnect_flushes_pending_connect() {
    let (client, _transport) = new_client();
    let outcome = Outcome::new();
    client.connect_with(ADDRESS, |_| {}, outcome.sink());

    client.disconnect();

    assert_eq!(
        outcome.single(),
        Err(GattError::Disconnected(MANUAL_DISCONNECT.to_string()))
    );
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}

#[test]
fn test_disconnect_is_idempotent() {
    let (client, transport) = connected_client();
    client.disconnect();
    client.disconnect();
    assert_eq!(transport.count(|c| *c == Call::Disconnect), 1);

    // 未连接时断开不会触碰传输层
    let (idle, idle_transport) = new_client();
    idle.disconnect();
    assert!(idle_transport.calls().is_empty());
}

#[test]
fn test_stale_connected_event_after_disconnect_is_ignored() {
    let (client, transport) = new_client();
    client.connect_with(ADDRESS, |_| {}, |_| {});
    client.disconnect();

    transport.emit(ClientEvent::ConnectionStateChanged(ConnectionState::Connected));

    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}

// ============================================================================
// timeout sweep
// ============================================================================

#[test]
fn test_sweep_times_out_slot_and_ignores_late_completion() {
    let (client, transport) = connected_client();
    let read = Outcome::new();
    assert!(client.read_with(INFO_CHAR, read.sink()));

    client.inner.check_timeouts(Instant::now() + Duration::from_secs(3));
    assert!(read.results().is_empty());

    client.inner.check_timeouts(Instant::now() + Duration::from_secs(6));
    assert_eq!(read.single(), Err(GattError::Timeout(Operation::Read)));

    transport.emit(ClientEvent::CharacteristicRead {
        characteristic: INFO_CHAR,
        status: GattStatus::SUCCESS,
        value: vec![0x42],
    });
    assert_eq!(read.results().len(), 1);

    // 槽位已释放，可以再次读取
    let again = Outcome::new();
    assert!(client.read_with(INFO_CHAR, again.sink()));
}

#[test]
fn test_connect_timeout_abandons_attempt() {
    let (client, transport) = new_client();
    let outcome = Outcome::new();
    client.connect_with(ADDRESS, |_| {}, outcome.sink());

    client
        .inner
        .check_timeouts(Instant::now() + Duration::from_secs(31));

    assert_eq!(outcome.single(), Err(GattError::Timeout(Operation::Connect)));
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert_eq!(transport.count(|c| *c == Call::Disconnect), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sweep_task_times_out_silent_transport() {
    let (client, transport) = new_client();

    let result = client.connect(ADDRESS, |_| {}).await;

    assert_eq!(result, Err(GattError::Timeout(Operation::Connect)));
    assert_eq!(transport.count(|c| *c == Call::Disconnect), 1);
}

// ============================================================================
// discover / mtu / read / write
// ============================================================================

#[test]
fn test_operations_require_connection() {
    let (client, transport) = new_client();
    let discover = Outcome::new();
    let read = Outcome::new();
    let write = Outcome::new();
    let subscribe = Outcome::new();

    client.discover_services_with(discover.sink());
    client.read_with(INFO_CHAR, read.sink());
    client.write_with(WIFI_CHAR, b"x", WriteType::WithoutResponse, write.sink());
    client.subscribe_with(INFO_CHAR, false, |_| {}, subscribe.sink());

    assert_eq!(discover.single().unwrap_err(), GattError::NotConnected);
    assert_eq!(read.single().unwrap_err(), GattError::NotConnected);
    assert_eq!(write.single().unwrap_err(), GattError::NotConnected);
    assert_eq!(subscribe.single().unwrap_err(), GattError::NotConnected);
    assert!(transport.calls().is_empty());
}

#[test]
fn test_discover_failure_reports_status() {
    let (client, transport) = new_client();
    client.connect_with(ADDRESS, |_| {}, |_| {});
    transport.emit(ClientEvent::ConnectionStateChanged(ConnectionState::Connected));

    let outcome = Outcome::new();
    client.discover_services_with(outcome.sink());
    let busy = Outcome::new();
    client.discover_services_with(busy.sink());
    transport.emit(ClientEvent::ServicesDiscovered {
        status: GattStatus::FAILURE,
        services: vec![],
    });

    assert_eq!(busy.single(), Err(GattError::Busy(Operation::Discover)));
    assert_eq!(
        outcome.single(),
        Err(GattError::TransportFailed {
            operation: Operation::Discover,
            status: GattStatus::FAILURE,
        })
    );
}

#[test]
fn test_mtu_negotiation() {
    let (client, transport) = connected_client();
    let outcome = Outcome::new();

    assert!(client.request_mtu_with(185, outcome.sink()));
    transport.emit(ClientEvent::MtuChanged {
        mtu: 185,
        status: GattStatus::SUCCESS,
    });

    assert_eq!(outcome.single(), Ok(185));
    assert_eq!(client.negotiated_mtu(), 185);

    let invalid = Outcome::new();
    assert!(!client.request_mtu_with(1024, invalid.sink()));
    assert!(matches!(invalid.single(), Err(GattError::InvalidArgument(_))));
}

#[test]
fn test_peer_initiated_mtu_change_is_recorded() {
    let (client, transport) = connected_client();

    transport.emit(ClientEvent::MtuChanged {
        mtu: 128,
        status: GattStatus::SUCCESS,
    });
    assert_eq!(client.negotiated_mtu(), 128);

    // 失败的交换不改变当前值
    transport.emit(ClientEvent::MtuChanged {
        mtu: 64,
        status: GattStatus::FAILURE,
    });
    assert_eq!(client.negotiated_mtu(), 128);
}

#[test]
fn test_single_read_outstanding_globally() {
    let (client, transport) = connected_client();
    let first = Outcome::new();
    let second = Outcome::new();

    assert!(client.read_with(INFO_CHAR, first.sink()));
    assert!(!client.read_with(STATUS_CHAR, second.sink()));
    assert_eq!(second.single(), Err(GattError::Busy(Operation::Read)));

    // 其他特征的完成事件不会结束当前读请求
    transport.emit(ClientEvent::CharacteristicRead {
        characteristic: STATUS_CHAR,
        status: GattStatus::SUCCESS,
        value: vec![9],
    });
    assert!(first.results().is_empty());

    transport.emit(ClientEvent::CharacteristicRead {
        characteristic: INFO_CHAR,
        status: GattStatus::SUCCESS,
        value: b"info".to_vec(),
    });
    assert_eq!(first.single(), Ok(b"info".to_vec()));
    assert_eq!(transport.count(|c| matches!(c, Call::Read(_))), 1);
}

#[test]
fn test_descriptor_read_shares_read_slot() {
    let (client, transport) = connected_client();
    let outcome = Outcome::new();
    let busy = Outcome::new();

    assert!(client.read_descriptor_with(INFO_CHAR, LABEL_DESC, outcome.sink()));
    assert!(!client.read_with(STATUS_CHAR, busy.sink()));
    assert_eq!(busy.single(), Err(GattError::Busy(Operation::Read)));

    // 同一特征的特征值读完成不会结束描述符读
    transport.emit(ClientEvent::CharacteristicRead {
        characteristic: INFO_CHAR,
        status: GattStatus::SUCCESS,
        value: vec![1],
    });
    assert!(outcome.results().is_empty());

    transport.emit(ClientEvent::DescriptorRead {
        characteristic: INFO_CHAR,
        descriptor: LABEL_DESC,
        status: GattStatus::SUCCESS,
        value: b"info".to_vec(),
    });
    assert_eq!(outcome.single(), Ok(b"info".to_vec()));
    assert_eq!(
        transport.calls().last(),
        Some(&Call::ReadDescriptor(INFO_CHAR, LABEL_DESC))
    );
    assert!(client.read_with(STATUS_CHAR, |_| {}));
}

#[test]
fn test_descriptor_write_shares_write_slot() {
    let (client, transport) = connected_client();
    let outcome = Outcome::new();
    let busy = Outcome::new();

    assert!(client.write_descriptor_with(INFO_CHAR, LABEL_DESC, b"name", outcome.sink()));
    assert!(!client.write_with(WIFI_CHAR, b"x", WriteType::WithResponse, busy.sink()));
    assert_eq!(busy.single(), Err(GattError::Busy(Operation::Write)));

    transport.emit(ClientEvent::DescriptorWrite {
        characteristic: INFO_CHAR,
        descriptor: LABEL_DESC,
        status: GattStatus::WRITE_NOT_PERMITTED,
    });
    assert_eq!(
        outcome.single(),
        Err(GattError::TransportFailed {
            operation: Operation::Write,
            status: GattStatus::WRITE_NOT_PERMITTED,
        })
    );
    assert!(transport.calls().contains(&Call::WriteDescriptor(
        INFO_CHAR,
        LABEL_DESC,
        b"name".to_vec()
    )));
}

#[test]
fn test_descriptor_access_is_validated() {
    let (client, transport) = connected_client();
    let before = transport.calls().len();

    let missing = Outcome::new();
    assert!(!client.read_descriptor_with(WIFI_CHAR, LABEL_DESC, missing.sink()));
    assert!(matches!(missing.single(), Err(GattError::InvalidArgument(_))));

    let configuration = Outcome::new();
    assert!(!client.write_descriptor_with(STATUS_CHAR, CCCD_UUID, &[1, 0], configuration.sink()));
    assert!(matches!(configuration.single(), Err(GattError::InvalidArgument(_))));

    assert_eq!(transport.calls().len(), before);
}

#[test]
fn test_read_unknown_characteristic() {
    let (client, transport) = connected_client();
    let outcome = Outcome::new();

    assert!(!client.read_with(UNKNOWN_CHAR, outcome.sink()));
    assert!(matches!(outcome.single(), Err(GattError::InvalidArgument(_))));
    assert_eq!(transport.count(|c| matches!(c, Call::Read(_))), 0);
}

#[test]
fn test_read_rejected_by_transport() {
    let (client, transport) = connected_client();
    transport.reject("read");
    let outcome = Outcome::new();

    assert!(!client.read_with(INFO_CHAR, outcome.sink()));
    assert!(matches!(outcome.single(), Err(GattError::TransportRejected(_))));

    transport.reject.lock().clear();
    assert!(client.read_with(INFO_CHAR, |_| {}));
}

#[test]
fn test_write_without_response_resolves_synchronously() {
    let (client, transport) = connected_client();
    let outcome = Outcome::new();

    assert!(client.write_with(WIFI_CHAR, b"ssid:psk", WriteType::WithoutResponse, outcome.sink()));

    assert_eq!(outcome.single(), Ok(()));
    assert!(transport.calls().contains(&Call::Write(
        WIFI_CHAR,
        b"ssid:psk".to_vec(),
        WriteType::WithoutResponse
    )));
    // 未占用写槽位
    assert!(client.write_with(WIFI_CHAR, b"x", WriteType::WithResponse, |_| {}));
}

#[test]
fn test_write_without_response_respects_busy_slot() {
    let (client, transport) = connected_client();
    let pending = Outcome::new();
    let busy = Outcome::new();

    client.write_with(WIFI_CHAR, b"a", WriteType::WithResponse, pending.sink());
    client.write_with(WIFI_CHAR, b"b", WriteType::WithoutResponse, busy.sink());

    assert_eq!(busy.single(), Err(GattError::Busy(Operation::Write)));
    assert_eq!(transport.count(|c| matches!(c, Call::Write(..))), 1);

    transport.emit(ClientEvent::CharacteristicWrite {
        characteristic: WIFI_CHAR,
        status: GattStatus::WRITE_NOT_PERMITTED,
    });
    assert_eq!(
        pending.single(),
        Err(GattError::TransportFailed {
            operation: Operation::Write,
            status: GattStatus::WRITE_NOT_PERMITTED,
        })
    );
}

#[test]
fn test_read_and_write_use_independent_slots() {
    let (client, transport) = connected_client();
    assert!(client.read_with(INFO_CHAR, |_| {}));
    assert!(client.write_with(WIFI_CHAR, b"x", WriteType::WithResponse, |_| {}));
    assert_eq!(transport.calls().len(), 4);
}

// ============================================================================
// subscribe / unsubscribe
// ============================================================================

#[test]
fn test_subscribe_writes_configuration_descriptor() {
    let (client, transport) = connected_client();
    client.subscribe_with(STATUS_CHAR, true, |_| {}, |_| {});

    let calls = transport.calls();
    assert!(calls.contains(&Call::SetNotify(STATUS_CHAR, true)));
    assert!(calls.contains(&Call::WriteDescriptor(
        STATUS_CHAR,
        CCCD_UUID,
        ENABLE_INDICATION_VALUE.to_vec()
    )));
    // 确认之前不算已订阅
    assert!(!client.is_subscribed(STATUS_CHAR));
}

#[test]
fn test_subscribe_delivers_values_until_unsubscribed() {
    let (client, transport, values) = subscribed_client(INFO_CHAR);
    assert!(client.is_subscribed(INFO_CHAR));

    transport.emit(ClientEvent::CharacteristicChanged {
        characteristic: INFO_CHAR,
        value: b"one".to_vec(),
    });
    assert_eq!(*values.lock(), vec![b"one".to_vec()]);

    let outcome = Outcome::new();
    assert!(client.unsubscribe_with(INFO_CHAR, outcome.sink()));
    assert!(!client.is_subscribed(INFO_CHAR));

    // 取消订阅请求发出后、确认之前到达的通知不再投递
    transport.emit(ClientEvent::CharacteristicChanged {
        characteristic: INFO_CHAR,
        value: b"late".to_vec(),
    });
    assert_eq!(values.lock().len(), 1);

    transport.emit(ClientEvent::DescriptorWrite {
        characteristic: INFO_CHAR,
        descriptor: CCCD_UUID,
        status: GattStatus::SUCCESS,
    });
    assert_eq!(outcome.single(), Ok(()));
    assert!(transport.calls().contains(&Call::WriteDescriptor(
        INFO_CHAR,
        CCCD_UUID,
        DISABLE_NOTIFICATION_VALUE.to_vec()
    )));
}

#[test]
fn test_subscribe_twice_fails() {
    let (client, _transport, _values) = subscribed_client(INFO_CHAR);
    let outcome = Outcome::new();

    assert!(!client.subscribe_with(INFO_CHAR, false, |_| {}, outcome.sink()));
    assert!(matches!(outcome.single(), Err(GattError::InvalidState(_))));
}

#[test]
fn test_subscribe_busy_while_enable_outstanding() {
    let (client, _transport) = connected_client();
    client.subscribe_with(INFO_CHAR, false, |_| {}, |_| {});
    let outcome = Outcome::new();

    client.subscribe_with(STATUS_CHAR, false, |_| {}, outcome.sink());

    assert_eq!(
        outcome.single(),
        Err(GattError::Busy(Operation::EnableNotification))
    );
}

#[test]
fn test_resubscribe_while_disable_outstanding_is_busy() {
    let (client, _transport, _values) = subscribed_client(INFO_CHAR);
    client.unsubscribe_with(INFO_CHAR, |_| {});
    let outcome = Outcome::new();

    client.subscribe_with(INFO_CHAR, false, |_| {}, outcome.sink());

    assert_eq!(
        outcome.single(),
        Err(GattError::Busy(Operation::DisableNotification))
    );
}

#[test]
fn test_subscribe_requires_matching_property() {
    let (client, _transport) = connected_client();
    let indicate = Outcome::new();
    let no_cccd = Outcome::new();

    client.subscribe_with(INFO_CHAR, true, |_| {}, indicate.sink());
    client.subscribe_with(WIFI_CHAR, false, |_| {}, no_cccd.sink());

    assert!(matches!(indicate.single(), Err(GattError::InvalidArgument(_))));
    assert!(matches!(no_cccd.single(), Err(GattError::InvalidArgument(_))));
}

#[test]
fn test_subscribe_failure_status_does_not_register() {
    let (client, transport) = connected_client();
    let outcome = Outcome::new();
    client.subscribe_with(INFO_CHAR, false, |_| {}, outcome.sink());

    transport.emit(ClientEvent::DescriptorWrite {
        characteristic: INFO_CHAR,
        descriptor: CCCD_UUID,
        status: GattStatus::FAILURE,
    });

    assert!(matches!(outcome.single(), Err(GattError::TransportFailed { .. })));
    assert!(!client.is_subscribed(INFO_CHAR));
}

#[test]
fn test_unsubscribe_requires_subscription() {
    let (client, _transport) = connected_client();
    let outcome = Outcome::new();

    assert!(!client.unsubscribe_with(INFO_CHAR, outcome.sink()));
    assert!(matches!(outcome.single(), Err(GattError::InvalidState(_))));
}

#[test]
fn test_link_loss_clears_subscriptions() {
    let (client, transport, values) = subscribed_client(INFO_CHAR);
    let read = Outcome::new();
    client.read_with(INFO_CHAR, read.sink());

    transport.emit(ClientEvent::ConnectionStateChanged(ConnectionState::Disconnected));

    assert_eq!(
        read.single(),
        Err(GattError::Disconnected(LINK_LOST.to_string()))
    );
    assert!(!client.is_subscribed(INFO_CHAR));
    transport.emit(ClientEvent::CharacteristicChanged {
        characteristic: INFO_CHAR,
        value: vec![1],
    });
    assert!(values.lock().is_empty());
}

#[test]
fn test_adapter_off_flushes_like_link_loss() {
    let (client, transport) = connected_client();
    let read = Outcome::new();
    client.read_with(INFO_CHAR, read.sink());

    let observer = client.adapter_state_observer();
    observer(AdapterState::TurningOn);
    assert!(read.results().is_empty());
    observer(AdapterState::TurningOff);

    assert_eq!(
        read.single(),
        Err(GattError::Disconnected(ADAPTER_OFF.to_string()))
    );
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert_eq!(transport.count(|c| *c == Call::Disconnect), 1);
}

// ============================================================================
// async 形式
// ============================================================================

#[tokio::test]
async fn test_async_operations_with_synchronous_transport() {
    let transport = Arc::new(FakeTransport::default());
    transport.respond_with(|call| match call {
        Call::Connect(_) => Some(ClientEvent::ConnectionStateChanged(
            ConnectionState::Connected,
        )),
        Call::Discover => Some(ClientEvent::ServicesDiscovered {
            status: GattStatus::SUCCESS,
            services: services(),
        }),
        Call::Read(id) => Some(ClientEvent::CharacteristicRead {
            characteristic: *id,
            status: GattStatus::SUCCESS,
            value: b"device".to_vec(),
        }),
        Call::ReadDescriptor(id, descriptor) => Some(ClientEvent::DescriptorRead {
            characteristic: *id,
            descriptor: *descriptor,
            status: GattStatus::SUCCESS,
            value: b"label".to_vec(),
        }),
        Call::WriteDescriptor(id, descriptor, _) => Some(ClientEvent::DescriptorWrite {
            characteristic: *id,
            descriptor: *descriptor,
            status: GattStatus::SUCCESS,
        }),
        _ => None,
    });
    let client = BleClient::new(transport.clone(), ClientConfig::default());

    client.connect(ADDRESS, |_| {}).await.unwrap();
    let discovered = client.discover_services().await.unwrap();
    assert_eq!(discovered.len(), 1);
    assert_eq!(client.read(INFO_CHAR).await.unwrap(), b"device".to_vec());
    assert_eq!(
        client.read_descriptor(INFO_CHAR, LABEL_DESC).await.unwrap(),
        b"label".to_vec()
    );
    client
        .write_descriptor(INFO_CHAR, LABEL_DESC, b"renamed")
        .await
        .unwrap();

    let mut stream = client.subscribe_stream(STATUS_CHAR, false).await.unwrap();
    transport.emit(ClientEvent::CharacteristicChanged {
        characteristic: STATUS_CHAR,
        value: b"ready".to_vec(),
    });
    use tokio_stream::StreamExt;
    assert_eq!(stream.next().await, Some(b"ready".to_vec()));

    client.unsubscribe(STATUS_CHAR).await.unwrap();
    client.disconnect();
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}
