//! btleplug 客户端传输层

use btleplug::api::{
    Central, CentralEvent, Characteristic as BtCharacteristic, Descriptor as BtDescriptor,
    Manager as _, Peripheral as _, ScanFilter, WriteType as BtWriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::{ClientEvent, ClientEventSink, ClientTransport};
use crate::error::TransportError;
use crate::gatt::{
    CCCD_UUID, Characteristic, ConnectionState, DISABLE_NOTIFICATION_VALUE, Descriptor,
    GattStatus, Properties, Service, ServiceType, WriteType,
};

const DISCOVERY_WINDOW: Duration = Duration::from_secs(5);

struct Connection {
    /// 连接建立前为 None
    peripheral: Option<Peripheral>,
    token: CancellationToken,
}

pub struct BtleplugClientTransport {
    runtime: Handle,
    adapter: Adapter,
    sink: Mutex<Option<ClientEventSink>>,
    connection: Arc<Mutex<Option<Connection>>>,
    /// 本地开启了值变化转发的特征
    notifying: Arc<Mutex<HashSet<Uuid>>>,
}

impl BtleplugClientTransport {
    /// 使用第一个可用的适配器
    pub async fn new() -> anyhow::Result<Arc<Self>> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No Bluetooth adapters found"))?;
        Ok(Arc::new(Self {
            runtime: Handle::current(),
            adapter,
            sink: Mutex::new(None),
            connection: Arc::new(Mutex::new(None)),
            notifying: Arc::new(Mutex::new(HashSet::new())),
        }))
    }

    fn sink(&self) -> Option<ClientEventSink> {
        self.sink.lock().clone()
    }

    fn peripheral(&self) -> Result<Peripheral, TransportError> {
        self.connection
            .lock()
            .as_ref()
            .and_then(|c| c.peripheral.clone())
            .ok_or_else(|| TransportError::NotReady("not connected".into()))
    }

    fn characteristic(&self, uuid: Uuid) -> Result<(Peripheral, BtCharacteristic), TransportError> {
        let peripheral = self.peripheral()?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| TransportError::Other(format!("Characteristic not found: {uuid}")))?;
        Ok((peripheral, characteristic))
    }

    /// 在运行时上执行请求，完成后把结果事件回送给客户端
    fn spawn_request<F>(&self, request: F)
    where
        F: Future<Output = Option<ClientEvent>> + Send + 'static,
    {
        let sink = self.sink();
        self.runtime.spawn(async move {
            if let (Some(event), Some(sink)) = (request.await, sink) {
                sink.send(event);
            }
        });
    }
}

async fn lookup(adapter: &Adapter, address: &str) -> Result<Option<Peripheral>, btleplug::Error> {
    for peripheral in adapter.peripherals().await? {
        if let Some(props) = peripheral.properties().await? {
            if props.address.to_string().eq_ignore_ascii_case(address) {
                return Ok(Some(peripheral));
            }
        }
    }
    Ok(None)
}

/// 先查已知设备，找不到时短暂扫描
async fn find_device(adapter: &Adapter, address: &str) -> Result<Peripheral, btleplug::Error> {
    if let Some(peripheral) = lookup(adapter, address).await? {
        return Ok(peripheral);
    }

    debug!("{} not cached, scanning for it", address);
    adapter.start_scan(ScanFilter::default()).await?;
    let deadline = tokio::time::Instant::now() + DISCOVERY_WINDOW;
    let found = loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        if let Some(peripheral) = lookup(adapter, address).await? {
            break Some(peripheral);
        }
        if tokio::time::Instant::now() >= deadline {
            break None;
        }
    };
    let _ = adapter.stop_scan().await;
    found.ok_or(btleplug::Error::DeviceNotFound)
}

fn to_services(peripheral: &Peripheral) -> Vec<Service> {
    peripheral
        .services()
        .into_iter()
        .map(|s| Service {
            uuid: s.uuid,
            service_type: if s.primary {
                ServiceType::Primary
            } else {
                ServiceType::Secondary
            },
            characteristics: s
                .characteristics
                .into_iter()
                .map(|c| Characteristic {
                    uuid: c.uuid,
                    properties: Properties::from_bits_truncate(c.properties.bits()),
                    descriptors: c
                        .descriptors
                        .into_iter()
                        .map(|d| Descriptor { uuid: d.uuid })
                        .collect(),
                })
                .collect(),
        })
        .collect()
}

fn status_of<T>(result: &Result<T, btleplug::Error>) -> GattStatus {
    match result {
        Ok(_) => GattStatus::SUCCESS,
        Err(e) => {
            error!("BLE request failed: {}", e);
            GattStatus::FAILURE
        }
    }
}

fn find_descriptor(
    characteristic: BtCharacteristic,
    descriptor: Uuid,
) -> Result<BtDescriptor, TransportError> {
    characteristic
        .descriptors
        .into_iter()
        .find(|d| d.uuid == descriptor)
        .ok_or_else(|| TransportError::Other(format!("Descriptor not found: {descriptor}")))
}

impl ClientTransport for BtleplugClientTransport {
    fn bind(&self, events: ClientEventSink) {
        *self.sink.lock() = Some(events);
    }

    fn connect(&self, address: &str) -> Result<(), TransportError> {
        if self.connection.lock().is_some() {
            return Err(TransportError::Other("already connected".into()));
        }
        let Some(sink) = self.sink() else {
            return Err(TransportError::NotReady("transport not bound".into()));
        };

        let token = CancellationToken::new();
        *self.connection.lock() = Some(Connection {
            peripheral: None,
            token: token.clone(),
        });

        let adapter = self.adapter.clone();
        let address = address.to_string();
        let connection = self.connection.clone();
        let notifying = self.notifying.clone();

        self.runtime.spawn(async move {
            let connected = async {
                let peripheral = find_device(&adapter, &address).await?;
                info!("Connecting to {}", address);
                peripheral.connect().await?;
                Ok::<_, btleplug::Error>(peripheral)
            };
            let peripheral = tokio::select! {
                () = token.cancelled() => return,
                result = connected => match result {
                    Ok(p) => p,
                    Err(e) => {
                        error!("Failed to connect to {}: {}", address, e);
                        if !token.is_cancelled() {
                            connection.lock().take();
                        }
                        sink.send(ClientEvent::ConnectionStateChanged(ConnectionState::Disconnected));
                        return;
                    }
                },
            };

            let registered = match connection.lock().as_mut() {
                Some(current) if !token.is_cancelled() => {
                    current.peripheral = Some(peripheral.clone());
                    true
                }
                _ => false,
            };
            if !registered {
                let _ = peripheral.disconnect().await;
                return;
            }
            sink.send(ClientEvent::ConnectionStateChanged(ConnectionState::Connected));

            if watch_connection(&adapter, &peripheral, &sink, &notifying, &token).await {
                connection.lock().take();
                notifying.lock().clear();
                sink.send(ClientEvent::ConnectionStateChanged(ConnectionState::Disconnected));
            }
        });
        Ok(())
    }

    fn disconnect(&self) {
        let Some(connection) = self.connection.lock().take() else {
            return;
        };
        connection.token.cancel();
        self.notifying.lock().clear();
        let Some(peripheral) = connection.peripheral else {
            return;
        };
        self.runtime.spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Failed to disconnect: {}", e);
            }
        });
    }

    fn discover_services(&self) -> Result<(), TransportError> {
        let peripheral = self.peripheral()?;
        self.spawn_request(async move {
            let result = peripheral.discover_services().await;
            let status = status_of(&result);
            let services = if status.is_success() {
                to_services(&peripheral)
            } else {
                Vec::new()
            };
            Some(ClientEvent::ServicesDiscovered { status, services })
        });
        Ok(())
    }

    fn request_mtu(&self, _mtu: u16) -> Result<(), TransportError> {
        // BlueZ 在连接时自动协商 MTU
        Err(TransportError::Unsupported)
    }

    fn read_characteristic(&self, characteristic: Uuid) -> Result<(), TransportError> {
        let (peripheral, target) = self.characteristic(characteristic)?;
        self.spawn_request(async move {
            let result = peripheral.read(&target).await;
            let status = status_of(&result);
            Some(ClientEvent::CharacteristicRead {
                characteristic,
                status,
                value: result.unwrap_or_default(),
            })
        });
        Ok(())
    }

    fn write_characteristic(
        &self,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), TransportError> {
        let (peripheral, target) = self.characteristic(characteristic)?;
        let value = value.to_vec();
        self.spawn_request(async move {
            match write_type {
                WriteType::WithResponse => {
                    let result = peripheral
                        .write(&target, &value, BtWriteType::WithResponse)
                        .await;
                    Some(ClientEvent::CharacteristicWrite {
                        characteristic,
                        status: status_of(&result),
                    })
                }
                WriteType::WithoutResponse => {
                    let result = peripheral
                        .write(&target, &value, BtWriteType::WithoutResponse)
                        .await;
                    status_of(&result);
                    None
                }
            }
        });
        Ok(())
    }

    fn set_notification_enabled(
        &self,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), TransportError> {
        self.characteristic(characteristic)?;
        let mut notifying = self.notifying.lock();
        if enabled {
            notifying.insert(characteristic);
        } else {
            notifying.remove(&characteristic);
        }
        Ok(())
    }

    fn read_descriptor(&self, characteristic: Uuid, descriptor: Uuid) -> Result<(), TransportError> {
        let (peripheral, target) = self.characteristic(characteristic)?;
        let target = find_descriptor(target, descriptor)?;
        self.spawn_request(async move {
            let result = peripheral.read_descriptor(&target).await;
            let status = status_of(&result);
            Some(ClientEvent::DescriptorRead {
                characteristic,
                descriptor,
                status,
                value: result.unwrap_or_default(),
            })
        });
        Ok(())
    }

    fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let (peripheral, target) = self.characteristic(characteristic)?;
        let value = value.to_vec();

        if descriptor == CCCD_UUID {
            // BlueZ 不允许直接写 CCCD，改用 StartNotify/StopNotify
            let enable = value.as_slice() != DISABLE_NOTIFICATION_VALUE;
            self.spawn_request(async move {
                let result = if enable {
                    peripheral.subscribe(&target).await
                } else {
                    peripheral.unsubscribe(&target).await
                };
                Some(ClientEvent::DescriptorWrite {
                    characteristic,
                    descriptor,
                    status: status_of(&result),
                })
            });
            return Ok(());
        }

        let target = find_descriptor(target, descriptor)?;
        self.spawn_request(async move {
            let result = peripheral.write_descriptor(&target, &value).await;
            Some(ClientEvent::DescriptorWrite {
                characteristic,
                descriptor,
                status: status_of(&result),
            })
        });
        Ok(())
    }
}

/// 转发值变化并监视断开，直到被取消；返回 true 表示链路由对端或系统断开
async fn watch_connection(
    adapter: &Adapter,
    peripheral: &Peripheral,
    sink: &ClientEventSink,
    notifying: &Mutex<HashSet<Uuid>>,
    cancelled: &CancellationToken,
) -> bool {
    let id = peripheral.id();
    let mut events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            error!("Failed to watch adapter events: {}", e);
            return false;
        }
    };
    let mut notifications = match peripheral.notifications().await {
        Ok(notifications) => notifications,
        Err(e) => {
            error!("Failed to watch notifications: {}", e);
            return false;
        }
    };

    loop {
        tokio::select! {
            () = cancelled.cancelled() => return false,
            Some(event) = events.next() => {
                if matches!(event, CentralEvent::DeviceDisconnected(ref gone) if *gone == id) {
                    debug!("Peripheral {:?} disconnected", id);
                    return true;
                }
            }
            Some(notification) = notifications.next() => {
                if notifying.lock().contains(&notification.uuid) {
                    sink.send(ClientEvent::CharacteristicChanged {
                        characteristic: notification.uuid,
                        value: notification.value,
                    });
                }
            }
            else => return true,
        }
    }
}
