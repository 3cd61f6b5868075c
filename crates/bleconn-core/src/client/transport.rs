//! 客户端传输层接口
//!
//! 传输层只负责"发起"请求，结果通过 [`ClientEvent`] 异步回送给 [`ClientEventSink`]。
//! 发起调用返回 `Err` 表示请求未被接受，此时不会再有对应的完成事件。

use uuid::Uuid;

use super::ClientEventSink;
use crate::adapter::AdapterState;
use crate::error::TransportError;
use crate::gatt::{ConnectionState, GattStatus, Service, WriteType};

pub trait ClientTransport: Send + Sync {
    /// 绑定事件接收端，客户端创建时调用一次
    fn bind(&self, events: ClientEventSink);

    fn connect(&self, address: &str) -> Result<(), TransportError>;

    /// 断开并释放连接资源
    fn disconnect(&self);

    fn discover_services(&self) -> Result<(), TransportError>;

    fn request_mtu(&self, mtu: u16) -> Result<(), TransportError>;

    fn read_characteristic(&self, characteristic: Uuid) -> Result<(), TransportError>;

    /// `WriteType::WithoutResponse` 时不会产生完成事件
    fn write_characteristic(
        &self,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), TransportError>;

    /// 本地开启/关闭值变化事件转发
    fn set_notification_enabled(
        &self,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), TransportError>;

    fn read_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Result<(), TransportError>;

    fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError>;
}

/// 传输层回送的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    ConnectionStateChanged(ConnectionState),
    ServicesDiscovered {
        status: GattStatus,
        services: Vec<Service>,
    },
    MtuChanged {
        mtu: u16,
        status: GattStatus,
    },
    CharacteristicRead {
        characteristic: Uuid,
        status: GattStatus,
        value: Vec<u8>,
    },
    CharacteristicWrite {
        characteristic: Uuid,
        status: GattStatus,
    },
    DescriptorRead {
        characteristic: Uuid,
        descriptor: Uuid,
        status: GattStatus,
        value: Vec<u8>,
    },
    DescriptorWrite {
        characteristic: Uuid,
        descriptor: Uuid,
        status: GattStatus,
    },
    CharacteristicChanged {
        characteristic: Uuid,
        value: Vec<u8>,
    },
    AdapterStateChanged(AdapterState),
}
