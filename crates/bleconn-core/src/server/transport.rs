//! 服务端传输层接口

use uuid::Uuid;

use super::ServerEventSink;
use super::tree::AttributeTree;
use crate::error::TransportError;
use crate::gatt::{ConnectionState, GattStatus, PeerId};

pub trait ServerTransport: Send + Sync {
    /// 绑定事件接收端，服务端创建时调用一次
    fn bind(&self, events: ServerEventSink);

    /// 注册属性树并开始接受连接
    fn open(&self, tree: &AttributeTree) -> Result<(), TransportError>;

    fn close(&self);

    fn send_response(
        &self,
        peer: &PeerId,
        request_id: u32,
        status: GattStatus,
        offset: u16,
        value: &[u8],
    ) -> Result<(), TransportError>;

    /// 向对端推送特征值，`confirm` 为 true 时使用 indication
    fn notify(
        &self,
        peer: &PeerId,
        characteristic: Uuid,
        value: &[u8],
        confirm: bool,
    ) -> Result<(), TransportError>;
}

/// 传输层回送的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    PeerConnectionChanged {
        peer: PeerId,
        state: ConnectionState,
    },
    CharacteristicReadRequest {
        peer: PeerId,
        request_id: u32,
        characteristic: Uuid,
        offset: u16,
    },
    CharacteristicWriteRequest {
        peer: PeerId,
        request_id: u32,
        characteristic: Uuid,
        offset: u16,
        value: Vec<u8>,
        response_needed: bool,
        prepared: bool,
    },
    DescriptorReadRequest {
        peer: PeerId,
        request_id: u32,
        characteristic: Uuid,
        descriptor: Uuid,
        offset: u16,
    },
    DescriptorWriteRequest {
        peer: PeerId,
        request_id: u32,
        characteristic: Uuid,
        descriptor: Uuid,
        offset: u16,
        value: Vec<u8>,
        response_needed: bool,
        prepared: bool,
    },
    /// indication 的确认结果
    NotificationSent { peer: PeerId, status: GattStatus },
}
