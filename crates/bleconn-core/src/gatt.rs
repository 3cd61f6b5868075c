//! GATT 共享数据模型
//!
//! 客户端与服务端共用的 UUID 常量、属性/权限位掩码、状态码以及服务发现结果。

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 蓝牙基准 UUID `0000xxxx-0000-1000-8000-00805f9b34fb`
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// 由 16-bit 短 UUID 构造完整 UUID
pub const fn uuid16(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// Client Characteristic Configuration Descriptor
pub const CCCD_UUID: Uuid = uuid16(0x2902);

pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// BLE ATT 默认 MTU
pub const DEFAULT_MTU: u16 = 23;
/// BLE ATT 允许协商的最大 MTU
pub const MAX_MTU: u16 = 517;

bitflags::bitflags! {
    /// 特征属性（与 Android `BluetoothGattCharacteristic.PROPERTY_*` 数值一致）
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Properties: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_NO_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const SIGNED_WRITE = 0x40;
        const EXTENDED_PROPS = 0x80;
    }
}

bitflags::bitflags! {
    /// 特征/描述符访问权限
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Permissions: u16 {
        const READ = 0x01;
        const READ_ENCRYPTED = 0x02;
        const READ_ENCRYPTED_MITM = 0x04;
        const WRITE = 0x10;
        const WRITE_ENCRYPTED = 0x20;
        const WRITE_ENCRYPTED_MITM = 0x40;
        const WRITE_SIGNED = 0x80;
        const WRITE_SIGNED_MITM = 0x100;
    }
}

/// 以空格分隔的标志名，如 `READ WRITE NOTIFY`
impl fmt::Display for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        f.write_str(&names.join(" "))
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        f.write_str(&names.join(" "))
    }
}

impl Permissions {
    pub fn allows_read(self) -> bool {
        self.intersects(Self::READ | Self::READ_ENCRYPTED | Self::READ_ENCRYPTED_MITM)
    }

    pub fn allows_write(self) -> bool {
        self.intersects(
            Self::WRITE
                | Self::WRITE_ENCRYPTED
                | Self::WRITE_ENCRYPTED_MITM
                | Self::WRITE_SIGNED
                | Self::WRITE_SIGNED_MITM,
        )
    }
}

/// GATT 状态码（ATT 错误码，`FAILURE` 沿用 Android 的 0x101）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GattStatus(pub u16);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0x00);
    pub const READ_NOT_PERMITTED: GattStatus = GattStatus(0x02);
    pub const WRITE_NOT_PERMITTED: GattStatus = GattStatus(0x03);
    pub const REQUEST_NOT_SUPPORTED: GattStatus = GattStatus(0x06);
    pub const INVALID_OFFSET: GattStatus = GattStatus(0x07);
    pub const ATTRIBUTE_NOT_FOUND: GattStatus = GattStatus(0x0a);
    pub const INVALID_ATTRIBUTE_LENGTH: GattStatus = GattStatus(0x0d);
    pub const FAILURE: GattStatus = GattStatus(0x101);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 写入方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteType {
    /// 需要对端确认
    WithResponse,
    /// 不等待确认，传输层接受即视为成功
    WithoutResponse,
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// 服务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ServiceType {
    #[default]
    Primary,
    Secondary,
}

/// 对端身份（通常为蓝牙地址）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// 服务发现得到的描述符
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub uuid: Uuid,
}

/// 服务发现得到的特征
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub properties: Properties,
    pub descriptors: Vec<Descriptor>,
}

impl Characteristic {
    pub fn descriptor(&self, uuid: Uuid) -> Option<&Descriptor> {
        self.descriptors.iter().find(|d| d.uuid == uuid)
    }
}

/// 服务发现得到的服务
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub uuid: Uuid,
    pub service_type: ServiceType,
    pub characteristics: Vec<Characteristic>,
}

/// 客户端读写的目标：特征值，或特征下的某个描述符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    Characteristic(Uuid),
    Descriptor { characteristic: Uuid, descriptor: Uuid },
}

impl Attribute {
    /// 所属特征
    pub fn characteristic(self) -> Uuid {
        match self {
            Attribute::Characteristic(uuid) => uuid,
            Attribute::Descriptor { characteristic, .. } => characteristic,
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attribute::Characteristic(uuid) => write!(f, "{uuid}"),
            Attribute::Descriptor {
                characteristic,
                descriptor,
            } => write!(f, "{characteristic}/{descriptor}"),
        }
    }
}

/// 在服务列表中按 UUID 查找特征（第一个匹配项）
pub fn find_characteristic(services: &[Service], uuid: Uuid) -> Option<&Characteristic> {
    services
        .iter()
        .flat_map(|s| s.characteristics.iter())
        .find(|c| c.uuid == uuid)
}

/// 校验蓝牙地址格式 `XX:XX:XX:XX:XX:XX`
pub fn is_valid_address(address: &str) -> bool {
    let octets: Vec<&str> = address.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}
