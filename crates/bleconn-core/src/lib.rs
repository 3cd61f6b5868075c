//! BLE Connection Core Library
//!
//! 主机侧的 GATT 抽象：扫描、广播、连接客户端和连接服务端。
//!
//! # 模块
//!
//! - **client**: GATT 客户端，每类操作同一时刻只允许一个在途请求，带超时和断开清理
//! - **server**: GATT 服务端，声明式属性树、CCCD 订阅管理和定时推送
//! - **scanner** / **advertiser**: 扫描与广播
//! - **adapter**: 适配器电源状态监听
//! - **loopback**: 进程内的传输层实现，客户端和服务端直接互连
//! - **bluez**: BlueZ 平台传输层（需要 `bluez` feature）
//!
//! 各组件都通过传输层 trait 与平台交互，平台回调以事件形式送回组件。
//!
//! # 使用示例
//!
//! ```ignore
//! use bleconn_core::{BleClient, BleServer, ClientConfig, loopback};
//!
//! // 1. 服务端注册属性树
//! let hub = loopback::LoopbackServerTransport::new("AA:BB:CC:DD:EE:FF");
//! let server = BleServer::new(hub.clone());
//! server.start(services)?;
//!
//! // 2. 客户端连接、发现服务并订阅
//! let client = BleClient::new(
//!     loopback::LoopbackClientTransport::new(&hub, "11:22:33:44:55:66"),
//!     ClientConfig::default(),
//! );
//! client.connect("AA:BB:CC:DD:EE:FF", |_| {}).await?;
//! client.discover_services().await?;
//! client.subscribe(CLOCK_UUID, false, |value| println!("{value:?}")).await?;
//! ```

pub mod adapter;
pub mod advertiser;
#[cfg(feature = "bluez")]
pub mod bluez;
pub mod client;
pub mod config;
pub mod error;
pub mod gatt;
pub mod logging;
pub mod loopback;
pub mod pending;
pub mod scanner;
pub mod server;

pub use adapter::{AdapterState, AdapterStateMonitor, AdapterStateSource};
pub use advertiser::{AdvertiseData, AdvertiseSettings, AdvertiseTransport, BleAdvertiser};
pub use client::{BleClient, ClientEvent, ClientEventSink, ClientTransport};
pub use config::{ClientConfig, Settings};
pub use error::{GattError, Operation, TransportError};
pub use gatt::{
    Attribute, CCCD_UUID, Characteristic, ConnectionState, Descriptor, GattStatus, PeerId, Permissions,
    Properties, Service, ServiceType, WriteType,
};
pub use logging::LogLevel;
pub use scanner::{BleScanner, ScanFilter, ScanResult, ScanSettings, ScanTransport};
pub use server::{
    BleServer, CharacteristicSpec, DescriptorSpec, HandlerResponse, NotificationSpec,
    ServerEvent, ServerEventSink, ServerTransport, ServiceSpec,
};
