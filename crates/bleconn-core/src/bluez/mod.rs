//! BlueZ 平台传输层
//!
//! - 客户端：btleplug（中心角色）
//! - 服务端、扫描、广播、适配器状态：bluer（BlueZ D-Bus）
//!
//! 传输层的发起调用是同步的，实际的 D-Bus 交互在构造时捕获的 tokio 运行时上以任务形式执行，
//! 结果再以事件形式回送。

mod adapter;
mod advertiser;
mod client;
mod scanner;
mod server;

pub use adapter::BluezAdapterStateSource;
pub use advertiser::BluezAdvertiseTransport;
pub use client::BtleplugClientTransport;
pub use scanner::BluezScanTransport;
pub use server::BluezServerTransport;

/// 打开 BlueZ 会话并获取适配器（未指定名称时使用默认适配器），确保已上电
pub async fn open_adapter(
    name: Option<&str>,
) -> anyhow::Result<(bluer::Session, bluer::Adapter)> {
    log::debug!("Initializing BLE session...");
    let session = bluer::Session::new().await?;
    let adapter = match name {
        Some(name) => session.adapter(name)?,
        None => session.default_adapter().await?,
    };
    log::debug!("Powering on adapter: {}", adapter.name());
    adapter.set_powered(true).await?;
    Ok((session, adapter))
}
