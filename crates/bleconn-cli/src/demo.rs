//! 演示用 GATT 服务，以及基于回环传输层的演示流程

use anyhow::Result;
use bleconn_core::loopback::{LoopbackClientTransport, LoopbackServerTransport};
use bleconn_core::{
    BleClient, BleServer, CharacteristicSpec, HandlerResponse, NotificationSpec, PeerId,
    Permissions, Properties, ServiceSpec, Settings, WriteType,
};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_stream::StreamExt;
use uuid::Uuid;

pub const DEMO_SERVICE: Uuid = Uuid::from_u128(0x5b1e_0000_9f1c_4c2e_8a41_3c6d_2f0a_7e10);
pub const NAME_CHAR: Uuid = Uuid::from_u128(0x5b1e_0001_9f1c_4c2e_8a41_3c6d_2f0a_7e10);
pub const CONTROL_CHAR: Uuid = Uuid::from_u128(0x5b1e_0002_9f1c_4c2e_8a41_3c6d_2f0a_7e10);
pub const CLOCK_CHAR: Uuid = Uuid::from_u128(0x5b1e_0003_9f1c_4c2e_8a41_3c6d_2f0a_7e10);

const SERVER_ADDRESS: &str = "02:00:00:00:00:00";

fn clock_value() -> Vec<u8> {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    secs.to_le_bytes().to_vec()
}

/// 演示服务：只读名称、可写控制点、每秒推送的时钟
pub fn services(device_name: &str) -> Vec<ServiceSpec> {
    let name = device_name.as_bytes().to_vec();
    vec![
        ServiceSpec::new(DEMO_SERVICE)
            .with_characteristic(
                CharacteristicSpec::new(NAME_CHAR, Properties::READ, Permissions::READ)
                    .with_handler(move |_: &PeerId, _: &[u8]| {
                        HandlerResponse::success(name.clone())
                    }),
            )
            .with_characteristic(
                CharacteristicSpec::new(
                    CONTROL_CHAR,
                    Properties::WRITE | Properties::WRITE_NO_RESPONSE,
                    Permissions::WRITE,
                )
                .with_handler(|peer: &PeerId, value: &[u8]| {
                    tracing::info!("Control write from {}: {:02x?}", peer, value);
                    HandlerResponse::default()
                }),
            )
            .with_characteristic(
                CharacteristicSpec::new(
                    CLOCK_CHAR,
                    Properties::READ | Properties::NOTIFY,
                    Permissions::READ,
                )
                .with_handler(|_: &PeerId, _: &[u8]| HandlerResponse::success(clock_value()))
                .with_notification(NotificationSpec::new(1, clock_value)),
            ),
    ]
}

pub async fn run(settings: &Settings, seconds: u64, clients: u8) -> Result<()> {
    let hub = LoopbackServerTransport::new(SERVER_ADDRESS);
    let server = BleServer::new(hub.clone());
    server.start(services(&settings.device_name))?;
    tracing::info!("Demo server started at {}", SERVER_ADDRESS);

    let mut connected = Vec::new();
    for i in 1..=clients {
        let address = format!("02:00:00:00:01:{i:02X}");
        let client = BleClient::new(
            LoopbackClientTransport::new(&hub, &address),
            settings.client.clone(),
        );
        let label = address.clone();
        client
            .connect(SERVER_ADDRESS, move |state| {
                tracing::debug!("{} connection state: {:?}", label, state);
            })
            .await?;
        client.discover_services().await?;
        let mtu = client.request_mtu(247).await?;
        let name = client.read(NAME_CHAR).await?;
        tracing::info!(
            "{} connected, mtu={}, name='{}'",
            address,
            mtu,
            String::from_utf8_lossy(&name)
        );
        client
            .write(CONTROL_CHAR, &[i], WriteType::WithoutResponse)
            .await?;

        let mut values = client.subscribe_stream(CLOCK_CHAR, false).await?;
        tokio::spawn(async move {
            while let Some(value) = values.next().await {
                let secs = value
                    .get(..8)
                    .and_then(|b| b.try_into().ok())
                    .map(u64::from_le_bytes)
                    .unwrap_or_default();
                println!("[{address}] clock = {secs}");
            }
        });
        connected.push(client);
    }

    tokio::time::sleep(Duration::from_secs(seconds)).await;

    let summary = serde_json::json!({
        "connected_peers": server.connected_peers(),
        "clock_subscribers": server.subscribers(CLOCK_CHAR),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    for client in &connected {
        client.unsubscribe(CLOCK_CHAR).await?;
        client.disconnect();
    }
    server.stop();
    tracing::info!("Demo finished");
    Ok(())
}
