//! 基于 BlueZ 的命令

use anyhow::Result;
use bleconn_core::advertiser::{AdvertiseData, AdvertiseSettings};
use bleconn_core::bluez::{
    self, BluezAdapterStateSource, BluezAdvertiseTransport, BluezScanTransport,
    BluezServerTransport, BtleplugClientTransport,
};
use bleconn_core::{
    AdapterStateMonitor, BleAdvertiser, BleClient, BleScanner, BleServer, ScanFilter,
    ScanSettings, Settings,
};
use std::time::Duration;
use uuid::Uuid;

use crate::demo;

pub async fn scan(
    settings: &Settings,
    timeout: u64,
    service: Option<Uuid>,
    json: bool,
) -> Result<()> {
    let (_session, adapter) = bluez::open_adapter(settings.adapter.as_deref()).await?;
    let scanner = BleScanner::new(BluezScanTransport::new(adapter));
    let filters = service
        .map(|uuid| vec![ScanFilter::new().service_uuid(uuid)])
        .unwrap_or_default();

    println!("🔍 扫描设备 ({timeout}s)...");
    let results = scanner
        .scan_for(filters, ScanSettings::default(), Duration::from_secs(timeout))
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else if results.is_empty() {
        println!("   未发现设备");
    } else {
        for (i, result) in results.iter().enumerate() {
            println!(
                "   [{}] {} ({}) rssi={}",
                i,
                result.name.as_deref().unwrap_or("<unknown>"),
                result.address,
                result.rssi.map_or_else(|| "-".to_string(), |r| r.to_string())
            );
        }
    }
    Ok(())
}

pub async fn serve(settings: &Settings) -> Result<()> {
    let (_session, adapter) = bluez::open_adapter(settings.adapter.as_deref()).await?;

    let monitor = AdapterStateMonitor::new(BluezAdapterStateSource::new(adapter.clone()));
    monitor.start(|state| tracing::warn!("Adapter state changed: {:?}", state))?;

    let server = BleServer::new(BluezServerTransport::new(adapter.clone()));
    server.start(demo::services(&settings.device_name))?;

    let advertiser = BleAdvertiser::new(BluezAdvertiseTransport::new(adapter));
    let data = AdvertiseData::new()
        .local_name(&settings.device_name)
        .service_uuid(demo::DEMO_SERVICE);
    advertiser.start(&AdvertiseSettings::default(), &data).await?;

    tracing::info!(
        "Serving demo service as '{}', press Ctrl-C to stop",
        settings.device_name
    );
    tokio::signal::ctrl_c().await?;

    advertiser.stop();
    server.stop();
    monitor.stop();
    Ok(())
}

pub async fn probe(settings: &Settings, address: &str, reads: &[Uuid]) -> Result<()> {
    let client = BleClient::new(BtleplugClientTransport::new().await?, settings.client.clone());
    client
        .connect(address, |state| tracing::info!("Connection state: {:?}", state))
        .await?;

    let services = client.discover_services().await?;
    println!("{}", serde_json::to_string_pretty(&services)?);

    for &uuid in reads {
        match client.read(uuid).await {
            Ok(value) => println!("{uuid}: {value:02x?}"),
            Err(e) => eprintln!("❌ {uuid}: {e}"),
        }
    }

    client.disconnect();
    Ok(())
}
