//! bluer 扫描传输层

use bluer::{Adapter, AdapterEvent, DiscoveryFilter, DiscoveryTransport};
use futures_util::StreamExt;
use log::{debug, info, trace};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::scanner::{ScanEvent, ScanEventSink, ScanFilter, ScanResult, ScanSettings, ScanTransport};

pub struct BluezScanTransport {
    runtime: Handle,
    adapter: Adapter,
    scanning: Mutex<Option<CancellationToken>>,
}

impl BluezScanTransport {
    pub fn new(adapter: Adapter) -> Arc<Self> {
        Arc::new(Self {
            runtime: Handle::current(),
            adapter,
            scanning: Mutex::new(None),
        })
    }
}

async fn read_device(adapter: &Adapter, address: bluer::Address) -> bluer::Result<ScanResult> {
    let device = adapter.device(address)?;
    Ok(ScanResult {
        address: address.to_string(),
        name: device.name().await?,
        rssi: device.rssi().await?,
        service_uuids: device
            .uuids()
            .await?
            .unwrap_or_default()
            .into_iter()
            .collect(),
        manufacturer_data: device.manufacturer_data().await?.unwrap_or_default(),
    })
}

async fn run_scan(
    adapter: Adapter,
    filter: DiscoveryFilter,
    events: ScanEventSink,
    cancelled: CancellationToken,
) {
    let discovered = async {
        adapter.set_discovery_filter(filter).await?;
        adapter.discover_devices().await
    };
    let mut discoverer = match discovered.await {
        Ok(discoverer) => discoverer,
        Err(e) => {
            events.send(ScanEvent::Failed(TransportError::Other(e.to_string())));
            return;
        }
    };
    info!("BLE scan started on {}", adapter.name());

    // 扫描开始前已缓存的设备也上报一次
    if let Ok(addresses) = adapter.device_addresses().await {
        debug!("Checking {} cached devices", addresses.len());
        let mut batch = Vec::new();
        for address in addresses {
            if let Ok(result) = read_device(&adapter, address).await {
                batch.push(result);
            }
        }
        if !batch.is_empty() {
            events.send(ScanEvent::Batch(batch));
        }
    }

    loop {
        tokio::select! {
            () = cancelled.cancelled() => break,
            event = discoverer.next() => match event {
                Some(AdapterEvent::DeviceAdded(address)) => {
                    match read_device(&adapter, address).await {
                        Ok(result) => {
                            if !events.send(ScanEvent::Result(result)) {
                                break;
                            }
                        }
                        Err(e) => trace!("Skipping device {}: {}", address, e),
                    }
                }
                Some(_) => {}
                None => {
                    events.send(ScanEvent::Failed(TransportError::NotReady(
                        "discovery stream closed".into(),
                    )));
                    break;
                }
            },
        }
    }
    debug!("BLE scan stopped");
}

impl ScanTransport for BluezScanTransport {
    fn start_scan(
        &self,
        filters: &[ScanFilter],
        settings: &ScanSettings,
        events: ScanEventSink,
    ) -> Result<(), TransportError> {
        let mut scanning = self.scanning.lock();
        if let Some(previous) = scanning.take() {
            previous.cancel();
        }

        // 只有全部过滤条件都带服务 UUID 时才能交给 BlueZ 预过滤，其余条件由扫描器匹配
        let uuids: HashSet<_> = filters.iter().filter_map(|f| f.service_uuid).collect();
        let prefilter = !filters.is_empty() && filters.iter().all(|f| f.service_uuid.is_some());
        let filter = DiscoveryFilter {
            uuids: if prefilter { uuids } else { HashSet::new() },
            transport: DiscoveryTransport::Le,
            duplicate_data: settings.allow_duplicates,
            ..Default::default()
        };

        let token = CancellationToken::new();
        self.runtime
            .spawn(run_scan(self.adapter.clone(), filter, events, token.clone()));
        *scanning = Some(token);
        Ok(())
    }

    fn stop_scan(&self) {
        if let Some(token) = self.scanning.lock().take() {
            token.cancel();
        }
    }
}
