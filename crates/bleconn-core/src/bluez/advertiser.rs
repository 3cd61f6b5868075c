//! bluer 广播传输层

use bluer::Adapter;
use bluer::adv::{Advertisement, AdvertisementHandle, Feature, Type};
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::advertiser::{
    AdvertiseCompletion, AdvertiseData, AdvertiseSettings, AdvertiseTransport, TxPowerLevel,
};
use crate::error::TransportError;

struct Active {
    token: CancellationToken,
    handle: Arc<Mutex<Option<AdvertisementHandle>>>,
}

pub struct BluezAdvertiseTransport {
    runtime: Handle,
    adapter: Adapter,
    active: Arc<Mutex<Option<Active>>>,
}

impl BluezAdvertiseTransport {
    pub fn new(adapter: Adapter) -> Arc<Self> {
        Arc::new(Self {
            runtime: Handle::current(),
            adapter,
            active: Arc::new(Mutex::new(None)),
        })
    }
}

/// 发射功率档位对应的 dBm
fn tx_power_dbm(level: TxPowerLevel) -> i16 {
    match level {
        TxPowerLevel::UltraLow => -21,
        TxPowerLevel::Low => -15,
        TxPowerLevel::Medium => -7,
        TxPowerLevel::High => 1,
    }
}

fn advertisement(settings: &AdvertiseSettings, data: &AdvertiseData) -> Advertisement {
    let mut system_includes = BTreeSet::new();
    if data.include_tx_power {
        system_includes.insert(Feature::TxPower);
    }
    Advertisement {
        advertisement_type: if settings.connectable {
            Type::Peripheral
        } else {
            Type::Broadcast
        },
        service_uuids: data.service_uuids.iter().copied().collect(),
        manufacturer_data: data.manufacturer_data.clone(),
        service_data: data.service_data.clone(),
        local_name: data.local_name.clone(),
        discoverable: Some(settings.connectable),
        tx_power: Some(tx_power_dbm(settings.tx_power)),
        timeout: settings.timeout,
        system_includes,
        ..Default::default()
    }
}

impl AdvertiseTransport for BluezAdvertiseTransport {
    fn start_advertising(
        &self,
        settings: &AdvertiseSettings,
        data: &AdvertiseData,
        completion: AdvertiseCompletion,
    ) -> Result<(), TransportError> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(TransportError::Other("advertisement already registered".into()));
        }

        let adv = advertisement(settings, data);
        debug!("Advertising mode {:?} is left to BlueZ", settings.mode);
        let token = CancellationToken::new();
        let slot = Arc::new(Mutex::new(None));

        let adapter = self.adapter.clone();
        let registered = slot.clone();
        let cancelled = token.clone();
        let owner = Arc::downgrade(&self.active);
        self.runtime.spawn(async move {
            match adapter.advertise(adv).await {
                Ok(handle) => {
                    if cancelled.is_cancelled() {
                        // stop 已经发生，丢弃句柄即注销广播
                        drop(handle);
                        return;
                    }
                    *registered.lock() = Some(handle);
                    info!("BLE advertisement registered on {}", adapter.name());
                    completion(Ok(()));
                }
                Err(e) => {
                    if let Some(owner) = owner.upgrade() {
                        let mut active = owner.lock();
                        if active.as_ref().is_some_and(|a| Arc::ptr_eq(&a.handle, &registered)) {
                            active.take();
                        }
                    }
                    completion(Err(TransportError::Other(e.to_string())));
                }
            }
        });

        *active = Some(Active {
            token,
            handle: slot,
        });
        Ok(())
    }

    fn stop_advertising(&self) {
        if let Some(active) = self.active.lock().take() {
            active.token.cancel();
            active.handle.lock().take();
            debug!("BLE advertisement unregistered");
        }
    }
}
