//! BLE Scanner - 按过滤条件发现广播中的设备
//!
//! 扫描器只有"已开始/已停止"两种状态。传输层上报的结果在主机侧再按
//! [`ScanFilter`] 过滤一次，因为部分平台（如 BlueZ）只支持按服务 UUID 过滤。

use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{GattError, TransportError};

/// 一条扫描结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub service_uuids: Vec<Uuid>,
    /// 厂商 ID -> 厂商数据
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

/// 厂商数据过滤：前缀在掩码下逐字节比较
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManufacturerFilter {
    pub id: u16,
    pub data: Vec<u8>,
    /// 与 `data` 等长；为空时按全 0xFF 处理
    pub mask: Vec<u8>,
}

impl ManufacturerFilter {
    fn matches(&self, payload: &[u8]) -> bool {
        if payload.len() < self.data.len() {
            return false;
        }
        self.data.iter().enumerate().all(|(i, expected)| {
            let mask = self.mask.get(i).copied().unwrap_or(0xff);
            payload[i] & mask == expected & mask
        })
    }
}

/// 扫描过滤条件，所有已设置的字段都必须匹配
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    pub service_uuid: Option<Uuid>,
    pub manufacturer: Option<ManufacturerFilter>,
    pub address: Option<String>,
    pub name: Option<String>,
}

impl ScanFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service_uuid(mut self, uuid: Uuid) -> Self {
        self.service_uuid = Some(uuid);
        self
    }

    pub fn manufacturer_data(mut self, id: u16, data: &[u8], mask: &[u8]) -> Self {
        self.manufacturer = Some(ManufacturerFilter {
            id,
            data: data.to_vec(),
            mask: mask.to_vec(),
        });
        self
    }

    pub fn address(mut self, address: &str) -> Self {
        self.address = Some(address.to_string());
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn matches(&self, result: &ScanResult) -> bool {
        if let Some(uuid) = self.service_uuid {
            if !result.service_uuids.contains(&uuid) {
                return false;
            }
        }
        if let Some(filter) = &self.manufacturer {
            match result.manufacturer_data.get(&filter.id) {
                Some(payload) if filter.matches(payload) => {}
                _ => return false,
            }
        }
        if let Some(address) = &self.address {
            if !address.eq_ignore_ascii_case(&result.address) {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if result.name.as_deref() != Some(name.as_str()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScanMode {
    LowPower,
    #[default]
    Balanced,
    LowLatency,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSettings {
    pub mode: ScanMode,
    /// 同一设备的重复广播是否每次都上报
    pub allow_duplicates: bool,
}

/// 传输层上报的扫描事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Result(ScanResult),
    Batch(Vec<ScanResult>),
    Failed(TransportError),
}

pub trait ScanTransport: Send + Sync {
    fn start_scan(
        &self,
        filters: &[ScanFilter],
        settings: &ScanSettings,
        events: ScanEventSink,
    ) -> Result<(), TransportError>;

    fn stop_scan(&self);
}

type FoundCallback = Arc<dyn Fn(ScanResult) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(TransportError) + Send + Sync>;

struct ActiveScan {
    generation: u64,
    filters: Arc<Vec<ScanFilter>>,
    on_found: FoundCallback,
    on_error: ErrorCallback,
}

#[derive(Default)]
struct ScanState {
    active: Option<ActiveScan>,
    generation: u64,
}

/// 传输层回送扫描事件的入口；扫描停止后投递的事件被丢弃
#[derive(Clone)]
pub struct ScanEventSink {
    state: Weak<Mutex<ScanState>>,
    generation: u64,
}

impl ScanEventSink {
    /// 返回事件是否属于仍在进行的扫描
    pub fn send(&self, event: ScanEvent) -> bool {
        let Some(state) = self.state.upgrade() else {
            return false;
        };
        let mut state = state.lock();
        let current = state
            .active
            .as_ref()
            .is_some_and(|a| a.generation == self.generation);
        if !current {
            return false;
        }

        match event {
            ScanEvent::Failed(e) => {
                let Some(active) = state.active.take() else {
                    return false;
                };
                drop(state);
                warn!("Scan failed: {}", e);
                (active.on_error)(e);
            }
            ScanEvent::Result(result) => {
                let (filters, on_found) = clone_dispatch(&state);
                drop(state);
                deliver(&filters, &on_found, result);
            }
            ScanEvent::Batch(results) => {
                let (filters, on_found) = clone_dispatch(&state);
                drop(state);
                for result in results {
                    deliver(&filters, &on_found, result);
                }
            }
        }
        true
    }
}

fn clone_dispatch(state: &ScanState) -> (Arc<Vec<ScanFilter>>, FoundCallback) {
    match &state.active {
        Some(active) => (active.filters.clone(), active.on_found.clone()),
        None => (Arc::new(Vec::new()), Arc::new(|_: ScanResult| {})),
    }
}

fn deliver(filters: &[ScanFilter], on_found: &FoundCallback, result: ScanResult) {
    if filters.is_empty() || filters.iter().any(|f| f.matches(&result)) {
        trace!("Scan result: {} ({:?})", result.address, result.name);
        on_found(result);
    }
}

pub struct BleScanner {
    transport: Arc<dyn ScanTransport>,
    state: Arc<Mutex<ScanState>>,
}

impl BleScanner {
    pub fn new(transport: Arc<dyn ScanTransport>) -> Self {
        Self {
            transport,
            state: Arc::new(Mutex::new(ScanState::default())),
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.state.lock().active.is_some()
    }

    /// 开始扫描；`filters` 为空时上报所有结果
    pub fn start(
        &self,
        filters: Vec<ScanFilter>,
        settings: ScanSettings,
        on_found: impl Fn(ScanResult) + Send + Sync + 'static,
        on_error: impl Fn(TransportError) + Send + Sync + 'static,
    ) -> Result<(), GattError> {
        let filters = Arc::new(filters);
        let sink = {
            let mut state = self.state.lock();
            if state.active.is_some() {
                return Err(GattError::InvalidState("Scan already in progress".into()));
            }
            state.generation += 1;
            state.active = Some(ActiveScan {
                generation: state.generation,
                filters: filters.clone(),
                on_found: Arc::new(on_found),
                on_error: Arc::new(on_error),
            });
            ScanEventSink {
                state: Arc::downgrade(&self.state),
                generation: state.generation,
            }
        };

        debug!("Starting scan with {} filter(s), {:?}", filters.len(), settings.mode);
        if let Err(e) = self.transport.start_scan(&filters, &settings, sink.clone()) {
            let mut state = self.state.lock();
            if state
                .active
                .as_ref()
                .is_some_and(|a| a.generation == sink.generation)
            {
                state.active = None;
            }
            warn!("Failed to start scan: {}", e);
            return Err(GattError::rejected(&e));
        }
        Ok(())
    }

    /// 停止扫描（幂等）
    pub fn stop(&self) {
        if self.state.lock().active.take().is_some() {
            self.transport.stop_scan();
            debug!("Scan stopped");
        }
    }

    /// 扫描一段时间，返回按地址去重后的结果（同一地址保留最后一次）
    pub async fn scan_for(
        &self,
        filters: Vec<ScanFilter>,
        settings: ScanSettings,
        duration: Duration,
    ) -> Result<Vec<ScanResult>, GattError> {
        let found: Arc<Mutex<BTreeMap<String, ScanResult>>> = Arc::default();
        let (failed_tx, failed_rx) = tokio::sync::oneshot::channel();
        let failed_tx = Mutex::new(Some(failed_tx));

        let sink = found.clone();
        self.start(
            filters,
            settings,
            move |result| {
                sink.lock().insert(result.address.to_uppercase(), result);
            },
            move |e| {
                if let Some(tx) = failed_tx.lock().take() {
                    let _ = tx.send(e);
                }
            },
        )?;

        info!("Starting BLE scan for {} seconds", duration.as_secs());
        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            Ok(e) = failed_rx => {
                return Err(GattError::rejected(&e));
            }
        }
        self.stop();

        let results: Vec<ScanResult> = std::mem::take(&mut *found.lock()).into_values().collect();
        info!("Scan complete: found {} device(s)", results.len());
        Ok(results)
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        self.stop();
    }
}
