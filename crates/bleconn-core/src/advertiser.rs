//! BLE Advertiser - 发布可被扫描到的广播
//!
//! 广播器只有"已开始/已停止"两种状态；开始广播的结果由传输层异步回报。

use log::{debug, error, info};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{GattError, TransportError};

/// 广播内容
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertiseData {
    /// 广播中携带的本地名称
    pub local_name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    /// 厂商 ID -> 厂商数据
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    pub service_data: BTreeMap<Uuid, Vec<u8>>,
    pub include_tx_power: bool,
}

impl AdvertiseData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_name(mut self, name: &str) -> Self {
        self.local_name = Some(name.to_string());
        self
    }

    pub fn service_uuid(mut self, uuid: Uuid) -> Self {
        self.service_uuids.push(uuid);
        self
    }

    pub fn manufacturer_data(mut self, id: u16, data: &[u8]) -> Self {
        self.manufacturer_data.insert(id, data.to_vec());
        self
    }

    pub fn service_data(mut self, uuid: Uuid, data: &[u8]) -> Self {
        self.service_data.insert(uuid, data.to_vec());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AdvertiseMode {
    LowPower,
    #[default]
    Balanced,
    LowLatency,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TxPowerLevel {
    UltraLow,
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertiseSettings {
    pub mode: AdvertiseMode,
    pub tx_power: TxPowerLevel,
    pub connectable: bool,
    /// 广播持续时间，`None` 表示直到 stop
    pub timeout: Option<Duration>,
}

impl Default for AdvertiseSettings {
    fn default() -> Self {
        Self {
            mode: AdvertiseMode::default(),
            tx_power: TxPowerLevel::default(),
            connectable: true,
            timeout: None,
        }
    }
}

/// 开始广播的结果回报
pub type AdvertiseCompletion = Box<dyn FnOnce(Result<(), TransportError>) + Send>;

pub trait AdvertiseTransport: Send + Sync {
    /// 发起广播，结果通过 `completion` 回报（可以同步调用）
    fn start_advertising(
        &self,
        settings: &AdvertiseSettings,
        data: &AdvertiseData,
        completion: AdvertiseCompletion,
    ) -> Result<(), TransportError>;

    fn stop_advertising(&self);
}

type StartSink = Box<dyn FnOnce(Result<(), GattError>) + Send>;

#[derive(Default)]
enum Phase {
    #[default]
    Stopped,
    Starting {
        generation: u64,
        sink: StartSink,
    },
    Advertising,
}

#[derive(Default)]
struct AdvertiserState {
    phase: Phase,
    generation: u64,
}

pub struct BleAdvertiser {
    transport: Arc<dyn AdvertiseTransport>,
    state: Arc<Mutex<AdvertiserState>>,
}

impl BleAdvertiser {
    pub fn new(transport: Arc<dyn AdvertiseTransport>) -> Self {
        Self {
            transport,
            state: Arc::new(Mutex::new(AdvertiserState::default())),
        }
    }

    pub fn is_advertising(&self) -> bool {
        matches!(self.state.lock().phase, Phase::Advertising)
    }

    pub fn start_with(
        &self,
        settings: &AdvertiseSettings,
        data: &AdvertiseData,
        callback: impl FnOnce(Result<(), GattError>) + Send + 'static,
    ) {
        let generation = {
            let mut state = self.state.lock();
            if !matches!(state.phase, Phase::Stopped) {
                drop(state);
                callback(Err(GattError::InvalidState(
                    "Advertising already started".into(),
                )));
                return;
            }
            state.generation += 1;
            let generation = state.generation;
            state.phase = Phase::Starting {
                generation,
                sink: Box::new(callback),
            };
            generation
        };

        let weak = Arc::downgrade(&self.state);
        let completion: AdvertiseCompletion = Box::new(move |result| {
            let Some(state) = weak.upgrade() else { return };
            let mut state = state.lock();
            let sink = match std::mem::take(&mut state.phase) {
                Phase::Starting {
                    generation: g,
                    sink,
                } if g == generation => sink,
                other => {
                    state.phase = other;
                    debug!("Ignoring stale advertising result");
                    return;
                }
            };
            match result {
                Ok(()) => {
                    state.phase = Phase::Advertising;
                    drop(state);
                    info!("Advertising started successfully");
                    sink(Ok(()));
                }
                Err(e) => {
                    drop(state);
                    error!("Advertising failed: {}", e);
                    sink(Err(GattError::rejected(&e)));
                }
            }
        });

        debug!("Starting advertising: {:?}", data);
        if let Err(e) = self.transport.start_advertising(settings, data, completion) {
            let sink = {
                let mut state = self.state.lock();
                match std::mem::take(&mut state.phase) {
                    Phase::Starting {
                        generation: g,
                        sink,
                    } if g == generation => Some(sink),
                    other => {
                        state.phase = other;
                        None
                    }
                }
            };
            if let Some(sink) = sink {
                error!("Failed to start advertising: {}", e);
                sink(Err(GattError::rejected(&e)));
            }
        }
    }

    pub async fn start(
        &self,
        settings: &AdvertiseSettings,
        data: &AdvertiseData,
    ) -> Result<(), GattError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.start_with(settings, data, move |result| {
            let _ = tx.send(result);
        });
        rx.await
            .unwrap_or_else(|_| Err(GattError::InvalidState("Advertiser dropped".into())))
    }

    /// 停止广播（幂等）；尚未确认的 start 以错误结束
    pub fn stop(&self) {
        let previous = std::mem::take(&mut self.state.lock().phase);
        match previous {
            Phase::Stopped => return,
            Phase::Starting { sink, .. } => {
                sink(Err(GattError::InvalidState(
                    "Advertising stopped before it started".into(),
                )));
            }
            Phase::Advertising => {}
        }
        self.transport.stop_advertising();
        debug!("Advertising stopped");
    }
}

impl Drop for BleAdvertiser {
    fn drop(&mut self) {
        self.stop();
    }
}
