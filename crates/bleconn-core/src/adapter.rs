//! 蓝牙适配器电源状态监听

use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::{GattError, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterState {
    Off,
    TurningOn,
    On,
    TurningOff,
}

impl AdapterState {
    /// 适配器即将或已经不可用
    pub fn is_going_down(self) -> bool {
        matches!(self, AdapterState::Off | AdapterState::TurningOff)
    }
}

pub type AdapterStateCallback = Arc<dyn Fn(AdapterState) + Send + Sync>;

/// 适配器状态来源（平台实现）
pub trait AdapterStateSource: Send + Sync {
    fn watch(&self, on_change: AdapterStateCallback) -> Result<(), TransportError>;
    fn unwatch(&self);
}

/// 适配器状态监听器，同一时刻只有一个观察者
pub struct AdapterStateMonitor {
    source: Arc<dyn AdapterStateSource>,
    observer: Mutex<Option<AdapterStateCallback>>,
}

impl AdapterStateMonitor {
    pub fn new(source: Arc<dyn AdapterStateSource>) -> Self {
        Self {
            source,
            observer: Mutex::new(None),
        }
    }

    pub fn is_started(&self) -> bool {
        self.observer.lock().is_some()
    }

    /// 开始监听；已在监听时忽略
    pub fn start(
        &self,
        on_change: impl Fn(AdapterState) + Send + Sync + 'static,
    ) -> Result<(), GattError> {
        let callback: AdapterStateCallback = Arc::new(on_change);
        {
            let mut observer = self.observer.lock();
            if observer.is_some() {
                debug!("Adapter state callback is already set");
                return Ok(());
            }
            *observer = Some(callback.clone());
        }

        if let Err(e) = self.source.watch(callback) {
            self.observer.lock().take();
            return Err(GattError::rejected(&e));
        }
        Ok(())
    }

    pub fn stop(&self) {
        if self.observer.lock().take().is_some() {
            self.source.unwatch();
            debug!("Adapter state monitor stopped");
        } else {
            debug!("Adapter state monitor is not running");
        }
    }
}
