//! bluer 适配器电源状态来源

use bluer::{Adapter, AdapterEvent, AdapterProperty};
use futures_util::StreamExt;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::adapter::{AdapterState, AdapterStateCallback, AdapterStateSource};
use crate::error::TransportError;

pub struct BluezAdapterStateSource {
    runtime: Handle,
    adapter: Adapter,
    watching: Mutex<Option<CancellationToken>>,
}

impl BluezAdapterStateSource {
    pub fn new(adapter: Adapter) -> Arc<Self> {
        Arc::new(Self {
            runtime: Handle::current(),
            adapter,
            watching: Mutex::new(None),
        })
    }
}

impl AdapterStateSource for BluezAdapterStateSource {
    fn watch(&self, on_change: AdapterStateCallback) -> Result<(), TransportError> {
        let token = CancellationToken::new();
        if let Some(previous) = self.watching.lock().replace(token.clone()) {
            previous.cancel();
        }

        let adapter = self.adapter.clone();
        self.runtime.spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Failed to watch adapter {}: {}", adapter.name(), e);
                    return;
                }
            };
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    event = events.next() => match event {
                        Some(AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered))) => {
                            debug!("Adapter {} powered: {}", adapter.name(), powered);
                            on_change(if powered { AdapterState::On } else { AdapterState::Off });
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        });
        Ok(())
    }

    fn unwatch(&self) {
        if let Some(token) = self.watching.lock().take() {
            token.cancel();
        }
    }
}
