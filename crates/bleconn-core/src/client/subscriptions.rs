//! 客户端订阅表：特征 UUID -> 值变化回调

use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub type ValueCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<Uuid, ValueCallback>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已存在时不覆盖，返回 false
    pub fn insert(&mut self, characteristic: Uuid, callback: ValueCallback) -> bool {
        if self.entries.contains_key(&characteristic) {
            return false;
        }
        self.entries.insert(characteristic, callback);
        true
    }

    pub fn remove(&mut self, characteristic: &Uuid) -> Option<ValueCallback> {
        self.entries.remove(characteristic)
    }

    pub fn get(&self, characteristic: &Uuid) -> Option<ValueCallback> {
        self.entries.get(characteristic).cloned()
    }

    pub fn contains(&self, characteristic: &Uuid) -> bool {
        self.entries.contains_key(characteristic)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
