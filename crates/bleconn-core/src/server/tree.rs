//! 声明式属性树
//!
//! 调用方用 [`ServiceSpec`] / [`CharacteristicSpec`] / [`DescriptorSpec`] 描述要暴露的服务，
//! [`AttributeTree::build`] 校验后生成只读的 arena，在一次 start/stop 周期内不再变化。

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::GattError;
use crate::gatt::{
    CCCD_UUID, Characteristic, Descriptor, GattStatus, PeerId, Permissions, Properties, Service,
    ServiceType,
};

/// 属性处理器的返回值
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerResponse {
    pub status: GattStatus,
    /// 读请求的响应数据，写请求忽略
    pub value: Vec<u8>,
}

impl HandlerResponse {
    pub fn success(value: impl Into<Vec<u8>>) -> Self {
        Self {
            status: GattStatus::SUCCESS,
            value: value.into(),
        }
    }

    pub fn status(status: GattStatus) -> Self {
        Self {
            status,
            value: Vec::new(),
        }
    }
}

impl Default for HandlerResponse {
    fn default() -> Self {
        Self::success(Vec::new())
    }
}

/// 读写请求处理器
///
/// 读请求时 `value` 为空。处理器在传输层的事件分发路径上同步执行，应当尽快返回。
pub trait AttributeHandler: Send + Sync {
    fn handle(&self, peer: &PeerId, value: &[u8]) -> HandlerResponse;
}

impl<F> AttributeHandler for F
where
    F: Fn(&PeerId, &[u8]) -> HandlerResponse + Send + Sync,
{
    fn handle(&self, peer: &PeerId, value: &[u8]) -> HandlerResponse {
        self(peer, value)
    }
}

/// 未声明处理器时使用：成功，空数据
struct DefaultHandler;

impl AttributeHandler for DefaultHandler {
    fn handle(&self, _peer: &PeerId, _value: &[u8]) -> HandlerResponse {
        HandlerResponse::default()
    }
}

pub type ValueProducer = Arc<dyn Fn() -> Vec<u8> + Send + Sync>;

/// 定时推送配置
#[derive(Clone)]
pub struct NotificationSpec {
    /// 推送间隔（秒），0 表示只允许 [`super::BleServer::notify_now`] 手动推送
    pub interval_secs: u64,
    pub producer: ValueProducer,
}

impl NotificationSpec {
    pub fn new(interval_secs: u64, producer: impl Fn() -> Vec<u8> + Send + Sync + 'static) -> Self {
        Self {
            interval_secs,
            producer: Arc::new(producer),
        }
    }
}

impl fmt::Debug for NotificationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationSpec")
            .field("interval_secs", &self.interval_secs)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct DescriptorSpec {
    pub uuid: Uuid,
    pub permissions: Permissions,
    pub handler: Option<Arc<dyn AttributeHandler>>,
}

impl DescriptorSpec {
    pub fn new(uuid: Uuid, permissions: Permissions) -> Self {
        Self {
            uuid,
            permissions,
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: impl AttributeHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }
}

#[derive(Clone)]
pub struct CharacteristicSpec {
    pub uuid: Uuid,
    pub properties: Properties,
    pub permissions: Permissions,
    pub handler: Option<Arc<dyn AttributeHandler>>,
    pub descriptors: Vec<DescriptorSpec>,
    pub notification: Option<NotificationSpec>,
}

impl CharacteristicSpec {
    pub fn new(uuid: Uuid, properties: Properties, permissions: Permissions) -> Self {
        Self {
            uuid,
            properties,
            permissions,
            handler: None,
            descriptors: Vec::new(),
            notification: None,
        }
    }

    pub fn with_handler(mut self, handler: impl AttributeHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn with_descriptor(mut self, descriptor: DescriptorSpec) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn with_notification(mut self, notification: NotificationSpec) -> Self {
        self.notification = Some(notification);
        self
    }
}

#[derive(Clone)]
pub struct ServiceSpec {
    pub uuid: Uuid,
    pub service_type: ServiceType,
    pub characteristics: Vec<CharacteristicSpec>,
}

impl ServiceSpec {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            service_type: ServiceType::Primary,
            characteristics: Vec::new(),
        }
    }

    pub fn secondary(uuid: Uuid) -> Self {
        Self {
            service_type: ServiceType::Secondary,
            ..Self::new(uuid)
        }
    }

    pub fn with_characteristic(mut self, characteristic: CharacteristicSpec) -> Self {
        self.characteristics.push(characteristic);
        self
    }
}

// ============================================================================
// 构建后的 arena
// ============================================================================

pub struct DescriptorNode {
    pub uuid: Uuid,
    pub permissions: Permissions,
    handler: Arc<dyn AttributeHandler>,
}

impl DescriptorNode {
    pub fn handle(&self, peer: &PeerId, value: &[u8]) -> HandlerResponse {
        self.handler.handle(peer, value)
    }
}

pub struct CharacteristicNode {
    pub service: Uuid,
    pub uuid: Uuid,
    pub properties: Properties,
    pub permissions: Permissions,
    pub descriptors: Vec<DescriptorNode>,
    pub notification: Option<NotificationSpec>,
    handler: Arc<dyn AttributeHandler>,
}

impl CharacteristicNode {
    pub fn handle(&self, peer: &PeerId, value: &[u8]) -> HandlerResponse {
        self.handler.handle(peer, value)
    }

    pub fn descriptor(&self, uuid: Uuid) -> Option<&DescriptorNode> {
        self.descriptors.iter().find(|d| d.uuid == uuid)
    }

    /// 推送时是否要求对端确认
    pub fn uses_indication(&self) -> bool {
        self.properties.contains(Properties::INDICATE)
    }

    /// 定时推送在该秒是否到期
    pub fn is_due(&self, epoch_secs: u64) -> bool {
        self.notification
            .as_ref()
            .is_some_and(|n| n.interval_secs > 0 && epoch_secs % n.interval_secs == 0)
    }
}

pub struct ServiceNode {
    pub uuid: Uuid,
    pub service_type: ServiceType,
    characteristics: Vec<usize>,
}

/// 校验后的属性树
pub struct AttributeTree {
    services: Vec<ServiceNode>,
    characteristics: Vec<CharacteristicNode>,
    index: HashMap<Uuid, usize>,
}

impl AttributeTree {
    pub fn build(specs: Vec<ServiceSpec>) -> Result<Self, GattError> {
        let mut tree = Self {
            services: Vec::with_capacity(specs.len()),
            characteristics: Vec::new(),
            index: HashMap::new(),
        };

        for service in specs {
            let mut members = Vec::with_capacity(service.characteristics.len());
            for spec in service.characteristics {
                if tree.index.contains_key(&spec.uuid) {
                    return Err(GattError::InvalidArgument(format!(
                        "Duplicate characteristic {}",
                        spec.uuid
                    )));
                }
                let node = build_characteristic(service.uuid, spec)?;
                let slot = tree.characteristics.len();
                tree.index.insert(node.uuid, slot);
                tree.characteristics.push(node);
                members.push(slot);
            }
            tree.services.push(ServiceNode {
                uuid: service.uuid,
                service_type: service.service_type,
                characteristics: members,
            });
        }
        Ok(tree)
    }

    pub fn services(&self) -> &[ServiceNode] {
        &self.services
    }

    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicNode> {
        self.index.get(&uuid).map(|&i| &self.characteristics[i])
    }

    pub fn service_characteristics<'a>(
        &'a self,
        service: &'a ServiceNode,
    ) -> impl Iterator<Item = &'a CharacteristicNode> {
        service
            .characteristics
            .iter()
            .map(|&i| &self.characteristics[i])
    }

    /// 带推送配置的特征
    pub fn notifying(&self) -> impl Iterator<Item = &CharacteristicNode> {
        self.characteristics
            .iter()
            .filter(|c| c.notification.is_some())
    }

    /// 对端服务发现时看到的视图
    pub fn to_services(&self) -> Vec<Service> {
        self.services
            .iter()
            .map(|service| Service {
                uuid: service.uuid,
                service_type: service.service_type,
                characteristics: self
                    .service_characteristics(service)
                    .map(|c| Characteristic {
                        uuid: c.uuid,
                        properties: c.properties,
                        descriptors: c
                            .descriptors
                            .iter()
                            .map(|d| Descriptor { uuid: d.uuid })
                            .collect(),
                    })
                    .collect(),
            })
            .collect()
    }
}

fn build_characteristic(
    service: Uuid,
    spec: CharacteristicSpec,
) -> Result<CharacteristicNode, GattError> {
    let pushes = spec
        .properties
        .intersects(Properties::NOTIFY | Properties::INDICATE);
    if pushes && spec.notification.is_none() {
        return Err(GattError::InvalidArgument(format!(
            "Characteristic {} declares notify/indicate without a notification config",
            spec.uuid
        )));
    }

    let mut seen = HashSet::new();
    let mut descriptors = Vec::with_capacity(spec.descriptors.len() + 1);
    for d in spec.descriptors {
        if !seen.insert(d.uuid) {
            return Err(GattError::InvalidArgument(format!(
                "Duplicate descriptor {} on characteristic {}",
                d.uuid, spec.uuid
            )));
        }
        descriptors.push(DescriptorNode {
            uuid: d.uuid,
            permissions: d.permissions,
            handler: d.handler.unwrap_or_else(|| Arc::new(DefaultHandler)),
        });
    }
    if pushes && !seen.contains(&CCCD_UUID) {
        descriptors.push(DescriptorNode {
            uuid: CCCD_UUID,
            permissions: Permissions::READ | Permissions::WRITE,
            handler: Arc::new(DefaultHandler),
        });
    }

    Ok(CharacteristicNode {
        service,
        uuid: spec.uuid,
        properties: spec.properties,
        permissions: spec.permissions,
        descriptors,
        notification: spec.notification,
        handler: spec.handler.unwrap_or_else(|| Arc::new(DefaultHandler)),
    })
}
