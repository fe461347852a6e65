use conductive_bridge::{FanoutHub, MessagePublisher};
use conductive_shared::BoundaryPolicy;
use std::sync::Arc;

use crate::device_router::DeviceRouter;

/// 应用程序状态
///
/// 所有协作者显式注入，不使用全局单例
#[derive(Clone)]
pub struct AppState {
    /// 推送中心
    pub hub: Arc<FanoutHub>,
    /// MQTT 发布入口
    pub broker: Arc<dyn MessagePublisher>,
    /// 设备命令路由
    pub device: Arc<DeviceRouter>,
    /// 设备命令参数校验策略
    pub boundary_policy: BoundaryPolicy,
}

impl AppState {
    pub fn new(
        hub: Arc<FanoutHub>,
        broker: Arc<dyn MessagePublisher>,
        device: Arc<DeviceRouter>,
        boundary_policy: BoundaryPolicy,
    ) -> Self {
        Self {
            hub,
            broker,
            device,
            boundary_policy,
        }
    }
}
