/// Registration 模块
///
/// 维护单个账户对注册服务器的注册状态，包含周期性的
/// 注册刷新（keep-alive）
///
/// ## 生命周期
///
/// - `configure`: 边界校验后产出 Unregistered 账户
/// - `register`: 发出注册请求，完成是异步的，结果通过
///   `RegistrationChanged` 事件通知
/// - 注册成功后启动刷新循环，间隔 = max(1, ttl − 安全余量)
/// - `unregister`: 先同步停掉刷新循环再发送注销请求，
///   刷新永远不会与账户销毁并发执行

mod manager;

pub use manager::{refresh_interval_secs, RegistrationManager, REGISTRATION_SAFETY_MARGIN_SECS};
