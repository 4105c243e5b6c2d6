/// 工具函数模块
///
/// 提供日志初始化、Call-ID 生成等辅助函数

use std::net::IpAddr;
use uuid::Uuid;

/// 初始化日志订阅器
///
/// # 参数
/// * `level` - 日志级别（trace/debug/info/warn/error）
pub fn initialize_logging(level: &str) {
    let max_level = match level {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    let _ = tracing_subscriber::fmt()
        .with_max_level(max_level)
        .try_init();
}

/// 获取第一个非回环的网络接口 IP 地址
///
/// 遍历系统所有网络接口，返回第一个非回环的 IPv4 地址，
/// 用于构造对外公布的 Contact 地址
pub fn get_first_non_loopback_interface() -> Result<IpAddr, Box<dyn std::error::Error>> {
    for interface in get_if_addrs::get_if_addrs()? {
        if !interface.is_loopback() {
            match interface.addr {
                get_if_addrs::IfAddr::V4(ref addr) => return Ok(IpAddr::V4(addr.ip)),
                _ => continue,
            }
        }
    }
    Err("未找到 IPv4 接口".into())
}

/// 生成基于 UUID 的 Call-ID 字符串
///
/// 使用 UUID v4 确保全局唯一性
///
/// # 参数
/// * `domain` - 可选的域名后缀
///
/// # 示例
/// ```rust
/// use sip_session::utils::make_call_id;
///
/// let call_id = make_call_id(Some("example.com"));
/// // 生成类似: "550e8400-e29b-41d4-a716-446655440000@example.com"
///
/// let call_id = make_call_id(None);
/// // 生成类似: "550e8400-e29b-41d4-a716-446655440000"
/// ```
pub fn make_call_id(domain: Option<&str>) -> String {
    let uuid = Uuid::new_v4();

    match domain {
        Some(d) => format!("{}@{}", uuid, d),
        None => uuid.to_string(),
    }
}
