// 声明所有模块
pub mod account;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod registration;
pub mod registry;
pub mod session;
pub mod transport;
pub mod utils;

/// 重新导出thiserror错误类型
pub use crate::error::{CallError, CallResult, ConfigError};

/// 主要API重新导出，简化使用
pub use crate::account::{Account, Credential, RegistrationState};
pub use crate::client::SipClient;
pub use crate::config::Config as SipConfig;
pub use crate::events::{EventDispatcher, EventListener, SessionEvent};
pub use crate::media::{MediaEngine, NullMediaEngine};
pub use crate::registration::{
    refresh_interval_secs, RegistrationManager, REGISTRATION_SAFETY_MARGIN_SECS,
};
pub use crate::registry::SessionRegistry;
pub use crate::session::{CallId, CallSession, CallState, Direction, MediaState};
pub use crate::transport::{
    LoopbackConfig, LoopbackTransport, SignalingEvent, SignalingRequest, SignalingResponse,
    SignalingTransport,
};
pub use crate::utils as utils_mod;

/// SIP Session库的版本信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 便捷函数：快速创建挂在回环对端上的SIP客户端
///
/// 返回客户端和回环传输句柄，后者可用来注入来电、
/// 模拟对端挂断等
pub async fn create_loopback_client(
    server: &str,
    user: &str,
    password: &str,
) -> CallResult<(std::sync::Arc<SipClient>, std::sync::Arc<LoopbackTransport>)> {
    let config = config::Config::new(server, user, password)?;
    let (transport, events) = LoopbackTransport::new(LoopbackConfig::default());
    let client = SipClient::new(
        config,
        transport.clone(),
        events,
        std::sync::Arc::new(NullMediaEngine),
    )?;
    Ok((client, transport))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[tokio::test]
    async fn test_create_loopback_client() {
        let (client, _transport) =
            create_loopback_client("demo.example.com:5060", "5613", "secret")
                .await
                .unwrap();

        assert_eq!(client.account().state(), RegistrationState::Unregistered);
        assert!(client.active_calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_loopback_client_rejects_bad_config() {
        let result = create_loopback_client("", "5613", "secret").await;
        assert!(result.is_err());
    }
}
