/// 客户端配置模块
///
/// 在边界处完成字段校验，非法输入不会进入核心
use crate::error::ConfigError;

/// 默认注册有效期（秒）
pub const DEFAULT_TTL_SECONDS: u32 = 120;

/// 客户端配置
#[derive(Debug, Clone)]
pub struct Config {
    /// 注册服务器地址（如 "demo.example.com" 或 "demo.example.com:5060"）
    pub server: String,

    /// 身份 URI（如 "sip:5613@demo.example.com"）
    pub identity: String,

    /// SIP 用户名
    pub username: String,

    /// SIP 密码
    pub password: String,

    /// 认证域，"*" 表示通配
    pub realm: String,

    /// 注册有效期（秒），必须大于 0
    pub ttl_seconds: u32,

    /// User-Agent字符串
    pub user_agent: String,
}

impl Config {
    /// 创建新的客户端配置
    ///
    /// `user` 可以是纯用户名（"5613"）或完整格式（"5613@demo.example.com"），
    /// 身份 URI 由两者推导
    pub fn new(server: &str, user: &str, password: &str) -> Result<Self, ConfigError> {
        if server.trim().is_empty() {
            return Err(ConfigError::Missing("server".to_string()));
        }
        if user.trim().is_empty() {
            return Err(ConfigError::Missing("user".to_string()));
        }
        if password.is_empty() {
            return Err(ConfigError::Missing("password".to_string()));
        }

        let (username, identity) = if let Some((name, domain)) = user.split_once('@') {
            if name.is_empty() || domain.is_empty() {
                return Err(ConfigError::Invalid(format!("bad user format: {}", user)));
            }
            (name.to_string(), format!("sip:{}", user))
        } else {
            // 域名取服务器地址的主机部分
            let host = server.split(':').next().unwrap_or(server);
            (user.to_string(), format!("sip:{}@{}", user, host))
        };

        Ok(Self {
            server: server.to_string(),
            identity,
            username,
            password: password.to_string(),
            realm: "*".to_string(),
            ttl_seconds: DEFAULT_TTL_SECONDS,
            user_agent: format!("sip-session/{}", env!("CARGO_PKG_VERSION")),
        })
    }

    /// 注册服务器 URI
    pub fn registrar_uri(&self) -> String {
        format!("sip:{}", self.server)
    }

    /// 设置注册有效期
    pub fn with_ttl(mut self, ttl_seconds: u32) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    /// 设置认证域
    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }

    /// 设置 User-Agent
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}
