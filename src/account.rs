/// 账户数据模型
///
/// Account 是一个可廉价克隆的句柄，注册状态只由 RegistrationManager 修改
use std::fmt;
use std::sync::{Arc, Mutex};

/// 账户注册状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// 未注册
    Unregistered,
    /// 注册请求已发出，等待响应
    Registering,
    /// 已注册
    Registered,
    /// 注册失败（刷新循环会继续重试）
    Failed,
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RegistrationState::Unregistered => "Unregistered",
            RegistrationState::Registering => "Registering",
            RegistrationState::Registered => "Registered",
            RegistrationState::Failed => "Failed",
        };
        write!(f, "{}", text)
    }
}

/// 认证凭证
///
/// 附加到账户后不可变
#[derive(Debug, Clone)]
pub struct Credential {
    /// 认证方案（如 "digest"）
    pub scheme: String,

    /// 认证域，"*" 表示通配
    pub realm: String,

    /// 用户名
    pub username: String,

    /// 密码
    pub secret: String,
}

impl Credential {
    /// 创建 digest 认证凭证
    pub fn digest(realm: impl Into<String>, username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            scheme: "digest".to_string(),
            realm: realm.into(),
            username: username.into(),
            secret: secret.into(),
        }
    }
}

/// SIP 账户
///
/// 身份 URI 和注册服务器 URI 在创建时已通过边界校验
#[derive(Clone)]
pub struct Account {
    inner: Arc<AccountInner>,
}

struct AccountInner {
    identity: rsip::Uri,
    registrar: rsip::Uri,
    credential: Credential,
    ttl_seconds: u32,
    state: Mutex<RegistrationState>,
}

impl Account {
    pub(crate) fn new(
        identity: rsip::Uri,
        registrar: rsip::Uri,
        credential: Credential,
        ttl_seconds: u32,
    ) -> Self {
        Self {
            inner: Arc::new(AccountInner {
                identity,
                registrar,
                credential,
                ttl_seconds,
                state: Mutex::new(RegistrationState::Unregistered),
            }),
        }
    }

    /// 身份 URI
    pub fn identity(&self) -> String {
        self.inner.identity.to_string()
    }

    /// 注册服务器 URI
    pub fn registrar(&self) -> String {
        self.inner.registrar.to_string()
    }

    /// 认证凭证
    pub fn credential(&self) -> &Credential {
        &self.inner.credential
    }

    /// 注册有效期（秒）
    pub fn ttl_seconds(&self) -> u32 {
        self.inner.ttl_seconds
    }

    /// 当前注册状态
    pub fn state(&self) -> RegistrationState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_state(&self, state: RegistrationState) {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = state;
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("identity", &self.identity())
            .field("registrar", &self.registrar())
            .field("state", &self.state())
            .finish()
    }
}
