use thiserror::Error;

/// 呼叫控制操作的Result类型别名
pub type CallResult<T> = Result<T, CallError>;

/// 呼叫控制相关错误类型
///
/// 每个失败的状态迁移要么停留在原状态，要么推进到 Disconnected，
/// 不存在中间的未定义状态
#[derive(Error, Debug)]
pub enum CallError {
    /// 输入在进入核心之前就被拒绝，不产生任何状态
    #[error("无效参数: {reason}")]
    InvalidArgument { reason: String },

    /// 操作在当前状态机位置不合法
    #[error("非法状态: {operation} 不能在 {state} 状态下执行")]
    InvalidState { operation: String, state: String },

    /// Call-ID 重复
    #[error("会话冲突: Call-ID {call_id} 已存在")]
    Conflict { call_id: String },

    /// 底层发送/接收失败（可恢复，触发重试或 Failed 状态）
    #[error("传输失败: {reason}")]
    TransportFailure { reason: String },

    /// 对端拒绝了媒体重协商（会话状态已回滚）
    #[error("重协商被拒绝: {status} {reason}")]
    NegotiationFailure { status: u16, reason: String },

    /// 配置相关错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
}

impl CallError {
    /// 判断错误是否可恢复（可用于重试逻辑）
    pub fn is_recoverable(&self) -> bool {
        match self {
            CallError::TransportFailure { .. } => true,
            CallError::InvalidArgument { .. } => false,
            CallError::InvalidState { .. } => false,
            CallError::Conflict { .. } => false,
            CallError::NegotiationFailure { .. } => false,
            CallError::Config(_) => false,
        }
    }

    /// 获取标准错误代码，用于日志分析和监控
    pub fn error_code(&self) -> &'static str {
        match self {
            CallError::InvalidArgument { .. } => "INVALID_ARGUMENT",
            CallError::InvalidState { .. } => "INVALID_STATE",
            CallError::Conflict { .. } => "CONFLICT",
            CallError::TransportFailure { .. } => "TRANSPORT_FAILURE",
            CallError::NegotiationFailure { .. } => "NEGOTIATION_FAILURE",
            CallError::Config(_) => "INVALID_CONFIG",
        }
    }

    /// 获取SIP状态码（如果有）
    pub fn sip_status_code(&self) -> Option<u16> {
        match self {
            CallError::NegotiationFailure { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// 创建无效参数错误
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        CallError::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// 创建非法状态错误
    pub fn invalid_state(operation: impl Into<String>, state: impl ToString) -> Self {
        CallError::InvalidState {
            operation: operation.into(),
            state: state.to_string(),
        }
    }

    /// 创建会话冲突错误
    pub fn conflict(call_id: impl ToString) -> Self {
        CallError::Conflict {
            call_id: call_id.to_string(),
        }
    }

    /// 创建传输失败错误
    pub fn transport_failure(reason: impl Into<String>) -> Self {
        CallError::TransportFailure {
            reason: reason.into(),
        }
    }

    /// 创建重协商失败错误
    pub fn negotiation_failure(status: u16, reason: Option<String>) -> Self {
        CallError::NegotiationFailure {
            status,
            reason: reason.unwrap_or_default(),
        }
    }
}

impl From<std::io::Error> for CallError {
    fn from(err: std::io::Error) -> Self {
        CallError::TransportFailure {
            reason: err.to_string(),
        }
    }
}

impl From<rsip::Error> for CallError {
    fn from(err: rsip::Error) -> Self {
        CallError::InvalidArgument {
            reason: err.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing required field: {0}")]
    Missing(String),
}

impl From<&str> for ConfigError {
    fn from(s: &str) -> Self {
        ConfigError::Invalid(s.to_string())
    }
}
