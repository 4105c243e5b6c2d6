/// 呼叫会话模块
///
/// 一次呼叫从 INVITE 协商到挂断的完整状态机，
/// 含保持/静音子状态
mod call;
mod state;

pub use call::CallSession;
pub use state::{CallState, Direction, MediaState};

use std::fmt;

/// 呼叫唯一标识
///
/// 同一时刻每个活动呼叫只对应一个 CallSession 对象
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallId(String);

impl CallId {
    /// 生成新的基于 UUID 的 Call-ID
    pub fn new() -> Self {
        Self(crate::utils::make_call_id(None))
    }

    /// 从已有字符串构造（入站呼叫沿用对端的 Call-ID）
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CallId {
    fn from(raw: &str) -> Self {
        Self::from_raw(raw)
    }
}
