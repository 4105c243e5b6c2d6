/// 呼叫状态定义与迁移表
use std::fmt;

/// 呼叫状态
///
/// Disconnected 是终态，没有任何迁移可以离开它
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// 出站 INVITE 已发出，尚无响应
    Initiating,
    /// 收到临时响应（出站），或收到入站 INVITE 等待应答
    Ringing,
    /// 应答已发送，等待对端确认
    Connecting,
    /// 通话中，媒体流活动
    Active,
    /// 保持中，媒体流数为 0
    OnHold,
    /// 挂断请求已发出，等待对端确认
    Disconnecting,
    /// 终态
    Disconnected,
}

impl CallState {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Disconnected)
    }

    /// 保持/静音等媒体子状态操作是否允许
    pub fn media_ops_allowed(&self) -> bool {
        matches!(self, CallState::Active | CallState::OnHold)
    }

    /// 状态迁移是否合法
    ///
    /// 致命的传输/协议错误允许从任意非终态直接进入 Disconnected
    pub fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;
        if next == Disconnected {
            return !self.is_terminal();
        }
        match (*self, next) {
            (Initiating, Ringing) => true,
            (Initiating, Active) => true,
            (Initiating, Disconnecting) => true,
            (Ringing, Connecting) => true,
            (Ringing, Active) => true,
            (Ringing, Disconnecting) => true,
            (Connecting, Active) => true,
            (Connecting, Disconnecting) => true,
            (Active, OnHold) => true,
            (Active, Disconnecting) => true,
            (OnHold, Active) => true,
            (OnHold, Disconnecting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CallState::Initiating => "Initiating",
            CallState::Ringing => "Ringing",
            CallState::Connecting => "Connecting",
            CallState::Active => "Active",
            CallState::OnHold => "OnHold",
            CallState::Disconnecting => "Disconnecting",
            CallState::Disconnected => "Disconnected",
        };
        write!(f, "{}", text)
    }
}

/// 呼叫方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// 入站呼叫
    Inbound,
    /// 出站呼叫
    Outbound,
}

/// 媒体子状态
///
/// 音频流数为 0 表示保持，1 表示正常通话
#[derive(Debug, Clone, PartialEq)]
pub struct MediaState {
    pub muted: bool,
    pub tx_level: f32,
    pub rx_level: f32,
    pub audio_stream_count: u32,
}

impl Default for MediaState {
    fn default() -> Self {
        Self {
            muted: false,
            tx_level: 1.0,
            rx_level: 1.0,
            audio_stream_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_state_has_no_exit() {
        use CallState::*;
        for next in [Initiating, Ringing, Connecting, Active, OnHold, Disconnecting, Disconnected] {
            assert!(!Disconnected.can_transition_to(next));
        }
    }

    #[test]
    fn test_fatal_error_path_from_any_state() {
        use CallState::*;
        for from in [Initiating, Ringing, Connecting, Active, OnHold, Disconnecting] {
            assert!(from.can_transition_to(Disconnected));
        }
    }

    #[test]
    fn test_hold_cycle_transitions() {
        assert!(CallState::Active.can_transition_to(CallState::OnHold));
        assert!(CallState::OnHold.can_transition_to(CallState::Active));
        // 保持状态之间不存在其它出路
        assert!(!CallState::OnHold.can_transition_to(CallState::Ringing));
    }

    #[test]
    fn test_media_ops_window() {
        assert!(CallState::Active.media_ops_allowed());
        assert!(CallState::OnHold.media_ops_allowed());
        assert!(!CallState::Ringing.media_ops_allowed());
        assert!(!CallState::Disconnected.media_ops_allowed());
    }
}
