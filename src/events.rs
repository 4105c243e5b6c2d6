/// 事件分发模块
///
/// 向应用回调投递注册状态、呼叫状态和来电通知。
/// 分发在状态迁移的临界区内同步完成，因此单个会话上的事件
/// 与状态迁移保持因果有序；终态通知按至少一次投递，
/// 监听器对重复的终态通知必须幂等
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::account::RegistrationState;
use crate::session::{CallId, CallState};

/// 会话事件
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// 注册状态变化
    RegistrationChanged {
        identity: String,
        state: RegistrationState,
        reason: Option<String>,
    },
    /// 来电
    IncomingCall { call_id: CallId, from: String },
    /// 呼叫状态变化
    CallStateChanged { call_id: CallId, state: CallState },
}

/// 应用侧事件监听能力接口
///
/// 所有方法都有默认空实现，应用只需覆盖关心的回调。
/// 可以注册任意多个互不相干的监听器
pub trait EventListener: Send + Sync {
    fn on_registration_changed(
        &self,
        _identity: &str,
        _state: RegistrationState,
        _reason: Option<&str>,
    ) {
    }

    fn on_incoming_call(&self, _call_id: &CallId, _from: &str) {}

    fn on_call_state_changed(&self, _call_id: &CallId, _state: CallState) {}
}

/// 事件分发器
pub struct EventDispatcher {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// 注册监听器
    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// 按注册顺序同步分发事件
    pub fn dispatch(&self, event: SessionEvent) {
        debug!("分发事件: {:?}", event);

        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for listener in listeners {
            match &event {
                SessionEvent::RegistrationChanged {
                    identity,
                    state,
                    reason,
                } => listener.on_registration_changed(identity, *state, reason.as_deref()),
                SessionEvent::IncomingCall { call_id, from } => {
                    listener.on_incoming_call(call_id, from)
                }
                SessionEvent::CallStateChanged { call_id, state } => {
                    listener.on_call_state_changed(call_id, *state)
                }
            }
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        states: Mutex<Vec<CallState>>,
    }

    impl EventListener for Recorder {
        fn on_call_state_changed(&self, _call_id: &CallId, state: CallState) {
            self.states.lock().unwrap().push(state);
        }
    }

    #[test]
    fn test_dispatch_reaches_all_listeners() {
        let dispatcher = EventDispatcher::new();
        let first = Arc::new(Recorder {
            states: Mutex::new(Vec::new()),
        });
        let second = Arc::new(Recorder {
            states: Mutex::new(Vec::new()),
        });
        dispatcher.add_listener(first.clone());
        dispatcher.add_listener(second.clone());

        let call_id = CallId::new();
        dispatcher.dispatch(SessionEvent::CallStateChanged {
            call_id: call_id.clone(),
            state: CallState::Ringing,
        });
        dispatcher.dispatch(SessionEvent::CallStateChanged {
            call_id,
            state: CallState::Active,
        });

        // 两个监听器都按迁移顺序收到事件
        assert_eq!(
            *first.states.lock().unwrap(),
            vec![CallState::Ringing, CallState::Active]
        );
        assert_eq!(
            *second.states.lock().unwrap(),
            vec![CallState::Ringing, CallState::Active]
        );
    }

    #[test]
    fn test_default_listener_ignores_everything() {
        struct Silent;
        impl EventListener for Silent {}

        let dispatcher = EventDispatcher::new();
        dispatcher.add_listener(Arc::new(Silent));
        dispatcher.dispatch(SessionEvent::IncomingCall {
            call_id: CallId::new(),
            from: "sip:5614@demo.example.com".to_string(),
        });
    }
}
