/// 会话注册表
///
/// 按 Call-ID 索引的会话竞技场：会话只由注册表销毁，
/// 且只在观察到 Disconnected 终态之后销毁，
/// 杜绝回调里悬空句柄的问题
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::{CallError, CallResult};
use crate::session::{CallId, CallSession};

pub struct SessionRegistry {
    sessions: Mutex<HashMap<CallId, Arc<CallSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// 登记会话
    ///
    /// 同一 Call-ID 只允许一个会话对象；重复登记返回 Conflict，
    /// 已有条目保持不变
    pub fn register(&self, session: Arc<CallSession>) -> CallResult<()> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());

        let call_id = session.id().clone();
        if sessions.contains_key(&call_id) {
            return Err(CallError::conflict(&call_id));
        }

        debug!("登记会话: {}", call_id);
        sessions.insert(call_id, session);
        Ok(())
    }

    /// 查找会话
    pub fn lookup(&self, call_id: &CallId) -> Option<Arc<CallSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(call_id)
            .cloned()
    }

    /// 回收已终止的会话
    ///
    /// 仅当会话已到达 Disconnected 时允许移除
    pub fn remove(&self, call_id: &CallId) -> CallResult<Arc<CallSession>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());

        let session = sessions
            .get(call_id)
            .cloned()
            .ok_or_else(|| CallError::invalid_argument(format!("未知的 Call-ID: {}", call_id)))?;

        if !session.state().is_terminal() {
            return Err(CallError::invalid_state("remove", session.state()));
        }

        debug!("回收会话: {}", call_id);
        sessions.remove(call_id);
        Ok(session)
    }

    /// 活动会话数
    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 当前全部活动会话的 Call-ID
    pub fn active_ids(&self) -> Vec<CallId> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Account, Credential};
    use crate::events::EventDispatcher;
    use crate::media::NullMediaEngine;
    use crate::transport::{LoopbackConfig, LoopbackTransport, SignalingResponse};

    fn test_session(call_id: CallId) -> Arc<CallSession> {
        let (transport, _events) = LoopbackTransport::new(LoopbackConfig::default());
        let identity: rsip::Uri = "sip:5613@demo.example.com".try_into().unwrap();
        let registrar: rsip::Uri = "sip:demo.example.com".try_into().unwrap();
        let account = Account::new(identity, registrar, Credential::digest("*", "5613", "pw"), 120);

        CallSession::outbound(
            call_id,
            account,
            "sip:5614@demo.example.com".to_string(),
            transport,
            Arc::new(NullMediaEngine),
            Arc::new(EventDispatcher::new()),
        )
    }

    #[test]
    fn test_duplicate_call_id_conflicts() {
        let registry = SessionRegistry::new();
        let call_id = CallId::new();

        let first = test_session(call_id.clone());
        let second = test_session(call_id.clone());

        registry.register(first.clone()).unwrap();
        let err = registry.register(second).unwrap_err();
        assert!(matches!(err, CallError::Conflict { .. }));

        // 第一个会话仍然在注册表里
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.lookup(&call_id).unwrap(), &first));
    }

    #[tokio::test]
    async fn test_remove_requires_terminal_state() {
        let registry = SessionRegistry::new();
        let call_id = CallId::new();
        let session = test_session(call_id.clone());
        registry.register(session.clone()).unwrap();

        // 未终止的会话不允许回收
        let err = registry.remove(&call_id).unwrap_err();
        assert!(matches!(err, CallError::InvalidState { .. }));
        assert_eq!(registry.len(), 1);

        session
            .handle_invite_response(SignalingResponse::new(486, None))
            .await
            .unwrap();
        registry.remove(&call_id).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_unknown_id() {
        let registry = SessionRegistry::new();
        let err = registry.remove(&CallId::new()).unwrap_err();
        assert!(matches!(err, CallError::InvalidArgument { .. }));
    }
}
