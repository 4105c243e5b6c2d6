/// SIP 客户端核心模块
///
/// 把注册管理器、会话注册表、事件分发器和传输/媒体协作方
/// 组装成一个高层客户端门面；CLI 的每条命令 1:1 映射到
/// 这里的操作
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::account::{Account, Credential};
use crate::config::Config;
use crate::error::{CallError, CallResult};
use crate::events::{EventDispatcher, EventListener, SessionEvent};
use crate::media::MediaEngine;
use crate::registration::RegistrationManager;
use crate::registry::SessionRegistry;
use crate::session::{CallId, CallSession, CallState};
use crate::transport::{SignalingEvent, SignalingRequest, SignalingTransport};

/// SIP 客户端
pub struct SipClient {
    config: Config,
    account: Account,
    transport: Arc<dyn SignalingTransport>,
    media_engine: Arc<dyn MediaEngine>,
    dispatcher: Arc<EventDispatcher>,
    registry: Arc<SessionRegistry>,
    registration: RegistrationManager,
    cancel_token: CancellationToken,
}

impl SipClient {
    /// 创建新的SIP客户端并启动入站事件处理
    ///
    /// `events` 是传输层的入站事件流；必须在 Tokio 运行时内调用
    pub fn new(
        config: Config,
        transport: Arc<dyn SignalingTransport>,
        events: mpsc::Receiver<SignalingEvent>,
        media_engine: Arc<dyn MediaEngine>,
    ) -> CallResult<Arc<Self>> {
        let dispatcher = Arc::new(EventDispatcher::new());
        let cancel_token = CancellationToken::new();
        let registration = RegistrationManager::new(
            transport.clone(),
            dispatcher.clone(),
            cancel_token.clone(),
        );

        let credential = Credential::digest(
            config.realm.clone(),
            config.username.clone(),
            config.password.clone(),
        );
        let account = registration.configure(
            &config.identity,
            &config.registrar_uri(),
            credential,
            config.ttl_seconds,
        )?;

        let client = Arc::new(Self {
            config,
            account,
            transport,
            media_engine,
            dispatcher,
            registry: Arc::new(SessionRegistry::new()),
            registration,
            cancel_token,
        });

        Self::start_event_pump(client.clone(), events);
        Ok(client)
    }

    /// 启动传入事件处理器
    fn start_event_pump(client: Arc<Self>, mut events: mpsc::Receiver<SignalingEvent>) {
        let cancel_token = client.cancel_token.clone();
        tokio::spawn(async move {
            while let Some(event) = tokio::select! {
                ev = events.recv() => ev,
                _ = cancel_token.cancelled() => None,
            } {
                client.handle_signaling_event(event).await;
            }
            debug!("入站事件处理器退出");
        });
    }

    /// 注册应用侧事件监听器
    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.dispatcher.add_listener(listener);
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 当前全部活动呼叫
    pub fn active_calls(&self) -> Vec<CallId> {
        self.registry.active_ids()
    }

    /// 查找活动会话
    pub fn session(&self, call_id: &CallId) -> Option<Arc<CallSession>> {
        self.registry.lookup(call_id)
    }

    /// 执行注册（完成是异步的，结果走 RegistrationChanged 事件）
    pub async fn register(&self) -> CallResult<()> {
        self.registration.register(&self.account).await
    }

    /// 注销
    pub async fn unregister(&self) -> CallResult<()> {
        self.registration.unregister(&self.account).await
    }

    /// 发起呼叫
    ///
    /// 目标在边界处校验；INVITE 协商异步进行，
    /// 进展通过 CallStateChanged 事件通知
    pub async fn make_call(&self, destination: &str) -> CallResult<CallId> {
        if self.cancel_token.is_cancelled() {
            return Err(CallError::invalid_state("make_call", "shutdown"));
        }
        if destination.trim().is_empty() {
            return Err(CallError::invalid_argument("呼叫目标不能为空"));
        }

        // 补全 sip: 前缀和域名部分
        let bare = destination.trim().trim_start_matches("sip:");
        let target = if bare.contains('@') {
            format!("sip:{}", bare)
        } else {
            let host = self
                .config
                .server
                .split(':')
                .next()
                .unwrap_or(self.config.server.as_str());
            format!("sip:{}@{}", bare, host)
        };
        let to_uri: rsip::Uri = target.as_str().try_into().map_err(|e: rsip::Error| {
            CallError::invalid_argument(format!("呼叫目标非法: {}", e))
        })?;

        let call_id = CallId::new();
        info!("📞 发起呼叫: {} -> {}, Call-ID: {}", self.account.identity(), to_uri, call_id);

        let session = CallSession::outbound(
            call_id.clone(),
            self.account.clone(),
            to_uri.to_string(),
            self.transport.clone(),
            self.media_engine.clone(),
            self.dispatcher.clone(),
        );
        self.registry.register(session.clone())?;
        self.dispatcher.dispatch(SessionEvent::CallStateChanged {
            call_id: call_id.clone(),
            state: CallState::Initiating,
        });

        let transport = self.transport.clone();
        let registry = self.registry.clone();
        let from = self.account.identity();
        let to = to_uri.to_string();
        let id = call_id.clone();
        tokio::spawn(async move {
            let request = SignalingRequest::Invite {
                call_id: id.clone(),
                from,
                to,
                stream_count: 1,
            };
            let applied = match transport.send_request(request).await {
                Ok(response) => session.handle_invite_response(response).await,
                Err(e) => session.handle_transport_error(&e.to_string()).await,
            };
            if let Err(e) = applied {
                warn!("呼叫 {} 应用最终响应失败: {}", id, e);
            }
            if session.state().is_terminal() {
                let _ = registry.remove(&id);
            }
        });

        Ok(call_id)
    }

    /// 应答入站呼叫
    pub async fn answer(&self, call_id: &CallId, status: u16) -> CallResult<()> {
        self.lookup(call_id)?.answer(status).await
    }

    /// 保持呼叫
    pub async fn hold(&self, call_id: &CallId) -> CallResult<()> {
        self.lookup(call_id)?.hold().await
    }

    /// 恢复呼叫
    pub async fn unhold(&self, call_id: &CallId) -> CallResult<()> {
        self.lookup(call_id)?.unhold().await
    }

    /// 静音/取消静音
    pub async fn set_mute(&self, call_id: &CallId, muted: bool) -> CallResult<()> {
        self.lookup(call_id)?.set_mute(muted).await
    }

    /// 挂断呼叫并回收会话
    pub async fn terminate(&self, call_id: &CallId) -> CallResult<()> {
        let session = self.lookup(call_id)?;
        let result = session.terminate().await;
        if session.state().is_terminal() {
            let _ = self.registry.remove(call_id);
        }
        result
    }

    /// 协作式关机
    ///
    /// 置位后不再接受新呼叫和刷新；在途的挂断允许完成，
    /// 所有会话都会到达 Disconnected 而不是被丢在半路
    pub async fn shutdown(&self) {
        info!("正在关闭客户端...");
        self.cancel_token.cancel();

        for call_id in self.registry.active_ids() {
            if let Some(session) = self.registry.lookup(&call_id) {
                if !session.state().is_terminal() {
                    if let Err(e) = session.terminate().await {
                        debug!("关机挂断 {}: {}", call_id, e);
                    }
                }
                let _ = self.registry.remove(&call_id);
            }
        }

        // 刷新循环随关机信号退出；等它真正停止
        self.registration.stop_refresh().await;
        info!("客户端已关闭");
    }

    fn lookup(&self, call_id: &CallId) -> CallResult<Arc<CallSession>> {
        self.registry
            .lookup(call_id)
            .ok_or_else(|| CallError::invalid_argument(format!("未知的 Call-ID: {}", call_id)))
    }

    async fn handle_signaling_event(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::IncomingInvite { call_id, from, .. } => {
                if self.cancel_token.is_cancelled() {
                    debug!("关机中, 忽略来电: {}", from);
                    return;
                }
                info!("收到来电: {} (Call-ID: {})", from, call_id);
                let session = CallSession::inbound(
                    call_id.clone(),
                    self.account.clone(),
                    from.clone(),
                    self.transport.clone(),
                    self.media_engine.clone(),
                    self.dispatcher.clone(),
                );
                match self.registry.register(session) {
                    Ok(()) => self
                        .dispatcher
                        .dispatch(SessionEvent::IncomingCall { call_id, from }),
                    Err(e) => warn!("来电登记失败: {}", e),
                }
            }
            SignalingEvent::Provisional { call_id, status } => {
                if let Some(session) = self.registry.lookup(&call_id) {
                    if let Err(e) = session.handle_provisional(status).await {
                        warn!("处理临时响应失败: {}", e);
                    }
                } else {
                    debug!("未找到匹配的会话: {}", call_id);
                }
            }
            SignalingEvent::Confirmed { call_id } => {
                if let Some(session) = self.registry.lookup(&call_id) {
                    if let Err(e) = session.handle_confirmed().await {
                        warn!("处理应答确认失败: {}", e);
                    }
                }
            }
            SignalingEvent::Cancelled { call_id } => {
                if let Some(session) = self.registry.lookup(&call_id) {
                    if let Err(e) = session.handle_cancelled().await {
                        warn!("处理呼叫取消失败: {}", e);
                    }
                    self.reap(&call_id);
                }
            }
            SignalingEvent::RemoteBye { call_id } => {
                if let Some(session) = self.registry.lookup(&call_id) {
                    if let Err(e) = session.handle_remote_bye().await {
                        warn!("处理对端挂断失败: {}", e);
                    }
                    self.reap(&call_id);
                }
            }
            SignalingEvent::TransportError { call_id: Some(call_id), reason } => {
                if let Some(session) = self.registry.lookup(&call_id) {
                    let _ = session.handle_transport_error(&reason).await;
                    self.reap(&call_id);
                }
            }
            SignalingEvent::TransportError { call_id: None, reason } => {
                // 账户级故障；刷新循环会在下个周期发现并进入 Failed
                error!("账户级传输错误: {}", reason);
            }
        }
    }

    /// 回收已终止的会话（事件已在迁移时分发，应用观察过终态）
    fn reap(&self, call_id: &CallId) {
        if let Some(session) = self.registry.lookup(call_id) {
            if session.state().is_terminal() {
                let _ = self.registry.remove(call_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::RegistrationState;
    use crate::media::NullMediaEngine;
    use crate::transport::{LoopbackConfig, LoopbackTransport};
    use std::sync::Mutex;
    use std::time::Duration;

    struct Recorder {
        call_states: Mutex<Vec<CallState>>,
        incoming: Mutex<Vec<CallId>>,
        registrations: Mutex<Vec<RegistrationState>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                call_states: Mutex::new(Vec::new()),
                incoming: Mutex::new(Vec::new()),
                registrations: Mutex::new(Vec::new()),
            })
        }

        fn call_states(&self) -> Vec<CallState> {
            self.call_states.lock().unwrap().clone()
        }
    }

    impl EventListener for Recorder {
        fn on_registration_changed(
            &self,
            _identity: &str,
            state: RegistrationState,
            _reason: Option<&str>,
        ) {
            self.registrations.lock().unwrap().push(state);
        }

        fn on_incoming_call(&self, call_id: &CallId, _from: &str) {
            self.incoming.lock().unwrap().push(call_id.clone());
        }

        fn on_call_state_changed(&self, _call_id: &CallId, state: CallState) {
            self.call_states.lock().unwrap().push(state);
        }
    }

    fn test_client(
        config: LoopbackConfig,
    ) -> (Arc<SipClient>, Arc<LoopbackTransport>, Arc<Recorder>) {
        let (transport, events) = LoopbackTransport::new(config);
        let client = SipClient::new(
            Config::new("demo.example.com:5060", "5613", "secret").unwrap(),
            transport.clone(),
            events,
            Arc::new(NullMediaEngine),
        )
        .unwrap();
        let recorder = Recorder::new();
        client.add_listener(recorder.clone());
        (client, transport, recorder)
    }

    async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("条件未在限期内满足: {}", what);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_call_full_lifecycle() {
        let (client, _transport, recorder) = test_client(LoopbackConfig::default());

        client.register().await.unwrap();
        wait_until("注册完成", || {
            client.account().state() == RegistrationState::Registered
        })
        .await;

        let call_id = client.make_call("5614").await.unwrap();
        wait_until("呼叫接通", || {
            client
                .session(&call_id)
                .map(|s| s.state() == CallState::Active)
                .unwrap_or(false)
        })
        .await;

        assert_eq!(
            recorder.call_states(),
            vec![CallState::Initiating, CallState::Ringing, CallState::Active]
        );

        client.hold(&call_id).await.unwrap();
        client.unhold(&call_id).await.unwrap();
        client.set_mute(&call_id, true).await.unwrap();

        client.terminate(&call_id).await.unwrap();
        assert!(client.active_calls().is_empty());
        assert!(client.session(&call_id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_outbound_call_is_reaped() {
        let config = LoopbackConfig {
            invite_status: 486,
            ..Default::default()
        };
        let (client, _transport, recorder) = test_client(config);

        let call_id = client.make_call("5614").await.unwrap();
        wait_until("呼叫被拒绝并回收", || client.session(&call_id).is_none()).await;

        let states = recorder.call_states();
        assert_eq!(states.last(), Some(&CallState::Disconnected));
        assert!(!states.contains(&CallState::Active));
    }

    #[tokio::test(start_paused = true)]
    async fn test_incoming_call_answer_to_active() {
        let (client, transport, recorder) = test_client(LoopbackConfig::default());

        let call_id = CallId::new();
        transport
            .inject_incoming_call(call_id.clone(), "sip:5614@demo.example.com", "sip:5613@demo.example.com")
            .await
            .unwrap();

        wait_until("来电通知", || !recorder.incoming.lock().unwrap().is_empty()).await;
        assert_eq!(
            client.session(&call_id).unwrap().state(),
            CallState::Ringing
        );

        client.answer(&call_id, 200).await.unwrap();
        wait_until("应答确认", || {
            client
                .session(&call_id)
                .map(|s| s.state() == CallState::Active)
                .unwrap_or(false)
        })
        .await;

        // 对端挂断后会话被回收
        transport.hangup_from_peer(call_id.clone()).await.unwrap();
        wait_until("对端挂断回收", || client.session(&call_id).is_none()).await;
        assert_eq!(
            recorder.call_states().last(),
            Some(&CallState::Disconnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_incoming_call_id_keeps_first_session() {
        let (client, transport, recorder) = test_client(LoopbackConfig::default());

        let call_id = CallId::new();
        for _ in 0..2 {
            transport
                .inject_incoming_call(call_id.clone(), "sip:5614@demo.example.com", "sip:5613@demo.example.com")
                .await
                .unwrap();
        }

        wait_until("来电通知", || !recorder.incoming.lock().unwrap().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // 重复 Call-ID 被拒绝，只保留第一路会话，也只有一次来电通知
        assert_eq!(client.active_calls().len(), 1);
        assert_eq!(recorder.incoming.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incoming_call_cancelled_before_answer() {
        let (client, transport, recorder) = test_client(LoopbackConfig::default());

        let call_id = CallId::new();
        transport
            .inject_incoming_call(call_id.clone(), "sip:5614@demo.example.com", "sip:5613@demo.example.com")
            .await
            .unwrap();
        wait_until("来电通知", || !recorder.incoming.lock().unwrap().is_empty()).await;

        // 对端在应答前放弃，会话直接进入终态并被回收
        transport.cancel_from_peer(call_id.clone()).await.unwrap();
        wait_until("取消后回收", || client.session(&call_id).is_none()).await;
        assert_eq!(
            recorder.call_states().last(),
            Some(&CallState::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_make_call_rejects_empty_destination() {
        let (client, _transport, _recorder) = test_client(LoopbackConfig::default());

        let err = client.make_call("  ").await.unwrap_err();
        assert!(matches!(err, CallError::InvalidArgument { .. }));
        assert!(client.active_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_new_calls_after_shutdown() {
        let (client, _transport, _recorder) = test_client(LoopbackConfig::default());

        client.shutdown().await;
        let err = client.make_call("5614").await.unwrap_err();
        assert!(matches!(err, CallError::InvalidState { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_active_sessions() {
        let (client, _transport, _recorder) = test_client(LoopbackConfig::default());

        let call_id = client.make_call("5614").await.unwrap();
        wait_until("呼叫接通", || {
            client
                .session(&call_id)
                .map(|s| s.state() == CallState::Active)
                .unwrap_or(false)
        })
        .await;

        client.shutdown().await;
        assert!(client.active_calls().is_empty());
    }
}
