/// 呼叫会话状态机
///
/// 同一会话上的操作通过 op_lock 按到达顺序串行执行；
/// terminate 在排队前先置位 disconnect_pending，
/// 因此挂断总是抢占在途的保持/恢复重协商
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use super::state::{CallState, Direction, MediaState};
use super::CallId;
use crate::account::Account;
use crate::error::{CallError, CallResult};
use crate::events::{EventDispatcher, SessionEvent};
use crate::media::MediaEngine;
use crate::transport::{SignalingRequest, SignalingResponse, SignalingTransport};

/// BYE 确认超时，超时后会话仍然进入 Disconnected
const BYE_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// 一路呼叫的会话对象
///
/// 由 SessionRegistry 独占持有，到达 Disconnected 且应用观察到
/// 该迁移之后才会被回收
pub struct CallSession {
    id: CallId,
    account: Account,
    direction: Direction,
    remote_uri: String,
    state: Mutex<CallState>,
    media: Mutex<MediaState>,
    disconnect_pending: AtomicBool,
    op_lock: AsyncMutex<()>,
    transport: Arc<dyn SignalingTransport>,
    media_engine: Arc<dyn MediaEngine>,
    dispatcher: Arc<EventDispatcher>,
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("id", &self.id)
            .field("account", &self.account)
            .field("direction", &self.direction)
            .field("remote_uri", &self.remote_uri)
            .field("state", &self.state)
            .field("media", &self.media)
            .field("disconnect_pending", &self.disconnect_pending)
            .finish_non_exhaustive()
    }
}

impl CallSession {
    /// 创建出站会话，初始状态 Initiating
    pub(crate) fn outbound(
        id: CallId,
        account: Account,
        remote_uri: String,
        transport: Arc<dyn SignalingTransport>,
        media_engine: Arc<dyn MediaEngine>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            account,
            direction: Direction::Outbound,
            remote_uri,
            state: Mutex::new(CallState::Initiating),
            media: Mutex::new(MediaState::default()),
            disconnect_pending: AtomicBool::new(false),
            op_lock: AsyncMutex::new(()),
            transport,
            media_engine,
            dispatcher,
        })
    }

    /// 创建入站会话，初始状态 Ringing
    pub(crate) fn inbound(
        id: CallId,
        account: Account,
        remote_uri: String,
        transport: Arc<dyn SignalingTransport>,
        media_engine: Arc<dyn MediaEngine>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            account,
            direction: Direction::Inbound,
            remote_uri,
            state: Mutex::new(CallState::Ringing),
            media: Mutex::new(MediaState::default()),
            disconnect_pending: AtomicBool::new(false),
            op_lock: AsyncMutex::new(()),
            transport,
            media_engine,
            dispatcher,
        })
    }

    pub fn id(&self) -> &CallId {
        &self.id
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn remote_uri(&self) -> &str {
        &self.remote_uri
    }

    /// 当前呼叫状态
    pub fn state(&self) -> CallState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 当前媒体子状态快照
    pub fn media_state(&self) -> MediaState {
        self.media.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 保持呼叫：音频流数重协商为 0
    ///
    /// 仅在 Active 状态合法；对端拒绝时会话停留在 Active
    pub async fn hold(&self) -> CallResult<()> {
        self.renegotiate_streams("hold", CallState::Active, CallState::OnHold, 0)
            .await
    }

    /// 恢复呼叫：音频流数重协商为 1
    pub async fn unhold(&self) -> CallResult<()> {
        self.renegotiate_streams("unhold", CallState::OnHold, CallState::Active, 1)
            .await
    }

    /// 静音/取消静音
    ///
    /// 纯本地操作，不触发重协商；仅在 Active/OnHold 合法。
    /// 重复设置同一值是幂等的
    pub async fn set_mute(&self, muted: bool) -> CallResult<()> {
        let _op = self.op_lock.lock().await;
        self.ensure_not_superseded("set_mute")?;

        let current = self.state();
        if !current.media_ops_allowed() {
            return Err(CallError::invalid_state("set_mute", current));
        }

        {
            let media = self.media.lock().unwrap_or_else(|e| e.into_inner());
            if media.muted == muted {
                return Ok(());
            }
        }

        let level = if muted { 0.0 } else { 1.0 };
        self.media_engine.set_tx_level(&self.id, level)?;
        self.media_engine.set_rx_level(&self.id, level)?;

        let mut media = self.media.lock().unwrap_or_else(|e| e.into_inner());
        media.muted = muted;
        media.tx_level = level;
        media.rx_level = level;
        info!("呼叫 {} {}", self.id, if muted { "已静音" } else { "已取消静音" });
        Ok(())
    }

    /// 应答入站呼叫
    ///
    /// 仅在 Ringing/Inbound 合法，状态码必须是 2xx 接受码；
    /// 成功后进入 Connecting，对端确认（ACK）后进入 Active
    pub async fn answer(&self, status: u16) -> CallResult<()> {
        if !(200..300).contains(&status) {
            return Err(CallError::invalid_argument(format!(
                "{} 不是可用的接受状态码",
                status
            )));
        }

        let _op = self.op_lock.lock().await;
        self.ensure_not_superseded("answer")?;

        let current = self.state();
        if current != CallState::Ringing || self.direction != Direction::Inbound {
            return Err(CallError::invalid_state("answer", current));
        }

        let response = self
            .transport
            .send_request(SignalingRequest::Answer {
                call_id: self.id.clone(),
                status,
            })
            .await?;
        if !response.is_success() {
            return Err(CallError::transport_failure(format!(
                "应答发送被拒绝: {} {}",
                response.status,
                response.reason_text()
            )));
        }

        self.transition("answer", CallState::Connecting)
    }

    /// 挂断呼叫
    ///
    /// 对任意非终态合法；先进入 Disconnecting，对端确认 BYE
    /// 或超时后进入 Disconnected
    pub async fn terminate(&self) -> CallResult<()> {
        // 先置位，让排队中的其它操作放弃
        self.disconnect_pending.store(true, Ordering::Release);

        let _op = self.op_lock.lock().await;
        let current = self.state();
        if current.is_terminal() {
            return Err(CallError::invalid_state("terminate", current));
        }

        self.transition("terminate", CallState::Disconnecting)?;

        let bye = SignalingRequest::Bye {
            call_id: self.id.clone(),
        };
        match tokio::time::timeout(BYE_CONFIRM_TIMEOUT, self.transport.send_request(bye)).await {
            Ok(Ok(response)) => debug!("呼叫 {} BYE 已确认: {}", self.id, response.status),
            Ok(Err(e)) => warn!("呼叫 {} BYE 发送失败: {}", self.id, e),
            Err(_) => warn!("呼叫 {} BYE 确认超时", self.id),
        }

        self.stop_media();
        self.transition("terminate", CallState::Disconnected)
    }

    /// 出站 INVITE 的最终响应
    pub(crate) async fn handle_invite_response(&self, response: SignalingResponse) -> CallResult<()> {
        let _op = self.op_lock.lock().await;

        let current = self.state();
        if current.is_terminal() || self.disconnect_pending.load(Ordering::Acquire) {
            // 已经在挂断，晚到的响应直接忽略
            debug!("呼叫 {} 忽略晚到的最终响应 {}", self.id, response.status);
            return Ok(());
        }

        if !matches!(current, CallState::Initiating | CallState::Ringing) {
            return Err(CallError::invalid_state("invite_response", current));
        }

        if response.is_success() {
            self.start_media()?;
            self.transition("invite_response", CallState::Active)
        } else {
            info!(
                "呼叫 {} 被拒绝: {} {}",
                self.id,
                response.status,
                response.reason_text()
            );
            self.transition("invite_response", CallState::Disconnected)
        }
    }

    /// 临时响应（1xx）
    pub(crate) async fn handle_provisional(&self, status: u16) -> CallResult<()> {
        let _op = self.op_lock.lock().await;

        if self.state() != CallState::Initiating {
            // Active 之后的晚到 1xx 不允许把状态拉回去
            debug!("呼叫 {} 忽略临时响应 {}", self.id, status);
            return Ok(());
        }
        self.transition("provisional", CallState::Ringing)
    }

    /// 对端已确认我方应答（ACK）
    pub(crate) async fn handle_confirmed(&self) -> CallResult<()> {
        let _op = self.op_lock.lock().await;

        if self.state() != CallState::Connecting {
            debug!("呼叫 {} 忽略重复确认", self.id);
            return Ok(());
        }
        self.start_media()?;
        self.transition("confirmed", CallState::Active)
    }

    /// 对端主动挂断
    pub(crate) async fn handle_remote_bye(&self) -> CallResult<()> {
        self.disconnect_pending.store(true, Ordering::Release);

        let _op = self.op_lock.lock().await;
        if self.state().is_terminal() {
            return Ok(());
        }

        info!("呼叫 {} 对端主动挂断", self.id);
        self.transition("remote_bye", CallState::Disconnecting)?;
        self.stop_media();
        self.transition("remote_bye", CallState::Disconnected)
    }

    /// 对端在应答前放弃了呼叫
    pub(crate) async fn handle_cancelled(&self) -> CallResult<()> {
        let _op = self.op_lock.lock().await;

        match self.state() {
            CallState::Initiating | CallState::Ringing | CallState::Connecting => {
                info!("呼叫 {} 被对端取消", self.id);
                self.transition("cancelled", CallState::Disconnected)
            }
            other => {
                debug!("呼叫 {} 在 {} 状态收到取消, 忽略", self.id, other);
                Ok(())
            }
        }
    }

    /// 致命传输/协议错误，从任意非终态直接进入 Disconnected
    pub(crate) async fn handle_transport_error(&self, reason: &str) -> CallResult<()> {
        self.disconnect_pending.store(true, Ordering::Release);

        let _op = self.op_lock.lock().await;
        if self.state().is_terminal() {
            return Ok(());
        }

        warn!("呼叫 {} 传输错误: {}", self.id, reason);
        self.stop_media();
        self.transition("transport_error", CallState::Disconnected)
    }

    /// 保持/恢复共用的重协商路径
    ///
    /// 调用线程持有 op_lock 直到迁移提交，失败时状态保持不变
    async fn renegotiate_streams(
        &self,
        operation: &'static str,
        required: CallState,
        target: CallState,
        stream_count: u32,
    ) -> CallResult<()> {
        let _op = self.op_lock.lock().await;
        self.ensure_not_superseded(operation)?;

        let current = self.state();
        if current != required {
            return Err(CallError::invalid_state(operation, current));
        }

        let response = self
            .transport
            .send_request(SignalingRequest::Reinvite {
                call_id: self.id.clone(),
                stream_count,
            })
            .await?;

        // 重协商期间可能有挂断请求排队，挂断优先
        if self.disconnect_pending.load(Ordering::Acquire) {
            debug!("呼叫 {} 的 {} 被挂断请求抢占", self.id, operation);
            return Err(CallError::invalid_state(operation, CallState::Disconnecting));
        }

        if !response.is_success() {
            info!(
                "呼叫 {} {} 被对端拒绝: {} {}",
                self.id,
                operation,
                response.status,
                response.reason_text()
            );
            return Err(CallError::negotiation_failure(response.status, response.reason));
        }

        self.media_engine.set_stream_count(&self.id, stream_count)?;
        self.media
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .audio_stream_count = stream_count;

        self.transition(operation, target)
    }

    fn ensure_not_superseded(&self, operation: &'static str) -> CallResult<()> {
        if self.disconnect_pending.load(Ordering::Acquire) {
            return Err(CallError::invalid_state(operation, CallState::Disconnecting));
        }
        Ok(())
    }

    fn start_media(&self) -> CallResult<()> {
        if let Err(e) = self.media_engine.set_stream_count(&self.id, 1) {
            warn!("呼叫 {} 媒体启动失败: {}", self.id, e);
            self.transition("media_start", CallState::Disconnected)?;
            return Err(e);
        }
        self.media
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .audio_stream_count = 1;
        Ok(())
    }

    fn stop_media(&self) {
        if let Err(e) = self.media_engine.set_stream_count(&self.id, 0) {
            warn!("呼叫 {} 停止媒体失败: {}", self.id, e);
        }
        self.media
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .audio_stream_count = 0;
    }

    /// 提交一次状态迁移并分发事件
    ///
    /// 必须在持有 op_lock 时调用，迁移表校验失败返回 InvalidState
    fn transition(&self, operation: &'static str, next: CallState) -> CallResult<()> {
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if !state.can_transition_to(next) {
                return Err(CallError::invalid_state(operation, *state));
            }
            let previous = *state;
            *state = next;
            previous
        };

        info!("呼叫 {} 状态: {} -> {}", self.id, previous, next);
        self.dispatcher.dispatch(SessionEvent::CallStateChanged {
            call_id: self.id.clone(),
            state: next,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Credential;
    use crate::error::CallError;
    use crate::events::EventListener;
    use crate::media::NullMediaEngine;
    use crate::transport::{LoopbackConfig, LoopbackTransport};
    use std::sync::atomic::AtomicUsize;

    struct Recorder {
        states: Mutex<Vec<CallState>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                states: Mutex::new(Vec::new()),
            })
        }

        fn states(&self) -> Vec<CallState> {
            self.states.lock().unwrap().clone()
        }
    }

    impl EventListener for Recorder {
        fn on_call_state_changed(&self, _call_id: &CallId, state: CallState) {
            self.states.lock().unwrap().push(state);
        }
    }

    /// 只统计调用次数的媒体引擎
    struct CountingMedia {
        tx_calls: AtomicUsize,
    }

    impl MediaEngine for CountingMedia {
        fn set_stream_count(&self, _call_id: &CallId, _count: u32) -> CallResult<()> {
            Ok(())
        }
        fn set_tx_level(&self, _call_id: &CallId, _level: f32) -> CallResult<()> {
            self.tx_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn set_rx_level(&self, _call_id: &CallId, _level: f32) -> CallResult<()> {
            Ok(())
        }
    }

    fn test_account() -> Account {
        let identity: rsip::Uri = "sip:5613@demo.example.com".try_into().unwrap();
        let registrar: rsip::Uri = "sip:demo.example.com".try_into().unwrap();
        Account::new(identity, registrar, Credential::digest("*", "5613", "pw"), 120)
    }

    fn outbound_session(
        config: LoopbackConfig,
        media: Arc<dyn MediaEngine>,
    ) -> (Arc<CallSession>, Arc<Recorder>) {
        let (transport, _events) = LoopbackTransport::new(config);
        let dispatcher = Arc::new(EventDispatcher::new());
        let recorder = Recorder::new();
        dispatcher.add_listener(recorder.clone());

        let session = CallSession::outbound(
            CallId::new(),
            test_account(),
            "sip:5614@demo.example.com".to_string(),
            transport,
            media,
            dispatcher,
        );
        (session, recorder)
    }

    async fn active_session(config: LoopbackConfig) -> (Arc<CallSession>, Arc<Recorder>) {
        let (session, recorder) = outbound_session(config, Arc::new(NullMediaEngine));
        session
            .handle_invite_response(SignalingResponse::ok())
            .await
            .unwrap();
        assert_eq!(session.state(), CallState::Active);
        (session, recorder)
    }

    #[tokio::test]
    async fn test_provisional_then_success_reaches_active() {
        let (session, recorder) = outbound_session(LoopbackConfig::default(), Arc::new(NullMediaEngine));

        session.handle_provisional(180).await.unwrap();
        assert_eq!(session.state(), CallState::Ringing);

        session
            .handle_invite_response(SignalingResponse::ok())
            .await
            .unwrap();
        assert_eq!(session.state(), CallState::Active);
        assert_eq!(session.media_state().audio_stream_count, 1);
        assert_eq!(
            recorder.states(),
            vec![CallState::Ringing, CallState::Active]
        );
    }

    #[tokio::test]
    async fn test_rejected_invite_goes_terminal() {
        let (session, _recorder) = outbound_session(LoopbackConfig::default(), Arc::new(NullMediaEngine));

        session
            .handle_invite_response(SignalingResponse::new(486, Some("Busy Here".into())))
            .await
            .unwrap();
        assert_eq!(session.state(), CallState::Disconnected);
    }

    #[tokio::test]
    async fn test_hold_then_unhold_restores_active() {
        let (session, _recorder) = active_session(LoopbackConfig::default()).await;

        session.hold().await.unwrap();
        assert_eq!(session.state(), CallState::OnHold);
        assert_eq!(session.media_state().audio_stream_count, 0);

        session.unhold().await.unwrap();
        assert_eq!(session.state(), CallState::Active);
        assert_eq!(session.media_state().audio_stream_count, 1);
    }

    #[tokio::test]
    async fn test_hold_rejected_keeps_prior_state() {
        let config = LoopbackConfig {
            reinvite_status: 488,
            ..Default::default()
        };
        let (session, recorder) = active_session(config).await;

        let err = session.hold().await.unwrap_err();
        assert!(matches!(err, CallError::NegotiationFailure { status: 488, .. }));

        // 会话停留在原状态，媒体未被触碰
        assert_eq!(session.state(), CallState::Active);
        assert_eq!(session.media_state().audio_stream_count, 1);
        assert!(!recorder.states().contains(&CallState::OnHold));
    }

    #[tokio::test]
    async fn test_hold_in_ringing_is_invalid_state() {
        let (session, _recorder) = outbound_session(LoopbackConfig::default(), Arc::new(NullMediaEngine));
        session.handle_provisional(180).await.unwrap();

        let err = session.hold().await.unwrap_err();
        assert!(matches!(err, CallError::InvalidState { .. }));
        assert_eq!(session.state(), CallState::Ringing);
    }

    #[tokio::test]
    async fn test_set_mute_twice_is_idempotent() {
        let media = Arc::new(CountingMedia {
            tx_calls: AtomicUsize::new(0),
        });
        let (session, _recorder) = outbound_session(LoopbackConfig::default(), media.clone());
        session
            .handle_invite_response(SignalingResponse::ok())
            .await
            .unwrap();

        session.set_mute(true).await.unwrap();
        session.set_mute(true).await.unwrap();

        let state = session.media_state();
        assert!(state.muted);
        assert_eq!(state.tx_level, 0.0);
        // 第二次调用没有触发任何媒体指令
        assert_eq!(media.tx_calls.load(Ordering::SeqCst), 1);

        session.set_mute(false).await.unwrap();
        assert_eq!(session.media_state().tx_level, 1.0);
    }

    #[tokio::test]
    async fn test_answer_on_active_session_fails() {
        let (session, _recorder) = active_session(LoopbackConfig::default()).await;

        let err = session.answer(200).await.unwrap_err();
        assert!(matches!(err, CallError::InvalidState { .. }));
        assert_eq!(session.state(), CallState::Active);
    }

    #[tokio::test]
    async fn test_answer_rejects_non_accept_code() {
        let (session, _recorder) = outbound_session(LoopbackConfig::default(), Arc::new(NullMediaEngine));

        let err = session.answer(180).await.unwrap_err();
        assert!(matches!(err, CallError::InvalidArgument { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_supersedes_inflight_hold() {
        let config = LoopbackConfig {
            reinvite_delay: Duration::from_millis(50),
            ..Default::default()
        };
        let (session, recorder) = active_session(config).await;

        let holder = session.clone();
        let hold_task = tokio::spawn(async move { holder.hold().await });

        // 让 hold 先拿到操作锁并进入重协商
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.terminate().await.unwrap();

        let hold_result = hold_task.await.unwrap();
        assert!(hold_result.is_err());

        // 挂断优先：保持从未生效
        assert_eq!(session.state(), CallState::Disconnected);
        assert!(!recorder.states().contains(&CallState::OnHold));
        assert_eq!(session.media_state().audio_stream_count, 0);
    }

    #[tokio::test]
    async fn test_terminate_is_rejected_on_terminal_session() {
        let (session, _recorder) = active_session(LoopbackConfig::default()).await;

        session.terminate().await.unwrap();
        let err = session.terminate().await.unwrap_err();
        assert!(matches!(err, CallError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_remote_bye_tears_down() {
        let (session, recorder) = active_session(LoopbackConfig::default()).await;

        session.handle_remote_bye().await.unwrap();
        assert_eq!(session.state(), CallState::Disconnected);
        assert_eq!(session.media_state().audio_stream_count, 0);
        assert_eq!(
            recorder.states(),
            vec![
                CallState::Active,
                CallState::Disconnecting,
                CallState::Disconnected
            ]
        );
    }

    #[tokio::test]
    async fn test_transport_error_is_fatal_from_any_state() {
        let (session, _recorder) = outbound_session(LoopbackConfig::default(), Arc::new(NullMediaEngine));
        session.handle_provisional(180).await.unwrap();

        session.handle_transport_error("socket closed").await.unwrap();
        assert_eq!(session.state(), CallState::Disconnected);

        // 终态之后的错误被静默忽略
        session.handle_transport_error("again").await.unwrap();
        assert_eq!(session.state(), CallState::Disconnected);
    }

    #[tokio::test]
    async fn test_late_provisional_after_active_is_ignored() {
        let (session, recorder) = active_session(LoopbackConfig::default()).await;

        session.handle_provisional(183).await.unwrap();
        assert_eq!(session.state(), CallState::Active);
        assert!(!recorder.states().contains(&CallState::Ringing));
    }
}
