/// 注册管理器
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::account::{Account, Credential, RegistrationState};
use crate::error::{CallError, CallResult};
use crate::events::{EventDispatcher, SessionEvent};
use crate::transport::{SignalingRequest, SignalingTransport};

/// 刷新安全余量（秒），避免在有效期边缘撞线
pub const REGISTRATION_SAFETY_MARGIN_SECS: u64 = 20;

/// 刷新间隔 = max(1, ttl − 安全余量)
pub fn refresh_interval_secs(ttl_seconds: u32) -> u64 {
    std::cmp::max(
        1,
        (ttl_seconds as u64).saturating_sub(REGISTRATION_SAFETY_MARGIN_SECS),
    )
}

/// 注册管理器
///
/// 账户状态只由这里修改；句柄可廉价克隆
#[derive(Clone)]
pub struct RegistrationManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    transport: Arc<dyn SignalingTransport>,
    dispatcher: Arc<EventDispatcher>,
    shutdown: CancellationToken,
    refresher: AsyncMutex<Option<RefreshHandle>>,
    /// 注册代际：unregister 或重新 register 会使在途尝试的结果作废
    epoch: AtomicU64,
}

struct RefreshHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RegistrationManager {
    pub fn new(
        transport: Arc<dyn SignalingTransport>,
        dispatcher: Arc<EventDispatcher>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                transport,
                dispatcher,
                shutdown,
                refresher: AsyncMutex::new(None),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// 校验配置并创建账户
    ///
    /// URI 必须非空且可解析，ttl 必须大于 0；
    /// 非法输入在这里被拒绝，不产生任何状态
    pub fn configure(
        &self,
        identity: &str,
        registrar: &str,
        credential: Credential,
        ttl_seconds: u32,
    ) -> CallResult<Account> {
        if identity.trim().is_empty() {
            return Err(CallError::invalid_argument("身份 URI 不能为空"));
        }
        if registrar.trim().is_empty() {
            return Err(CallError::invalid_argument("注册服务器 URI 不能为空"));
        }
        if ttl_seconds == 0 {
            return Err(CallError::invalid_argument("注册有效期必须大于 0"));
        }

        let identity_uri: rsip::Uri = identity
            .try_into()
            .map_err(|e: rsip::Error| CallError::invalid_argument(format!("身份 URI 非法: {}", e)))?;
        let registrar_uri: rsip::Uri = registrar.try_into().map_err(|e: rsip::Error| {
            CallError::invalid_argument(format!("注册服务器 URI 非法: {}", e))
        })?;

        Ok(Account::new(identity_uri, registrar_uri, credential, ttl_seconds))
    }

    /// 发起注册
    ///
    /// 本调用只负责发出请求，不等待完成；最终结果通过
    /// 恰好一个 `RegistrationChanged(Registered | Failed)` 事件通知。
    /// 成功后自动启动刷新循环
    pub async fn register(&self, account: &Account) -> CallResult<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(CallError::invalid_state("register", "shutdown"));
        }

        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        account.set_state(RegistrationState::Registering);
        info!("正在注册到 SIP 服务器: {}", account.registrar());

        let manager = self.clone();
        let account = account.clone();
        tokio::spawn(async move {
            if manager.register_once(&account, epoch).await {
                manager.start_refresh(&account, epoch).await;
            }
        });
        Ok(())
    }

    /// 注销
    ///
    /// 先同步停掉刷新循环（等待任务真正退出），再发送 expires=0
    pub async fn unregister(&self, account: &Account) -> CallResult<()> {
        self.stop_refresh().await;
        // 作废仍在途的注册尝试
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);

        info!("正在从 SIP 服务器注销: {}", account.identity());
        let request = SignalingRequest::Register {
            registrar: account.registrar(),
            identity: account.identity(),
            expires: 0,
        };
        let response = self.inner.transport.send_request(request).await?;
        if !response.is_success() {
            warn!("注销响应: {} {}", response.status, response.reason_text());
        }

        account.set_state(RegistrationState::Unregistered);
        self.emit(&account.identity(), RegistrationState::Unregistered, None);
        info!("✔ 已注销: {}", account.identity());
        Ok(())
    }

    /// 停止刷新循环并等待任务退出
    pub async fn stop_refresh(&self) {
        let taken = self.inner.refresher.lock().await.take();
        if let Some(refresher) = taken {
            refresher.cancel.cancel();
            if let Err(e) = refresher.handle.await {
                if !e.is_cancelled() {
                    warn!("刷新任务异常退出: {}", e);
                }
            }
            debug!("刷新循环已停止");
        }
    }

    /// 执行一次注册尝试并提交结果
    ///
    /// 事件只在状态发生变化时发出，因此已 Registered 时的
    /// 重复刷新是幂等的；代际不匹配的结果直接丢弃
    async fn register_once(&self, account: &Account, epoch: u64) -> bool {
        let request = SignalingRequest::Register {
            registrar: account.registrar(),
            identity: account.identity(),
            expires: account.ttl_seconds(),
        };
        let outcome = self.inner.transport.send_request(request).await;

        if self.inner.epoch.load(Ordering::SeqCst) != epoch {
            debug!("注册尝试已被取代, 丢弃结果");
            return false;
        }

        match outcome {
            Ok(response) if response.is_success() => {
                let changed = account.state() != RegistrationState::Registered;
                account.set_state(RegistrationState::Registered);
                if changed {
                    info!("✔ 注册成功: {}", account.identity());
                    self.emit(&account.identity(), RegistrationState::Registered, None);
                }
                true
            }
            Ok(response) => {
                let reason = format!("{} {}", response.status, response.reason_text());
                warn!("注册被拒绝: {}", reason);
                let changed = account.state() != RegistrationState::Failed;
                account.set_state(RegistrationState::Failed);
                if changed {
                    self.emit(&account.identity(), RegistrationState::Failed, Some(reason));
                }
                false
            }
            Err(e) => {
                warn!("注册请求发送失败: {}", e);
                let changed = account.state() != RegistrationState::Failed;
                account.set_state(RegistrationState::Failed);
                if changed {
                    self.emit(&account.identity(), RegistrationState::Failed, Some(e.to_string()));
                }
                false
            }
        }
    }

    /// 启动刷新循环
    ///
    /// 瞬时失败只把账户置为 Failed，下个周期继续重试；
    /// 关机信号或注销会让循环退出
    async fn start_refresh(&self, account: &Account, epoch: u64) {
        let mut slot = self.inner.refresher.lock().await;

        if self.inner.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        if let Some(old) = slot.take() {
            old.cancel.cancel();
            old.handle.abort();
        }
        if self.inner.shutdown.is_cancelled() {
            return;
        }

        let interval = refresh_interval_secs(account.ttl_seconds());
        info!("启动注册刷新循环, 间隔 {}s", interval);

        let cancel = self.inner.shutdown.child_token();
        let loop_cancel = cancel.clone();
        let manager = self.clone();
        let account = account.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
                    _ = loop_cancel.cancelled() => break,
                }
                debug!("刷新注册: {}", account.identity());
                manager.register_once(&account, epoch).await;
            }
            debug!("注册刷新循环退出");
        });

        *slot = Some(RefreshHandle { cancel, handle });
    }

    fn emit(&self, identity: &str, state: RegistrationState, reason: Option<String>) {
        self.inner.dispatcher.dispatch(SessionEvent::RegistrationChanged {
            identity: identity.to_string(),
            state,
            reason,
        });
    }
}
