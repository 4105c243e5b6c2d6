/// 信令传输模块
///
/// 核心对底层 SIP 协议栈的全部要求收敛为 `SignalingTransport` 这一个
/// 接口：请求的 future 在事务的最终响应到达时完成，异步的入站消息
/// 通过 mpsc 事件流投递，同一对话内保证消息有序。
///
/// `LoopbackTransport` 是一个进程内的模拟对端，供演示程序和测试在
/// 没有真实 SIP 服务器时端到端驱动状态机
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{CallError, CallResult};
use crate::session::CallId;

/// 出站信令请求
#[derive(Debug, Clone)]
pub enum SignalingRequest {
    /// REGISTER，expires=0 表示注销
    Register {
        registrar: String,
        identity: String,
        expires: u32,
    },
    /// 出站 INVITE
    Invite {
        call_id: CallId,
        from: String,
        to: String,
        stream_count: u32,
    },
    /// re-INVITE（保持/恢复的媒体重协商）
    Reinvite { call_id: CallId, stream_count: u32 },
    /// 对入站 INVITE 的最终应答
    Answer { call_id: CallId, status: u16 },
    /// BYE
    Bye { call_id: CallId },
}

impl SignalingRequest {
    /// 请求方法名，用于日志
    pub fn method(&self) -> &'static str {
        match self {
            SignalingRequest::Register { .. } => "REGISTER",
            SignalingRequest::Invite { .. } => "INVITE",
            SignalingRequest::Reinvite { .. } => "re-INVITE",
            SignalingRequest::Answer { .. } => "ANSWER",
            SignalingRequest::Bye { .. } => "BYE",
        }
    }
}

/// 事务的最终响应
#[derive(Debug, Clone)]
pub struct SignalingResponse {
    pub status: u16,
    pub reason: Option<String>,
}

impl SignalingResponse {
    pub fn new(status: u16, reason: Option<String>) -> Self {
        Self { status, reason }
    }

    pub fn ok() -> Self {
        Self::new(200, Some("OK".to_string()))
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn reason_text(&self) -> String {
        self.reason.clone().unwrap_or_default()
    }
}

/// 传输层投递的异步入站事件
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// 入站 INVITE
    IncomingInvite {
        call_id: CallId,
        from: String,
        to: String,
    },
    /// 临时响应（1xx）
    Provisional { call_id: CallId, status: u16 },
    /// 对端已确认我方应答（ACK）
    Confirmed { call_id: CallId },
    /// 对端在应答前放弃了呼叫
    Cancelled { call_id: CallId },
    /// 对端主动挂断
    RemoteBye { call_id: CallId },
    /// 致命传输错误；call_id 为 None 时影响整个账户
    TransportError {
        call_id: Option<CallId>,
        reason: String,
    },
}

/// 信令传输接口
///
/// 由底层协议栈实现；核心只依赖这一契约
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// 发送请求并等待事务的最终响应
    ///
    /// # 返回
    /// - `Ok(SignalingResponse)`: 收到最终响应（包括非 2xx 的拒绝）
    /// - `Err(TransportFailure)`: 发送或接收本身失败
    async fn send_request(&self, request: SignalingRequest) -> CallResult<SignalingResponse>;
}

/// 回环传输配置
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// 出站呼叫收到 180 Ringing 前的延迟
    pub ring_delay: Duration,

    /// 180 之后对端接听（最终响应）前的延迟
    pub answer_delay: Duration,

    /// 出站 INVITE 的最终响应状态码
    pub invite_status: u16,

    /// re-INVITE 的响应状态码（非 2xx 模拟重协商被拒）
    pub reinvite_status: u16,

    /// re-INVITE 响应前的延迟，用于制造重协商在途的窗口
    pub reinvite_delay: Duration,

    /// REGISTER 的响应状态码
    pub register_status: u16,

    /// 模拟发送失败
    pub fail_sends: bool,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            ring_delay: Duration::from_millis(20),
            answer_delay: Duration::from_millis(50),
            invite_status: 200,
            reinvite_status: 200,
            reinvite_delay: Duration::ZERO,
            register_status: 200,
            fail_sends: false,
        }
    }
}

/// 进程内模拟对端
///
/// 行为良好的被叫：振铃后接听、确认应答、响应重协商与挂断。
/// 通过配置可以改为拒接、拒绝重协商或模拟传输失败
pub struct LoopbackTransport {
    config: LoopbackConfig,
    events: mpsc::Sender<SignalingEvent>,
    peer_tag: String,
}

impl LoopbackTransport {
    /// 创建回环传输，返回传输句柄和入站事件流
    pub fn new(config: LoopbackConfig) -> (Arc<Self>, mpsc::Receiver<SignalingEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let peer_tag = format!("{:08x}", rand::random::<u32>());

        (
            Arc::new(Self {
                config,
                events: tx,
                peer_tag,
            }),
            rx,
        )
    }

    /// 注入一路入站呼叫
    pub async fn inject_incoming_call(
        &self,
        call_id: CallId,
        from: &str,
        to: &str,
    ) -> CallResult<()> {
        debug!("回环对端 {} 发起来电: {}", self.peer_tag, from);
        self.emit(SignalingEvent::IncomingInvite {
            call_id,
            from: from.to_string(),
            to: to.to_string(),
        })
        .await
    }

    /// 模拟对端主动挂断
    pub async fn hangup_from_peer(&self, call_id: CallId) -> CallResult<()> {
        self.emit(SignalingEvent::RemoteBye { call_id }).await
    }

    /// 模拟对端在应答前放弃呼叫
    pub async fn cancel_from_peer(&self, call_id: CallId) -> CallResult<()> {
        self.emit(SignalingEvent::Cancelled { call_id }).await
    }

    async fn emit(&self, event: SignalingEvent) -> CallResult<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| CallError::transport_failure("事件通道已关闭"))
    }
}

#[async_trait]
impl SignalingTransport for LoopbackTransport {
    async fn send_request(&self, request: SignalingRequest) -> CallResult<SignalingResponse> {
        if self.config.fail_sends {
            return Err(CallError::transport_failure(format!(
                "simulated send failure: {}",
                request.method()
            )));
        }

        match request {
            SignalingRequest::Register { expires, .. } => {
                debug!("回环对端处理 REGISTER, expires={}", expires);
                Ok(SignalingResponse::new(
                    self.config.register_status,
                    reason_phrase(self.config.register_status),
                ))
            }
            SignalingRequest::Invite { call_id, to, .. } => {
                debug!("回环对端 {} 收到 INVITE: {}", self.peer_tag, to);
                tokio::time::sleep(self.config.ring_delay).await;
                let _ = self
                    .emit(SignalingEvent::Provisional {
                        call_id: call_id.clone(),
                        status: 180,
                    })
                    .await;
                tokio::time::sleep(self.config.answer_delay).await;
                Ok(SignalingResponse::new(
                    self.config.invite_status,
                    reason_phrase(self.config.invite_status),
                ))
            }
            SignalingRequest::Reinvite { stream_count, .. } => {
                debug!("回环对端处理 re-INVITE, stream_count={}", stream_count);
                tokio::time::sleep(self.config.reinvite_delay).await;
                Ok(SignalingResponse::new(
                    self.config.reinvite_status,
                    reason_phrase(self.config.reinvite_status),
                ))
            }
            SignalingRequest::Answer { call_id, status } => {
                debug!("回环对端收到应答: {}", status);
                // 对端稍后回 ACK
                let events = self.events.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    let _ = events.send(SignalingEvent::Confirmed { call_id }).await;
                });
                Ok(SignalingResponse::ok())
            }
            SignalingRequest::Bye { call_id } => {
                debug!("回环对端确认 BYE: {}", call_id);
                Ok(SignalingResponse::ok())
            }
        }
    }
}

fn reason_phrase(status: u16) -> Option<String> {
    let text = match status {
        180 => "Ringing",
        200 => "OK",
        403 => "Forbidden",
        404 => "Not Found",
        486 => "Busy Here",
        488 => "Not Acceptable Here",
        503 => "Service Unavailable",
        603 => "Decline",
        _ => return None,
    };
    Some(text.to_string())
}
