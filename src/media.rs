/// 媒体引擎接口
///
/// 音频流数与收发电平由外部媒体引擎落实，核心只负责在
/// 状态机允许的窗口内下发指令
use tracing::debug;

use crate::error::CallResult;
use crate::session::CallId;

/// 媒体引擎能力接口
///
/// 每个操作要么成功，要么带原因失败；失败不会使会话
/// 进入不一致状态
pub trait MediaEngine: Send + Sync {
    /// 设置某路呼叫的音频流数（0 = 保持，1 = 通话）
    fn set_stream_count(&self, call_id: &CallId, count: u32) -> CallResult<()>;

    /// 设置发送电平，范围 [0.0, 1.0]
    fn set_tx_level(&self, call_id: &CallId, level: f32) -> CallResult<()>;

    /// 设置接收电平，范围 [0.0, 1.0]
    fn set_rx_level(&self, call_id: &CallId, level: f32) -> CallResult<()>;
}

/// 仅记录日志的媒体引擎，供演示程序和测试使用
pub struct NullMediaEngine;

impl MediaEngine for NullMediaEngine {
    fn set_stream_count(&self, call_id: &CallId, count: u32) -> CallResult<()> {
        debug!("媒体引擎: {} 音频流数 -> {}", call_id, count);
        Ok(())
    }

    fn set_tx_level(&self, call_id: &CallId, level: f32) -> CallResult<()> {
        debug!("媒体引擎: {} 发送电平 -> {:.1}", call_id, level);
        Ok(())
    }

    fn set_rx_level(&self, call_id: &CallId, level: f32) -> CallResult<()> {
        debug!("媒体引擎: {} 接收电平 -> {:.1}", call_id, level);
        Ok(())
    }
}
