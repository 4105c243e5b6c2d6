use clap::Parser;
use sip_session::{
    utils, CallId, CallState, EventListener, LoopbackConfig, LoopbackTransport, NullMediaEngine,
    RegistrationState, SipClient, SipConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// SIP Session CLI Application
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// SIP server address (e.g., demo.example.com:5060)
    #[arg(short, long)]
    server: Option<String>,

    /// SIP username (e.g., 5613 or 5613@demo.example.com)
    #[arg(short, long)]
    user: Option<String>,

    /// SIP password
    #[arg(short, long)]
    password: Option<String>,

    /// Call target (user@domain), dialed right after registration
    #[arg(short, long)]
    target: Option<String>,

    /// Registration TTL in seconds
    #[arg(long, default_value_t = 120)]
    ttl: u32,

    /// Automatically answer incoming calls with 200 OK
    #[arg(long, default_value_t = true)]
    auto_answer: bool,

    /// Ring duration of the simulated peer in milliseconds
    #[arg(long, default_value_t = 1500)]
    ring_ms: u64,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// 监听器回调通过命令通道回到主循环，
/// 控制操作不在事件分发的临界区里执行
enum CliCommand {
    Answer(CallId),
    Cleared(CallId),
}

struct CliListener {
    auto_answer: bool,
    commands: mpsc::Sender<CliCommand>,
}

impl EventListener for CliListener {
    fn on_registration_changed(
        &self,
        identity: &str,
        state: RegistrationState,
        reason: Option<&str>,
    ) {
        match reason {
            Some(reason) => warn!("注册状态: {} -> {} ({})", identity, state, reason),
            None => info!("注册状态: {} -> {}", identity, state),
        }
    }

    fn on_incoming_call(&self, call_id: &CallId, from: &str) {
        info!("来电: {}", from);
        if self.auto_answer {
            let _ = self.commands.try_send(CliCommand::Answer(call_id.clone()));
        }
    }

    fn on_call_state_changed(&self, call_id: &CallId, state: CallState) {
        info!("呼叫 {} 状态: {}", call_id, state);
        if state == CallState::Disconnected {
            let _ = self.commands.try_send(CliCommand::Cleared(call_id.clone()));
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    utils::initialize_logging(args.log_level.as_str());

    let server = args
        .server
        .clone()
        .or_else(|| std::env::var("SIP_SERVER").ok())
        .ok_or("SIP server address is required")?;

    let user = args
        .user
        .clone()
        .or_else(|| std::env::var("SIP_USER").ok())
        .ok_or("SIP user is required")?;

    let password = args
        .password
        .clone()
        .or_else(|| std::env::var("SIP_PASSWORD").ok())
        .unwrap_or_else(|| "password".to_string());

    let config = SipConfig::new(&server, &user, &password)?.with_ttl(args.ttl);
    info!("创建SIP客户端: {} @ {}", config.identity, server);

    if let Ok(local_ip) = utils::get_first_non_loopback_interface() {
        info!("本地出口IP: {}", local_ip);
    }

    // 回环对端：短暂振铃后接听
    let loopback = LoopbackConfig {
        ring_delay: Duration::from_millis(200),
        answer_delay: Duration::from_millis(args.ring_ms),
        ..Default::default()
    };
    let (transport, events) = LoopbackTransport::new(loopback);
    let client = SipClient::new(config, transport.clone(), events, Arc::new(NullMediaEngine))?;

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<CliCommand>(16);
    client.add_listener(Arc::new(CliListener {
        auto_answer: args.auto_answer,
        commands: cmd_tx,
    }));

    client.register().await?;

    let mut current_call: Option<CallId> = None;
    if let Some(target) = &args.target {
        current_call = Some(client.make_call(target).await?);
    }

    print_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    None => break,
                    Some(line) => {
                        if !run_command(&client, &transport, line.trim(), &mut current_call).await {
                            break;
                        }
                    }
                }
            }
            Some(command) = cmd_rx.recv() => match command {
                CliCommand::Answer(call_id) => {
                    match client.answer(&call_id, 200).await {
                        Ok(()) => {
                            info!("来电已自动应答");
                            current_call = Some(call_id);
                        }
                        Err(e) => error!("自动应答失败: {}", e),
                    }
                }
                CliCommand::Cleared(call_id) => {
                    if current_call.as_ref() == Some(&call_id) {
                        current_call = None;
                    }
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("收到中断信号");
                break;
            }
        }
    }

    if let Err(e) = client.unregister().await {
        warn!("注销失败: {}", e);
    }
    client.shutdown().await;
    info!("Shutting down...");
    Ok(())
}

/// 执行一条交互命令，返回 false 表示退出
async fn run_command(
    client: &Arc<SipClient>,
    transport: &Arc<LoopbackTransport>,
    line: &str,
    current_call: &mut Option<CallId>,
) -> bool {
    let mut parts = line.split_whitespace();
    let command = match parts.next() {
        Some(command) => command,
        None => return true,
    };
    let argument = parts.next();

    let result = match command {
        "call" => match argument {
            Some(target) => match client.make_call(target).await {
                Ok(call_id) => {
                    *current_call = Some(call_id);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            None => {
                eprintln!("用法: call <user@domain>");
                Ok(())
            }
        },
        "incoming" => {
            // 用回环对端模拟一路来电
            let bare = argument.unwrap_or("5614").trim_start_matches("sip:");
            let from_uri = if bare.contains('@') {
                format!("sip:{}", bare)
            } else {
                let server = client.config().server.as_str();
                let host = server.split(':').next().unwrap_or(server);
                format!("sip:{}@{}", bare, host)
            };
            transport
                .inject_incoming_call(CallId::new(), &from_uri, &client.config().identity)
                .await
        }
        "answer" => match current_call {
            Some(call_id) => client.answer(call_id, 200).await,
            None => no_active_call(),
        },
        "hold" => match current_call {
            Some(call_id) => client.hold(call_id).await,
            None => no_active_call(),
        },
        "unhold" => match current_call {
            Some(call_id) => client.unhold(call_id).await,
            None => no_active_call(),
        },
        "mute" => match current_call {
            Some(call_id) => client.set_mute(call_id, true).await,
            None => no_active_call(),
        },
        "unmute" => match current_call {
            Some(call_id) => client.set_mute(call_id, false).await,
            None => no_active_call(),
        },
        "hangup" => match current_call.take() {
            Some(call_id) => client.terminate(&call_id).await,
            None => no_active_call(),
        },
        "status" => {
            println!("账户: {} [{}]", client.account().identity(), client.account().state());
            for call_id in client.active_calls() {
                if let Some(session) = client.session(&call_id) {
                    let media = session.media_state();
                    println!(
                        "  呼叫 {} -> {} [{}] 静音={} 流数={}",
                        call_id,
                        session.remote_uri(),
                        session.state(),
                        media.muted,
                        media.audio_stream_count
                    );
                }
            }
            Ok(())
        }
        "help" => {
            print_help();
            Ok(())
        }
        "quit" | "exit" => return false,
        _ => {
            eprintln!("未知命令: {}, 输入 help 查看用法", command);
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("命令执行失败: {} ({})", e, e.error_code());
    }
    true
}

fn no_active_call() -> sip_session::CallResult<()> {
    eprintln!("没有活动呼叫");
    Ok(())
}

fn print_help() {
    println!("可用命令:");
    println!("  call <user@domain>  发起呼叫");
    println!("  incoming [from]     模拟一路来电");
    println!("  answer              应答当前来电");
    println!("  hold / unhold       保持 / 恢复当前呼叫");
    println!("  mute / unmute       静音 / 取消静音");
    println!("  hangup              挂断当前呼叫");
    println!("  status              显示账户和呼叫状态");
    println!("  quit                退出");
}
