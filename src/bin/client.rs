//! pplink 클라이언트
//!
//! 서버와 링크 하나를 협상해 올리고 Ctrl-C 로 종료 절차를 밟는다.
//!
//! 사용법:
//!   cargo run --release --bin pplink-client -- [OPTIONS]
//!
//! 예시:
//!   # 기본 접속
//!   cargo run --release --bin pplink-client -- --server 127.0.0.1:9000
//!
//!   # PAP 자격 증명 + 주기적 echo
//!   cargo run --release --bin pplink-client -- -s 127.0.0.1:9000 --user alice --password secret --echo 5

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use pplink::transport::UdpTransport;
use pplink::{Config, LinkEvent, LinkHandle, Phase, RecordingInstaller};

/// 클라이언트 설정
struct ClientConfig {
    bind_addr: SocketAddr,
    server_addr: SocketAddr,
    user: Option<String>,
    password: String,
    echo_interval: Option<Duration>,
    config: Config,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".parse().unwrap(),
            server_addr: "127.0.0.1:9000".parse().unwrap(),
            user: None,
            password: String::new(),
            echo_interval: None,
            config: Config::default(),
        }
    }
}

fn parse_args() -> ClientConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ClientConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--server" | "-s" => {
                if i + 1 < args.len() {
                    config.server_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--user" | "-u" => {
                if i + 1 < args.len() {
                    config.user = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--password" | "-p" => {
                if i + 1 < args.len() {
                    config.password = args[i + 1].clone();
                    i += 1;
                }
            }
            "--echo" | "-e" => {
                if i + 1 < args.len() {
                    let secs: u64 = args[i + 1].parse().expect("유효한 숫자 필요");
                    config.echo_interval = Some(Duration::from_secs(secs));
                    i += 1;
                }
            }
            "--timeout" | "-t" => {
                if i + 1 < args.len() {
                    config.config.restart_timeout_ms =
                        args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--noisy" => {
                config.config = Config::noisy_line();
            }
            "--no-ipv6" => {
                config.config.ipv6 = None;
            }
            "--help" | "-h" => {
                println!(
                    r#"pplink Client - 점대점 링크 협상 클라이언트

사용법:
  cargo run --release --bin pplink-client -- [OPTIONS]

옵션:
  -b, --bind <ADDR>       로컬 바인드 주소 (기본: 0.0.0.0:0 = 자동 할당)
  -s, --server <ADDR>     서버 주소 (기본: 127.0.0.1:9000)
  -u, --user <NAME>       PAP peer-id
  -p, --password <PW>     PAP password
  -e, --echo <SECS>       Running 중 echo 간격 (초)
  -t, --timeout <MS>      재전송 타이머 밀리초 (기본: 3000)
  --noisy                 손실이 많은 회선용 설정
  --no-ipv6               IPV6CP 비활성화
  -h, --help              이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    if let Some(user) = config.user.clone() {
        config.config = config.config.with_credentials(&user, &config.password);
    }
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let client_config = parse_args();

    info!("pplink Client starting...");
    info!("Server address: {}", client_config.server_addr);

    let transport = UdpTransport::bind(client_config.bind_addr).await?;
    info!("Local address: {}", transport.local_addr()?);

    let installer = RecordingInstaller::new();
    let outbound = transport.spawn_sender(client_config.server_addr);
    let (handle, mut events) =
        LinkHandle::spawn(client_config.config, outbound, std::sync::Arc::new(installer.clone()));

    // 수신 태스크: 서버에서 온 데이터그램만 세션으로 전달
    let recv_handle = handle.clone();
    let server_addr = client_config.server_addr;
    let recv_task = tokio::spawn(async move {
        loop {
            let datagram = match transport.recv().await {
                Ok(datagram) => datagram,
                Err(e) => {
                    warn!("수신 에러: {}", e);
                    break;
                }
            };
            if datagram.peer != server_addr {
                continue;
            }
            if recv_handle.input(datagram.payload).await.is_err() {
                break;
            }
        }
    });

    handle.open().await?;
    handle.carrier_on().await?;

    let mut echo_timer = client_config
        .echo_interval
        .map(|interval| tokio::time::interval(interval));
    let mut closing = false;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    LinkEvent::PhaseChanged(phase) => {
                        info!("Phase: {:?}", phase);
                        if phase == Phase::Running {
                            if let Some(lease) = installer.ipv4() {
                                info!("IPv4: {} (peer {}) dns={:?}", lease.local, lease.peer, lease.dns);
                            }
                            if let Some(lease) = installer.ipv6() {
                                info!("IPv6: {} (peer {})", lease.local, lease.peer);
                            }
                        }
                    }
                    LinkEvent::EchoReply(id) => info!("Echo-Reply id={}", id),
                    LinkEvent::Terminated(reason) => {
                        info!("Link terminated: {}", reason);
                        break;
                    }
                    other => info!("{:?}", other),
                }
            }
            _ = async {
                match echo_timer.as_mut() {
                    Some(timer) => { timer.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                if handle.status().phase == Phase::Running {
                    match handle.echo(Bytes::from_static(b"pplink")).await {
                        Ok(id) => info!("Echo-Request id={}", id),
                        Err(e) => warn!("Echo 실패: {}", e),
                    }
                }
            }
            _ = tokio::signal::ctrl_c(), if !closing => {
                info!("Closing link...");
                closing = true;
                handle.close("user request").await?;
            }
        }
    }

    let _ = handle.stop().await;
    recv_task.abort();
    Ok(())
}
