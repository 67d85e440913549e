//! pplink 서버
//!
//! UDP 로 들어오는 상대마다 링크 세션을 하나씩 띄운다.
//! - 상대에게 주소 풀에서 IPv4 주소를 할당
//! - 선택적으로 PAP 인증 요구
//!
//! 사용법:
//!   cargo run --release --bin pplink-server -- [OPTIONS]
//!
//! 예시:
//!   # 기본 실행
//!   cargo run --release --bin pplink-server -- --bind 0.0.0.0:9000
//!
//!   # PAP 인증 요구 + DNS 제공
//!   cargo run --release --bin pplink-server -- --account alice:secret --dns 10.64.0.1

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use pplink::config::Ipv4Config;
use pplink::transport::UdpTransport;
use pplink::{Config, Credentials, LinkEvent, LinkHandle, Phase, RecordingInstaller};

/// 서버 설정
struct ServerConfig {
    bind_addr: SocketAddr,
    local_address: Ipv4Addr,
    pool_start: Ipv4Addr,
    dns: Option<Ipv4Addr>,
    config: Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".parse().unwrap(),
            local_address: Ipv4Addr::new(10, 64, 0, 1),
            pool_start: Ipv4Addr::new(10, 64, 0, 2),
            dns: None,
            config: Config::default(),
        }
    }
}

fn parse_args() -> ServerConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ServerConfig::default();
    let mut accounts = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--local" | "-l" => {
                if i + 1 < args.len() {
                    config.local_address = args[i + 1].parse().expect("유효한 IPv4 주소 필요");
                    i += 1;
                }
            }
            "--pool" | "-p" => {
                if i + 1 < args.len() {
                    config.pool_start = args[i + 1].parse().expect("유효한 IPv4 주소 필요");
                    i += 1;
                }
            }
            "--dns" => {
                if i + 1 < args.len() {
                    config.dns = Some(args[i + 1].parse().expect("유효한 IPv4 주소 필요"));
                    i += 1;
                }
            }
            "--account" | "-a" => {
                if i + 1 < args.len() {
                    let (user, password) =
                        args[i + 1].split_once(':').expect("user:password 형식 필요");
                    accounts.push(Credentials::new(user, password));
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
                    r#"pplink Server - 점대점 링크 협상 서버

사용법:
  cargo run --release --bin pplink-server -- [OPTIONS]

옵션:
  -b, --bind <ADDR>         바인드 주소 (기본: 0.0.0.0:9000)
  -l, --local <IPV4>        서버 쪽 주소 (기본: 10.64.0.1)
  -p, --pool <IPV4>         상대에게 할당할 첫 주소 (기본: 10.64.0.2)
  --dns <IPV4>              상대에게 제공할 DNS 서버
  -a, --account <USER:PW>   PAP 계정 (지정하면 인증 요구, 여러 번 가능)
  -t, --timeout <MS>        재전송 타이머 밀리초 (기본: 3000)
  --noisy                   손실이 많은 회선용 설정
  --no-ipv6                 IPV6CP 비활성화
  -h, --help                이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    if !accounts.is_empty() {
        config.config = config.config.require_pap(accounts);
    }
    config
}

/// 주소 풀 (순서대로 하나씩)
struct AddressPool {
    next: AtomicU32,
}

impl AddressPool {
    fn new(start: Ipv4Addr) -> Self {
        Self {
            next: AtomicU32::new(u32::from(start)),
        }
    }

    fn allocate(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.next.fetch_add(1, Ordering::Relaxed))
    }
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

    let server_config = parse_args();

    info!("pplink Server starting...");
    info!("Bind address: {}", server_config.bind_addr);
    info!("Local address: {}", server_config.local_address);
    info!("PAP required: {}", server_config.config.auth.require_pap);

    let transport = UdpTransport::bind(server_config.bind_addr).await?;
    info!("Server listening on {}", transport.local_addr()?);

    let links: Arc<DashMap<SocketAddr, LinkHandle>> = Arc::new(DashMap::new());
    let pool = AddressPool::new(server_config.pool_start);

    loop {
        let datagram = tokio::select! {
            result = transport.recv() => result?,
            _ = tokio::signal::ctrl_c() => break,
        };

        let existing = links
            .get(&datagram.peer)
            .map(|handle| handle.clone())
            .filter(|handle| !handle.is_closed());
        let handle = match existing {
            Some(handle) => handle,
            None => {
                let mut config = server_config.config.clone();
                config.ipv4 = Some(Ipv4Config {
                    local_address: server_config.local_address,
                    peer_address: Some(pool.allocate()),
                    request_dns: false,
                    dns_servers: [server_config.dns, None],
                    ..Default::default()
                });

                let outbound = transport.spawn_sender(datagram.peer);
                let (handle, events) =
                    LinkHandle::spawn(config, outbound, Arc::new(RecordingInstaller::new()));
                links.insert(datagram.peer, handle.clone());
                tokio::spawn(watch_link(datagram.peer, events, links.clone()));

                handle.open().await?;
                handle.carrier_on().await?;
                info!("New peer: {}", datagram.peer);
                handle
            }
        };

        if let Err(e) = handle.input(datagram.payload).await {
            warn!("{} 세션 입력 실패: {}", datagram.peer, e);
            links.remove(&datagram.peer);
        }
    }

    info!("Shutting down {} link(s)...", links.len());
    let handles: Vec<LinkHandle> = links.iter().map(|entry| entry.value().clone()).collect();
    for handle in handles {
        let _ = handle.close("server shutdown").await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

/// 링크 이벤트 로깅, 종료되면 세션 정리
async fn watch_link(
    peer: SocketAddr,
    mut events: mpsc::Receiver<LinkEvent>,
    links: Arc<DashMap<SocketAddr, LinkHandle>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::PhaseChanged(Phase::Running) => {
                if let Some(handle) = links.get(&peer) {
                    let status = handle.status();
                    info!(
                        "{} running: peer={:?} protocols={:?}",
                        peer, status.peer_name, status.protocols
                    );
                }
            }
            LinkEvent::PeerAuthenticated(name) => info!("{} authenticated as {}", peer, name),
            LinkEvent::NetworkUp(protocol) => info!("{} {} up", peer, protocol),
            LinkEvent::NetworkDown(protocol) => info!("{} {} down", peer, protocol),
            LinkEvent::Terminated(reason) => {
                info!("{} terminated: {}", peer, reason);
                if let Some((_, handle)) = links.remove(&peer) {
                    let _ = handle.stop().await;
                }
                break;
            }
            _ => {}
        }
    }
}
