//! 링크 설정

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_MRU, DEFAULT_RESTART_TIMEOUT_MS};

/// PAP 자격 증명 (peer-id / password)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub peer_id: String,
    pub password: String,
}

impl Credentials {
    pub fn new(peer_id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            password: password.into(),
        }
    }
}

/// 인증 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// 상대가 PAP를 요구할 때 제시할 자격 증명
    /// None이면 상대의 Authentication-Protocol 옵션을 거절
    pub credentials: Option<Credentials>,

    /// 상대에게 PAP 인증을 요구할지 여부
    pub require_pap: bool,

    /// 상대 인증 시 허용할 계정 목록
    pub accounts: Vec<Credentials>,
}

/// IPCP 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ipv4Config {
    /// 제안할 로컬 주소 (0.0.0.0 이면 상대에게 할당 요청)
    pub local_address: Ipv4Addr,

    /// 상대가 0.0.0.0 을 제안했을 때 Nak으로 돌려줄 주소
    pub peer_address: Option<Ipv4Addr>,

    /// DNS 서버 요청 여부 (옵션 129 / 131)
    pub request_dns: bool,

    /// 상대에게 제공할 DNS 서버 (primary, secondary)
    pub dns_servers: [Option<Ipv4Addr>; 2],

    /// 상대 Configure-Request 에 IP-Address 옵션이 반드시 있어야 하는지
    pub require_peer_address: bool,
}

impl Default for Ipv4Config {
    fn default() -> Self {
        Self {
            local_address: Ipv4Addr::UNSPECIFIED,
            peer_address: None,
            request_dns: true,
            dns_servers: [None, None],
            require_peer_address: true,
        }
    }
}

/// IPV6CP 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ipv6Config {
    /// 고정 interface identifier (None 이면 무작위 생성)
    pub interface_id: Option<[u8; 8]>,
}

/// pplink 링크 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// 재전송 타이머 (밀리초)
    pub restart_timeout_ms: u64,

    /// Configure-Request 재전송 횟수 (최초 전송 제외)
    pub max_configure: u32,

    /// Terminate-Request 재전송 횟수 (최초 전송 제외)
    /// 0이면 응답을 기다리지 않고 즉시 종료
    pub max_terminate: u32,

    /// 연속 Nak 허용 횟수, 초과 시 Reject 로 전환
    pub max_nack_loops: u32,

    /// 이미 열린 상태에서 open() 호출 시 down/up 재시작 여부
    pub restart_on_open: bool,

    /// 요청할 MRU
    pub mru: u16,

    /// Magic-Number 옵션 사용 여부
    pub magic_number: bool,

    /// 인증 설정
    pub auth: AuthConfig,

    /// IPCP 설정 (None 이면 IPCP 미등록)
    pub ipv4: Option<Ipv4Config>,

    /// IPV6CP 설정 (None 이면 IPV6CP 미등록)
    pub ipv6: Option<Ipv6Config>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            restart_timeout_ms: DEFAULT_RESTART_TIMEOUT_MS, // 3초
            max_configure: 10,
            max_terminate: 2,
            max_nack_loops: 5,
            restart_on_open: false,
            mru: DEFAULT_MRU,
            magic_number: true,
            auth: AuthConfig::default(),
            ipv4: Some(Ipv4Config::default()),
            ipv6: Some(Ipv6Config::default()),
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 재전송 타이머
    pub fn restart_timeout(&self) -> Duration {
        Duration::from_millis(self.restart_timeout_ms)
    }

    /// 손실이 많은 회선용 설정
    pub fn noisy_line() -> Self {
        Self {
            restart_timeout_ms: 6000,
            max_configure: 20,
            max_terminate: 4,
            max_nack_loops: 8,
            ..Self::default()
        }
    }

    /// 빠른 실패용 설정 (테스트, 로컬 루프백)
    pub fn fast_fail() -> Self {
        Self {
            restart_timeout_ms: 200,
            max_configure: 2,
            max_terminate: 0,
            max_nack_loops: 2,
            ..Self::default()
        }
    }

    /// PAP 클라이언트 자격 증명 설정
    pub fn with_credentials(mut self, peer_id: &str, password: &str) -> Self {
        self.auth.credentials = Some(Credentials::new(peer_id, password));
        self
    }

    /// 상대에게 PAP 인증 요구
    pub fn require_pap(mut self, accounts: Vec<Credentials>) -> Self {
        self.auth.require_pap = true;
        self.auth.accounts = accounts;
        self
    }
}
