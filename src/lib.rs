//! # pplink
//!
//! RFC 1661 스타일 점대점 링크 협상 엔진
//!
//! ## 핵심 구성
//! - **FSM 엔진**: 서브 프로토콜마다 하나씩 도는 10-상태 협상 오토마톤
//! - **옵션 협상**: Ack / Nak / Reject 결정 절차 (RFC 1661 §5)
//! - **서브 프로토콜**: LCP, IPCP, IPV6CP, PAP
//! - **Phase 관리**: Dead → Establish → Auth → Network → Running → Terminate
//! - **세션**: 연결당 tokio 태스크 하나가 링크 상태를 단독 소유

pub mod config;
pub mod error;
pub mod fsm;
pub mod ipcp;
pub mod ipv6cp;
pub mod lcp;
pub mod link;
pub mod negotiation;
pub mod netif;
pub mod options;
pub mod packet;
pub mod pap;
pub mod session;
pub mod transport;

pub use config::{Config, Credentials};
pub use error::{Error, Result};
pub use fsm::{Fsm, FsmHandler, Outbox, State, SubProtocol};
pub use link::{Link, LinkEvent, Phase};
pub use negotiation::Verdict;
pub use netif::{NetworkInstaller, RecordingInstaller};
pub use packet::{Code, ControlPacket, Protocol};
pub use session::{LinkHandle, LinkStatus};

/// 제어 패킷 헤더 크기 (code + id + length)
pub const HEADER_SIZE: usize = 4;

/// 프레임 헤더 크기 (protocol + 제어 패킷 헤더)
pub const FRAME_HEADER_SIZE: usize = 2 + HEADER_SIZE;

/// 기본 MRU (바이트)
pub const DEFAULT_MRU: u16 = 1500;

/// 기본 재전송 타이머 (밀리초)
pub const DEFAULT_RESTART_TIMEOUT_MS: u64 = 3000;

/// Terminate 사유 최대 길이 (바이트)
pub const MAX_TERMINATE_REASON_LEN: usize = 32;
