//! 에러 타입 정의

use thiserror::Error;

use crate::link::Phase;

/// pplink 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("패킷 길이 불일치: 선언 {declared} bytes, 실제 {available} bytes")]
    TruncatedPacket { declared: usize, available: usize },

    #[error("잘못된 패킷: {reason}")]
    MalformedPacket { reason: &'static str },

    #[error("버퍼 오버플로우: 최대 크기 {max_size} 초과")]
    BufferOverflow { max_size: usize },

    #[error("지원하지 않는 프로토콜: 0x{protocol:04x}")]
    UnknownProtocol { protocol: u16 },

    #[error("허용되지 않는 phase 전이: {from:?} -> {to:?}")]
    InvalidPhaseTransition { from: Phase, to: Phase },

    #[error("링크가 열려 있지 않음")]
    LinkNotOpened,

    #[error("네트워크 설치 실패: {0}")]
    Installer(String),

    #[error("채널 에러")]
    ChannelError,

    #[error("연결 종료")]
    ConnectionClosed,
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
