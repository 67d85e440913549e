//! 제어 패킷 와이어 포맷
//!
//! `protocol(2) | code(1) | id(1) | length(2) | payload`, 빅엔디언
//! length 는 code 부터 payload 끝까지의 길이

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result, FRAME_HEADER_SIZE, HEADER_SIZE};

/// 서브 프로토콜 번호
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[repr(u16)]
pub enum Protocol {
    /// Link Control Protocol
    Lcp = 0xc021,

    /// Password Authentication Protocol
    Pap = 0xc023,

    /// IPv4 Control Protocol
    Ipcp = 0x8021,

    /// IPv6 Control Protocol
    Ipv6cp = 0x8057,
}

impl Protocol {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0xc021 => Some(Protocol::Lcp),
            0xc023 => Some(Protocol::Pap),
            0x8021 => Some(Protocol::Ipcp),
            0x8057 => Some(Protocol::Ipv6cp),
            _ => None,
        }
    }

    pub fn number(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        match self {
            Protocol::Lcp => "LCP",
            Protocol::Pap => "PAP",
            Protocol::Ipcp => "IPCP",
            Protocol::Ipv6cp => "IPV6CP",
        }
    }

    pub fn kind(self) -> ProtocolKind {
        match self {
            Protocol::Lcp => ProtocolKind::Link,
            Protocol::Pap => ProtocolKind::Authentication,
            Protocol::Ipcp | Protocol::Ipv6cp => ProtocolKind::Network,
        }
    }
}

/// 서브 프로토콜 분류 (phase 관리용)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    /// 링크 제어 (LCP)
    Link,

    /// 인증 (PAP)
    Authentication,

    /// 네트워크 제어 (IPCP, IPV6CP)
    Network,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// 제어 패킷 코드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Code {
    ConfigureRequest = 1,
    ConfigureAck = 2,
    ConfigureNak = 3,
    ConfigureReject = 4,
    TerminateRequest = 5,
    TerminateAck = 6,
    CodeReject = 7,
    ProtocolReject = 8,
    EchoRequest = 9,
    EchoReply = 10,
    DiscardRequest = 11,
}

impl Code {
    pub fn from_u8(value: u8) -> Option<Self> {
        let code = match value {
            1 => Code::ConfigureRequest,
            2 => Code::ConfigureAck,
            3 => Code::ConfigureNak,
            4 => Code::ConfigureReject,
            5 => Code::TerminateRequest,
            6 => Code::TerminateAck,
            7 => Code::CodeReject,
            8 => Code::ProtocolReject,
            9 => Code::EchoRequest,
            10 => Code::EchoReply,
            11 => Code::DiscardRequest,
            _ => return None,
        };
        Some(code)
    }
}

/// 제어 패킷 (송수신마다 생성, 보관하지 않음)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    /// 원시 코드 값 (모르는 코드도 보존해야 Code-Reject 가능)
    pub code: u8,

    /// 식별자
    pub id: u8,

    /// 페이로드 (옵션 블록 또는 프로토콜별 데이터)
    pub payload: Bytes,
}

impl ControlPacket {
    pub fn new(code: Code, id: u8, payload: Bytes) -> Self {
        Self {
            code: code as u8,
            id,
            payload,
        }
    }

    /// 알려진 코드로 변환
    pub fn kind(&self) -> Option<Code> {
        Code::from_u8(self.code)
    }

    /// 헤더 포함 길이
    pub fn len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// 헤더 + 페이로드를 버퍼에 기록
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let len = self.len();
        if len > u16::MAX as usize {
            return Err(Error::BufferOverflow {
                max_size: u16::MAX as usize,
            });
        }

        buf.reserve(len);
        buf.put_u8(self.code);
        buf.put_u8(self.id);
        buf.put_u16(len as u16);
        buf.put_slice(&self.payload);
        Ok(())
    }

    /// 헤더 포함 바이트로 직렬화
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// 바이트에서 역직렬화
    ///
    /// 선언된 길이가 버퍼보다 길면 잘린 패킷으로 간주한다.
    /// 선언된 길이 뒤의 남는 바이트는 패딩으로 무시한다.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::TruncatedPacket {
                declared: HEADER_SIZE,
                available: bytes.len(),
            });
        }

        let mut header = &bytes[..HEADER_SIZE];
        let code = header.get_u8();
        let id = header.get_u8();
        let declared = header.get_u16() as usize;

        if declared < HEADER_SIZE {
            return Err(Error::MalformedPacket {
                reason: "length 필드가 헤더보다 짧음",
            });
        }
        if declared > bytes.len() {
            return Err(Error::TruncatedPacket {
                declared,
                available: bytes.len(),
            });
        }

        Ok(Self {
            code,
            id,
            payload: Bytes::copy_from_slice(&bytes[HEADER_SIZE..declared]),
        })
    }
}

/// 프로토콜 번호가 붙은 프레임
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub protocol: u16,
    pub packet: ControlPacket,
}

impl Frame {
    pub fn new(protocol: Protocol, packet: ControlPacket) -> Self {
        Self {
            protocol: protocol.number(),
            packet,
        }
    }

    /// 프레임 직렬화
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(2 + self.packet.len());
        buf.put_u16(self.protocol);
        self.packet.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// 프레임 역직렬화
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let protocol = Self::peek_protocol(bytes)?;
        let packet = ControlPacket::decode(&bytes[2..])?;
        Ok(Self { protocol, packet })
    }

    /// 등록된 프로토콜 번호인지 확인
    pub fn known_protocol(&self) -> Result<Protocol> {
        Protocol::from_u16(self.protocol).ok_or(Error::UnknownProtocol {
            protocol: self.protocol,
        })
    }

    /// 프로토콜 번호만 읽기 (Protocol-Reject 용)
    pub fn peek_protocol(bytes: &[u8]) -> Result<u16> {
        if bytes.len() < 2 {
            return Err(Error::TruncatedPacket {
                declared: FRAME_HEADER_SIZE,
                available: bytes.len(),
            });
        }
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}
