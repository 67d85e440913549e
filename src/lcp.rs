//! LCP (Link Control Protocol)
//!
//! - 옵션: MRU, ACCM, Authentication-Protocol, Magic-Number
//! - 확장 코드: Echo-Request/Reply, Discard-Request, Protocol-Reject

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::fsm::{Extension, FsmHandler, LayerEvent, Outbox, State};
use crate::negotiation::{
    negotiate_peer_request, MyOption, MyOptions, NakMode, NegotiationError, PeerOption, Verdict,
};
use crate::options::{value_u16, value_u32, OptionError};
use crate::packet::{Code, ControlPacket, Protocol};
use crate::{Config, Result, DEFAULT_MRU};

pub const OPT_MRU: u8 = 1;
pub const OPT_ACCM: u8 = 2;
pub const OPT_AUTH_PROTOCOL: u8 = 3;
pub const OPT_MAGIC_NUMBER: u8 = 5;

/// 허용하는 최소 MRU
pub const MIN_MRU: u16 = 128;

/// LCP 협상 데이터
#[derive(Debug, Clone)]
pub struct LcpData {
    /// 내가 받을 MRU (요청 값)
    pub mru: u16,

    /// 상대가 받을 MRU
    pub peer_mru: u16,

    /// 상대 ACCM
    pub peer_accm: u32,

    /// 내 Magic-Number (0 이면 미사용)
    pub magic: u32,

    /// 상대 Magic-Number
    pub peer_magic: u32,

    /// 상대가 요구한 인증 프로토콜 (내가 인증 받을 쪽)
    pub peer_auth: Option<Protocol>,

    has_credentials: bool,
}

/// 0 과 `avoid` 를 피한 무작위 Magic-Number
fn fresh_magic(avoid: u32) -> u32 {
    loop {
        let magic = rand::random::<u32>();
        if magic != 0 && magic != avoid {
            return magic;
        }
    }
}

fn parse_mru(d: &mut LcpData, v: &[u8]) -> std::result::Result<(), OptionError> {
    let mru = value_u16(OPT_MRU, v)?;
    if mru < MIN_MRU {
        return Err(OptionError::InvalidValue { code: OPT_MRU });
    }
    d.peer_mru = mru;
    Ok(())
}

fn nak_mru(_d: &mut LcpData, _v: &[u8], buf: &mut BytesMut) -> bool {
    buf.put_u16(DEFAULT_MRU);
    true
}

fn parse_accm(d: &mut LcpData, v: &[u8]) -> std::result::Result<(), OptionError> {
    d.peer_accm = value_u32(OPT_ACCM, v)?;
    Ok(())
}

fn parse_auth(d: &mut LcpData, v: &[u8]) -> std::result::Result<(), OptionError> {
    if v.len() < 2 {
        return Err(OptionError::BadLength {
            code: OPT_AUTH_PROTOCOL,
            len: v.len() + 2,
        });
    }
    let protocol = u16::from_be_bytes([v[0], v[1]]);

    if !d.has_credentials || protocol != Protocol::Pap.number() {
        return Err(OptionError::InvalidValue {
            code: OPT_AUTH_PROTOCOL,
        });
    }
    d.peer_auth = Some(Protocol::Pap);
    Ok(())
}

fn nak_auth(d: &mut LcpData, _v: &[u8], buf: &mut BytesMut) -> bool {
    // 자격 증명이 없으면 어떤 인증도 받을 수 없음
    if !d.has_credentials {
        return false;
    }
    buf.put_u16(Protocol::Pap.number());
    true
}

fn parse_magic(d: &mut LcpData, v: &[u8]) -> std::result::Result<(), OptionError> {
    let magic = value_u32(OPT_MAGIC_NUMBER, v)?;
    if magic == 0 || (d.magic != 0 && magic == d.magic) {
        debug!("Magic-Number 충돌 또는 0: {:#010x}", magic);
        return Err(OptionError::InvalidValue {
            code: OPT_MAGIC_NUMBER,
        });
    }
    d.peer_magic = magic;
    Ok(())
}

fn nak_magic(d: &mut LcpData, _v: &[u8], buf: &mut BytesMut) -> bool {
    buf.put_u32(fresh_magic(d.magic));
    true
}

static PEER_OPTIONS: &[PeerOption<LcpData>] = &[
    PeerOption {
        code: OPT_MRU,
        name: "MRU",
        parse: parse_mru,
        build_nak: Some(nak_mru),
    },
    PeerOption {
        code: OPT_ACCM,
        name: "ACCM",
        parse: parse_accm,
        build_nak: None,
    },
    PeerOption {
        code: OPT_AUTH_PROTOCOL,
        name: "Authentication-Protocol",
        parse: parse_auth,
        build_nak: Some(nak_auth),
    },
    PeerOption {
        code: OPT_MAGIC_NUMBER,
        name: "Magic-Number",
        parse: parse_magic,
        build_nak: Some(nak_magic),
    },
];

fn encode_mru(d: &LcpData, buf: &mut BytesMut) {
    buf.put_u16(d.mru);
}

fn mru_nak(d: &mut LcpData, v: &[u8]) -> std::result::Result<(), OptionError> {
    // 더 작은 값만 수용
    let mru = value_u16(OPT_MRU, v)?;
    if mru > d.mru || mru < MIN_MRU {
        return Err(OptionError::InvalidValue { code: OPT_MRU });
    }
    d.mru = mru;
    Ok(())
}

fn encode_auth(_d: &LcpData, buf: &mut BytesMut) {
    buf.put_u16(Protocol::Pap.number());
}

fn auth_nak(_d: &mut LcpData, _v: &[u8]) -> std::result::Result<(), OptionError> {
    // PAP 외에는 지원하지 않음, 같은 값으로 다시 요청
    Err(OptionError::InvalidValue {
        code: OPT_AUTH_PROTOCOL,
    })
}

fn encode_magic(d: &LcpData, buf: &mut BytesMut) {
    buf.put_u32(d.magic);
}

fn magic_nak(d: &mut LcpData, v: &[u8]) -> std::result::Result<(), OptionError> {
    let suggested = value_u32(OPT_MAGIC_NUMBER, v)?;
    d.magic = fresh_magic(suggested);
    Ok(())
}

static MY_MRU: MyOption<LcpData> = MyOption {
    code: OPT_MRU,
    name: "MRU",
    encode: encode_mru,
    on_ack: None,
    on_nak: Some(mru_nak),
};

static MY_AUTH: MyOption<LcpData> = MyOption {
    code: OPT_AUTH_PROTOCOL,
    name: "Authentication-Protocol",
    encode: encode_auth,
    on_ack: None,
    on_nak: Some(auth_nak),
};

static MY_MAGIC: MyOption<LcpData> = MyOption {
    code: OPT_MAGIC_NUMBER,
    name: "Magic-Number",
    encode: encode_magic,
    on_ack: None,
    on_nak: Some(magic_nak),
};

/// LCP 핸들러
pub struct Lcp {
    data: LcpData,
    mine: MyOptions<LcpData>,
    configured_mru: u16,
    magic_enabled: bool,
    require_pap: bool,
}

impl Lcp {
    pub fn new(config: &Config) -> Self {
        let mut descs: Vec<&'static MyOption<LcpData>> = vec![&MY_MRU];
        if config.auth.require_pap {
            descs.push(&MY_AUTH);
        }
        if config.magic_number {
            descs.push(&MY_MAGIC);
        }

        Self {
            data: LcpData {
                mru: config.mru,
                peer_mru: DEFAULT_MRU,
                peer_accm: u32::MAX,
                magic: if config.magic_number { fresh_magic(0) } else { 0 },
                peer_magic: 0,
                peer_auth: None,
                has_credentials: config.auth.credentials.is_some(),
            },
            mine: MyOptions::new(descs),
            configured_mru: config.mru,
            magic_enabled: config.magic_number,
            require_pap: config.auth.require_pap,
        }
    }

    pub fn data(&self) -> &LcpData {
        &self.data
    }

    /// 내가 받을 MRU
    pub fn mru(&self) -> u16 {
        self.data.mru
    }

    /// 상대가 받을 MRU (송신 시 상한)
    pub fn peer_mru(&self) -> u16 {
        self.data.peer_mru
    }

    pub fn magic(&self) -> u32 {
        self.data.magic
    }

    /// 상대가 나에게 요구한 인증
    pub fn peer_auth(&self) -> Option<Protocol> {
        self.data.peer_auth
    }

    /// 내가 요구한 PAP 를 상대가 Ack 했는지
    pub fn auth_acked(&self) -> bool {
        self.mine.is_acked(OPT_AUTH_PROTOCOL)
    }

    pub fn requires_pap(&self) -> bool {
        self.require_pap
    }

    /// Echo 페이로드: magic(4) + data
    pub fn echo_payload(&self, data: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + data.len());
        buf.put_u32(self.data.magic);
        buf.put_slice(data);
        buf.freeze()
    }

    /// 수신 magic 이 내 것과 같으면 루프백 의심
    fn looped_back(&self, payload: &[u8]) -> bool {
        if payload.len() < 4 || self.data.magic == 0 {
            return false;
        }
        let mut magic = &payload[..4];
        magic.get_u32() == self.data.magic
    }
}

impl FsmHandler for Lcp {
    fn config_info_add(&mut self) -> Result<Bytes> {
        Ok(self.mine.encode(&self.data)?)
    }

    fn config_info_req(
        &mut self,
        options: &[u8],
        mode: NakMode,
    ) -> std::result::Result<Verdict, NegotiationError> {
        self.data.peer_mru = DEFAULT_MRU;
        self.data.peer_accm = u32::MAX;
        self.data.peer_magic = 0;
        self.data.peer_auth = None;

        negotiate_peer_request(PEER_OPTIONS, &mut self.data, options, mode)
    }

    fn config_info_ack(&mut self, options: &[u8]) -> std::result::Result<(), NegotiationError> {
        self.mine.handle_ack(&mut self.data, options)
    }

    fn config_info_nak(
        &mut self,
        options: &[u8],
        give_up: bool,
    ) -> std::result::Result<(), NegotiationError> {
        self.mine.handle_nak(&mut self.data, options, give_up)
    }

    fn config_info_rej(&mut self, options: &[u8]) -> std::result::Result<(), NegotiationError> {
        self.mine.handle_reject(options)?;
        if self.mine.is_rejected(OPT_MAGIC_NUMBER) {
            self.data.magic = 0;
        }
        Ok(())
    }

    fn config_info_reset(&mut self) {
        self.mine.reset();
        self.data.mru = self.configured_mru;
        if self.magic_enabled {
            self.data.magic = fresh_magic(self.data.magic);
        }
    }

    fn up(&mut self, _out: &mut Outbox) {
        info!(
            "LCP up: MRU {} / 상대 MRU {}, 상대 인증 요구 {:?}",
            self.data.mru, self.data.peer_mru, self.data.peer_auth
        );
    }

    fn down(&mut self, _out: &mut Outbox) {
        info!("LCP down");
    }

    fn proto_extension(
        &mut self,
        state: State,
        packet: &ControlPacket,
        out: &mut Outbox,
    ) -> Extension {
        match packet.kind() {
            Some(Code::EchoRequest) => {
                if state != State::Opened {
                    return Extension::Handled;
                }
                if self.looped_back(&packet.payload) {
                    warn!("LCP: 내 Magic-Number 로 Echo-Request 수신, 루프백 의심");
                }
                let data = packet.payload.get(4..).unwrap_or_default();
                Extension::Reply {
                    code: Code::EchoReply,
                    payload: self.echo_payload(data),
                }
            }
            Some(Code::EchoReply) => {
                if state == State::Opened {
                    if self.looped_back(&packet.payload) {
                        warn!("LCP: 내 Magic-Number 로 Echo-Reply 수신, 루프백 의심");
                    } else {
                        out.events.push_back(LayerEvent::EchoReply(packet.id));
                    }
                }
                Extension::Handled
            }
            Some(Code::DiscardRequest) => Extension::Handled,
            Some(Code::ProtocolReject) => {
                if state == State::Opened && packet.payload.len() >= 2 {
                    let rejected = u16::from_be_bytes([packet.payload[0], packet.payload[1]]);
                    debug!("LCP: Protocol-Reject 수신: 0x{:04x}", rejected);
                    out.events.push_back(LayerEvent::ProtocolRejected(rejected));
                }
                Extension::Handled
            }
            _ => Extension::Unhandled,
        }
    }
}
