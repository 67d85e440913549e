//! PAP (Password Authentication Protocol, RFC 1334)
//!
//! 인증 받는 쪽은 FSM 으로 Authenticate-Request 를 재전송하고,
//! Authenticate-Ack 하나로 바로 Opened 가 된다.
//! 인증하는 쪽은 `Pap` 이 Authenticate-Request 를 가로채 계정 목록과 비교한다.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::config::Credentials;
use crate::fsm::{Fsm, FsmHandler, FsmLimits, LayerEvent, Outbox, State, SubProtocol};
use crate::negotiation::{NakMode, NegotiationError, Verdict};
use crate::options::OptionError;
use crate::packet::{ControlPacket, Protocol};
use crate::{Config, Error, Result};

const MSG_SUCCESS: &str = "Login ok";
const MSG_FAILURE: &str = "Login incorrect";

fn put_field(buf: &mut BytesMut, field: &[u8]) -> Result<()> {
    if field.len() > u8::MAX as usize {
        return Err(Error::BufferOverflow {
            max_size: u8::MAX as usize,
        });
    }
    buf.put_u8(field.len() as u8);
    buf.put_slice(field);
    Ok(())
}

fn take_field<'a>(data: &'a [u8], offset: &mut usize) -> std::result::Result<&'a [u8], OptionError> {
    let len = *data
        .get(*offset)
        .ok_or(OptionError::Truncated { offset: *offset })? as usize;
    let start = *offset + 1;
    let field = data
        .get(start..start + len)
        .ok_or(OptionError::Truncated { offset: *offset })?;
    *offset = start + len;
    Ok(field)
}

/// Authenticate-Request 페이로드 디코딩
pub fn decode_request(payload: &[u8]) -> std::result::Result<Credentials, OptionError> {
    let mut offset = 0;
    let peer_id = take_field(payload, &mut offset)?;
    let password = take_field(payload, &mut offset)?;
    Ok(Credentials::new(
        String::from_utf8_lossy(peer_id),
        String::from_utf8_lossy(password),
    ))
}

/// Authenticate-Request 페이로드 인코딩
pub fn encode_request(credentials: &Credentials) -> Result<Bytes> {
    let mut buf =
        BytesMut::with_capacity(2 + credentials.peer_id.len() + credentials.password.len());
    put_field(&mut buf, credentials.peer_id.as_bytes())?;
    put_field(&mut buf, credentials.password.as_bytes())?;
    Ok(buf.freeze())
}

fn encode_message(message: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + message.len());
    let message = &message.as_bytes()[..message.len().min(u8::MAX as usize)];
    buf.put_u8(message.len() as u8);
    buf.put_slice(message);
    buf.freeze()
}

fn decode_message(payload: &[u8]) -> String {
    let mut offset = 0;
    take_field(payload, &mut offset)
        .map(|m| String::from_utf8_lossy(m).into_owned())
        .unwrap_or_default()
}

/// PAP FSM 핸들러
pub struct PapHandler {
    credentials: Option<Credentials>,
    accounts: Vec<Credentials>,
    requested_by: String,
}

impl PapHandler {
    pub fn new(config: &Config) -> Self {
        Self {
            credentials: config.auth.credentials.clone(),
            accounts: config.auth.accounts.clone(),
            requested_by: String::new(),
        }
    }

    /// 마지막으로 검증한 요청의 peer-id
    pub fn requested_by(&self) -> &str {
        &self.requested_by
    }
}

impl FsmHandler for PapHandler {
    fn config_info_add(&mut self) -> Result<Bytes> {
        match &self.credentials {
            Some(credentials) => encode_request(credentials),
            None => {
                warn!("PAP: 자격 증명 없이 인증 요청");
                encode_request(&Credentials::new("", ""))
            }
        }
    }

    /// 상대 Authenticate-Request 검증
    fn config_info_req(
        &mut self,
        payload: &[u8],
        _mode: NakMode,
    ) -> std::result::Result<Verdict, NegotiationError> {
        let request = decode_request(payload)?;
        let accepted = self.accounts.iter().any(|account| *account == request);
        self.requested_by = request.peer_id;

        if accepted {
            Ok(Verdict::Ack(encode_message(MSG_SUCCESS)))
        } else {
            Ok(Verdict::Nak(encode_message(MSG_FAILURE)))
        }
    }

    fn config_info_ack(&mut self, payload: &[u8]) -> std::result::Result<(), NegotiationError> {
        debug!("PAP: Authenticate-Ack: {}", decode_message(payload));
        Ok(())
    }

    fn config_info_nak(
        &mut self,
        payload: &[u8],
        _give_up: bool,
    ) -> std::result::Result<(), NegotiationError> {
        Err(NegotiationError::Refused(decode_message(payload)))
    }

    fn config_info_rej(&mut self, _payload: &[u8]) -> std::result::Result<(), NegotiationError> {
        Err(NegotiationError::Refused("PAP 요청 거부됨".to_string()))
    }

    fn up(&mut self, _out: &mut Outbox) {
        info!("PAP: 인증 성공");
    }

    fn ack_completes_handshake(&self) -> bool {
        true
    }
}

/// PAP 서브 프로토콜 (인증 받는 쪽 FSM + 인증하는 쪽 검증)
pub struct Pap {
    fsm: Fsm<PapHandler>,
    authenticator: bool,
    authenticated_peer: Option<String>,
}

impl Pap {
    pub fn new(config: &Config) -> Self {
        Self {
            fsm: Fsm::new(Protocol::Pap, FsmLimits::from(config), PapHandler::new(config)),
            authenticator: config.auth.require_pap,
            authenticated_peer: None,
        }
    }

    /// 인증에 성공한 상대 peer-id
    pub fn authenticated_peer(&self) -> Option<&str> {
        self.authenticated_peer.as_deref()
    }

    pub fn fsm(&self) -> &Fsm<PapHandler> {
        &self.fsm
    }

    fn authenticate(&mut self, packet: &ControlPacket, out: &mut Outbox) {
        if !self.authenticator {
            debug!("PAP: 인증을 요구하지 않았으므로 Authenticate-Request 폐기");
            return;
        }
        if matches!(self.fsm.state(), State::Initial | State::Starting) {
            debug!("PAP: 하위 계층 down, Authenticate-Request 폐기");
            return;
        }

        let verdict = match self
            .fsm
            .handler_mut()
            .config_info_req(&packet.payload, NakMode::Counter)
        {
            Ok(verdict) => verdict,
            Err(e) => {
                debug!("PAP: Authenticate-Request 폐기: {}", e);
                return;
            }
        };

        let peer = self.fsm.handler().requested_by().to_string();
        out.send(
            Protocol::Pap,
            ControlPacket::new(verdict.code(), packet.id, verdict.payload().clone()),
        );

        if verdict.is_ack() {
            // 재전송된 요청에는 이벤트를 다시 내지 않음
            if self.authenticated_peer.as_deref() != Some(peer.as_str()) {
                info!("PAP: 상대 인증 성공: {}", peer);
                self.authenticated_peer = Some(peer.clone());
                out.events.push_back(LayerEvent::PeerAuthenticated(peer));
            }
        } else {
            warn!("PAP: 상대 인증 실패: {}", peer);
            out.events.push_back(LayerEvent::PeerAuthFailed(peer));
        }
    }
}

impl SubProtocol for Pap {
    fn protocol(&self) -> Protocol {
        Protocol::Pap
    }

    fn state(&self) -> State {
        self.fsm.state()
    }

    fn open(&mut self, out: &mut Outbox) -> Result<()> {
        self.fsm.open(out)
    }

    fn close(&mut self, reason: &str, out: &mut Outbox) {
        self.fsm.close(reason, out)
    }

    fn lower_up(&mut self, out: &mut Outbox) -> Result<()> {
        self.fsm.lower_up(out)
    }

    fn lower_down(&mut self, out: &mut Outbox) {
        self.authenticated_peer = None;
        self.fsm.lower_down(out)
    }

    fn input(&mut self, packet: &ControlPacket, out: &mut Outbox) -> Result<()> {
        // Authenticate-Request 는 Configure-Request 와 같은 코드
        if packet.code == crate::packet::Code::ConfigureRequest as u8 {
            self.authenticate(packet, out);
            return Ok(());
        }
        self.fsm.input(packet, out)
    }

    fn timeout(&mut self, generation: u64, out: &mut Outbox) {
        self.fsm.timeout(generation, out)
    }

    fn set_peer_mru(&mut self, mru: u16) {
        self.fsm.set_peer_mru(mru)
    }
}
