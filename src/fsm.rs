//! 협상 FSM 엔진 (RFC 1661 §4)
//!
//! 서브 프로토콜마다 하나의 `Fsm` 이 상태, 타이머, 재전송 카운터를 소유한다.
//! 프로토콜별 동작은 `FsmHandler` 구현이 채운다.
//! FSM 은 직접 I/O 하지 않고 송신 패킷, 타이머 명령, 계층 이벤트를 `Outbox` 에 쌓는다.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::negotiation::{NakMode, NegotiationError, Verdict};
use crate::packet::{Code, ControlPacket, Frame, Protocol, ProtocolKind};
use crate::{Config, Result, DEFAULT_MRU, HEADER_SIZE, MAX_TERMINATE_REASON_LEN};

/// FSM 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum State {
    /// 하위 계층 down, open 안 됨
    Initial,
    /// open 됨, 하위 계층 대기
    Starting,
    /// 하위 계층 up, open 안 됨
    Closed,
    /// 하위 계층 up, 수동 대기
    Stopped,
    /// 로컬 close 로 종료 중
    Closing,
    /// 상대 요청 또는 실패로 종료 중
    Stopping,
    /// Configure-Request 보냄
    RequestSent,
    /// 내 요청이 Ack 됨
    AckReceived,
    /// 상대 요청을 Ack 함
    AckSent,
    /// 협상 완료
    Opened,
}

impl State {
    /// 상대 응답을 기다리는 상태 (타이머 동작)
    pub fn expects_reply(self) -> bool {
        matches!(
            self,
            State::Closing
                | State::Stopping
                | State::RequestSent
                | State::AckReceived
                | State::AckSent
        )
    }
}

/// 오케스트레이터가 반응하는 계층 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerEvent {
    /// this-layer-up
    Up(Protocol),
    /// this-layer-down
    Down(Protocol),
    /// this-layer-started
    Starting(Protocol),
    /// this-layer-finished
    Finished(Protocol),
    /// 상대가 Protocol-Reject 로 거부한 프로토콜 번호
    ProtocolRejected(u16),
    /// 상대가 우리의 요청 자체를 거부 (인증 실패 등)
    Refused(Protocol, String),
    /// 상대 인증 성공 (PAP authenticator)
    PeerAuthenticated(String),
    /// 상대 인증 실패 (PAP authenticator)
    PeerAuthFailed(String),
    /// Echo-Reply 수신 (id)
    EchoReply(u8),
}

/// 타이머 종류 (프로토콜마다 종류별로 하나씩)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// FSM 재전송 타이머
    Restart,
    /// 상대의 Authenticate-Request 대기 (링크가 관리)
    AuthWait,
}

/// 타이머 명령 (세션이 실제 타이머로 변환)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    Arm {
        protocol: Protocol,
        kind: TimerKind,
        generation: u64,
        after: Duration,
    },
    Cancel {
        protocol: Protocol,
        kind: TimerKind,
    },
}

/// FSM 출력 버퍼
#[derive(Debug, Default)]
pub struct Outbox {
    /// 송신 프레임 (제출 순서 유지)
    pub frames: Vec<Frame>,

    /// 타이머 명령
    pub timers: Vec<TimerCommand>,

    /// 계층 이벤트
    pub events: VecDeque<LayerEvent>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, protocol: Protocol, packet: ControlPacket) {
        self.frames.push(Frame::new(protocol, packet));
    }

    pub fn take_frames(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.frames)
    }

    pub fn take_timers(&mut self) -> Vec<TimerCommand> {
        std::mem::take(&mut self.timers)
    }
}

/// 재전송 / Nak 루프 한도
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsmLimits {
    pub restart_timeout: Duration,
    pub max_configure: u32,
    pub max_terminate: u32,
    pub max_nack_loops: u32,
    pub restart_on_open: bool,
}

impl From<&Config> for FsmLimits {
    fn from(config: &Config) -> Self {
        Self {
            restart_timeout: config.restart_timeout(),
            max_configure: config.max_configure,
            max_terminate: config.max_terminate,
            max_nack_loops: config.max_nack_loops,
            restart_on_open: config.restart_on_open,
        }
    }
}

impl Default for FsmLimits {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// 확장 코드 처리 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extension {
    /// 모르는 코드 → Code-Reject
    Unhandled,
    /// 처리함, 응답 없음
    Handled,
    /// 같은 id 로 응답
    Reply { code: Code, payload: Bytes },
}

/// 서브 프로토콜 콜백
pub trait FsmHandler: Send {
    /// Configure-Request 에 실을 내 옵션
    fn config_info_add(&mut self) -> Result<Bytes>;

    /// 상대 Configure-Request 판정
    fn config_info_req(&mut self, options: &[u8], mode: NakMode)
        -> std::result::Result<Verdict, NegotiationError>;

    /// Configure-Ack 검증 및 적용
    fn config_info_ack(&mut self, options: &[u8]) -> std::result::Result<(), NegotiationError>;

    /// Configure-Nak 처리, `give_up` 이면 해당 옵션 포기
    fn config_info_nak(
        &mut self,
        options: &[u8],
        give_up: bool,
    ) -> std::result::Result<(), NegotiationError>;

    /// Configure-Reject 처리
    fn config_info_rej(&mut self, options: &[u8]) -> std::result::Result<(), NegotiationError>;

    /// 협상 재시작 시 내 옵션 플래그 초기화
    fn config_info_reset(&mut self) {}

    fn up(&mut self, _out: &mut Outbox) {}

    fn down(&mut self, _out: &mut Outbox) {}

    fn starting(&mut self, _out: &mut Outbox) {}

    fn finished(&mut self, _out: &mut Outbox) {}

    /// 표준 코드 외 패킷 처리 (LCP: Echo, Discard, Protocol-Reject)
    fn proto_extension(
        &mut self,
        _state: State,
        _packet: &ControlPacket,
        _out: &mut Outbox,
    ) -> Extension {
        Extension::Unhandled
    }

    /// Configure-Ack 하나로 양방향 협상이 끝나는 프로토콜 (PAP)
    fn ack_completes_handshake(&self) -> bool {
        false
    }
}

/// 링크가 서브 프로토콜을 다루는 공통 인터페이스
pub trait SubProtocol: Send {
    fn protocol(&self) -> Protocol;

    fn kind(&self) -> ProtocolKind {
        self.protocol().kind()
    }

    fn state(&self) -> State;

    fn open(&mut self, out: &mut Outbox) -> Result<()>;

    fn close(&mut self, reason: &str, out: &mut Outbox);

    fn lower_up(&mut self, out: &mut Outbox) -> Result<()>;

    fn lower_down(&mut self, out: &mut Outbox);

    fn input(&mut self, packet: &ControlPacket, out: &mut Outbox) -> Result<()>;

    fn timeout(&mut self, generation: u64, out: &mut Outbox);

    /// LCP 가 협상한 상대 MRU 통지
    fn set_peer_mru(&mut self, mru: u16);
}

#[derive(Debug, Default, Clone, Copy)]
struct TimerSlot {
    armed: bool,
    generation: u64,
}

/// 서브 프로토콜 FSM 인스턴스
pub struct Fsm<H: FsmHandler> {
    protocol: Protocol,
    state: State,
    id_counter: u8,
    pending_request_id: u8,
    retransmits_left: u32,
    nack_loops: u32,
    recv_nack_loops: u32,
    ack_received: bool,
    terminate_reason: String,
    timer: TimerSlot,
    limits: FsmLimits,
    /// Code-Reject 길이 상한 (LCP 가 협상한 상대 MRU)
    peer_mru: u16,
    handler: H,
}

impl<H: FsmHandler> Fsm<H> {
    pub fn new(protocol: Protocol, limits: FsmLimits, handler: H) -> Self {
        Self {
            protocol,
            state: State::Initial,
            id_counter: 0,
            pending_request_id: 0,
            retransmits_left: 0,
            nack_loops: 0,
            recv_nack_loops: 0,
            ack_received: false,
            terminate_reason: String::new(),
            timer: TimerSlot::default(),
            limits,
            peer_mru: DEFAULT_MRU,
            handler,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn set_peer_mru(&mut self, mru: u16) {
        self.peer_mru = mru;
    }

    pub fn terminate_reason(&self) -> &str {
        &self.terminate_reason
    }

    pub fn retransmits_left(&self) -> u32 {
        self.retransmits_left
    }

    pub fn ack_received(&self) -> bool {
        self.ack_received
    }

    pub fn pending_request_id(&self) -> u8 {
        self.pending_request_id
    }

    pub fn is_timer_armed(&self) -> bool {
        self.timer.armed
    }

    /// 현재 타이머 세대 (세션이 만료 이벤트에 실어 보냄)
    pub fn timer_generation(&self) -> u64 {
        self.timer.generation
    }

    fn change_state(&mut self, next: State) {
        if self.state != next {
            debug!("{}: {:?} -> {:?}", self.protocol, self.state, next);
        }
        self.state = next;
    }

    fn next_id(&mut self) -> u8 {
        self.id_counter = self.id_counter.wrapping_add(1);
        self.id_counter
    }

    fn send(&self, out: &mut Outbox, code: Code, id: u8, payload: Bytes) {
        out.send(self.protocol, ControlPacket::new(code, id, payload));
    }

    fn arm_timer(&mut self, out: &mut Outbox) {
        self.timer.generation += 1;
        self.timer.armed = true;
        out.timers.push(TimerCommand::Arm {
            protocol: self.protocol,
            kind: TimerKind::Restart,
            generation: self.timer.generation,
            after: self.limits.restart_timeout,
        });
    }

    fn cancel_timer(&mut self, out: &mut Outbox) {
        if self.timer.armed {
            self.timer.armed = false;
            out.timers.push(TimerCommand::Cancel {
                protocol: self.protocol,
                kind: TimerKind::Restart,
            });
        }
    }

    fn set_terminate_reason(&mut self, reason: &str) {
        let mut end = reason.len().min(MAX_TERMINATE_REASON_LEN);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        self.terminate_reason = reason[..end].to_string();
    }

    fn this_layer_up(&mut self, out: &mut Outbox) {
        self.handler.up(out);
        out.events.push_back(LayerEvent::Up(self.protocol));
    }

    fn this_layer_down(&mut self, out: &mut Outbox) {
        self.handler.down(out);
        out.events.push_back(LayerEvent::Down(self.protocol));
    }

    fn this_layer_started(&mut self, out: &mut Outbox) {
        self.handler.starting(out);
        out.events.push_back(LayerEvent::Starting(self.protocol));
    }

    fn this_layer_finished(&mut self, out: &mut Outbox) {
        self.handler.finished(out);
        out.events.push_back(LayerEvent::Finished(self.protocol));
    }

    /// scr: 새 id 로 Configure-Request 전송, 타이머 시작
    fn send_config_req(&mut self, out: &mut Outbox) -> Result<()> {
        let options = self.handler.config_info_add()?;
        if options.len() + HEADER_SIZE > u16::MAX as usize {
            return Err(crate::Error::BufferOverflow {
                max_size: u16::MAX as usize,
            });
        }

        self.ack_received = false;
        let id = self.next_id();
        self.pending_request_id = id;
        self.send(out, Code::ConfigureRequest, id, options);
        self.arm_timer(out);
        Ok(())
    }

    /// irc + 옵션 초기화 + scr
    fn begin_negotiation(&mut self, out: &mut Outbox) -> Result<()> {
        self.handler.config_info_reset();
        self.nack_loops = 0;
        self.recv_nack_loops = 0;
        self.send_config_req(out)?;
        self.retransmits_left = self.limits.max_configure;
        Ok(())
    }

    fn send_terminate_req(&mut self, out: &mut Outbox) {
        let id = self.next_id();
        let reason = Bytes::copy_from_slice(self.terminate_reason.as_bytes());
        self.send(out, Code::TerminateRequest, id, reason);
    }

    fn send_terminate_ack(&self, out: &mut Outbox, id: u8) {
        self.send(out, Code::TerminateAck, id, Bytes::new());
    }

    /// irc + str, 재전송 예산이 0 이면 즉시 종료
    fn terminate(&mut self, next: State, out: &mut Outbox) {
        self.retransmits_left = self.limits.max_terminate;
        self.send_terminate_req(out);

        if self.limits.max_terminate == 0 {
            self.cancel_timer(out);
            let done = if next == State::Closing {
                State::Closed
            } else {
                State::Stopped
            };
            self.change_state(done);
            self.this_layer_finished(out);
        } else {
            self.arm_timer(out);
            self.change_state(next);
        }
    }

    fn send_code_reject(&mut self, packet: &ControlPacket, out: &mut Outbox) -> Result<()> {
        let mut rejected = packet.to_bytes()?;
        rejected.truncate((self.peer_mru as usize).saturating_sub(HEADER_SIZE));
        let id = self.next_id();
        self.send(out, Code::CodeReject, id, rejected);
        Ok(())
    }

    /// 새 id 로 임의 코드 송신 (Echo-Request, Protocol-Reject)
    pub fn send_extension(&mut self, code: Code, payload: Bytes, out: &mut Outbox) -> u8 {
        let id = self.next_id();
        self.send(out, code, id, payload);
        id
    }

    pub fn open(&mut self, out: &mut Outbox) -> Result<()> {
        match self.state {
            State::Initial => {
                self.change_state(State::Starting);
                self.this_layer_started(out);
            }
            State::Starting => {}
            State::Closed => {
                self.begin_negotiation(out)?;
                self.change_state(State::RequestSent);
            }
            State::Closing | State::Stopping => {
                self.change_state(State::Stopping);
            }
            State::Stopped
            | State::RequestSent
            | State::AckReceived
            | State::AckSent
            | State::Opened => {
                if self.limits.restart_on_open {
                    debug!("{}: open 재시작 (down/up)", self.protocol);
                    self.lower_down(out);
                    self.lower_up(out)?;
                }
            }
        }
        Ok(())
    }

    pub fn close(&mut self, reason: &str, out: &mut Outbox) {
        match self.state {
            State::Initial | State::Closed | State::Closing => {}
            State::Starting => {
                self.set_terminate_reason(reason);
                self.change_state(State::Initial);
                self.this_layer_finished(out);
            }
            State::Stopped => {
                self.change_state(State::Closed);
            }
            State::Stopping => {
                self.change_state(State::Closing);
            }
            State::RequestSent | State::AckReceived | State::AckSent => {
                self.set_terminate_reason(reason);
                self.terminate(State::Closing, out);
            }
            State::Opened => {
                self.set_terminate_reason(reason);
                self.this_layer_down(out);
                self.terminate(State::Closing, out);
            }
        }
    }

    pub fn lower_up(&mut self, out: &mut Outbox) -> Result<()> {
        match self.state {
            State::Initial => self.change_state(State::Closed),
            State::Starting => {
                self.begin_negotiation(out)?;
                self.change_state(State::RequestSent);
            }
            other => debug!("{}: {:?} 에서 lower_up 무시", self.protocol, other),
        }
        Ok(())
    }

    pub fn lower_down(&mut self, out: &mut Outbox) {
        let next = match self.state {
            State::Closed | State::Closing => State::Initial,
            State::Stopped => {
                self.this_layer_started(out);
                State::Starting
            }
            State::Stopping | State::RequestSent | State::AckReceived | State::AckSent => {
                State::Starting
            }
            State::Opened => {
                self.this_layer_down(out);
                State::Starting
            }
            State::Initial | State::Starting => {
                debug!("{}: {:?} 에서 lower_down 무시", self.protocol, self.state);
                return;
            }
        };
        self.cancel_timer(out);
        self.change_state(next);
    }

    /// 수신 패킷 처리
    pub fn input(&mut self, packet: &ControlPacket, out: &mut Outbox) -> Result<()> {
        if matches!(self.state, State::Initial | State::Starting) {
            debug!(
                "{}: {:?} 상태에서 패킷 폐기 (code {})",
                self.protocol, self.state, packet.code
            );
            return Ok(());
        }

        match packet.kind() {
            Some(Code::ConfigureRequest) => self.recv_configure_req(packet, out),
            Some(Code::ConfigureAck) => self.recv_configure_ack(packet, out),
            Some(Code::ConfigureNak) => self.recv_configure_nak_rej(packet, false, out),
            Some(Code::ConfigureReject) => self.recv_configure_nak_rej(packet, true, out),
            Some(Code::TerminateRequest) => self.recv_terminate_req(packet, out),
            Some(Code::TerminateAck) => self.recv_terminate_ack(out),
            Some(Code::CodeReject) => {
                self.recv_code_reject(packet);
                Ok(())
            }
            _ => self.recv_extension(packet, out),
        }
    }

    fn recv_configure_req(&mut self, packet: &ControlPacket, out: &mut Outbox) -> Result<()> {
        match self.state {
            State::Closed => {
                self.send_terminate_ack(out, packet.id);
                return Ok(());
            }
            State::Closing | State::Stopping => {
                debug!("{}: 종료 중 Configure-Request 무시", self.protocol);
                return Ok(());
            }
            _ => {}
        }

        let mode = if self.nack_loops >= self.limits.max_nack_loops {
            NakMode::Reject
        } else {
            NakMode::Counter
        };

        let verdict = match self.handler.config_info_req(&packet.payload, mode) {
            Ok(verdict) => verdict,
            Err(NegotiationError::Semantic(reason)) => {
                // 검증 실패도 Nak 루프 예산을 소모
                self.nack_loops += 1;
                if self.nack_loops > self.limits.max_nack_loops {
                    warn!(
                        "{}: 옵션 검증 실패 {}회 반복 ({}), 종료",
                        self.protocol, self.nack_loops, reason
                    );
                    self.close(&format!("협상 실패: {}", reason), out);
                    return Ok(());
                }
                if packet.payload.is_empty() {
                    debug!("{}: 빈 Configure-Request 검증 실패 ({}), 응답 없음", self.protocol, reason);
                    return Ok(());
                }
                debug!("{}: 옵션 검증 실패 ({}), 전체 reject", self.protocol, reason);
                Verdict::Reject(packet.payload.clone())
            }
            Err(e) => {
                debug!("{}: Configure-Request 폐기: {}", self.protocol, e);
                return Ok(());
            }
        };

        if self.state == State::Opened {
            self.this_layer_down(out);
        }
        if matches!(self.state, State::Opened | State::Stopped) {
            self.begin_negotiation(out)?;
        }

        match verdict {
            Verdict::Ack(_) => self.nack_loops = 0,
            Verdict::Nak(_) => self.nack_loops += 1,
            Verdict::Reject(_) => {}
        }

        let acked = verdict.is_ack();
        self.send(out, verdict.code(), packet.id, verdict.payload().clone());

        match (acked, self.state) {
            (true, State::AckReceived) => {
                self.cancel_timer(out);
                self.change_state(State::Opened);
                self.this_layer_up(out);
            }
            (true, _) => self.change_state(State::AckSent),
            (false, State::AckReceived) => {}
            (false, _) => self.change_state(State::RequestSent),
        }
        Ok(())
    }

    fn recv_configure_ack(&mut self, packet: &ControlPacket, out: &mut Outbox) -> Result<()> {
        if packet.id != self.pending_request_id || self.ack_received {
            debug!(
                "{}: 범위 밖 Configure-Ack 폐기 (id {}, 대기 {})",
                self.protocol, packet.id, self.pending_request_id
            );
            return Ok(());
        }

        match self.state {
            State::Closed | State::Stopped => {
                self.send_terminate_ack(out, packet.id);
                return Ok(());
            }
            State::Closing | State::Stopping => return Ok(()),
            _ => {}
        }

        if let Err(e) = self.handler.config_info_ack(&packet.payload) {
            debug!("{}: Configure-Ack 폐기: {}", self.protocol, e);
            return Ok(());
        }

        self.ack_received = true;
        self.recv_nack_loops = 0;

        match self.state {
            State::RequestSent => {
                self.retransmits_left = self.limits.max_configure;
                if self.handler.ack_completes_handshake() {
                    // Ack 만으로 상대 쪽 절반도 끝난 것으로 간주
                    self.change_state(State::AckSent);
                    self.cancel_timer(out);
                    self.change_state(State::Opened);
                    self.this_layer_up(out);
                } else {
                    self.change_state(State::AckReceived);
                }
            }
            State::AckSent => {
                self.retransmits_left = self.limits.max_configure;
                self.cancel_timer(out);
                self.change_state(State::Opened);
                self.this_layer_up(out);
            }
            // AckReceived, Opened 는 ack_received 가 이미 true
            _ => {}
        }
        Ok(())
    }

    fn recv_configure_nak_rej(
        &mut self,
        packet: &ControlPacket,
        rejected: bool,
        out: &mut Outbox,
    ) -> Result<()> {
        if packet.id != self.pending_request_id || self.ack_received {
            debug!(
                "{}: 범위 밖 Configure-{} 폐기 (id {}, 대기 {})",
                self.protocol,
                if rejected { "Reject" } else { "Nak" },
                packet.id,
                self.pending_request_id
            );
            return Ok(());
        }

        match self.state {
            State::Closed | State::Stopped => {
                self.send_terminate_ack(out, packet.id);
                return Ok(());
            }
            State::Closing | State::Stopping => return Ok(()),
            _ => {}
        }

        let give_up = !rejected && self.recv_nack_loops + 1 >= self.limits.max_nack_loops;

        let result = if rejected {
            self.handler.config_info_rej(&packet.payload)
        } else {
            self.handler.config_info_nak(&packet.payload, give_up)
        };

        match result {
            Ok(()) => {}
            Err(NegotiationError::Refused(reason)) => {
                warn!("{}: 상대가 요청 거부: {}", self.protocol, reason);
                self.cancel_timer(out);
                out.events
                    .push_back(LayerEvent::Refused(self.protocol, reason));
                self.change_state(State::Stopped);
                self.this_layer_finished(out);
                return Ok(());
            }
            Err(e) => {
                debug!("{}: Nak/Reject 폐기: {}", self.protocol, e);
                return Ok(());
            }
        }

        if rejected {
            self.recv_nack_loops = 0;
        } else if give_up {
            warn!(
                "{}: 연속 Nak {}회, 해당 옵션 포기",
                self.protocol, self.limits.max_nack_loops
            );
            self.recv_nack_loops = 0;
        } else {
            self.recv_nack_loops += 1;
        }

        match self.state {
            State::RequestSent | State::AckSent => {
                self.send_config_req(out)?;
                self.retransmits_left = self.limits.max_configure;
            }
            // AckReceived, Opened 는 ack_received 가 이미 true
            _ => {}
        }
        Ok(())
    }

    fn recv_terminate_req(&mut self, packet: &ControlPacket, out: &mut Outbox) -> Result<()> {
        debug!(
            "{}: Terminate-Request 수신: {}",
            self.protocol,
            String::from_utf8_lossy(&packet.payload)
        );

        match self.state {
            State::Closed | State::Stopped | State::Closing | State::Stopping => {
                self.send_terminate_ack(out, packet.id);
            }
            State::RequestSent | State::AckReceived | State::AckSent => {
                self.send_terminate_ack(out, packet.id);
                self.change_state(State::RequestSent);
            }
            State::Opened => {
                self.this_layer_down(out);
                // zrc: 재전송 없이 타이머 한 번만 대기
                self.retransmits_left = 0;
                self.arm_timer(out);
                self.send_terminate_ack(out, packet.id);
                self.change_state(State::Stopping);
            }
            State::Initial | State::Starting => {}
        }
        Ok(())
    }

    fn recv_terminate_ack(&mut self, out: &mut Outbox) -> Result<()> {
        match self.state {
            State::Closing => {
                self.cancel_timer(out);
                self.change_state(State::Closed);
                self.this_layer_finished(out);
            }
            State::Stopping => {
                self.cancel_timer(out);
                self.change_state(State::Stopped);
                self.this_layer_finished(out);
            }
            State::AckReceived => self.change_state(State::RequestSent),
            State::Opened => {
                self.this_layer_down(out);
                self.send_config_req(out)?;
                self.retransmits_left = self.limits.max_configure;
                self.change_state(State::RequestSent);
            }
            _ => {}
        }
        Ok(())
    }

    fn recv_code_reject(&mut self, packet: &ControlPacket) {
        let rejected = packet.payload.first().copied();

        match (rejected.and_then(Code::from_u8), self.state) {
            (Some(Code::ConfigureRequest), State::AckReceived) => {
                debug!("{}: Configure-Request 가 Code-Reject 됨", self.protocol);
                self.change_state(State::RequestSent);
            }
            _ => debug!("{}: Code-Reject 수신: code {:?}", self.protocol, rejected),
        }
    }

    fn recv_extension(&mut self, packet: &ControlPacket, out: &mut Outbox) -> Result<()> {
        match self.handler.proto_extension(self.state, packet, out) {
            Extension::Handled => Ok(()),
            Extension::Reply { code, payload } => {
                self.send(out, code, packet.id, payload);
                Ok(())
            }
            Extension::Unhandled => {
                debug!("{}: 모르는 코드 {} Code-Reject", self.protocol, packet.code);
                self.send_code_reject(packet, out)
            }
        }
    }

    /// 재전송 타이머 만료
    pub fn timeout(&mut self, generation: u64, out: &mut Outbox) {
        if !self.timer.armed || generation != self.timer.generation {
            debug!("{}: 지난 타이머 무시 (gen {})", self.protocol, generation);
            return;
        }
        self.timer.armed = false;

        match self.state {
            State::Closing | State::Stopping => {
                if self.retransmits_left > 0 {
                    self.retransmits_left -= 1;
                    self.send_terminate_req(out);
                    self.arm_timer(out);
                } else {
                    let next = if self.state == State::Closing {
                        State::Closed
                    } else {
                        State::Stopped
                    };
                    self.change_state(next);
                    self.this_layer_finished(out);
                }
            }
            State::RequestSent | State::AckReceived | State::AckSent => {
                if self.retransmits_left > 0 {
                    self.retransmits_left -= 1;
                    if let Err(e) = self.send_config_req(out) {
                        warn!("{}: Configure-Request 재전송 실패: {}", self.protocol, e);
                    }
                    if self.state == State::AckReceived {
                        self.change_state(State::RequestSent);
                    }
                } else {
                    warn!("{}: Configure-Request 재전송 소진", self.protocol);
                    self.change_state(State::Stopped);
                    self.this_layer_finished(out);
                }
            }
            other => {
                error!(
                    "{}: {:?} 상태에서 타이머 만료, Stopped 로 강제 전환",
                    self.protocol, other
                );
                self.change_state(State::Stopped);
            }
        }
    }
}

impl<H: FsmHandler> SubProtocol for Fsm<H> {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn state(&self) -> State {
        self.state
    }

    fn open(&mut self, out: &mut Outbox) -> Result<()> {
        Fsm::open(self, out)
    }

    fn close(&mut self, reason: &str, out: &mut Outbox) {
        Fsm::close(self, reason, out)
    }

    fn lower_up(&mut self, out: &mut Outbox) -> Result<()> {
        Fsm::lower_up(self, out)
    }

    fn lower_down(&mut self, out: &mut Outbox) {
        Fsm::lower_down(self, out)
    }

    fn input(&mut self, packet: &ControlPacket, out: &mut Outbox) -> Result<()> {
        Fsm::input(self, packet, out)
    }

    fn timeout(&mut self, generation: u64, out: &mut Outbox) {
        Fsm::timeout(self, generation, out)
    }

    fn set_peer_mru(&mut self, mru: u16) {
        Fsm::set_peer_mru(self, mru)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 스크립트 핸들러: 판정 큐와 콜백 카운터
    #[derive(Default)]
    struct Script {
        verdicts: VecDeque<Verdict>,
        ups: u32,
        downs: u32,
        starts: u32,
        finishes: u32,
        nak_modes: Vec<NakMode>,
        give_ups: Vec<bool>,
        resets: u32,
        one_way: bool,
    }

    impl FsmHandler for Script {
        fn config_info_add(&mut self) -> Result<Bytes> {
            Ok(Bytes::from_static(&[0x01, 0x04, 0x05, 0xdc]))
        }

        fn config_info_req(
            &mut self,
            options: &[u8],
            mode: NakMode,
        ) -> std::result::Result<Verdict, NegotiationError> {
            self.nak_modes.push(mode);
            Ok(self
                .verdicts
                .pop_front()
                .unwrap_or_else(|| Verdict::Ack(Bytes::copy_from_slice(options))))
        }

        fn config_info_ack(&mut self, _options: &[u8]) -> std::result::Result<(), NegotiationError> {
            Ok(())
        }

        fn config_info_nak(
            &mut self,
            _options: &[u8],
            give_up: bool,
        ) -> std::result::Result<(), NegotiationError> {
            self.give_ups.push(give_up);
            Ok(())
        }

        fn config_info_rej(&mut self, _options: &[u8]) -> std::result::Result<(), NegotiationError> {
            Ok(())
        }

        fn config_info_reset(&mut self) {
            self.resets += 1;
        }

        fn up(&mut self, _out: &mut Outbox) {
            self.ups += 1;
        }

        fn down(&mut self, _out: &mut Outbox) {
            self.downs += 1;
        }

        fn starting(&mut self, _out: &mut Outbox) {
            self.starts += 1;
        }

        fn finished(&mut self, _out: &mut Outbox) {
            self.finishes += 1;
        }

        fn ack_completes_handshake(&self) -> bool {
            self.one_way
        }
    }

    fn limits(max_configure: u32, max_terminate: u32) -> FsmLimits {
        FsmLimits {
            restart_timeout: Duration::from_millis(100),
            max_configure,
            max_terminate,
            max_nack_loops: 3,
            restart_on_open: false,
        }
    }

    fn closed_fsm(limits: FsmLimits) -> (Fsm<Script>, Outbox) {
        let mut fsm = Fsm::new(Protocol::Lcp, limits, Script::default());
        let mut out = Outbox::new();
        fsm.lower_up(&mut out).unwrap();
        assert_eq!(fsm.state(), State::Closed);
        (fsm, out)
    }

    fn sent(out: &mut Outbox, code: Code) -> Vec<ControlPacket> {
        out.take_frames()
            .into_iter()
            .map(|f| f.packet)
            .filter(|p| p.code == code as u8)
            .collect()
    }

    fn packet(code: Code, id: u8, payload: &'static [u8]) -> ControlPacket {
        ControlPacket::new(code, id, Bytes::from_static(payload))
    }

    const PEER_REQ: &[u8] = &[0x01, 0x04, 0x05, 0xdc];

    fn opened_fsm() -> (Fsm<Script>, Outbox) {
        let (mut fsm, mut out) = closed_fsm(limits(10, 2));
        fsm.open(&mut out).unwrap();
        let id = fsm.pending_request_id();
        fsm.input(&packet(Code::ConfigureAck, id, PEER_REQ), &mut out)
            .unwrap();
        fsm.input(&packet(Code::ConfigureRequest, 40, PEER_REQ), &mut out)
            .unwrap();
        assert_eq!(fsm.state(), State::Opened);
        out.take_frames();
        out.events.clear();
        (fsm, out)
    }

    #[test]
    fn test_open_from_closed_sends_request() {
        let (mut fsm, mut out) = closed_fsm(limits(10, 2));
        fsm.open(&mut out).unwrap();

        assert_eq!(fsm.state(), State::RequestSent);
        let requests = sent(&mut out, Code::ConfigureRequest);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].id, fsm.pending_request_id());
        assert!(fsm.is_timer_armed());
        assert!(!fsm.ack_received());
    }

    #[test]
    fn test_ack_then_request_opens_once() {
        let (mut fsm, mut out) = closed_fsm(limits(10, 2));
        fsm.open(&mut out).unwrap();
        let id = fsm.pending_request_id();

        fsm.input(&packet(Code::ConfigureAck, id, PEER_REQ), &mut out)
            .unwrap();
        assert_eq!(fsm.state(), State::AckReceived);
        assert!(fsm.ack_received());

        fsm.input(&packet(Code::ConfigureRequest, 9, PEER_REQ), &mut out)
            .unwrap();
        assert_eq!(fsm.state(), State::Opened);
        assert_eq!(fsm.handler().ups, 1);
        assert!(!fsm.is_timer_armed());

        let acks = sent(&mut out, Code::ConfigureAck);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].id, 9);
        assert_eq!(acks[0].payload.as_ref(), PEER_REQ);
        assert_eq!(out.events.back(), Some(&LayerEvent::Up(Protocol::Lcp)));
    }

    #[test]
    fn test_request_then_ack_opens() {
        let (mut fsm, mut out) = closed_fsm(limits(10, 2));
        fsm.open(&mut out).unwrap();

        fsm.input(&packet(Code::ConfigureRequest, 3, PEER_REQ), &mut out)
            .unwrap();
        assert_eq!(fsm.state(), State::AckSent);

        let id = fsm.pending_request_id();
        fsm.input(&packet(Code::ConfigureAck, id, PEER_REQ), &mut out)
            .unwrap();
        assert_eq!(fsm.state(), State::Opened);
        assert_eq!(fsm.handler().ups, 1);
    }

    #[test]
    fn test_mismatched_ack_dropped() {
        let (mut fsm, mut out) = closed_fsm(limits(10, 2));
        fsm.open(&mut out).unwrap();
        let id = fsm.pending_request_id();
        out.take_frames();

        fsm.input(&packet(Code::ConfigureAck, id.wrapping_add(1), PEER_REQ), &mut out)
            .unwrap();
        fsm.input(&packet(Code::ConfigureNak, id.wrapping_add(5), PEER_REQ), &mut out)
            .unwrap();
        fsm.input(&packet(Code::ConfigureReject, id.wrapping_sub(1), PEER_REQ), &mut out)
            .unwrap();

        assert_eq!(fsm.state(), State::RequestSent);
        assert!(!fsm.ack_received());
        assert!(out.frames.is_empty());

        // 같은 id 두 번째 Ack 도 폐기
        fsm.input(&packet(Code::ConfigureAck, id, PEER_REQ), &mut out)
            .unwrap();
        assert_eq!(fsm.state(), State::AckReceived);
        fsm.input(&packet(Code::ConfigureNak, id, PEER_REQ), &mut out)
            .unwrap();
        assert_eq!(fsm.state(), State::AckReceived);
        assert!(out.frames.is_empty());
    }

    #[test]
    fn test_terminate_request_while_opened() {
        let (mut fsm, mut out) = opened_fsm();

        fsm.input(&packet(Code::TerminateRequest, 77, b"bye"), &mut out)
            .unwrap();

        let acks = sent(&mut out, Code::TerminateAck);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].id, 77);
        assert_eq!(fsm.handler().downs, 1);
        assert_eq!(fsm.state(), State::Stopping);
        assert!(fsm.is_timer_armed());

        // zrc: 타이머 한 번 만료되면 Stopped
        let generation = fsm.timer_generation();
        fsm.timeout(generation, &mut out);
        assert_eq!(fsm.state(), State::Stopped);
        assert_eq!(fsm.handler().finishes, 1);
        assert!(out.frames.is_empty());
    }

    #[test]
    fn test_retransmit_exhaustion() {
        let (mut fsm, mut out) = closed_fsm(limits(2, 2));
        fsm.open(&mut out).unwrap();

        for _ in 0..3 {
            let generation = fsm.timer_generation();
            fsm.timeout(generation, &mut out);
        }

        assert_eq!(sent(&mut out, Code::ConfigureRequest).len(), 3);
        assert_eq!(fsm.state(), State::Stopped);
        assert_eq!(fsm.handler().finishes, 1);
        assert!(!fsm.is_timer_armed());

        // 더 이상의 만료는 무시
        fsm.timeout(fsm.timer_generation(), &mut out);
        assert_eq!(fsm.handler().finishes, 1);
    }

    #[test]
    fn test_retransmit_uses_fresh_id() {
        let (mut fsm, mut out) = closed_fsm(limits(2, 2));
        fsm.open(&mut out).unwrap();
        let first = fsm.pending_request_id();
        fsm.timeout(fsm.timer_generation(), &mut out);
        let second = fsm.pending_request_id();
        assert_ne!(first, second);

        // 이전 요청에 대한 Ack 는 폐기
        fsm.input(&packet(Code::ConfigureAck, first, PEER_REQ), &mut out)
            .unwrap();
        assert_eq!(fsm.state(), State::RequestSent);
        assert_eq!(fsm.retransmits_left(), 1);
    }

    #[test]
    fn test_stale_timer_ignored() {
        let (mut fsm, mut out) = closed_fsm(limits(2, 2));
        fsm.open(&mut out).unwrap();
        let stale = fsm.timer_generation();
        fsm.timeout(stale, &mut out);
        out.take_frames();

        fsm.timeout(stale, &mut out);
        assert!(out.frames.is_empty());
        assert_eq!(fsm.retransmits_left(), 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut fsm, mut out) = opened_fsm();

        fsm.close("admin", &mut out);
        fsm.close("admin", &mut out);

        let requests = sent(&mut out, Code::TerminateRequest);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].payload.as_ref(), b"admin");
        assert_eq!(fsm.state(), State::Closing);
        assert_eq!(fsm.handler().downs, 1);

        fsm.input(&packet(Code::TerminateAck, requests[0].id, &[]), &mut out)
            .unwrap();
        assert_eq!(fsm.state(), State::Closed);
        assert_eq!(fsm.handler().finishes, 1);
    }

    #[test]
    fn test_close_retransmits_terminate() {
        let (mut fsm, mut out) = opened_fsm();
        fsm.close("bye", &mut out);

        for _ in 0..3 {
            fsm.timeout(fsm.timer_generation(), &mut out);
        }
        // 최초 1 + 재전송 2
        assert_eq!(sent(&mut out, Code::TerminateRequest).len(), 3);
        assert_eq!(fsm.state(), State::Closed);
        assert_eq!(fsm.handler().finishes, 1);
    }

    #[test]
    fn test_close_without_terminate_budget() {
        let (mut fsm, mut out) = closed_fsm(limits(10, 0));
        fsm.open(&mut out).unwrap();
        out.take_frames();

        fsm.close("now", &mut out);
        assert_eq!(fsm.state(), State::Closed);
        assert_eq!(fsm.handler().finishes, 1);
        assert!(!fsm.is_timer_armed());
        assert_eq!(sent(&mut out, Code::TerminateRequest).len(), 1);
    }

    #[test]
    fn test_terminate_reason_truncated() {
        let (mut fsm, mut out) = opened_fsm();
        let reason = "가".repeat(20);
        fsm.close(&reason, &mut out);
        assert!(fsm.terminate_reason().len() <= MAX_TERMINATE_REASON_LEN);
        assert_eq!(fsm.terminate_reason(), "가".repeat(10));
    }

    #[test]
    fn test_invalid_events_ignored() {
        let (mut fsm, mut out) = closed_fsm(limits(10, 2));
        fsm.open(&mut out).unwrap();
        out.take_frames();
        out.timers.clear();

        fsm.lower_up(&mut out).unwrap();
        assert_eq!(fsm.state(), State::RequestSent);
        assert!(out.frames.is_empty());
        assert!(out.timers.is_empty());

        // Initial 에서 lower_down, 패킷 수신
        let mut fsm = Fsm::new(Protocol::Ipcp, limits(10, 2), Script::default());
        fsm.lower_down(&mut out);
        fsm.input(&packet(Code::ConfigureRequest, 1, PEER_REQ), &mut out)
            .unwrap();
        fsm.input(&packet(Code::TerminateRequest, 2, &[]), &mut out)
            .unwrap();
        assert_eq!(fsm.state(), State::Initial);
        assert!(out.frames.is_empty());
    }

    #[test]
    fn test_request_in_closed_gets_terminate_ack() {
        let (mut fsm, mut out) = closed_fsm(limits(10, 2));
        fsm.input(&packet(Code::ConfigureRequest, 5, PEER_REQ), &mut out)
            .unwrap();
        let acks = sent(&mut out, Code::TerminateAck);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].id, 5);
        assert_eq!(fsm.state(), State::Closed);
    }

    #[test]
    fn test_passive_open_from_stopped() {
        let (mut fsm, mut out) = closed_fsm(limits(0, 2));
        fsm.open(&mut out).unwrap();
        fsm.timeout(fsm.timer_generation(), &mut out);
        assert_eq!(fsm.state(), State::Stopped);
        out.take_frames();

        fsm.input(&packet(Code::ConfigureRequest, 8, PEER_REQ), &mut out)
            .unwrap();
        let frames: Vec<_> = out.take_frames().into_iter().map(|f| f.packet.code).collect();
        assert_eq!(
            frames,
            vec![Code::ConfigureRequest as u8, Code::ConfigureAck as u8]
        );
        assert_eq!(fsm.state(), State::AckSent);
    }

    #[test]
    fn test_outgoing_nak_escalates_to_reject() {
        let (mut fsm, mut out) = closed_fsm(limits(10, 2));
        fsm.open(&mut out).unwrap();

        for _ in 0..4 {
            fsm.handler_mut()
                .verdicts
                .push_back(Verdict::Nak(Bytes::from_static(&[0x01, 0x04, 0x05, 0xdc])));
            fsm.input(&packet(Code::ConfigureRequest, 1, &[0x01, 0x04, 0x00, 0x10]), &mut out)
                .unwrap();
        }

        assert_eq!(
            fsm.handler().nak_modes,
            vec![
                NakMode::Counter,
                NakMode::Counter,
                NakMode::Counter,
                NakMode::Reject
            ]
        );
        assert_eq!(fsm.state(), State::RequestSent);
    }

    /// 모든 Configure-Request 를 의미상 틀렸다고 판정
    struct Strict;
    impl FsmHandler for Strict {
        fn config_info_add(&mut self) -> Result<Bytes> {
            Ok(Bytes::new())
        }
        fn config_info_req(
            &mut self,
            _options: &[u8],
            _mode: NakMode,
        ) -> std::result::Result<Verdict, NegotiationError> {
            Err(NegotiationError::Semantic("주소 옵션 없음"))
        }
        fn config_info_ack(&mut self, _o: &[u8]) -> std::result::Result<(), NegotiationError> {
            Ok(())
        }
        fn config_info_nak(
            &mut self,
            _o: &[u8],
            _g: bool,
        ) -> std::result::Result<(), NegotiationError> {
            Ok(())
        }
        fn config_info_rej(&mut self, _o: &[u8]) -> std::result::Result<(), NegotiationError> {
            Ok(())
        }
    }

    #[test]
    fn test_semantic_failure_rejects_block() {
        let mut fsm = Fsm::new(Protocol::Ipcp, limits(10, 2), Strict);
        let mut out = Outbox::new();
        fsm.lower_up(&mut out).unwrap();
        fsm.open(&mut out).unwrap();
        out.take_frames();

        fsm.input(&packet(Code::ConfigureRequest, 4, &[0x81, 0x06, 0, 0, 0, 0]), &mut out)
            .unwrap();
        let rejects = sent(&mut out, Code::ConfigureReject);
        assert_eq!(rejects.len(), 1);
        assert_eq!(rejects[0].payload.as_ref(), &[0x81, 0x06, 0, 0, 0, 0]);
    }

    #[test]
    fn test_repeated_semantic_failure_closes() {
        let mut fsm = Fsm::new(Protocol::Ipcp, limits(10, 2), Strict);
        let mut out = Outbox::new();
        fsm.lower_up(&mut out).unwrap();
        fsm.open(&mut out).unwrap();
        out.take_frames();

        // 빈 블록은 Reject 로 되돌려도 의미가 없으므로 응답하지 않음
        for id in 1..=3 {
            fsm.input(&packet(Code::ConfigureRequest, id, &[]), &mut out)
                .unwrap();
            assert!(out.take_frames().is_empty());
            assert_eq!(fsm.state(), State::RequestSent);
        }

        fsm.input(&packet(Code::ConfigureRequest, 4, &[]), &mut out)
            .unwrap();
        assert_eq!(sent(&mut out, Code::TerminateRequest).len(), 1);
        assert_eq!(fsm.state(), State::Closing);
        assert!(fsm.terminate_reason().starts_with("협상 실패"));
    }

    #[test]
    fn test_received_nak_loop_gives_up() {
        let (mut fsm, mut out) = closed_fsm(limits(10, 2));
        fsm.open(&mut out).unwrap();

        for _ in 0..3 {
            let id = fsm.pending_request_id();
            fsm.input(&packet(Code::ConfigureNak, id, PEER_REQ), &mut out)
                .unwrap();
        }

        assert_eq!(fsm.handler().give_ups, vec![false, false, true]);
        assert_eq!(sent(&mut out, Code::ConfigureRequest).len(), 4);
        assert_eq!(fsm.state(), State::RequestSent);
    }

    #[test]
    fn test_code_reject_of_request_in_ack_received() {
        let (mut fsm, mut out) = closed_fsm(limits(10, 2));
        fsm.open(&mut out).unwrap();
        let id = fsm.pending_request_id();
        fsm.input(&packet(Code::ConfigureAck, id, PEER_REQ), &mut out)
            .unwrap();

        fsm.input(&packet(Code::CodeReject, 1, &[0x01, 0x05, 0x00, 0x04]), &mut out)
            .unwrap();
        assert_eq!(fsm.state(), State::RequestSent);
    }

    #[test]
    fn test_unknown_code_is_code_rejected() {
        let (mut fsm, mut out) = opened_fsm();
        let unknown = ControlPacket {
            code: 0x30,
            id: 12,
            payload: Bytes::from_static(&[0xaa]),
        };
        fsm.input(&unknown, &mut out).unwrap();

        let rejects = sent(&mut out, Code::CodeReject);
        assert_eq!(rejects.len(), 1);
        assert_eq!(rejects[0].payload.as_ref(), &[0x30, 12, 0x00, 0x05, 0xaa]);
        assert_eq!(fsm.state(), State::Opened);
    }

    #[test]
    fn test_code_reject_fits_peer_mru() {
        let (mut fsm, mut out) = opened_fsm();
        fsm.set_peer_mru(64);
        let unknown = ControlPacket {
            code: 0x30,
            id: 13,
            payload: Bytes::from(vec![0xaa; 200]),
        };
        fsm.input(&unknown, &mut out).unwrap();

        let rejects = sent(&mut out, Code::CodeReject);
        assert_eq!(rejects.len(), 1);
        assert_eq!(rejects[0].payload.len(), 64 - HEADER_SIZE);
        assert_eq!(&rejects[0].payload[..4], &[0x30, 13, 0x00, 204]);
    }

    #[test]
    fn test_renegotiation_from_opened_calls_down() {
        let (mut fsm, mut out) = opened_fsm();
        fsm.input(&packet(Code::ConfigureRequest, 50, PEER_REQ), &mut out)
            .unwrap();

        assert_eq!(fsm.handler().downs, 1);
        let frames: Vec<_> = out.take_frames().into_iter().map(|f| f.packet.code).collect();
        assert_eq!(
            frames,
            vec![Code::ConfigureRequest as u8, Code::ConfigureAck as u8]
        );
        assert_eq!(fsm.state(), State::AckSent);
    }

    #[test]
    fn test_restart_on_open() {
        let (mut fsm, mut out) = opened_fsm();
        fsm.limits.restart_on_open = true;

        fsm.open(&mut out).unwrap();
        assert_eq!(fsm.handler().downs, 1);
        assert_eq!(fsm.state(), State::RequestSent);
        assert_eq!(sent(&mut out, Code::ConfigureRequest).len(), 1);
    }

    #[test]
    fn test_lower_down_and_up_cycle() {
        let mut fsm = Fsm::new(Protocol::Lcp, limits(10, 2), Script::default());
        let mut out = Outbox::new();

        fsm.open(&mut out).unwrap();
        assert_eq!(fsm.state(), State::Starting);
        assert_eq!(fsm.handler().starts, 1);

        fsm.lower_up(&mut out).unwrap();
        assert_eq!(fsm.state(), State::RequestSent);

        fsm.lower_down(&mut out);
        assert_eq!(fsm.state(), State::Starting);
        assert!(!fsm.is_timer_armed());
        assert!(out
            .timers
            .iter()
            .any(|t| matches!(t, TimerCommand::Cancel { .. })));

        fsm.close("down", &mut out);
        assert_eq!(fsm.state(), State::Initial);
        assert_eq!(fsm.handler().finishes, 1);
    }

    #[test]
    fn test_one_way_ack_opens() {
        let script = Script {
            one_way: true,
            ..Default::default()
        };
        let mut fsm = Fsm::new(Protocol::Pap, limits(10, 2), script);
        let mut out = Outbox::new();
        fsm.lower_up(&mut out).unwrap();
        fsm.open(&mut out).unwrap();

        let id = fsm.pending_request_id();
        fsm.input(&packet(Code::ConfigureAck, id, &[]), &mut out)
            .unwrap();
        assert_eq!(fsm.state(), State::Opened);
        assert_eq!(fsm.handler().ups, 1);
    }

    #[test]
    fn test_id_wraps() {
        let (mut fsm, mut out) = closed_fsm(limits(300, 2));
        fsm.open(&mut out).unwrap();
        for _ in 0..255 {
            fsm.timeout(fsm.timer_generation(), &mut out);
        }
        assert_eq!(fsm.pending_request_id(), 0);
        assert_eq!(fsm.state(), State::RequestSent);
    }
}
