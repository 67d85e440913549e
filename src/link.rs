//! Phase / 링크 오케스트레이터
//!
//! - LCP FSM 하나 + 등록 순서대로 보관하는 서브 프로토콜 목록
//! - FSM 계층 이벤트(up/down/finished)에 반응해 phase 를 진행
//! - Dead → Establish → Auth → Network → Running, Terminate 를 거쳐야만 Dead 로 복귀

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tracing::{debug, info, warn};

use crate::fsm::{
    Fsm, FsmLimits, LayerEvent, Outbox, State, SubProtocol, TimerCommand, TimerKind,
};
use crate::ipcp::Ipcp;
use crate::ipv6cp::Ipv6cp;
use crate::lcp::Lcp;
use crate::netif::NetworkInstaller;
use crate::packet::{Code, Frame, Protocol, ProtocolKind};
use crate::pap::Pap;
use crate::{Config, Error, Result, HEADER_SIZE};

/// 링크 phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum Phase {
    Dead,
    Establish,
    Auth,
    Network,
    Running,
    Terminate,
}

impl Phase {
    /// 허용된 전이인지
    pub fn can_advance_to(self, next: Phase) -> bool {
        use Phase::*;

        matches!(
            (self, next),
            (Dead, Establish)
                | (Establish, Auth)
                | (Auth, Network)
                | (Network, Running)
                | (Establish | Auth | Network | Running, Terminate)
                | (Terminate, Dead)
        )
    }

    /// 링크가 살아 있는 phase
    pub fn is_live(self) -> bool {
        !matches!(self, Phase::Dead | Phase::Terminate)
    }
}

/// 링크 외부로 알리는 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    PhaseChanged(Phase),
    NetworkUp(Protocol),
    NetworkDown(Protocol),
    PeerAuthenticated(String),
    EchoReply(u8),
    /// 링크가 Dead 로 돌아감 (종료 사유)
    Terminated(String),
}

/// Auth phase 진행 상황
#[derive(Debug, Default, Clone, Copy)]
struct AuthProgress {
    /// 내가 상대에게 인증 받아야 함
    local_pending: bool,

    /// 상대를 인증해야 함
    peer_pending: bool,
}

/// 상대의 Authenticate-Request 대기 타이머
#[derive(Debug, Clone, Copy)]
struct AuthWait {
    armed: bool,
    generation: u64,
    after: Duration,
}

fn is_negotiating(state: State) -> bool {
    matches!(
        state,
        State::RequestSent | State::AckReceived | State::AckSent | State::Opened
    )
}

/// 연결 하나의 링크 상태
pub struct Link {
    phase: Phase,
    lcp: Fsm<Lcp>,
    protocols: Vec<Box<dyn SubProtocol>>,
    outbox: Outbox,
    events: VecDeque<LinkEvent>,
    carrier: bool,
    auth: AuthProgress,
    networks_up: usize,
    peer_name: Option<String>,
    reason: String,
    auth_wait: AuthWait,
}

impl Link {
    /// 설정에 따라 서브 프로토콜 등록 (PAP, IPCP, IPV6CP 순)
    pub fn new(config: &Config, installer: Arc<dyn NetworkInstaller>) -> Self {
        let limits = FsmLimits::from(config);
        let mut link = Self {
            phase: Phase::Dead,
            lcp: Fsm::new(Protocol::Lcp, limits, Lcp::new(config)),
            protocols: Vec::new(),
            outbox: Outbox::new(),
            events: VecDeque::new(),
            carrier: false,
            auth: AuthProgress::default(),
            networks_up: 0,
            peer_name: None,
            reason: String::new(),
            // 상대 PAP 의 재전송 예산을 모두 쓸 만큼 기다림
            auth_wait: AuthWait {
                armed: false,
                generation: 0,
                after: config.restart_timeout() * config.max_configure.max(1),
            },
        };

        if config.auth.credentials.is_some() || config.auth.require_pap {
            link.register(Box::new(Pap::new(config)));
        }
        if let Some(ipv4) = &config.ipv4 {
            link.register(Box::new(Fsm::new(
                Protocol::Ipcp,
                limits,
                Ipcp::new(ipv4, installer.clone()),
            )));
        }
        if let Some(ipv6) = &config.ipv6 {
            link.register(Box::new(Fsm::new(
                Protocol::Ipv6cp,
                limits,
                Ipv6cp::new(ipv6, installer),
            )));
        }
        link
    }

    fn register(&mut self, protocol: Box<dyn SubProtocol>) {
        debug!("서브 프로토콜 등록: {}", protocol.protocol());
        self.protocols.push(protocol);
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn lcp(&self) -> &Fsm<Lcp> {
        &self.lcp
    }

    pub fn is_carrier_on(&self) -> bool {
        self.carrier
    }

    /// 프로토콜별 FSM 상태
    pub fn state_of(&self, protocol: Protocol) -> Option<State> {
        if protocol == Protocol::Lcp {
            return Some(self.lcp.state());
        }
        self.protocols
            .iter()
            .find(|p| p.protocol() == protocol)
            .map(|p| p.state())
    }

    /// 등록 순서대로 (프로토콜, 상태)
    pub fn protocol_states(&self) -> Vec<(Protocol, State)> {
        std::iter::once((Protocol::Lcp, self.lcp.state()))
            .chain(self.protocols.iter().map(|p| (p.protocol(), p.state())))
            .collect()
    }

    /// PAP 으로 인증된 상대 peer-id
    pub fn peer_name(&self) -> Option<&str> {
        self.peer_name.as_deref()
    }

    pub fn networks_up(&self) -> usize {
        self.networks_up
    }

    /// 마지막 종료 사유
    pub fn terminate_reason(&self) -> &str {
        &self.reason
    }

    pub fn take_frames(&mut self) -> Vec<Frame> {
        self.outbox.take_frames()
    }

    pub fn take_timers(&mut self) -> Vec<TimerCommand> {
        self.outbox.take_timers()
    }

    pub fn take_events(&mut self) -> Vec<LinkEvent> {
        self.events.drain(..).collect()
    }

    /// 링크 사용 허가 (LCP open)
    pub fn open(&mut self) -> Result<()> {
        self.lcp.open(&mut self.outbox)?;
        self.process_events()
    }

    /// 링크 종료
    pub fn close(&mut self, reason: &str) -> Result<()> {
        self.begin_close(reason)?;
        self.process_events()
    }

    pub fn carrier_on(&mut self) -> Result<()> {
        if self.carrier {
            return Ok(());
        }
        self.carrier = true;
        info!("carrier on");

        if self.phase == Phase::Dead {
            self.enter_phase(Phase::Establish)?;
        }
        self.lcp.lower_up(&mut self.outbox)?;
        self.process_events()
    }

    pub fn carrier_off(&mut self) -> Result<()> {
        if !self.carrier {
            return Ok(());
        }
        self.carrier = false;
        info!("carrier off");

        if self.phase.is_live() {
            self.reason = "carrier 끊김".to_string();
            self.enter_phase(Phase::Terminate)?;
        }
        self.lcp.lower_down(&mut self.outbox);
        self.process_events()?;

        if self.phase == Phase::Terminate {
            self.enter_phase(Phase::Dead)?;
            self.events
                .push_back(LinkEvent::Terminated(self.reason.clone()));
        }
        Ok(())
    }

    /// 수신 프레임 처리
    ///
    /// 잘못된 프레임은 조용히 폐기하고, 버퍼 오버플로우만 에러로 돌려준다.
    pub fn input(&mut self, bytes: &[u8]) -> Result<()> {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("프레임 폐기: {}", e);
                return Ok(());
            }
        };

        match frame.known_protocol().ok() {
            Some(Protocol::Lcp) => self.lcp.input(&frame.packet, &mut self.outbox)?,
            protocol => {
                if self.lcp.state() != State::Opened {
                    debug!("LCP 미개통, 0x{:04x} 프레임 폐기", frame.protocol);
                    return Ok(());
                }

                let phase = self.phase;
                let registered = protocol
                    .and_then(|p| self.protocols.iter_mut().find(|s| s.protocol() == p));
                match registered {
                    Some(sub) => {
                        if sub.kind() == ProtocolKind::Network
                            && !matches!(phase, Phase::Network | Phase::Running)
                        {
                            debug!("{:?} phase, {} 프레임 폐기", phase, sub.protocol());
                            return Ok(());
                        }
                        sub.input(&frame.packet, &mut self.outbox)?;
                    }
                    None => self.send_protocol_reject(frame.protocol, &bytes[2..])?,
                }
            }
        }
        self.process_events()
    }

    /// 재전송 타이머 만료
    pub fn timeout(&mut self, protocol: Protocol, generation: u64) -> Result<()> {
        if protocol == Protocol::Lcp {
            self.lcp.timeout(generation, &mut self.outbox);
        } else if let Some(sub) = self.protocols.iter_mut().find(|p| p.protocol() == protocol) {
            sub.timeout(generation, &mut self.outbox);
        }
        self.process_events()
    }

    /// 인증 대기 타이머 만료
    pub fn auth_timeout(&mut self, generation: u64) -> Result<()> {
        if !self.auth_wait.armed || generation != self.auth_wait.generation {
            debug!("지난 인증 대기 타이머 무시 (gen {})", generation);
            return Ok(());
        }
        self.auth_wait.armed = false;

        if self.phase == Phase::Auth && self.auth.peer_pending {
            warn!("상대 Authenticate-Request 없음, 링크 종료");
            self.begin_close("PAP 인증 시간 초과")?;
        }
        self.process_events()
    }

    /// Echo-Request 전송, 사용한 id 반환
    pub fn send_echo(&mut self, data: &[u8]) -> Result<u8> {
        if self.lcp.state() != State::Opened {
            return Err(Error::LinkNotOpened);
        }

        let max_size = self.lcp.handler().peer_mru() as usize;
        if HEADER_SIZE + 4 + data.len() > max_size {
            return Err(Error::BufferOverflow { max_size });
        }

        let payload = self.lcp.handler().echo_payload(data);
        Ok(self
            .lcp
            .send_extension(Code::EchoRequest, payload, &mut self.outbox))
    }

    /// phase 전이 (허용 표 검사 후 진입 동작 수행)
    pub fn advance_phase(&mut self, next: Phase) -> Result<()> {
        self.enter_phase(next)?;
        self.process_events()
    }

    fn send_protocol_reject(&mut self, protocol: u16, packet: &[u8]) -> Result<()> {
        warn!("지원하지 않는 프로토콜 0x{:04x}, Protocol-Reject", protocol);

        let limit = (self.lcp.handler().peer_mru() as usize).saturating_sub(HEADER_SIZE + 2);
        let mut payload = BytesMut::with_capacity(2 + packet.len().min(limit));
        payload.put_u16(protocol);
        payload.put_slice(&packet[..packet.len().min(limit)]);

        self.lcp
            .send_extension(Code::ProtocolReject, payload.freeze(), &mut self.outbox);
        Ok(())
    }

    fn begin_close(&mut self, reason: &str) -> Result<()> {
        if self.phase.is_live() {
            info!("링크 종료: {}", reason);
            self.reason = reason.to_string();
            self.enter_phase(Phase::Terminate)?;
        }
        self.lcp.close(reason, &mut self.outbox);
        Ok(())
    }

    fn enter_phase(&mut self, next: Phase) -> Result<()> {
        if self.phase == next {
            return Ok(());
        }
        if !self.phase.can_advance_to(next) {
            return Err(Error::InvalidPhaseTransition {
                from: self.phase,
                to: next,
            });
        }

        info!("phase: {:?} -> {:?}", self.phase, next);
        self.phase = next;
        self.events.push_back(LinkEvent::PhaseChanged(next));
        if next != Phase::Auth {
            self.cancel_auth_wait();
        }

        match next {
            Phase::Establish => self.reason.clear(),
            Phase::Auth => self.auth = AuthProgress::default(),
            Phase::Network => {
                for sub in self
                    .protocols
                    .iter_mut()
                    .filter(|p| p.kind() == ProtocolKind::Network)
                {
                    sub.open(&mut self.outbox)?;
                }
                self.check_network_alive()?;
            }
            Phase::Terminate => {
                let reason = self.reason.clone();
                for sub in self.protocols.iter_mut().rev() {
                    sub.lower_down(&mut self.outbox);
                    sub.close(&reason, &mut self.outbox);
                }
            }
            Phase::Dead => {
                self.auth = AuthProgress::default();
                self.peer_name = None;
            }
            Phase::Running => {}
        }
        Ok(())
    }

    fn process_events(&mut self) -> Result<()> {
        while let Some(event) = self.outbox.events.pop_front() {
            self.handle_layer_event(event)?;
        }
        Ok(())
    }

    fn handle_layer_event(&mut self, event: LayerEvent) -> Result<()> {
        match event {
            LayerEvent::Up(Protocol::Lcp) => self.on_lcp_up(),
            LayerEvent::Down(Protocol::Lcp) => self.on_lcp_down(),
            LayerEvent::Finished(Protocol::Lcp) => self.on_lcp_finished(),

            LayerEvent::Up(protocol) => match protocol.kind() {
                ProtocolKind::Authentication => {
                    self.auth.local_pending = false;
                    self.check_auth_done()
                }
                _ => {
                    self.networks_up += 1;
                    self.events.push_back(LinkEvent::NetworkUp(protocol));
                    if self.phase == Phase::Network {
                        self.enter_phase(Phase::Running)?;
                    }
                    Ok(())
                }
            },

            LayerEvent::Down(protocol) => {
                if protocol.kind() == ProtocolKind::Network {
                    self.networks_up = self.networks_up.saturating_sub(1);
                    self.events.push_back(LinkEvent::NetworkDown(protocol));
                    if self.networks_up == 0 && self.phase == Phase::Running {
                        self.begin_close("열린 네트워크 프로토콜 없음")?;
                    }
                }
                Ok(())
            }

            LayerEvent::Finished(protocol) => match protocol.kind() {
                ProtocolKind::Authentication
                    if self.phase == Phase::Auth && self.auth.local_pending =>
                {
                    self.begin_close("PAP 인증 응답 없음")
                }
                ProtocolKind::Network => self.check_network_alive(),
                _ => Ok(()),
            },

            LayerEvent::Starting(protocol) => {
                debug!("{}: this-layer-started", protocol);
                Ok(())
            }

            LayerEvent::Refused(protocol, reason) => {
                if protocol.kind() == ProtocolKind::Authentication && self.phase.is_live() {
                    self.begin_close(&format!("인증 거부됨: {}", reason))
                } else {
                    debug!("{}: 요청 거부됨: {}", protocol, reason);
                    Ok(())
                }
            }

            LayerEvent::PeerAuthenticated(name) => {
                if self.peer_name.as_deref() != Some(name.as_str()) {
                    self.peer_name = Some(name.clone());
                    self.events.push_back(LinkEvent::PeerAuthenticated(name));
                }
                self.auth.peer_pending = false;
                self.check_auth_done()
            }

            LayerEvent::PeerAuthFailed(name) => {
                self.begin_close(&format!("PAP 인증 실패: {}", name))
            }

            LayerEvent::ProtocolRejected(number) => self.on_protocol_rejected(number),

            LayerEvent::EchoReply(id) => {
                self.events.push_back(LinkEvent::EchoReply(id));
                Ok(())
            }
        }
    }

    fn on_lcp_up(&mut self) -> Result<()> {
        if self.phase == Phase::Terminate {
            self.enter_phase(Phase::Dead)?;
        }
        if self.phase == Phase::Dead {
            self.enter_phase(Phase::Establish)?;
        }

        let peer_mru = self.lcp.handler().peer_mru();
        self.lcp.set_peer_mru(peer_mru);
        for sub in self.protocols.iter_mut() {
            sub.set_peer_mru(peer_mru);
            sub.lower_up(&mut self.outbox)?;
        }
        self.enter_phase(Phase::Auth)?;

        let lcp = self.lcp.handler();
        if lcp.requires_pap() && !lcp.auth_acked() {
            return self.begin_close("상대가 PAP 인증을 거부");
        }

        self.auth = AuthProgress {
            local_pending: lcp.peer_auth().is_some(),
            peer_pending: lcp.auth_acked(),
        };
        if self.auth.peer_pending {
            self.arm_auth_wait();
        }

        if self.auth.local_pending {
            match self
                .protocols
                .iter_mut()
                .find(|p| p.kind() == ProtocolKind::Authentication)
            {
                Some(pap) => pap.open(&mut self.outbox)?,
                None => return self.begin_close("인증 프로토콜 미등록"),
            }
        }
        self.check_auth_done()
    }

    fn on_lcp_down(&mut self) -> Result<()> {
        if self.phase.is_live() {
            if self.reason.is_empty() {
                self.reason = "LCP down".to_string();
            }
            self.enter_phase(Phase::Terminate)?;
        }

        // 재협상 중이면 Establish 로 복귀
        if self.carrier && is_negotiating(self.lcp.state()) {
            debug!("LCP 재협상, Establish 로 복귀");
            self.enter_phase(Phase::Dead)?;
            self.enter_phase(Phase::Establish)?;
        }
        Ok(())
    }

    fn on_lcp_finished(&mut self) -> Result<()> {
        if self.phase == Phase::Dead {
            return Ok(());
        }
        if self.reason.is_empty() {
            self.reason = "LCP 종료".to_string();
        }
        if self.phase != Phase::Terminate {
            self.enter_phase(Phase::Terminate)?;
        }
        self.enter_phase(Phase::Dead)?;
        self.events
            .push_back(LinkEvent::Terminated(self.reason.clone()));
        Ok(())
    }

    fn arm_auth_wait(&mut self) {
        self.auth_wait.generation += 1;
        self.auth_wait.armed = true;
        self.outbox.timers.push(TimerCommand::Arm {
            protocol: Protocol::Pap,
            kind: TimerKind::AuthWait,
            generation: self.auth_wait.generation,
            after: self.auth_wait.after,
        });
    }

    fn cancel_auth_wait(&mut self) {
        if self.auth_wait.armed {
            self.auth_wait.armed = false;
            self.outbox.timers.push(TimerCommand::Cancel {
                protocol: Protocol::Pap,
                kind: TimerKind::AuthWait,
            });
        }
    }

    fn check_auth_done(&mut self) -> Result<()> {
        if self.phase == Phase::Auth && !self.auth.local_pending && !self.auth.peer_pending {
            self.enter_phase(Phase::Network)?;
        }
        Ok(())
    }

    /// 협상 중이거나 열린 네트워크 프로토콜이 없으면 링크 종료
    fn check_network_alive(&mut self) -> Result<()> {
        if !matches!(self.phase, Phase::Network | Phase::Running) {
            return Ok(());
        }

        let alive = self
            .protocols
            .iter()
            .filter(|p| p.kind() == ProtocolKind::Network)
            .any(|p| is_negotiating(p.state()));
        if !alive {
            self.begin_close("네트워크 프로토콜 협상 실패")?;
        }
        Ok(())
    }

    fn on_protocol_rejected(&mut self, number: u16) -> Result<()> {
        match self
            .protocols
            .iter_mut()
            .find(|p| p.protocol().number() == number)
        {
            Some(sub) => {
                warn!("{}: 상대가 Protocol-Reject, 하위 계층 down", sub.protocol());
                sub.lower_down(&mut self.outbox);
            }
            None => {
                debug!("등록되지 않은 프로토콜 0x{:04x} 에 대한 Protocol-Reject", number);
                return Ok(());
            }
        }
        // lower_down 이 낸 Down 이벤트를 먼저 반영
        self.process_events()?;
        self.check_network_alive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    use crate::config::{Credentials, Ipv4Config};
    use crate::netif::RecordingInstaller;
    use crate::packet::ControlPacket;

    fn server_config() -> Config {
        let mut config = Config::default();
        config.ipv4 = Some(Ipv4Config {
            local_address: Ipv4Addr::new(10, 0, 0, 1),
            peer_address: Some(Ipv4Addr::new(10, 0, 0, 2)),
            ..Default::default()
        });
        config
    }

    fn client_config() -> Config {
        Config::default()
    }

    fn link(config: &Config) -> (Link, RecordingInstaller) {
        let installer = RecordingInstaller::new();
        (Link::new(config, Arc::new(installer.clone())), installer)
    }

    fn start(link: &mut Link) {
        link.open().unwrap();
        link.carrier_on().unwrap();
    }

    /// 양쪽 송신 프레임이 없어질 때까지 교환
    fn pump(a: &mut Link, b: &mut Link) {
        exchange(a, b, |_| true);
    }

    /// `deliver` 가 false 인 b 의 프레임은 유실
    fn exchange(a: &mut Link, b: &mut Link, deliver: impl Fn(&Frame) -> bool) {
        for _ in 0..64 {
            let from_a = a.take_frames();
            let from_b = b.take_frames();
            if from_a.is_empty() && from_b.is_empty() {
                return;
            }
            for frame in from_a {
                b.input(&frame.to_bytes().unwrap()).unwrap();
            }
            for frame in from_b.into_iter().filter(|f| deliver(f)) {
                a.input(&frame.to_bytes().unwrap()).unwrap();
            }
        }
        panic!("프레임 교환이 끝나지 않음");
    }

    /// 해제되지 않은 마지막 타이머를 만료시킴
    fn fire_timer(link: &mut Link, protocol: Protocol, kind: TimerKind) -> bool {
        let mut armed = None;
        for timer in link.take_timers() {
            match timer {
                TimerCommand::Arm {
                    protocol: p,
                    kind: k,
                    generation,
                    ..
                } if p == protocol && k == kind => armed = Some(generation),
                TimerCommand::Cancel {
                    protocol: p,
                    kind: k,
                } if p == protocol && k == kind => armed = None,
                _ => {}
            }
        }

        let Some(generation) = armed else {
            return false;
        };
        match kind {
            TimerKind::Restart => link.timeout(protocol, generation).unwrap(),
            TimerKind::AuthWait => link.auth_timeout(generation).unwrap(),
        }
        true
    }

    fn running_pair() -> ((Link, RecordingInstaller), (Link, RecordingInstaller)) {
        let (mut a, ai) = link(&server_config());
        let (mut b, bi) = link(&client_config());
        start(&mut a);
        start(&mut b);
        pump(&mut a, &mut b);
        assert_eq!(a.phase(), Phase::Running);
        assert_eq!(b.phase(), Phase::Running);
        ((a, ai), (b, bi))
    }

    #[test]
    fn test_phase_table() {
        use Phase::*;

        assert!(Dead.can_advance_to(Establish));
        assert!(Running.can_advance_to(Terminate));
        assert!(Terminate.can_advance_to(Dead));
        assert!(!Dead.can_advance_to(Running));
        assert!(!Running.can_advance_to(Dead));
        assert!(!Terminate.can_advance_to(Establish));
        assert!(!Dead.can_advance_to(Terminate));
    }

    #[test]
    fn test_invalid_phase_transition() {
        let (mut a, _) = link(&server_config());
        assert!(matches!(
            a.advance_phase(Phase::Running),
            Err(Error::InvalidPhaseTransition {
                from: Phase::Dead,
                to: Phase::Running
            })
        ));
        assert_eq!(a.phase(), Phase::Dead);
    }

    #[test]
    fn test_back_to_back_reaches_running() {
        let ((mut a, ai), (mut b, bi)) = running_pair();

        let lease = bi.ipv4().unwrap();
        assert_eq!(lease.local, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(lease.peer, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(ai.ipv4().unwrap().peer, Ipv4Addr::new(10, 0, 0, 2));
        assert!(ai.ipv6().is_some());
        assert_eq!(a.networks_up(), 2);

        let phases: Vec<_> = a
            .take_events()
            .into_iter()
            .filter_map(|e| match e {
                LinkEvent::PhaseChanged(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![Phase::Establish, Phase::Auth, Phase::Network, Phase::Running]
        );

        let events = b.take_events();
        assert!(events.contains(&LinkEvent::NetworkUp(Protocol::Ipcp)));
        assert!(events.contains(&LinkEvent::NetworkUp(Protocol::Ipv6cp)));
    }

    #[test]
    fn test_pap_authentication() {
        let server = server_config().require_pap(vec![Credentials::new("bob", "pw")]);
        let client = client_config().with_credentials("bob", "pw");

        let (mut a, _) = link(&server);
        let (mut b, _) = link(&client);
        start(&mut a);
        start(&mut b);
        pump(&mut a, &mut b);

        assert_eq!(a.phase(), Phase::Running);
        assert_eq!(b.phase(), Phase::Running);
        assert_eq!(a.peer_name(), Some("bob"));
        assert!(a
            .take_events()
            .contains(&LinkEvent::PeerAuthenticated("bob".to_string())));
        assert_eq!(b.state_of(Protocol::Pap), Some(State::Opened));

        // 인증이 끝나면 대기 타이머는 해제됨
        assert!(!fire_timer(&mut a, Protocol::Pap, TimerKind::AuthWait));
    }

    #[test]
    fn test_authenticator_wait_is_bounded() {
        let server = server_config().require_pap(vec![Credentials::new("bob", "pw")]);
        let client = client_config().with_credentials("bob", "pw");

        let (mut a, _) = link(&server);
        let (mut b, _) = link(&client);
        start(&mut a);
        start(&mut b);

        // b 의 Authenticate-Request 가 모두 유실
        let lose_pap = |f: &Frame| f.protocol != Protocol::Pap.number();
        exchange(&mut a, &mut b, lose_pap);
        assert_eq!(a.phase(), Phase::Auth);
        assert_eq!(a.lcp().state(), State::Opened);

        assert!(fire_timer(&mut a, Protocol::Pap, TimerKind::AuthWait));
        assert_eq!(a.phase(), Phase::Terminate);

        exchange(&mut a, &mut b, lose_pap);
        assert_eq!(a.phase(), Phase::Dead);
        assert_eq!(a.terminate_reason(), "PAP 인증 시간 초과");
        assert!(a
            .take_events()
            .contains(&LinkEvent::Terminated("PAP 인증 시간 초과".to_string())));
    }

    #[test]
    fn test_stale_auth_wait_ignored() {
        let ((mut a, _), _) = running_pair();
        a.auth_timeout(7).unwrap();
        assert_eq!(a.phase(), Phase::Running);
        assert!(a.take_frames().is_empty());
    }

    #[test]
    fn test_pap_failure_tears_down() {
        let server = server_config().require_pap(vec![Credentials::new("bob", "pw")]);
        let client = client_config().with_credentials("bob", "wrong");

        let (mut a, _) = link(&server);
        let (mut b, bi) = link(&client);
        start(&mut a);
        start(&mut b);
        pump(&mut a, &mut b);

        assert_eq!(a.phase(), Phase::Dead);
        assert_eq!(b.phase(), Phase::Dead);
        assert!(a.terminate_reason().contains("bob"));
        assert!(b
            .take_events()
            .iter()
            .any(|e| matches!(e, LinkEvent::Terminated(_))));
        assert!(bi.ipv4().is_none());
    }

    #[test]
    fn test_peer_without_credentials_refuses_pap() {
        let server = server_config().require_pap(vec![Credentials::new("bob", "pw")]);
        let (mut a, _) = link(&server);
        let (mut b, _) = link(&client_config());
        start(&mut a);
        start(&mut b);
        pump(&mut a, &mut b);

        // b 가 Authentication-Protocol 을 reject → a 는 인증 없이 진행하지 않음
        assert_ne!(a.phase(), Phase::Running);
        assert_ne!(b.phase(), Phase::Running);
    }

    #[test]
    fn test_ipcp_without_assignable_address_settles() {
        let mut server = server_config();
        if let Some(ipv4) = server.ipv4.as_mut() {
            ipv4.peer_address = None;
        }

        let (mut a, _) = link(&server);
        let (mut b, bi) = link(&client_config());
        start(&mut a);
        start(&mut b);
        pump(&mut a, &mut b);

        // b 는 주소 옵션이 모두 거절돼 빈 요청만 보냄, 재전송을 돌려도 유한하게 끝나야 함
        let mut settled = false;
        for _ in 0..64 {
            let fired_a = fire_timer(&mut a, Protocol::Ipcp, TimerKind::Restart);
            let fired_b = fire_timer(&mut b, Protocol::Ipcp, TimerKind::Restart);
            pump(&mut a, &mut b);
            if !fired_a && !fired_b {
                settled = true;
                break;
            }
        }

        assert!(settled, "IPCP 협상이 끝나지 않음");
        assert_eq!(a.state_of(Protocol::Ipcp), Some(State::Closed));
        assert_eq!(b.state_of(Protocol::Ipcp), Some(State::Stopped));
        assert!(bi.ipv4().is_none());

        // IPV6CP 만으로 계속 동작
        assert_eq!(a.phase(), Phase::Running);
        assert_eq!(b.phase(), Phase::Running);
    }

    #[test]
    fn test_close_runs_terminate_handshake() {
        let ((mut a, ai), (mut b, bi)) = running_pair();
        a.take_events();
        b.take_events();

        a.close("bye").unwrap();
        a.close("bye").unwrap();
        assert_eq!(a.phase(), Phase::Terminate);
        assert!(ai.ipv4().is_none());

        pump(&mut a, &mut b);
        assert_eq!(a.phase(), Phase::Dead);
        assert!(a
            .take_events()
            .contains(&LinkEvent::Terminated("bye".to_string())));

        // 상대는 zrc 타이머 만료 후 Dead
        assert_eq!(b.phase(), Phase::Terminate);
        assert!(bi.ipv4().is_none());
        let generation = b.lcp().timer_generation();
        b.timeout(Protocol::Lcp, generation).unwrap();
        assert_eq!(b.phase(), Phase::Dead);
    }

    #[test]
    fn test_carrier_off_uninstalls() {
        let ((mut a, ai), _) = running_pair();
        a.take_events();

        a.carrier_off().unwrap();
        assert_eq!(a.phase(), Phase::Dead);
        assert!(ai.ipv4().is_none());
        assert!(ai.ipv6().is_none());
        assert_eq!(a.lcp().state(), State::Starting);

        let events = a.take_events();
        assert!(events.contains(&LinkEvent::NetworkDown(Protocol::Ipcp)));
        assert!(events.contains(&LinkEvent::Terminated("carrier 끊김".to_string())));
        assert!(a.take_frames().is_empty());
    }

    #[test]
    fn test_unknown_protocol_is_rejected() {
        let mut client = client_config();
        client.ipv6 = None;

        let (mut a, _) = link(&server_config());
        let (mut b, _) = link(&client);
        start(&mut a);
        start(&mut b);
        pump(&mut a, &mut b);

        // b 가 IPV6CP 를 Protocol-Reject → a 는 IPV6CP 를 내리고 IPCP 로 동작
        assert_eq!(a.phase(), Phase::Running);
        assert_eq!(a.state_of(Protocol::Ipv6cp), Some(State::Starting));
        assert_eq!(a.state_of(Protocol::Ipcp), Some(State::Opened));
        assert_eq!(a.networks_up(), 1);
    }

    #[test]
    fn test_network_code_reject_fits_peer_mru() {
        let mut client = client_config();
        client.mru = crate::lcp::MIN_MRU;

        let (mut a, _) = link(&server_config());
        let (mut b, _) = link(&client);
        start(&mut a);
        start(&mut b);
        pump(&mut a, &mut b);
        assert_eq!(a.phase(), Phase::Running);
        a.take_frames();

        let unknown = Frame::new(
            Protocol::Ipcp,
            ControlPacket {
                code: 0x30,
                id: 9,
                payload: bytes::Bytes::from(vec![0xaa; 300]),
            },
        );
        a.input(&unknown.to_bytes().unwrap()).unwrap();

        let frames = a.take_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].protocol, Protocol::Ipcp.number());
        assert_eq!(frames[0].packet.code, Code::CodeReject as u8);
        assert_eq!(
            frames[0].packet.payload.len(),
            crate::lcp::MIN_MRU as usize - HEADER_SIZE
        );
    }

    #[test]
    fn test_protocol_reject_of_last_network_closes() {
        let mut client = client_config();
        client.ipv6 = None;
        let mut server = server_config();
        server.ipv4 = None;

        let (mut a, _) = link(&server);
        let (mut b, _) = link(&client);
        start(&mut a);
        start(&mut b);
        pump(&mut a, &mut b);

        assert_ne!(a.phase(), Phase::Running);
        assert_eq!(a.lcp().state(), State::Closed);
    }

    #[test]
    fn test_echo_round_trip() {
        let ((mut a, _), (mut b, _)) = running_pair();
        a.take_events();

        let id = a.send_echo(b"ping").unwrap();
        pump(&mut a, &mut b);
        assert!(a.take_events().contains(&LinkEvent::EchoReply(id)));
    }

    #[test]
    fn test_echo_requires_opened_lcp() {
        let (mut a, _) = link(&server_config());
        assert!(matches!(a.send_echo(b"x"), Err(Error::LinkNotOpened)));
    }

    #[test]
    fn test_malformed_frame_dropped() {
        let ((mut a, _), _) = running_pair();
        a.take_events();

        a.input(&[0xc0]).unwrap();
        a.input(&[0xc0, 0x21, 0x01, 0x01, 0x00, 0x20]).unwrap();
        assert!(a.take_frames().is_empty());
        assert_eq!(a.phase(), Phase::Running);
    }

    #[test]
    fn test_network_frames_dropped_before_lcp() {
        let (mut a, _) = link(&server_config());
        start(&mut a);
        a.take_frames();

        let frame = Frame::new(
            Protocol::Ipcp,
            ControlPacket::new(Code::ConfigureRequest, 1, bytes::Bytes::new()),
        );
        a.input(&frame.to_bytes().unwrap()).unwrap();
        assert!(a.take_frames().is_empty());
    }

    #[test]
    fn test_lcp_renegotiation_restarts_phases() {
        let mut client = client_config();
        client.restart_on_open = true;

        let (mut a, _) = link(&server_config());
        let (mut b, _) = link(&client);
        start(&mut a);
        start(&mut b);
        pump(&mut a, &mut b);
        assert_eq!(b.phase(), Phase::Running);
        a.take_events();

        // b 가 LCP 를 재시작하면 a 도 Establish 부터 다시 진행
        b.open().unwrap();
        pump(&mut a, &mut b);

        let phases: Vec<_> = a
            .take_events()
            .into_iter()
            .filter_map(|e| match e {
                LinkEvent::PhaseChanged(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![
                Phase::Terminate,
                Phase::Dead,
                Phase::Establish,
                Phase::Auth,
                Phase::Network,
                Phase::Running
            ]
        );
        assert_eq!(b.phase(), Phase::Running);
    }
}
