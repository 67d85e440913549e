//! 링크 세션 (연결당 tokio 태스크 하나)
//!
//! - 태스크가 `Link` 를 단독 소유하고 명령 채널로만 접근
//! - 송신 프레임은 순서대로 `outbound` 채널로 나감
//! - 재전송 타이머는 세대 번호를 실어 명령 채널로 되돌아옴

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::fsm::{State, TimerCommand, TimerKind};
use crate::link::{Link, LinkEvent, Phase};
use crate::netif::NetworkInstaller;
use crate::packet::Protocol;
use crate::{Config, Error, Result};

/// 명령 채널 크기
const COMMAND_QUEUE: usize = 256;

/// 이벤트 채널 크기
const EVENT_QUEUE: usize = 256;

/// 링크 상태 스냅샷
#[derive(Debug, Clone, Serialize)]
pub struct LinkStatus {
    pub phase: Phase,
    pub protocols: Vec<(Protocol, State)>,
    pub peer_name: Option<String>,
    pub networks_up: usize,
    pub terminate_reason: String,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            phase: Phase::Dead,
            protocols: Vec::new(),
            peer_name: None,
            networks_up: 0,
            terminate_reason: String::new(),
        }
    }
}

impl LinkStatus {
    fn capture(link: &Link) -> Self {
        Self {
            phase: link.phase(),
            protocols: link.protocol_states(),
            peer_name: link.peer_name().map(str::to_string),
            networks_up: link.networks_up(),
            terminate_reason: link.terminate_reason().to_string(),
        }
    }

    pub fn state_of(&self, protocol: Protocol) -> Option<State> {
        self.protocols
            .iter()
            .find(|(p, _)| *p == protocol)
            .map(|(_, s)| *s)
    }
}

enum Command {
    Input(Bytes),
    CarrierOn,
    CarrierOff,
    Open,
    Close(String),
    Echo(Bytes, oneshot::Sender<Result<u8>>),
    Timeout {
        protocol: Protocol,
        kind: TimerKind,
        generation: u64,
    },
    Stop,
}

/// 세션 핸들 (복제 가능)
#[derive(Clone)]
pub struct LinkHandle {
    commands: mpsc::Sender<Command>,
    status: Arc<RwLock<LinkStatus>>,
}

impl LinkHandle {
    /// 세션 태스크 시작
    ///
    /// 반환된 수신기로 phase 변화, 네트워크 up/down, 종료 이벤트가 전달된다.
    pub fn spawn(
        config: Config,
        outbound: mpsc::Sender<Bytes>,
        installer: Arc<dyn NetworkInstaller>,
    ) -> (Self, mpsc::Receiver<LinkEvent>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let status = Arc::new(RwLock::new(LinkStatus::default()));

        let actor = LinkActor {
            link: Link::new(&config, installer),
            commands: command_rx,
            self_tx: command_tx.downgrade(),
            outbound,
            events: event_tx,
            status: status.clone(),
            timers: HashMap::new(),
        };
        tokio::spawn(actor.run());

        (
            Self {
                commands: command_tx,
                status,
            },
            event_rx,
        )
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::ChannelError)
    }

    /// 수신 프레임 전달
    pub async fn input(&self, frame: Bytes) -> Result<()> {
        self.send(Command::Input(frame)).await
    }

    pub async fn carrier_on(&self) -> Result<()> {
        self.send(Command::CarrierOn).await
    }

    pub async fn carrier_off(&self) -> Result<()> {
        self.send(Command::CarrierOff).await
    }

    pub async fn open(&self) -> Result<()> {
        self.send(Command::Open).await
    }

    pub async fn close(&self, reason: impl Into<String>) -> Result<()> {
        self.send(Command::Close(reason.into())).await
    }

    /// Echo-Request 전송, 사용한 id 반환
    pub async fn echo(&self, data: Bytes) -> Result<u8> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Echo(data, tx)).await?;
        rx.await.map_err(|_| Error::ChannelError)?
    }

    /// 세션 태스크 종료 (링크 종료 절차 없이)
    pub async fn stop(&self) -> Result<()> {
        self.send(Command::Stop).await
    }

    /// 현재 상태 스냅샷
    pub fn status(&self) -> LinkStatus {
        self.status.read().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

struct LinkActor {
    link: Link,
    commands: mpsc::Receiver<Command>,
    self_tx: mpsc::WeakSender<Command>,
    outbound: mpsc::Sender<Bytes>,
    events: mpsc::Sender<LinkEvent>,
    status: Arc<RwLock<LinkStatus>>,
    timers: HashMap<(Protocol, TimerKind), JoinHandle<()>>,
}

impl LinkActor {
    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            let result = match command {
                Command::Input(frame) => self.link.input(&frame),
                Command::CarrierOn => self.link.carrier_on(),
                Command::CarrierOff => self.link.carrier_off(),
                Command::Open => self.link.open(),
                Command::Close(reason) => self.link.close(&reason),
                Command::Echo(data, reply) => {
                    let _ = reply.send(self.link.send_echo(&data));
                    Ok(())
                }
                Command::Timeout {
                    protocol,
                    kind: TimerKind::Restart,
                    generation,
                } => self.link.timeout(protocol, generation),
                Command::Timeout {
                    kind: TimerKind::AuthWait,
                    generation,
                    ..
                } => self.link.auth_timeout(generation),
                Command::Stop => break,
            };

            if let Err(e) = result {
                warn!("링크 처리 에러: {}", e);
            }
            if let Err(e) = self.flush().await {
                warn!("송신 채널 닫힘, 세션 종료: {}", e);
                break;
            }
        }

        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        debug!("링크 세션 종료");
    }

    async fn flush(&mut self) -> Result<()> {
        for frame in self.link.take_frames() {
            let bytes = match frame.to_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("프레임 직렬화 실패: {}", e);
                    continue;
                }
            };
            self.outbound
                .send(bytes)
                .await
                .map_err(|_| Error::ConnectionClosed)?;
        }

        for timer in self.link.take_timers() {
            self.apply_timer(timer);
        }

        for event in self.link.take_events() {
            if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
                warn!("이벤트 채널 가득 참, 폐기: {:?}", event);
            }
        }

        *self.status.write() = LinkStatus::capture(&self.link);
        Ok(())
    }

    fn apply_timer(&mut self, command: TimerCommand) {
        match command {
            TimerCommand::Arm {
                protocol,
                kind,
                generation,
                after,
            } => {
                if let Some(previous) = self.timers.remove(&(protocol, kind)) {
                    previous.abort();
                }

                let commands = self.self_tx.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    if let Some(commands) = commands.upgrade() {
                        let _ = commands
                            .send(Command::Timeout {
                                protocol,
                                kind,
                                generation,
                            })
                            .await;
                    }
                });
                self.timers.insert((protocol, kind), timer);
            }
            TimerCommand::Cancel { protocol, kind } => {
                if let Some(timer) = self.timers.remove(&(protocol, kind)) {
                    timer.abort();
                }
            }
        }
    }
}
