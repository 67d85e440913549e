//! 옵션 협상 프레임워크
//!
//! - 수신 경로: 상대 Configure-Request 를 2-pass 로 검사해 Ack / Nak / Reject 결정
//! - 송신 경로: 내 옵션 직렬화, Ack / Nak / Reject 수신 시 옵션별 처리

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::debug;

use crate::options::{parse_options, put_option, OptionError};
use crate::packet::Code;

/// Configure-Request 에 대한 판정 (응답 페이로드 포함)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// 전체 옵션 블록을 그대로 돌려줌
    Ack(Bytes),

    /// 대안 값 목록
    Nak(Bytes),

    /// 받아들일 수 없는 옵션 원본
    Reject(Bytes),
}

impl Verdict {
    pub fn code(&self) -> Code {
        match self {
            Verdict::Ack(_) => Code::ConfigureAck,
            Verdict::Nak(_) => Code::ConfigureNak,
            Verdict::Reject(_) => Code::ConfigureReject,
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, Verdict::Ack(_))
    }

    pub fn payload(&self) -> &Bytes {
        match self {
            Verdict::Ack(p) | Verdict::Nak(p) | Verdict::Reject(p) => p,
        }
    }
}

/// 협상 에러 (FSM 에서 패킷 폐기 또는 Reject 로 변환)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// 옵션 블록 자체가 깨짐 → 패킷 폐기
    #[error("잘못된 옵션 블록: {0}")]
    Malformed(#[from] OptionError),

    /// 개별 파싱은 통과했지만 옵션 조합이 의미상 틀림 → 전체 Reject
    #[error("옵션 검증 실패: {0}")]
    Semantic(&'static str),

    /// 우리가 보내지 않은 옵션에 대한 Ack / Reject → 패킷 폐기
    #[error("요청하지 않은 옵션: type {code}")]
    UnexpectedOption { code: u8 },

    /// 옵션이 하나도 없는 Configure-Reject → 패킷 폐기
    #[error("빈 Configure-Reject")]
    EmptyReject,

    /// 상대가 요청 자체를 거부 (PAP Authenticate-Nak 등)
    #[error("상대가 거부함: {0}")]
    Refused(String),
}

/// Nak 대상 옵션 처리 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakMode {
    /// 대안 값으로 Nak
    Counter,

    /// Nak 루프 한도 초과, Nak 대신 Reject
    Reject,
}

/// 상대 옵션 파서: 값을 검증하고 협상 데이터에 기록
pub type ParseFn<D> = fn(&mut D, &[u8]) -> Result<(), OptionError>;

/// Nak 대안 값 작성기: 값만 기록 (헤더는 프레임워크가 붙임)
/// 대안이 없으면 false, 해당 옵션은 Reject 된다.
pub type BuildNakFn<D> = fn(&mut D, &[u8], &mut BytesMut) -> bool;

/// 내 옵션 값 인코더
pub type EncodeFn<D> = fn(&D, &mut BytesMut);

/// 내 옵션 Ack / Nak 처리기
pub type ApplyFn<D> = fn(&mut D, &[u8]) -> Result<(), OptionError>;

/// 상대가 제안할 수 있는 옵션 서술자
pub struct PeerOption<D> {
    pub code: u8,
    pub name: &'static str,
    pub parse: ParseFn<D>,
    pub build_nak: Option<BuildNakFn<D>>,
}

/// 내가 제안하는 옵션 서술자
pub struct MyOption<D> {
    pub code: u8,
    pub name: &'static str,
    pub encode: EncodeFn<D>,
    pub on_ack: Option<ApplyFn<D>>,
    pub on_nak: Option<ApplyFn<D>>,
}

/// 내 옵션 런타임 플래그
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptionFlags {
    pub acked: bool,
    pub rejected: bool,
}

struct MyOptionRecord<D: 'static> {
    desc: &'static MyOption<D>,
    flags: OptionFlags,
}

/// 상대 Configure-Request 협상 (RFC 1661 §5)
///
/// 1. 표에 없는 옵션은 Reject (Nak 보다 우선)
/// 2. 파싱 실패 옵션은 Nak (대안이 없거나 `NakMode::Reject` 이면 Reject)
/// 3. 모두 통과하면 원본 블록으로 Ack
pub fn negotiate_peer_request<D>(
    table: &[PeerOption<D>],
    data: &mut D,
    block: &[u8],
    mode: NakMode,
) -> Result<Verdict, NegotiationError> {
    let options = parse_options(block)?;

    let mut reject = BytesMut::new();
    for opt in options.iter() {
        if !table.iter().any(|desc| desc.code == opt.code) {
            debug!("지원하지 않는 옵션 reject: type {}", opt.code);
            reject.extend_from_slice(opt.raw);
        }
    }
    if !reject.is_empty() {
        return Ok(Verdict::Reject(reject.freeze()));
    }

    let mut nak = BytesMut::new();
    let mut nak_count = 0usize;

    for opt in options.iter() {
        let Some(desc) = table.iter().find(|desc| desc.code == opt.code) else {
            continue;
        };

        if let Err(e) = (desc.parse)(data, opt.value) {
            debug!("옵션 {} 값 거부: {}", desc.name, e);

            let countered = match (mode, desc.build_nak) {
                (NakMode::Counter, Some(build_nak)) => {
                    let mut value = BytesMut::new();
                    if build_nak(data, opt.value, &mut value) {
                        put_option(&mut nak, opt.code, &value)?;
                        nak_count += 1;
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            };
            if !countered {
                reject.extend_from_slice(opt.raw);
            }
        }
    }

    if !reject.is_empty() {
        return Ok(Verdict::Reject(reject.freeze()));
    }
    if nak_count > 0 {
        return Ok(Verdict::Nak(nak.freeze()));
    }

    Ok(Verdict::Ack(Bytes::copy_from_slice(block)))
}

/// 내 옵션 집합 (FSM 인스턴스마다 하나)
pub struct MyOptions<D: 'static> {
    records: Vec<MyOptionRecord<D>>,
}

impl<D: 'static> MyOptions<D> {
    pub fn new(descs: impl IntoIterator<Item = &'static MyOption<D>>) -> Self {
        Self {
            records: descs
                .into_iter()
                .map(|desc| MyOptionRecord {
                    desc,
                    flags: OptionFlags::default(),
                })
                .collect(),
        }
    }

    /// 비어 있는 집합
    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    /// REJECTED 아닌 옵션 직렬화
    pub fn encode(&self, data: &D) -> Result<Bytes, OptionError> {
        let mut buf = BytesMut::new();
        for record in self.records.iter().filter(|r| !r.flags.rejected) {
            let mut value = BytesMut::new();
            (record.desc.encode)(data, &mut value);
            put_option(&mut buf, record.desc.code, &value)?;
        }
        Ok(buf.freeze())
    }

    /// 플래그 초기화 (협상 재시작)
    pub fn reset(&mut self) {
        for record in self.records.iter_mut() {
            record.flags = OptionFlags::default();
        }
    }

    pub fn flags(&self, code: u8) -> Option<OptionFlags> {
        self.records
            .iter()
            .find(|r| r.desc.code == code)
            .map(|r| r.flags)
    }

    pub fn is_acked(&self, code: u8) -> bool {
        self.flags(code).map(|f| f.acked).unwrap_or(false)
    }

    pub fn is_rejected(&self, code: u8) -> bool {
        self.flags(code).map(|f| f.rejected).unwrap_or(false)
    }

    fn active_mut(&mut self, code: u8) -> Option<&mut MyOptionRecord<D>> {
        self.records
            .iter_mut()
            .find(|r| r.desc.code == code && !r.flags.rejected)
    }

    /// Configure-Ack 처리
    ///
    /// 보낸 옵션이 빠짐없이 들어 있어야 하며 모르는 옵션이 있으면 패킷 전체를 무시한다.
    pub fn handle_ack(&mut self, data: &mut D, block: &[u8]) -> Result<(), NegotiationError> {
        let options = parse_options(block)?;

        let sent = self.records.iter().filter(|r| !r.flags.rejected).count();
        if options.len() != sent {
            return Err(NegotiationError::Semantic("Ack 옵션 수가 요청과 다름"));
        }
        for opt in options.iter() {
            if self.active_mut(opt.code).is_none() {
                return Err(NegotiationError::UnexpectedOption { code: opt.code });
            }
        }

        for opt in options.iter() {
            if let Some(record) = self.active_mut(opt.code) {
                if let Some(on_ack) = record.desc.on_ack {
                    on_ack(data, opt.value)?;
                }
                record.flags.acked = true;
            }
        }
        Ok(())
    }

    /// Configure-Nak 처리
    ///
    /// `give_up` 이면 대안 값을 적용하지 않고 해당 옵션을 REJECTED 로 표시한다.
    pub fn handle_nak(
        &mut self,
        data: &mut D,
        block: &[u8],
        give_up: bool,
    ) -> Result<(), NegotiationError> {
        let options = parse_options(block)?;

        for opt in options.iter() {
            let Some(record) = self.active_mut(opt.code) else {
                // 요청하지 않은 옵션을 상대가 제안하는 경우, 무시
                debug!("요청하지 않은 옵션 Nak 무시: type {}", opt.code);
                continue;
            };

            if give_up {
                debug!("Nak 루프 한도 도달, 옵션 {} 포기", record.desc.name);
                record.flags.rejected = true;
                continue;
            }

            match record.desc.on_nak {
                Some(on_nak) => {
                    if let Err(e) = on_nak(data, opt.value) {
                        debug!("옵션 {} 대안 값 거부: {}", record.desc.name, e);
                    }
                }
                None => debug!("옵션 {} 은 대안 값을 받지 않음", record.desc.name),
            }
        }
        Ok(())
    }

    /// Configure-Reject 처리
    ///
    /// Reject 는 보낸 옵션의 부분 집합이어야 하므로 빈 블록이나 보내지 않은 옵션은 폐기한다.
    pub fn handle_reject(&mut self, block: &[u8]) -> Result<(), NegotiationError> {
        let options = parse_options(block)?;
        if options.is_empty() {
            return Err(NegotiationError::EmptyReject);
        }

        for opt in options.iter() {
            if self.active_mut(opt.code).is_none() {
                return Err(NegotiationError::UnexpectedOption { code: opt.code });
            }
        }
        for opt in options.iter() {
            if let Some(record) = self.active_mut(opt.code) {
                debug!("상대가 옵션 {} reject", record.desc.name);
                record.flags.rejected = true;
            }
        }
        Ok(())
    }
}
