//! 옵션 코덱
//!
//! Configure 패킷 페이로드 안의 `type(1) | length(1) | value` 나열을 다룬다.
//! length 는 type/length 두 바이트를 포함한다.

use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// 옵션 헤더 크기 (type + length)
pub const OPTION_HEADER_SIZE: usize = 2;

/// 옵션 하나의 최대 값 길이
pub const MAX_OPTION_VALUE: usize = u8::MAX as usize - OPTION_HEADER_SIZE;

/// 옵션 단위 에러 (협상 계층 밖으로 전파되지 않음)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OptionError {
    #[error("옵션 블록 잘림: offset {offset}")]
    Truncated { offset: usize },

    #[error("옵션 길이 오류: type {code}, length {len}")]
    BadLength { code: u8, len: usize },

    #[error("옵션 값 오류: type {code}")]
    InvalidValue { code: u8 },

    #[error("옵션 값이 너무 김: {len} bytes")]
    TooLong { len: usize },
}

impl From<OptionError> for crate::Error {
    fn from(e: OptionError) -> Self {
        match e {
            OptionError::TooLong { .. } => crate::Error::BufferOverflow {
                max_size: MAX_OPTION_VALUE,
            },
            _ => crate::Error::MalformedPacket {
                reason: "옵션 블록 오류",
            },
        }
    }
}

/// 파싱된 옵션 (원본 버퍼 참조)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawOption<'a> {
    /// 옵션 타입
    pub code: u8,

    /// 값 (헤더 제외)
    pub value: &'a [u8],

    /// 헤더 포함 원본 TLV (Reject 시 그대로 복사)
    pub raw: &'a [u8],
}

/// 옵션 반복자
///
/// 잘못된 TLV 를 만나면 에러를 한 번 내고 멈춘다.
pub struct OptionIter<'a> {
    data: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> OptionIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            failed: false,
        }
    }
}

impl<'a> Iterator for OptionIter<'a> {
    type Item = Result<RawOption<'a>, OptionError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.data.len() {
            return None;
        }

        if self.offset + OPTION_HEADER_SIZE > self.data.len() {
            self.failed = true;
            return Some(Err(OptionError::Truncated {
                offset: self.offset,
            }));
        }

        let code = self.data[self.offset];
        let len = self.data[self.offset + 1] as usize;

        if len < OPTION_HEADER_SIZE {
            self.failed = true;
            return Some(Err(OptionError::BadLength { code, len }));
        }
        if self.offset + len > self.data.len() {
            self.failed = true;
            return Some(Err(OptionError::Truncated {
                offset: self.offset,
            }));
        }

        let raw = &self.data[self.offset..self.offset + len];
        self.offset += len;

        Some(Ok(RawOption {
            code,
            value: &raw[OPTION_HEADER_SIZE..],
            raw,
        }))
    }
}

/// 옵션 블록 전체를 검증하며 파싱
pub fn parse_options(data: &[u8]) -> Result<Vec<RawOption<'_>>, OptionError> {
    OptionIter::new(data).collect()
}

/// 옵션 하나 추가
pub fn put_option(buf: &mut BytesMut, code: u8, value: &[u8]) -> Result<(), OptionError> {
    if value.len() > MAX_OPTION_VALUE {
        return Err(OptionError::TooLong { len: value.len() });
    }

    buf.reserve(OPTION_HEADER_SIZE + value.len());
    buf.put_u8(code);
    buf.put_u8((OPTION_HEADER_SIZE + value.len()) as u8);
    buf.put_slice(value);
    Ok(())
}

/// 2바이트 값
pub fn value_u16(code: u8, value: &[u8]) -> Result<u16, OptionError> {
    let bytes: [u8; 2] = value
        .try_into()
        .map_err(|_| OptionError::BadLength {
            code,
            len: value.len() + OPTION_HEADER_SIZE,
        })?;
    Ok(u16::from_be_bytes(bytes))
}

/// 4바이트 값
pub fn value_u32(code: u8, value: &[u8]) -> Result<u32, OptionError> {
    let bytes: [u8; 4] = value
        .try_into()
        .map_err(|_| OptionError::BadLength {
            code,
            len: value.len() + OPTION_HEADER_SIZE,
        })?;
    Ok(u32::from_be_bytes(bytes))
}

/// IPv4 주소 값
pub fn value_ipv4(code: u8, value: &[u8]) -> Result<Ipv4Addr, OptionError> {
    value_u32(code, value).map(Ipv4Addr::from)
}

/// 8바이트 값 (interface identifier)
pub fn value_u64_bytes(code: u8, value: &[u8]) -> Result<[u8; 8], OptionError> {
    value.try_into().map_err(|_| OptionError::BadLength {
        code,
        len: value.len() + OPTION_HEADER_SIZE,
    })
}
