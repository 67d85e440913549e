//! IPCP (IPv4 Control Protocol, RFC 1332 / RFC 1877)
//!
//! - 옵션: IP-Address(3), Primary-DNS(129), Secondary-DNS(131)
//! - up 에서 주소 설치, down 에서 설치한 것만 제거

use std::net::Ipv4Addr;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::config::Ipv4Config;
use crate::fsm::{FsmHandler, Outbox};
use crate::negotiation::{
    negotiate_peer_request, MyOption, MyOptions, NakMode, NegotiationError, PeerOption, Verdict,
};
use crate::netif::{Ipv4Lease, NetworkInstaller};
use crate::options::{put_option, value_ipv4, OptionError};
use crate::Result;

pub const OPT_IP_ADDRESS: u8 = 3;
pub const OPT_PRIMARY_DNS: u8 = 129;
pub const OPT_SECONDARY_DNS: u8 = 131;

/// IPCP 협상 데이터
#[derive(Debug, Clone)]
pub struct IpcpData {
    /// 내 주소
    pub local: Ipv4Addr,

    /// 상대 주소
    pub peer: Ipv4Addr,

    /// 상대에게서 받은 DNS 서버
    pub dns: [Ipv4Addr; 2],

    assign: Option<Ipv4Addr>,
    offer_dns: [Option<Ipv4Addr>; 2],
    peer_address_seen: bool,
}

fn parse_address(d: &mut IpcpData, v: &[u8]) -> std::result::Result<(), OptionError> {
    let addr = value_ipv4(OPT_IP_ADDRESS, v)?;
    d.peer_address_seen = true;

    let conflicts = !d.local.is_unspecified() && addr == d.local;
    let unassigned = d.assign.map(|a| a != addr).unwrap_or(false);
    if addr.is_unspecified() || conflicts || unassigned {
        return Err(OptionError::InvalidValue {
            code: OPT_IP_ADDRESS,
        });
    }
    d.peer = addr;
    Ok(())
}

fn nak_address(d: &mut IpcpData, _v: &[u8], buf: &mut BytesMut) -> bool {
    match d.assign {
        Some(addr) => {
            buf.put_slice(&addr.octets());
            true
        }
        None => false,
    }
}

fn parse_dns(d: &IpcpData, index: usize, code: u8, v: &[u8]) -> std::result::Result<(), OptionError> {
    let addr = value_ipv4(code, v)?;
    match d.offer_dns[index] {
        Some(offer) if offer == addr => Ok(()),
        _ => Err(OptionError::InvalidValue { code }),
    }
}

fn nak_dns(d: &IpcpData, index: usize, buf: &mut BytesMut) -> bool {
    match d.offer_dns[index] {
        Some(addr) => {
            buf.put_slice(&addr.octets());
            true
        }
        None => false,
    }
}

fn parse_primary_dns(d: &mut IpcpData, v: &[u8]) -> std::result::Result<(), OptionError> {
    parse_dns(d, 0, OPT_PRIMARY_DNS, v)
}

fn nak_primary_dns(d: &mut IpcpData, _v: &[u8], buf: &mut BytesMut) -> bool {
    nak_dns(d, 0, buf)
}

fn parse_secondary_dns(d: &mut IpcpData, v: &[u8]) -> std::result::Result<(), OptionError> {
    parse_dns(d, 1, OPT_SECONDARY_DNS, v)
}

fn nak_secondary_dns(d: &mut IpcpData, _v: &[u8], buf: &mut BytesMut) -> bool {
    nak_dns(d, 1, buf)
}

static PEER_OPTIONS: &[PeerOption<IpcpData>] = &[
    PeerOption {
        code: OPT_IP_ADDRESS,
        name: "IP-Address",
        parse: parse_address,
        build_nak: Some(nak_address),
    },
    PeerOption {
        code: OPT_PRIMARY_DNS,
        name: "Primary-DNS",
        parse: parse_primary_dns,
        build_nak: Some(nak_primary_dns),
    },
    PeerOption {
        code: OPT_SECONDARY_DNS,
        name: "Secondary-DNS",
        parse: parse_secondary_dns,
        build_nak: Some(nak_secondary_dns),
    },
];

fn encode_address(d: &IpcpData, buf: &mut BytesMut) {
    buf.put_slice(&d.local.octets());
}

fn address_nak(d: &mut IpcpData, v: &[u8]) -> std::result::Result<(), OptionError> {
    let addr = value_ipv4(OPT_IP_ADDRESS, v)?;
    if addr.is_unspecified() {
        return Err(OptionError::InvalidValue {
            code: OPT_IP_ADDRESS,
        });
    }
    debug!("IPCP: 상대가 할당한 주소 {}", addr);
    d.local = addr;
    Ok(())
}

fn encode_primary_dns(d: &IpcpData, buf: &mut BytesMut) {
    buf.put_slice(&d.dns[0].octets());
}

fn primary_dns_nak(d: &mut IpcpData, v: &[u8]) -> std::result::Result<(), OptionError> {
    d.dns[0] = value_ipv4(OPT_PRIMARY_DNS, v)?;
    Ok(())
}

fn encode_secondary_dns(d: &IpcpData, buf: &mut BytesMut) {
    buf.put_slice(&d.dns[1].octets());
}

fn secondary_dns_nak(d: &mut IpcpData, v: &[u8]) -> std::result::Result<(), OptionError> {
    d.dns[1] = value_ipv4(OPT_SECONDARY_DNS, v)?;
    Ok(())
}

static MY_ADDRESS: MyOption<IpcpData> = MyOption {
    code: OPT_IP_ADDRESS,
    name: "IP-Address",
    encode: encode_address,
    on_ack: None,
    on_nak: Some(address_nak),
};

static MY_PRIMARY_DNS: MyOption<IpcpData> = MyOption {
    code: OPT_PRIMARY_DNS,
    name: "Primary-DNS",
    encode: encode_primary_dns,
    on_ack: None,
    on_nak: Some(primary_dns_nak),
};

static MY_SECONDARY_DNS: MyOption<IpcpData> = MyOption {
    code: OPT_SECONDARY_DNS,
    name: "Secondary-DNS",
    encode: encode_secondary_dns,
    on_ack: None,
    on_nak: Some(secondary_dns_nak),
};

/// IPCP 핸들러
pub struct Ipcp {
    data: IpcpData,
    mine: MyOptions<IpcpData>,
    config: Ipv4Config,
    installer: Arc<dyn NetworkInstaller>,
    installed: Option<Ipv4Lease>,
}

impl Ipcp {
    pub fn new(config: &Ipv4Config, installer: Arc<dyn NetworkInstaller>) -> Self {
        let mut descs: Vec<&'static MyOption<IpcpData>> = vec![&MY_ADDRESS];
        if config.request_dns {
            descs.push(&MY_PRIMARY_DNS);
            descs.push(&MY_SECONDARY_DNS);
        }

        Self {
            data: IpcpData {
                local: config.local_address,
                peer: Ipv4Addr::UNSPECIFIED,
                dns: [Ipv4Addr::UNSPECIFIED; 2],
                assign: config.peer_address,
                offer_dns: config.dns_servers,
                peer_address_seen: false,
            },
            mine: MyOptions::new(descs),
            config: config.clone(),
            installer,
            installed: None,
        }
    }

    pub fn data(&self) -> &IpcpData {
        &self.data
    }

    /// 현재 설치된 주소
    pub fn installed(&self) -> Option<&Ipv4Lease> {
        self.installed.as_ref()
    }

    fn lease(&self) -> Ipv4Lease {
        let dns = self
            .data
            .dns
            .iter()
            .copied()
            .filter(|addr| !addr.is_unspecified())
            .collect();
        Ipv4Lease {
            local: self.data.local,
            peer: self.data.peer,
            dns,
        }
    }
}

impl FsmHandler for Ipcp {
    fn config_info_add(&mut self) -> Result<Bytes> {
        Ok(self.mine.encode(&self.data)?)
    }

    fn config_info_req(
        &mut self,
        options: &[u8],
        mode: NakMode,
    ) -> std::result::Result<Verdict, NegotiationError> {
        self.data.peer_address_seen = false;
        self.data.peer = Ipv4Addr::UNSPECIFIED;

        let verdict = negotiate_peer_request(PEER_OPTIONS, &mut self.data, options, mode)?;
        if !verdict.is_ack() || self.data.peer_address_seen || !self.config.require_peer_address
        {
            return Ok(verdict);
        }

        // 상대가 주소를 제안하지 않음
        match (self.data.assign, mode) {
            (Some(addr), NakMode::Counter) => {
                let mut nak = BytesMut::new();
                put_option(&mut nak, OPT_IP_ADDRESS, &addr.octets())?;
                Ok(Verdict::Nak(nak.freeze()))
            }
            _ => Err(NegotiationError::Semantic("IP-Address 옵션 없음")),
        }
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
        self.mine.handle_reject(options)
    }

    fn config_info_reset(&mut self) {
        self.mine.reset();
        self.data.local = self.config.local_address;
        self.data.dns = [Ipv4Addr::UNSPECIFIED; 2];
    }

    fn up(&mut self, _out: &mut Outbox) {
        if self.data.local.is_unspecified() {
            warn!("IPCP: 로컬 주소 없이 up");
        }

        let lease = self.lease();
        info!(
            "IPCP up: {} -> {}, DNS {:?}",
            lease.local, lease.peer, lease.dns
        );
        match self.installer.install_ipv4(&lease) {
            Ok(()) => self.installed = Some(lease),
            Err(e) => warn!("IPCP: 주소 설치 실패: {}", e),
        }
    }

    fn down(&mut self, _out: &mut Outbox) {
        let Some(lease) = self.installed.take() else {
            return;
        };
        info!("IPCP down: {} 제거", lease.local);
        if let Err(e) = self.installer.remove_ipv4(&lease) {
            warn!("IPCP: 주소 제거 실패: {}", e);
        }
    }
}
