//! IPV6CP (IPv6 Control Protocol, RFC 5072)
//!
//! Interface-Identifier(1) 하나만 협상한다.
//! 0 이거나 내 것과 같은 식별자는 새 무작위 값으로 Nak.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{info, warn};

use crate::config::Ipv6Config;
use crate::fsm::{FsmHandler, Outbox};
use crate::negotiation::{
    negotiate_peer_request, MyOption, MyOptions, NakMode, NegotiationError, PeerOption, Verdict,
};
use crate::netif::{link_local, Ipv6Lease, NetworkInstaller};
use crate::options::{value_u64_bytes, OptionError};
use crate::Result;

pub const OPT_INTERFACE_ID: u8 = 1;

/// IPV6CP 협상 데이터
#[derive(Debug, Clone)]
pub struct Ipv6cpData {
    pub local_id: [u8; 8],
    pub peer_id: [u8; 8],
}

/// 0 이 아니고 `avoid` 와 다른 무작위 interface identifier
fn fresh_interface_id(avoid: [u8; 8]) -> [u8; 8] {
    loop {
        let id: [u8; 8] = rand::random();
        if id != [0; 8] && id != avoid {
            return id;
        }
    }
}

fn parse_interface_id(d: &mut Ipv6cpData, v: &[u8]) -> std::result::Result<(), OptionError> {
    let id = value_u64_bytes(OPT_INTERFACE_ID, v)?;
    if id == [0; 8] || id == d.local_id {
        return Err(OptionError::InvalidValue {
            code: OPT_INTERFACE_ID,
        });
    }
    d.peer_id = id;
    Ok(())
}

fn nak_interface_id(d: &mut Ipv6cpData, _v: &[u8], buf: &mut BytesMut) -> bool {
    buf.put_slice(&fresh_interface_id(d.local_id));
    true
}

static PEER_OPTIONS: &[PeerOption<Ipv6cpData>] = &[PeerOption {
    code: OPT_INTERFACE_ID,
    name: "Interface-Identifier",
    parse: parse_interface_id,
    build_nak: Some(nak_interface_id),
}];

fn encode_interface_id(d: &Ipv6cpData, buf: &mut BytesMut) {
    buf.put_slice(&d.local_id);
}

fn interface_id_nak(d: &mut Ipv6cpData, v: &[u8]) -> std::result::Result<(), OptionError> {
    let id = value_u64_bytes(OPT_INTERFACE_ID, v)?;
    if id == [0; 8] {
        return Err(OptionError::InvalidValue {
            code: OPT_INTERFACE_ID,
        });
    }
    d.local_id = id;
    Ok(())
}

static MY_INTERFACE_ID: MyOption<Ipv6cpData> = MyOption {
    code: OPT_INTERFACE_ID,
    name: "Interface-Identifier",
    encode: encode_interface_id,
    on_ack: None,
    on_nak: Some(interface_id_nak),
};

/// IPV6CP 핸들러
pub struct Ipv6cp {
    data: Ipv6cpData,
    mine: MyOptions<Ipv6cpData>,
    installer: Arc<dyn NetworkInstaller>,
    installed: Option<Ipv6Lease>,
}

impl Ipv6cp {
    pub fn new(config: &Ipv6Config, installer: Arc<dyn NetworkInstaller>) -> Self {
        let local_id = match config.interface_id {
            Some(id) if id != [0; 8] => id,
            _ => fresh_interface_id([0; 8]),
        };

        Self {
            data: Ipv6cpData {
                local_id,
                peer_id: [0; 8],
            },
            mine: MyOptions::new([&MY_INTERFACE_ID]),
            installer,
            installed: None,
        }
    }

    pub fn data(&self) -> &Ipv6cpData {
        &self.data
    }

    pub fn installed(&self) -> Option<&Ipv6Lease> {
        self.installed.as_ref()
    }
}

impl FsmHandler for Ipv6cp {
    fn config_info_add(&mut self) -> Result<Bytes> {
        Ok(self.mine.encode(&self.data)?)
    }

    fn config_info_req(
        &mut self,
        options: &[u8],
        mode: NakMode,
    ) -> std::result::Result<Verdict, NegotiationError> {
        self.data.peer_id = [0; 8];
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
        self.mine.handle_reject(options)
    }

    fn config_info_reset(&mut self) {
        self.mine.reset();
    }

    fn up(&mut self, _out: &mut Outbox) {
        let lease = Ipv6Lease {
            local: link_local(self.data.local_id),
            peer: link_local(self.data.peer_id),
        };
        info!("IPV6CP up: {} -> {}", lease.local, lease.peer);

        match self.installer.install_ipv6(&lease) {
            Ok(()) => self.installed = Some(lease),
            Err(e) => warn!("IPV6CP: 주소 설치 실패: {}", e),
        }
    }

    fn down(&mut self, _out: &mut Outbox) {
        let Some(lease) = self.installed.take() else {
            return;
        };
        info!("IPV6CP down: {} 제거", lease.local);
        if let Err(e) = self.installer.remove_ipv6(&lease) {
            warn!("IPV6CP: 주소 제거 실패: {}", e);
        }
    }
}
