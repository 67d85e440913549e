//! 네트워크 계층 설치자
//!
//! IPCP / IPV6CP 가 up 에서 주소를 설치하고 down 에서 제거할 때 호출한다.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::Result;

/// IPCP 협상 결과
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ipv4Lease {
    pub local: Ipv4Addr,
    pub peer: Ipv4Addr,
    pub dns: Vec<Ipv4Addr>,
}

/// IPV6CP 협상 결과 (link-local 주소)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ipv6Lease {
    pub local: Ipv6Addr,
    pub peer: Ipv6Addr,
}

/// interface identifier 로 fe80::/64 link-local 주소 생성
pub fn link_local(interface_id: [u8; 8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets[0] = 0xfe;
    octets[1] = 0x80;
    octets[8..].copy_from_slice(&interface_id);
    Ipv6Addr::from(octets)
}

/// 네트워크 설치 인터페이스
pub trait NetworkInstaller: Send + Sync {
    fn install_ipv4(&self, lease: &Ipv4Lease) -> Result<()>;

    fn remove_ipv4(&self, lease: &Ipv4Lease) -> Result<()>;

    fn install_ipv6(&self, lease: &Ipv6Lease) -> Result<()>;

    fn remove_ipv6(&self, lease: &Ipv6Lease) -> Result<()>;
}

/// 설치 기록
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum InstallOp {
    InstallIpv4(Ipv4Lease),
    RemoveIpv4(Ipv4Lease),
    InstallIpv6(Ipv6Lease),
    RemoveIpv6(Ipv6Lease),
}

#[derive(Debug, Default)]
struct Installed {
    ipv4: Option<Ipv4Lease>,
    ipv6: Option<Ipv6Lease>,
    history: Vec<InstallOp>,
}

/// 메모리에 기록만 하는 설치자 (테스트, 데모 바이너리)
#[derive(Debug, Default, Clone)]
pub struct RecordingInstaller {
    inner: Arc<Mutex<Installed>>,
}

impl RecordingInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// 현재 설치된 IPv4 주소
    pub fn ipv4(&self) -> Option<Ipv4Lease> {
        self.inner.lock().ipv4.clone()
    }

    /// 현재 설치된 IPv6 주소
    pub fn ipv6(&self) -> Option<Ipv6Lease> {
        self.inner.lock().ipv6.clone()
    }

    pub fn history(&self) -> Vec<InstallOp> {
        self.inner.lock().history.clone()
    }
}

impl NetworkInstaller for RecordingInstaller {
    fn install_ipv4(&self, lease: &Ipv4Lease) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ipv4 = Some(lease.clone());
        inner.history.push(InstallOp::InstallIpv4(lease.clone()));
        Ok(())
    }

    fn remove_ipv4(&self, lease: &Ipv4Lease) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.ipv4.as_ref() == Some(lease) {
            inner.ipv4 = None;
        }
        inner.history.push(InstallOp::RemoveIpv4(lease.clone()));
        Ok(())
    }

    fn install_ipv6(&self, lease: &Ipv6Lease) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ipv6 = Some(lease.clone());
        inner.history.push(InstallOp::InstallIpv6(lease.clone()));
        Ok(())
    }

    fn remove_ipv6(&self, lease: &Ipv6Lease) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.ipv6.as_ref() == Some(lease) {
            inner.ipv6 = None;
        }
        inner.history.push(InstallOp::RemoveIpv6(lease.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_local() {
        let addr = link_local([0x02, 0, 0, 0xff, 0xfe, 0, 0, 0x01]);
        assert_eq!(addr, "fe80::200:ff:fe00:1".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn test_recording_installer() {
        let installer = RecordingInstaller::new();
        let lease = Ipv4Lease {
            local: Ipv4Addr::new(10, 0, 0, 1),
            peer: Ipv4Addr::new(10, 0, 0, 2),
            dns: vec![],
        };

        installer.install_ipv4(&lease).unwrap();
        assert_eq!(installer.ipv4(), Some(lease.clone()));

        installer.remove_ipv4(&lease).unwrap();
        assert_eq!(installer.ipv4(), None);
        assert_eq!(installer.history().len(), 2);
    }
}
