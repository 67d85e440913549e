//! UDP 전송 계층
//!
//! 데이터그램 하나가 프레임 하나. 링크 세션과는 채널로만 연결된다.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{Result, FRAME_HEADER_SIZE};

/// 수신 버퍼 크기
const RECV_BUFFER_SIZE: usize = 65535;

/// 송신 큐 크기
const SEND_QUEUE: usize = 256;

/// 수신 데이터그램
#[derive(Debug, Clone)]
pub struct Datagram {
    pub peer: SocketAddr,
    pub payload: Bytes,
}

/// UDP 소켓 래퍼
#[derive(Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// 다음 데이터그램 수신
    ///
    /// 프레임 헤더보다 짧은 데이터그램은 버리고 계속 기다린다.
    pub async fn recv(&self) -> Result<Datagram> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let (len, peer) = self.socket.recv_from(&mut buf).await?;
            if len < FRAME_HEADER_SIZE {
                debug!("{} 에서 짧은 데이터그램 ({} bytes) 폐기", peer, len);
                continue;
            }
            return Ok(Datagram {
                peer,
                payload: Bytes::copy_from_slice(&buf[..len]),
            });
        }
    }

    /// `peer` 로 보내는 송신 태스크 시작
    ///
    /// 반환된 송신기가 모두 drop 되면 태스크도 끝난다.
    pub fn spawn_sender(&self, peer: SocketAddr) -> mpsc::Sender<Bytes> {
        let (tx, mut rx) = mpsc::channel::<Bytes>(SEND_QUEUE);
        let socket = self.socket.clone();

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = socket.send_to(&frame, peer).await {
                    warn!("{} 로 송신 실패: {}", peer, e);
                }
            }
            debug!("{} 송신 태스크 종료", peer);
        });

        tx
    }
}
