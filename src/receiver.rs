//! 수신자 (소켓 루프)
//!
//! UDP 소켓에서 데이터그램을 읽어 [`Reassembler`]에 넣고, 완성된 메시지를
//! 하나씩 꺼내준다. 타임아웃은 호출자가 `tokio::time::timeout`으로 감싼다.

use std::collections::VecDeque;
use std::net::SocketAddr;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{info, warn};

use crate::reassembler::Reassembler;
use crate::stats::ReassemblyStats;
use crate::{Config, Result};

/// 수신 버퍼 크기. 청크 크기보다 큰 데이터그램도 잘리지 않고 읽혀야 폐기 판정이 가능
const RECV_BUFFER_SIZE: usize = 65536;

/// 단편 수신자
pub struct FragmentReceiver {
    socket: UdpSocket,
    reassembler: Reassembler,

    /// 한 번의 `feed`에서 여러 메시지가 완성될 수 있으므로 보관
    ready: VecDeque<Bytes>,

    buf: Vec<u8>,
}

impl FragmentReceiver {
    /// 주소에 바인드하고 수신자 생성
    pub async fn bind(config: Config, bind_addr: SocketAddr) -> Result<Self> {
        let reassembler = Reassembler::new(config)?;
        let socket = UdpSocket::bind(bind_addr).await?;

        info!("FastDump receiver started on {}", socket.local_addr()?);

        Ok(Self::with_socket(socket, reassembler))
    }

    /// 이미 열린 소켓으로 생성
    pub fn with_socket(socket: UdpSocket, reassembler: Reassembler) -> Self {
        Self {
            socket,
            reassembler,
            ready: VecDeque::new(),
            buf: vec![0u8; RECV_BUFFER_SIZE],
        }
    }

    /// 다음 완성 메시지 수신
    ///
    /// 소켓 에러는 재시도 없이 반환한다. 재오픈 여부는 호출자가 결정.
    pub async fn recv(&mut self) -> Result<Bytes> {
        loop {
            if let Some(message) = self.ready.pop_front() {
                return Ok(message);
            }

            let (len, _addr) = match self.socket.recv_from(&mut self.buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("수신 에러: {}", e);
                    return Err(e.into());
                }
            };

            self.ready.extend(self.reassembler.feed(&self.buf[..len]));
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    /// 통계 반환
    pub fn stats(&self) -> ReassemblyStats {
        self.reassembler.stats()
    }
}
