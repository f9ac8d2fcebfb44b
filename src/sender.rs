//! 송신자
//!
//! - 메시지당 시퀀스 하나 할당 (순환 공간)
//! - 청크 단위 데이터그램 전송, ACK/재전송 없음

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::fragment::{Fragment, FragmentBuilder, SequenceSpace};
use crate::metrics;
use crate::stats::SenderStats;
use crate::{Config, Error, Result};

/// 단편 송신자
///
/// 흐름 하나를 담당한다. 전송은 fire-and-forget: 청크마다 소켓 쓰기 한 번.
#[derive(Debug)]
pub struct FragmentSender {
    config: Config,
    space: SequenceSpace,
    builder: FragmentBuilder,

    /// 다음 메시지에 할당할 시퀀스
    next_sequence: u32,

    stats: SenderStats,
}

impl FragmentSender {
    /// 새 송신자 생성
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            space: SequenceSpace::new(config.seq_start),
            builder: FragmentBuilder::new(config.payload_capacity()),
            next_sequence: config.seq_start,
            stats: SenderStats::new(),
            config,
        })
    }

    /// 메시지를 단편으로 분할하고 시퀀스 할당
    ///
    /// 16비트 offset으로 주소 지정할 수 없는 메시지는 시퀀스를 소비하기 전에 거부한다.
    pub fn fragment(&mut self, message: &[u8]) -> Result<Vec<Fragment>> {
        if !self.builder.fits(message.len()) {
            self.stats.rejected += 1;
            return Err(Error::MessageTooLarge {
                len: message.len(),
                max: self.config.max_sendable_size(),
            });
        }

        let sequence = self.next_sequence;
        self.next_sequence = self.space.next(sequence);

        Ok(self.builder.split(sequence, message))
    }

    /// 메시지 전송
    ///
    /// 채널 에러는 재시도하지 않고 그대로 반환한다. 일부 단편만 나간 경우에도
    /// 시퀀스는 이미 소비되었으며 수신측은 이를 손실로 처리한다.
    pub async fn send(
        &mut self,
        message: &[u8],
        socket: &UdpSocket,
        dest: SocketAddr,
    ) -> Result<u32> {
        let fragments = self.fragment(message)?;
        let sequence = fragments
            .first()
            .map(|f| f.header.sequence)
            .unwrap_or(self.config.seq_start);

        for fragment in &fragments {
            let datagram: Bytes = fragment.to_bytes();
            if let Err(e) = socket.send_to(&datagram, dest).await {
                warn!("단편 전송 실패: seq={}, {}", sequence, e);
                return Err(e.into());
            }

            self.stats.fragments += 1;
            self.stats.wire_bytes += datagram.len() as u64;
        }

        self.stats.messages += 1;
        self.stats.payload_bytes += message.len() as u64;
        metrics::inc_fragments_sent(fragments.len() as u64);

        debug!(
            "메시지 {} 전송: {} bytes, {} 단편",
            sequence,
            message.len(),
            fragments.len()
        );

        Ok(sequence)
    }

    /// 다음에 할당될 시퀀스
    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 통계 반환
    pub fn stats(&self) -> SenderStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SEQUENCE_LIMIT;

    #[test]
    fn test_one_sequence_per_message() {
        let mut sender = FragmentSender::new(Config::default()).unwrap();

        let first = sender.fragment(&[0u8; 3000]).unwrap();
        let second = sender.fragment(&[1u8; 10]).unwrap();

        assert_eq!(first.len(), 3);
        assert!(first.iter().all(|f| f.header.sequence == 0));
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].header.sequence, 1);
        assert!(first.iter().all(|f| f.wire_len() <= 1024));
    }

    #[test]
    fn test_sequence_wraps_to_seq_start() {
        let config = Config {
            seq_start: 7,
            ..Config::default()
        };
        let mut sender = FragmentSender::new(config).unwrap();
        sender.next_sequence = SEQUENCE_LIMIT - 1;

        assert_eq!(sender.fragment(b"a").unwrap()[0].header.sequence, SEQUENCE_LIMIT - 1);
        assert_eq!(sender.fragment(b"b").unwrap()[0].header.sequence, 7);
    }

    #[test]
    fn test_oversized_message_keeps_sequence() {
        let config = Config {
            chunk_size: 1010,
            ..Config::default()
        };
        let mut sender = FragmentSender::new(config).unwrap();

        let err = sender.fragment(&vec![0u8; 66_001]).unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge { len: 66_001, max: 66_000 }));
        assert_eq!(sender.next_sequence(), 0);
        assert_eq!(sender.stats().rejected, 1);

        assert_eq!(sender.fragment(&vec![0u8; 66_000]).unwrap().len(), 66);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = Config {
            chunk_size: 4,
            ..Config::default()
        };
        assert!(matches!(FragmentSender::new(config), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_send_over_loopback() {
        let rx = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let tx = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = rx.local_addr().unwrap();

        let mut sender = FragmentSender::new(Config::default()).unwrap();
        let seq = sender.send(&[9u8; 2500], &tx, dest).await.unwrap();
        assert_eq!(seq, 0);

        let mut buf = vec![0u8; 2048];
        let mut offsets = Vec::new();
        for _ in 0..3 {
            let (len, _) = rx.recv_from(&mut buf).await.unwrap();
            let fragment = Fragment::from_bytes(&buf[..len]).unwrap();
            assert_eq!(fragment.header.total_length, 2500);
            offsets.push(fragment.header.offset);
        }
        offsets.sort_unstable();
        assert_eq!(offsets, vec![0, 1014, 2028]);

        let stats = sender.stats();
        assert_eq!(stats.messages, 1);
        assert_eq!(stats.fragments, 3);
        assert_eq!(stats.wire_bytes, 2500 + 30);
    }
}
