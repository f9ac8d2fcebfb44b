//! 단편과 시퀀스 공간 정의
//!
//! - Logical message: 상위 계층이 한 번에 만드는 불투명 바이트열
//! - Fragment: 메시지 일부 + 10바이트 위치 헤더를 담은 데이터그램 하나
//!
//! 와이어 포맷 (빅엔디언): `[sequence:u32][offset:u16][total_length:u32][payload]`

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::DecodeError;
use crate::{HEADER_SIZE, SEQUENCE_LIMIT};

/// 순환 시퀀스 공간 `[start, 2^30)`
///
/// 시퀀스 비교는 항상 이 타입을 거친다. 단순 뺄셈은 랩어라운드 경계에서
/// 부호가 뒤집힌다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceSpace {
    start: u32,
}

impl SequenceSpace {
    /// `start`는 [`Config::validate`](crate::Config::validate)에서 검증된 값이어야 함
    pub fn new(start: u32) -> Self {
        Self {
            start: start.min(SEQUENCE_LIMIT - 2),
        }
    }

    /// 공간의 첫 시퀀스
    pub fn start(&self) -> u32 {
        self.start
    }

    /// 공간에 속한 시퀀스 개수 (검증된 공간은 최소 2)
    pub fn size(&self) -> u32 {
        SEQUENCE_LIMIT - self.start
    }

    pub fn contains(&self, seq: u32) -> bool {
        (self.start..SEQUENCE_LIMIT).contains(&seq)
    }

    /// 다음 시퀀스 (상한에 닿으면 0이 아니라 `start`로)
    pub fn next(&self, seq: u32) -> u32 {
        if seq + 1 >= SEQUENCE_LIMIT {
            self.start
        } else {
            seq + 1
        }
    }

    /// `from`에서 `to`까지 앞으로 센 거리
    pub fn forward(&self, from: u32, to: u32) -> u32 {
        let len = i64::from(self.size());
        (i64::from(to) - i64::from(from)).rem_euclid(len) as u32
    }

    /// 양방향 중 짧은 쪽 거리
    pub fn distance(&self, a: u32, b: u32) -> u32 {
        let forward = self.forward(a, b);
        forward.min(self.size() - forward)
    }

    /// `seq`가 `reference`와 같거나 그 이후인지 (반 바퀴 기준)
    pub fn is_at_or_after(&self, seq: u32, reference: u32) -> bool {
        self.forward(reference, seq) <= self.size() / 2
    }

    /// `seq`가 `reference` 이후인지
    pub fn is_after(&self, seq: u32, reference: u32) -> bool {
        seq != reference && self.is_at_or_after(seq, reference)
    }
}

/// 단편 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// 메시지 시퀀스 (메시지당 하나)
    pub sequence: u32,

    /// 이 단편 앞까지 이미 보낸 바이트 수
    pub offset: u16,

    /// 전체 메시지 길이
    pub total_length: u32,
}

impl FragmentHeader {
    pub fn new(sequence: u32, offset: u16, total_length: u32) -> Self {
        Self {
            sequence,
            offset,
            total_length,
        }
    }

    /// 헤더를 버퍼에 기록
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.sequence);
        buf.put_u16(self.offset);
        buf.put_u32(self.total_length);
    }

    /// 헤더 파싱
    pub fn decode(mut bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_SIZE {
            return Err(DecodeError::HeaderTooShort { len: bytes.len() });
        }

        Ok(Self {
            sequence: bytes.get_u32(),
            offset: bytes.get_u16(),
            total_length: bytes.get_u32(),
        })
    }
}

/// 단편 (송신 데이터그램 단위)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub header: FragmentHeader,
    pub payload: Bytes,
}

impl Fragment {
    pub fn new(header: FragmentHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// 정렬 키 `(sequence, offset)`
    pub fn key(&self) -> (u32, u16) {
        (self.header.sequence, self.header.offset)
    }

    /// 데이터그램 길이
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// 데이터그램으로 직렬화
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.header.encode(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// 데이터그램에서 역직렬화
    ///
    /// 구조적 검사만 수행한다 (헤더 길이, 페이로드가 `total_length`를 넘는지).
    /// 시퀀스 범위와 크기 한도는 재조립기가 설정에 맞춰 확인한다.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let header = FragmentHeader::decode(bytes)?;
        let payload = &bytes[HEADER_SIZE..];

        let end = u64::from(header.offset) + payload.len() as u64;
        if end > u64::from(header.total_length) {
            return Err(DecodeError::FragmentOverrun {
                offset: header.offset,
                len: payload.len(),
                total_length: header.total_length,
            });
        }

        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

/// 단편 생성기 (송신측)
#[derive(Debug, Clone)]
pub struct FragmentBuilder {
    payload_capacity: usize,
}

impl FragmentBuilder {
    /// `payload_capacity`는 `chunk_size - HEADER_SIZE`
    pub fn new(payload_capacity: usize) -> Self {
        Self {
            payload_capacity: payload_capacity.max(1),
        }
    }

    pub fn payload_capacity(&self) -> usize {
        self.payload_capacity
    }

    /// 이 메시지를 16비트 offset으로 주소 지정할 수 있는지
    pub fn fits(&self, len: usize) -> bool {
        let last_offset = len.saturating_sub(1) / self.payload_capacity * self.payload_capacity;
        last_offset <= u16::MAX as usize && len <= u32::MAX as usize
    }

    /// 메시지를 단편들로 분할
    ///
    /// 빈 메시지도 헤더만 있는 단편 하나를 만든다. 시퀀스를 소비한 메시지는
    /// 반드시 와이어에 나타나야 수신측이 빈 시퀀스를 기다리지 않는다.
    /// 호출자는 먼저 [`fits`](Self::fits)로 크기를 확인해야 한다.
    pub fn split(&self, sequence: u32, message: &[u8]) -> Vec<Fragment> {
        let total_length = message.len() as u32;

        if message.is_empty() {
            return vec![Fragment::new(
                FragmentHeader::new(sequence, 0, 0),
                Bytes::new(),
            )];
        }

        message
            .chunks(self.payload_capacity)
            .enumerate()
            .map(|(idx, data)| {
                let offset = idx * self.payload_capacity;
                Fragment::new(
                    FragmentHeader::new(sequence, offset as u16, total_length),
                    Bytes::copy_from_slice(data),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut buf = BytesMut::new();
        FragmentHeader::new(0x0102_0304, 0x0506, 0x0708_090A).encode(&mut buf);

        assert_eq!(
            buf.as_ref(),
            &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A]
        );
    }

    #[test]
    fn test_fragment_serialization() {
        let fragment = Fragment::new(
            FragmentHeader::new(7, 1000, 1005),
            Bytes::from_static(&[1, 2, 3, 4, 5]),
        );

        let bytes = fragment.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE + 5);

        let restored = Fragment::from_bytes(&bytes).unwrap();
        assert_eq!(restored, fragment);
        assert_eq!(restored.key(), (7, 1000));
    }

    #[test]
    fn test_decode_rejects_short_and_overrun() {
        assert_eq!(
            Fragment::from_bytes(&[0u8; 9]),
            Err(DecodeError::HeaderTooShort { len: 9 })
        );

        let overrun = Fragment::new(
            FragmentHeader::new(1, 10, 12),
            Bytes::from_static(&[0; 5]),
        );
        assert!(matches!(
            Fragment::from_bytes(&overrun.to_bytes()),
            Err(DecodeError::FragmentOverrun { .. })
        ));
    }

    #[test]
    fn test_split_offsets() {
        let builder = FragmentBuilder::new(1000);
        let data: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        let fragments = builder.split(42, &data);

        let offsets: Vec<u16> = fragments.iter().map(|f| f.header.offset).collect();
        assert_eq!(offsets, vec![0, 1000, 2000, 3000, 4000]);
        assert!(fragments.iter().all(|f| f.header.sequence == 42));
        assert!(fragments.iter().all(|f| f.header.total_length == 5000));

        let joined: Vec<u8> = fragments
            .iter()
            .flat_map(|f| f.payload.iter().copied())
            .collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn test_split_empty_message() {
        let fragments = FragmentBuilder::new(1014).split(3, &[]);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].header, FragmentHeader::new(3, 0, 0));
        assert!(fragments[0].payload.is_empty());
    }

    #[test]
    fn test_fits_offset_range() {
        let builder = FragmentBuilder::new(1000);
        // 마지막 offset 65000
        assert!(builder.fits(66_000));
        // 마지막 offset 66000 > u16::MAX
        assert!(!builder.fits(66_001));
        assert!(builder.fits(0));
    }

    #[test]
    fn test_sequence_wraps_to_start() {
        let space = SequenceSpace::new(100);
        assert_eq!(space.next(SEQUENCE_LIMIT - 1), 100);
        assert_eq!(space.next(100), 101);
        assert!(!space.contains(99));
        assert!(!space.contains(SEQUENCE_LIMIT));
        assert_eq!(space.size(), SEQUENCE_LIMIT - 100);
    }

    #[test]
    fn test_cyclic_distance_across_wrap() {
        let space = SequenceSpace::new(0);
        let last = SEQUENCE_LIMIT - 1;

        assert_eq!(space.forward(last, 0), 1);
        assert_eq!(space.distance(last, 2), 3);
        assert_eq!(space.distance(2, last), 3);
        assert!(space.is_after(1, last));
        assert!(!space.is_after(last, 1));
        assert!(space.is_at_or_after(5, 5));
        assert!(!space.is_after(5, 5));
    }

    #[test]
    fn test_distance_symmetric() {
        let space = SequenceSpace::new(10);
        for (a, b) in [(10, 20), (SEQUENCE_LIMIT - 5, 12), (500, 400)] {
            assert_eq!(space.distance(a, b), space.distance(b, a));
        }
        assert_eq!(space.distance(SEQUENCE_LIMIT - 1, 10), 1);
    }
}
