//! 디셰이핑
//!
//! 셰이핑 단위를 원래 메시지 순서대로 되돌린다. 압축 배치는 통째로 성공하거나
//! 통째로 실패한다. 실패 후에도 파이프는 다음 단위를 계속 처리할 수 있다.

use bytes::{Buf, Bytes};
use flate2::{Decompress, FlushDecompress, Status};
use tracing::{debug, trace};

use crate::error::DecodeError;
use crate::metrics;
use crate::output::Output;
use crate::shaper::ShapedUnit;
use crate::stats::DeshapingStats;
use crate::{COMPRESSED_MARKER, RAW_MARKER};

/// 레코드 길이 접두어 크기
const RECORD_PREFIX: usize = 4;

/// 디셰이핑 파이프
#[derive(Debug, Default)]
pub struct DeshapingPipe {
    stats: DeshapingStats,
}

impl DeshapingPipe {
    pub fn new() -> Self {
        Self::default()
    }

    /// 와이어 포맷 단위 하나 처리
    pub fn process(&mut self, unit: &[u8]) -> Result<Output<Bytes>, DecodeError> {
        let result = match unit.split_first() {
            None => Err(DecodeError::EmptyUnit),
            Some((&RAW_MARKER, payload)) => {
                Ok((RAW_MARKER, Output::One(Bytes::copy_from_slice(payload))))
            }
            Some((&COMPRESSED_MARKER, payload)) => {
                decode_batch(payload).map(|out| (COMPRESSED_MARKER, out))
            }
            Some((&other, _)) => Err(DecodeError::UnknownMarker(other)),
        };
        self.record(result)
    }

    /// 이미 파싱된 단위 처리
    pub fn process_unit(&mut self, unit: &ShapedUnit) -> Result<Output<Bytes>, DecodeError> {
        let result = match unit {
            ShapedUnit::Raw(payload) => Ok((RAW_MARKER, Output::One(payload.clone()))),
            ShapedUnit::Compressed(payload) => {
                decode_batch(payload).map(|out| (COMPRESSED_MARKER, out))
            }
        };
        self.record(result)
    }

    /// 통계 반환
    pub fn stats(&self) -> DeshapingStats {
        self.stats.clone()
    }

    fn record(
        &mut self,
        result: Result<(u8, Output<Bytes>), DecodeError>,
    ) -> Result<Output<Bytes>, DecodeError> {
        self.stats.units += 1;

        match result {
            Ok((marker, out)) => {
                if marker == RAW_MARKER {
                    self.stats.raw_units += 1;
                } else {
                    self.stats.compressed_units += 1;
                }
                self.stats.messages += out.len() as u64;
                trace!("단위 복원: marker={:#04x}, {} 메시지", marker, out.len());
                Ok(out)
            }
            Err(e) => {
                self.stats.decode_errors += 1;
                metrics::inc_deshape_errors();
                debug!("단위 디코드 실패: {}", e);
                Err(e)
            }
        }
    }
}

/// 압축 배치를 풀고 레코드로 분할
fn decode_batch(payload: &[u8]) -> Result<Output<Bytes>, DecodeError> {
    let data = inflate(payload)?;
    split_records(Bytes::from(data))
}

/// zlib 스트림 전체 해제
///
/// 스트림 끝 표시까지 도달해야 성공이다. 입력이 먼저 끝나면 `TruncatedBatch`,
/// 끝 표시 뒤에 남는 바이트가 있으면 `TrailingData`.
fn inflate(payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut inflater = Decompress::new(true);
    let mut out = Vec::with_capacity(payload.len().saturating_mul(4).max(1024));

    loop {
        if out.len() == out.capacity() {
            out.reserve(out.capacity());
        }

        let consumed = inflater.total_in() as usize;
        let produced = inflater.total_out();

        let status = inflater
            .decompress_vec(&payload[consumed..], &mut out, FlushDecompress::Finish)
            .map_err(|e| DecodeError::CorruptBatch(e.to_string()))?;

        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => {
                let stalled = inflater.total_in() as usize == consumed
                    && inflater.total_out() == produced;
                if stalled && out.len() < out.capacity() {
                    return Err(DecodeError::TruncatedBatch);
                }
            }
        }
    }

    if (inflater.total_in() as usize) < payload.len() {
        return Err(DecodeError::TrailingData);
    }

    Ok(out)
}

/// `[len:u32 BE][bytes]` 레코드 나열 분할
///
/// 레코드 하나라도 잘려 있으면 배치 전체를 거부한다.
fn split_records(data: Bytes) -> Result<Output<Bytes>, DecodeError> {
    let mut messages = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let available = data.len() - pos;
        if available < RECORD_PREFIX {
            return Err(DecodeError::TruncatedRecord {
                offset: pos,
                needed: RECORD_PREFIX,
                available,
            });
        }

        let len = (&data[pos..pos + RECORD_PREFIX]).get_u32() as usize;
        let start = pos + RECORD_PREFIX;
        let available = data.len() - start;
        if len > available {
            return Err(DecodeError::TruncatedRecord {
                offset: pos,
                needed: len,
                available,
            });
        }

        messages.push(data.slice(start..start + len));
        pos = start + len;
    }

    Ok(Output::from(messages))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use rstest::rstest;

    use super::*;

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn records(messages: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for m in messages {
            out.extend_from_slice(&(m.len() as u32).to_be_bytes());
            out.extend_from_slice(m);
        }
        out
    }

    fn compressed_unit(messages: &[&[u8]]) -> Vec<u8> {
        let mut unit = vec![COMPRESSED_MARKER];
        unit.extend(zlib(&records(messages)));
        unit
    }

    #[test]
    fn test_raw_unit() {
        let mut pipe = DeshapingPipe::new();
        let out = pipe.process(&[RAW_MARKER, 1, 2, 3]).unwrap();
        assert_eq!(out, Output::One(Bytes::from_static(&[1, 2, 3])));

        // 빈 RAW 단위는 빈 메시지 하나
        let out = pipe.process(&[RAW_MARKER]).unwrap();
        assert_eq!(out, Output::One(Bytes::new()));
    }

    #[test]
    fn test_compressed_batch_preserves_order() {
        let messages: [&[u8]; 4] = [b"alpha", b"", b"gamma gamma", &[0u8; 5000][..]];
        let mut pipe = DeshapingPipe::new();

        let out = pipe.process(&compressed_unit(&messages)).unwrap().into_vec();
        assert_eq!(out.len(), 4);
        for (got, want) in out.iter().zip(messages.iter()) {
            assert_eq!(got.as_ref(), *want);
        }

        let stats = pipe.stats();
        assert_eq!(stats.compressed_units, 1);
        assert_eq!(stats.messages, 4);
    }

    #[test]
    fn test_large_expansion() {
        // 압축률이 매우 높아 출력 버퍼를 여러 번 늘려야 하는 경우
        let big = vec![7u8; 1 << 20];
        let mut pipe = DeshapingPipe::new();
        let out = pipe.process(&compressed_unit(&[big.as_slice()])).unwrap();
        assert_eq!(out, Output::One(Bytes::from(big)));
    }

    #[test]
    fn test_single_record_batch() {
        let mut pipe = DeshapingPipe::new();
        let out = pipe.process(&compressed_unit(&[&b"solo"[..]])).unwrap();
        assert_eq!(out, Output::One(Bytes::from_static(b"solo")));
    }

    #[test]
    fn test_truncated_stream() {
        let unit = compressed_unit(&[&b"some message that compresses"[..], &[3u8; 4000][..]]);
        let mut pipe = DeshapingPipe::new();

        for cut in [1, 2, unit.len() / 2, unit.len() - 1] {
            let err = pipe.process(&unit[..cut]).unwrap_err();
            assert!(
                matches!(err, DecodeError::TruncatedBatch | DecodeError::CorruptBatch(_)),
                "cut={} err={:?}",
                cut,
                err
            );
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut unit = compressed_unit(&[&b"abc"[..]]);
        unit.extend_from_slice(b"extra");
        assert_eq!(
            DeshapingPipe::new().process(&unit),
            Err(DecodeError::TrailingData)
        );
    }

    #[test]
    fn test_corrupt_stream() {
        let unit = [COMPRESSED_MARKER, 0xde, 0xad, 0xbe, 0xef, 0x00, 0x11];
        assert!(matches!(
            DeshapingPipe::new().process(&unit),
            Err(DecodeError::CorruptBatch(_))
        ));
    }

    #[rstest]
    #[case(&[0, 0, 0], 0, 4, 3)]
    #[case(&[0, 0, 0, 9, 1, 2], 0, 9, 2)]
    #[case(&[0, 0, 0, 1, 0xaa, 0, 0], 5, 4, 2)]
    fn test_truncated_record(
        #[case] inner: &[u8],
        #[case] offset: usize,
        #[case] needed: usize,
        #[case] available: usize,
    ) {
        let mut unit = vec![COMPRESSED_MARKER];
        unit.extend(zlib(inner));
        assert_eq!(
            DeshapingPipe::new().process(&unit),
            Err(DecodeError::TruncatedRecord {
                offset,
                needed,
                available
            })
        );
    }

    #[test]
    fn test_unknown_marker_and_empty_unit() {
        let mut pipe = DeshapingPipe::new();
        assert_eq!(pipe.process(&[]), Err(DecodeError::EmptyUnit));
        assert_eq!(pipe.process(&[0x02, 1]), Err(DecodeError::UnknownMarker(0x02)));
        assert_eq!(pipe.stats().decode_errors, 2);
    }

    #[test]
    fn test_usable_after_error() {
        let mut pipe = DeshapingPipe::new();
        assert!(pipe.process(&[COMPRESSED_MARKER]).is_err());

        let out = pipe.process(&compressed_unit(&[&b"ok"[..]])).unwrap();
        assert_eq!(out, Output::One(Bytes::from_static(b"ok")));

        let stats = pipe.stats();
        assert_eq!(stats.units, 2);
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.messages, 1);
    }

    #[test]
    fn test_process_unit_matches_wire() {
        let unit = ShapedUnit::Compressed(Bytes::from(zlib(&records(&[&b"x"[..], &b"yz"[..]]))));
        let mut pipe = DeshapingPipe::new();
        let typed = pipe.process_unit(&unit).unwrap();
        let wire = pipe.process(&unit.to_bytes()).unwrap();
        assert_eq!(typed, wire);
    }
}
