//! 적응형 셰이핑
//!
//! 측정 처리율에 따라 메시지별 출력 정책을 고른다.
//! - 처리율 <= low watermark: 원본 통과 (`RAW`)
//! - low < 처리율 <= high: 길이 접두어 레코드로 zlib 배치 압축 (`COMPRESSED`)
//! - 처리율 > high: 드롭
//!
//! 재평가는 윈도우 바이트가 설정치를 넘을 때만 한다. 짧은 표본으로 모드가
//! 출렁이지 않도록 하는 평활화.
//!
//! 셰이핑 단위 와이어 포맷: `[marker:u8][payload]`, `0x00 = RAW`, `0x01 = COMPRESSED`

use std::io::Write;
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::{debug, info, warn};

use crate::config::ShapingConfig;
use crate::error::DecodeError;
use crate::metrics;
use crate::output::Output;
use crate::stats::ShapingStats;
use crate::{Error, Result, COMPRESSED_MARKER, RAW_MARKER};

/// 셰이핑 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeMode {
    PassThrough,
    Compress,
    Drop,
}

/// 셰이핑 출력 단위
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapedUnit {
    /// 원본 메시지
    Raw(Bytes),

    /// `{len:u32 BE, bytes}` 레코드 나열을 zlib으로 압축한 배치
    Compressed(Bytes),
}

impl ShapedUnit {
    pub fn marker(&self) -> u8 {
        match self {
            ShapedUnit::Raw(_) => RAW_MARKER,
            ShapedUnit::Compressed(_) => COMPRESSED_MARKER,
        }
    }

    pub fn payload(&self) -> &Bytes {
        match self {
            ShapedUnit::Raw(payload) | ShapedUnit::Compressed(payload) => payload,
        }
    }

    /// 메트릭 레이블
    pub fn kind(&self) -> &'static str {
        match self {
            ShapedUnit::Raw(_) => "raw",
            ShapedUnit::Compressed(_) => "compressed",
        }
    }

    /// 와이어 포맷으로 직렬화
    pub fn to_bytes(&self) -> Bytes {
        let payload = self.payload();
        let mut buf = BytesMut::with_capacity(1 + payload.len());
        buf.put_u8(self.marker());
        buf.put_slice(payload);
        buf.freeze()
    }

    /// 와이어 포맷에서 역직렬화 (압축 해제는 하지 않음)
    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, DecodeError> {
        let (&marker, payload) = bytes.split_first().ok_or(DecodeError::EmptyUnit)?;
        let payload = Bytes::copy_from_slice(payload);

        match marker {
            RAW_MARKER => Ok(ShapedUnit::Raw(payload)),
            COMPRESSED_MARKER => Ok(ShapedUnit::Compressed(payload)),
            other => Err(DecodeError::UnknownMarker(other)),
        }
    }
}

/// 레코드 길이 접두어 크기
const RECORD_PREFIX: u64 = 4;

/// zlib 헤더(2) + adler32(4) + 마지막 빈 블록과 sync 마커 여유
const STREAM_OVERHEAD: u64 = 16;

/// deflate 최악 확장: 압축이 안 되면 stored 블록마다 5바이트가 붙음
fn deflate_bound(len: u64) -> u64 {
    len + 5 * (len / 16_384 + 2)
}

/// 압축 중인 배치
struct Batch {
    encoder: ZlibEncoder<Vec<u8>>,
    messages: u64,
    input_bytes: u64,

    /// 마지막 sync flush 시점의 출력 길이 (정확한 값)
    synced_out: u64,

    /// 마지막 sync flush 이후 입력 바이트
    unsynced_in: u64,
}

impl Batch {
    fn new() -> Self {
        Self {
            encoder: ZlibEncoder::new(Vec::new(), Compression::default()),
            messages: 0,
            input_bytes: 0,
            synced_out: 0,
            unsynced_in: 0,
        }
    }

    /// 레코드 하나를 더 넣고 마무리했을 때의 출력 길이 상한
    fn projected(&self, record: u64) -> u64 {
        self.synced_out + deflate_bound(self.unsynced_in + record) + STREAM_OVERHEAD
    }

    /// 압축기 내부에 머문 출력을 밀어내 출력 길이를 확정
    fn sync(&mut self) -> Result<()> {
        self.encoder.flush()?;
        self.synced_out = self.encoder.get_ref().len() as u64;
        self.unsynced_in = 0;
        Ok(())
    }

    fn append(&mut self, message: &[u8]) -> Result<()> {
        let len = u32::try_from(message.len()).map_err(|_| Error::MessageTooLarge {
            len: message.len(),
            max: u32::MAX as usize,
        })?;

        self.encoder.write_all(&len.to_be_bytes())?;
        self.encoder.write_all(message)?;
        self.messages += 1;
        self.input_bytes += RECORD_PREFIX + message.len() as u64;
        self.unsynced_in += RECORD_PREFIX + message.len() as u64;
        Ok(())
    }
}

/// 셰이핑 파이프
///
/// 흐름 하나를 담당한다. I/O 없음, 블로킹 없음. 시간 의존은 처리율 측정뿐이며
/// 테스트나 재생을 위해 [`process_at`](Self::process_at)으로 시각을 주입할 수 있다.
pub struct ShapingPipe {
    config: ShapingConfig,

    /// 재평가 윈도우 (None이면 윈도우 계산 비활성화)
    window: Option<u64>,

    mode: ShapeMode,
    window_bytes: u64,
    window_start: Instant,

    /// `Compress` 모드에서만 존재
    batch: Option<Batch>,

    /// 셰이핑 단위 하나의 최대 와이어 크기 (마커 포함)
    unit_limit: Option<usize>,

    stats: ShapingStats,
}

impl ShapingPipe {
    /// 새 셰이핑 파이프 생성
    pub fn new(config: ShapingConfig) -> Result<Self> {
        Self::starting_at(config, Instant::now())
    }

    /// 첫 윈도우 시작 시각을 지정해 생성
    pub fn starting_at(config: ShapingConfig, now: Instant) -> Result<Self> {
        config.validate()?;

        let window = config.effective_window();
        if let Some(window) = window {
            info!(
                "셰이핑 활성화: lwm={:.2} MiB/s, hwm={:.2} MiB/s, window={:.2} MiB",
                mib(config.low_watermark as f64),
                mib(config.high_watermark as f64),
                mib(window as f64)
            );
        }

        Ok(Self {
            config,
            window,
            mode: ShapeMode::PassThrough,
            window_bytes: 0,
            window_start: now,
            batch: None,
            unit_limit: None,
            stats: ShapingStats::new(),
        })
    }

    /// 셰이핑 단위 크기 상한 설정
    ///
    /// 압축 배치가 이 크기를 넘기 전에 윈도우 재평가를 기다리지 않고 플러시한다.
    /// 보통 [`Config::max_sendable_size`](crate::Config::max_sendable_size)를 넘긴다.
    pub fn with_unit_limit(mut self, limit: usize) -> Self {
        self.unit_limit = Some(limit);
        self
    }

    /// 메시지 하나 처리
    pub fn process(&mut self, message: &[u8]) -> Result<Output<ShapedUnit>> {
        self.process_at(message, Instant::now())
    }

    /// 주어진 시각 기준으로 메시지 하나 처리
    ///
    /// 지금 내보낼 단위는 최대 둘이다: 압축 모드를 벗어나며 나오는 배치 플러시,
    /// 그리고 이 메시지의 RAW 단위. 플러시가 먼저 온다.
    pub fn process_at(&mut self, message: &[u8], now: Instant) -> Result<Output<ShapedUnit>> {
        let mut out = Output::Empty;
        self.stats.messages_in += 1;
        self.stats.bytes_in += message.len() as u64;

        if let Some(window) = self.window {
            if self.window_bytes > window {
                self.evaluate(now, &mut out)?;
            }
        }

        match self.mode {
            ShapeMode::PassThrough => {
                self.stats.raw_units += 1;
                metrics::inc_shaped_units("raw");
                out.push(ShapedUnit::Raw(Bytes::copy_from_slice(message)));
            }
            ShapeMode::Drop => {
                self.stats.dropped_messages += 1;
                metrics::inc_shaper_dropped(1);
            }
            ShapeMode::Compress => {
                if let Some(unit) = self.append(message)? {
                    out.push(unit);
                }
            }
        }

        if self.window.is_some() {
            self.window_bytes += message.len() as u64;
        }

        Ok(out)
    }

    /// 흐름 종료 시 대기 중인 배치 플러시
    pub fn finish(&mut self) -> Result<Option<ShapedUnit>> {
        self.flush()
    }

    /// 현재 모드
    pub fn mode(&self) -> ShapeMode {
        self.mode
    }

    /// 실제 적용 중인 윈도우 크기
    pub fn window(&self) -> Option<u64> {
        self.window
    }

    pub fn config(&self) -> &ShapingConfig {
        &self.config
    }

    /// 통계 반환
    pub fn stats(&self) -> ShapingStats {
        self.stats.clone()
    }

    /// 윈도우 처리율로 모드 재평가
    fn evaluate(&mut self, now: Instant, out: &mut Output<ShapedUnit>) -> Result<()> {
        let elapsed = now.saturating_duration_since(self.window_start).as_secs_f64();
        let rate = if elapsed > 0.0 {
            self.window_bytes as f64 / elapsed
        } else {
            f64::INFINITY
        };

        self.stats.evaluations += 1;
        self.stats.last_rate = rate;

        let previous = self.mode;
        let high = self.config.high_watermark;
        let low = self.config.low_watermark;

        if high != 0 && rate > high as f64 {
            if previous != ShapeMode::Drop {
                warn!("hwm 초과로 드롭 시작 (rate: {:.2} MiB/s)", mib(rate));
                self.stats.drop_events += 1;
            }

            // 드롭 구간 너머로 이전 배치가 새어 나가지 않도록 폐기
            if let Some(batch) = self.batch.take() {
                self.stats.dropped_messages += batch.messages;
                metrics::inc_shaper_dropped(batch.messages);
            }
            self.mode = ShapeMode::Drop;
        } else {
            if let Some(unit) = self.flush()? {
                out.push(unit);
            }

            self.mode = if low != 0 && rate > low as f64 {
                ShapeMode::Compress
            } else {
                ShapeMode::PassThrough
            };
        }

        if previous != self.mode {
            debug!(
                "셰이핑 모드 변경: {:?} → {:?} (rate: {:.2} MiB/s)",
                previous,
                self.mode,
                mib(rate)
            );
        }

        self.window_bytes = 0;
        self.window_start = now;
        Ok(())
    }

    /// 배치에 메시지 추가. 크기 상한에 닿으면 기존 배치를 먼저 플러시해 반환
    fn append(&mut self, message: &[u8]) -> Result<Option<ShapedUnit>> {
        let mut flushed = None;

        if let Some(limit) = self.unit_limit {
            let cap = (limit as u64).saturating_sub(1);
            let record = RECORD_PREFIX + message.len() as u64;

            let full = match self.batch.as_mut() {
                Some(batch) if batch.messages > 0 && batch.projected(record) > cap => {
                    batch.sync()?;
                    batch.projected(record) > cap
                }
                _ => false,
            };

            if full {
                flushed = self.flush()?;
                self.stats.limit_flushes += 1;
            }
        }

        self.batch.get_or_insert_with(Batch::new).append(message)?;
        Ok(flushed)
    }

    fn flush(&mut self) -> Result<Option<ShapedUnit>> {
        let Some(batch) = self.batch.take() else {
            return Ok(None);
        };
        if batch.messages == 0 {
            return Ok(None);
        }

        let messages = batch.messages;
        let input_bytes = batch.input_bytes;
        let compressed = batch.encoder.finish()?;

        self.stats.compressed_units += 1;
        self.stats.compressed_messages += messages;
        self.stats.compressed_input_bytes += input_bytes;
        self.stats.compressed_output_bytes += compressed.len() as u64;
        metrics::inc_shaped_units("compressed");

        debug!(
            "배치 플러시: {} 메시지, {} → {} bytes",
            messages,
            input_bytes,
            compressed.len()
        );

        Ok(Some(ShapedUnit::Compressed(Bytes::from(compressed))))
    }
}

fn mib(bytes: f64) -> f64 {
    bytes / (1u64 << 20) as f64
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rstest::rstest;

    use super::*;
    use crate::{Config, DeshapingPipe};

    const MIB: u64 = 1 << 20;

    /// `rate` bytes/sec 속도로 `count`개의 `size` 바이트 메시지 공급
    fn feed_at_rate(
        pipe: &mut ShapingPipe,
        clock: &mut Instant,
        count: usize,
        size: usize,
        rate: f64,
        tag: u8,
    ) -> Vec<ShapedUnit> {
        let step = Duration::from_secs_f64(size as f64 / rate);
        let mut units = Vec::new();
        for i in 0..count {
            *clock += step;
            let message = vec![tag ^ (i as u8); size];
            units.extend(pipe.process_at(&message, *clock).unwrap());
        }
        units
    }

    fn scenario_config() -> ShapingConfig {
        ShapingConfig::new(MIB, 5 * MIB).with_window(2 * MIB)
    }

    #[test]
    fn test_disabled_is_pass_through() {
        let mut pipe = ShapingPipe::new(ShapingConfig::default()).unwrap();
        assert_eq!(pipe.window(), None);

        let start = Instant::now();
        for i in 0..100u64 {
            let out = pipe
                .process_at(&[0u8; 65536], start + Duration::from_nanos(i))
                .unwrap();
            assert_eq!(out, Output::One(ShapedUnit::Raw(Bytes::from(vec![0u8; 65536]))));
        }

        assert_eq!(pipe.mode(), ShapeMode::PassThrough);
        assert_eq!(pipe.window_bytes, 0);
        assert_eq!(pipe.stats().evaluations, 0);
    }

    #[test]
    fn test_below_low_watermark_stays_raw() {
        let mut clock = Instant::now();
        let mut pipe = ShapingPipe::starting_at(scenario_config(), clock).unwrap();

        let units = feed_at_rate(&mut pipe, &mut clock, 200, 65536, 0.5 * MIB as f64, 1);
        assert_eq!(units.len(), 200);
        assert!(units.iter().all(|u| matches!(u, ShapedUnit::Raw(_))));
        assert!(pipe.stats().evaluations > 0);
        assert_eq!(pipe.mode(), ShapeMode::PassThrough);
    }

    #[test]
    fn test_scenario_compress_then_flush_on_slowdown() {
        let mut clock = Instant::now();
        let mut pipe = ShapingPipe::starting_at(scenario_config(), clock).unwrap();

        // ~3 MiB/s: 33번째 메시지 이후 윈도우(2 MiB) 초과
        let units = feed_at_rate(&mut pipe, &mut clock, 33, 65536, 3.0 * MIB as f64, 0);
        assert_eq!(units.len(), 33);
        assert_eq!(pipe.mode(), ShapeMode::PassThrough);

        // 34번째에서 재평가 → 압축
        let compressed_tail =
            feed_at_rate(&mut pipe, &mut clock, 15, 65536, 3.0 * MIB as f64, 0x40);
        assert!(compressed_tail.is_empty());
        assert_eq!(pipe.mode(), ShapeMode::Compress);

        // 위에서 배치에 들어간 메시지
        let mut batched: Vec<Vec<u8>> = Vec::new();
        for i in 0..15u8 {
            batched.push(vec![0x40 ^ i; 65536]);
        }

        // 느려짐 → 다음 재평가에서 플러시 후 통과 모드
        let units = feed_at_rate(&mut pipe, &mut clock, 40, 65536, 0.25 * MIB as f64, 0x80);
        let flushes: Vec<&ShapedUnit> = units
            .iter()
            .filter(|u| matches!(u, ShapedUnit::Compressed(_)))
            .collect();
        assert_eq!(flushes.len(), 1);
        assert!(matches!(units[0], ShapedUnit::Compressed(_)));
        assert_eq!(pipe.mode(), ShapeMode::PassThrough);

        let mut deshaper = DeshapingPipe::new();
        let restored = deshaper.process(&units[0].to_bytes()).unwrap().into_vec();
        assert!(restored.len() >= batched.len());
        for (got, want) in restored.iter().zip(&batched) {
            assert_eq!(got.as_ref(), want.as_slice());
        }
    }

    #[test]
    fn test_scenario_exact_batch_contents() {
        let start = Instant::now();
        let mut pipe = ShapingPipe::starting_at(scenario_config(), start).unwrap();
        let size = 65536usize;
        let fast = Duration::from_secs_f64(size as f64 / (3.0 * MIB as f64));

        // 첫 윈도우: 33 메시지 RAW
        let mut t = start;
        for _ in 0..33 {
            t += fast;
            pipe.process_at(&vec![0u8; size], t).unwrap();
        }

        // 재평가 후 윈도우가 다시 찰 때까지 압축: 33 메시지
        let mut originals = Vec::new();
        for i in 0..33u32 {
            t += fast;
            let message: Vec<u8> = (0..size).map(|j| (j as u32 ^ i) as u8).collect();
            let out = pipe.process_at(&message, t).unwrap();
            assert!(out.is_empty());
            originals.push(message);
        }
        assert_eq!(pipe.mode(), ShapeMode::Compress);

        // 느린 구간에서 다음 재평가 → 플러시 + RAW
        let slow = t + Duration::from_secs(10);
        let out = pipe.process_at(b"late", slow).unwrap().into_vec();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1], ShapedUnit::Raw(Bytes::from_static(b"late")));

        let restored = DeshapingPipe::new().process(&out[0].to_bytes()).unwrap();
        let expected: Vec<Bytes> = originals.into_iter().map(Bytes::from).collect();
        assert_eq!(restored.into_vec(), expected);
    }

    #[test]
    fn test_above_high_watermark_drops_without_leak() {
        let mut clock = Instant::now();
        let mut pipe = ShapingPipe::starting_at(scenario_config(), clock).unwrap();

        // 압축 모드 진입 후 배치 일부 적재
        feed_at_rate(&mut pipe, &mut clock, 33, 65536, 3.0 * MIB as f64, 0);
        let units = feed_at_rate(&mut pipe, &mut clock, 10, 65536, 3.0 * MIB as f64, 1);
        assert!(units.is_empty());
        assert_eq!(pipe.mode(), ShapeMode::Compress);

        // 폭주 → 드롭: 어떤 단위도 나오지 않음
        let units = feed_at_rate(&mut pipe, &mut clock, 80, 65536, 20.0 * MIB as f64, 2);
        assert!(units.is_empty());
        assert_eq!(pipe.mode(), ShapeMode::Drop);

        // 회복: 이전 배치가 새어 나오지 않고 RAW만
        let units = feed_at_rate(&mut pipe, &mut clock, 80, 65536, 0.25 * MIB as f64, 3);
        assert!(!units.is_empty());
        assert!(units.iter().all(|u| matches!(u, ShapedUnit::Raw(_))));
        assert_eq!(pipe.mode(), ShapeMode::PassThrough);

        let stats = pipe.stats();
        assert_eq!(stats.drop_events, 1);
        assert_eq!(stats.compressed_units, 0);
        assert!(stats.dropped_messages >= 10);
    }

    #[test]
    fn test_high_only_never_compresses() {
        let mut clock = Instant::now();
        let config = ShapingConfig::new(0, 2 * MIB);
        let mut pipe = ShapingPipe::starting_at(config, clock).unwrap();
        assert_eq!(pipe.window(), Some(4 * MIB));

        let units = feed_at_rate(&mut pipe, &mut clock, 200, 65536, 1.5 * MIB as f64, 0);
        assert_eq!(units.len(), 200);
        assert!(units.iter().all(|u| matches!(u, ShapedUnit::Raw(_))));
    }

    #[test]
    fn test_zero_elapsed_counts_as_overload() {
        let start = Instant::now();
        let config = ShapingConfig::new(0, MIB).with_window(1000);
        let mut pipe = ShapingPipe::starting_at(config, start).unwrap();

        pipe.process_at(&[0u8; 2000], start).unwrap();
        assert!(pipe.process_at(b"x", start).unwrap().is_empty());
        assert_eq!(pipe.mode(), ShapeMode::Drop);
    }

    #[test]
    fn test_finish_flushes_pending_batch() {
        let start = Instant::now();
        let config = ShapingConfig::new(10, 0).with_window(100);
        let mut pipe = ShapingPipe::starting_at(config, start).unwrap();

        pipe.process_at(&[1u8; 200], start + Duration::from_millis(1)).unwrap();
        let out = pipe.process_at(b"first", start + Duration::from_millis(2)).unwrap();
        assert!(out.is_empty());
        assert_eq!(pipe.mode(), ShapeMode::Compress);
        pipe.process_at(b"second", start + Duration::from_millis(3)).unwrap();

        let unit = pipe.finish().unwrap().expect("배치 없음");
        let restored = DeshapingPipe::new().process(&unit.to_bytes()).unwrap();
        assert_eq!(
            restored.into_vec(),
            vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]
        );
        assert!(pipe.finish().unwrap().is_none());
    }

    #[test]
    fn test_unit_limit_splits_batches() {
        let start = Instant::now();
        let limit = Config::default().max_sendable_size();
        let config = ShapingConfig::new(1, 0).with_window(1 << 20);
        let mut pipe = ShapingPipe::starting_at(config, start)
            .unwrap()
            .with_unit_limit(limit);

        // 절반은 난수: 1 MiB 넘는 배치가 압축 후에도 상한을 넘김
        let mut rng = StdRng::seed_from_u64(7);
        let messages: Vec<Vec<u8>> = (0..600)
            .map(|i| {
                let mut m = vec![(i % 251) as u8; 4096];
                rng.fill(&mut m[..2048]);
                m
            })
            .collect();

        let mut units = Vec::new();
        for m in &messages {
            units.extend(pipe.process_at(m, start).unwrap());
        }
        units.extend(pipe.finish().unwrap());

        assert!(pipe.stats().limit_flushes >= 2);
        assert!(units.iter().all(|u| u.to_bytes().len() <= limit));

        let mut deshaper = DeshapingPipe::new();
        let restored: Vec<Bytes> = units
            .iter()
            .flat_map(|u| deshaper.process(&u.to_bytes()).unwrap())
            .collect();
        let expected: Vec<Bytes> = messages.into_iter().map(Bytes::from).collect();
        assert_eq!(restored, expected);
    }

    #[test]
    fn test_oversized_single_message_still_batched() {
        let start = Instant::now();
        let config = ShapingConfig::new(1, 0).with_window(10);
        let mut pipe = ShapingPipe::starting_at(config, start)
            .unwrap()
            .with_unit_limit(64);

        pipe.process_at(&[0u8; 20], start).unwrap();
        assert!(pipe.process_at(&[1u8; 500], start).unwrap().is_empty());
        assert_eq!(pipe.mode(), ShapeMode::Compress);

        // 상한보다 큰 메시지 하나뿐인 배치는 그대로 유지
        let unit = pipe.finish().unwrap().expect("배치 없음");
        let restored = DeshapingPipe::new().process(&unit.to_bytes()).unwrap();
        assert_eq!(restored, Output::One(Bytes::from(vec![1u8; 500])));
        assert_eq!(pipe.stats().limit_flushes, 0);
    }

    #[test]
    fn test_invalid_watermarks_rejected() {
        let config = ShapingConfig::new(5 * MIB, MIB);
        assert!(matches!(ShapingPipe::new(config), Err(Error::Config(_))));
    }

    #[rstest]
    #[case(ShapedUnit::Raw(Bytes::from_static(b"abc")), &[0x00, b'a', b'b', b'c'])]
    #[case(ShapedUnit::Compressed(Bytes::from_static(b"zz")), &[0x01, b'z', b'z'])]
    #[case(ShapedUnit::Raw(Bytes::new()), &[0x00])]
    fn test_unit_wire_format(#[case] unit: ShapedUnit, #[case] wire: &[u8]) {
        assert_eq!(unit.to_bytes().as_ref(), wire);
        assert_eq!(ShapedUnit::from_bytes(wire).unwrap(), unit);
    }

    #[test]
    fn test_unit_decode_errors() {
        assert_eq!(ShapedUnit::from_bytes(&[]), Err(DecodeError::EmptyUnit));
        assert_eq!(
            ShapedUnit::from_bytes(&[0x07, 1, 2]),
            Err(DecodeError::UnknownMarker(0x07))
        );
    }
}
