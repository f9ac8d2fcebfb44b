//! 전송 통계
//!
//! 인스턴스별 카운터. 인스턴스 하나가 흐름 하나를 담당하므로 잠금 없이
//! `&mut self`로 갱신하고 `stats()`로 스냅샷을 꺼낸다.

use std::time::{Duration, Instant};

/// 송신 통계
#[derive(Debug, Clone)]
pub struct SenderStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 전송한 메시지 수
    pub messages: u64,

    /// 전송한 단편 수
    pub fragments: u64,

    /// 메시지 바이트 (헤더 제외)
    pub payload_bytes: u64,

    /// 와이어 바이트 (헤더 포함)
    pub wire_bytes: u64,

    /// 크기 초과로 거부된 메시지 수
    pub rejected: u64,
}

impl SenderStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            messages: 0,
            fragments: 0,
            payload_bytes: 0,
            wire_bytes: 0,
            rejected: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 와이어 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        rate(self.wire_bytes, self.elapsed())
    }

    /// 헤더 오버헤드 비율
    pub fn overhead_ratio(&self) -> f64 {
        if self.wire_bytes == 0 {
            return 0.0;
        }
        (self.wire_bytes - self.payload_bytes) as f64 / self.wire_bytes as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Messages: {} | Fragments: {} | Bytes: {} | Throughput: {:.2} MB/s | Overhead: {:.2}% | Rejected: {}",
            self.elapsed().as_secs_f64(),
            self.messages,
            self.fragments,
            self.wire_bytes,
            self.throughput() / 1_000_000.0,
            self.overhead_ratio() * 100.0,
            self.rejected,
        )
    }
}

impl Default for SenderStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 재조립 통계
#[derive(Debug, Clone)]
pub struct ReassemblyStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 입력 데이터그램 수
    pub datagrams: u64,

    /// 완성된 메시지 수
    pub messages: u64,

    /// 완성된 메시지 바이트
    pub bytes: u64,

    /// 파싱/검증 실패로 버린 데이터그램
    pub malformed: u64,

    /// 이미 지나간 메시지의 단편
    pub stale: u64,

    /// 재동기화 중 버린 대기 단편
    pub resync_discarded: u64,

    /// 총 길이 불일치 단편
    pub inconsistent: u64,

    /// 재동기화 횟수
    pub resyncs: u64,

    /// 부분 조립 상태에서 포기한 메시지 수
    pub abandoned: u64,

    /// 현재 대기 버퍼에 있는 단편 수
    pub pending: usize,

    /// 대기 버퍼 최대 길이
    pub pending_peak: usize,
}

impl ReassemblyStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            datagrams: 0,
            messages: 0,
            bytes: 0,
            malformed: 0,
            stale: 0,
            resync_discarded: 0,
            inconsistent: 0,
            resyncs: 0,
            abandoned: 0,
            pending: 0,
            pending_peak: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 버려진 단편 총합 (손실 카운터)
    pub fn discarded(&self) -> u64 {
        self.malformed + self.stale + self.resync_discarded + self.inconsistent
    }

    /// 폐기율
    pub fn discard_rate(&self) -> f64 {
        if self.datagrams == 0 {
            return 0.0;
        }
        self.discarded() as f64 / self.datagrams as f64
    }

    /// 메시지 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        rate(self.bytes, self.elapsed())
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Datagrams: {} | Messages: {} | Bytes: {} | Throughput: {:.2} MB/s | Discarded: {:.2}% | Resyncs: {} | Abandoned: {} | Pending peak: {}",
            self.elapsed().as_secs_f64(),
            self.datagrams,
            self.messages,
            self.bytes,
            self.throughput() / 1_000_000.0,
            self.discard_rate() * 100.0,
            self.resyncs,
            self.abandoned,
            self.pending_peak,
        )
    }
}

impl Default for ReassemblyStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 셰이핑 통계
#[derive(Debug, Clone)]
pub struct ShapingStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 입력 메시지 수
    pub messages_in: u64,

    /// 입력 바이트
    pub bytes_in: u64,

    /// RAW 단위 수
    pub raw_units: u64,

    /// COMPRESSED 단위 수
    pub compressed_units: u64,

    /// 압축 배치에 담긴 메시지 수
    pub compressed_messages: u64,

    /// 압축 전 배치 바이트 (길이 접두어 포함)
    pub compressed_input_bytes: u64,

    /// 압축 후 배치 바이트
    pub compressed_output_bytes: u64,

    /// 드롭된 메시지 수 (드롭 모드 + 드롭 진입 시 버린 배치)
    pub dropped_messages: u64,

    /// 드롭 모드 진입 횟수
    pub drop_events: u64,

    /// 단위 크기 상한 때문에 윈도우 재평가 전에 플러시한 배치 수
    pub limit_flushes: u64,

    /// 윈도우 재평가 횟수
    pub evaluations: u64,

    /// 마지막 측정 처리율 (bytes/sec)
    pub last_rate: f64,
}

impl ShapingStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            messages_in: 0,
            bytes_in: 0,
            raw_units: 0,
            compressed_units: 0,
            compressed_messages: 0,
            compressed_input_bytes: 0,
            compressed_output_bytes: 0,
            dropped_messages: 0,
            drop_events: 0,
            limit_flushes: 0,
            evaluations: 0,
            last_rate: 0.0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 압축률 (출력 / 입력)
    pub fn compression_ratio(&self) -> f64 {
        if self.compressed_input_bytes == 0 {
            return 1.0;
        }
        self.compressed_output_bytes as f64 / self.compressed_input_bytes as f64
    }

    /// 드롭률
    pub fn drop_rate(&self) -> f64 {
        if self.messages_in == 0 {
            return 0.0;
        }
        self.dropped_messages as f64 / self.messages_in as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | In: {} msgs / {} bytes | Raw: {} | Compressed: {} units ({} msgs, {} early, ratio {:.2}) | Dropped: {:.2}% | Last rate: {:.2} MiB/s",
            self.elapsed().as_secs_f64(),
            self.messages_in,
            self.bytes_in,
            self.raw_units,
            self.compressed_units,
            self.compressed_messages,
            self.limit_flushes,
            self.compression_ratio(),
            self.drop_rate() * 100.0,
            self.last_rate / (1u64 << 20) as f64,
        )
    }
}

impl Default for ShapingStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 디셰이핑 통계
#[derive(Debug, Clone, Default)]
pub struct DeshapingStats {
    /// 입력 단위 수
    pub units: u64,

    /// RAW 단위 수
    pub raw_units: u64,

    /// COMPRESSED 단위 수
    pub compressed_units: u64,

    /// 출력 메시지 수
    pub messages: u64,

    /// 디코드 실패 단위 수
    pub decode_errors: u64,
}

impl DeshapingStats {
    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Units: {} (raw {}, compressed {}) | Messages: {} | Decode errors: {}",
            self.units, self.raw_units, self.compressed_units, self.messages, self.decode_errors,
        )
    }
}

fn rate(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        return 0.0;
    }
    bytes as f64 / secs
}
