//! 카운터 이름과 기록 헬퍼
//!
//! [`metrics`](https://docs.rs/metrics) 파사드 위에 얇게 올린다. 레코더가 설치되지
//! 않았으면 모든 호출은 no-op.

use metrics::counter;

/// 전송된 단편 수
pub const FRAGMENTS_SENT: &str = "fastdump_fragments_sent_total";
/// 폐기된 단편 수 (`reason` 레이블)
pub const FRAGMENTS_DROPPED: &str = "fastdump_fragments_dropped_total";
/// 재조립 완료 메시지 수
pub const MESSAGES_REASSEMBLED: &str = "fastdump_messages_reassembled_total";
/// 재동기화 횟수
pub const RESYNCS: &str = "fastdump_resyncs_total";
/// 셰이핑 출력 단위 수 (`kind` 레이블)
pub const SHAPED_UNITS: &str = "fastdump_shaped_units_total";
/// 셰이퍼가 버린 메시지 수
pub const SHAPER_DROPPED: &str = "fastdump_shaper_dropped_total";
/// 디셰이핑 디코드 실패 수
pub const DESHAPE_ERRORS: &str = "fastdump_deshape_errors_total";

/// 단편 폐기 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// 헤더/크기/범위 위반
    Malformed,
    /// 이미 소비했거나 포기한 메시지의 단편
    Stale,
    /// 재동기화 중 버려진 대기 단편
    Resync,
    /// 총 길이가 메시지 첫 단편과 다름
    Inconsistent,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::Malformed => "malformed",
            DropReason::Stale => "stale",
            DropReason::Resync => "resync",
            DropReason::Inconsistent => "inconsistent",
        }
    }
}

pub fn inc_fragments_sent(count: u64) {
    counter!(FRAGMENTS_SENT).increment(count);
}

pub fn inc_fragments_dropped(reason: DropReason) {
    counter!(FRAGMENTS_DROPPED, "reason" => reason.as_str()).increment(1);
}

pub fn inc_messages_reassembled() {
    counter!(MESSAGES_REASSEMBLED).increment(1);
}

pub fn inc_resyncs() {
    counter!(RESYNCS).increment(1);
}

/// `kind`: "raw" 또는 "compressed"
pub fn inc_shaped_units(kind: &'static str) {
    counter!(SHAPED_UNITS, "kind" => kind).increment(1);
}

pub fn inc_shaper_dropped(count: u64) {
    counter!(SHAPER_DROPPED).increment(count);
}

pub fn inc_deshape_errors() {
    counter!(DESHAPE_ERRORS).increment(1);
}
