//! 에러 타입 정의

use thiserror::Error;

/// 설정 에러 (시작 시점에 치명적)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("청크 크기가 헤더보다 작음: {chunk_size} <= {header_size}")]
    ChunkSizeTooSmall {
        chunk_size: usize,
        header_size: usize,
    },

    #[error("청크 크기가 데이터그램 최대치 초과: {chunk_size} > {max}")]
    ChunkSizeTooLarge { chunk_size: usize, max: usize },

    #[error("시작 시퀀스가 범위를 벗어남: {seq_start} (상한 {limit})")]
    SequenceStartOutOfRange { seq_start: u32, limit: u32 },

    #[error("유효하지 않은 max_gap: {max_gap} (허용 범위 1..{limit})")]
    InvalidMaxGap { max_gap: u32, limit: u32 },

    #[error("유효하지 않은 최대 메시지 크기: {0}")]
    InvalidMaxMessageSize(usize),

    #[error("high watermark는 low watermark 이상이어야 함: low={low}, high={high}")]
    WatermarkOrder { low: u64, high: u64 },

    #[error("재평가 윈도우 크기는 0일 수 없음")]
    InvalidWindow,
}

/// 디코드 에러
///
/// 단편 수준 에러는 재조립기 안에서 흡수되고(단편 폐기), 셰이핑 단위 에러는
/// 해당 단위만 중단시킨다.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("헤더보다 짧은 데이터그램: {len} bytes")]
    HeaderTooShort { len: usize },

    #[error("데이터그램이 청크 크기 초과: {len} > {max}")]
    DatagramTooLarge { len: usize, max: usize },

    #[error("시퀀스가 범위를 벗어남: {0}")]
    SequenceOutOfRange(u32),

    #[error("선언된 메시지 크기 초과: {total_length} > {max}")]
    MessageTooLarge { total_length: u32, max: usize },

    #[error("단편이 메시지 끝을 넘어섬: offset={offset}, len={len}, total={total_length}")]
    FragmentOverrun {
        offset: u16,
        len: usize,
        total_length: u32,
    },

    #[error("빈 셰이핑 단위")]
    EmptyUnit,

    #[error("알 수 없는 셰이핑 마커: {0:#04x}")]
    UnknownMarker(u8),

    #[error("손상된 압축 배치: {0}")]
    CorruptBatch(String),

    #[error("잘린 압축 배치")]
    TruncatedBatch,

    #[error("잘린 레코드: offset={offset}, 필요 {needed} bytes, 남은 {available} bytes")]
    TruncatedRecord {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("압축 스트림 뒤에 남은 데이터")]
    TrailingData,
}

/// FastDump 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    /// 채널(소켓/스트림) 에러. 재시도하지 않고 호출자에게 전달
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("설정 에러: {0}")]
    Config(#[from] ConfigError),

    #[error("설정 파일 파싱 에러: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("디코드 에러: {0}")]
    Decode(#[from] DecodeError),

    #[error("메시지가 너무 큼: {len} bytes (최대 {max})")]
    MessageTooLarge { len: usize, max: usize },
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
