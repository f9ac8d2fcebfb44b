//! 프로토콜 설정

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::{
    Result, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_GAP, DEFAULT_MAX_MESSAGE_SIZE, HEADER_SIZE,
    MAX_DATAGRAM_SIZE, SEQUENCE_LIMIT,
};

const MIB: f64 = (1u64 << 20) as f64;

/// FastDump 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 데이터그램 크기 (헤더 포함, 바이트)
    pub chunk_size: usize,

    /// 순환 시퀀스 공간의 시작값. 랩어라운드 시 0이 아니라 이 값으로 돌아감
    pub seq_start: u32,

    /// 재정렬 허용 폭 (시퀀스 수). 초과하면 재동기화
    pub max_gap: u32,

    /// 재조립 가능한 최대 메시지 크기
    pub max_message_size: usize,

    /// 적응형 셰이핑 설정
    pub shaping: ShapingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            seq_start: 0,
            max_gap: DEFAULT_MAX_GAP,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            shaping: ShapingConfig::default(),
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 단편 하나에 실리는 최대 페이로드
    pub fn payload_capacity(&self) -> usize {
        self.chunk_size.saturating_sub(HEADER_SIZE)
    }

    /// 16비트 offset 필드로 주소 지정 가능한 최대 메시지 크기
    pub fn max_sendable_size(&self) -> usize {
        let capacity = self.payload_capacity().max(1);
        (u16::MAX as usize / capacity + 1) * capacity
    }

    /// 설정 검증
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.chunk_size <= HEADER_SIZE {
            return Err(ConfigError::ChunkSizeTooSmall {
                chunk_size: self.chunk_size,
                header_size: HEADER_SIZE,
            });
        }
        if self.chunk_size > MAX_DATAGRAM_SIZE {
            return Err(ConfigError::ChunkSizeTooLarge {
                chunk_size: self.chunk_size,
                max: MAX_DATAGRAM_SIZE,
            });
        }

        // 시퀀스 공간은 최소 2개 값 필요
        if self.seq_start >= SEQUENCE_LIMIT - 1 {
            return Err(ConfigError::SequenceStartOutOfRange {
                seq_start: self.seq_start,
                limit: SEQUENCE_LIMIT,
            });
        }

        let gap_limit = (SEQUENCE_LIMIT - self.seq_start) / 2;
        if self.max_gap == 0 || self.max_gap >= gap_limit {
            return Err(ConfigError::InvalidMaxGap {
                max_gap: self.max_gap,
                limit: gap_limit,
            });
        }

        if self.max_message_size == 0 || self.max_message_size > u32::MAX as usize {
            return Err(ConfigError::InvalidMaxMessageSize(self.max_message_size));
        }

        self.shaping.validate()
    }

    /// TOML 문자열에서 설정 로드 (검증 포함)
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// TOML 파일에서 설정 로드
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// 점보 프레임 링크용 설정 (MTU 9000)
    pub fn jumbo_frames() -> Self {
        Self {
            chunk_size: 8972, // 9000 - IP/UDP 헤더
            max_gap: 200,
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            chunk_size: 512, // 작은 데이터그램
            max_gap: 5000,   // 깊은 재정렬 허용
            ..Self::default()
        }
    }
}

/// 적응형 셰이핑 설정
///
/// 워터마크 단위는 bytes/sec, 윈도우 단위는 바이트. 두 워터마크가 모두 0이면
/// 윈도우 계산 자체가 비활성화되어 항상 통과 모드로 동작한다.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapingConfig {
    /// 이 처리율을 넘으면 압축 배치
    pub low_watermark: u64,

    /// 이 처리율을 넘으면 드롭
    pub high_watermark: u64,

    /// 재평가 윈도우 크기. 없으면 `max(2 * high, 4 * low)`
    pub window: Option<u64>,
}

impl ShapingConfig {
    pub fn new(low_watermark: u64, high_watermark: u64) -> Self {
        Self {
            low_watermark,
            high_watermark,
            window: None,
        }
    }

    /// MiB/s, MiB 단위 값으로 생성 (명령행 옵션 단위)
    pub fn from_mib(lwm: f64, hwm: f64, window: Option<f64>) -> Self {
        Self {
            low_watermark: (lwm * MIB) as u64,
            high_watermark: (hwm * MIB) as u64,
            window: window.map(|w| (w * MIB) as u64),
        }
    }

    /// 윈도우 빌더
    pub fn with_window(mut self, window: u64) -> Self {
        self.window = Some(window);
        self
    }

    /// 윈도우 계산 활성화 여부
    pub fn is_enabled(&self) -> bool {
        self.low_watermark != 0 || self.high_watermark != 0
    }

    /// 실제 적용될 윈도우 크기 (비활성화면 None)
    pub fn effective_window(&self) -> Option<u64> {
        if !self.is_enabled() {
            return None;
        }
        Some(self.window.unwrap_or_else(|| {
            (self.high_watermark.saturating_mul(2)).max(self.low_watermark.saturating_mul(4))
        }))
    }

    /// 설정 검증
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.high_watermark != 0
            && self.low_watermark != 0
            && self.low_watermark > self.high_watermark
        {
            return Err(ConfigError::WatermarkOrder {
                low: self.low_watermark,
                high: self.high_watermark,
            });
        }
        if self.is_enabled() && self.window == Some(0) {
            return Err(ConfigError::InvalidWindow);
        }
        Ok(())
    }
}
