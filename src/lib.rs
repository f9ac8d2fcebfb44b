//! # FastDump
//!
//! 캡처된 트래픽을 손실이 있는 대역폭 제한 링크 너머로 중계하는 UDP 기반 전송 계층
//!
//! ## 핵심 특징
//! - **단편화**: 큰 논리 메시지를 고정 10바이트 헤더가 붙은 데이터그램으로 분할
//! - **재조립**: 제한된 범위의 재정렬/손실 허용, 범위를 벗어나면 재동기화
//! - **적응형 셰이핑**: 측정 처리율에 따라 통과 / 압축 배치 / 드롭 결정
//! - **최선 노력**: 재전송, ACK, 암호화 없음. 손실은 조용히 카운터에만 기록
//!
//! 데이터 흐름:
//! `producer → ShapingPipe → FragmentSender → [UDP] → Reassembler → DeshapingPipe → consumer`

pub mod config;
pub mod deshaper;
pub mod error;
pub mod fragment;
pub mod metrics;
pub mod output;
pub mod reassembler;
pub mod receiver;
pub mod sender;
pub mod shaper;
pub mod stats;

pub use config::{Config, ShapingConfig};
pub use deshaper::DeshapingPipe;
pub use error::{ConfigError, DecodeError, Error, Result};
pub use fragment::{Fragment, FragmentBuilder, FragmentHeader, SequenceSpace};
pub use output::Output;
pub use reassembler::Reassembler;
pub use receiver::FragmentReceiver;
pub use sender::FragmentSender;
pub use shaper::{ShapeMode, ShapedUnit, ShapingPipe};
pub use stats::{DeshapingStats, ReassemblyStats, SenderStats, ShapingStats};

/// 단편 헤더 크기 (바이트): `[sequence:u32][offset:u16][total_length:u32]`
pub const HEADER_SIZE: usize = 10;

/// 기본 데이터그램 크기 (헤더 포함, 바이트)
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// 시퀀스 공간 상한 (배타적). 시퀀스는 `[seq_start, 2^30)` 범위를 순환
pub const SEQUENCE_LIMIT: u32 = 1 << 30;

/// 기본 재정렬 허용 폭 (시퀀스 수)
pub const DEFAULT_MAX_GAP: u32 = 1000;

/// 기본 최대 메시지 크기 (재조립 버퍼)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 100 * 1024; // 100KB

/// IPv4 UDP 최대 페이로드
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// 셰이핑 단위 마커: 원본
pub const RAW_MARKER: u8 = 0x00;

/// 셰이핑 단위 마커: 압축 배치
pub const COMPRESSED_MARKER: u8 = 0x01;
