//! 재조립기 (수신측 상태 기계)
//!
//! - 데이터그램을 받아 논리 메시지를 복원
//! - `max_gap` 범위 안의 재정렬/손실은 대기 버퍼로 흡수
//! - 범위를 벗어나면 현재 메시지를 포기하고 재동기화
//!
//! I/O는 하지 않는다. 소켓 루프는 [`FragmentReceiver`](crate::FragmentReceiver) 참고.
//!
//! 대기 버퍼와 조립 버퍼에는 절대 상한이 없다. `max_gap`과 `max_message_size`가
//! 운영상 크기를 묶을 뿐이다.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::error::DecodeError;
use crate::fragment::{Fragment, SequenceSpace};
use crate::metrics::{self, DropReason};
use crate::output::Output;
use crate::stats::ReassemblyStats;
use crate::{Config, Result};

/// 재조립기
///
/// 인스턴스 하나가 흐름 하나를 담당한다. `feed`는 블로킹하지 않으며 한 호출에서
/// 0개 이상의 완성 메시지를 돌려준다. 손상/지연/초과 데이터는 조용히 버리고
/// 카운터만 올린다.
#[derive(Debug)]
pub struct Reassembler {
    config: Config,
    space: SequenceSpace,

    /// 첫 데이터그램으로 기대 시퀀스를 잡았는지
    synced: bool,

    expected_sequence: u32,
    expected_offset: u32,

    /// 조립 중인 메시지의 선언 길이
    current_total: u32,

    /// 순서가 어긋난 단편. `(sequence, offset)` 튜플 순서
    ///
    /// 랩어라운드 직후에는 튜플 최소값이 기대 위치가 아닐 수 있으므로 기대 키를
    /// 직접 조회한다.
    pending: BTreeMap<(u32, u16), Fragment>,

    /// 조립 버퍼
    assembly: BytesMut,

    stats: ReassemblyStats,
}

impl Reassembler {
    /// 새 재조립기 생성
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            space: SequenceSpace::new(config.seq_start),
            synced: false,
            expected_sequence: config.seq_start,
            expected_offset: 0,
            current_total: 0,
            pending: BTreeMap::new(),
            assembly: BytesMut::with_capacity(config.max_message_size),
            stats: ReassemblyStats::new(),
            config,
        })
    }

    /// 데이터그램 하나 입력
    ///
    /// 완성된 메시지를 순서대로 반환한다. 대기 버퍼에 이어지는 단편이 있으면
    /// 같은 호출 안에서 모두 소비한다.
    pub fn feed(&mut self, datagram: &[u8]) -> Output<Bytes> {
        self.stats.datagrams += 1;
        let mut out = Output::Empty;

        let fragment = match self.decode(datagram) {
            Ok(fragment) => fragment,
            Err(e) => {
                trace!("잘못된 데이터그램 폐기: {}", e);
                self.discard(DropReason::Malformed);
                return out;
            }
        };

        if !self.synced {
            self.sync(&fragment);
        }

        self.dispatch(fragment, &mut out);
        self.stats.pending = self.pending.len();
        out
    }

    /// 다음에 기대하는 `(sequence, offset)`
    pub fn expected(&self) -> (u32, u32) {
        (self.expected_sequence, self.expected_offset)
    }

    /// 첫 데이터그램을 받았는지
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// 대기 버퍼 길이
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 통계 반환
    pub fn stats(&self) -> ReassemblyStats {
        self.stats.clone()
    }

    fn decode(&self, datagram: &[u8]) -> std::result::Result<Fragment, DecodeError> {
        if datagram.len() > self.config.chunk_size {
            return Err(DecodeError::DatagramTooLarge {
                len: datagram.len(),
                max: self.config.chunk_size,
            });
        }

        let fragment = Fragment::from_bytes(datagram)?;

        if !self.space.contains(fragment.header.sequence) {
            return Err(DecodeError::SequenceOutOfRange(fragment.header.sequence));
        }
        if fragment.header.total_length as usize > self.config.max_message_size {
            return Err(DecodeError::MessageTooLarge {
                total_length: fragment.header.total_length,
                max: self.config.max_message_size,
            });
        }

        Ok(fragment)
    }

    /// 첫 데이터그램 기준으로 기대 시퀀스 설정. 메시지 중간에서 합류했으면 다음 메시지부터
    fn sync(&mut self, fragment: &Fragment) {
        let (seq, offset) = fragment.key();
        self.expected_sequence = if offset == 0 {
            seq
        } else {
            self.space.next(seq)
        };
        self.expected_offset = 0;
        self.synced = true;

        debug!("동기화: 기대 시퀀스 {}", self.expected_sequence);
    }

    fn dispatch(&mut self, fragment: Fragment, out: &mut Output<Bytes>) {
        let (seq, offset) = fragment.key();

        if self.is_expected(seq, offset) {
            self.consume(fragment, out);
            self.drain(out);
        } else if self.space.distance(seq, self.expected_sequence) > self.config.max_gap {
            self.resync(fragment, out);
        } else if self.is_ahead(seq, offset) {
            // 재정렬/손실 대비 보관
            self.buffer(fragment);
        } else {
            trace!("지난 단편 폐기: seq={}, offset={}", seq, offset);
            self.discard(DropReason::Stale);
        }
    }

    fn is_expected(&self, seq: u32, offset: u16) -> bool {
        seq == self.expected_sequence && u32::from(offset) == self.expected_offset
    }

    fn is_ahead(&self, seq: u32, offset: u16) -> bool {
        if seq == self.expected_sequence {
            u32::from(offset) > self.expected_offset
        } else {
            self.space.is_after(seq, self.expected_sequence)
        }
    }

    /// 기대 위치의 단편을 조립 버퍼에 복사
    fn consume(&mut self, fragment: Fragment, out: &mut Output<Bytes>) {
        let total_length = fragment.header.total_length;

        if self.expected_offset == 0 {
            self.current_total = total_length;
            self.assembly.clear();
            self.assembly.reserve(total_length as usize);
        } else if total_length != self.current_total {
            trace!(
                "길이 불일치 단편 폐기: seq={}, expected total={}, got={}",
                fragment.header.sequence,
                self.current_total,
                total_length
            );
            self.discard(DropReason::Inconsistent);
            return;
        }

        self.assembly.extend_from_slice(&fragment.payload);
        self.expected_offset += fragment.payload.len() as u32;

        if self.expected_offset == self.current_total {
            let message = self.assembly.split().freeze();

            self.stats.messages += 1;
            self.stats.bytes += message.len() as u64;
            metrics::inc_messages_reassembled();

            out.push(message);
            self.expected_sequence = self.space.next(self.expected_sequence);
            self.expected_offset = 0;
        }
    }

    /// 기대 위치의 단편이 대기 버퍼에 있는 동안 계속 소비
    fn drain(&mut self, out: &mut Output<Bytes>) {
        let start = self.expected_sequence;

        while let Ok(offset) = u16::try_from(self.expected_offset) {
            let Some(fragment) = self.pending.remove(&(self.expected_sequence, offset)) else {
                break;
            };
            self.consume(fragment, out);
        }

        if self.expected_sequence != start {
            self.purge_stale();
        }
    }

    /// 기대 위치보다 뒤처진 대기 단편 제거 (재동기화로 지나친 메시지의 잔여물)
    fn purge_stale(&mut self) {
        let space = self.space;
        let expected_sequence = self.expected_sequence;
        let expected_offset = self.expected_offset;

        let before = self.pending.len();
        self.pending.retain(|&(seq, offset), _| {
            if seq == expected_sequence {
                u32::from(offset) >= expected_offset
            } else {
                space.is_after(seq, expected_sequence)
            }
        });

        for _ in self.pending.len()..before {
            self.discard(DropReason::Stale);
        }
    }

    /// `floor`부터 순환 순서로 가장 앞선 대기 단편을 꺼냄
    fn pop_from(&mut self, floor: u32) -> Option<Fragment> {
        let key = self
            .pending
            .range((floor, 0)..)
            .next()
            .or_else(|| self.pending.iter().next())
            .map(|(key, _)| *key)?;
        self.pending.remove(&key)
    }

    /// 현재 메시지 포기 후 대기 버퍼에서 새 시작점 찾기
    fn resync(&mut self, trigger: Fragment, out: &mut Output<Bytes>) {
        self.stats.resyncs += 1;
        metrics::inc_resyncs();

        let abandoned = self.expected_sequence;
        if self.expected_offset > 0 {
            warn!(
                "메시지 {} 포기: {}/{} bytes 조립 후 재동기화",
                abandoned, self.expected_offset, self.current_total
            );
            self.stats.abandoned += 1;
            self.assembly.clear();
        }

        // 이미 일부를 소비한 시퀀스는 다시 시작하지 않음
        let floor = if self.expected_offset == 0 {
            abandoned
        } else {
            self.space.next(abandoned)
        };

        if self.space.is_at_or_after(trigger.header.sequence, floor) {
            self.buffer(trigger);
        } else {
            self.discard(DropReason::Resync);
        }

        // 플로어 이상이 순환 순서상 먼저 나오고 플로어 미만은 마지막에 나옴
        while let Some(candidate) = self.pop_from(floor) {
            let (seq, offset) = candidate.key();
            if offset == 0 && self.space.is_at_or_after(seq, floor) {
                debug!("재동기화: 시퀀스 {} → {}", abandoned, seq);
                self.adopt(candidate, out);
                return;
            }
            self.discard(DropReason::Resync);
        }

        debug!("재동기화 대상 없음: 시퀀스 {} 건너뜀", abandoned);
        self.expected_sequence = self.space.next(abandoned);
        self.expected_offset = 0;
    }

    fn adopt(&mut self, fragment: Fragment, out: &mut Output<Bytes>) {
        self.expected_sequence = fragment.header.sequence;
        self.expected_offset = 0;
        self.consume(fragment, out);
        self.drain(out);
    }

    fn buffer(&mut self, fragment: Fragment) {
        match self.pending.entry(fragment.key()) {
            Entry::Occupied(_) => {
                trace!("중복 대기 단편 폐기: {:?}", fragment.key());
                self.discard(DropReason::Stale);
            }
            Entry::Vacant(slot) => {
                slot.insert(fragment);
                self.stats.pending_peak = self.stats.pending_peak.max(self.pending.len());
            }
        }
    }

    fn discard(&mut self, reason: DropReason) {
        match reason {
            DropReason::Malformed => self.stats.malformed += 1,
            DropReason::Stale => self.stats.stale += 1,
            DropReason::Resync => self.stats.resync_discarded += 1,
            DropReason::Inconsistent => self.stats.inconsistent += 1,
        }
        metrics::inc_fragments_dropped(reason);
    }
}
