//! Shared pieces of every probe program:
//! - [`BpfContext`] carries the collaborators probes read from while attached
//! - [`BpfEvent`] is the record probes emit, with its fixed-layout wire format.
//!
use core::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{
    Pid,
    memory::{ProcessVmReader, UserMemory},
    process::{CurrentProcess, ProcessData, ProcessEnricher, TASK_COMM_LEN},
    time::Timestamp,
};

/// kind + timestamp + return value
pub const HEADER_SIZE: usize = 24;
/// pid + tid + uid + gid + comm
pub const PROCESS_DATA_SIZE: usize = 16 + TASK_COMM_LEN;

/// BpfContext contains the collaborators which are provided on program attach
#[derive(Clone)]
pub struct BpfContext {
    /// Address space of the threads issuing syscalls
    memory: Arc<dyn UserMemory>,
    /// Source of process metadata attached to every event
    enricher: Arc<dyn ProcessEnricher>,
}

impl Default for BpfContext {
    fn default() -> Self {
        Self::new(Arc::new(ProcessVmReader), Arc::new(CurrentProcess))
    }
}

impl BpfContext {
    pub fn new(memory: Arc<dyn UserMemory>, enricher: Arc<dyn ProcessEnricher>) -> Self {
        Self { memory, enricher }
    }

    pub fn memory(&self) -> &dyn UserMemory {
        self.memory.as_ref()
    }

    pub fn enricher(&self) -> &dyn ProcessEnricher {
        self.enricher.as_ref()
    }
}

#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("invalid value {value} for {setting}: {reason}")]
    InvalidSetting {
        setting: &'static str,
        value: String,
        reason: &'static str,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record too short: expected {expected} bytes, got {found}")]
    TooShort { expected: usize, found: usize },
    #[error("unknown event kind {0}")]
    UnknownKind(u64),
}

/// Payloads with a fixed-size encoding. Field order and widths are part of
/// the contract with consumers, which decode records positionally.
pub trait FixedPayload: Sized {
    /// Encoded size in bytes
    const SIZE: usize;

    /// Tag written at the start of the record
    fn kind(&self) -> u64;

    fn encode(&self, buf: &mut BytesMut);

    /// `buf` is guaranteed to hold at least `SIZE` bytes.
    fn decode(kind: u64, buf: &mut Bytes) -> Result<Self, DecodeError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BpfEvent<P> {
    pub timestamp: Timestamp,
    pub retval: i64,
    pub process: ProcessData,
    pub payload: P,
}

impl<P: FixedPayload> BpfEvent<P> {
    pub const ENCODED_SIZE: usize = HEADER_SIZE + P::SIZE + PROCESS_DATA_SIZE;

    /// Little-endian record:
    /// `kind | timestamp | retval | payload | pid | tid | uid | gid | comm`
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::ENCODED_SIZE);
        buf.put_u64_le(self.payload.kind());
        buf.put_u64_le(self.timestamp.as_nanos());
        buf.put_i64_le(self.retval);
        self.payload.encode(&mut buf);
        buf.put_u32_le(self.process.pid.as_raw() as u32);
        buf.put_u32_le(self.process.tid.as_raw() as u32);
        buf.put_u32_le(self.process.uid);
        buf.put_u32_le(self.process.gid);
        buf.put_slice(&self.process.comm);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, DecodeError> {
        if buf.len() < Self::ENCODED_SIZE {
            return Err(DecodeError::TooShort {
                expected: Self::ENCODED_SIZE,
                found: buf.len(),
            });
        }
        let kind = buf.get_u64_le();
        let timestamp = Timestamp::from(buf.get_u64_le());
        let retval = buf.get_i64_le();
        let mut payload_buf = buf.split_to(P::SIZE);
        let payload = P::decode(kind, &mut payload_buf)?;
        let pid = Pid::from_raw(buf.get_u32_le() as i32);
        let tid = Pid::from_raw(buf.get_u32_le() as i32);
        let uid = buf.get_u32_le();
        let gid = buf.get_u32_le();
        let mut comm = [0; TASK_COMM_LEN];
        buf.copy_to_slice(&mut comm);
        Ok(Self {
            timestamp,
            retval,
            process: ProcessData {
                pid,
                tid,
                uid,
                gid,
                comm,
            },
            payload,
        })
    }
}

impl<P: fmt::Display> fmt::Display for BpfEvent<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} = {}",
            self.timestamp, self.process, self.payload, self.retval
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Pair(u32, i32);

    impl FixedPayload for Pair {
        const SIZE: usize = 8;
        fn kind(&self) -> u64 {
            42
        }
        fn encode(&self, buf: &mut BytesMut) {
            buf.put_u32_le(self.0);
            buf.put_i32_le(self.1);
        }
        fn decode(kind: u64, buf: &mut Bytes) -> Result<Self, DecodeError> {
            if kind != 42 {
                return Err(DecodeError::UnknownKind(kind));
            }
            Ok(Pair(buf.get_u32_le(), buf.get_i32_le()))
        }
    }

    fn sample() -> BpfEvent<Pair> {
        BpfEvent {
            timestamp: 123.into(),
            retval: -13,
            process: ProcessData {
                pid: Pid::from_raw(10),
                tid: Pid::from_raw(11),
                uid: 1000,
                gid: 100,
                comm: *b"cat\0\0\0\0\0\0\0\0\0\0\0\0\0",
            },
            payload: Pair(7, -1),
        }
    }

    #[test]
    fn layout() {
        let record = sample().encode();
        assert_eq!(record.len(), BpfEvent::<Pair>::ENCODED_SIZE);
        assert_eq!(&record[0..8], &42u64.to_le_bytes());
        assert_eq!(&record[8..16], &123u64.to_le_bytes());
        assert_eq!(&record[16..24], &(-13i64).to_le_bytes());
        assert_eq!(&record[24..28], &7u32.to_le_bytes());
        assert_eq!(&record[32..36], &10u32.to_le_bytes());
        assert_eq!(&record[48..51], b"cat");
        assert_eq!(BpfEvent::<Pair>::decode(record).unwrap(), sample());
    }

    #[test]
    fn short_record() {
        let record = sample().encode().slice(..20);
        assert_eq!(
            BpfEvent::<Pair>::decode(record),
            Err(DecodeError::TooShort {
                expected: BpfEvent::<Pair>::ENCODED_SIZE,
                found: 20
            })
        );
    }

    #[test]
    fn unknown_kind() {
        let mut record = BytesMut::from(&sample().encode()[..]);
        record[0] = 1;
        assert_eq!(
            BpfEvent::<Pair>::decode(record.freeze()),
            Err(DecodeError::UnknownKind(1))
        );
    }
}
