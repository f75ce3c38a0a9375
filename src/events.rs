//! The replay-log record format and its append-only writer.
//!
//! Every record is exactly [`EVENT_SIZE`] bytes with the same field layout
//! regardless of kind, so a log can be scanned without a schema: `version`,
//! `event_type`, `location`, `length`, then a 16-byte payload. Addresses are
//! stored as native-endian machine words; the log is only ever replayed on
//! the machine (and address-space layout) that produced it.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use libafl_bolts::Error;

/// Size in bytes of one log record.
pub const EVENT_SIZE: usize = 48;

/// Largest byte range a single write record can carry inline.
pub const MAX_INLINE_WRITE: usize = 16;

/// The only record version this runtime reads or writes.
pub const EVENT_VERSION: u64 = 0;

const TYPE_ALLOCATE: u64 = 0;
const TYPE_BEGIN: u64 = 1;
const TYPE_COPY: u64 = 2;
const TYPE_WRITE: u64 = 3;

/// One replay-log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEvent {
    /// Start of a mutation; carries the owning call count and the stack
    /// token captured at constructor time.
    Begin { call_count: u64, stack_start: u64 },
    /// A mutator allocated a replacement buffer of `length` bytes at
    /// `location`.
    Allocate { location: u64, length: u64 },
    /// Memory copy of `length` bytes from `src` to `dest`.
    Copy { src: u64, dest: u64, length: u64 },
    /// In-place write of `length <= 16` bytes at `location`.
    Write {
        location: u64,
        length: u64,
        value: [u8; MAX_INLINE_WRITE],
    },
}

impl LogEvent {
    /// Build a write record from the bytes currently stored at `location`.
    pub fn write(location: u64, bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() > MAX_INLINE_WRITE {
            return Err(Error::illegal_argument(format!(
                "Cannot log event of size {}",
                bytes.len()
            )));
        }
        let mut value = [0u8; MAX_INLINE_WRITE];
        value[..bytes.len()].copy_from_slice(bytes);
        Ok(Self::Write {
            location,
            length: bytes.len() as u64,
            value,
        })
    }

    /// Serialize into the fixed on-disk layout.
    pub fn encode(&self) -> [u8; EVENT_SIZE] {
        let mut buf = [0u8; EVENT_SIZE];
        buf[0..8].copy_from_slice(&EVENT_VERSION.to_ne_bytes());
        match self {
            LogEvent::Begin {
                call_count,
                stack_start,
            } => {
                buf[8..16].copy_from_slice(&TYPE_BEGIN.to_ne_bytes());
                buf[32..40].copy_from_slice(&call_count.to_ne_bytes());
                buf[40..48].copy_from_slice(&stack_start.to_ne_bytes());
            }
            LogEvent::Allocate { location, length } => {
                buf[8..16].copy_from_slice(&TYPE_ALLOCATE.to_ne_bytes());
                buf[16..24].copy_from_slice(&location.to_ne_bytes());
                buf[24..32].copy_from_slice(&length.to_ne_bytes());
            }
            LogEvent::Copy { src, dest, length } => {
                buf[8..16].copy_from_slice(&TYPE_COPY.to_ne_bytes());
                buf[24..32].copy_from_slice(&length.to_ne_bytes());
                buf[32..40].copy_from_slice(&src.to_ne_bytes());
                buf[40..48].copy_from_slice(&dest.to_ne_bytes());
            }
            LogEvent::Write {
                location,
                length,
                value,
            } => {
                buf[8..16].copy_from_slice(&TYPE_WRITE.to_ne_bytes());
                buf[16..24].copy_from_slice(&location.to_ne_bytes());
                buf[24..32].copy_from_slice(&length.to_ne_bytes());
                buf[32..48].copy_from_slice(value);
            }
        }
        buf
    }

    /// Parse a record, enforcing the structural rules: known version, known
    /// kind, and write payloads no larger than [`MAX_INLINE_WRITE`].
    pub fn decode(buf: &[u8; EVENT_SIZE]) -> Result<Self, Error> {
        let word = |range: std::ops::Range<usize>| {
            u64::from_ne_bytes(buf[range].try_into().unwrap())
        };
        let version = word(0..8);
        if version != EVENT_VERSION {
            return Err(Error::illegal_state(format!(
                "Cannot replay events from version {version}"
            )));
        }
        let event_type = word(8..16);
        let location = word(16..24);
        let length = word(24..32);
        match event_type {
            TYPE_BEGIN => Ok(Self::Begin {
                call_count: word(32..40),
                stack_start: word(40..48),
            }),
            TYPE_ALLOCATE => Ok(Self::Allocate { location, length }),
            TYPE_COPY => Ok(Self::Copy {
                src: word(32..40),
                dest: word(40..48),
                length,
            }),
            TYPE_WRITE => {
                if length as usize > MAX_INLINE_WRITE {
                    return Err(Error::illegal_state(format!(
                        "Cannot write events of length {length}"
                    )));
                }
                let mut value = [0u8; MAX_INLINE_WRITE];
                value.copy_from_slice(&buf[32..48]);
                Ok(Self::Write {
                    location,
                    length,
                    value,
                })
            }
            other => Err(Error::illegal_state(format!(
                "Got invalid event type {other}"
            ))),
        }
    }
}

/// Append-only writer over a mutation's log file.
///
/// The handle doubles as the replay source: the same file is seeked back to
/// the start and read sequentially before the mutation runs.
#[derive(Debug)]
pub struct EventLog {
    file: File,
}

impl EventLog {
    pub fn new(file: File) -> Self {
        Self { file }
    }

    /// Append one record. The file is seeked to its end first, so appends
    /// land after whatever parent log was copied in. A short or failed write
    /// is reported but never aborts the mutation.
    pub fn append(&mut self, event: &LogEvent) {
        let record = event.encode();
        let written = self
            .file
            .seek(SeekFrom::End(0))
            .and_then(|_| self.file.write(&record));
        match written {
            Ok(n) if n == EVENT_SIZE => {}
            _ => {
                log::warn!("Warning: unable to write events to log, corruption may result.");
            }
        }
    }

    /// Access to the underlying file for replay.
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }
}

/// Pull the next raw record out of `reader`. Anything short of a full
/// record, including a clean end of file, stops the scan.
pub fn read_event(reader: &mut impl Read) -> Option<[u8; EVENT_SIZE]> {
    let mut buf = [0u8; EVENT_SIZE];
    match reader.read_exact(&mut buf) {
        Ok(()) => Some(buf),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_kinds() {
        let events = [
            LogEvent::Begin {
                call_count: 7,
                stack_start: 0x7ffd_0000_1000,
            },
            LogEvent::Allocate {
                location: 0xdead_beef,
                length: 128,
            },
            LogEvent::Copy {
                src: 0x1000,
                dest: 0x2000,
                length: 64,
            },
            LogEvent::write(0x3000, &[1, 2, 3, 4]).unwrap(),
        ];
        for event in events {
            let decoded = LogEvent::decode(&event.encode()).unwrap();
            assert_eq!(decoded, event);
        }
    }

    #[test]
    fn rejects_unknown_version() {
        let mut buf = LogEvent::Allocate {
            location: 0,
            length: 8,
        }
        .encode();
        buf[0] = 1;
        assert!(LogEvent::decode(&buf).is_err());
    }

    #[test]
    fn rejects_unknown_kind() {
        let mut buf = LogEvent::Allocate {
            location: 0,
            length: 8,
        }
        .encode();
        buf[8] = 9;
        assert!(LogEvent::decode(&buf).is_err());
    }

    #[test]
    fn rejects_oversized_write() {
        assert!(LogEvent::write(0, &[0u8; 17]).is_err());

        let mut buf = LogEvent::write(0, &[0u8; 16]).unwrap().encode();
        // Tamper with the length field.
        buf[24..32].copy_from_slice(&17u64.to_ne_bytes());
        assert!(LogEvent::decode(&buf).is_err());
    }

    #[test]
    fn appends_are_record_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let file = std::fs::File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let mut log = EventLog::new(file);
        log.append(&LogEvent::Begin {
            call_count: 1,
            stack_start: 2,
        });
        log.append(&LogEvent::Allocate {
            location: 3,
            length: 4,
        });
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            (2 * EVENT_SIZE) as u64
        );
    }
}
