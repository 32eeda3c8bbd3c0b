//! Top-level HPROF record reader.
//!
//! An HPROF file opens with a NUL-terminated version string, the
//! identifier size and a timestamp, followed by a sequence of records:
//! a tag byte, a time delta and a declared body length. The reader pulls
//! one record at a time and hands the decoded content to a caller
//! supplied [`RecordHandler`]; heap dump (segment) bodies are handed over
//! as a nested [`HeapStream`] of sub-records.
//!
//! Every record must consume exactly its declared length. Anything else
//! means the decode has desynchronized and the run is aborted.
//!
//! # Example
//!
//! ```no_run
//! use std::fs::File;
//! use std::io::BufReader;
//! use hprof_to_chd::record::{HprofReader, RecordHandler};
//!
//! struct StringCounter(u64);
//!
//! impl RecordHandler for StringCounter {
//!     fn on_string(&mut self, _id: u32, _payload: Vec<u8>) -> hprof_to_chd::Result<()> {
//!         self.0 += 1;
//!         Ok(())
//!     }
//! }
//!
//! let input = BufReader::new(File::open("in.hprof").unwrap());
//! let mut reader = HprofReader::new(input).unwrap();
//! let mut counter = StringCounter(0);
//! while reader.has_next().unwrap() {
//!     reader.next(&mut counter).unwrap();
//! }
//! println!("{} strings", counter.0);
//! ```

use crate::heap::{self, HeapStream};
use crate::stream;
use crate::{ConvertError, Result};
use std::io::{self, Read};

/// Top-level record tags.
pub mod tag {
    pub const STRING: u8 = 0x01;
    pub const LOAD_CLASS: u8 = 0x02;
    pub const UNLOAD_CLASS: u8 = 0x03;
    pub const STACK_FRAME: u8 = 0x04;
    pub const STACK_TRACE: u8 = 0x05;
    pub const ALLOC_SITES: u8 = 0x06;
    pub const HEAP_SUMMARY: u8 = 0x07;
    pub const START_THREAD: u8 = 0x0A;
    pub const END_THREAD: u8 = 0x0B;
    pub const HEAP_DUMP: u8 = 0x0C;
    pub const CPU_SAMPLES: u8 = 0x0D;
    pub const CONTROL_SETTINGS: u8 = 0x0E;
    pub const HEAP_DUMP_SEGMENT: u8 = 0x1C;
    pub const HEAP_DUMP_END: u8 = 0x2C;
}

const VERSION_PREFIX: &str = "JAVA PROFILE";
const MAX_VERSION_LEN: usize = 63;

/// The file header preceding the record stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HprofHeader {
    /// Version string, e.g. `JAVA PROFILE 1.0.3`.
    pub version: String,
    /// Identifier width in bytes; only 4 is supported.
    pub id_size: u32,
    /// Dump timestamp in milliseconds since the epoch.
    pub timestamp_ms: u64,
}

/// A load-class record, binding a class object id to its name string and
/// a class serial number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadClassRecord {
    pub class_serial: u32,
    pub class_id: u32,
    pub stack_trace_serial: u32,
    pub name_id: u32,
}

/// A stack frame record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackFrameRecord {
    pub frame_id: u32,
    pub method_name_id: u32,
    pub signature_id: u32,
    pub source_file_id: u32,
    pub class_serial: u32,
    pub line: i32,
}

/// A stack trace record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackTraceRecord {
    pub serial: u32,
    pub thread_serial: u32,
    pub frame_ids: Vec<u32>,
}

/// Callbacks invoked by [`HprofReader::next`], one per decoded record
/// kind. Default implementations discard the record; the heap dump
/// default drains the segment so the reader's exact-consumption check
/// still holds.
pub trait RecordHandler {
    fn on_string(&mut self, id: u32, payload: Vec<u8>) -> Result<()> {
        let _ = (id, payload);
        Ok(())
    }

    fn on_load_class(&mut self, record: LoadClassRecord) -> Result<()> {
        let _ = record;
        Ok(())
    }

    fn on_stack_frame(&mut self, record: StackFrameRecord) -> Result<()> {
        let _ = record;
        Ok(())
    }

    fn on_stack_trace(&mut self, record: StackTraceRecord) -> Result<()> {
        let _ = record;
        Ok(())
    }

    fn on_heap_dump(&mut self, records: &mut HeapStream<'_>) -> Result<()> {
        while let Some(tag) = records.next_tag()? {
            heap::skip_record(tag, records)?;
        }
        Ok(())
    }

    fn on_heap_dump_end(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Pull-style reader over the top-level record stream.
pub struct HprofReader<R: Read> {
    input: R,
    offset: u64,
    pending: Option<u8>,
    header: HprofHeader,
}

impl<R: Read> HprofReader<R> {
    /// Read and validate the file header, leaving the cursor at the
    /// first record.
    pub fn new(mut input: R) -> Result<Self> {
        // A file too short to hold the header is not an HPROF file.
        fn header_io(e: io::Error) -> ConvertError {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                ConvertError::InvalidHeader
            } else {
                e.into()
            }
        }

        let mut version = Vec::new();
        loop {
            let byte = stream::read_u8(&mut input).map_err(header_io)?;
            if byte == 0 {
                break;
            }
            if version.len() >= MAX_VERSION_LEN {
                return Err(ConvertError::InvalidHeader);
            }
            version.push(byte);
        }
        let version = String::from_utf8(version).map_err(|_| ConvertError::InvalidHeader)?;
        if !version.starts_with(VERSION_PREFIX) {
            return Err(ConvertError::InvalidHeader);
        }

        let id_size = stream::read_u32(&mut input).map_err(header_io)?;
        if id_size != 4 {
            return Err(ConvertError::UnsupportedIdSize(id_size));
        }
        let timestamp_ms = stream::read_u64(&mut input).map_err(header_io)?;

        let offset = version.len() as u64 + 1 + 4 + 8;
        Ok(HprofReader {
            input,
            offset,
            pending: None,
            header: HprofHeader {
                version,
                id_size,
                timestamp_ms,
            },
        })
    }

    /// The parsed file header.
    pub fn header(&self) -> &HprofHeader {
        &self.header
    }

    /// Absolute offset of the next unread byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// True iff at least one more record header is available.
    pub fn has_next(&mut self) -> Result<bool> {
        if self.pending.is_some() {
            return Ok(true);
        }
        let mut buf = [0u8; 1];
        loop {
            match self.input.read(&mut buf) {
                Ok(0) => return Ok(false),
                Ok(_) => {
                    self.offset += 1;
                    self.pending = Some(buf[0]);
                    return Ok(true);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Consume exactly one top-level record, routing it to `handler`.
    pub fn next<H: RecordHandler>(&mut self, handler: &mut H) -> Result<()> {
        if !self.has_next()? {
            return Err(ConvertError::Truncated {
                offset: self.offset,
            });
        }
        let tag_offset = self.offset - 1;
        let Some(tag) = self.pending.take() else {
            return Err(ConvertError::Truncated {
                offset: self.offset,
            });
        };
        let _time = self.read_u32()?;
        let length = self.read_u32()?;

        match tag {
            tag::STRING => {
                if length < 4 {
                    return Err(ConvertError::RecordLengthMismatch {
                        tag,
                        declared: length,
                        actual: 4,
                    });
                }
                let id = self.read_u32()?;
                let payload = self.read_bytes((length - 4) as usize)?;
                handler.on_string(id, payload)
            }
            tag::LOAD_CLASS => {
                self.expect_length(tag, length, 16)?;
                let record = LoadClassRecord {
                    class_serial: self.read_u32()?,
                    class_id: self.read_u32()?,
                    stack_trace_serial: self.read_u32()?,
                    name_id: self.read_u32()?,
                };
                handler.on_load_class(record)
            }
            tag::UNLOAD_CLASS => {
                self.expect_length(tag, length, 4)?;
                self.skip(length)
            }
            tag::STACK_FRAME => {
                self.expect_length(tag, length, 24)?;
                let record = StackFrameRecord {
                    frame_id: self.read_u32()?,
                    method_name_id: self.read_u32()?,
                    signature_id: self.read_u32()?,
                    source_file_id: self.read_u32()?,
                    class_serial: self.read_u32()?,
                    line: self.read_i32()?,
                };
                handler.on_stack_frame(record)
            }
            tag::STACK_TRACE => {
                if length < 12 {
                    return Err(ConvertError::RecordLengthMismatch {
                        tag,
                        declared: length,
                        actual: 12,
                    });
                }
                let serial = self.read_u32()?;
                let thread_serial = self.read_u32()?;
                let count = self.read_u32()?;
                let implied = 12 + u64::from(count) * 4;
                if u64::from(length) != implied {
                    return Err(ConvertError::RecordLengthMismatch {
                        tag,
                        declared: length,
                        actual: implied,
                    });
                }
                let mut frame_ids = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    frame_ids.push(self.read_u32()?);
                }
                handler.on_stack_trace(StackTraceRecord {
                    serial,
                    thread_serial,
                    frame_ids,
                })
            }
            tag::ALLOC_SITES
            | tag::HEAP_SUMMARY
            | tag::START_THREAD
            | tag::END_THREAD
            | tag::CPU_SAMPLES
            | tag::CONTROL_SETTINGS => self.skip(length),
            tag::HEAP_DUMP | tag::HEAP_DUMP_SEGMENT => {
                let mut records =
                    HeapStream::new(&mut self.input, u64::from(length), self.offset);
                handler.on_heap_dump(&mut records)?;
                let remaining = records.remaining();
                if remaining != 0 {
                    return Err(ConvertError::RecordLengthMismatch {
                        tag,
                        declared: length,
                        actual: u64::from(length) - remaining,
                    });
                }
                self.offset += u64::from(length);
                Ok(())
            }
            tag::HEAP_DUMP_END => {
                self.expect_length(tag, length, 0)?;
                handler.on_heap_dump_end()
            }
            other => Err(ConvertError::UnsupportedRecordTag {
                tag: other,
                offset: tag_offset,
            }),
        }
    }

    fn expect_length(&self, tag: u8, declared: u32, expected: u32) -> Result<()> {
        if declared != expected {
            return Err(ConvertError::RecordLengthMismatch {
                tag,
                declared,
                actual: u64::from(expected),
            });
        }
        Ok(())
    }

    fn read_u32(&mut self) -> Result<u32> {
        let v = stream::read_u32(&mut self.input).map_err(|e| self.io_err(e))?;
        self.offset += 4;
        Ok(v)
    }

    fn read_i32(&mut self) -> Result<i32> {
        let v = stream::read_i32(&mut self.input).map_err(|e| self.io_err(e))?;
        self.offset += 4;
        Ok(v)
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let v = stream::read_bytes(&mut self.input, len).map_err(|e| self.io_err(e))?;
        self.offset += len as u64;
        Ok(v)
    }

    fn skip(&mut self, len: u32) -> Result<()> {
        stream::skip(&mut self.input, u64::from(len)).map_err(|e| self.io_err(e))?;
        self.offset += u64::from(len);
        Ok(())
    }

    fn io_err(&self, e: io::Error) -> ConvertError {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ConvertError::Truncated {
                offset: self.offset,
            }
        } else {
            e.into()
        }
    }
}
