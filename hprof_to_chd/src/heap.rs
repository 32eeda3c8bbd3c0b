//! Heap sub-record dispatcher.
//!
//! The body of a heap dump (or heap dump segment) record is itself a
//! stream of sub-records, each introduced by a single tag byte. Every tag
//! has a fixed layout rule; several are data-dependent (class dumps,
//! instance dumps, arrays), where a count or a type code inside the
//! record decides how many more bytes belong to it. Mis-sizing any one
//! kind corrupts the decode of everything after it, so both the skip and
//! the parse paths here consume byte-exact record bodies.
//!
//! Tags outside the set below are a fatal error. The stream has no
//! resynchronization points, so an unknown tag cannot be skipped.

use crate::stream;
use crate::{ConvertError, Result};
use chd_parse::{BasicType, RootKind};
use std::io::{self, Read};

/// Heap sub-record tags.
pub mod tag {
    pub const ROOT_JNI_GLOBAL: u8 = 0x01;
    pub const ROOT_JNI_LOCAL: u8 = 0x02;
    pub const ROOT_JAVA_FRAME: u8 = 0x03;
    pub const ROOT_NATIVE_STACK: u8 = 0x04;
    pub const ROOT_STICKY_CLASS: u8 = 0x05;
    pub const ROOT_THREAD_BLOCK: u8 = 0x06;
    pub const ROOT_MONITOR_USED: u8 = 0x07;
    pub const ROOT_THREAD_OBJECT: u8 = 0x08;
    pub const CLASS_DUMP: u8 = 0x20;
    pub const INSTANCE_DUMP: u8 = 0x21;
    pub const OBJECT_ARRAY_DUMP: u8 = 0x22;
    pub const PRIMITIVE_ARRAY_DUMP: u8 = 0x23;
    pub const ROOT_UNKNOWN: u8 = 0xFF;

    // Android tags below
    pub const ROOT_INTERNED_STRING: u8 = 0x89;
    pub const ROOT_FINALIZING: u8 = 0x8A;
    pub const ROOT_DEBUGGER: u8 = 0x8B;
    pub const ROOT_REFERENCE_CLEANUP: u8 = 0x8C;
    pub const ROOT_VM_INTERNAL: u8 = 0x8D;
    pub const ROOT_JNI_MONITOR: u8 = 0x8E;
    pub const ROOT_UNREACHABLE: u8 = 0x90;
    pub const PRIMITIVE_ARRAY_NODATA: u8 = 0xC3;
    pub const HEAP_DUMP_INFO: u8 = 0xFE;
}

// ============================================================================
// Bounded segment cursor
// ============================================================================

/// Read cursor over the body of one heap dump segment.
///
/// Bounded by the segment's declared length and tracking the absolute
/// source offset for error values. A sub-record that would read past the
/// segment boundary means the outer record's declared length and the
/// sub-record layouts disagree, which is fatal.
pub struct HeapStream<'a> {
    input: &'a mut (dyn Read + 'a),
    remaining: u64,
    offset: u64,
}

impl<'a> HeapStream<'a> {
    pub fn new(input: &'a mut (dyn Read + 'a), len: u64, base_offset: u64) -> Self {
        HeapStream {
            input,
            remaining: len,
            offset: base_offset,
        }
    }

    /// Bytes of the segment not yet consumed.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Absolute offset of the next byte in the source stream.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read the next sub-record tag, or `None` at the end of the segment.
    pub fn next_tag(&mut self) -> Result<Option<u8>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        Ok(Some(self.read_u8()?))
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        let v = stream::read_u8(self.input).map_err(|e| self.io_err(e))?;
        self.advance(1);
        Ok(v)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.ensure(2)?;
        let v = stream::read_u16(self.input).map_err(|e| self.io_err(e))?;
        self.advance(2);
        Ok(v)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        let v = stream::read_u32(self.input).map_err(|e| self.io_err(e))?;
        self.advance(4);
        Ok(v)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        self.ensure(len as u64)?;
        let v = stream::read_bytes(self.input, len).map_err(|e| self.io_err(e))?;
        self.advance(len as u64);
        Ok(v)
    }

    pub fn skip(&mut self, len: u64) -> Result<()> {
        self.ensure(len)?;
        stream::skip(self.input, len).map_err(|e| self.io_err(e))?;
        self.advance(len);
        Ok(())
    }

    /// Read and decode a basic type code.
    pub fn read_basic_type(&mut self) -> Result<BasicType> {
        let at = self.offset;
        let code = self.read_u8()?;
        BasicType::from_code(code).ok_or(ConvertError::UnknownBasicType { code, offset: at })
    }

    fn ensure(&self, len: u64) -> Result<()> {
        if self.remaining < len {
            return Err(ConvertError::Truncated {
                offset: self.offset,
            });
        }
        Ok(())
    }

    fn advance(&mut self, len: u64) {
        self.remaining -= len;
        self.offset += len;
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

// ============================================================================
// Sub-record types
// ============================================================================

/// Constant pool entry of a class dump, value retained verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstantEntry {
    pub index: u16,
    pub ty: BasicType,
    pub value: Vec<u8>,
}

/// Static field of a class dump, value retained verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticEntry {
    pub name_id: u32,
    pub ty: BasicType,
    pub value: Vec<u8>,
}

/// Instance field declaration of a class dump (no value).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldEntry {
    pub name_id: u32,
    pub ty: BasicType,
}

/// A fully parsed class dump.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDumpRecord {
    pub class_id: u32,
    pub stack_trace_serial: u32,
    /// 0 when the class has no super class.
    pub super_id: u32,
    pub class_loader_id: u32,
    pub signers_id: u32,
    pub protection_domain_id: u32,
    pub instance_size: u32,
    pub const_pool: Vec<ConstantEntry>,
    pub static_fields: Vec<StaticEntry>,
    pub instance_fields: Vec<FieldEntry>,
}

/// An instance dump with its raw field data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDumpRecord {
    pub object_id: u32,
    pub stack_trace_serial: u32,
    pub class_id: u32,
    pub data: Vec<u8>,
}

/// An object array dump with its element references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectArrayRecord {
    pub object_id: u32,
    pub stack_trace_serial: u32,
    pub class_id: u32,
    pub elements: Vec<u32>,
}

/// A primitive array dump. Element data is consumed but not kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimitiveArrayRecord {
    pub object_id: u32,
    pub stack_trace_serial: u32,
    pub ty: BasicType,
    pub length: u32,
}

/// A GC root, reduced to its kind and object id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootRecord {
    pub kind: RootKind,
    pub object_id: u32,
}

// ============================================================================
// Skip/measure mode
// ============================================================================

/// True for the tags that introduce a GC root.
pub fn is_root(tag: u8) -> bool {
    matches!(
        tag,
        tag::ROOT_UNKNOWN
            | tag::ROOT_JNI_GLOBAL
            | tag::ROOT_JNI_LOCAL
            | tag::ROOT_JAVA_FRAME
            | tag::ROOT_NATIVE_STACK
            | tag::ROOT_STICKY_CLASS
            | tag::ROOT_THREAD_BLOCK
            | tag::ROOT_MONITOR_USED
            | tag::ROOT_THREAD_OBJECT
            | tag::ROOT_INTERNED_STRING
            | tag::ROOT_FINALIZING
            | tag::ROOT_DEBUGGER
            | tag::ROOT_REFERENCE_CLEANUP
            | tag::ROOT_VM_INTERNAL
            | tag::ROOT_JNI_MONITOR
            | tag::ROOT_UNREACHABLE
    )
}

/// Consume exactly the bytes belonging to the sub-record introduced by
/// `tag`, leaving the cursor at the next tag byte (or the segment end).
pub fn skip_record(tag: u8, records: &mut HeapStream<'_>) -> Result<()> {
    match tag {
        tag::ROOT_UNKNOWN => records.skip(4), // Object id
        tag::ROOT_JNI_GLOBAL => records.skip(8), // Object id + JNI global ref
        tag::ROOT_JNI_LOCAL => records.skip(12), // Object id + thread serial + frame number
        tag::ROOT_JAVA_FRAME => records.skip(12), // Object id + thread serial + frame number
        tag::ROOT_NATIVE_STACK => records.skip(8), // Object id + thread serial
        tag::ROOT_STICKY_CLASS => records.skip(4), // Object id
        tag::ROOT_THREAD_BLOCK => records.skip(8), // Object id + thread serial
        tag::ROOT_MONITOR_USED => records.skip(4), // Object id
        tag::ROOT_THREAD_OBJECT => records.skip(12), // Object id + thread serial + stack serial
        tag::CLASS_DUMP => {
            // Ids, serials, reserved words and instance size
            records.skip(36)?;
            let const_count = records.read_u16()?;
            for _ in 0..const_count {
                records.skip(2)?; // Pool index
                let ty = records.read_basic_type()?;
                records.skip(ty.width() as u64)?;
            }
            let static_count = records.read_u16()?;
            for _ in 0..static_count {
                records.skip(4)?; // Name string id
                let ty = records.read_basic_type()?;
                records.skip(ty.width() as u64)?;
            }
            let field_count = records.read_u16()?;
            records.skip(u64::from(field_count) * 5) // Name string id + type
        }
        tag::INSTANCE_DUMP => {
            records.skip(12)?; // Object id + stack trace serial + class id
            let size = records.read_u32()?;
            records.skip(u64::from(size))
        }
        tag::OBJECT_ARRAY_DUMP => {
            records.skip(8)?; // Object id + stack trace serial
            let count = records.read_u32()?;
            records.skip(4)?; // Array class id
            records.skip(u64::from(count) * 4) // Element references
        }
        tag::PRIMITIVE_ARRAY_DUMP => {
            records.skip(8)?; // Object id + stack trace serial
            let count = records.read_u32()?;
            let ty = records.read_basic_type()?;
            records.skip(u64::from(count) * ty.width() as u64)
        }
        // Android tags below
        tag::HEAP_DUMP_INFO => records.skip(8), // Heap type + heap name string id
        tag::ROOT_INTERNED_STRING => records.skip(4), // Object id
        tag::ROOT_FINALIZING => records.skip(4), // Object id
        tag::ROOT_DEBUGGER => records.skip(4),  // Object id
        tag::ROOT_REFERENCE_CLEANUP => records.skip(4), // Object id
        tag::ROOT_VM_INTERNAL => records.skip(4), // Object id
        tag::ROOT_JNI_MONITOR => records.skip(12), // Object id + thread serial + frame number
        tag::ROOT_UNREACHABLE => records.skip(4), // Object id
        tag::PRIMITIVE_ARRAY_NODATA => records.skip(13), // Object id + serial + count + type
        other => Err(ConvertError::UnsupportedHeapTag {
            tag: other,
            offset: records.offset().saturating_sub(1),
        }),
    }
}

// ============================================================================
// Parse mode
// ============================================================================

/// Parse a class dump body.
pub fn read_class_dump(records: &mut HeapStream<'_>) -> Result<ClassDumpRecord> {
    let class_id = records.read_u32()?;
    let stack_trace_serial = records.read_u32()?;
    let super_id = records.read_u32()?;
    let class_loader_id = records.read_u32()?;
    let signers_id = records.read_u32()?;
    let protection_domain_id = records.read_u32()?;
    records.skip(8)?; // Two reserved words
    let instance_size = records.read_u32()?;

    let const_count = records.read_u16()?;
    let mut const_pool = Vec::with_capacity(const_count as usize);
    for _ in 0..const_count {
        let index = records.read_u16()?;
        let ty = records.read_basic_type()?;
        let value = records.read_bytes(ty.width())?;
        const_pool.push(ConstantEntry { index, ty, value });
    }

    let static_count = records.read_u16()?;
    let mut static_fields = Vec::with_capacity(static_count as usize);
    for _ in 0..static_count {
        let name_id = records.read_u32()?;
        let ty = records.read_basic_type()?;
        let value = records.read_bytes(ty.width())?;
        static_fields.push(StaticEntry { name_id, ty, value });
    }

    let field_count = records.read_u16()?;
    let mut instance_fields = Vec::with_capacity(field_count as usize);
    for _ in 0..field_count {
        instance_fields.push(FieldEntry {
            name_id: records.read_u32()?,
            ty: records.read_basic_type()?,
        });
    }

    Ok(ClassDumpRecord {
        class_id,
        stack_trace_serial,
        super_id,
        class_loader_id,
        signers_id,
        protection_domain_id,
        instance_size,
        const_pool,
        static_fields,
        instance_fields,
    })
}

/// Parse an instance dump body, keeping the raw field data.
pub fn read_instance_dump(records: &mut HeapStream<'_>) -> Result<InstanceDumpRecord> {
    let object_id = records.read_u32()?;
    let stack_trace_serial = records.read_u32()?;
    let class_id = records.read_u32()?;
    let size = records.read_u32()?;
    let data = records.read_bytes(size as usize)?;
    Ok(InstanceDumpRecord {
        object_id,
        stack_trace_serial,
        class_id,
        data,
    })
}

/// Parse an object array dump body.
pub fn read_object_array(records: &mut HeapStream<'_>) -> Result<ObjectArrayRecord> {
    let object_id = records.read_u32()?;
    let stack_trace_serial = records.read_u32()?;
    let count = records.read_u32()?;
    let class_id = records.read_u32()?;
    let mut elements = Vec::with_capacity(count as usize);
    for _ in 0..count {
        elements.push(records.read_u32()?);
    }
    Ok(ObjectArrayRecord {
        object_id,
        stack_trace_serial,
        class_id,
        elements,
    })
}

/// Parse a primitive array dump body, discarding the element data.
pub fn read_primitive_array(records: &mut HeapStream<'_>) -> Result<PrimitiveArrayRecord> {
    let object_id = records.read_u32()?;
    let stack_trace_serial = records.read_u32()?;
    let length = records.read_u32()?;
    let ty = records.read_basic_type()?;
    records.skip(u64::from(length) * ty.width() as u64)?;
    Ok(PrimitiveArrayRecord {
        object_id,
        stack_trace_serial,
        ty,
        length,
    })
}

/// Parse a no-data primitive array body (same shape as a primitive array
/// dump, but the runtime already omitted the element data).
pub fn read_primitive_array_nodata(records: &mut HeapStream<'_>) -> Result<PrimitiveArrayRecord> {
    let object_id = records.read_u32()?;
    let stack_trace_serial = records.read_u32()?;
    let length = records.read_u32()?;
    let ty = records.read_basic_type()?;
    Ok(PrimitiveArrayRecord {
        object_id,
        stack_trace_serial,
        ty,
        length,
    })
}

/// Parse a root sub-record, dropping thread serials, frame numbers and
/// JNI ref ids.
pub fn read_root(tag: u8, records: &mut HeapStream<'_>) -> Result<RootRecord> {
    let at = records.offset().saturating_sub(1);
    let kind = RootKind::from_code(tag).ok_or(ConvertError::UnsupportedHeapTag {
        tag,
        offset: at,
    })?;
    let object_id = records.read_u32()?;
    match tag {
        tag::ROOT_JNI_GLOBAL => records.skip(4)?, // JNI global ref
        tag::ROOT_NATIVE_STACK | tag::ROOT_THREAD_BLOCK => records.skip(4)?, // Thread serial
        tag::ROOT_JNI_LOCAL
        | tag::ROOT_JAVA_FRAME
        | tag::ROOT_THREAD_OBJECT
        | tag::ROOT_JNI_MONITOR => records.skip(8)?, // Thread serial + frame/stack serial
        _ => {}
    }
    Ok(RootRecord { kind, object_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{write_u16, write_u32, write_u8};
    use std::io::Cursor;

    fn heap_stream(bytes: &[u8]) -> (Cursor<Vec<u8>>, u64) {
        (Cursor::new(bytes.to_vec()), bytes.len() as u64)
    }

    fn class_dump_body(
        class_id: u32,
        super_id: u32,
        statics: &[(u32, BasicType, &[u8])],
        fields: &[(u32, BasicType)],
    ) -> Vec<u8> {
        let mut body = Vec::new();
        write_u32(&mut body, class_id).unwrap();
        write_u32(&mut body, 0).unwrap(); // stack trace serial
        write_u32(&mut body, super_id).unwrap();
        write_u32(&mut body, 0).unwrap(); // class loader
        write_u32(&mut body, 0).unwrap(); // signers
        write_u32(&mut body, 0).unwrap(); // protection domain
        write_u32(&mut body, 0).unwrap();
        write_u32(&mut body, 0).unwrap(); // reserved
        write_u32(&mut body, 16).unwrap(); // instance size
        write_u16(&mut body, 0).unwrap(); // constant pool
        write_u16(&mut body, statics.len() as u16).unwrap();
        for (name_id, ty, value) in statics {
            write_u32(&mut body, *name_id).unwrap();
            write_u8(&mut body, ty.code()).unwrap();
            body.extend_from_slice(value);
        }
        write_u16(&mut body, fields.len() as u16).unwrap();
        for (name_id, ty) in fields {
            write_u32(&mut body, *name_id).unwrap();
            write_u8(&mut body, ty.code()).unwrap();
        }
        body
    }

    #[test]
    fn primitive_int_array_count_10_spans_53_bytes() {
        let mut body = Vec::new();
        write_u32(&mut body, 0x100).unwrap(); // object id
        write_u32(&mut body, 1).unwrap(); // stack trace serial
        write_u32(&mut body, 10).unwrap(); // element count
        write_u8(&mut body, BasicType::Int.code()).unwrap();
        body.extend_from_slice(&[0u8; 40]);
        assert_eq!(body.len(), 53);

        let (mut cursor, len) = heap_stream(&body);
        let mut records = HeapStream::new(&mut cursor, len, 0);
        skip_record(tag::PRIMITIVE_ARRAY_DUMP, &mut records).unwrap();
        assert_eq!(records.remaining(), 0);
        assert_eq!(records.offset(), 53);
    }

    #[test]
    fn skip_consumes_each_fixed_width_record_exactly() {
        // (tag, body length) pairs from the format's layout table
        let table: &[(u8, usize)] = &[
            (tag::ROOT_UNKNOWN, 4),
            (tag::ROOT_JNI_GLOBAL, 8),
            (tag::ROOT_JNI_LOCAL, 12),
            (tag::ROOT_JAVA_FRAME, 12),
            (tag::ROOT_NATIVE_STACK, 8),
            (tag::ROOT_STICKY_CLASS, 4),
            (tag::ROOT_THREAD_BLOCK, 8),
            (tag::ROOT_MONITOR_USED, 4),
            (tag::ROOT_THREAD_OBJECT, 12),
            (tag::HEAP_DUMP_INFO, 8),
            (tag::ROOT_INTERNED_STRING, 4),
            (tag::ROOT_FINALIZING, 4),
            (tag::ROOT_DEBUGGER, 4),
            (tag::ROOT_REFERENCE_CLEANUP, 4),
            (tag::ROOT_VM_INTERNAL, 4),
            (tag::ROOT_JNI_MONITOR, 12),
            (tag::ROOT_UNREACHABLE, 4),
            (tag::PRIMITIVE_ARRAY_NODATA, 13),
        ];
        for (tag, len) in table {
            let body = vec![0u8; *len];
            let (mut cursor, stream_len) = heap_stream(&body);
            let mut records = HeapStream::new(&mut cursor, stream_len, 0);
            skip_record(*tag, &mut records).unwrap();
            assert_eq!(records.remaining(), 0, "tag {tag:#04x}");
        }
    }

    #[test]
    fn skip_walks_a_full_segment() {
        let mut segment = Vec::new();
        write_u8(&mut segment, tag::ROOT_STICKY_CLASS).unwrap();
        write_u32(&mut segment, 0x100).unwrap();
        write_u8(&mut segment, tag::CLASS_DUMP).unwrap();
        segment.extend_from_slice(&class_dump_body(
            0x100,
            0,
            &[(0x10, BasicType::Long, &[0u8; 8])],
            &[(0x11, BasicType::Object), (0x12, BasicType::Short)],
        ));
        write_u8(&mut segment, tag::INSTANCE_DUMP).unwrap();
        write_u32(&mut segment, 0x200).unwrap();
        write_u32(&mut segment, 0).unwrap();
        write_u32(&mut segment, 0x100).unwrap();
        write_u32(&mut segment, 6).unwrap();
        segment.extend_from_slice(&[0u8; 6]);

        let (mut cursor, len) = heap_stream(&segment);
        let mut records = HeapStream::new(&mut cursor, len, 0);
        let mut seen = Vec::new();
        while let Some(tag) = records.next_tag().unwrap() {
            seen.push(tag);
            skip_record(tag, &mut records).unwrap();
        }
        assert_eq!(
            seen,
            vec![tag::ROOT_STICKY_CLASS, tag::CLASS_DUMP, tag::INSTANCE_DUMP]
        );
        assert_eq!(records.remaining(), 0);
    }

    #[test]
    fn class_dump_parses_field_groups() {
        let body = class_dump_body(
            0x100,
            0x90,
            &[(0x10, BasicType::Int, &[0, 0, 0, 7])],
            &[(0x11, BasicType::Object), (0x12, BasicType::Boolean)],
        );
        let (mut cursor, len) = heap_stream(&body);
        let mut records = HeapStream::new(&mut cursor, len, 0);
        let class = read_class_dump(&mut records).unwrap();

        assert_eq!(records.remaining(), 0);
        assert_eq!(class.class_id, 0x100);
        assert_eq!(class.super_id, 0x90);
        assert_eq!(class.instance_size, 16);
        assert!(class.const_pool.is_empty());
        assert_eq!(class.static_fields.len(), 1);
        assert_eq!(class.static_fields[0].value, vec![0, 0, 0, 7]);
        assert_eq!(class.instance_fields.len(), 2);
        assert_eq!(class.instance_fields[0].ty, BasicType::Object);
    }

    #[test]
    fn instance_dump_keeps_raw_data() {
        let mut body = Vec::new();
        write_u32(&mut body, 0x200).unwrap();
        write_u32(&mut body, 5).unwrap();
        write_u32(&mut body, 0x100).unwrap();
        write_u32(&mut body, 3).unwrap();
        body.extend_from_slice(&[0xAA, 0xBB, 0xCC]);

        let (mut cursor, len) = heap_stream(&body);
        let mut records = HeapStream::new(&mut cursor, len, 0);
        let dump = read_instance_dump(&mut records).unwrap();
        assert_eq!(records.remaining(), 0);
        assert_eq!(dump.object_id, 0x200);
        assert_eq!(dump.class_id, 0x100);
        assert_eq!(dump.data, vec![0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn object_array_parses_elements() {
        let mut body = Vec::new();
        write_u32(&mut body, 0x300).unwrap();
        write_u32(&mut body, 0).unwrap();
        write_u32(&mut body, 2).unwrap(); // count
        write_u32(&mut body, 0x101).unwrap(); // array class
        write_u32(&mut body, 0x200).unwrap();
        write_u32(&mut body, 0).unwrap();

        let (mut cursor, len) = heap_stream(&body);
        let mut records = HeapStream::new(&mut cursor, len, 0);
        let array = read_object_array(&mut records).unwrap();
        assert_eq!(records.remaining(), 0);
        assert_eq!(array.class_id, 0x101);
        assert_eq!(array.elements, vec![0x200, 0]);
    }

    #[test]
    fn primitive_array_discards_data() {
        let mut body = Vec::new();
        write_u32(&mut body, 0x400).unwrap();
        write_u32(&mut body, 0).unwrap();
        write_u32(&mut body, 4).unwrap(); // count
        write_u8(&mut body, BasicType::Char.code()).unwrap();
        body.extend_from_slice(&[0u8; 8]);

        let (mut cursor, len) = heap_stream(&body);
        let mut records = HeapStream::new(&mut cursor, len, 0);
        let array = read_primitive_array(&mut records).unwrap();
        assert_eq!(records.remaining(), 0);
        assert_eq!(array.ty, BasicType::Char);
        assert_eq!(array.length, 4);
    }

    #[test]
    fn roots_collapse_to_kind_and_object_id() {
        let cases: &[(u8, usize, RootKind)] = &[
            (tag::ROOT_UNKNOWN, 0, RootKind::Unknown),
            (tag::ROOT_JNI_GLOBAL, 4, RootKind::JniGlobal),
            (tag::ROOT_JNI_LOCAL, 8, RootKind::JniLocal),
            (tag::ROOT_JAVA_FRAME, 8, RootKind::JavaFrame),
            (tag::ROOT_NATIVE_STACK, 4, RootKind::NativeStack),
            (tag::ROOT_STICKY_CLASS, 0, RootKind::StickyClass),
            (tag::ROOT_THREAD_BLOCK, 4, RootKind::ThreadBlock),
            (tag::ROOT_MONITOR_USED, 0, RootKind::MonitorUsed),
            (tag::ROOT_THREAD_OBJECT, 8, RootKind::ThreadObject),
            (tag::ROOT_INTERNED_STRING, 0, RootKind::InternedString),
            (tag::ROOT_JNI_MONITOR, 8, RootKind::JniMonitor),
            (tag::ROOT_UNREACHABLE, 0, RootKind::Unreachable),
        ];
        for (tag, extra, kind) in cases {
            let mut body = Vec::new();
            write_u32(&mut body, 0x777).unwrap();
            body.extend_from_slice(&vec![0u8; *extra]);
            let (mut cursor, len) = heap_stream(&body);
            let mut records = HeapStream::new(&mut cursor, len, 0);
            let root = read_root(*tag, &mut records).unwrap();
            assert_eq!(records.remaining(), 0, "tag {tag:#04x}");
            assert_eq!(root.kind, *kind);
            assert_eq!(root.object_id, 0x777);
        }
    }

    #[test]
    fn unknown_tag_is_fatal() {
        let (mut cursor, len) = heap_stream(&[0u8; 16]);
        let mut records = HeapStream::new(&mut cursor, len, 100);
        let result = skip_record(0x47, &mut records);
        assert!(matches!(
            result,
            Err(ConvertError::UnsupportedHeapTag { tag: 0x47, .. })
        ));
    }

    #[test]
    fn unknown_basic_type_is_fatal() {
        let mut body = Vec::new();
        write_u32(&mut body, 0x400).unwrap();
        write_u32(&mut body, 0).unwrap();
        write_u32(&mut body, 1).unwrap();
        write_u8(&mut body, 13).unwrap(); // no such type code
        let (mut cursor, len) = heap_stream(&body);
        let mut records = HeapStream::new(&mut cursor, len, 0);
        let result = skip_record(tag::PRIMITIVE_ARRAY_DUMP, &mut records);
        assert!(matches!(
            result,
            Err(ConvertError::UnknownBasicType { code: 13, .. })
        ));
    }

    #[test]
    fn record_spilling_past_segment_end_is_fatal() {
        // Declares 6 data bytes but the segment ends after 2
        let mut body = Vec::new();
        write_u32(&mut body, 0x200).unwrap();
        write_u32(&mut body, 0).unwrap();
        write_u32(&mut body, 0x100).unwrap();
        write_u32(&mut body, 6).unwrap();
        body.extend_from_slice(&[0u8; 2]);

        let (mut cursor, len) = heap_stream(&body);
        let mut records = HeapStream::new(&mut cursor, len, 0);
        let result = skip_record(tag::INSTANCE_DUMP, &mut records);
        assert!(matches!(result, Err(ConvertError::Truncated { .. })));
    }
}
