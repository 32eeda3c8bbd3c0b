//! CHD (Compact Heap Dump) parser and writer library.
//!
//! CHD is a lossy, compact derivative of an HPROF heap dump. It keeps the
//! object reference graph, class shapes and GC roots, and drops primitive
//! field values and string bodies (string names appear only as 4-byte
//! hashes). This library parses CHD files from any `Read`-able source and
//! writes them incrementally through [`ChdWriter`].
//!
//! # Example
//!
//! ```no_run
//! use std::fs::File;
//! use chd_parse::ChdFile;
//!
//! let file = File::open("dump.chd").unwrap();
//! let chd = ChdFile::parse(file).unwrap();
//!
//! println!("Class shapes: {}", chd.classes.len());
//! println!("Instances: {}", chd.instances.len());
//! ```

use std::collections::HashMap;
use std::io::{self, BufReader, Read, Write};
use thiserror::Error;

/// Errors that can occur during CHD parsing.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("not a CHD file (bad magic)")]
    BadMagic,

    #[error("unsupported CHD version {0}")]
    UnsupportedVersion(u32),

    #[error("unsupported identifier size {0}")]
    UnsupportedIdSize(u32),

    #[error("truncated file at offset {offset}")]
    Truncated { offset: u64 },

    #[error("unknown record tag {tag:#04x} at offset {offset}")]
    UnknownRecordTag { tag: u8, offset: u64 },

    #[error("unknown basic type {code} at offset {offset}")]
    UnknownBasicType { code: u8, offset: u64 },

    #[error("unknown root kind {code:#04x} at offset {offset}")]
    UnknownRootKind { code: u8, offset: u64 },

    #[error("duplicate class shape for class {0:#010x}")]
    DuplicateClassShape(u32),

    #[error("instance {object_id:#010x} references class {class_id:#010x} before its shape")]
    UnresolvedClassShape { object_id: u32, class_id: u32 },

    #[error("file ends without an end marker")]
    MissingEndMarker,

    #[error("trailing data after the end marker at offset {offset}")]
    TrailingData { offset: u64 },
}

/// Result type for CHD parsing operations.
pub type Result<T> = std::result::Result<T, ParseError>;

/// Errors that can occur during CHD writing.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("field value for type {ty:?} must be {expected} bytes, got {actual}")]
    InvalidValueWidth {
        ty: BasicType,
        expected: usize,
        actual: usize,
    },

    #[error("class {class_id:#010x} has a field group with too many entries ({count})")]
    GroupTooLarge { class_id: u32, count: usize },

    #[error("instance {object_id:#010x} has too many references ({count})")]
    TooManyReferences { object_id: u32, count: usize },
}

/// Result type for CHD writing operations.
pub type WriteResult<T> = std::result::Result<T, WriteError>;

// ============================================================================
// Format constants
// ============================================================================

/// Magic bytes opening every CHD file.
pub const MAGIC: [u8; 4] = *b"CHD1";

/// Current container format version.
pub const FORMAT_VERSION: u32 = 1;

/// Identifier width in bytes. CHD carries the 4-byte identifiers of the
/// source dumps it is derived from.
pub const ID_SIZE: u32 = 4;

/// Record tags of the CHD container.
pub mod record_tag {
    /// Terminates the file; a CHD without it is unfinished.
    pub const END: u8 = 0x00;
    pub const CLASS_SHAPE: u8 = 0x01;
    pub const LOAD_CLASS: u8 = 0x02;
    pub const ROOT: u8 = 0x03;
    pub const INSTANCE: u8 = 0x04;
    pub const OBJECT_ARRAY: u8 = 0x05;
    pub const PRIMITIVE_ARRAY: u8 = 0x06;
}

// ============================================================================
// Vocabulary types
// ============================================================================

/// Field and array element types, with the type codes and encoded widths
/// of the source heap dump format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasicType {
    Object,
    Boolean,
    Char,
    Float,
    Double,
    Byte,
    Short,
    Int,
    Long,
}

impl BasicType {
    /// Decode a type code. Unknown codes have no mapping.
    pub fn from_code(code: u8) -> Option<BasicType> {
        match code {
            2 => Some(BasicType::Object),
            4 => Some(BasicType::Boolean),
            5 => Some(BasicType::Char),
            6 => Some(BasicType::Float),
            7 => Some(BasicType::Double),
            8 => Some(BasicType::Byte),
            9 => Some(BasicType::Short),
            10 => Some(BasicType::Int),
            11 => Some(BasicType::Long),
            _ => None,
        }
    }

    /// The wire code of this type.
    pub fn code(self) -> u8 {
        match self {
            BasicType::Object => 2,
            BasicType::Boolean => 4,
            BasicType::Char => 5,
            BasicType::Float => 6,
            BasicType::Double => 7,
            BasicType::Byte => 8,
            BasicType::Short => 9,
            BasicType::Int => 10,
            BasicType::Long => 11,
        }
    }

    /// Encoded width of one value of this type. Depends only on the type
    /// code (object references are 4-byte identifiers).
    pub fn width(self) -> usize {
        match self {
            BasicType::Boolean | BasicType::Byte => 1,
            BasicType::Char | BasicType::Short => 2,
            BasicType::Object | BasicType::Float | BasicType::Int => 4,
            BasicType::Double | BasicType::Long => 8,
        }
    }
}

/// GC root kinds. The wire codes are the heap sub-record tags of the
/// source dump format, so a CHD root names the same kind of root the
/// source stream did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootKind {
    Unknown,
    JniGlobal,
    JniLocal,
    JavaFrame,
    NativeStack,
    StickyClass,
    ThreadBlock,
    MonitorUsed,
    ThreadObject,
    InternedString,
    Finalizing,
    Debugger,
    ReferenceCleanup,
    VmInternal,
    JniMonitor,
    Unreachable,
}

impl RootKind {
    /// Decode a root kind code. Unknown codes have no mapping.
    pub fn from_code(code: u8) -> Option<RootKind> {
        match code {
            0xFF => Some(RootKind::Unknown),
            0x01 => Some(RootKind::JniGlobal),
            0x02 => Some(RootKind::JniLocal),
            0x03 => Some(RootKind::JavaFrame),
            0x04 => Some(RootKind::NativeStack),
            0x05 => Some(RootKind::StickyClass),
            0x06 => Some(RootKind::ThreadBlock),
            0x07 => Some(RootKind::MonitorUsed),
            0x08 => Some(RootKind::ThreadObject),
            0x89 => Some(RootKind::InternedString),
            0x8A => Some(RootKind::Finalizing),
            0x8B => Some(RootKind::Debugger),
            0x8C => Some(RootKind::ReferenceCleanup),
            0x8D => Some(RootKind::VmInternal),
            0x8E => Some(RootKind::JniMonitor),
            0x90 => Some(RootKind::Unreachable),
            _ => None,
        }
    }

    /// The wire code of this root kind.
    pub fn code(self) -> u8 {
        match self {
            RootKind::Unknown => 0xFF,
            RootKind::JniGlobal => 0x01,
            RootKind::JniLocal => 0x02,
            RootKind::JavaFrame => 0x03,
            RootKind::NativeStack => 0x04,
            RootKind::StickyClass => 0x05,
            RootKind::ThreadBlock => 0x06,
            RootKind::MonitorUsed => 0x07,
            RootKind::ThreadObject => 0x08,
            RootKind::InternedString => 0x89,
            RootKind::Finalizing => 0x8A,
            RootKind::Debugger => 0x8B,
            RootKind::ReferenceCleanup => 0x8C,
            RootKind::VmInternal => 0x8D,
            RootKind::JniMonitor => 0x8E,
            RootKind::Unreachable => 0x90,
        }
    }
}

// ============================================================================
// Record types
// ============================================================================

/// Constant pool entry of a class shape. The value is retained verbatim,
/// sized by the type.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstPoolEntry {
    pub index: u16,
    pub ty: BasicType,
    pub value: Vec<u8>,
}

/// Static field of a class shape. The name survives only as a hash; the
/// value is retained verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticField {
    pub name_hash: u32,
    pub ty: BasicType,
    pub value: Vec<u8>,
}

/// Instance field descriptor. No value: instance values live (or lived)
/// in the instance records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name_hash: u32,
    pub ty: BasicType,
}

/// The shape of one class: identity, super class and ordered fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassShape {
    pub class_id: u32,
    /// 0 when the class has no super class.
    pub super_id: u32,
    pub instance_size: u32,
    pub const_pool: Vec<ConstPoolEntry>,
    pub static_fields: Vec<StaticField>,
    pub instance_fields: Vec<FieldDescriptor>,
}

/// Mapping from a class object id to the hash of its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadClass {
    pub class_id: u32,
    pub name_hash: u32,
}

/// One GC root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Root {
    pub kind: RootKind,
    pub object_id: u32,
}

/// One object instance, reduced to its identity and outgoing references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub object_id: u32,
    pub class_id: u32,
    /// Object-reference field values in field order, class first, then
    /// super classes.
    pub references: Vec<u32>,
}

/// One object array with its element references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectArray {
    pub object_id: u32,
    pub class_id: u32,
    pub elements: Vec<u32>,
}

/// One primitive array. Element data is never stored, only the type and
/// element count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimitiveArray {
    pub object_id: u32,
    pub ty: BasicType,
    pub length: u32,
}

// ============================================================================
// Main ChdFile type
// ============================================================================

/// A parsed CHD file.
#[derive(Debug, Clone)]
pub struct ChdFile {
    /// Container format version.
    pub version: u32,
    /// Identifier width declared by the file.
    pub id_size: u32,
    /// Class id to name hash mappings.
    pub load_classes: Vec<LoadClass>,
    /// Class shapes, keyed by class id.
    pub classes: HashMap<u32, ClassShape>,
    /// GC roots, in file order.
    pub roots: Vec<Root>,
    /// Instance records, in file order.
    pub instances: Vec<Instance>,
    /// Object array records, in file order.
    pub object_arrays: Vec<ObjectArray>,
    /// Primitive array records, in file order.
    pub primitive_arrays: Vec<PrimitiveArray>,
}

impl ChdFile {
    /// Parse a CHD file from any `Read`-able source.
    ///
    /// Parsing validates the container as it goes: magic and version,
    /// known type and root kind codes, unique class ids, the invariant
    /// that every instance's class shape appears earlier in the stream,
    /// and the end marker (its absence means the producing run did not
    /// finish, and the file must be discarded).
    pub fn parse<R: Read>(reader: R) -> Result<Self> {
        let mut input = Input::new(BufReader::new(reader));

        let magic = input.bytes(4)?;
        if magic != MAGIC {
            return Err(ParseError::BadMagic);
        }
        let version = input.u32()?;
        if version != FORMAT_VERSION {
            return Err(ParseError::UnsupportedVersion(version));
        }
        let id_size = input.u32()?;
        if id_size != ID_SIZE {
            return Err(ParseError::UnsupportedIdSize(id_size));
        }

        let mut load_classes = Vec::new();
        let mut classes: HashMap<u32, ClassShape> = HashMap::new();
        let mut roots = Vec::new();
        let mut instances = Vec::new();
        let mut object_arrays = Vec::new();
        let mut primitive_arrays = Vec::new();

        loop {
            let tag_offset = input.offset();
            let Some(tag) = input.tag()? else {
                return Err(ParseError::MissingEndMarker);
            };
            match tag {
                record_tag::END => {
                    let trailing = input.offset();
                    if input.tag()?.is_some() {
                        return Err(ParseError::TrailingData { offset: trailing });
                    }
                    break;
                }
                record_tag::CLASS_SHAPE => {
                    let shape = Self::parse_class_shape(&mut input)?;
                    let class_id = shape.class_id;
                    if classes.insert(class_id, shape).is_some() {
                        return Err(ParseError::DuplicateClassShape(class_id));
                    }
                }
                record_tag::LOAD_CLASS => {
                    load_classes.push(LoadClass {
                        class_id: input.u32()?,
                        name_hash: input.u32()?,
                    });
                }
                record_tag::ROOT => {
                    let kind = input.root_kind()?;
                    roots.push(Root {
                        kind,
                        object_id: input.u32()?,
                    });
                }
                record_tag::INSTANCE => {
                    let object_id = input.u32()?;
                    let class_id = input.u32()?;
                    if !classes.contains_key(&class_id) {
                        return Err(ParseError::UnresolvedClassShape {
                            object_id,
                            class_id,
                        });
                    }
                    let count = input.u32()?;
                    let mut references = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        references.push(input.u32()?);
                    }
                    instances.push(Instance {
                        object_id,
                        class_id,
                        references,
                    });
                }
                record_tag::OBJECT_ARRAY => {
                    let object_id = input.u32()?;
                    let class_id = input.u32()?;
                    let count = input.u32()?;
                    let mut elements = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        elements.push(input.u32()?);
                    }
                    object_arrays.push(ObjectArray {
                        object_id,
                        class_id,
                        elements,
                    });
                }
                record_tag::PRIMITIVE_ARRAY => {
                    let object_id = input.u32()?;
                    let ty = input.basic_type()?;
                    let length = input.u32()?;
                    primitive_arrays.push(PrimitiveArray {
                        object_id,
                        ty,
                        length,
                    });
                }
                other => {
                    return Err(ParseError::UnknownRecordTag {
                        tag: other,
                        offset: tag_offset,
                    });
                }
            }
        }

        Ok(ChdFile {
            version,
            id_size,
            load_classes,
            classes,
            roots,
            instances,
            object_arrays,
            primitive_arrays,
        })
    }

    fn parse_class_shape<R: Read>(input: &mut Input<R>) -> Result<ClassShape> {
        let class_id = input.u32()?;
        let super_id = input.u32()?;
        let instance_size = input.u32()?;

        let const_count = input.u16()?;
        let mut const_pool = Vec::with_capacity(const_count as usize);
        for _ in 0..const_count {
            let index = input.u16()?;
            let ty = input.basic_type()?;
            let value = input.bytes(ty.width())?;
            const_pool.push(ConstPoolEntry { index, ty, value });
        }

        let static_count = input.u16()?;
        let mut static_fields = Vec::with_capacity(static_count as usize);
        for _ in 0..static_count {
            let name_hash = input.u32()?;
            let ty = input.basic_type()?;
            let value = input.bytes(ty.width())?;
            static_fields.push(StaticField {
                name_hash,
                ty,
                value,
            });
        }

        let field_count = input.u16()?;
        let mut instance_fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            instance_fields.push(FieldDescriptor {
                name_hash: input.u32()?,
                ty: input.basic_type()?,
            });
        }

        Ok(ClassShape {
            class_id,
            super_id,
            instance_size,
            const_pool,
            static_fields,
            instance_fields,
        })
    }

    /// Resolve a class id to its shape.
    pub fn class_shape(&self, class_id: u32) -> Option<&ClassShape> {
        self.classes.get(&class_id)
    }

    /// Total number of object references kept across instances and
    /// object arrays.
    pub fn reference_count(&self) -> u64 {
        let instance_refs: u64 = self.instances.iter().map(|i| i.references.len() as u64).sum();
        let array_refs: u64 = self
            .object_arrays
            .iter()
            .map(|a| a.elements.len() as u64)
            .sum();
        instance_refs + array_refs
    }
}

// ============================================================================
// Input cursor
// ============================================================================

/// Byte-counting big-endian read cursor used by the parser.
struct Input<R: Read> {
    inner: R,
    offset: u64,
}

impl<R: Read> Input<R> {
    fn new(inner: R) -> Self {
        Input { inner, offset: 0 }
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    /// Read a record tag, or `None` at a clean end of file.
    fn tag(&mut self) -> Result<Option<u8>> {
        let mut buf = [0u8; 1];
        loop {
            match self.inner.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    self.offset += 1;
                    return Ok(Some(buf[0]));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.exact(&mut buf)?;
        Ok(buf[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.exact(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.exact(&mut buf)?;
        Ok(buf)
    }

    fn basic_type(&mut self) -> Result<BasicType> {
        let at = self.offset;
        let code = self.u8()?;
        BasicType::from_code(code).ok_or(ParseError::UnknownBasicType { code, offset: at })
    }

    fn root_kind(&mut self) -> Result<RootKind> {
        let at = self.offset;
        let code = self.u8()?;
        RootKind::from_code(code).ok_or(ParseError::UnknownRootKind { code, offset: at })
    }

    fn exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.inner.read_exact(buf) {
            Ok(()) => {
                self.offset += buf.len() as u64;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(ParseError::Truncated {
                    offset: self.offset,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Writer for creating CHD files incrementally.
///
/// Records are accepted in any order, but to produce a valid file every
/// [`Instance`] must be preceded by the [`ClassShape`] of its class, and
/// [`finish`](ChdWriter::finish) must be called so the end marker lands
/// on disk; a file abandoned before `finish` will be rejected by
/// [`ChdFile::parse`].
///
/// # Example
///
/// ```no_run
/// use std::fs::File;
/// use chd_parse::{ChdWriter, ClassShape, Instance};
///
/// let file = File::create("dump.chd").unwrap();
/// let mut writer = ChdWriter::new(file);
/// writer.write_header().unwrap();
///
/// # let shape: ClassShape = todo!();
/// writer.write_class_shape(&shape).unwrap();
/// # let instance: Instance = todo!();
/// writer.write_instance(&instance).unwrap();
///
/// writer.finish().unwrap();
/// ```
pub struct ChdWriter<W: Write> {
    writer: W,
}

impl<W: Write> ChdWriter<W> {
    /// Create a new CHD writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write the container header. This must be called first.
    pub fn write_header(&mut self) -> WriteResult<()> {
        self.writer.write_all(&MAGIC)?;
        self.u32(FORMAT_VERSION)?;
        self.u32(ID_SIZE)?;
        Ok(())
    }

    /// Write a class shape record.
    pub fn write_class_shape(&mut self, shape: &ClassShape) -> WriteResult<()> {
        self.u8(record_tag::CLASS_SHAPE)?;
        self.u32(shape.class_id)?;
        self.u32(shape.super_id)?;
        self.u32(shape.instance_size)?;

        self.group_count(shape.class_id, shape.const_pool.len())?;
        for entry in &shape.const_pool {
            self.u16(entry.index)?;
            self.u8(entry.ty.code())?;
            self.value(entry.ty, &entry.value)?;
        }

        self.group_count(shape.class_id, shape.static_fields.len())?;
        for field in &shape.static_fields {
            self.u32(field.name_hash)?;
            self.u8(field.ty.code())?;
            self.value(field.ty, &field.value)?;
        }

        self.group_count(shape.class_id, shape.instance_fields.len())?;
        for field in &shape.instance_fields {
            self.u32(field.name_hash)?;
            self.u8(field.ty.code())?;
        }
        Ok(())
    }

    /// Write a load-class record.
    pub fn write_load_class(&mut self, load: &LoadClass) -> WriteResult<()> {
        self.u8(record_tag::LOAD_CLASS)?;
        self.u32(load.class_id)?;
        self.u32(load.name_hash)?;
        Ok(())
    }

    /// Write a GC root record.
    pub fn write_root(&mut self, root: &Root) -> WriteResult<()> {
        self.u8(record_tag::ROOT)?;
        self.u8(root.kind.code())?;
        self.u32(root.object_id)?;
        Ok(())
    }

    /// Write an instance record.
    pub fn write_instance(&mut self, instance: &Instance) -> WriteResult<()> {
        let count = u32::try_from(instance.references.len()).map_err(|_| {
            WriteError::TooManyReferences {
                object_id: instance.object_id,
                count: instance.references.len(),
            }
        })?;
        self.u8(record_tag::INSTANCE)?;
        self.u32(instance.object_id)?;
        self.u32(instance.class_id)?;
        self.u32(count)?;
        for reference in &instance.references {
            self.u32(*reference)?;
        }
        Ok(())
    }

    /// Write an object array record.
    pub fn write_object_array(&mut self, array: &ObjectArray) -> WriteResult<()> {
        let count = u32::try_from(array.elements.len()).map_err(|_| {
            WriteError::TooManyReferences {
                object_id: array.object_id,
                count: array.elements.len(),
            }
        })?;
        self.u8(record_tag::OBJECT_ARRAY)?;
        self.u32(array.object_id)?;
        self.u32(array.class_id)?;
        self.u32(count)?;
        for element in &array.elements {
            self.u32(*element)?;
        }
        Ok(())
    }

    /// Write a primitive array record (type and length only).
    pub fn write_primitive_array(&mut self, array: &PrimitiveArray) -> WriteResult<()> {
        self.u8(record_tag::PRIMITIVE_ARRAY)?;
        self.u32(array.object_id)?;
        self.u8(array.ty.code())?;
        self.u32(array.length)?;
        Ok(())
    }

    /// Write the end marker, flush, and return the underlying writer.
    pub fn finish(mut self) -> WriteResult<W> {
        self.u8(record_tag::END)?;
        self.writer.flush()?;
        Ok(self.writer)
    }

    /// Get a reference to the underlying writer.
    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    fn u8(&mut self, v: u8) -> WriteResult<()> {
        self.writer.write_all(&[v])?;
        Ok(())
    }

    fn u16(&mut self, v: u16) -> WriteResult<()> {
        self.writer.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    fn u32(&mut self, v: u32) -> WriteResult<()> {
        self.writer.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    fn value(&mut self, ty: BasicType, value: &[u8]) -> WriteResult<()> {
        if value.len() != ty.width() {
            return Err(WriteError::InvalidValueWidth {
                ty,
                expected: ty.width(),
                actual: value.len(),
            });
        }
        self.writer.write_all(value)?;
        Ok(())
    }

    fn group_count(&mut self, class_id: u32, len: usize) -> WriteResult<()> {
        let count = u16::try_from(len).map_err(|_| WriteError::GroupTooLarge {
            class_id,
            count: len,
        })?;
        self.u16(count)
    }
}
