//! Two-pass conversion pipeline.
//!
//! A dump may reference a class that is only defined later in the
//! stream, and string bodies must be hashed before the records naming
//! them are emitted. Neither is available on first sight in a single
//! forward pass, so the pipeline reads the source twice:
//!
//! 1. [`collect`] drives the reader over the whole dump and builds a
//!    [`CrunchIndex`]: every class dump's shape, every string payload and
//!    every load-class record. Heap sub-records other than class dumps
//!    are measured and skipped. No output is produced.
//! 2. [`emit`] re-reads the dump from a fresh cursor and writes the CHD
//!    output: first the load-class and class-shape sections from the
//!    index (sorted by class id, names hashed), then the retained heap
//!    records, extracting instance references against the index.
//!
//! The index is immutable once built and passed into the second pass by
//! shared reference, so "pass one completes before pass two starts" is
//! enforced by the data flow.

use crate::heap::{self, HeapStream};
use crate::record::{HprofReader, LoadClassRecord, RecordHandler};
use crate::{ConvertError, Result};
use chd_parse::{
    BasicType, ChdWriter, ClassShape, ConstPoolEntry, FieldDescriptor, Instance, LoadClass,
    ObjectArray, PrimitiveArray, Root, StaticField,
};
use std::collections::HashMap;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Indices accumulated by the first pass and consulted by the second.
#[derive(Debug, Default)]
pub struct CrunchIndex {
    strings: HashMap<u32, Vec<u8>>,
    classes: HashMap<u32, heap::ClassDumpRecord>,
    load_classes: Vec<LoadClassRecord>,
}

impl CrunchIndex {
    /// Resolve a class id to its class dump.
    pub fn class(&self, class_id: u32) -> Option<&heap::ClassDumpRecord> {
        self.classes.get(&class_id)
    }

    /// Resolve a string id to its payload.
    pub fn string(&self, id: u32) -> Option<&[u8]> {
        self.strings.get(&id).map(Vec::as_slice)
    }

    /// Number of class dumps observed.
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Number of string records observed.
    pub fn string_count(&self) -> usize {
        self.strings.len()
    }

    fn name_hash(&self, id: u32) -> Result<u32> {
        self.strings
            .get(&id)
            .map(|payload| hash_string(payload))
            .ok_or(ConvertError::UnresolvedString { id })
    }
}

/// Counts of what the second pass emitted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CrunchStats {
    pub load_classes: u64,
    pub class_shapes: u64,
    pub roots: u64,
    pub instances: u64,
    pub object_arrays: u64,
    pub primitive_arrays: u64,
    /// Object references kept across instances and object arrays.
    pub references: u64,
}

/// Hash a string payload to the fixed 4-byte value that replaces it in
/// the output. Deterministic for a given build, so the same dump always
/// crunches to the same artifact.
pub fn hash_string(payload: &[u8]) -> u32 {
    use std::collections::hash_map::DefaultHasher;
    let mut hasher = DefaultHasher::new();
    payload.hash(&mut hasher);
    hasher.finish() as u32
}

// ============================================================================
// Pass 1: COLLECTING
// ============================================================================

struct CollectPass {
    index: CrunchIndex,
}

impl RecordHandler for CollectPass {
    fn on_string(&mut self, id: u32, payload: Vec<u8>) -> Result<()> {
        self.index.strings.insert(id, payload);
        Ok(())
    }

    fn on_load_class(&mut self, record: LoadClassRecord) -> Result<()> {
        self.index.load_classes.push(record);
        Ok(())
    }

    fn on_heap_dump(&mut self, records: &mut HeapStream<'_>) -> Result<()> {
        while let Some(tag) = records.next_tag()? {
            if tag == heap::tag::CLASS_DUMP {
                let class = heap::read_class_dump(records)?;
                let class_id = class.class_id;
                if self.index.classes.insert(class_id, class).is_some() {
                    return Err(ConvertError::DuplicateClassDump { class_id });
                }
            } else {
                heap::skip_record(tag, records)?;
            }
        }
        Ok(())
    }
}

/// First pass: read the whole dump and build the conversion indices.
pub fn collect<R: Read>(input: R) -> Result<CrunchIndex> {
    let mut reader = HprofReader::new(BufReader::new(input))?;
    let mut pass = CollectPass {
        index: CrunchIndex::default(),
    };
    while reader.has_next()? {
        reader.next(&mut pass)?;
    }
    Ok(pass.index)
}

// ============================================================================
// Pass 2: EMITTING
// ============================================================================

struct EmitPass<'a, W: Write> {
    index: &'a CrunchIndex,
    writer: &'a mut ChdWriter<W>,
    stats: CrunchStats,
}

impl<W: Write> RecordHandler for EmitPass<'_, W> {
    fn on_heap_dump(&mut self, records: &mut HeapStream<'_>) -> Result<()> {
        while let Some(tag) = records.next_tag()? {
            match tag {
                // Shapes were emitted up front from the index
                heap::tag::CLASS_DUMP => heap::skip_record(tag, records)?,
                heap::tag::INSTANCE_DUMP => {
                    let dump = heap::read_instance_dump(records)?;
                    let references = extract_references(self.index, &dump)?;
                    self.stats.references += references.len() as u64;
                    self.stats.instances += 1;
                    self.writer.write_instance(&Instance {
                        object_id: dump.object_id,
                        class_id: dump.class_id,
                        references,
                    })?;
                }
                heap::tag::OBJECT_ARRAY_DUMP => {
                    let dump = heap::read_object_array(records)?;
                    self.stats.references += dump.elements.len() as u64;
                    self.stats.object_arrays += 1;
                    self.writer.write_object_array(&ObjectArray {
                        object_id: dump.object_id,
                        class_id: dump.class_id,
                        elements: dump.elements,
                    })?;
                }
                heap::tag::PRIMITIVE_ARRAY_DUMP => {
                    let dump = heap::read_primitive_array(records)?;
                    self.write_primitive_array(&dump)?;
                }
                heap::tag::PRIMITIVE_ARRAY_NODATA => {
                    let dump = heap::read_primitive_array_nodata(records)?;
                    self.write_primitive_array(&dump)?;
                }
                // Heap partition metadata, not represented in the output
                heap::tag::HEAP_DUMP_INFO => heap::skip_record(tag, records)?,
                t if heap::is_root(t) => {
                    let root = heap::read_root(t, records)?;
                    self.stats.roots += 1;
                    self.writer.write_root(&Root {
                        kind: root.kind,
                        object_id: root.object_id,
                    })?;
                }
                other => {
                    return Err(ConvertError::UnsupportedHeapTag {
                        tag: other,
                        offset: records.offset().saturating_sub(1),
                    });
                }
            }
        }
        Ok(())
    }
}

impl<W: Write> EmitPass<'_, W> {
    fn write_primitive_array(&mut self, dump: &heap::PrimitiveArrayRecord) -> Result<()> {
        self.stats.primitive_arrays += 1;
        self.writer.write_primitive_array(&PrimitiveArray {
            object_id: dump.object_id,
            ty: dump.ty,
            length: dump.length,
        })?;
        Ok(())
    }
}

/// Extract the object-reference field values of an instance by walking
/// its class shape chain (the class's own fields first, then each super
/// class in turn) over the raw field data. Trailing bytes beyond the
/// shape are runtime padding and ignored; data shorter than the shape is
/// malformed.
fn extract_references(index: &CrunchIndex, dump: &heap::InstanceDumpRecord) -> Result<Vec<u32>> {
    let mut references = Vec::new();
    let mut cursor = 0usize;
    let mut class_id = dump.class_id;
    let mut depth = 0usize;
    while class_id != 0 {
        let class = index
            .class(class_id)
            .ok_or(ConvertError::MissingClassShape {
                object_id: dump.object_id,
                class_id,
            })?;
        depth += 1;
        if depth > index.class_count() {
            return Err(ConvertError::CyclicSuperChain {
                class_id: dump.class_id,
            });
        }
        for field in &class.instance_fields {
            let width = field.ty.width();
            if cursor + width > dump.data.len() {
                return Err(ConvertError::ShortInstanceData {
                    object_id: dump.object_id,
                    class_id,
                });
            }
            if field.ty == BasicType::Object {
                let mut word = [0u8; 4];
                word.copy_from_slice(&dump.data[cursor..cursor + 4]);
                references.push(u32::from_be_bytes(word));
            }
            cursor += width;
        }
        class_id = class.super_id;
    }
    Ok(references)
}

fn class_shape(index: &CrunchIndex, class: &heap::ClassDumpRecord) -> Result<ClassShape> {
    let const_pool = class
        .const_pool
        .iter()
        .map(|entry| ConstPoolEntry {
            index: entry.index,
            ty: entry.ty,
            value: entry.value.clone(),
        })
        .collect();
    let static_fields = class
        .static_fields
        .iter()
        .map(|field| {
            Ok(StaticField {
                name_hash: index.name_hash(field.name_id)?,
                ty: field.ty,
                value: field.value.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let instance_fields = class
        .instance_fields
        .iter()
        .map(|field| {
            Ok(FieldDescriptor {
                name_hash: index.name_hash(field.name_id)?,
                ty: field.ty,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(ClassShape {
        class_id: class.class_id,
        super_id: class.super_id,
        instance_size: class.instance_size,
        const_pool,
        static_fields,
        instance_fields,
    })
}

/// Second pass: re-read the dump and write the finished CHD artifact.
pub fn emit<R: Read, W: Write>(input: R, index: &CrunchIndex, output: W) -> Result<CrunchStats> {
    let mut reader = HprofReader::new(BufReader::new(input))?;
    let mut writer = ChdWriter::new(output);
    writer.write_header()?;

    let mut stats = CrunchStats::default();

    // Dictionary sections first, in deterministic order
    let mut loads: Vec<&LoadClassRecord> = index.load_classes.iter().collect();
    loads.sort_by_key(|load| load.class_id);
    for load in loads {
        stats.load_classes += 1;
        writer.write_load_class(&LoadClass {
            class_id: load.class_id,
            name_hash: index.name_hash(load.name_id)?,
        })?;
    }

    let mut classes: Vec<&heap::ClassDumpRecord> = index.classes.values().collect();
    classes.sort_by_key(|class| class.class_id);
    for class in classes {
        stats.class_shapes += 1;
        writer.write_class_shape(&class_shape(index, class)?)?;
    }

    let mut pass = EmitPass {
        index,
        writer: &mut writer,
        stats,
    };
    while reader.has_next()? {
        reader.next(&mut pass)?;
    }
    let stats = pass.stats;

    writer.finish()?;
    Ok(stats)
}

/// Convert `input` (HPROF) to `output` (CHD).
///
/// The input is opened, fully read and closed once per pass; the output
/// is created once and finalized only after the second pass completes.
/// On any error the run aborts and the output file, if created, is not
/// finalized and will be rejected by `ChdFile::parse`.
pub fn crunch(input: &Path, output: &Path) -> Result<CrunchStats> {
    let index = collect(File::open(input)?)?;
    let stats = emit(
        File::open(input)?,
        &index,
        BufWriter::new(File::create(output)?),
    )?;
    Ok(stats)
}
