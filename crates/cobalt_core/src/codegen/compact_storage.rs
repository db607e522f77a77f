//! Packed row layout for a fixed schema.
//!
//! A storage area starts with a null bitmap of `ceil(n / 8)` bytes (bit `i`
//! set when column `i` is NULL), followed by every physical component of
//! the schema. Variable length types contribute two components, the value
//! and the length. Components are ordered by descending size with ties kept
//! in schema order, and packed without padding.

use cranelift_codegen::ir;

use super::lang::{BitmapReader, BitmapWriter};
use super::types::Type;
use super::{CodeGen, PrimitiveType, Value};

/// One physical component of the layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageEntry {
    pub ty: PrimitiveType,
    /// Index of the owning column in the schema.
    pub logical_index: usize,
    /// If this is the length component of a variable length column.
    pub is_length: bool,
    pub size: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CompactStorage {
    schema: Vec<Type>,
    /// Physical entries in storage order.
    entries: Vec<StorageEntry>,
    /// Byte offset of each entry from the start of the storage area.
    offsets: Vec<usize>,
    bitmap_bytes: usize,
    storage_size: usize,
    is_setup: bool,
}

impl CompactStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience for `new` followed by `setup`.
    pub fn for_schema(schema: &[Type]) -> Self {
        let mut storage = Self::new();
        storage.setup(schema);
        storage
    }

    /// Compute the layout for `schema`, returning the storage size.
    ///
    /// Calling this again returns the existing layout. Panics if called
    /// again with a different schema.
    pub fn setup(&mut self, schema: &[Type]) -> usize {
        if self.is_setup {
            assert_eq!(self.schema, schema, "compact storage already set up for another schema");
            return self.storage_size;
        }

        let mut entries = Vec::with_capacity(schema.len() * 2);
        for (idx, ty) in schema.iter().enumerate() {
            let m = ty.materialization();
            entries.push(StorageEntry {
                ty: m.value,
                logical_index: idx,
                is_length: false,
                size: m.value.size_in_bytes(),
            });
            if let Some(len) = m.length {
                entries.push(StorageEntry {
                    ty: len,
                    logical_index: idx,
                    is_length: true,
                    size: len.size_in_bytes(),
                });
            }
        }
        // Stable, ties stay in emission order.
        entries.sort_by(|a, b| b.size.cmp(&a.size));

        let bitmap_bytes = schema.len().div_ceil(8);
        let mut offset = bitmap_bytes;
        let mut offsets = Vec::with_capacity(entries.len());
        for entry in &entries {
            offsets.push(offset);
            offset += entry.size;
        }

        self.schema = schema.to_vec();
        self.entries = entries;
        self.offsets = offsets;
        self.bitmap_bytes = bitmap_bytes;
        self.storage_size = offset;
        self.is_setup = true;

        self.storage_size
    }

    pub fn is_setup(&self) -> bool {
        self.is_setup
    }

    pub fn schema(&self) -> &[Type] {
        &self.schema
    }

    pub fn entries(&self) -> &[StorageEntry] {
        &self.entries
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn null_bitmap_size(&self) -> usize {
        self.bitmap_bytes
    }

    pub fn storage_size(&self) -> usize {
        assert!(self.is_setup, "compact storage not set up");
        self.storage_size
    }

    /// Store one value per schema column at `area`, returning a pointer just
    /// past the storage area.
    pub fn store_values(&self, cg: &mut CodeGen, area: ir::Value, values: &[Value]) -> ir::Value {
        assert!(self.is_setup, "compact storage not set up");
        assert_eq!(self.schema.len(), values.len(), "one value per column");

        for (entry, offset) in self.entries.iter().zip(&self.offsets) {
            let value = &values[entry.logical_index];
            assert_eq!(
                self.schema[entry.logical_index].type_id,
                value.type_id(),
                "value type doesn't match storage schema"
            );
            let component = if entry.is_length {
                match value.length() {
                    Some(len) => len,
                    None => unreachable!("variable length value without length"),
                }
            } else {
                value.value()
            };
            cg.store(component, area, *offset as i32);
        }

        let mut nulls = BitmapWriter::new(area, self.schema.len());
        for (idx, value) in values.iter().enumerate() {
            if self.schema[idx].nullable {
                let null = value.is_null(cg);
                nulls.write_bit(cg, idx, null);
            }
        }
        nulls.flush(cg);

        cg.ptr_add(area, self.storage_size as i64)
    }

    /// Load every column from `area`. Also returns a pointer just past the
    /// storage area.
    pub fn load_values(&self, cg: &mut CodeGen, area: ir::Value) -> (Vec<Value>, ir::Value) {
        assert!(self.is_setup, "compact storage not set up");

        let mut components: Vec<Option<ir::Value>> = vec![None; self.schema.len()];
        let mut lengths: Vec<Option<ir::Value>> = vec![None; self.schema.len()];

        for (entry, offset) in self.entries.iter().zip(&self.offsets) {
            let ir_type = match entry.ty.ir_type() {
                Some(ty) => ty,
                None => unreachable!("storage entries are never void"),
            };
            let v = cg.load(ir_type, area, *offset as i32);
            if entry.is_length {
                lengths[entry.logical_index] = Some(v);
            } else {
                components[entry.logical_index] = Some(v);
            }
        }

        let mut nulls = BitmapReader::new(area, self.schema.len());
        let mut values = Vec::with_capacity(self.schema.len());
        for (idx, ty) in self.schema.iter().enumerate() {
            let null = if ty.nullable {
                Some(nulls.get_bit(cg, idx))
            } else {
                None
            };
            let value = match components[idx] {
                Some(v) => v,
                None => unreachable!("every column has a value component"),
            };
            values.push(Value::new(*ty, value, lengths[idx], null));
        }

        let end = cg.ptr_add(area, self.storage_size as i64);
        (values, end)
    }
}
