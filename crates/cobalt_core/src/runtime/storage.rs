//! In-memory tables read by generated scans.
//!
//! A table is split into tile groups of at most `tile_group_size` rows. Each
//! tile group stores every column as a contiguous array of fixed width
//! values plus one null byte per row. Strings are stored as `StrRef`s
//! pointing into buffers owned by the tile group.

use std::mem::size_of;
use std::ptr;

use cobalt_error::{DbError, Result};
use tracing::debug;

use super::error::set_pending_error;
use crate::codegen::types::{Type, TypeId};
use crate::scalar::ScalarValue;

/// Reference to string bytes as seen by generated code.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct StrRef {
    pub ptr: *const u8,
    pub len: u32,
}

pub const STR_REF_SIZE: usize = size_of::<StrRef>();
pub const STR_REF_LEN_OFFSET: usize = std::mem::offset_of!(StrRef, len);

/// Byte width of a column value of the given type.
pub const fn column_width(type_id: TypeId) -> usize {
    match type_id {
        TypeId::Boolean | TypeId::TinyInt => 1,
        TypeId::SmallInt => 2,
        TypeId::Integer | TypeId::Date => 4,
        TypeId::BigInt | TypeId::Timestamp | TypeId::Double => 8,
        TypeId::Varchar => STR_REF_SIZE,
    }
}

#[derive(Debug)]
struct Column {
    type_id: TypeId,
    data: Vec<u8>,
    nulls: Vec<u8>,
}

impl Column {
    fn new(type_id: TypeId, capacity: usize) -> Self {
        Column {
            type_id,
            data: Vec::with_capacity(capacity * column_width(type_id)),
            nulls: Vec::with_capacity(capacity),
        }
    }
}

#[derive(Debug)]
pub struct TileGroup {
    num_rows: usize,
    columns: Vec<Column>,
    /// Owned string bytes referenced by varchar columns.
    heap: Vec<Box<[u8]>>,
}

impl TileGroup {
    fn new(schema: &[Type], capacity: usize) -> Self {
        TileGroup {
            num_rows: 0,
            columns: schema.iter().map(|ty| Column::new(ty.type_id, capacity)).collect(),
            heap: Vec::new(),
        }
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn column_data(&self, col: usize) -> *const u8 {
        self.columns[col].data.as_ptr()
    }

    pub fn column_nulls(&self, col: usize) -> *const u8 {
        self.columns[col].nulls.as_ptr()
    }

    fn append_value(&mut self, col: usize, value: &ScalarValue) -> Result<()> {
        let column = &mut self.columns[col];
        let is_null = value.is_null();
        column.nulls.push(is_null as u8);

        if is_null {
            column
                .data
                .extend(std::iter::repeat_n(0, column_width(column.type_id)));
            return Ok(());
        }

        match (column.type_id, value) {
            (TypeId::Boolean, ScalarValue::Boolean(v)) => column.data.push(*v as u8),
            (TypeId::TinyInt, ScalarValue::Int8(v)) => column.data.extend(v.to_ne_bytes()),
            (TypeId::SmallInt, ScalarValue::Int16(v)) => column.data.extend(v.to_ne_bytes()),
            (TypeId::Integer, ScalarValue::Int32(v)) => column.data.extend(v.to_ne_bytes()),
            (TypeId::BigInt, ScalarValue::Int64(v)) => column.data.extend(v.to_ne_bytes()),
            (TypeId::Double, ScalarValue::Float64(v)) => column.data.extend(v.to_ne_bytes()),
            (TypeId::Date, ScalarValue::Date32(v)) => column.data.extend(v.to_ne_bytes()),
            (TypeId::Timestamp, ScalarValue::Timestamp(v)) => column.data.extend(v.to_ne_bytes()),
            (TypeId::Varchar, ScalarValue::Utf8(v)) => {
                let bytes: Box<[u8]> = v.as_bytes().into();
                let len = u32::try_from(bytes.len())
                    .map_err(|_| DbError::new("String too long").with_field("len", bytes.len()))?;
                let str_ref = StrRef {
                    ptr: bytes.as_ptr(),
                    len,
                };
                self.heap.push(bytes);
                // SAFETY: StrRef is plain data.
                let raw = unsafe {
                    std::slice::from_raw_parts(&str_ref as *const StrRef as *const u8, STR_REF_SIZE)
                };
                column.data.extend_from_slice(raw);
            }
            (type_id, value) => {
                return Err(DbError::new("Value does not match column type")
                    .with_field("type", type_id)
                    .with_field("value", value));
            }
        }

        Ok(())
    }

    /// Read a value back out of the tile group.
    pub fn get_value(&self, row: usize, col: usize) -> Result<ScalarValue> {
        if row >= self.num_rows {
            return Err(DbError::new("Row out of bounds").with_field("row", row));
        }
        let column = self
            .columns
            .get(col)
            .ok_or_else(|| DbError::new("Column out of bounds").with_field("col", col))?;
        if column.nulls[row] != 0 {
            return Ok(ScalarValue::Null);
        }

        let width = column_width(column.type_id);
        let bytes = &column.data[row * width..(row + 1) * width];
        let value = match column.type_id {
            TypeId::Boolean => ScalarValue::Boolean(bytes[0] != 0),
            TypeId::TinyInt => ScalarValue::Int8(bytes[0] as i8),
            TypeId::SmallInt => ScalarValue::Int16(i16::from_ne_bytes(fixed(bytes))),
            TypeId::Integer => ScalarValue::Int32(i32::from_ne_bytes(fixed(bytes))),
            TypeId::Date => ScalarValue::Date32(i32::from_ne_bytes(fixed(bytes))),
            TypeId::BigInt => ScalarValue::Int64(i64::from_ne_bytes(fixed(bytes))),
            TypeId::Timestamp => ScalarValue::Timestamp(i64::from_ne_bytes(fixed(bytes))),
            TypeId::Double => ScalarValue::Float64(f64::from_ne_bytes(fixed(bytes))),
            TypeId::Varchar => {
                // SAFETY: Varchar columns only hold StrRefs into our heap.
                let str_ref = unsafe { (bytes.as_ptr() as *const StrRef).read_unaligned() };
                let raw = unsafe { std::slice::from_raw_parts(str_ref.ptr, str_ref.len as usize) };
                ScalarValue::Utf8(String::from_utf8_lossy(raw).into_owned())
            }
        };

        Ok(value)
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

#[derive(Debug)]
pub struct DataTable {
    id: u32,
    name: String,
    schema: Vec<Type>,
    tile_group_size: usize,
    tile_groups: Vec<TileGroup>,
}

impl DataTable {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &[Type] {
        &self.schema
    }

    pub fn num_tile_groups(&self) -> usize {
        self.tile_groups.len()
    }

    pub fn tile_group(&self, idx: usize) -> Option<&TileGroup> {
        self.tile_groups.get(idx)
    }

    pub fn num_rows(&self) -> usize {
        self.tile_groups.iter().map(|tg| tg.num_rows).sum()
    }

    pub fn append_row(&mut self, row: &[ScalarValue]) -> Result<()> {
        if row.len() != self.schema.len() {
            return Err(DbError::new("Row has wrong number of columns")
                .with_field("expected", self.schema.len())
                .with_field("got", row.len()));
        }
        for (idx, (value, ty)) in row.iter().zip(&self.schema).enumerate() {
            match value.type_id() {
                None if !ty.nullable => {
                    return Err(DbError::new("NULL value in non-nullable column").with_field("column", idx));
                }
                Some(type_id) if type_id != ty.type_id => {
                    return Err(DbError::new("Value does not match column type")
                        .with_field("column", idx)
                        .with_field("expected", ty.type_id)
                        .with_field("got", type_id));
                }
                _ => (),
            }
        }

        let needs_tile_group = match self.tile_groups.last() {
            Some(tg) => tg.num_rows == self.tile_group_size,
            None => true,
        };
        if needs_tile_group {
            self.tile_groups
                .push(TileGroup::new(&self.schema, self.tile_group_size));
        }

        let tile_group = match self.tile_groups.last_mut() {
            Some(tg) => tg,
            None => unreachable!("tile group pushed above"),
        };
        for (col, value) in row.iter().enumerate() {
            tile_group.append_value(col, value)?;
        }
        tile_group.num_rows += 1;

        Ok(())
    }

    pub fn append_rows<'a>(&mut self, rows: impl IntoIterator<Item = &'a [ScalarValue]>) -> Result<()> {
        for row in rows {
            self.append_row(row)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct Catalog {
    tables: Vec<DataTable>,
}

impl Catalog {
    pub const DEFAULT_TILE_GROUP_SIZE: usize = 1000;

    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new empty table, returning its id.
    pub fn create_table(&mut self, name: impl Into<String>, schema: Vec<Type>, tile_group_size: usize) -> Result<u32> {
        let name = name.into();
        if tile_group_size == 0 {
            return Err(DbError::new("Tile group size must be greater than zero"));
        }
        if self.tables.iter().any(|t| t.name == name) {
            return Err(DbError::new("Table already exists").with_field("name", name));
        }

        let id = self.tables.len() as u32;
        debug!(%id, %name, columns = schema.len(), "created table");
        self.tables.push(DataTable {
            id,
            name,
            schema,
            tile_group_size,
            tile_groups: Vec::new(),
        });

        Ok(id)
    }

    pub fn get_table(&self, id: u32) -> Option<&DataTable> {
        self.tables.get(id as usize)
    }

    pub fn get_table_mut(&mut self, id: u32) -> Option<&mut DataTable> {
        self.tables.get_mut(id as usize)
    }

    pub fn get_table_by_name(&self, name: &str) -> Option<&DataTable> {
        self.tables.iter().find(|t| t.name == name)
    }
}

/// # Safety
///
/// `catalog` must point to a live catalog.
pub unsafe extern "C" fn rt_catalog_get_table(catalog: *const u8, table_id: u32) -> *const u8 {
    let catalog = unsafe { &*(catalog as *const Catalog) };
    match catalog.get_table(table_id) {
        Some(table) => table as *const DataTable as *const u8,
        None => {
            set_pending_error(DbError::new("Missing table").with_field("id", table_id));
            ptr::null()
        }
    }
}

/// # Safety
///
/// `table` must point to a live table.
pub unsafe extern "C" fn rt_table_num_tile_groups(table: *const u8) -> u64 {
    let table = unsafe { &*(table as *const DataTable) };
    table.num_tile_groups() as u64
}

/// # Safety
///
/// `table` must point to a live table, `idx` must be in bounds.
pub unsafe extern "C" fn rt_table_get_tile_group(table: *const u8, idx: u64) -> *const u8 {
    let table = unsafe { &*(table as *const DataTable) };
    &table.tile_groups[idx as usize] as *const TileGroup as *const u8
}

/// # Safety
///
/// `tile_group` must point to a live tile group.
pub unsafe extern "C" fn rt_tile_group_num_rows(tile_group: *const u8) -> u64 {
    let tile_group = unsafe { &*(tile_group as *const TileGroup) };
    tile_group.num_rows() as u64
}

/// # Safety
///
/// `tile_group` must point to a live tile group, `col` must be in bounds.
pub unsafe extern "C" fn rt_tile_group_column_data(tile_group: *const u8, col: u32) -> *const u8 {
    let tile_group = unsafe { &*(tile_group as *const TileGroup) };
    tile_group.column_data(col as usize)
}

/// # Safety
///
/// `tile_group` must point to a live tile group, `col` must be in bounds.
pub unsafe extern "C" fn rt_tile_group_column_nulls(tile_group: *const u8, col: u32) -> *const u8 {
    let tile_group = unsafe { &*(tile_group as *const TileGroup) };
    tile_group.column_nulls(col as usize)
}
