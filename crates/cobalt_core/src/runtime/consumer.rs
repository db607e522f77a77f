//! Host side of the result consumers.
//!
//! Generated code hands rows to consumers one at a time as an array of
//! `OutputSlot`s, one per output column.

use std::mem::{offset_of, size_of};
use std::sync::atomic::{AtomicU64, Ordering};

use cobalt_error::{DbError, Result};
use parking_lot::Mutex;

use super::error::set_pending_error;
use crate::codegen::types::{Type, TypeId};
use crate::scalar::ScalarValue;

/// A single column value of an output row.
///
/// Integers are sign extended to 64 bits, doubles stored as their bit
/// pattern, strings as a pointer with `len` bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputSlot {
    pub value: u64,
    pub len: u32,
    pub is_null: u8,
}

pub const OUTPUT_SLOT_SIZE: usize = size_of::<OutputSlot>();
pub const OUTPUT_SLOT_VALUE_OFFSET: usize = offset_of!(OutputSlot, value);
pub const OUTPUT_SLOT_LEN_OFFSET: usize = offset_of!(OutputSlot, len);
pub const OUTPUT_SLOT_NULL_OFFSET: usize = offset_of!(OutputSlot, is_null);

impl OutputSlot {
    /// Convert the slot to a scalar of the given type.
    ///
    /// # Safety
    ///
    /// For varchar, `value` must point to `len` readable bytes.
    pub unsafe fn to_scalar(&self, ty: Type) -> Result<ScalarValue> {
        if self.is_null != 0 {
            return Ok(ScalarValue::Null);
        }
        let v = self.value;
        Ok(match ty.type_id {
            TypeId::Boolean => ScalarValue::Boolean(v != 0),
            TypeId::TinyInt => ScalarValue::Int8(v as i8),
            TypeId::SmallInt => ScalarValue::Int16(v as i16),
            TypeId::Integer => ScalarValue::Int32(v as i32),
            TypeId::BigInt => ScalarValue::Int64(v as i64),
            TypeId::Date => ScalarValue::Date32(v as i32),
            TypeId::Timestamp => ScalarValue::Timestamp(v as i64),
            TypeId::Double => ScalarValue::Float64(f64::from_bits(v)),
            TypeId::Varchar => {
                let bytes = if self.len == 0 {
                    &[][..]
                } else {
                    unsafe { std::slice::from_raw_parts(v as *const u8, self.len as usize) }
                };
                let s = std::str::from_utf8(bytes)
                    .map_err(|e| DbError::with_source("Output string is not valid utf8", Box::new(e)))?;
                ScalarValue::Utf8(s.to_string())
            }
        })
    }
}

/// Rows collected by a buffering consumer.
#[derive(Debug)]
pub struct BufferedResults {
    types: Vec<Type>,
    rows: Mutex<Vec<Vec<ScalarValue>>>,
}

impl BufferedResults {
    pub fn new(types: Vec<Type>) -> Self {
        BufferedResults {
            types,
            rows: Mutex::new(Vec::new()),
        }
    }

    pub fn types(&self) -> &[Type] {
        &self.types
    }

    /// # Safety
    ///
    /// `slots` must point to one valid slot per output column.
    pub unsafe fn append(&self, slots: *const OutputSlot) -> Result<()> {
        let slots = unsafe { std::slice::from_raw_parts(slots, self.types.len()) };
        let row = slots
            .iter()
            .zip(&self.types)
            .map(|(slot, ty)| unsafe { slot.to_scalar(*ty) })
            .collect::<Result<Vec<_>>>()?;
        self.rows.lock().push(row);
        Ok(())
    }

    pub fn num_rows(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn take_rows(&self) -> Vec<Vec<ScalarValue>> {
        std::mem::take(&mut *self.rows.lock())
    }
}

/// # Safety
///
/// `state` must point to live `BufferedResults`, `slots` to one slot per
/// output column.
pub unsafe extern "C" fn rt_buffered_consumer_append(state: *mut u8, slots: *const u8) {
    let results = unsafe { &*(state as *const BufferedResults) };
    if let Err(e) = unsafe { results.append(slots as *const OutputSlot) } {
        set_pending_error(e);
    }
}

#[derive(Debug, Default)]
pub struct CountingResults {
    count: AtomicU64,
}

impl CountingResults {
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
    }
}

/// # Safety
///
/// `state` must point to live `CountingResults`.
pub unsafe extern "C" fn rt_counting_consumer_add(state: *mut u8, n: u64) {
    let results = unsafe { &*(state as *const CountingResults) };
    results.count.fetch_add(n, Ordering::Relaxed);
}
