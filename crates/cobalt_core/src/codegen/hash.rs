//! Hashing of SQL values in generated code.
//!
//! Fixed width values are mixed with the murmur3 64-bit finalizer, strings
//! go through the runtime's byte hasher. Per column hashes are folded into
//! a single 64-bit hash with `combine`.

use cranelift_codegen::ir::{self, InstBuilder, MemFlags};

use super::runtime_functions::RuntimeFunction;
use super::types::TypeId;
use super::{CodeGen, Value};

/// Hash of a NULL component.
pub const NULL_HASH: u64 = 0xcbf2_9ce4_8422_2325;

/// Starting hash before any components are combined.
pub const SEED_HASH: u64 = 0x9e37_79b9_7f4a_7c15;

const FMIX_C1: u64 = 0xff51_afd7_ed55_8ccd;
const FMIX_C2: u64 = 0xc4ce_b9fe_1a85_ec53;

/// Host side reference of the finalizer.
pub const fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(FMIX_C1);
    k ^= k >> 33;
    k = k.wrapping_mul(FMIX_C2);
    k ^= k >> 33;
    k
}

/// Host side reference of `combine`.
pub const fn combine64(seed: u64, hash: u64) -> u64 {
    seed ^ (hash
        .wrapping_add(SEED_HASH)
        .wrapping_add(seed << 6)
        .wrapping_add(seed >> 2))
}

/// Emit the 64-bit finalizer over an i64.
pub fn emit_fmix64(cg: &mut CodeGen, k: ir::Value) -> ir::Value {
    let c1 = cg.const64(FMIX_C1 as i64);
    let c2 = cg.const64(FMIX_C2 as i64);
    let mut pos = cg.cursor();
    let s = pos.ins().ushr_imm(k, 33);
    let k = pos.ins().bxor(k, s);
    let k = pos.ins().imul(k, c1);
    let s = pos.ins().ushr_imm(k, 33);
    let k = pos.ins().bxor(k, s);
    let k = pos.ins().imul(k, c2);
    let s = pos.ins().ushr_imm(k, 33);
    pos.ins().bxor(k, s)
}

/// Emit `combine64`.
pub fn emit_combine(cg: &mut CodeGen, seed: ir::Value, hash: ir::Value) -> ir::Value {
    let golden = cg.const64(SEED_HASH as i64);
    let mut pos = cg.cursor();
    let shl = pos.ins().ishl_imm(seed, 6);
    let shr = pos.ins().ushr_imm(seed, 2);
    let sum = pos.ins().iadd(hash, golden);
    let sum = pos.ins().iadd(sum, shl);
    let sum = pos.ins().iadd(sum, shr);
    pos.ins().bxor(seed, sum)
}

/// Hash a single value to an i64.
pub fn hash_value(cg: &mut CodeGen, value: &Value) -> ir::Value {
    let raw = match value.type_id() {
        TypeId::Varchar => {
            let len = value.length_or_zero(cg);
            cg.call_runtime_value(RuntimeFunction::HashBytes, &[value.value(), len])
        }
        TypeId::Double => {
            // -0.0 + 0.0 is +0.0, every other value is unchanged.
            let zero = cg.const_double(0.0);
            let mut pos = cg.cursor();
            let normalized = pos.ins().fadd(value.value(), zero);
            let bits = pos.ins().bitcast(ir::types::I64, MemFlags::new(), normalized);
            emit_fmix64(cg, bits)
        }
        TypeId::BigInt | TypeId::Timestamp => emit_fmix64(cg, value.value()),
        TypeId::Boolean => {
            let wide = cg.cursor().ins().uextend(ir::types::I64, value.value());
            emit_fmix64(cg, wide)
        }
        TypeId::TinyInt | TypeId::SmallInt | TypeId::Integer | TypeId::Date => {
            let wide = cg.cursor().ins().sextend(ir::types::I64, value.value());
            emit_fmix64(cg, wide)
        }
    };

    match value.null() {
        Some(null) => {
            let null_hash = cg.const64(NULL_HASH as i64);
            cg.cursor().ins().select(null, null_hash, raw)
        }
        None => raw,
    }
}

/// Hash all values into a single i64.
pub fn hash_values(cg: &mut CodeGen, values: &[Value]) -> ir::Value {
    let mut hash = cg.const64(SEED_HASH as i64);
    for value in values {
        let h = hash_value(cg, value);
        hash = emit_combine(cg, hash, h);
    }
    hash
}
