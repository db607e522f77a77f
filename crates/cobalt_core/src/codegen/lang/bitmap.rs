//! Null bitmaps addressed by bit index, bit `i` lives in byte `i / 8` at
//! position `i % 8`.
//!
//! Both helpers cache one value per byte, so every access must happen in
//! blocks dominated by the previous access to the same byte.

use cranelift_codegen::ir::{self, InstBuilder};

use crate::codegen::CodeGen;

/// Accumulates bits in registers and writes every byte exactly once on
/// `flush`.
#[derive(Debug)]
pub struct BitmapWriter {
    ptr: ir::Value,
    bytes: Vec<Option<ir::Value>>,
}

impl BitmapWriter {
    pub fn new(ptr: ir::Value, num_bits: usize) -> Self {
        BitmapWriter {
            ptr,
            bytes: vec![None; num_bits.div_ceil(8)],
        }
    }

    fn byte(&mut self, cg: &mut CodeGen, byte_idx: usize) -> ir::Value {
        match self.bytes[byte_idx] {
            Some(v) => v,
            None => cg.const8(0),
        }
    }

    /// Set bit `idx` to the boolean `bit` (i8 holding 0 or 1).
    pub fn write_bit(&mut self, cg: &mut CodeGen, idx: usize, bit: ir::Value) {
        let (byte_idx, shift) = (idx / 8, idx % 8);
        let byte = self.byte(cg, byte_idx);
        let mut pos = cg.cursor();
        let bit = pos.ins().band_imm(bit, 1);
        let shifted = pos.ins().ishl_imm(bit, shift as i64);
        self.bytes[byte_idx] = Some(pos.ins().bor(byte, shifted));
    }

    pub fn set_bit(&mut self, cg: &mut CodeGen, idx: usize) {
        let (byte_idx, shift) = (idx / 8, idx % 8);
        let byte = self.byte(cg, byte_idx);
        self.bytes[byte_idx] = Some(cg.cursor().ins().bor_imm(byte, 1 << shift));
    }

    pub fn clear_bit(&mut self, cg: &mut CodeGen, idx: usize) {
        let (byte_idx, shift) = (idx / 8, idx % 8);
        let byte = self.byte(cg, byte_idx);
        let mask = cg.const8(!(1u8 << shift) as i8);
        self.bytes[byte_idx] = Some(cg.cursor().ins().band(byte, mask));
    }

    /// Write all bytes to memory.
    pub fn flush(&mut self, cg: &mut CodeGen) {
        for byte_idx in 0..self.bytes.len() {
            let byte = self.byte(cg, byte_idx);
            cg.store(byte, self.ptr, byte_idx as i32);
        }
    }
}

/// Reads bits, loading each byte from memory at most once.
#[derive(Debug)]
pub struct BitmapReader {
    ptr: ir::Value,
    bytes: Vec<Option<ir::Value>>,
}

impl BitmapReader {
    pub fn new(ptr: ir::Value, num_bits: usize) -> Self {
        BitmapReader {
            ptr,
            bytes: vec![None; num_bits.div_ceil(8)],
        }
    }

    /// Read bit `idx` as an i8 holding 0 or 1.
    pub fn get_bit(&mut self, cg: &mut CodeGen, idx: usize) -> ir::Value {
        let (byte_idx, shift) = (idx / 8, idx % 8);
        let byte = match self.bytes[byte_idx] {
            Some(v) => v,
            None => {
                let v = cg.load(ir::types::I8, self.ptr, byte_idx as i32);
                self.bytes[byte_idx] = Some(v);
                v
            }
        };
        let mut pos = cg.cursor();
        let shifted = pos.ins().ushr_imm(byte, shift as i64);
        pos.ins().band_imm(shifted, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::types::Registry;
    use crate::codegen::{CodeContext, CodegenOptions, FunctionBuilder, PrimitiveType};

    #[test]
    fn write_then_read() {
        let registry = Registry::new();
        let mut cc = CodeContext::try_new(0, CodegenOptions::default()).unwrap();
        let mut cg = CodeGen::new(&mut cc, &registry);

        // f(ptr, bit3) writes bits [1, 3=bit3, 9], clears 1 and returns
        // bit 3 read back.
        let func = FunctionBuilder::new(
            &mut cg,
            "bitmap",
            &[PrimitiveType::VoidPtr, PrimitiveType::Bool],
            PrimitiveType::Bool,
        )
        .unwrap();
        let ptr = func.argument(&cg, 0);
        let bit3 = func.argument(&cg, 1);

        let mut writer = BitmapWriter::new(ptr, 12);
        writer.set_bit(&mut cg, 1);
        writer.write_bit(&mut cg, 3, bit3);
        writer.set_bit(&mut cg, 9);
        writer.set_bit(&mut cg, 0);
        writer.clear_bit(&mut cg, 0);
        writer.flush(&mut cg);

        let mut reader = BitmapReader::new(ptr, 12);
        let b = reader.get_bit(&mut cg, 3);

        let decl = func.return_and_finish(&mut cg, Some(b));
        cc.compile().unwrap();
        let f: extern "C" fn(*mut u8, u8) -> u8 = unsafe { std::mem::transmute(cc.get_function_pointer(&decl).unwrap()) };

        let mut mem = [0xffu8; 2];
        assert_eq!(1, f(mem.as_mut_ptr(), 1));
        assert_eq!([0b0000_1010, 0b0000_0010], mem);

        assert_eq!(0, f(mem.as_mut_ptr(), 0));
        assert_eq!([0b0000_0010, 0b0000_0010], mem);
    }
}
