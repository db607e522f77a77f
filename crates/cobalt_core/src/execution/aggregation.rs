//! Aggregate state kept in the value region of group by hash table entries.

use cobalt_error::Result;
use cranelift_codegen::ir::{self, InstBuilder, condcodes::IntCC};

use crate::codegen::lang::If;
use crate::codegen::types::{BinaryOp, Type, TypeId};
use crate::codegen::{CodeGen, Value};
use crate::planner::{AggregateExpr, AggregateFunction};

/// Every aggregate gets a fixed size slot of `[value][length][count]`.
const SLOT_SIZE: usize = 24;
const VALUE_OFFSET: i32 = 0;
const LENGTH_OFFSET: i32 = 8;
const COUNT_OFFSET: i32 = 16;

#[derive(Debug, Clone)]
struct AggregateSlot {
    function: AggregateFunction,
    column: Option<usize>,
    /// Type of the argument column.
    arg_type: Option<Type>,
    output_type: Type,
    offset: i32,
}

impl AggregateSlot {
    /// Type the running value is kept as.
    fn state_type(&self) -> Option<TypeId> {
        match (self.function, self.arg_type) {
            (AggregateFunction::CountStar | AggregateFunction::Count, _) => None,
            (AggregateFunction::Avg, _) => Some(TypeId::Double),
            (AggregateFunction::Sum, _) => Some(self.output_type.type_id),
            (AggregateFunction::Min | AggregateFunction::Max, Some(arg)) => Some(arg.type_id),
            (_, None) => None,
        }
    }
}

/// Layout and code for a list of aggregates over zeroed state.
///
/// Zeroed state is a valid empty aggregate, so new groups need no
/// initialization beyond what the hash table already does.
#[derive(Debug, Clone)]
pub struct AggregateLayout {
    slots: Vec<AggregateSlot>,
}

impl AggregateLayout {
    pub fn new(aggregates: &[AggregateExpr], input: &[Type]) -> Result<Self> {
        let slots = aggregates
            .iter()
            .enumerate()
            .map(|(idx, agg)| {
                Ok(AggregateSlot {
                    function: agg.function,
                    column: agg.column,
                    arg_type: agg.input_type(input)?,
                    output_type: agg.output_type(input)?,
                    offset: (idx * SLOT_SIZE) as i32,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(AggregateLayout { slots })
    }

    pub fn num_aggregates(&self) -> usize {
        self.slots.len()
    }

    /// Bytes of state for all aggregates.
    pub fn size(&self) -> usize {
        self.slots.len() * SLOT_SIZE
    }

    pub fn output_types(&self) -> Vec<Type> {
        self.slots.iter().map(|slot| slot.output_type).collect()
    }

    /// Fold `row` into the state at `data`.
    pub fn update(&self, cg: &mut CodeGen, data: ir::Value, row: &[Value]) -> Result<()> {
        for slot in &self.slots {
            let arg = match slot.column {
                Some(col) => Some(row[col]),
                None => None,
            };

            match (slot.function, arg) {
                (AggregateFunction::CountStar, _) => increment_count(cg, data, slot.offset, None),
                (AggregateFunction::Count, Some(arg)) => {
                    let not_null = arg.is_not_null(cg);
                    increment_count(cg, data, slot.offset, Some(not_null));
                }
                (_, Some(arg)) => {
                    if arg.is_nullable() {
                        let not_null = arg.is_not_null(cg);
                        let mut has_value = If::new(cg, not_null);
                        update_value(cg, data, slot, &strip_null(&arg))?;
                        has_value.end_if(cg);
                    } else {
                        update_value(cg, data, slot, &arg)?;
                    }
                }
                (_, None) => unreachable!("only COUNT(*) has no argument"),
            }
        }
        Ok(())
    }

    /// Final values of the aggregates at `data`.
    pub fn finalize(&self, cg: &mut CodeGen, data: ir::Value) -> Vec<Value> {
        self.slots
            .iter()
            .map(|slot| {
                let count = cg.load(ir::types::I64, data, slot.offset + COUNT_OFFSET);
                let state_type = match slot.state_type() {
                    Some(state_type) => state_type,
                    None => return Value::not_null(TypeId::BigInt, count),
                };

                let empty = cg.cursor().ins().icmp_imm(IntCC::Equal, count, 0);
                let (value, length) = load_state(cg, data, slot.offset, state_type);

                let value = match slot.function {
                    AggregateFunction::Avg => {
                        let one = cg.const64(1);
                        let mut pos = cg.cursor();
                        let divisor = pos.ins().select(empty, one, count);
                        let divisor = pos.ins().fcvt_from_sint(ir::types::F64, divisor);
                        pos.ins().fdiv(value, divisor)
                    }
                    _ => value,
                };

                Value::new(slot.output_type, value, length, Some(empty))
            })
            .collect()
    }

    /// Aggregate values over no rows at all.
    pub fn empty_values(&self, cg: &mut CodeGen) -> Vec<Value> {
        self.slots
            .iter()
            .map(|slot| match slot.function {
                AggregateFunction::CountStar | AggregateFunction::Count => {
                    let zero = cg.const64(0);
                    Value::not_null(TypeId::BigInt, zero)
                }
                _ => Value::null_of(cg, slot.output_type.type_id),
            })
            .collect()
    }
}

fn strip_null(value: &Value) -> Value {
    Value::new(value.ty().as_not_null(), value.value(), value.length(), None)
}

fn increment_count(cg: &mut CodeGen, data: ir::Value, offset: i32, flag: Option<ir::Value>) {
    let count = cg.load(ir::types::I64, data, offset + COUNT_OFFSET);
    let mut pos = cg.cursor();
    let count = match flag {
        Some(flag) => {
            let inc = pos.ins().uextend(ir::types::I64, flag);
            pos.ins().iadd(count, inc)
        }
        None => pos.ins().iadd_imm(count, 1),
    };
    cg.store(count, data, offset + COUNT_OFFSET);
}

fn load_state(cg: &mut CodeGen, data: ir::Value, offset: i32, state_type: TypeId) -> (ir::Value, Option<ir::Value>) {
    let m = state_type.materialization();
    let ty = match m.value.ir_type() {
        Some(ty) => ty,
        None => unreachable!("state types are never void"),
    };
    let value = cg.load(ty, data, offset + VALUE_OFFSET);
    let length = m.length.map(|_| cg.load(ir::types::I32, data, offset + LENGTH_OFFSET));
    (value, length)
}

/// Update the running value of `slot` with a non-null argument.
fn update_value(cg: &mut CodeGen, data: ir::Value, slot: &AggregateSlot, arg: &Value) -> Result<()> {
    let state_type = match slot.state_type() {
        Some(state_type) => state_type,
        None => unreachable!("counts are updated separately"),
    };

    let (value, length) = match slot.function {
        AggregateFunction::Sum | AggregateFunction::Avg => {
            let (current, _) = load_state(cg, data, slot.offset, state_type);
            let current = Value::not_null(state_type, current);
            let arg = arg.cast_to(cg, state_type)?;
            let sum = current.binary_op(cg, BinaryOp::Add, &arg)?;
            (sum.value(), None)
        }
        AggregateFunction::Min | AggregateFunction::Max => {
            // The first value seen is taken as is.
            let count = cg.load(ir::types::I64, data, slot.offset + COUNT_OFFSET);
            let is_first = cg.cursor().ins().icmp_imm(IntCC::Equal, count, 0);

            let mut first = If::new(cg, is_first);
            first.else_block(cg);
            let (current, current_len) = load_state(cg, data, slot.offset, state_type);
            let current = Value::new(Type::not_null(state_type), current, current_len, None);
            let chosen = match slot.function {
                AggregateFunction::Min => current.min(cg, arg)?,
                _ => current.max(cg, arg)?,
            };
            first.end_if(cg);

            let value = first.build_phi(cg, arg.value(), chosen.value())?;
            let length = match (arg.length(), chosen.length()) {
                (Some(arg_len), Some(chosen_len)) => Some(first.build_phi(cg, arg_len, chosen_len)?),
                _ => None,
            };
            (value, length)
        }
        AggregateFunction::CountStar | AggregateFunction::Count => unreachable!("counts have no state value"),
    };

    cg.store(value, data, slot.offset + VALUE_OFFSET);
    if let Some(length) = length {
        cg.store(length, data, slot.offset + LENGTH_OFFSET);
    }
    increment_count(cg, data, slot.offset, None);
    Ok(())
}
