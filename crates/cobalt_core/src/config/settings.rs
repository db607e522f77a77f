use std::collections::HashMap;
use std::sync::LazyLock;

use cobalt_error::{DbError, Result};

use super::{CompilerConfig, missing_setting};
use crate::scalar::ScalarValue;

pub(crate) struct SettingFunctions {
    pub(crate) set: fn(scalar: &ScalarValue, conf: &mut CompilerConfig) -> Result<()>,
    pub(crate) get: fn(conf: &CompilerConfig) -> ScalarValue,
}

impl SettingFunctions {
    const fn new<S: CompilerSetting>() -> Self {
        SettingFunctions {
            set: S::set_from_scalar as _,
            get: S::get_as_scalar as _,
        }
    }
}

fn insert_setting<S: CompilerSetting>(map: &mut HashMap<&'static str, SettingFunctions>) {
    if map.insert(S::NAME, SettingFunctions::new::<S>()).is_some() {
        panic!("Duplicate settings names: {}", S::NAME);
    }
}

static GET_SET_FUNCTIONS: LazyLock<HashMap<&'static str, SettingFunctions>> = LazyLock::new(|| {
    let mut map = HashMap::new();

    insert_setting::<BatchSize>(&mut map);
    insert_setting::<HashTableInitialCapacity>(&mut map);
    insert_setting::<NestedLoopBlockSize>(&mut map);
    insert_setting::<ParallelWorkers>(&mut map);
    insert_setting::<Optimize>(&mut map);
    insert_setting::<VerifyIr>(&mut map);
    insert_setting::<DumpIr>(&mut map);

    map
});

pub(crate) fn lookup(name: &str) -> Result<&'static SettingFunctions> {
    GET_SET_FUNCTIONS.get(name).ok_or_else(|| missing_setting(name))
}

/// Names of all settings, sorted.
pub fn setting_names() -> Vec<&'static str> {
    let mut names: Vec<_> = GET_SET_FUNCTIONS.keys().copied().collect();
    names.sort_unstable();
    names
}

pub trait CompilerSetting: Sync + Send + 'static {
    const NAME: &'static str;
    const DESCRIPTION: &'static str;

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut CompilerConfig) -> Result<()>;
    fn get_as_scalar(conf: &CompilerConfig) -> ScalarValue;
}

fn positive_usize(name: &str, scalar: &ScalarValue, max: usize) -> Result<usize> {
    let val = scalar.try_as_usize()?;
    if val == 0 {
        return Err(DbError::new(format!("'{name}' must be greater than zero")));
    }
    if val > max {
        return Err(DbError::new(format!("'{name}' cannot be greater than {max}")));
    }
    Ok(val)
}

pub struct BatchSize;

impl CompilerSetting for BatchSize {
    const NAME: &'static str = "batch_size";
    const DESCRIPTION: &'static str = "Rows processed per scan batch";

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut CompilerConfig) -> Result<()> {
        // Selection vectors hold u32 indices and live on the stack.
        conf.batch_size = positive_usize(Self::NAME, scalar, 16 * 1024)?;
        Ok(())
    }

    fn get_as_scalar(conf: &CompilerConfig) -> ScalarValue {
        (conf.batch_size as i64).into()
    }
}

pub struct HashTableInitialCapacity;

impl CompilerSetting for HashTableInitialCapacity {
    const NAME: &'static str = "hash_table_initial_capacity";
    const DESCRIPTION: &'static str = "Initial directory capacity of hash tables";

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut CompilerConfig) -> Result<()> {
        conf.hash_table_initial_capacity = positive_usize(Self::NAME, scalar, 1 << 30)?;
        Ok(())
    }

    fn get_as_scalar(conf: &CompilerConfig) -> ScalarValue {
        (conf.hash_table_initial_capacity as i64).into()
    }
}

pub struct NestedLoopBlockSize;

impl CompilerSetting for NestedLoopBlockSize {
    const NAME: &'static str = "nested_loop_block_size";
    const DESCRIPTION: &'static str = "Left rows buffered by a nested loop join before each scan of the right side";

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut CompilerConfig) -> Result<()> {
        conf.nested_loop_block_size = positive_usize(Self::NAME, scalar, 1 << 24)?;
        Ok(())
    }

    fn get_as_scalar(conf: &CompilerConfig) -> ScalarValue {
        (conf.nested_loop_block_size as i64).into()
    }
}

pub struct ParallelWorkers;

impl CompilerSetting for ParallelWorkers {
    const NAME: &'static str = "parallel_workers";
    const DESCRIPTION: &'static str = "Number of workers for pipelines that support parallel execution";

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut CompilerConfig) -> Result<()> {
        conf.parallel_workers = positive_usize(Self::NAME, scalar, 512)?;
        Ok(())
    }

    fn get_as_scalar(conf: &CompilerConfig) -> ScalarValue {
        (conf.parallel_workers as i64).into()
    }
}

pub struct Optimize;

impl CompilerSetting for Optimize {
    const NAME: &'static str = "optimize";
    const DESCRIPTION: &'static str = "Controls if generated code is optimized";

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut CompilerConfig) -> Result<()> {
        conf.optimize = scalar.try_as_bool()?;
        Ok(())
    }

    fn get_as_scalar(conf: &CompilerConfig) -> ScalarValue {
        conf.optimize.into()
    }
}

pub struct VerifyIr;

impl CompilerSetting for VerifyIr {
    const NAME: &'static str = "verify_ir";
    const DESCRIPTION: &'static str = "Controls if generated functions are verified before compilation";

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut CompilerConfig) -> Result<()> {
        conf.verify_ir = scalar.try_as_bool()?;
        Ok(())
    }

    fn get_as_scalar(conf: &CompilerConfig) -> ScalarValue {
        conf.verify_ir.into()
    }
}

pub struct DumpIr;

impl CompilerSetting for DumpIr {
    const NAME: &'static str = "dump_ir";
    const DESCRIPTION: &'static str = "Log the IR of every generated function";

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut CompilerConfig) -> Result<()> {
        conf.dump_ir = scalar.try_as_bool()?;
        Ok(())
    }

    fn get_as_scalar(conf: &CompilerConfig) -> ScalarValue {
        conf.dump_ir.into()
    }
}
