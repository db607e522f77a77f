use crate::codegen::PrimitiveType;
use crate::runtime::{consumer, error, hash_table, multi_thread, sorter, storage, strings};

/// Runtime library functions callable from generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeFunction {
    ThrowOverflow,
    ThrowDivideByZero,
    HasPendingError,
    HashBytes,
    CompareStrings,
    HashTableInit,
    HashTableDestroy,
    HashTableRelease,
    HashTableReserveOne,
    HashTableAllocEntry,
    HashTableInsertLazy,
    HashTableBuildLazy,
    HashTableReserveLazy,
    HashTableMergeLazyUnfinished,
    SorterInit,
    SorterStoreTuple,
    SorterSort,
    SorterNumTuples,
    SorterData,
    SorterClear,
    SorterDestroy,
    SorterRelease,
    CatalogGetTable,
    TableNumTileGroups,
    TableGetTileGroup,
    TileGroupNumRows,
    TileGroupColumnData,
    TileGroupColumnNulls,
    ThreadStatesInit,
    ThreadStatesRelease,
    ThreadStatesDestroyHashTables,
    RunParallel,
    WorkerId,
    WorkerRangeStart,
    WorkerRangeEnd,
    BarrierWait,
    MergeToGlobalHashTable,
    BufferedConsumerAppend,
    CountingConsumerAdd,
}

impl RuntimeFunction {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ThrowOverflow => "rt_throw_overflow",
            Self::ThrowDivideByZero => "rt_throw_divide_by_zero",
            Self::HasPendingError => "rt_has_pending_error",
            Self::HashBytes => "rt_hash_bytes",
            Self::CompareStrings => "rt_compare_strings",
            Self::HashTableInit => "rt_hash_table_init",
            Self::HashTableDestroy => "rt_hash_table_destroy",
            Self::HashTableRelease => "rt_hash_table_release",
            Self::HashTableReserveOne => "rt_hash_table_reserve_one",
            Self::HashTableAllocEntry => "rt_hash_table_alloc_entry",
            Self::HashTableInsertLazy => "rt_hash_table_insert_lazy",
            Self::HashTableBuildLazy => "rt_hash_table_build_lazy",
            Self::HashTableReserveLazy => "rt_hash_table_reserve_lazy",
            Self::HashTableMergeLazyUnfinished => "rt_hash_table_merge_lazy_unfinished",
            Self::SorterInit => "rt_sorter_init",
            Self::SorterStoreTuple => "rt_sorter_store_tuple",
            Self::SorterSort => "rt_sorter_sort",
            Self::SorterNumTuples => "rt_sorter_num_tuples",
            Self::SorterData => "rt_sorter_data",
            Self::SorterClear => "rt_sorter_clear",
            Self::SorterDestroy => "rt_sorter_destroy",
            Self::SorterRelease => "rt_sorter_release",
            Self::CatalogGetTable => "rt_catalog_get_table",
            Self::TableNumTileGroups => "rt_table_num_tile_groups",
            Self::TableGetTileGroup => "rt_table_get_tile_group",
            Self::TileGroupNumRows => "rt_tile_group_num_rows",
            Self::TileGroupColumnData => "rt_tile_group_column_data",
            Self::TileGroupColumnNulls => "rt_tile_group_column_nulls",
            Self::ThreadStatesInit => "rt_thread_states_init",
            Self::ThreadStatesRelease => "rt_thread_states_release",
            Self::ThreadStatesDestroyHashTables => "rt_thread_states_destroy_hash_tables",
            Self::RunParallel => "rt_run_parallel",
            Self::WorkerId => "rt_worker_id",
            Self::WorkerRangeStart => "rt_worker_range_start",
            Self::WorkerRangeEnd => "rt_worker_range_end",
            Self::BarrierWait => "rt_barrier_wait",
            Self::MergeToGlobalHashTable => "rt_merge_to_global_hash_table",
            Self::BufferedConsumerAppend => "rt_buffered_consumer_append",
            Self::CountingConsumerAdd => "rt_counting_consumer_add",
        }
    }

    pub fn params(&self) -> &'static [PrimitiveType] {
        use PrimitiveType::*;

        match self {
            Self::ThrowOverflow | Self::ThrowDivideByZero | Self::HasPendingError => &[],
            Self::HashBytes => &[CharPtr, Int32],
            Self::CompareStrings => &[CharPtr, Int32, CharPtr, Int32],
            Self::HashTableInit => &[VoidPtr, Int64, Int64],
            Self::HashTableDestroy
            | Self::HashTableRelease
            | Self::HashTableReserveOne
            | Self::HashTableBuildLazy
            | Self::SorterNumTuples
            | Self::SorterData
            | Self::SorterClear
            | Self::SorterDestroy
            | Self::SorterRelease
            | Self::SorterStoreTuple
            | Self::TableNumTileGroups
            | Self::TileGroupNumRows
            | Self::ThreadStatesInit
            | Self::ThreadStatesRelease
            | Self::WorkerId
            | Self::BarrierWait => &[VoidPtr],
            Self::HashTableAllocEntry | Self::HashTableInsertLazy | Self::ThreadStatesDestroyHashTables => {
                &[VoidPtr, Int64]
            }
            Self::HashTableReserveLazy => &[VoidPtr, VoidPtr, Int64],
            Self::HashTableMergeLazyUnfinished | Self::SorterSort => &[VoidPtr, VoidPtr],
            Self::SorterInit => &[VoidPtr, Int64],
            Self::CatalogGetTable => &[VoidPtr, Int32],
            Self::TableGetTileGroup => &[VoidPtr, Int64],
            Self::TileGroupColumnData | Self::TileGroupColumnNulls => &[VoidPtr, Int32],
            Self::RunParallel => &[VoidPtr, VoidPtr, VoidPtr, Int64, Int64],
            Self::WorkerRangeStart | Self::WorkerRangeEnd => &[VoidPtr, Int64],
            Self::MergeToGlobalHashTable => &[VoidPtr, VoidPtr, VoidPtr],
            Self::BufferedConsumerAppend => &[VoidPtr, VoidPtr],
            Self::CountingConsumerAdd => &[VoidPtr, Int64],
        }
    }

    pub const fn return_type(&self) -> PrimitiveType {
        use PrimitiveType::*;

        match self {
            Self::HasPendingError | Self::BarrierWait => Bool,
            Self::HashBytes
            | Self::SorterNumTuples
            | Self::TableNumTileGroups
            | Self::TileGroupNumRows
            | Self::WorkerId
            | Self::WorkerRangeStart
            | Self::WorkerRangeEnd => Int64,
            Self::CompareStrings => Int32,
            Self::HashTableAllocEntry
            | Self::HashTableInsertLazy
            | Self::SorterStoreTuple
            | Self::SorterData
            | Self::CatalogGetTable
            | Self::TableGetTileGroup
            | Self::TileGroupColumnData
            | Self::TileGroupColumnNulls => VoidPtr,
            _ => Void,
        }
    }

    /// If the function may leave a pending error that the caller needs to
    /// check for.
    pub const fn is_fallible(&self) -> bool {
        matches!(
            self,
            Self::HashTableDestroy
                | Self::HashTableReserveOne
                | Self::HashTableBuildLazy
                | Self::HashTableReserveLazy
                | Self::HashTableMergeLazyUnfinished
                | Self::SorterDestroy
                | Self::CatalogGetTable
                | Self::RunParallel
                | Self::BarrierWait
                | Self::MergeToGlobalHashTable
                | Self::BufferedConsumerAppend
        )
    }

    /// Address of the function in this process.
    pub fn address(&self) -> usize {
        match self {
            Self::ThrowOverflow => error::rt_throw_overflow as *const () as usize,
            Self::ThrowDivideByZero => error::rt_throw_divide_by_zero as *const () as usize,
            Self::HasPendingError => error::rt_has_pending_error as *const () as usize,
            Self::HashBytes => strings::rt_hash_bytes as *const () as usize,
            Self::CompareStrings => strings::rt_compare_strings as *const () as usize,
            Self::HashTableInit => hash_table::rt_hash_table_init as *const () as usize,
            Self::HashTableDestroy => hash_table::rt_hash_table_destroy as *const () as usize,
            Self::HashTableRelease => hash_table::rt_hash_table_release as *const () as usize,
            Self::HashTableReserveOne => hash_table::rt_hash_table_reserve_one as *const () as usize,
            Self::HashTableAllocEntry => hash_table::rt_hash_table_alloc_entry as *const () as usize,
            Self::HashTableInsertLazy => hash_table::rt_hash_table_insert_lazy as *const () as usize,
            Self::HashTableBuildLazy => hash_table::rt_hash_table_build_lazy as *const () as usize,
            Self::HashTableReserveLazy => hash_table::rt_hash_table_reserve_lazy as *const () as usize,
            Self::HashTableMergeLazyUnfinished => hash_table::rt_hash_table_merge_lazy_unfinished as *const () as usize,
            Self::SorterInit => sorter::rt_sorter_init as *const () as usize,
            Self::SorterStoreTuple => sorter::rt_sorter_store_tuple as *const () as usize,
            Self::SorterSort => sorter::rt_sorter_sort as *const () as usize,
            Self::SorterNumTuples => sorter::rt_sorter_num_tuples as *const () as usize,
            Self::SorterData => sorter::rt_sorter_data as *const () as usize,
            Self::SorterClear => sorter::rt_sorter_clear as *const () as usize,
            Self::SorterDestroy => sorter::rt_sorter_destroy as *const () as usize,
            Self::SorterRelease => sorter::rt_sorter_release as *const () as usize,
            Self::CatalogGetTable => storage::rt_catalog_get_table as *const () as usize,
            Self::TableNumTileGroups => storage::rt_table_num_tile_groups as *const () as usize,
            Self::TableGetTileGroup => storage::rt_table_get_tile_group as *const () as usize,
            Self::TileGroupNumRows => storage::rt_tile_group_num_rows as *const () as usize,
            Self::TileGroupColumnData => storage::rt_tile_group_column_data as *const () as usize,
            Self::TileGroupColumnNulls => storage::rt_tile_group_column_nulls as *const () as usize,
            Self::ThreadStatesInit => multi_thread::rt_thread_states_init as *const () as usize,
            Self::ThreadStatesRelease => multi_thread::rt_thread_states_release as *const () as usize,
            Self::ThreadStatesDestroyHashTables => multi_thread::rt_thread_states_destroy_hash_tables as *const () as usize,
            Self::RunParallel => multi_thread::rt_run_parallel as *const () as usize,
            Self::WorkerId => multi_thread::rt_worker_id as *const () as usize,
            Self::WorkerRangeStart => multi_thread::rt_worker_range_start as *const () as usize,
            Self::WorkerRangeEnd => multi_thread::rt_worker_range_end as *const () as usize,
            Self::BarrierWait => multi_thread::rt_barrier_wait as *const () as usize,
            Self::MergeToGlobalHashTable => multi_thread::rt_merge_to_global_hash_table as *const () as usize,
            Self::BufferedConsumerAppend => consumer::rt_buffered_consumer_append as *const () as usize,
            Self::CountingConsumerAdd => consumer::rt_counting_consumer_add as *const () as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_point_at_runtime_functions() {
        assert_eq!(
            sorter::rt_sorter_release as *const () as usize,
            RuntimeFunction::SorterRelease.address()
        );
        assert_ne!(
            RuntimeFunction::HashTableDestroy.address(),
            RuntimeFunction::HashTableRelease.address()
        );
        assert_ne!(0, RuntimeFunction::ThreadStatesRelease.address());
    }

    #[test]
    fn tear_down_releases_never_raise() {
        assert!(RuntimeFunction::HashTableDestroy.is_fallible());
        assert!(!RuntimeFunction::HashTableRelease.is_fallible());
        assert!(RuntimeFunction::SorterDestroy.is_fallible());
        assert!(!RuntimeFunction::SorterRelease.is_fallible());
        assert!(!RuntimeFunction::ThreadStatesRelease.is_fallible());
    }
}
