mod delta;
mod entity;

pub use delta::{
    apply_delta, apply_snapshot, build_snapshot, encode_delta, field_diff, BitReader, BitWriter,
    BuiltSnapshot, DeltaCache, DeltaError, FieldMask, TickHistory, TickSnapshot,
    DEFAULT_MAX_DELTA_TICKS,
};
pub use entity::{BaselineTable, EntityState, MAX_ENTITIES};
