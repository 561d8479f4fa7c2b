use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::entity::{BaselineTable, EntityState};

pub const DEFAULT_MAX_DELTA_TICKS: u32 = 192;

/// Reference-tick key used for full create-records encoded against the
/// class baseline instead of a prior tick.
const BASELINE_REF: u32 = u32::MAX;

const MASK_BITS: u32 = 9;

const RECORD_DELTA: u8 = 0;
const RECORD_CREATE: u8 = 1;
const RECORD_REMOVE: u8 = 2;
const RECORD_EVENTS: u8 = 3;

bitflags::bitflags! {
    /// Changed-field mask. Bit order is the wire field order; every encoder
    /// walks bits ascending so identical inputs produce identical bytes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FieldMask: u16 {
        const ORIGIN_X = 1 << 0;
        const ORIGIN_Y = 1 << 1;
        const ORIGIN_Z = 1 << 2;
        const VELOCITY = 1 << 3;
        const ANGLES = 1 << 4;
        const FRAME = 1 << 5;
        const SKIN = 1 << 6;
        const EFFECTS = 1 << 7;
        const HEALTH = 1 << 8;
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DeltaError {
    #[error("delta payload truncated")]
    Truncated,
    #[error("tick {0} not present in history")]
    MissingTick(u32),
    #[error("delta record references unknown entity {0}")]
    UnknownEntity(u16),
    #[error("malformed snapshot record")]
    Malformed,
}

/// LSB-first bit packer for delta payloads.
#[derive(Debug, Default)]
pub struct BitWriter {
    bytes: Vec<u8>,
    acc: u64,
    nbits: u32,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_bits(&mut self, value: u32, bits: u32) {
        debug_assert!(bits >= 1 && bits <= 32);
        self.acc |= ((value as u64) & ((1u64 << bits) - 1)) << self.nbits;
        self.nbits += bits;
        while self.nbits >= 8 {
            self.bytes.push(self.acc as u8);
            self.acc >>= 8;
            self.nbits -= 8;
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        if self.nbits > 0 {
            self.bytes.push(self.acc as u8);
        }
        self.bytes
    }
}

#[derive(Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
    acc: u64,
    nbits: u32,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            acc: 0,
            nbits: 0,
        }
    }

    pub fn read_bits(&mut self, bits: u32) -> Result<u32, DeltaError> {
        debug_assert!(bits >= 1 && bits <= 32);
        while self.nbits < bits {
            let byte = *self.data.get(self.pos).ok_or(DeltaError::Truncated)?;
            self.acc |= (byte as u64) << self.nbits;
            self.pos += 1;
            self.nbits += 8;
        }
        let value = (self.acc & ((1u64 << bits) - 1)) as u32;
        self.acc >>= bits;
        self.nbits -= bits;
        Ok(value)
    }
}

/// Computes the changed-field mask between two states of the same entity.
pub fn field_diff(from: &EntityState, to: &EntityState) -> FieldMask {
    let mut mask = FieldMask::empty();
    if from.origin[0] != to.origin[0] {
        mask |= FieldMask::ORIGIN_X;
    }
    if from.origin[1] != to.origin[1] {
        mask |= FieldMask::ORIGIN_Y;
    }
    if from.origin[2] != to.origin[2] {
        mask |= FieldMask::ORIGIN_Z;
    }
    if from.velocity != to.velocity {
        mask |= FieldMask::VELOCITY;
    }
    if from.angles != to.angles {
        mask |= FieldMask::ANGLES;
    }
    if from.frame != to.frame {
        mask |= FieldMask::FRAME;
    }
    if from.skin != to.skin {
        mask |= FieldMask::SKIN;
    }
    if from.effects != to.effects {
        mask |= FieldMask::EFFECTS;
    }
    if from.health != to.health {
        mask |= FieldMask::HEALTH;
    }
    mask
}

/// Bit-packs the fields of `to` that differ from `from`, in fixed mask-bit
/// order. Pure function of its inputs, which is what makes cache entries
/// shareable across sessions.
pub fn encode_delta(from: &EntityState, to: &EntityState) -> Vec<u8> {
    let mask = field_diff(from, to);
    let mut writer = BitWriter::new();
    writer.write_bits(mask.bits() as u32, MASK_BITS);

    if mask.contains(FieldMask::ORIGIN_X) {
        writer.write_bits(to.origin[0] as u32, 32);
    }
    if mask.contains(FieldMask::ORIGIN_Y) {
        writer.write_bits(to.origin[1] as u32, 32);
    }
    if mask.contains(FieldMask::ORIGIN_Z) {
        writer.write_bits(to.origin[2] as u32, 32);
    }
    if mask.contains(FieldMask::VELOCITY) {
        for v in to.velocity {
            writer.write_bits(v as u16 as u32, 16);
        }
    }
    if mask.contains(FieldMask::ANGLES) {
        for a in to.angles {
            writer.write_bits(a as u16 as u32, 16);
        }
    }
    if mask.contains(FieldMask::FRAME) {
        writer.write_bits(to.frame as u32, 8);
    }
    if mask.contains(FieldMask::SKIN) {
        writer.write_bits(to.skin as u32, 8);
    }
    if mask.contains(FieldMask::EFFECTS) {
        writer.write_bits(to.effects as u32, 16);
    }
    if mask.contains(FieldMask::HEALTH) {
        writer.write_bits(to.health as u16 as u32, 16);
    }

    writer.finish()
}

/// Inverse of [`encode_delta`]: `apply_delta(from, encode_delta(from, to))`
/// yields exactly `to` (modulo entity/class, which the record framing
/// carries).
pub fn apply_delta(from: &EntityState, data: &[u8]) -> Result<EntityState, DeltaError> {
    let mut reader = BitReader::new(data);
    let mask =
        FieldMask::from_bits(reader.read_bits(MASK_BITS)? as u16).ok_or(DeltaError::Malformed)?;

    let mut state = *from;
    if mask.contains(FieldMask::ORIGIN_X) {
        state.origin[0] = reader.read_bits(32)? as i32;
    }
    if mask.contains(FieldMask::ORIGIN_Y) {
        state.origin[1] = reader.read_bits(32)? as i32;
    }
    if mask.contains(FieldMask::ORIGIN_Z) {
        state.origin[2] = reader.read_bits(32)? as i32;
    }
    if mask.contains(FieldMask::VELOCITY) {
        for v in &mut state.velocity {
            *v = reader.read_bits(16)? as u16 as i16;
        }
    }
    if mask.contains(FieldMask::ANGLES) {
        for a in &mut state.angles {
            *a = reader.read_bits(16)? as u16 as i16;
        }
    }
    if mask.contains(FieldMask::FRAME) {
        state.frame = reader.read_bits(8)? as u8;
    }
    if mask.contains(FieldMask::SKIN) {
        state.skin = reader.read_bits(8)? as u8;
    }
    if mask.contains(FieldMask::EFFECTS) {
        state.effects = reader.read_bits(16)? as u16;
    }
    if mask.contains(FieldMask::HEALTH) {
        state.health = reader.read_bits(16)? as u16 as i16;
    }
    Ok(state)
}

/// Memoized encoded deltas keyed by `(entity, reference_tick)`, valid for
/// one destination tick at a time. Sessions sharing an acknowledged
/// baseline tick reuse the same published bytes; entries are immutable
/// once inserted.
#[derive(Debug, Default)]
pub struct DeltaCache {
    to_tick: u32,
    entries: HashMap<(u16, u32), Arc<[u8]>>,
    hits: u64,
    misses: u64,
}

impl DeltaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compute(
        &mut self,
        entity: u16,
        from_tick: u32,
        to_tick: u32,
        from: &EntityState,
        to: &EntityState,
    ) -> Arc<[u8]> {
        if to_tick != self.to_tick {
            // Entries only ever describe deltas toward the current tick.
            self.entries.clear();
            self.to_tick = to_tick;
        }

        if let Some(bits) = self.entries.get(&(entity, from_tick)) {
            self.hits += 1;
            return Arc::clone(bits);
        }

        self.misses += 1;
        let bits: Arc<[u8]> = encode_delta(from, to).into();
        self.entries.insert((entity, from_tick), Arc::clone(&bits));
        bits
    }

    /// Wholesale invalidation on level change or tick-counter reset.
    pub fn flush(&mut self) {
        self.entries.clear();
        self.to_tick = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hit_rate(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

/// All entity states at one tick, ordered ascending by entity index.
#[derive(Debug, Clone)]
pub struct TickSnapshot {
    pub tick: u32,
    entities: Vec<EntityState>,
}

impl TickSnapshot {
    pub fn new(tick: u32, mut entities: Vec<EntityState>) -> Self {
        entities.sort_unstable_by_key(|e| e.entity);
        Self { tick, entities }
    }

    pub fn entities(&self) -> &[EntityState] {
        &self.entities
    }

    pub fn find(&self, entity: u16) -> Option<&EntityState> {
        self.entities
            .binary_search_by_key(&entity, |e| e.entity)
            .ok()
            .map(|i| &self.entities[i])
    }
}

/// Ring of recent per-tick snapshots, indexed `tick % capacity`. A tick
/// that fell out of the ring forces clients onto a full update.
#[derive(Debug)]
pub struct TickHistory {
    slots: Vec<Option<TickSnapshot>>,
    capacity: usize,
}

impl TickHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            capacity,
        }
    }

    pub fn push(&mut self, snapshot: TickSnapshot) {
        let index = (snapshot.tick as usize) % self.capacity;
        self.slots[index] = Some(snapshot);
    }

    pub fn get(&self, tick: u32) -> Option<&TickSnapshot> {
        let index = (tick as usize) % self.capacity;
        self.slots[index].as_ref().filter(|s| s.tick == tick)
    }

    pub fn latest(&self) -> Option<&TickSnapshot> {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref())
            .max_by_key(|s| s.tick)
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}

/// One client-bound snapshot: `delta_tick` is the reference tick the
/// payload was encoded against, or -1 for a full update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltSnapshot {
    pub tick: u32,
    pub delta_tick: i32,
    pub payload: Vec<u8>,
}

impl BuiltSnapshot {
    pub fn is_full(&self) -> bool {
        self.delta_tick < 0
    }
}

/// Builds the snapshot payload for one client. Falls back to a full
/// update against the class baselines when the client has no acknowledged
/// tick, its reference tick left the history ring, or it lags past
/// `max_delta_ticks`.
pub fn build_snapshot(
    history: &TickHistory,
    baselines: &BaselineTable,
    cache: &mut DeltaCache,
    acked_tick: Option<u32>,
    to_tick: u32,
    events: &[u8],
    max_delta_ticks: u32,
) -> Result<BuiltSnapshot, DeltaError> {
    let to = history.get(to_tick).ok_or(DeltaError::MissingTick(to_tick))?;

    let from = acked_tick.and_then(|t| {
        if t >= to_tick || to_tick - t > max_delta_ticks {
            None
        } else {
            history.get(t)
        }
    });

    let mut payload = Vec::new();

    match from {
        None => {
            for state in to.entities() {
                let baseline = baselines.get(state.class);
                let bits = cache.get_or_compute(state.entity, BASELINE_REF, to_tick, &baseline, state);
                write_create_record(&mut payload, state.entity, state.class, &bits);
            }
        }
        Some(from) => {
            for state in to.entities() {
                match from.find(state.entity) {
                    Some(prev) => {
                        let bits =
                            cache.get_or_compute(state.entity, from.tick, to_tick, prev, state);
                        write_delta_record(&mut payload, state.entity, &bits);
                    }
                    None => {
                        // Spawned since the reference tick; emit a full
                        // create-record instead of a delta.
                        let baseline = baselines.get(state.class);
                        let bits = cache.get_or_compute(
                            state.entity,
                            BASELINE_REF,
                            to_tick,
                            &baseline,
                            state,
                        );
                        write_create_record(&mut payload, state.entity, state.class, &bits);
                    }
                }
            }
            for prev in from.entities() {
                if to.find(prev.entity).is_none() {
                    payload.push(RECORD_REMOVE);
                    payload.extend_from_slice(&prev.entity.to_le_bytes());
                }
            }
        }
    }

    if !events.is_empty() {
        payload.push(RECORD_EVENTS);
        payload.extend_from_slice(&(events.len() as u16).to_le_bytes());
        payload.extend_from_slice(events);
    }

    let delta_tick = from.map(|f| f.tick as i32).unwrap_or(-1);
    Ok(BuiltSnapshot {
        tick: to_tick,
        delta_tick,
        payload,
    })
}

/// Reconstructs the tick state a snapshot payload describes. `from` must
/// be the reference tick's state for delta payloads and `None` for full
/// payloads. Returns the rebuilt snapshot plus any appended event bytes.
pub fn apply_snapshot(
    from: Option<&TickSnapshot>,
    baselines: &BaselineTable,
    payload: &[u8],
    to_tick: u32,
) -> Result<(TickSnapshot, Vec<u8>), DeltaError> {
    let mut entities: BTreeMap<u16, EntityState> = from
        .map(|s| s.entities().iter().map(|e| (e.entity, *e)).collect())
        .unwrap_or_default();
    let mut events = Vec::new();

    let mut cursor = payload;
    while !cursor.is_empty() {
        let kind = cursor[0];
        cursor = &cursor[1..];
        match kind {
            RECORD_DELTA => {
                let (entity, rest) = read_u16(cursor)?;
                let (blob, rest) = read_blob(rest)?;
                cursor = rest;
                let prev = from
                    .and_then(|s| s.find(entity))
                    .copied()
                    .ok_or(DeltaError::UnknownEntity(entity))?;
                let mut state = apply_delta(&prev, blob)?;
                state.entity = entity;
                entities.insert(entity, state);
            }
            RECORD_CREATE => {
                if cursor.len() < 3 {
                    return Err(DeltaError::Truncated);
                }
                let (entity, rest) = read_u16(cursor)?;
                let class = rest[0];
                let (blob, rest) = read_blob(&rest[1..])?;
                cursor = rest;
                let baseline = baselines.get(class);
                let mut state = apply_delta(&baseline, blob)?;
                state.entity = entity;
                state.class = class;
                entities.insert(entity, state);
            }
            RECORD_REMOVE => {
                let (entity, rest) = read_u16(cursor)?;
                cursor = rest;
                entities.remove(&entity);
            }
            RECORD_EVENTS => {
                let (blob, rest) = read_blob(cursor)?;
                cursor = rest;
                events.extend_from_slice(blob);
            }
            _ => return Err(DeltaError::Malformed),
        }
    }

    Ok((
        TickSnapshot::new(to_tick, entities.into_values().collect()),
        events,
    ))
}

fn write_delta_record(payload: &mut Vec<u8>, entity: u16, bits: &[u8]) {
    payload.push(RECORD_DELTA);
    payload.extend_from_slice(&entity.to_le_bytes());
    payload.extend_from_slice(&(bits.len() as u16).to_le_bytes());
    payload.extend_from_slice(bits);
}

fn write_create_record(payload: &mut Vec<u8>, entity: u16, class: u8, bits: &[u8]) {
    payload.push(RECORD_CREATE);
    payload.extend_from_slice(&entity.to_le_bytes());
    payload.push(class);
    payload.extend_from_slice(&(bits.len() as u16).to_le_bytes());
    payload.extend_from_slice(bits);
}

fn read_u16(data: &[u8]) -> Result<(u16, &[u8]), DeltaError> {
    if data.len() < 2 {
        return Err(DeltaError::Truncated);
    }
    Ok((u16::from_le_bytes([data[0], data[1]]), &data[2..]))
}

fn read_blob(data: &[u8]) -> Result<(&[u8], &[u8]), DeltaError> {
    let (len, rest) = read_u16(data)?;
    if rest.len() < len as usize {
        return Err(DeltaError::Truncated);
    }
    Ok((&rest[..len as usize], &rest[len as usize..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn state(entity: u16, x: f32, health: i16) -> EntityState {
        let mut s = EntityState::new(entity, 1);
        s.set_origin(Vec3::new(x, 0.0, 0.0));
        s.health = health;
        s
    }

    #[test]
    fn test_bit_writer_reader_roundtrip() {
        let mut writer = BitWriter::new();
        writer.write_bits(0b101, 3);
        writer.write_bits(0xFFFF_FFFF, 32);
        writer.write_bits(42, 7);
        let bytes = writer.finish();

        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read_bits(3).unwrap(), 0b101);
        assert_eq!(reader.read_bits(32).unwrap(), 0xFFFF_FFFF);
        assert_eq!(reader.read_bits(7).unwrap(), 42);
    }

    #[test]
    fn test_bit_reader_truncated() {
        let mut reader = BitReader::new(&[0xAB]);
        reader.read_bits(8).unwrap();
        assert_eq!(reader.read_bits(1), Err(DeltaError::Truncated));
    }

    #[test]
    fn test_delta_roundtrip_law() {
        let from = state(5, 10.0, 100);
        let mut to = from;
        to.set_origin(Vec3::new(12.5, 3.0, -1.0));
        to.set_velocity(Vec3::new(1.0, 0.0, 0.0));
        to.health = 80;
        to.frame = 7;
        to.effects = 0x0101;

        let encoded = encode_delta(&from, &to);
        let applied = apply_delta(&from, &encoded).unwrap();
        assert_eq!(applied, to);
    }

    #[test]
    fn test_identical_states_empty_mask() {
        let s = state(5, 10.0, 100);
        let encoded = encode_delta(&s, &s);
        // Just the 9-bit mask, rounded up to two bytes.
        assert_eq!(encoded.len(), 2);
        assert_eq!(apply_delta(&s, &encoded).unwrap(), s);
    }

    #[test]
    fn test_cache_shares_identical_bytes() {
        let mut cache = DeltaCache::new();
        let from = state(5, 10.0, 100);
        let to = state(5, 11.0, 90);

        let a = cache.get_or_compute(5, 10, 20, &from, &to);
        let b = cache.get_or_compute(5, 10, 20, &from, &to);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.hit_rate(), (1, 1));
    }

    #[test]
    fn test_cache_clears_on_new_destination_tick() {
        let mut cache = DeltaCache::new();
        let from = state(5, 10.0, 100);
        let to = state(5, 11.0, 90);

        cache.get_or_compute(5, 10, 20, &from, &to);
        assert_eq!(cache.len(), 1);
        cache.get_or_compute(5, 10, 21, &from, &to);
        assert_eq!(cache.len(), 1);
    }

    fn history_with(ticks: &[(u32, Vec<EntityState>)]) -> TickHistory {
        let mut history = TickHistory::new(256);
        for (tick, entities) in ticks {
            history.push(TickSnapshot::new(*tick, entities.clone()));
        }
        history
    }

    #[test]
    fn test_full_snapshot_when_no_ack() {
        let history = history_with(&[(10, vec![state(1, 5.0, 100)])]);
        let baselines = BaselineTable::new(4);
        let mut cache = DeltaCache::new();

        let built =
            build_snapshot(&history, &baselines, &mut cache, None, 10, &[], 192).unwrap();
        assert!(built.is_full());
        assert_eq!(built.delta_tick, -1);
    }

    #[test]
    fn test_full_snapshot_when_window_exceeded() {
        let history = history_with(&[
            (10, vec![state(1, 5.0, 100)]),
            (250, vec![state(1, 6.0, 100)]),
        ]);
        let baselines = BaselineTable::new(4);
        let mut cache = DeltaCache::new();

        let built =
            build_snapshot(&history, &baselines, &mut cache, Some(10), 250, &[], 192).unwrap();
        assert!(built.is_full());
    }

    #[test]
    fn test_delta_snapshot_roundtrip() {
        let from_entities = vec![state(1, 5.0, 100), state(2, 8.0, 50)];
        let mut to_entities = vec![state(1, 6.0, 90), state(2, 8.0, 50), state(3, 0.0, 10)];
        to_entities[2].class = 2;
        let history = history_with(&[(10, from_entities), (12, to_entities)]);
        let baselines = BaselineTable::new(4);
        let mut cache = DeltaCache::new();

        let built =
            build_snapshot(&history, &baselines, &mut cache, Some(10), 12, &[], 192).unwrap();
        assert_eq!(built.delta_tick, 10);

        let (rebuilt, events) =
            apply_snapshot(history.get(10), &baselines, &built.payload, 12).unwrap();
        assert!(events.is_empty());
        assert_eq!(rebuilt.entities(), history.get(12).unwrap().entities());
    }

    #[test]
    fn test_removed_entity_dropped_on_apply() {
        let history = history_with(&[
            (10, vec![state(1, 5.0, 100), state(2, 8.0, 50)]),
            (11, vec![state(1, 5.0, 100)]),
        ]);
        let baselines = BaselineTable::new(4);
        let mut cache = DeltaCache::new();

        let built =
            build_snapshot(&history, &baselines, &mut cache, Some(10), 11, &[], 192).unwrap();
        let (rebuilt, _) = apply_snapshot(history.get(10), &baselines, &built.payload, 11).unwrap();
        assert_eq!(rebuilt.entities().len(), 1);
        assert!(rebuilt.find(2).is_none());
    }

    #[test]
    fn test_event_bytes_carried() {
        let history = history_with(&[(10, vec![state(1, 5.0, 100)])]);
        let baselines = BaselineTable::new(4);
        let mut cache = DeltaCache::new();

        let built = build_snapshot(
            &history,
            &baselines,
            &mut cache,
            None,
            10,
            b"boom",
            192,
        )
        .unwrap();
        let (_, events) = apply_snapshot(None, &baselines, &built.payload, 10).unwrap();
        assert_eq!(events, b"boom");
    }

    #[test]
    fn test_missing_tick_errors() {
        let history = TickHistory::new(16);
        let baselines = BaselineTable::new(4);
        let mut cache = DeltaCache::new();
        assert_eq!(
            build_snapshot(&history, &baselines, &mut cache, None, 5, &[], 192),
            Err(DeltaError::MissingTick(5))
        );
    }

    #[test]
    fn test_history_ring_evicts_old_ticks() {
        let mut history = TickHistory::new(8);
        for tick in 0..20 {
            history.push(TickSnapshot::new(tick, vec![]));
        }
        assert!(history.get(5).is_none());
        assert!(history.get(19).is_some());
        assert_eq!(history.latest().unwrap().tick, 19);
    }
}
