//! Grid-neighbor visual smoothing engine.
//!
//! Each registered object derives a discrete visual descriptor from the
//! presence of similarly-tagged neighbors on its grid. Recomputation is
//! incremental: membership changes enqueue the object and its neighborhood
//! into dirty queues, and [`SmoothingEngine::tick`] drains those queues once
//! per host update step, deduplicating work with a generation stamp.

use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;
use thiserror::Error;
use tileweld_grid::{CardinalFacing, Direction, Facing, GridId, TileCoord};
use tracing::error;

new_key_type! {
    /// Stable handle for smoothing members backed by a generational slot map.
    pub struct ObjectId;
}

/// Convenience alias for associating host-side data with smoothing members.
pub type ObjectMap<T> = SecondaryMap<ObjectId, T>;

/// Errors surfaced by the smoothing engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SmoothingError {
    /// An object reached recompute without a presentation slot to receive
    /// its states. The engine drops the member and continues the tick.
    #[error("object {0:?} has no presentation slot")]
    MissingPresentationCounterpart(ObjectId),
    /// An anchored object's grid handle no longer resolves; recompute is
    /// skipped for this generation.
    #[error("grid {0:?} does not resolve in the spatial view")]
    MissingGrid(GridId),
    /// A mode string from an external profile failed to parse. Never
    /// coerced to a default mode.
    #[error("unrecognized smoothing mode `{0}`")]
    InvalidMode(String),
}

/// How an object's visual descriptor is derived from its neighbors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmoothMode {
    /// Four corner slots, each filled from a 3-bit mask of the adjacent
    /// cardinal and diagonal neighbors, remapped by the object's facing.
    #[default]
    Corners,
    /// One base slot selected by a 4-bit mask of cardinal neighbors.
    CardinalFlags,
    /// One base slot that is "on" only when all three facing-rotated
    /// diagonal probes match.
    Diagonal,
    /// Contributes to neighbors' computations but never emits states of
    /// its own.
    NoSprite,
}

impl FromStr for SmoothMode {
    type Err = SmoothingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "corners" => Ok(Self::Corners),
            "cardinal_flags" => Ok(Self::CardinalFlags),
            "diagonal" => Ok(Self::Diagonal),
            "no_sprite" => Ok(Self::NoSprite),
            other => Err(SmoothingError::InvalidMode(other.to_string())),
        }
    }
}

/// Bitmask of cardinal directions: North = 1, South = 2, East = 4, West = 8.
///
/// Doubles as the connection mask for [`SmoothMode::CardinalFlags`] (the mask
/// value selects the visual state) and as the edge-visibility set on
/// [`VisualDescriptor`] (a set bit means the edge in that direction shows).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CardinalDirs(u8);

impl CardinalDirs {
    pub const NONE: Self = Self(0);
    pub const NORTH: Self = Self(1);
    pub const SOUTH: Self = Self(2);
    pub const EAST: Self = Self(4);
    pub const WEST: Self = Self(8);
    pub const ALL: Self = Self(15);

    /// Raw mask value, as used in state-name suffixes.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// The cardinal directions not present in this set.
    #[must_use]
    pub const fn complement(self) -> Self {
        Self(Self::ALL.0 & !self.0)
    }
}

impl BitOr for CardinalDirs {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CardinalDirs {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Fill mask for one visual corner.
///
/// CounterClockwise = 1 when the cardinal neighbor counter-clockwise of the
/// corner is present, Diagonal = 2 for the diagonal neighbor at the corner,
/// Clockwise = 4 for the cardinal neighbor clockwise of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CornerFill(u8);

impl CornerFill {
    pub const NONE: Self = Self(0);
    pub const COUNTER_CLOCKWISE: Self = Self(1);
    pub const DIAGONAL: Self = Self(2);
    pub const CLOCKWISE: Self = Self(4);

    /// Raw mask value, as used in state-name suffixes.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether the two masks share any fill bit.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for CornerFill {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CornerFill {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Presence of a matching neighbor in each of the eight compass directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NeighborMatches {
    pub n: bool,
    pub ne: bool,
    pub e: bool,
    pub se: bool,
    pub s: bool,
    pub sw: bool,
    pub w: bool,
    pub nw: bool,
}

impl NeighborMatches {
    pub fn set(&mut self, dir: Direction, matched: bool) {
        match dir {
            Direction::North => self.n = matched,
            Direction::NorthEast => self.ne = matched,
            Direction::East => self.e = matched,
            Direction::SouthEast => self.se = matched,
            Direction::South => self.s = matched,
            Direction::SouthWest => self.sw = matched,
            Direction::West => self.w = matched,
            Direction::NorthWest => self.nw = matched,
        }
    }
}

/// Per-corner fill masks for the four corner slots.
///
/// Produced in world space by [`corner_fill`]; [`CornerMasks::remap`] turns
/// them into facing-relative slot values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CornerMasks {
    pub ne: CornerFill,
    pub nw: CornerFill,
    pub sw: CornerFill,
    pub se: CornerFill,
}

/// Slot permutations per snapped facing, indexed by [`CardinalFacing::index`].
/// Entries index into the cyclic corner order `[NE, NW, SW, SE]`; each facing
/// rotates the tuple by a further quarter turn, south being the identity.
const CORNER_REMAP: [[usize; 4]; 4] = [
    [0, 1, 2, 3],
    [1, 2, 3, 0],
    [2, 3, 0, 1],
    [3, 0, 1, 2],
];

impl CornerMasks {
    const fn as_array(self) -> [CornerFill; 4] {
        [self.ne, self.nw, self.sw, self.se]
    }

    /// Remap world-space corners onto the facing-relative visual slots.
    ///
    /// The physical corner slots are fixed in world space while the visual
    /// slots are defined relative to the object's facing, so the tuple
    /// rotates with the snapped facing. An all-zero tuple is unchanged by
    /// any facing.
    #[must_use]
    pub fn remap(self, facing: CardinalFacing) -> Self {
        let raw = self.as_array();
        let perm = &CORNER_REMAP[facing.index()];
        Self {
            ne: raw[perm[0]],
            nw: raw[perm[1]],
            sw: raw[perm[2]],
            se: raw[perm[3]],
        }
    }
}

/// Accumulate the raw corner fill masks from the eight compass matches.
///
/// Each cardinal neighbor feeds the two corners it touches (counter-clockwise
/// for one, clockwise for the other); each diagonal neighbor feeds the
/// diagonal bit of its own corner.
#[must_use]
pub fn corner_fill(matches: NeighborMatches) -> CornerMasks {
    let mut corners = CornerMasks::default();
    if matches.n {
        corners.ne |= CornerFill::COUNTER_CLOCKWISE;
        corners.nw |= CornerFill::CLOCKWISE;
    }
    if matches.ne {
        corners.ne |= CornerFill::DIAGONAL;
    }
    if matches.e {
        corners.ne |= CornerFill::CLOCKWISE;
        corners.se |= CornerFill::COUNTER_CLOCKWISE;
    }
    if matches.se {
        corners.se |= CornerFill::DIAGONAL;
    }
    if matches.s {
        corners.se |= CornerFill::CLOCKWISE;
        corners.sw |= CornerFill::COUNTER_CLOCKWISE;
    }
    if matches.sw {
        corners.sw |= CornerFill::DIAGONAL;
    }
    if matches.w {
        corners.sw |= CornerFill::CLOCKWISE;
        corners.nw |= CornerFill::COUNTER_CLOCKWISE;
    }
    if matches.nw {
        corners.nw |= CornerFill::DIAGONAL;
    }
    corners
}

/// Edge visibility between adjacent corner slots: an edge hides only when
/// both of its corner slots share a connecting fill bit.
#[must_use]
pub fn corner_edges(corners: CornerMasks) -> CardinalDirs {
    let mut edges = CardinalDirs::NONE;
    if !corners.se.intersects(corners.sw) {
        edges |= CardinalDirs::SOUTH;
    }
    if !corners.se.intersects(corners.ne) {
        edges |= CardinalDirs::EAST;
    }
    if !corners.ne.intersects(corners.nw) {
        edges |= CardinalDirs::NORTH;
    }
    if !corners.nw.intersects(corners.sw) {
        edges |= CardinalDirs::WEST;
    }
    edges
}

/// Rendering slot a state name is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VisualSlot {
    Base,
    CornerNE,
    CornerNW,
    CornerSW,
    CornerSE,
}

/// Derived visual state for one object: slot state names plus edge
/// visibility. Purely an in-process, per-tick value; never serialized.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VisualDescriptor {
    states: SmallVec<[(VisualSlot, String); 4]>,
    edges: CardinalDirs,
}

impl VisualDescriptor {
    fn push_state(&mut self, slot: VisualSlot, state: String) {
        self.states.push((slot, state));
    }

    fn set_edges(&mut self, edges: CardinalDirs) {
        self.edges = edges;
    }

    /// State name assigned to the given slot, if any.
    #[must_use]
    pub fn state(&self, slot: VisualSlot) -> Option<&str> {
        self.states
            .iter()
            .find(|(s, _)| *s == slot)
            .map(|(_, name)| name.as_str())
    }

    /// All slot → state-name assignments.
    #[must_use]
    pub fn states(&self) -> &[(VisualSlot, String)] {
        &self.states
    }

    /// Edge-visibility set: a set bit means the edge in that direction shows.
    #[must_use]
    pub const fn edges(&self) -> CardinalDirs {
        self.edges
    }
}

/// Result of resolving an object's spatial placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Locked to a tile on a grid.
    Anchored { grid: GridId, tile: TileCoord },
    /// In the world but not tile-locked.
    Unanchored,
    /// No spatial placement at all (left the simulated region).
    OutOfWorld,
}

/// Read-only spatial collaborator resolving placements and tile occupancy.
pub trait GridView {
    /// Resolve the object's current placement.
    fn placement_of(&self, id: ObjectId) -> Placement;

    /// Continuous facing angle of the object.
    fn facing_of(&self, id: ObjectId) -> Facing;

    /// Whether the grid handle currently resolves.
    fn grid_exists(&self, grid: GridId) -> bool;

    /// Visit every object anchored at the given tile.
    fn for_each_anchored(&self, grid: GridId, tile: TileCoord, visit: &mut dyn FnMut(ObjectId));
}

/// Presentation collaborator receiving freshly derived descriptors.
pub trait PresentationSink {
    /// Whether the object has a slot able to receive visual states.
    fn has_descriptor_slot(&self, id: ObjectId) -> bool;

    /// Push a freshly computed descriptor for the object.
    fn apply(&mut self, id: ObjectId, descriptor: &VisualDescriptor);
}

/// Registration-time parameters for a smoothing member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmoothProfile {
    /// Objects with equal tags smooth together; `None` opts out of grouping
    /// entirely and matches nothing, itself included.
    pub group_tag: Option<String>,
    pub mode: SmoothMode,
    /// Prefix applied to every emitted state name.
    pub base_state: String,
    pub enabled: bool,
    /// Whether the object carries the supplementary edge visual layer.
    pub edge_layer: bool,
}

impl Default for SmoothProfile {
    fn default() -> Self {
        Self {
            group_tag: None,
            mode: SmoothMode::default(),
            base_state: String::new(),
            enabled: true,
            edge_layer: false,
        }
    }
}

/// Per-object membership state tracked by the engine.
#[derive(Debug, Clone)]
pub struct MembershipRecord {
    group_tag: Option<String>,
    mode: SmoothMode,
    enabled: bool,
    running: bool,
    edge_layer: bool,
    base_state: String,
    last_position: Option<(GridId, TileCoord)>,
    update_generation: u64,
    descriptor: VisualDescriptor,
}

impl MembershipRecord {
    fn new(profile: SmoothProfile) -> Self {
        Self {
            group_tag: profile.group_tag,
            mode: profile.mode,
            enabled: profile.enabled,
            running: true,
            edge_layer: profile.edge_layer,
            base_state: profile.base_state,
            last_position: None,
            update_generation: 0,
            descriptor: VisualDescriptor::default(),
        }
    }

    #[must_use]
    pub fn group_tag(&self) -> Option<&str> {
        self.group_tag.as_deref()
    }

    #[must_use]
    pub const fn mode(&self) -> SmoothMode {
        self.mode
    }

    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub const fn running(&self) -> bool {
        self.running
    }

    #[must_use]
    pub const fn edge_layer(&self) -> bool {
        self.edge_layer
    }

    #[must_use]
    pub fn base_state(&self) -> &str {
        &self.base_state
    }

    /// Tile the object last occupied, kept valid across unanchoring so
    /// propagation can still reach the old neighborhood.
    #[must_use]
    pub const fn last_position(&self) -> Option<(GridId, TileCoord)> {
        self.last_position
    }

    /// Generation stamp of the most recent recompute.
    #[must_use]
    pub const fn update_generation(&self) -> u64 {
        self.update_generation
    }

    /// Most recently emitted descriptor.
    #[must_use]
    pub const fn descriptor(&self) -> &VisualDescriptor {
        &self.descriptor
    }
}

/// Tunable parameters for the smoothing engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmoothingConfig {
    /// Initial capacity reserved for the two work queues.
    pub queue_capacity: usize,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self { queue_capacity: 64 }
    }
}

/// Summary of one engine tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Generation counter after the tick.
    pub generation: u64,
    /// Anchor-change entries that resolved to a dirty pass.
    pub anchor_updates: usize,
    /// Objects whose descriptor was recomputed and emitted.
    pub recomputed: usize,
    /// Members dropped because their presentation counterpart was missing.
    pub deregistered: Vec<ObjectId>,
}

/// The smoothing engine: membership records, dirty queues, and the per-tick
/// recompute pipeline.
///
/// Single-threaded by design. The queues are owned exclusively by the engine
/// and mutated only by the enqueue entry points and [`SmoothingEngine::tick`],
/// all called from the host's simulation thread.
#[derive(Debug)]
pub struct SmoothingEngine {
    config: SmoothingConfig,
    records: SlotMap<ObjectId, MembershipRecord>,
    anchor_queue: VecDeque<ObjectId>,
    dirty_queue: VecDeque<ObjectId>,
    generation: u64,
}

impl SmoothingEngine {
    #[must_use]
    pub fn new(config: SmoothingConfig) -> Self {
        let capacity = config.queue_capacity;
        Self {
            config,
            records: SlotMap::with_key(),
            anchor_queue: VecDeque::with_capacity(capacity),
            dirty_queue: VecDeque::with_capacity(capacity),
            generation: 0,
        }
    }

    #[must_use]
    pub fn config(&self) -> &SmoothingConfig {
        &self.config
    }

    /// Current generation counter. Record stamps never exceed it.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of registered members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: ObjectId) -> bool {
        self.records.contains_key(id)
    }

    /// Borrow a member's record.
    #[must_use]
    pub fn record(&self, id: ObjectId) -> Option<&MembershipRecord> {
        self.records.get(id)
    }

    /// Most recently emitted descriptor for a member.
    #[must_use]
    pub fn descriptor(&self, id: ObjectId) -> Option<&VisualDescriptor> {
        self.records.get(id).map(MembershipRecord::descriptor)
    }

    /// Iterate over all members.
    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &MembershipRecord)> {
        self.records.iter()
    }

    /// Recompute entries waiting for the next tick.
    #[must_use]
    pub fn queued_recomputes(&self) -> usize {
        self.dirty_queue.len()
    }

    /// Anchor-change entries waiting for the next tick.
    #[must_use]
    pub fn queued_anchor_updates(&self) -> usize {
        self.anchor_queue.len()
    }

    /// Register a new smoothing member.
    ///
    /// The initial placement is resolved through the anchor-change queue on
    /// the next tick, once the host has had the chance to anchor the handle.
    pub fn register(&mut self, profile: SmoothProfile) -> ObjectId {
        let id = self.records.insert(MembershipRecord::new(profile));
        self.anchor_queue.push_back(id);
        id
    }

    /// Remove a member, dirtying its last known neighborhood one final time.
    pub fn deregister(&mut self, id: ObjectId, view: &dyn GridView) -> bool {
        let Some(record) = self.records.remove(id) else {
            return false;
        };
        let position = match view.placement_of(id) {
            Placement::Anchored { grid, tile } => Some((grid, tile)),
            Placement::Unanchored | Placement::OutOfWorld => record.last_position,
        };
        if let Some((grid, tile)) = position
            && view.grid_exists(grid)
        {
            self.dirty_around(grid, tile, record.mode, view);
        }
        true
    }

    /// Queue the object and its neighborhood for recompute after an external
    /// membership change.
    pub fn mark_dirty(&mut self, id: ObjectId, view: &dyn GridView) -> bool {
        if !self.records.contains_key(id) {
            return false;
        }
        self.dirty_neighbours(id, view);
        true
    }

    /// Queue only the object itself, leaving its neighbors alone.
    pub fn force_refresh(&mut self, id: ObjectId) -> bool {
        if !self.records.contains_key(id) {
            return false;
        }
        self.dirty_queue.push_back(id);
        true
    }

    /// Record an anchor-state change. Detaching objects are ignored; their
    /// teardown path dirties the neighborhood via [`SmoothingEngine::deregister`].
    pub fn on_anchor_changed(&mut self, id: ObjectId, detaching: bool) {
        if detaching || !self.records.contains_key(id) {
            return;
        }
        self.anchor_queue.push_back(id);
    }

    /// Toggle whether the object participates in matching and recompute.
    /// Neighbors are re-dirtied either way.
    pub fn set_enabled(&mut self, id: ObjectId, enabled: bool, view: &dyn GridView) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        if record.enabled == enabled {
            return true;
        }
        record.enabled = enabled;
        self.dirty_neighbours(id, view);
        true
    }

    /// Change the smoothing mode, re-dirtying the (possibly wider) neighborhood.
    pub fn set_mode(&mut self, id: ObjectId, mode: SmoothMode, view: &dyn GridView) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        if record.mode == mode {
            return true;
        }
        record.mode = mode;
        self.dirty_neighbours(id, view);
        true
    }

    /// Change the group tag, re-dirtying the old-and-new neighborhood.
    pub fn set_group_tag(
        &mut self,
        id: ObjectId,
        group_tag: Option<String>,
        view: &dyn GridView,
    ) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        if record.group_tag == group_tag {
            return true;
        }
        record.group_tag = group_tag;
        self.dirty_neighbours(id, view);
        true
    }

    /// Change the state-name prefix. Only the object itself needs a refresh;
    /// neighbor matching is tag-based, not name-based.
    pub fn set_base_state(&mut self, id: ObjectId, base_state: String) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        if record.base_state != base_state {
            record.base_state = base_state;
            self.dirty_queue.push_back(id);
        }
        true
    }

    /// Flip the running flag. Hosts stage teardown by clearing it so queued
    /// recomputes skip the object while its neighbors settle.
    pub fn set_running(&mut self, id: ObjectId, running: bool) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        record.running = running;
        true
    }

    /// Run one update step: drain the anchor-change queue, then recompute
    /// every queued member at most once under a freshly bumped generation.
    ///
    /// Failures are contained per object; a member without a presentation
    /// slot is dropped and reported, and the drain continues.
    pub fn tick(&mut self, view: &dyn GridView, sink: &mut dyn PresentationSink) -> TickReport {
        let mut report = TickReport::default();

        // Anchoring changes the tile used for neighbor lookups, so they must
        // settle before any recompute runs.
        while let Some(id) = self.anchor_queue.pop_front() {
            if !self.records.contains_key(id) {
                continue;
            }
            if matches!(view.placement_of(id), Placement::OutOfWorld) {
                // Left the simulated region; other cleanup paths own it now.
                continue;
            }
            self.dirty_neighbours(id, view);
            report.anchor_updates += 1;
        }

        if !self.dirty_queue.is_empty() {
            self.generation += 1;
            while let Some(id) = self.dirty_queue.pop_front() {
                match self.recompute(id, view, sink) {
                    Ok(emitted) => {
                        if emitted {
                            report.recomputed += 1;
                        }
                    }
                    Err(err @ SmoothingError::MissingPresentationCounterpart(_)) => {
                        error!(object = ?id, %err, "dropping smoothing member");
                        self.records.remove(id);
                        report.deregistered.push(id);
                    }
                    Err(err) => {
                        error!(object = ?id, %err, "recompute skipped");
                    }
                }
            }
        }

        report.generation = self.generation;
        report
    }

    /// Enqueue the object and every smoothing member anchored around it.
    fn dirty_neighbours(&mut self, id: ObjectId, view: &dyn GridView) {
        self.dirty_queue.push_back(id);
        let Some(record) = self.records.get(id) else {
            return;
        };
        let mode = record.mode;
        let position = match view.placement_of(id) {
            Placement::Anchored { grid, tile } => Some((grid, tile)),
            // Fall back to the tile the object last occupied.
            Placement::Unanchored | Placement::OutOfWorld => record.last_position,
        };
        let Some((grid, tile)) = position else {
            return;
        };
        if !view.grid_exists(grid) {
            return;
        }
        self.dirty_around(grid, tile, mode, view);
    }

    /// Enqueue every member anchored on the tiles around `tile`, tag-blind:
    /// generation dedup keeps the extra recomputes cheap.
    fn dirty_around(&mut self, grid: GridId, tile: TileCoord, mode: SmoothMode, view: &dyn GridView) {
        let mut offsets: SmallVec<[Direction; 8]> = SmallVec::from_slice(&Direction::CARDINAL);
        if matches!(
            mode,
            SmoothMode::Corners | SmoothMode::NoSprite | SmoothMode::Diagonal
        ) {
            offsets.extend_from_slice(&Direction::DIAGONAL);
        }
        let records = &self.records;
        let queue = &mut self.dirty_queue;
        for dir in offsets {
            view.for_each_anchored(grid, tile.step(dir), &mut |other| {
                if records.contains_key(other) {
                    queue.push_back(other);
                }
            });
        }
    }

    /// True when any member anchored at `tile` smooths with `subject`.
    fn matching_at(
        &self,
        subject: ObjectId,
        grid: GridId,
        tile: TileCoord,
        view: &dyn GridView,
    ) -> bool {
        let Some(tag) = self.records.get(subject).and_then(|r| r.group_tag.as_deref()) else {
            // Untagged members never pair up, not even with themselves.
            return false;
        };
        let records = &self.records;
        let mut found = false;
        view.for_each_anchored(grid, tile, &mut |other| {
            if found {
                return;
            }
            if let Some(other_record) = records.get(other)
                && other_record.enabled
                && other_record.group_tag.as_deref() == Some(tag)
            {
                found = true;
            }
        });
        found
    }

    /// Cardinal connection mask for the object at `tile`.
    fn cardinal_matches(
        &self,
        subject: ObjectId,
        grid: GridId,
        tile: TileCoord,
        view: &dyn GridView,
    ) -> CardinalDirs {
        let mut dirs = CardinalDirs::NONE;
        if self.matching_at(subject, grid, tile.step(Direction::North), view) {
            dirs |= CardinalDirs::NORTH;
        }
        if self.matching_at(subject, grid, tile.step(Direction::South), view) {
            dirs |= CardinalDirs::SOUTH;
        }
        if self.matching_at(subject, grid, tile.step(Direction::East), view) {
            dirs |= CardinalDirs::EAST;
        }
        if self.matching_at(subject, grid, tile.step(Direction::West), view) {
            dirs |= CardinalDirs::WEST;
        }
        dirs
    }

    /// Match booleans for all eight compass directions.
    fn gather_matches(
        &self,
        subject: ObjectId,
        grid: GridId,
        tile: TileCoord,
        view: &dyn GridView,
    ) -> NeighborMatches {
        let mut matches = NeighborMatches::default();
        for dir in Direction::ALL {
            let hit = self.matching_at(subject, grid, tile.step(dir), view);
            matches.set(dir, hit);
        }
        matches
    }

    /// Whether all three facing-rotated diagonal probes match.
    fn diagonal_connected(
        &self,
        subject: ObjectId,
        grid: GridId,
        tile: TileCoord,
        facing: Facing,
        view: &dyn GridView,
    ) -> bool {
        const PROBES: [(i32, i32); 3] = [(1, 0), (1, -1), (0, -1)];
        PROBES.iter().all(|&(dx, dy)| {
            let (rx, ry) = facing.rotate_offset(dx, dy);
            self.matching_at(subject, grid, tile.translated(rx, ry), view)
        })
    }

    /// Recompute one member's descriptor. Returns whether a descriptor was
    /// emitted; queue-level errors bubble up for per-object handling.
    fn recompute(
        &mut self,
        id: ObjectId,
        view: &dyn GridView,
        sink: &mut dyn PresentationSink,
    ) -> Result<bool, SmoothingError> {
        let Some(record) = self.records.get(id) else {
            // Deregistered while queued.
            return Ok(false);
        };
        if record.update_generation == self.generation || !record.running {
            return Ok(false);
        }
        let mode = record.mode;
        let main_pass = record.enabled && mode != SmoothMode::NoSprite;
        // Edge visibility tracks cardinal connections independently of the
        // main mode's skip logic, as long as the object is enabled.
        let edge_pass = record.enabled && record.edge_layer;
        if !main_pass && !edge_pass {
            self.records[id].update_generation = self.generation;
            return Ok(false);
        }

        if !sink.has_descriptor_slot(id) {
            return Err(SmoothingError::MissingPresentationCounterpart(id));
        }

        let anchored = match view.placement_of(id) {
            Placement::Anchored { grid, tile } => {
                if !view.grid_exists(grid) {
                    self.records[id].update_generation = self.generation;
                    return Err(SmoothingError::MissingGrid(grid));
                }
                Some((grid, tile))
            }
            Placement::Unanchored | Placement::OutOfWorld => None,
        };
        let base = self.records[id].base_state.clone();
        let facing = view.facing_of(id);

        let mut descriptor = VisualDescriptor::default();
        let mut edges = CardinalDirs::ALL;

        if main_pass {
            match mode {
                SmoothMode::CardinalFlags => {
                    let dirs = anchored.map_or(CardinalDirs::NONE, |(grid, tile)| {
                        self.cardinal_matches(id, grid, tile, view)
                    });
                    descriptor.push_state(VisualSlot::Base, format!("{base}{}", dirs.bits()));
                    edges = dirs.complement();
                }
                SmoothMode::Corners => {
                    let matches = anchored.map_or_else(NeighborMatches::default, |(grid, tile)| {
                        self.gather_matches(id, grid, tile, view)
                    });
                    let corners = corner_fill(matches).remap(facing.snap_cardinal());
                    descriptor.push_state(VisualSlot::CornerNE, format!("{base}{}", corners.ne.bits()));
                    descriptor.push_state(VisualSlot::CornerSE, format!("{base}{}", corners.se.bits()));
                    descriptor.push_state(VisualSlot::CornerSW, format!("{base}{}", corners.sw.bits()));
                    descriptor.push_state(VisualSlot::CornerNW, format!("{base}{}", corners.nw.bits()));
                    edges = corner_edges(corners);
                }
                SmoothMode::Diagonal => {
                    let connected = anchored.is_some_and(|(grid, tile)| {
                        self.diagonal_connected(id, grid, tile, facing, view)
                    });
                    descriptor.push_state(VisualSlot::Base, format!("{base}{}", u8::from(connected)));
                    if edge_pass {
                        let dirs = anchored.map_or(CardinalDirs::NONE, |(grid, tile)| {
                            self.cardinal_matches(id, grid, tile, view)
                        });
                        edges = dirs.complement();
                    }
                }
                // Filtered out by main_pass; contributes to neighbors only.
                SmoothMode::NoSprite => {}
            }
        } else {
            // Edge overlay still tracks connections while the main layers sit out.
            let dirs = anchored.map_or(CardinalDirs::NONE, |(grid, tile)| {
                self.cardinal_matches(id, grid, tile, view)
            });
            edges = dirs.complement();
        }
        descriptor.set_edges(edges);

        let record = &mut self.records[id];
        record.update_generation = self.generation;
        if anchored.is_some() {
            record.last_position = anchored;
        }
        record.descriptor = descriptor;
        sink.apply(id, &self.records[id].descriptor);
        Ok(true)
    }
}

impl Default for SmoothingEngine {
    fn default() -> Self {
        Self::new(SmoothingConfig::default())
    }
}
