//! Core types for the patchfield workspace: an infinite, procedurally
//! generated 2D world materialized lazily in fixed-size square patches.
//!
//! The world is an integer lattice carved into `n × n` tiles. A patch is
//! created the first time anything references it, and its contents are drawn
//! by an external Gibbs sampler conditioned on the surrounding patches. Once
//! a client has observed a patch through [`Map::get_fixed_neighborhood`], the
//! patch is *fixed*: its items can never be resampled, so repeated queries
//! stay causally consistent. Unobserved neighbors stay resamplable so future
//! queries further out still have boundary state to condition on.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::num::ParseIntError;

use patchfield_index::{OpenTable, SlotKey};
use rand::RngCore;
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{trace, warn};

/// Multiplier of the minstd linear-congruential generator.
const MINSTD_MULTIPLIER: u64 = 48_271;
/// Modulus of the minstd generator (the Mersenne prime 2^31 − 1).
const MINSTD_MODULUS: u64 = 2_147_483_647;

/// Errors raised when parsing a persisted PRNG state.
#[derive(Debug, Error)]
pub enum RngStateError {
    #[error("prng state is not a decimal integer: {0}")]
    NotANumber(#[from] ParseIntError),
    #[error("prng state {0} is outside [1, 2147483646]")]
    OutOfRange(u64),
}

/// Minimal-standard linear-congruential generator
/// (`x ← 48271 · x mod 2^31 − 1`).
///
/// The world's entire stochastic behavior flows through one of these, and its
/// state round-trips through snapshots as a decimal string, so the generator
/// family is part of the on-disk contract and must not be swapped out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinstdRng {
    state: u32,
}

impl MinstdRng {
    /// Creates a generator from a seed. A seed congruent to 0 maps to state 1
    /// (state 0 is a fixed point of the recurrence).
    #[must_use]
    pub fn new(seed: u64) -> Self {
        let state = seed % MINSTD_MODULUS;
        Self {
            state: if state == 0 { 1 } else { state as u32 },
        }
    }

    /// Resets the generator as if freshly constructed from `seed`.
    pub fn reseed(&mut self, seed: u64) {
        *self = Self::new(seed);
    }

    /// Current state in the textual form used by snapshots.
    #[must_use]
    pub fn state_string(&self) -> String {
        self.state.to_string()
    }

    /// Restores a generator from its textual state.
    pub fn from_state_string(state: &str) -> Result<Self, RngStateError> {
        let value: u64 = state.trim().parse()?;
        if value == 0 || value >= MINSTD_MODULUS {
            return Err(RngStateError::OutOfRange(value));
        }
        Ok(Self {
            state: value as u32,
        })
    }

    #[inline]
    fn advance(&mut self) -> u32 {
        self.state = (u64::from(self.state) * MINSTD_MULTIPLIER % MINSTD_MODULUS) as u32;
        self.state
    }
}

impl RngCore for MinstdRng {
    fn next_u32(&mut self) -> u32 {
        self.advance()
    }

    fn next_u64(&mut self) -> u64 {
        let low = u64::from(self.advance());
        let high = u64::from(self.advance());
        low | (high << 32)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(4) {
            let word = self.advance().to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }
}

/// A point on the integer lattice, in world or patch coordinates.
///
/// The coordinate pair `(i64::MIN, i64::MIN)` is reserved as the vacant-slot
/// sentinel of the patch table and must never name a real patch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Position {
    pub x: i64,
    pub y: i64,
}

impl Position {
    /// Construct a new position.
    #[must_use]
    pub const fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }

    /// Unit step along +y.
    #[must_use]
    pub const fn up(self) -> Self {
        Self::new(self.x, self.y + 1)
    }

    /// Unit step along −y.
    #[must_use]
    pub const fn down(self) -> Self {
        Self::new(self.x, self.y - 1)
    }

    /// Unit step along −x.
    #[must_use]
    pub const fn left(self) -> Self {
        Self::new(self.x - 1, self.y)
    }

    /// Unit step along +x.
    #[must_use]
    pub const fn right(self) -> Self {
        Self::new(self.x + 1, self.y)
    }

    /// The position itself plus its eight neighbors, including diagonals.
    #[must_use]
    pub const fn halo(self) -> [Self; 9] {
        [
            self.up().left(),
            self.up(),
            self.up().right(),
            self.left(),
            self,
            self.right(),
            self.down().left(),
            self.down(),
            self.down().right(),
        ]
    }
}

impl SlotKey for Position {
    const EMPTY: Self = Position {
        x: i64::MIN,
        y: i64::MIN,
    };

    fn slot_hash(&self) -> u64 {
        let mut hasher = FxHasher::default();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// A point entity living somewhere on the world lattice.
///
/// Timestamps are opaque to the map: a `creation_time` of 0 means the item
/// has always existed, a `deletion_time` of 0 means it was never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Item {
    pub item_type: u32,
    pub location: Position,
    pub creation_time: u64,
    pub deletion_time: u64,
}

impl Item {
    /// Construct a new item record.
    #[must_use]
    pub const fn new(
        item_type: u32,
        location: Position,
        creation_time: u64,
        deletion_time: u64,
    ) -> Self {
        Self {
            item_type,
            location,
            creation_time,
            deletion_time,
        }
    }
}

/// One `n × n` tile of the world: the unit of materialization and sampling.
///
/// `D` is an opaque per-patch payload owned by the embedder; the map only
/// moves it, serializes it through a caller-supplied codec, and drops it.
#[derive(Debug, Clone)]
pub struct Patch<D> {
    items: Vec<Item>,
    fixed: bool,
    data: D,
}

impl<D> Patch<D> {
    fn new(data: D) -> Self {
        Self {
            items: Vec::with_capacity(8),
            fixed: false,
            data,
        }
    }

    /// Reassembles a patch from persisted parts.
    #[must_use]
    pub fn from_parts(fixed: bool, items: Vec<Item>, data: D) -> Self {
        Self {
            items,
            fixed,
            data,
        }
    }

    /// Items currently stored in this patch.
    #[must_use]
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// Mutable access to the item list.
    ///
    /// The sampler uses this on resamplable patches; embedders may also touch
    /// item timestamps on fixed patches. The map itself never mutates a fixed
    /// patch's items.
    #[must_use]
    pub fn items_mut(&mut self) -> &mut Vec<Item> {
        &mut self.items
    }

    /// Whether this patch is frozen against future sampling.
    #[must_use]
    pub fn fixed(&self) -> bool {
        self.fixed
    }

    /// Borrow the embedder payload.
    #[must_use]
    pub fn data(&self) -> &D {
        &self.data
    }

    /// Mutably borrow the embedder payload.
    #[must_use]
    pub fn data_mut(&mut self) -> &mut D {
        &mut self.data
    }
}

/// Errors that can occur when constructing or restoring a world map.
#[derive(Debug, Error)]
pub enum MapError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// A snapshot named the same patch position twice.
    #[error("duplicate patch at {0:?} in snapshot")]
    DuplicatePatch(Position),
    /// A snapshot used the reserved sentinel coordinate as a patch position.
    #[error("reserved sentinel coordinate used as a patch position")]
    ReservedPosition,
    /// A snapshot placed an item outside the tile of its owning patch.
    #[error("item at {item:?} lies outside patch {patch:?}")]
    ItemOutsidePatch { patch: Position, item: Position },
}

/// Static configuration for a world map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapConfig {
    /// Patch edge length in lattice units. Must be even and at least 2; the
    /// sampling window decomposes patches into four equal quadrants.
    pub patch_size: u32,
    /// Number of full sweeps the Gibbs field runs each time patches are fixed.
    pub gibbs_iterations: u32,
    /// Optional RNG seed for reproducible worlds.
    pub rng_seed: Option<u64>,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            patch_size: 32,
            gibbs_iterations: 10,
            rng_seed: None,
        }
    }
}

impl MapConfig {
    fn validate(&self) -> Result<(), MapError> {
        if self.patch_size < 2 {
            return Err(MapError::InvalidConfig("patch_size must be at least 2"));
        }
        if self.patch_size % 2 != 0 {
            return Err(MapError::InvalidConfig("patch_size must be even"));
        }
        Ok(())
    }

    /// Returns the configured RNG, seeding from entropy if no seed was given.
    fn seeded_rng(&self) -> MinstdRng {
        match self.rng_seed {
            Some(seed) => MinstdRng::new(seed),
            None => MinstdRng::new(rand::random()),
        }
    }
}

/// External Markov-random-field collaborator that resamples patch contents.
///
/// `positions` is the sorted, deduplicated batch of resamplable patches the
/// fixing protocol scheduled; every listed patch exists and is not fixed.
/// The field reads and writes patches through the [`FieldView`] and is
/// trusted not to disturb fixed patches.
pub trait GibbsField<D> {
    /// Runs one full sweep of local resampling over `positions`.
    fn sample<R: RngCore>(
        &mut self,
        view: &mut FieldView<'_, D>,
        positions: &[Position],
        rng: &mut R,
    );
}

/// Mutable window onto the patch table handed to the Gibbs field while the
/// fixing protocol runs.
///
/// Patches are addressed by position rather than by reference, so the field
/// may freely materialize new patches mid-sweep without invalidating
/// anything it has already visited.
pub struct FieldView<'a, D> {
    patches: &'a mut OpenTable<Position, Patch<D>>,
    n: u32,
}

impl<'a, D> FieldView<'a, D> {
    /// Patch edge length of the underlying world.
    #[must_use]
    pub fn n(&self) -> u32 {
        self.n
    }

    /// Non-mutating patch lookup.
    #[must_use]
    pub fn patch(&self, patch_position: Position) -> Option<&Patch<D>> {
        self.patches.get(&patch_position)
    }

    /// Mutable patch lookup.
    #[must_use]
    pub fn patch_mut(&mut self, patch_position: Position) -> Option<&mut Patch<D>> {
        self.patches.get_mut(&patch_position)
    }

    /// Looks up or creates the patch at `patch_position`. New patches start
    /// empty and resamplable.
    pub fn get_or_make_patch(&mut self, patch_position: Position) -> &mut Patch<D>
    where
        D: Default,
    {
        self.patches
            .get_or_insert_with(patch_position, || Patch::new(D::default()))
    }

    /// Visits `n²` randomized sampling targets inside the patch at `center`.
    ///
    /// Each iteration draws a quadrant, then an intra-quadrant cell, and
    /// invokes `visit` with the cell's intra-patch coordinates (in `[0, n)`)
    /// and the positions of the patches jointly in scope for that quadrant's
    /// local conditional: the center patch first, then its existing side and
    /// diagonal neighbors toward the quadrant. Exactly one quadrant is
    /// processed per iteration. The generator is lent back to the visitor so
    /// the local conditional draws from the same stream as the dispatch.
    pub fn iterate_neighborhoods<R, V>(&mut self, center: Position, rng: &mut R, mut visit: V)
    where
        R: RngCore,
        V: FnMut(&mut FieldView<'a, D>, &mut R, u32, u32, &[Position]),
    {
        let scopes = self.quadrant_scopes(center);
        let half = self.n / 2;
        for _ in 0..self.n * self.n {
            let quadrant = (rng.next_u32() % 4) as usize;
            let x = rng.next_u32() % half;
            let y = rng.next_u32() % half;
            let (cell_x, cell_y) = match quadrant {
                0 => (x, y),
                1 => (x, y + half),
                2 => (x + half, y),
                _ => (x + half, y + half),
            };
            visit(self, rng, cell_x, cell_y, &scopes[quadrant]);
        }
    }

    /// Scope lists for the bottom-left, top-left, bottom-right, and top-right
    /// quadrants: center first, then whichever of the relevant side and
    /// diagonal neighbors already exist.
    fn quadrant_scopes(&self, center: Position) -> [Vec<Position>; 4] {
        let mut bottom_left = vec![center];
        let mut top_left = vec![center];
        let mut bottom_right = vec![center];
        let mut top_right = vec![center];

        if self.patches.contains_key(&center.left()) {
            bottom_left.push(center.left());
            top_left.push(center.left());
        }
        if self.patches.contains_key(&center.right()) {
            bottom_right.push(center.right());
            top_right.push(center.right());
        }
        if self.patches.contains_key(&center.up()) {
            top_left.push(center.up());
            top_right.push(center.up());
        }
        if self.patches.contains_key(&center.down()) {
            bottom_left.push(center.down());
            bottom_right.push(center.down());
        }
        if self.patches.contains_key(&center.down().left()) {
            bottom_left.push(center.down().left());
        }
        if self.patches.contains_key(&center.up().left()) {
            top_left.push(center.up().left());
        }
        if self.patches.contains_key(&center.down().right()) {
            bottom_right.push(center.down().right());
        }
        if self.patches.contains_key(&center.up().right()) {
            top_right.push(center.up().right());
        }

        [bottom_left, top_left, bottom_right, top_right]
    }
}

/// The four patches covering a sampling window, frozen for the caller.
#[derive(Debug)]
pub struct FixedNeighborhood<'a, D> {
    /// The window patches in row-major order from the anchor.
    pub patches: [&'a Patch<D>; 4],
    /// Patch coordinates matching `patches`.
    pub positions: [Position; 4],
    /// Index of the patch containing the queried world position.
    pub query_index: usize,
}

/// The already-existing patches among a window's four target positions.
#[derive(Debug)]
pub struct WindowPatches<'a, D> {
    /// Existing patches with their positions, in window row-major order.
    pub patches: Vec<(Position, &'a Patch<D>)>,
    /// Index into `patches` of the patch containing the queried world
    /// position, if that patch exists.
    pub query_index: Option<usize>,
}

/// The patch-indexed world map.
///
/// `D` is the embedder's per-patch payload; `F` is the Gibbs field that
/// resamples patch contents, owned by the map together with whatever caches
/// it carries.
pub struct Map<D, F> {
    patches: OpenTable<Position, Patch<D>>,
    n: u32,
    gibbs_iterations: u32,
    rng: MinstdRng,
    field: F,
}

impl<D, F> fmt::Debug for Map<D, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Map")
            .field("n", &self.n)
            .field("gibbs_iterations", &self.gibbs_iterations)
            .field("patch_count", &self.patches.len())
            .finish()
    }
}

impl<D, F> Map<D, F> {
    /// Patch edge length in lattice units.
    #[must_use]
    pub fn patch_size(&self) -> u32 {
        self.n
    }

    /// Number of Gibbs sweeps run per fixing batch.
    #[must_use]
    pub fn gibbs_iterations(&self) -> u32 {
        self.gibbs_iterations
    }

    /// Number of materialized patches.
    #[must_use]
    pub fn patch_count(&self) -> usize {
        self.patches.len()
    }

    /// Borrow the map's random number generator.
    #[must_use]
    pub fn rng(&self) -> &MinstdRng {
        &self.rng
    }

    /// Reseeds the map's random number generator.
    pub fn reseed(&mut self, seed: u64) {
        self.rng.reseed(seed);
    }

    /// Borrow the Gibbs field.
    #[must_use]
    pub fn field(&self) -> &F {
        &self.field
    }

    /// Mutably borrow the Gibbs field.
    #[must_use]
    pub fn field_mut(&mut self) -> &mut F {
        &mut self.field
    }

    /// Iterates all materialized patches with their positions.
    pub fn patches(&self) -> impl Iterator<Item = (Position, &Patch<D>)> {
        self.patches.iter().map(|(position, patch)| (*position, patch))
    }

    /// Non-mutating patch lookup.
    #[must_use]
    pub fn get_patch_if_exists(&self, patch_position: Position) -> Option<&Patch<D>> {
        self.patches.get(&patch_position)
    }

    /// Lookup for callers who know the patch is present.
    ///
    /// # Panics
    ///
    /// Panics if no patch exists at `patch_position`.
    #[must_use]
    pub fn get_existing_patch(&self, patch_position: Position) -> &Patch<D> {
        match self.patches.get(&patch_position) {
            Some(patch) => patch,
            None => {
                warn!(?patch_position, "requested patch does not exist");
                panic!("no patch at {patch_position:?}");
            }
        }
    }

    /// Mutable lookup for callers who know the patch is present.
    ///
    /// # Panics
    ///
    /// Panics if no patch exists at `patch_position`.
    #[must_use]
    pub fn get_existing_patch_mut(&mut self, patch_position: Position) -> &mut Patch<D> {
        match self.patches.get_mut(&patch_position) {
            Some(patch) => patch,
            None => {
                warn!(?patch_position, "requested patch does not exist");
                panic!("no patch at {patch_position:?}");
            }
        }
    }

    /// Maps a world position to the coordinate of its containing patch,
    /// flooring toward negative infinity.
    #[must_use]
    pub fn world_to_patch_coordinates(&self, world_position: Position) -> Position {
        let n = i64::from(self.n);
        Position::new(world_position.x.div_euclid(n), world_position.y.div_euclid(n))
    }

    /// Maps a world position to its containing patch plus the offset within
    /// that patch's tile; both offset components are in `[0, n)`.
    #[must_use]
    pub fn world_to_patch_with_offset(&self, world_position: Position) -> (Position, Position) {
        let n = i64::from(self.n);
        (
            Position::new(world_position.x.div_euclid(n), world_position.y.div_euclid(n)),
            Position::new(world_position.x.rem_euclid(n), world_position.y.rem_euclid(n)),
        )
    }

    /// Positions of the four patches whose union covers the `n × n` box
    /// centered at `world_position`, in row-major order from the anchor, and
    /// the index of the patch containing `world_position`.
    ///
    /// The anchor is chosen by the quadrant of the position within its patch
    /// so the 2×2 block always brackets the box.
    #[must_use]
    pub fn neighborhood_positions(&self, world_position: Position) -> ([Position; 4], usize) {
        let (patch_position, within) = self.world_to_patch_with_offset(world_position);
        let half = i64::from(self.n / 2);
        let (anchor, query_index) = if within.x < half {
            if within.y < half {
                (patch_position.left(), 1)
            } else {
                (patch_position.left().up(), 3)
            }
        } else if within.y < half {
            (patch_position, 0)
        } else {
            (patch_position.up(), 2)
        };
        (
            [anchor, anchor.right(), anchor.down(), anchor.down().right()],
            query_index,
        )
    }

    /// Read-only companion to [`Map::get_fixed_neighborhood`]: returns the
    /// currently-existing patches among the window's four target positions.
    /// Never creates and never fixes patches.
    #[must_use]
    pub fn get_neighborhood(&self, world_position: Position) -> WindowPatches<'_, D> {
        let (positions, query_index) = self.neighborhood_positions(world_position);
        let mut patches = Vec::with_capacity(4);
        let mut compact_index = None;
        for (index, &position) in positions.iter().enumerate() {
            if let Some(patch) = self.patches.get(&position) {
                if index == query_index {
                    compact_index = Some(patches.len());
                }
                patches.push((position, patch));
            }
        }
        WindowPatches {
            patches,
            query_index: compact_index,
        }
    }

    /// Visits every existing patch whose coordinates intersect the patch
    /// rectangle spanned by the two world corners (inclusive). Stops early
    /// and returns false as soon as `process_patch` does.
    pub fn get_state<P>(
        &self,
        bottom_left_corner: Position,
        top_right_corner: Position,
        mut process_patch: P,
    ) -> bool
    where
        P: FnMut(&Patch<D>, Position) -> bool,
    {
        let bottom_left = self.world_to_patch_coordinates(bottom_left_corner);
        let top_right = self.world_to_patch_coordinates(top_right_corner);
        for x in bottom_left.x..=top_right.x {
            for y in bottom_left.y..=top_right.y {
                let position = Position::new(x, y);
                if let Some(patch) = self.patches.get(&position) {
                    if !process_patch(patch, position) {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Appends every item whose location lies inside the world rectangle
    /// `[bottom_left_corner, top_right_corner]` (inclusive on all sides).
    pub fn get_items(
        &self,
        bottom_left_corner: Position,
        top_right_corner: Position,
        items: &mut Vec<Item>,
    ) {
        self.get_state(bottom_left_corner, top_right_corner, |patch, _| {
            items.extend(patch.items().iter().copied().filter(|item| {
                item.location.x >= bottom_left_corner.x
                    && item.location.x <= top_right_corner.x
                    && item.location.y >= bottom_left_corner.y
                    && item.location.y <= top_right_corner.y
            }));
            true
        });
    }

    /// Visits `n²` randomized sampling targets around the patch at
    /// `patch_position`, advancing the map's own generator. See
    /// [`FieldView::iterate_neighborhoods`].
    pub fn iterate_neighborhoods<V>(&mut self, patch_position: Position, visit: V)
    where
        V: FnMut(&mut FieldView<'_, D>, &mut MinstdRng, u32, u32, &[Position]),
    {
        let Self { patches, rng, n, .. } = self;
        let mut view = FieldView { patches, n: *n };
        view.iterate_neighborhoods(patch_position, rng, visit);
    }
}

impl<D: Default, F> Map<D, F> {
    /// Looks up or creates the patch at `patch_position`. New patches start
    /// empty and resamplable.
    pub fn get_or_make_patch(&mut self, patch_position: Position) -> &mut Patch<D> {
        self.patches
            .get_or_insert_with(patch_position, || Patch::new(D::default()))
    }
}

impl<D, F: GibbsField<D>> Map<D, F> {
    /// Creates an empty world from `config`, owning `field` and its caches.
    pub fn new(config: MapConfig, field: F) -> Result<Self, MapError> {
        config.validate()?;
        Ok(Self {
            patches: OpenTable::with_capacity(1024),
            n: config.patch_size,
            gibbs_iterations: config.gibbs_iterations,
            rng: config.seeded_rng(),
            field,
        })
    }

    /// Reassembles a world from snapshot parts. The field (and whatever
    /// caches it holds) is supplied fresh by the caller; it is not part of
    /// the snapshot.
    pub fn from_snapshot_parts(
        patch_size: u32,
        gibbs_iterations: u32,
        rng: MinstdRng,
        patches: Vec<(Position, Patch<D>)>,
        field: F,
    ) -> Result<Self, MapError> {
        MapConfig {
            patch_size,
            gibbs_iterations,
            rng_seed: None,
        }
        .validate()?;

        let n = i64::from(patch_size);
        let mut table = OpenTable::with_capacity(patches.len().max(1024));
        for (position, patch) in patches {
            if position == Position::EMPTY {
                return Err(MapError::ReservedPosition);
            }
            if table.contains_key(&position) {
                return Err(MapError::DuplicatePatch(position));
            }
            for item in patch.items() {
                let owner = Position::new(
                    item.location.x.div_euclid(n),
                    item.location.y.div_euclid(n),
                );
                if owner != position {
                    return Err(MapError::ItemOutsidePatch {
                        patch: position,
                        item: item.location,
                    });
                }
            }
            table.get_or_insert_with(position, move || patch);
        }

        Ok(Self {
            patches: table,
            n: patch_size,
            gibbs_iterations,
            rng,
            field,
        })
    }
}

impl<D: Default, F: GibbsField<D>> Map<D, F> {
    /// Returns the four patches covering the `n × n` box centered at
    /// `world_position`, creating any that are missing and guaranteeing all
    /// four are fixed on return.
    ///
    /// Fixing pulls in one halo of neighbors around every not-yet-fixed
    /// window patch, materializes the missing ones, and runs the Gibbs field
    /// over the whole resamplable set before flipping the window's fixed
    /// flags. Halo patches stay resamplable for future queries further out.
    pub fn get_fixed_neighborhood(&mut self, world_position: Position) -> FixedNeighborhood<'_, D> {
        let (positions, query_index) = self.neighborhood_positions(world_position);

        // Worst case the window plus its halo is a fresh 4×4 block; reserving
        // up front keeps the table stable across the whole batch of inserts.
        self.patches.reserve(16);
        for &position in &positions {
            self.patches
                .get_or_insert_with_reserved(position, || Patch::new(D::default()));
        }

        self.fix_patches(&positions);

        let patches = positions.map(|position| {
            self.patches
                .get(&position)
                .expect("window patches were just materialized")
        });
        FixedNeighborhood {
            patches,
            positions,
            query_index,
        }
    }

    /// Ensures every window patch ends up fixed without disturbing any patch
    /// that is already fixed.
    ///
    /// Assumes the window patches exist and the table has room for the halo
    /// (callers reserve before materializing the window).
    fn fix_patches(&mut self, window: &[Position; 4]) {
        let mut to_sample: Vec<Position> = Vec::with_capacity(36);
        for &position in window {
            let already_fixed = self
                .patches
                .get(&position)
                .is_some_and(|patch| patch.fixed);
            if already_fixed {
                continue;
            }
            to_sample.extend_from_slice(&position.halo());
            to_sample.sort_unstable();
            to_sample.dedup();
        }

        let mut index = 0;
        while index < to_sample.len() {
            let patch = self
                .patches
                .get_or_insert_with_reserved(to_sample[index], || Patch::new(D::default()));
            if patch.fixed {
                to_sample.remove(index);
            } else {
                index += 1;
            }
        }

        trace!(
            ?window,
            scheduled = to_sample.len(),
            sweeps = self.gibbs_iterations,
            "resampling neighborhood before fixing"
        );

        let Self {
            patches,
            rng,
            field,
            n,
            gibbs_iterations,
        } = self;
        let mut view = FieldView { patches, n: *n };
        for _ in 0..*gibbs_iterations {
            field.sample(&mut view, &to_sample, rng);
        }

        for &position in window {
            if let Some(patch) = self.patches.get_mut(&position) {
                patch.fixed = true;
            }
        }
    }
}
