//! # Stage Registry
//!
//! Generation runs as a single linear chain of stages:
//!
//! ```text
//! empty ─▶ biomes ─▶ noise ─▶ surface ─▶ carvers ─▶ features ─▶ light ─▶ spawn ─▶ full
//!  root                                           (range 1)   (range 1)        terminal
//! ```
//!
//! Each stage names one parent (its predecessor) and a `range`: every cell
//! within that Chebyshev radius must already be at the parent stage before
//! the stage may run on the center cell.
//!
//! The registry is an explicit object built once and shared by `Arc`.
//! Stage work is opaque: the scheduler only invokes it and awaits a result.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tessera_shared::Level;

use crate::cell::{Cell, HeightmapSet, NeighborWindow};
use crate::error::{RegistryError, StageResult};

/// Future returned by stage work.
pub type StageFuture<'a> = Pin<Box<dyn Future<Output = StageResult<Cell>> + Send + 'a>>;

/// Asynchronous work attached to a stage.
///
/// `generate` synthesizes the stage from scratch. `load` runs instead when
/// the cell store already holds data at or past the stage; by default it
/// adopts the persisted cell as-is.
pub trait StageWork: Send + Sync {
    /// Produces the center cell of `window` advanced to `window.target_stage()`.
    fn generate(&self, window: NeighborWindow) -> StageFuture<'_>;

    /// Re-attaches persisted data for `window.target_stage()`.
    fn load(&self, _window: NeighborWindow, persisted: Cell) -> StageFuture<'_> {
        Box::pin(async move { Ok(persisted) })
    }
}

/// Position of a stage in the chain. `0` is the root.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StageId(u32);

impl StageId {
    /// The root (initial, empty) stage.
    pub const ROOT: Self = Self(0);

    /// Creates a stage id from its chain index.
    #[inline]
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Chain index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Immutable description of one stage.
pub struct StageDescriptor {
    id: StageId,
    name: String,
    parent: StageId,
    range: u32,
    heightmaps_after: HeightmapSet,
    terminal: bool,
    schedules_lighting: bool,
    /// Radius (from a cell that must be terminal) at which this stage is still required.
    distance: u32,
    work: Option<Arc<dyn StageWork>>,
}

impl StageDescriptor {
    /// This stage's id.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> StageId {
        self.id
    }

    /// Human-readable name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Predecessor (self for the root).
    #[inline]
    #[must_use]
    pub const fn parent(&self) -> StageId {
        self.parent
    }

    /// Radius that must be at `parent` before this stage runs.
    #[inline]
    #[must_use]
    pub const fn range(&self) -> u32 {
        self.range
    }

    /// Heightmaps that must exist once this stage is done.
    #[inline]
    #[must_use]
    pub const fn heightmaps_after(&self) -> HeightmapSet {
        self.heightmaps_after
    }

    /// Whether this is the final, fully realized stage.
    #[inline]
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// Whether completing this stage hands the cell to the lighting hook.
    #[inline]
    #[must_use]
    pub const fn schedules_lighting(&self) -> bool {
        self.schedules_lighting
    }

    /// Accumulated dependency distance from a terminal cell.
    #[inline]
    #[must_use]
    pub const fn distance(&self) -> u32 {
        self.distance
    }

    /// The stage's work. `None` only for the root.
    #[must_use]
    pub fn work(&self) -> Option<&Arc<dyn StageWork>> {
        self.work.as_ref()
    }
}

impl fmt::Debug for StageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("range", &self.range)
            .field("terminal", &self.terminal)
            .finish_non_exhaustive()
    }
}

/// One stage handed to [`StageRegistryBuilder::stage`].
pub struct StageSpec {
    name: String,
    range: u32,
    heightmaps_after: HeightmapSet,
    schedules_lighting: bool,
    work: Arc<dyn StageWork>,
}

impl StageSpec {
    /// A stage with range 0 and no heightmap requirements.
    #[must_use]
    pub fn new(name: impl Into<String>, work: Arc<dyn StageWork>) -> Self {
        Self {
            name: name.into(),
            range: 0,
            heightmaps_after: HeightmapSet::EMPTY,
            schedules_lighting: false,
            work,
        }
    }

    /// Sets the neighbor range.
    #[must_use]
    pub const fn range(mut self, range: u32) -> Self {
        self.range = range;
        self
    }

    /// Sets the heightmaps that must exist afterwards.
    #[must_use]
    pub const fn heightmaps(mut self, heightmaps: HeightmapSet) -> Self {
        self.heightmaps_after = heightmaps;
        self
    }

    /// Marks the stage as handing off to the lighting hook.
    #[must_use]
    pub const fn lighting(mut self) -> Self {
        self.schedules_lighting = true;
        self
    }
}

/// Builds a [`StageRegistry`] root first.
pub struct StageRegistryBuilder {
    root: String,
    stages: Vec<StageSpec>,
}

impl StageRegistryBuilder {
    /// Appends the next stage of the chain.
    #[must_use]
    pub fn stage(mut self, spec: StageSpec) -> Self {
        self.stages.push(spec);
        self
    }

    /// Validates and freezes the chain. The last stage becomes terminal.
    ///
    /// # Errors
    ///
    /// Returns error if the chain has no stage after the root or if two
    /// stages share a name.
    pub fn build(self) -> Result<StageRegistry, RegistryError> {
        if self.stages.is_empty() {
            return Err(RegistryError::TooShort(1));
        }
        let mut seen = HashSet::new();
        seen.insert(self.root.clone());
        for spec in &self.stages {
            if !seen.insert(spec.name.clone()) {
                return Err(RegistryError::DuplicateName(spec.name.clone()));
            }
        }
        Ok(StageRegistry::assemble(self.root, self.stages))
    }
}

/// The ordered, immutable catalogue of stages.
pub struct StageRegistry {
    stages: Vec<StageDescriptor>,
}

impl StageRegistry {
    /// Starts a chain whose root is `root`.
    #[must_use]
    pub fn builder(root: impl Into<String>) -> StageRegistryBuilder {
        StageRegistryBuilder {
            root: root.into(),
            stages: Vec::new(),
        }
    }

    /// The standard terrain chain, every stage backed by `work`.
    #[must_use]
    pub fn standard(work: Arc<dyn StageWork>) -> Self {
        let spec = |name: &str| StageSpec::new(name, Arc::clone(&work));
        let stages = vec![
            spec("biomes"),
            spec("noise").heightmaps(HeightmapSet::WORLDGEN),
            spec("surface").heightmaps(HeightmapSet::WORLDGEN),
            spec("carvers").heightmaps(HeightmapSet::WORLDGEN),
            spec("features").range(1).heightmaps(HeightmapSet::FINAL),
            spec("light").range(1).heightmaps(HeightmapSet::FINAL).lighting(),
            spec("spawn").heightmaps(HeightmapSet::FINAL),
            spec("full").heightmaps(HeightmapSet::FINAL),
        ];
        Self::assemble("empty".to_string(), stages)
    }

    fn assemble(root: String, specs: Vec<StageSpec>) -> Self {
        let count = specs.len() + 1;
        let mut stages = Vec::with_capacity(count);
        stages.push(StageDescriptor {
            id: StageId::ROOT,
            name: root,
            parent: StageId::ROOT,
            range: 0,
            heightmaps_after: HeightmapSet::EMPTY,
            terminal: false,
            schedules_lighting: false,
            distance: 0,
            work: None,
        });
        for (i, spec) in specs.into_iter().enumerate() {
            let index = i as u32 + 1;
            stages.push(StageDescriptor {
                id: StageId::new(index),
                name: spec.name,
                parent: StageId::new(index - 1),
                range: spec.range,
                heightmaps_after: spec.heightmaps_after,
                terminal: index as usize == count - 1,
                schedules_lighting: spec.schedules_lighting,
                distance: 0,
                work: Some(spec.work),
            });
        }

        // distance(parent(S)) = distance(S) + range(S)
        for i in (1..count).rev() {
            stages[i - 1].distance = stages[i].distance + stages[i].range;
        }

        Self { stages }
    }

    /// Number of stages including the root. Never below two.
    #[inline]
    #[must_use]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// The root stage.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> StageId {
        StageId::ROOT
    }

    /// The terminal stage.
    #[inline]
    #[must_use]
    pub fn terminal(&self) -> StageId {
        StageId::new(self.stages.len() as u32 - 1)
    }

    /// Looks up a stage.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not belong to this registry.
    #[must_use]
    pub fn get(&self, id: StageId) -> &StageDescriptor {
        match self.stages.get(id.index() as usize) {
            Some(stage) => stage,
            None => panic!("stage {id} is not part of this registry"),
        }
    }

    /// Looks up a stage, returning `None` for foreign ids.
    #[must_use]
    pub fn try_get(&self, id: StageId) -> Option<&StageDescriptor> {
        self.stages.get(id.index() as usize)
    }

    /// Finds a stage by name.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<StageId> {
        self.stages.iter().find(|s| s.name == name).map(|s| s.id)
    }

    /// The stage whose parent is `id`, or `None` at the terminal.
    #[must_use]
    pub fn next(&self, id: StageId) -> Option<StageId> {
        let next = id.index() as usize + 1;
        (next < self.stages.len()).then(|| StageId::new(next as u32))
    }

    /// Iterates the chain root first.
    pub fn iter(&self) -> impl Iterator<Item = &StageDescriptor> {
        self.stages.iter()
    }

    /// Widest ring of cells that a terminal cell pulls in, over all stages.
    #[must_use]
    pub fn max_distance(&self) -> u32 {
        self.stages[0].distance
    }

    /// The stage a cell at `level` must reach.
    ///
    /// Levels at or below `full_level` require the terminal stage. A cell
    /// `d` levels beyond `full_level` requires the highest stage whose
    /// dependency distance still reaches `d`; past the root's distance
    /// nothing is required.
    #[must_use]
    pub fn stage_for_level(&self, level: Level, full_level: Level) -> Option<StageId> {
        if level <= full_level {
            return Some(self.terminal());
        }
        let d = u32::from(level - full_level);
        self.stages
            .iter()
            .rev()
            .find(|s| s.distance >= d)
            .map(|s| s.id)
    }
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.stages.iter()).finish()
    }
}
