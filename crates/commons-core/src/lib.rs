//! Core types and turn pipeline for the Commons population simulation.

use rand::seq::{SliceRandom, index};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use std::borrow::Cow;
use std::collections::{BTreeMap, VecDeque, btree_map::Entry};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

new_key_type! {
    /// Stable handle for people backed by a generational slot map.
    pub struct PersonId;
}

/// Discrete simulation time step.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub struct Turn(pub u64);

impl Turn {
    /// Turn zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// The following turn.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Errors raised while validating or querying configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A parameter name outside the registered set was requested.
    #[error("unknown parameter `{0}`")]
    UnknownParameter(String),
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Raised when a harvest requests more counters than the pool holds.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("harvest of {requested} resources exceeds pool size {available}")]
pub struct SamplingError {
    pub requested: usize,
    pub available: usize,
}

/// Errors raised while saving or restoring a snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding failure: {0}")]
    Encoding(#[from] serde_json::Error),
    /// A cross-person reference resolved to an identity missing from the
    /// registry. The load is aborted; no partial graph is returned.
    #[error("snapshot references unknown person {0:?}")]
    UnknownPerson(PersonId),
    #[error("snapshot is missing parameter `{0}`")]
    MissingParameter(&'static str),
}

/// Closed set of named numeric simulation parameters.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum Param {
    StartPopulation,
    StartResources,
    AgeMean,
    AgeStdDev,
    MaxAge,
    MaxAgeMin,
    MaxAgeMax,
    ChildChance,
    NeedPerTurn,
    StockpilingNeedMin,
    StockpilingNeedMax,
    MinReproduceAge,
    MaxReproduceAge,
    ResourceCapacity,
    HarvestSampleSize,
    GrowAmount,
    GrowChance,
    MaxRelationships,
    DefaultRelationshipDebt,
    RelationshipIncrement,
    MaxDebt,
    MinRelationshipAge,
    RelationshipAgeWindow,
    MinSelfSufficientAge,
    MinStockpileForBreeding,
}

impl Param {
    /// Every registered parameter, in declaration order.
    pub const ALL: [Self; 25] = [
        Self::StartPopulation,
        Self::StartResources,
        Self::AgeMean,
        Self::AgeStdDev,
        Self::MaxAge,
        Self::MaxAgeMin,
        Self::MaxAgeMax,
        Self::ChildChance,
        Self::NeedPerTurn,
        Self::StockpilingNeedMin,
        Self::StockpilingNeedMax,
        Self::MinReproduceAge,
        Self::MaxReproduceAge,
        Self::ResourceCapacity,
        Self::HarvestSampleSize,
        Self::GrowAmount,
        Self::GrowChance,
        Self::MaxRelationships,
        Self::DefaultRelationshipDebt,
        Self::RelationshipIncrement,
        Self::MaxDebt,
        Self::MinRelationshipAge,
        Self::RelationshipAgeWindow,
        Self::MinSelfSufficientAge,
        Self::MinStockpileForBreeding,
    ];

    /// Canonical snake_case name of the parameter.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::StartPopulation => "start_population",
            Self::StartResources => "start_resources",
            Self::AgeMean => "age_mean",
            Self::AgeStdDev => "age_std_dev",
            Self::MaxAge => "max_age",
            Self::MaxAgeMin => "max_age_min",
            Self::MaxAgeMax => "max_age_max",
            Self::ChildChance => "child_chance",
            Self::NeedPerTurn => "need_per_turn",
            Self::StockpilingNeedMin => "stockpiling_need_min",
            Self::StockpilingNeedMax => "stockpiling_need_max",
            Self::MinReproduceAge => "min_reproduce_age",
            Self::MaxReproduceAge => "max_reproduce_age",
            Self::ResourceCapacity => "resource_capacity",
            Self::HarvestSampleSize => "harvest_sample_size",
            Self::GrowAmount => "grow_amount",
            Self::GrowChance => "grow_chance",
            Self::MaxRelationships => "max_relationships",
            Self::DefaultRelationshipDebt => "default_relationship_debt",
            Self::RelationshipIncrement => "relationship_increment",
            Self::MaxDebt => "max_debt",
            Self::MinRelationshipAge => "min_relationship_age",
            Self::RelationshipAgeWindow => "relationship_age_window",
            Self::MinSelfSufficientAge => "min_self_sufficient_age",
            Self::MinStockpileForBreeding => "min_stockpile_for_breeding",
        }
    }

    /// Resolve a parameter from its canonical name.
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        Self::ALL
            .into_iter()
            .find(|param| param.name() == name)
            .ok_or_else(|| ConfigError::UnknownParameter(name.to_string()))
    }
}

/// Inclusive turn range during which a set of parameter overrides is in force.
///
/// Outside the range, every key the epoch governs is reset to the original
/// default captured at store construction, even when another still-active
/// epoch governs the same key. Later epochs in registration order win.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Epoch {
    pub start: u64,
    pub end: u64,
    pub overrides: Vec<(Param, f64)>,
}

impl Epoch {
    #[must_use]
    pub fn new(start: u64, end: u64, overrides: Vec<(Param, f64)>) -> Self {
        Self {
            start,
            end,
            overrides,
        }
    }

    /// Whether the epoch is in force for `turn`.
    #[must_use]
    pub fn contains(&self, turn: u64) -> bool {
        self.start <= turn && turn <= self.end
    }
}

/// Named numeric parameters plus the epoch overlay that rewrites them per turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterStore {
    current: BTreeMap<Param, f64>,
    originals: BTreeMap<Param, f64>,
    epochs: Vec<Epoch>,
    applied_turn: Option<u64>,
}

impl ParameterStore {
    /// Materialize the store from a validated configuration, capturing the
    /// originals that epoch reversion falls back to.
    #[must_use]
    pub fn from_config(config: &CommonsConfig) -> Self {
        let mut current = BTreeMap::new();
        for param in Param::ALL {
            current.insert(param, config.value_of(param));
        }
        Self {
            originals: current.clone(),
            current,
            epochs: Vec::new(),
            applied_turn: None,
        }
    }

    /// Current value of a parameter.
    #[must_use]
    pub fn get(&self, param: Param) -> f64 {
        self.current.get(&param).copied().unwrap_or_default()
    }

    /// Original default captured at construction.
    #[must_use]
    pub fn original(&self, param: Param) -> f64 {
        self.originals.get(&param).copied().unwrap_or_default()
    }

    /// Overwrite the current value of a parameter.
    pub fn set(&mut self, param: Param, value: f64) {
        self.current.insert(param, value);
    }

    /// Register an epoch. Registration order decides which epoch wins when
    /// two active epochs govern the same key.
    pub fn add_epoch(&mut self, epoch: Epoch) {
        self.epochs.push(epoch);
    }

    /// Registered epochs in registration order.
    #[must_use]
    pub fn epochs(&self) -> &[Epoch] {
        &self.epochs
    }

    /// Apply the epoch overlay for `turn`, once per turn. Re-applying the
    /// same turn number is a no-op. Returns whether any epoch is in force.
    pub fn apply_epochs(&mut self, turn: u64) -> bool {
        let active = self.epochs.iter().any(|epoch| epoch.contains(turn));
        if self.applied_turn == Some(turn) {
            return active;
        }
        for epoch in &self.epochs {
            if epoch.contains(turn) {
                for &(param, value) in &epoch.overrides {
                    self.current.insert(param, value);
                }
            } else {
                for &(param, _) in &epoch.overrides {
                    if let Some(&original) = self.originals.get(&param) {
                        self.current.insert(param, original);
                    }
                }
            }
        }
        self.applied_turn = Some(turn);
        if !self.epochs.is_empty() {
            debug!(turn, active, epochs = self.epochs.len(), "applied epoch overlay");
        }
        active
    }
}

/// Shared pool of bounded resource counters people harvest from each turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourcePool {
    cells: Vec<f64>,
    capacity: f64,
}

impl ResourcePool {
    /// Build a pool of `count` counters, each filled to `capacity`.
    pub fn new(count: usize, capacity: f64) -> Result<Self, ConfigError> {
        if count == 0 {
            return Err(ConfigError::InvalidConfig("resource pool must be non-empty"));
        }
        if capacity <= 0.0 {
            return Err(ConfigError::InvalidConfig(
                "resource capacity must be positive",
            ));
        }
        Ok(Self {
            cells: vec![capacity; count],
            capacity,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Fixed per-counter capacity.
    #[must_use]
    pub const fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Current amount held by one counter.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<f64> {
        self.cells.get(index).copied()
    }

    /// Draw `count` distinct counter indices without replacement.
    pub fn harvest(
        &self,
        rng: &mut SmallRng,
        count: usize,
    ) -> Result<Vec<usize>, SamplingError> {
        if count > self.cells.len() {
            return Err(SamplingError {
                requested: count,
                available: self.cells.len(),
            });
        }
        Ok(index::sample(rng, self.cells.len(), count).into_vec())
    }

    /// Remove up to `amount` from a counter, returning what was actually taken.
    pub fn consume(&mut self, index: usize, amount: f64) -> f64 {
        let Some(cell) = self.cells.get_mut(index) else {
            return 0.0;
        };
        let taken = amount.max(0.0).min(*cell);
        *cell -= taken;
        taken
    }

    /// Add `amount` to a counter, capped at capacity.
    pub fn replenish(&mut self, index: usize, amount: f64) {
        if let Some(cell) = self.cells.get_mut(index) {
            *cell = (*cell + amount).min(self.capacity);
        }
    }

    /// Replenish every counter, each gated by `chance` (unconditional when
    /// `chance >= 1`).
    pub fn grow(&mut self, rng: &mut SmallRng, amount: f64, chance: f64) {
        for index in 0..self.cells.len() {
            if chance < 1.0 && rng.random::<f64>() >= chance {
                continue;
            }
            self.replenish(index, amount);
        }
    }

    /// Sum of every counter.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.cells.iter().sum()
    }
}

/// One recorded adjustment of an edge's debt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DebtSample {
    pub turn: Turn,
    pub debt: f64,
}

/// Directed credit edge between two people. The debt scalar tracks how much
/// the `from` side owes the `to` side, always within `[0, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelationshipEdge {
    pub from: PersonId,
    pub to: PersonId,
    debt: f64,
    history: Vec<DebtSample>,
}

impl RelationshipEdge {
    fn new(from: PersonId, to: PersonId, debt: f64) -> Self {
        Self {
            from,
            to,
            debt: debt.clamp(0.0, 1.0),
            history: Vec::new(),
        }
    }

    #[must_use]
    pub fn debt(&self) -> f64 {
        self.debt
    }

    /// Append-only record of every debt adjustment.
    #[must_use]
    pub fn history(&self) -> &[DebtSample] {
        &self.history
    }

    /// Raise the debt by `increment`, capped at 1.
    pub fn raise_debt(&mut self, increment: f64, turn: Turn) {
        self.debt = (self.debt + increment).min(1.0);
        self.history.push(DebtSample {
            turn,
            debt: self.debt,
        });
    }

    /// Lower the debt by `increment`, floored at 0.
    pub fn lower_debt(&mut self, increment: f64, turn: Turn) {
        self.debt = (self.debt - increment).max(0.0);
        self.history.push(DebtSample {
            turn,
            debt: self.debt,
        });
    }
}

/// Directed weighted graph of credit relationships keyed by ordered pair.
///
/// An edge and its inverse are independent objects; creating one never
/// implies the other exists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationshipGraph {
    edges: BTreeMap<(PersonId, PersonId), RelationshipEdge>,
}

impl RelationshipGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a directed edge if the exact ordered pair does not already
    /// exist. Self-edges are refused. Returns the new edge, or `None` when
    /// nothing was created.
    pub fn add(
        &mut self,
        from: PersonId,
        to: PersonId,
        debt: f64,
    ) -> Option<&mut RelationshipEdge> {
        if from == to {
            return None;
        }
        match self.edges.entry((from, to)) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => Some(slot.insert(RelationshipEdge::new(from, to, debt))),
        }
    }

    /// Look up the edge for an ordered pair.
    #[must_use]
    pub fn get(&self, from: PersonId, to: PersonId) -> Option<&RelationshipEdge> {
        self.edges.get(&(from, to))
    }

    #[must_use]
    pub fn get_mut(&mut self, from: PersonId, to: PersonId) -> Option<&mut RelationshipEdge> {
        self.edges.get_mut(&(from, to))
    }

    /// Record a successful borrow along `from -> to`: the forward edge's debt
    /// rises and the inverse edge's debt, if the inverse exists, falls by the
    /// same increment.
    pub fn record_borrow(&mut self, from: PersonId, to: PersonId, increment: f64, turn: Turn) {
        if let Some(edge) = self.edges.get_mut(&(from, to)) {
            edge.raise_debt(increment, turn);
        }
        if let Some(inverse) = self.edges.get_mut(&(to, from)) {
            inverse.lower_debt(increment, turn);
        }
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Iterate every edge in key order.
    pub fn edges(&self) -> impl Iterator<Item = &RelationshipEdge> {
        self.edges.values()
    }
}

impl Serialize for RelationshipGraph {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_seq(self.edges.values())
    }
}

impl<'de> Deserialize<'de> for RelationshipGraph {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let edges = Vec::<RelationshipEdge>::deserialize(deserializer)?;
        let edges = edges
            .into_iter()
            .map(|edge| ((edge.from, edge.to), edge))
            .collect();
        Ok(Self { edges })
    }
}

/// Closed set of per-person trait keys.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum TraitKey {
    ChildChance,
    MinStockpileForBreeding,
    MinReproduceAge,
    MaxReproduceAge,
    MaxDebt,
    MinSelfSufficientAge,
    MinRelationshipAge,
}

impl TraitKey {
    /// The shared parameter a trait falls back to when no local override is set.
    #[must_use]
    pub const fn fallback(self) -> Param {
        match self {
            Self::ChildChance => Param::ChildChance,
            Self::MinStockpileForBreeding => Param::MinStockpileForBreeding,
            Self::MinReproduceAge => Param::MinReproduceAge,
            Self::MaxReproduceAge => Param::MaxReproduceAge,
            Self::MaxDebt => Param::MaxDebt,
            Self::MinSelfSufficientAge => Param::MinSelfSufficientAge,
            Self::MinRelationshipAge => Param::MinRelationshipAge,
        }
    }
}

/// Two-tier trait lookup: a local override map checked first, then the shared
/// defaults held by the parameter store.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TraitSet {
    overrides: BTreeMap<TraitKey, f64>,
}

impl TraitSet {
    /// Sample the overrides every person starts with.
    #[must_use]
    pub fn sample_initial(rng: &mut SmallRng) -> Self {
        let mut overrides = BTreeMap::new();
        overrides.insert(TraitKey::ChildChance, rng.random::<f64>());
        overrides.insert(
            TraitKey::MinStockpileForBreeding,
            f64::from(rng.random_range(10..25u32)),
        );
        Self { overrides }
    }

    /// Derive a child's traits from the parent's: every override is copied
    /// and independently multiplied by 0.9 or 1.1, a coin flip each.
    #[must_use]
    pub fn inherit(parent: &Self, rng: &mut SmallRng) -> Self {
        let mut overrides = BTreeMap::new();
        for (&key, &value) in &parent.overrides {
            let factor = if rng.random_bool(0.5) { 0.9 } else { 1.1 };
            overrides.insert(key, value * factor);
        }
        Self { overrides }
    }

    /// Effective value of a trait.
    #[must_use]
    pub fn get(&self, key: TraitKey, params: &ParameterStore) -> f64 {
        self.overrides
            .get(&key)
            .copied()
            .unwrap_or_else(|| params.get(key.fallback()))
    }

    /// Local override, if one is set.
    #[must_use]
    pub fn override_value(&self, key: TraitKey) -> Option<f64> {
        self.overrides.get(&key).copied()
    }

    pub fn set(&mut self, key: TraitKey, value: f64) {
        self.overrides.insert(key, value);
    }
}

/// How a person's life ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeathCause {
    Starved,
    OldAge,
}

impl DeathCause {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starved => "starved",
            Self::OldAge => "old_age",
        }
    }
}

/// Which source ultimately satisfied the per-turn need.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NeedsSource {
    Parent,
    ResourcePool,
    Stockpile,
    Relationships,
    Unmet,
}

impl NeedsSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Parent => "parent",
            Self::ResourcePool => "resource_pool",
            Self::Stockpile => "stockpile",
            Self::Relationships => "relationships",
            Self::Unmet => "unmet",
        }
    }
}

/// Which source satisfied the stockpiling desire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StockpileSource {
    ResourcePool,
    Relationships,
    NotNeeded,
    Unmet,
}

impl StockpileSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ResourcePool => "resource_pool",
            Self::Relationships => "relationships",
            Self::NotNeeded => "not_needed",
            Self::Unmet => "unmet",
        }
    }
}

/// Lightweight per-person record captured at the end of each lived turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PersonSample {
    pub age: u32,
    pub children: usize,
    pub stockpile: f64,
    pub relationships: usize,
    pub needs_source: Option<NeedsSource>,
}

/// One simulated individual.
///
/// Cross-person references (parent, children, relationship partners) are
/// identities resolved through the registry, never owning pointers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Person {
    pub born: Turn,
    pub died: Option<Turn>,
    pub cause: Option<DeathCause>,
    pub age: u32,
    pub max_age: u32,
    pub alive: bool,
    pub stockpile: f64,
    pub need_per_turn: f64,
    pub stockpiling_need: f64,
    /// Subsidy a dependent still draws from its parent each turn. Zeroed
    /// permanently once the person reaches the self-sufficiency age.
    pub need_from_parent: f64,
    pub parent: Option<PersonId>,
    pub children: Vec<PersonId>,
    /// Outgoing relationship partners in formation order; borrowing walks
    /// this list front to back.
    pub relationships: Vec<PersonId>,
    pub traits: TraitSet,
    pub needs_source: Option<NeedsSource>,
    pub stockpile_source: Option<StockpileSource>,
    /// Sum of the sampled counters seen during the last harvest.
    pub resources_available: Option<f64>,
    pub samples: Vec<PersonSample>,
}

impl Person {
    /// Build a person at `age` with the given traits, sampling max-age and
    /// stockpiling desire from the current parameters.
    #[must_use]
    pub fn sampled(
        age: u32,
        born: Turn,
        parent: Option<PersonId>,
        traits: TraitSet,
        params: &ParameterStore,
        rng: &mut SmallRng,
    ) -> Self {
        let max_age_min = params.get(Param::MaxAgeMin) as u32;
        let max_age_max = params.get(Param::MaxAgeMax) as u32;
        let mut max_age = if max_age_max > max_age_min {
            rng.random_range(max_age_min..=max_age_max)
        } else {
            max_age_min
        };
        if age > max_age {
            max_age = age + 1;
        }
        let spn_min = params.get(Param::StockpilingNeedMin);
        let spn_max = params.get(Param::StockpilingNeedMax);
        let stockpiling_need = if spn_max > spn_min {
            rng.random_range(spn_min..spn_max)
        } else {
            spn_min
        };
        let need = params.get(Param::NeedPerTurn);
        Self {
            born,
            died: None,
            cause: None,
            age,
            max_age,
            alive: true,
            stockpile: 0.0,
            need_per_turn: need,
            stockpiling_need,
            need_from_parent: need,
            parent,
            children: Vec::new(),
            relationships: Vec::new(),
            traits,
            needs_source: None,
            stockpile_source: None,
            resources_available: None,
            samples: Vec::new(),
        }
    }

    /// Hand over up to `amount` from this person's stockpile, returning what
    /// was actually granted.
    pub fn contribute(&mut self, amount: f64) -> f64 {
        if amount <= 0.0 {
            return 0.0;
        }
        let granted = amount.min(self.stockpile);
        self.stockpile -= granted;
        granted
    }
}

/// Owning registry of every person ever created, alive and dead, plus the
/// insertion-ordered alive subset.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersonRegistry {
    people: SlotMap<PersonId, Person>,
    alive: Vec<PersonId>,
}

impl PersonRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a person directly into the alive subset (initial population).
    pub fn admit(&mut self, person: Person) -> PersonId {
        let id = self.people.insert(person);
        self.alive.push(id);
        id
    }

    /// Insert a person without admitting them to the alive subset (newborns
    /// awaiting deferred admission).
    pub fn register(&mut self, person: Person) -> PersonId {
        self.people.insert(person)
    }

    /// Admit a previously registered person to the alive subset.
    pub fn mark_alive(&mut self, id: PersonId) {
        if self.people.contains_key(id) && !self.alive.contains(&id) {
            self.alive.push(id);
        }
    }

    #[must_use]
    pub fn person(&self, id: PersonId) -> Option<&Person> {
        self.people.get(id)
    }

    #[must_use]
    pub fn person_mut(&mut self, id: PersonId) -> Option<&mut Person> {
        self.people.get_mut(id)
    }

    /// Identities currently in the alive subset, in admission order.
    #[must_use]
    pub fn alive_ids(&self) -> &[PersonId] {
        &self.alive
    }

    #[must_use]
    pub fn alive_count(&self) -> usize {
        self.alive.len()
    }

    /// Everyone ever created, including the dead.
    #[must_use]
    pub fn total_count(&self) -> usize {
        self.people.len()
    }

    /// Whether the person's lifecycle state is still ALIVE. Note that a
    /// newborn is alive before it joins the alive subset.
    #[must_use]
    pub fn is_alive(&self, id: PersonId) -> bool {
        self.people.get(id).is_some_and(|person| person.alive)
    }

    fn remove_alive(&mut self, id: PersonId) {
        self.alive.retain(|&candidate| candidate != id);
    }

    pub fn iter(&self) -> impl Iterator<Item = (PersonId, &Person)> {
        self.people.iter()
    }

    /// People whose death was recorded in `turn`.
    pub fn deaths_in(&self, turn: Turn) -> impl Iterator<Item = (PersonId, &Person)> {
        self.people
            .iter()
            .filter(move |(_, person)| person.died == Some(turn))
    }
}

/// Aggregate counters captured when the summary stage runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnSummary {
    pub turn: Turn,
    pub population: usize,
    pub alive: usize,
    pub dead: usize,
    pub births: usize,
    pub deaths: usize,
    pub starved: usize,
    pub old_age: usize,
    pub total_stockpile: f64,
    pub total_resources: f64,
}

/// Scalar metric sampled for persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: Cow<'static, str>,
    pub value: f64,
}

impl MetricSample {
    #[must_use]
    pub fn new(name: impl Into<Cow<'static, str>>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Birth recorded for persistence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BirthRecord {
    pub turn: Turn,
    pub id: PersonId,
    pub parent: Option<PersonId>,
}

/// Death recorded for persistence, with cause.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeathRecord {
    pub turn: Turn,
    pub id: PersonId,
    pub age: u32,
    pub cause: DeathCause,
}

/// Identity plus full person state, as forwarded to persistence sinks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersonState {
    pub id: PersonId,
    pub person: Person,
}

/// Aggregate payload handed to persistence sinks at the summary stage.
#[derive(Debug, Clone)]
pub struct TurnBatch {
    pub summary: TurnSummary,
    pub births: Vec<BirthRecord>,
    pub deaths: Vec<DeathRecord>,
    pub metrics: Vec<MetricSample>,
    pub people: Vec<PersonState>,
}

/// Persistence sink invoked at the summary stage.
pub trait TurnPersistence: Send {
    fn on_turn(&mut self, batch: &TurnBatch);
}

/// No-op persistence sink.
#[derive(Debug, Default)]
pub struct NullPersistence;

impl TurnPersistence for NullPersistence {
    fn on_turn(&mut self, _batch: &TurnBatch) {}
}

/// Events emitted after executing one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TurnEvents {
    /// The turn that was executed.
    pub turn: Turn,
    pub births: usize,
    pub deaths: usize,
    pub epoch_active: bool,
    pub summary_flushed: bool,
}

/// Static configuration for a simulation run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommonsConfig {
    /// Number of people seeded at construction.
    pub start_population: u32,
    /// Number of counters in the resource pool.
    pub start_resources: u32,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Mean of the Gaussian initial-age distribution.
    pub age_mean: f64,
    /// Standard deviation of the initial-age distribution.
    pub age_std_dev: f64,
    /// Ceiling applied when clipping sampled initial ages.
    pub max_age: f64,
    /// Lower bound of the sampled per-person maximum age.
    pub max_age_min: u32,
    /// Upper bound of the sampled per-person maximum age.
    pub max_age_max: u32,
    /// Shared default child-bearing probability.
    pub child_chance: f64,
    /// Resource units a person must obtain every turn.
    pub need_per_turn: f64,
    /// Lower bound of the sampled per-person stockpiling desire.
    pub stockpiling_need_min: f64,
    /// Upper bound of the sampled per-person stockpiling desire.
    pub stockpiling_need_max: f64,
    pub min_reproduce_age: f64,
    pub max_reproduce_age: f64,
    /// Fixed capacity of each resource counter.
    pub resource_capacity: f64,
    /// Counters sampled per harvest; must not exceed `start_resources`.
    pub harvest_sample_size: u32,
    /// Units added to a counter when growth fires.
    pub grow_amount: f64,
    /// Per-counter probability that growth fires each turn.
    pub grow_chance: f64,
    /// Maximum outgoing relationship edges per person.
    pub max_relationships: u32,
    /// Debt assigned to a newly formed edge.
    pub default_relationship_debt: f64,
    /// Debt adjustment applied per successful borrow.
    pub relationship_increment: f64,
    /// Edges with debt above this threshold refuse further borrowing.
    pub max_debt: f64,
    /// Age above which a person starts forming relationships.
    pub min_relationship_age: f64,
    /// Symmetric age window used when selecting partners.
    pub relationship_age_window: f64,
    /// Age below which a person depends on parental subsidy.
    pub min_self_sufficient_age: f64,
    /// Shared default stockpile floor required for breeding.
    pub min_stockpile_for_breeding: f64,
    /// Maximum number of turn summaries retained in memory.
    pub history_capacity: usize,
    /// Interval (turns) between summary flushes; 0 disables the stage.
    pub stats_interval: u32,
}

impl Default for CommonsConfig {
    fn default() -> Self {
        Self {
            start_population: 500,
            start_resources: 2_000,
            rng_seed: None,
            age_mean: 40.0,
            age_std_dev: 15.0,
            max_age: 80.0,
            max_age_min: 60,
            max_age_max: 80,
            child_chance: 0.07,
            need_per_turn: 2.0,
            stockpiling_need_min: 0.1,
            stockpiling_need_max: 0.5,
            min_reproduce_age: 18.0,
            max_reproduce_age: 40.0,
            resource_capacity: 2.0,
            harvest_sample_size: 5,
            grow_amount: 1.0,
            grow_chance: 1.0,
            max_relationships: 5,
            default_relationship_debt: 0.5,
            relationship_increment: 0.1,
            max_debt: 0.7,
            min_relationship_age: 16.0,
            relationship_age_window: 5.0,
            min_self_sufficient_age: 7.0,
            min_stockpile_for_breeding: 3.0,
            history_capacity: 256,
            stats_interval: 50,
        }
    }
}

impl CommonsConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.start_resources == 0 {
            return Err(ConfigError::InvalidConfig("start_resources must be non-zero"));
        }
        if self.harvest_sample_size > self.start_resources {
            return Err(ConfigError::InvalidConfig(
                "harvest_sample_size cannot exceed start_resources",
            ));
        }
        if self.resource_capacity <= 0.0 {
            return Err(ConfigError::InvalidConfig(
                "resource_capacity must be positive",
            ));
        }
        if self.grow_amount < 0.0 || self.grow_chance < 0.0 {
            return Err(ConfigError::InvalidConfig(
                "growth amount and chance must be non-negative",
            ));
        }
        if self.need_per_turn < 0.0 {
            return Err(ConfigError::InvalidConfig(
                "need_per_turn must be non-negative",
            ));
        }
        if self.stockpiling_need_min < 0.0
            || self.stockpiling_need_max < self.stockpiling_need_min
        {
            return Err(ConfigError::InvalidConfig(
                "stockpiling need bounds must be ordered and non-negative",
            ));
        }
        if !self.age_std_dev.is_finite() || self.age_std_dev < 0.0 {
            return Err(ConfigError::InvalidConfig(
                "age_std_dev must be finite and non-negative",
            ));
        }
        if self.age_mean <= 0.0 || self.max_age < 1.0 {
            return Err(ConfigError::InvalidConfig(
                "age_mean and max_age must be positive",
            ));
        }
        if self.max_age_min == 0 || self.max_age_max < self.max_age_min {
            return Err(ConfigError::InvalidConfig(
                "max age bounds must be ordered and positive",
            ));
        }
        if self.min_reproduce_age > self.max_reproduce_age {
            return Err(ConfigError::InvalidConfig(
                "reproduction age bounds must be ordered",
            ));
        }
        if !(0.0..=1.0).contains(&self.default_relationship_debt)
            || !(0.0..=1.0).contains(&self.max_debt)
        {
            return Err(ConfigError::InvalidConfig(
                "relationship debt values must be within [0, 1]",
            ));
        }
        if self.relationship_increment < 0.0 || self.relationship_age_window < 0.0 {
            return Err(ConfigError::InvalidConfig(
                "relationship increment and age window must be non-negative",
            ));
        }
        if self.min_relationship_age < 0.0
            || self.min_self_sufficient_age < 0.0
            || self.min_stockpile_for_breeding < 0.0
        {
            return Err(ConfigError::InvalidConfig(
                "age thresholds and breeding floor must be non-negative",
            ));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "history_capacity must be non-zero",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG seed, generating one from entropy if absent.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }

    /// Numeric value backing a parameter at store construction.
    #[must_use]
    pub fn value_of(&self, param: Param) -> f64 {
        match param {
            Param::StartPopulation => f64::from(self.start_population),
            Param::StartResources => f64::from(self.start_resources),
            Param::AgeMean => self.age_mean,
            Param::AgeStdDev => self.age_std_dev,
            Param::MaxAge => self.max_age,
            Param::MaxAgeMin => f64::from(self.max_age_min),
            Param::MaxAgeMax => f64::from(self.max_age_max),
            Param::ChildChance => self.child_chance,
            Param::NeedPerTurn => self.need_per_turn,
            Param::StockpilingNeedMin => self.stockpiling_need_min,
            Param::StockpilingNeedMax => self.stockpiling_need_max,
            Param::MinReproduceAge => self.min_reproduce_age,
            Param::MaxReproduceAge => self.max_reproduce_age,
            Param::ResourceCapacity => self.resource_capacity,
            Param::HarvestSampleSize => f64::from(self.harvest_sample_size),
            Param::GrowAmount => self.grow_amount,
            Param::GrowChance => self.grow_chance,
            Param::MaxRelationships => f64::from(self.max_relationships),
            Param::DefaultRelationshipDebt => self.default_relationship_debt,
            Param::RelationshipIncrement => self.relationship_increment,
            Param::MaxDebt => self.max_debt,
            Param::MinRelationshipAge => self.min_relationship_age,
            Param::RelationshipAgeWindow => self.relationship_age_window,
            Param::MinSelfSufficientAge => self.min_self_sufficient_age,
            Param::MinStockpileForBreeding => self.min_stockpile_for_breeding,
        }
    }
}

/// Aggregate simulation state driving the staged turn pipeline.
///
/// Mutations inside a turn are immediate and visible to people not yet
/// processed in the same pass; there is no per-turn isolation.
pub struct World {
    config: CommonsConfig,
    params: ParameterStore,
    turn: Turn,
    rng: SmallRng,
    people: PersonRegistry,
    resources: ResourcePool,
    relationships: RelationshipGraph,
    pending_admissions: Vec<PersonId>,
    recent_births: Vec<BirthRecord>,
    recent_deaths: Vec<DeathRecord>,
    persistence: Box<dyn TurnPersistence>,
    history: VecDeque<TurnSummary>,
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("turn", &self.turn)
            .field("alive", &self.people.alive_count())
            .field("total", &self.people.total_count())
            .field("resources", &self.resources.total())
            .finish()
    }
}

impl World {
    /// Instantiate a new world using the supplied configuration.
    pub fn new(config: CommonsConfig) -> Result<Self, ConfigError> {
        Self::with_persistence(config, Box::new(NullPersistence))
    }

    /// Instantiate a new world with an attached persistence sink.
    pub fn with_persistence(
        config: CommonsConfig,
        persistence: Box<dyn TurnPersistence>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let params = ParameterStore::from_config(&config);
        let mut rng = config.seeded_rng();
        let resources = ResourcePool::new(config.start_resources as usize, config.resource_capacity)?;
        let ages = Normal::new(config.age_mean, config.age_std_dev).map_err(|_| {
            ConfigError::InvalidConfig("age distribution must have a finite, non-negative std dev")
        })?;
        let mut people = PersonRegistry::new();
        for _ in 0..config.start_population {
            let age = ages.sample(&mut rng).clamp(1.0, config.max_age).round() as u32;
            let traits = TraitSet::sample_initial(&mut rng);
            let person = Person::sampled(age, Turn::zero(), None, traits, &params, &mut rng);
            people.admit(person);
        }
        let history_capacity = config.history_capacity;
        Ok(Self {
            config,
            params,
            turn: Turn::zero(),
            rng,
            people,
            resources,
            relationships: RelationshipGraph::new(),
            pending_admissions: Vec::new(),
            recent_births: Vec::new(),
            recent_deaths: Vec::new(),
            persistence,
            history: VecDeque::with_capacity(history_capacity),
        })
    }

    /// Execute one simulation turn.
    ///
    /// Order: admit newborns from the previous turn, apply the epoch overlay,
    /// run every alive person in a freshly shuffled order, grow the resource
    /// pool, then run the summary stage.
    pub fn step(&mut self) -> Result<TurnEvents, SamplingError> {
        let turn = self.turn;
        self.stage_admit_newborns();
        let epoch_active = self.params.apply_epochs(turn.0);

        let mut order = self.people.alive_ids().to_vec();
        order.shuffle(&mut self.rng);

        let deaths_before = self.recent_deaths.len();
        let mut newborns = Vec::new();
        for id in order {
            if !self.people.is_alive(id) {
                continue;
            }
            if let Some(child) = self.live_person(id, turn)? {
                newborns.push(child);
            }
        }

        let grow_amount = self.params.get(Param::GrowAmount);
        let grow_chance = self.params.get(Param::GrowChance);
        self.resources.grow(&mut self.rng, grow_amount, grow_chance);

        let births = newborns.len();
        let deaths = self.recent_deaths.len() - deaths_before;
        self.pending_admissions.extend(newborns);

        let summary_flushed = self.stage_summary(turn);
        self.turn = self.turn.next();
        Ok(TurnEvents {
            turn,
            births,
            deaths,
            epoch_active,
            summary_flushed,
        })
    }

    fn stage_admit_newborns(&mut self) {
        let pending = std::mem::take(&mut self.pending_admissions);
        for id in pending {
            if self.people.is_alive(id) {
                self.people.mark_alive(id);
            }
        }
    }

    /// One person's turn. Returns the newborn, if a child was produced, for
    /// deferred admission by the caller.
    fn live_person(&mut self, id: PersonId, turn: Turn) -> Result<Option<PersonId>, SamplingError> {
        let threshold = match self.people.person(id) {
            Some(person) if person.alive => person
                .traits
                .get(TraitKey::MinSelfSufficientAge, &self.params),
            _ => return Ok(None),
        };
        if let Some(person) = self.people.person_mut(id) {
            if f64::from(person.age) >= threshold {
                person.need_from_parent = 0.0;
            }
        }

        self.meet_needs(id, turn)?;
        if !self.people.is_alive(id) {
            return Ok(None);
        }

        let child = self.try_reproduce(id, turn);

        let (age, min_relationship_age) = match self.people.person(id) {
            Some(person) => (
                person.age,
                person.traits.get(TraitKey::MinRelationshipAge, &self.params),
            ),
            None => return Ok(child),
        };
        if f64::from(age) > min_relationship_age {
            self.build_relationships(id);
        }

        let expired = match self.people.person_mut(id) {
            Some(person) => {
                person.age += 1;
                person.age > person.max_age
            }
            None => false,
        };
        if expired {
            self.kill(id, DeathCause::OldAge, turn);
        }

        if let Some(person) = self.people.person_mut(id) {
            let sample = PersonSample {
                age: person.age,
                children: person.children.len(),
                stockpile: person.stockpile,
                relationships: person.relationships.len(),
                needs_source: person.needs_source,
            };
            person.samples.push(sample);
        }
        Ok(child)
    }

    /// The needs cascade: parental subsidy, resource harvest, stockpile
    /// drawdown, relationship borrowing, then death by starvation.
    fn meet_needs(&mut self, id: PersonId, turn: Turn) -> Result<(), SamplingError> {
        let (mut need, mut stockpile_need, dependent, parent, partners, max_debt) = {
            let Some(person) = self.people.person(id) else {
                return Ok(());
            };
            let children_need: f64 = person
                .children
                .iter()
                .filter_map(|&child| self.people.person(child))
                .filter(|child| child.alive)
                .map(|child| child.need_from_parent)
                .sum();
            let dependent = f64::from(person.age)
                < person
                    .traits
                    .get(TraitKey::MinSelfSufficientAge, &self.params);
            (
                person.need_per_turn,
                person.stockpiling_need + children_need,
                dependent,
                person.parent,
                person.relationships.clone(),
                person.traits.get(TraitKey::MaxDebt, &self.params),
            )
        };

        let mut needs_source = None;
        let mut stockpile_source = if dependent {
            Some(StockpileSource::NotNeeded)
        } else {
            None
        };
        let mut resources_available = None;

        if dependent {
            // Dependents draw exclusively on the living parent, then their
            // own stockpile. No pool access, no borrowing.
            if let Some(parent_id) = parent {
                let granted = match self.people.person_mut(parent_id) {
                    Some(parent) if parent.alive => parent.contribute(need),
                    _ => 0.0,
                };
                need -= granted;
                if need <= 0.0 {
                    needs_source = Some(NeedsSource::Parent);
                }
            }
        } else {
            let sample_size = self.params.get(Param::HarvestSampleSize) as usize;
            let sampled = self.resources.harvest(&mut self.rng, sample_size)?;
            resources_available = Some(
                sampled
                    .iter()
                    .filter_map(|&index| self.resources.get(index))
                    .sum(),
            );
            let mut banked = 0.0;
            for index in sampled {
                if need > 0.0 {
                    let consumed = self.resources.consume(index, need);
                    need -= consumed;
                } else if stockpile_need > 0.0 {
                    let consumed = self.resources.consume(index, stockpile_need);
                    banked += consumed;
                    stockpile_need -= consumed;
                }
                if need <= 0.0 && stockpile_need <= 0.0 {
                    break;
                }
            }
            if banked > 0.0 {
                if let Some(person) = self.people.person_mut(id) {
                    person.stockpile += banked;
                }
            }
            if need <= 0.0 {
                needs_source = Some(NeedsSource::ResourcePool);
            }
            if stockpile_need <= 0.0 && stockpile_source.is_none() {
                stockpile_source = Some(StockpileSource::ResourcePool);
            }
        }

        if need > 0.0 {
            if let Some(person) = self.people.person_mut(id) {
                let drawn = need.min(person.stockpile);
                person.stockpile -= drawn;
                need -= drawn;
            }
            if need <= 0.0 && needs_source.is_none() {
                needs_source = Some(NeedsSource::Stockpile);
            }
        }

        if !dependent && (need > 0.0 || stockpile_need > 0.0) {
            let increment = self.params.get(Param::RelationshipIncrement);
            for partner in partners {
                if need <= 0.0 && stockpile_need <= 0.0 {
                    break;
                }
                let debt = match self.relationships.get(id, partner) {
                    Some(edge) => edge.debt(),
                    None => continue,
                };
                if debt > max_debt {
                    continue;
                }
                let mut pulled = 0.0;
                let mut banked = 0.0;
                if let Some(other) = self.people.person_mut(partner) {
                    if other.stockpile > 0.0 {
                        if need > 0.0 {
                            pulled = need.min(other.stockpile);
                            other.stockpile -= pulled;
                            need -= pulled;
                        } else if stockpile_need > 0.0 {
                            pulled = stockpile_need.min(other.stockpile);
                            other.stockpile -= pulled;
                            stockpile_need -= pulled;
                            banked = pulled;
                        }
                    }
                }
                if banked > 0.0 {
                    if let Some(person) = self.people.person_mut(id) {
                        person.stockpile += banked;
                    }
                }
                if pulled > 0.0 {
                    self.relationships.record_borrow(id, partner, increment, turn);
                }
            }
            if need <= 0.0 && needs_source.is_none() {
                needs_source = Some(NeedsSource::Relationships);
            }
            if stockpile_need <= 0.0 && stockpile_source.is_none() {
                stockpile_source = Some(StockpileSource::Relationships);
            }
        }

        let starved = need > 0.0;
        if let Some(person) = self.people.person_mut(id) {
            person.resources_available = resources_available;
            person.needs_source = if starved {
                Some(NeedsSource::Unmet)
            } else {
                needs_source
            };
            person.stockpile_source = if starved {
                Some(StockpileSource::Unmet)
            } else {
                stockpile_source
            };
        }
        if starved {
            self.kill(id, DeathCause::Starved, turn);
        }
        Ok(())
    }

    fn try_reproduce(&mut self, id: PersonId, turn: Turn) -> Option<PersonId> {
        let (chance, breeding_floor, stockpile, traits) = {
            let person = self.people.person(id)?;
            let age = f64::from(person.age);
            let min_age = person.traits.get(TraitKey::MinReproduceAge, &self.params);
            let max_age = person.traits.get(TraitKey::MaxReproduceAge, &self.params);
            if age < min_age || age > max_age {
                return None;
            }
            (
                person.traits.get(TraitKey::ChildChance, &self.params),
                person
                    .traits
                    .get(TraitKey::MinStockpileForBreeding, &self.params),
                person.stockpile,
                person.traits.clone(),
            )
        };
        if self.rng.random::<f64>() > chance {
            return None;
        }
        if stockpile < breeding_floor {
            return None;
        }

        let child_traits = TraitSet::inherit(&traits, &mut self.rng);
        let child = Person::sampled(0, turn, Some(id), child_traits, &self.params, &mut self.rng);
        let child_id = self.people.register(child);
        if let Some(parent) = self.people.person_mut(id) {
            parent.children.push(child_id);
        }
        self.recent_births.push(BirthRecord {
            turn,
            id: child_id,
            parent: Some(id),
        });
        Some(child_id)
    }

    /// Pair the person with shuffled alive candidates inside the age window
    /// until the relationship cap is reached. Edges are created in both
    /// directions; each side's partner list grows only when its own edge was
    /// newly created. Candidates already at the cap are skipped so the pairing
    /// never pushes either side over it.
    fn build_relationships(&mut self, id: PersonId) {
        let cap = self.params.get(Param::MaxRelationships) as usize;
        let age = match self.people.person(id) {
            Some(person) if person.relationships.len() < cap => f64::from(person.age),
            _ => return,
        };
        let window = self.params.get(Param::RelationshipAgeWindow);
        let mut candidates: Vec<PersonId> = self
            .people
            .alive_ids()
            .iter()
            .copied()
            .filter(|&other| other != id)
            .filter(|&other| {
                self.people.person(other).is_some_and(|candidate| {
                    let other_age = f64::from(candidate.age);
                    candidate.relationships.len() < cap
                        && age - window <= other_age
                        && other_age <= age + window
                })
            })
            .collect();
        candidates.shuffle(&mut self.rng);

        let default_debt = self.params.get(Param::DefaultRelationshipDebt);
        for other in candidates {
            let connected = self
                .people
                .person(id)
                .is_some_and(|person| person.relationships.contains(&other));
            if !connected {
                if self.relationships.add(id, other, default_debt).is_some() {
                    if let Some(person) = self.people.person_mut(id) {
                        person.relationships.push(other);
                    }
                }
                if self.relationships.add(other, id, default_debt).is_some() {
                    if let Some(candidate) = self.people.person_mut(other) {
                        candidate.relationships.push(id);
                    }
                }
            }
            let reached_cap = self
                .people
                .person(id)
                .is_some_and(|person| person.relationships.len() >= cap);
            if reached_cap {
                break;
            }
        }
    }

    fn kill(&mut self, id: PersonId, cause: DeathCause, turn: Turn) {
        let (heirs, share, age) = {
            let Some(person) = self.people.person(id) else {
                return;
            };
            if !person.alive {
                return;
            }
            let heirs: Vec<PersonId> = person
                .children
                .iter()
                .copied()
                .filter(|&child| self.people.person(child).is_some_and(|c| c.alive))
                .collect();
            let share = if heirs.is_empty() {
                0.0
            } else {
                (person.stockpile / heirs.len() as f64).floor()
            };
            (heirs, share, person.age)
        };
        if share > 0.0 {
            for &heir in &heirs {
                if let Some(child) = self.people.person_mut(heir) {
                    child.stockpile += share;
                }
            }
        }
        if let Some(person) = self.people.person_mut(id) {
            person.alive = false;
            person.died = Some(turn);
            person.cause = Some(cause);
            person.stockpile = 0.0;
        }
        self.people.remove_alive(id);
        self.recent_deaths.push(DeathRecord {
            turn,
            id,
            age,
            cause,
        });
    }

    fn stage_summary(&mut self, turn: Turn) -> bool {
        let interval = self.config.stats_interval;
        if interval == 0 {
            self.recent_births.clear();
            self.recent_deaths.clear();
            return false;
        }
        if !turn.0.is_multiple_of(u64::from(interval)) {
            return false;
        }

        let alive = self.people.alive_count();
        let population = self.people.total_count();
        let mut total_stockpile = 0.0;
        let mut total_age = 0u64;
        let mut total_children = 0usize;
        let mut total_need = 0.0;
        let mut from_parent = 0usize;
        let mut from_pool = 0usize;
        let mut from_stockpile = 0usize;
        let mut from_relationships = 0usize;
        for &id in self.people.alive_ids() {
            let Some(person) = self.people.person(id) else {
                continue;
            };
            total_stockpile += person.stockpile;
            total_age += u64::from(person.age);
            total_children += person.children.len();
            total_need += person.need_per_turn;
            match person.needs_source {
                Some(NeedsSource::Parent) => from_parent += 1,
                Some(NeedsSource::ResourcePool) => from_pool += 1,
                Some(NeedsSource::Stockpile) => from_stockpile += 1,
                Some(NeedsSource::Relationships) => from_relationships += 1,
                _ => {}
            }
        }
        let total_resources = self.resources.total();
        let starved = self
            .recent_deaths
            .iter()
            .filter(|record| record.cause == DeathCause::Starved)
            .count();
        let old_age = self.recent_deaths.len() - starved;

        let summary = TurnSummary {
            turn,
            population,
            alive,
            dead: population - alive,
            births: self.recent_births.len(),
            deaths: self.recent_deaths.len(),
            starved,
            old_age,
            total_stockpile,
            total_resources,
        };

        let denominator = alive.max(1) as f64;
        let reserves = total_stockpile + total_resources;
        let metrics = vec![
            MetricSample::new("total_stockpile", total_stockpile),
            MetricSample::new("average_stockpile", total_stockpile / denominator),
            MetricSample::new("total_resources", total_resources),
            MetricSample::new("average_age", total_age as f64 / denominator),
            MetricSample::new("average_children", total_children as f64 / denominator),
            MetricSample::new("needs_from_parent", from_parent as f64 / denominator),
            MetricSample::new("needs_from_resources", from_pool as f64 / denominator),
            MetricSample::new("needs_from_stockpile", from_stockpile as f64 / denominator),
            MetricSample::new(
                "needs_from_relationships",
                from_relationships as f64 / denominator,
            ),
            MetricSample::new(
                "ratio_needs_to_resources",
                if reserves > 0.0 { total_need / reserves } else { 0.0 },
            ),
        ];

        let people = self
            .people
            .alive_ids()
            .iter()
            .filter_map(|&id| {
                self.people.person(id).map(|person| PersonState {
                    id,
                    person: person.clone(),
                })
            })
            .collect();

        let batch = TurnBatch {
            summary: summary.clone(),
            births: std::mem::take(&mut self.recent_births),
            deaths: std::mem::take(&mut self.recent_deaths),
            metrics,
            people,
        };
        self.persistence.on_turn(&batch);

        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
        true
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &CommonsConfig {
        &self.config
    }

    /// Parameter store backing the running simulation.
    #[must_use]
    pub fn params(&self) -> &ParameterStore {
        &self.params
    }

    /// Mutable access to the parameter store (for hot edits).
    #[must_use]
    pub fn params_mut(&mut self) -> &mut ParameterStore {
        &mut self.params
    }

    /// Register an epoch on the parameter store.
    pub fn add_epoch(&mut self, epoch: Epoch) {
        self.params.add_epoch(epoch);
    }

    /// The turn the next call to [`World::step`] will execute.
    #[must_use]
    pub const fn turn(&self) -> Turn {
        self.turn
    }

    /// Borrow the world RNG mutably for deterministic sampling.
    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    #[must_use]
    pub fn people(&self) -> &PersonRegistry {
        &self.people
    }

    #[must_use]
    pub fn people_mut(&mut self) -> &mut PersonRegistry {
        &mut self.people
    }

    #[must_use]
    pub fn resources(&self) -> &ResourcePool {
        &self.resources
    }

    #[must_use]
    pub fn resources_mut(&mut self) -> &mut ResourcePool {
        &mut self.resources
    }

    #[must_use]
    pub fn relationships(&self) -> &RelationshipGraph {
        &self.relationships
    }

    #[must_use]
    pub fn relationships_mut(&mut self) -> &mut RelationshipGraph {
        &mut self.relationships
    }

    /// Replace the persistence sink.
    pub fn set_persistence(&mut self, persistence: Box<dyn TurnPersistence>) {
        self.persistence = persistence;
    }

    /// Iterate over retained turn summaries.
    pub fn history(&self) -> impl Iterator<Item = &TurnSummary> {
        self.history.iter()
    }

    /// Create a person of the given age with freshly sampled traits and admit
    /// them to the alive subset immediately.
    pub fn spawn_person(&mut self, age: u32) -> PersonId {
        let traits = TraitSet::sample_initial(&mut self.rng);
        let person = Person::sampled(age, self.turn, None, traits, &self.params, &mut self.rng);
        self.people.admit(person)
    }

    /// Run the death procedure for a person at the current turn.
    pub fn kill_person(&mut self, id: PersonId, cause: DeathCause) {
        let turn = self.turn;
        self.kill(id, cause, turn);
    }

    /// Capture a serializable snapshot of the full simulation state.
    #[must_use]
    pub fn snapshot(&self) -> WorldSnapshot {
        WorldSnapshot {
            turn: self.turn,
            config: self.config.clone(),
            params: self.params.clone(),
            people: self.people.clone(),
            pending: self.pending_admissions.clone(),
            resources: self.resources.clone(),
            relationships: self.relationships.clone(),
            history: self.history.clone(),
        }
    }

    /// Capture and write a snapshot to `path`.
    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<(), SnapshotError> {
        self.snapshot().write_to(path)
    }

    /// Read a snapshot from `path` and restore a world from it. The restored
    /// world starts with a null persistence sink.
    pub fn load_snapshot(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        WorldSnapshot::read_from(path)?.restore()
    }
}

/// Persisted form of the full simulation state.
///
/// Every cross-person reference is an identity; restoring materializes the
/// registry first and then validates that every reference resolves against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub turn: Turn,
    pub config: CommonsConfig,
    pub params: ParameterStore,
    pub people: PersonRegistry,
    pub pending: Vec<PersonId>,
    pub resources: ResourcePool,
    pub relationships: RelationshipGraph,
    pub history: VecDeque<TurnSummary>,
}

impl WorldSnapshot {
    /// Serialize the snapshot as JSON to `path`.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), SnapshotError> {
        let path = path.as_ref();
        let file = File::create(path)?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        info!(
            path = %path.display(),
            people = self.people.total_count(),
            turn = self.turn.0,
            "wrote simulation snapshot"
        );
        Ok(())
    }

    /// Read a snapshot back from `path`.
    pub fn read_from(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let snapshot: Self = serde_json::from_reader(BufReader::new(file))?;
        info!(
            path = %path.display(),
            people = snapshot.people.total_count(),
            turn = snapshot.turn.0,
            "read simulation snapshot"
        );
        Ok(snapshot)
    }

    /// Validate every identity reference and rebuild a live world.
    pub fn restore(self) -> Result<World, SnapshotError> {
        self.validate()?;
        let rng = self.config.seeded_rng();
        Ok(World {
            rng,
            config: self.config,
            params: self.params,
            turn: self.turn,
            people: self.people,
            resources: self.resources,
            relationships: self.relationships,
            pending_admissions: self.pending,
            recent_births: Vec::new(),
            recent_deaths: Vec::new(),
            persistence: Box::new(NullPersistence),
            history: self.history,
        })
    }

    fn validate(&self) -> Result<(), SnapshotError> {
        for param in Param::ALL {
            if !self.params.current.contains_key(&param)
                || !self.params.originals.contains_key(&param)
            {
                return Err(SnapshotError::MissingParameter(param.name()));
            }
        }
        let known = |id: PersonId| self.people.people.contains_key(id);
        for (_, person) in self.people.people.iter() {
            if let Some(parent) = person.parent {
                if !known(parent) {
                    return Err(SnapshotError::UnknownPerson(parent));
                }
            }
            for &child in &person.children {
                if !known(child) {
                    return Err(SnapshotError::UnknownPerson(child));
                }
            }
            for &partner in &person.relationships {
                if !known(partner) {
                    return Err(SnapshotError::UnknownPerson(partner));
                }
            }
        }
        for &id in &self.people.alive {
            if !known(id) {
                return Err(SnapshotError::UnknownPerson(id));
            }
        }
        for &id in &self.pending {
            if !known(id) {
                return Err(SnapshotError::UnknownPerson(id));
            }
        }
        for edge in self.relationships.edges.values() {
            if !known(edge.from) {
                return Err(SnapshotError::UnknownPerson(edge.from));
            }
            if !known(edge.to) {
                return Err(SnapshotError::UnknownPerson(edge.to));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::KeyData;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn base_config() -> CommonsConfig {
        CommonsConfig {
            start_population: 0,
            start_resources: 16,
            rng_seed: Some(7),
            grow_amount: 0.0,
            stats_interval: 0,
            ..CommonsConfig::default()
        }
    }

    fn empty_world() -> World {
        World::new(base_config()).expect("world")
    }

    fn drain_pool(world: &mut World) {
        for index in 0..world.resources().len() {
            world.resources_mut().consume(index, f64::MAX);
        }
    }

    fn quiet_adult(world: &mut World, age: u32, stockpile: f64) -> PersonId {
        let id = world.spawn_person(age);
        let person = world.people_mut().person_mut(id).expect("person");
        person.stockpile = stockpile;
        person.stockpiling_need = 0.0;
        person.traits.set(TraitKey::ChildChance, 0.0);
        id
    }

    fn bogus_id(raw: u64) -> PersonId {
        PersonId::from(KeyData::from_ffi((1 << 32) | raw))
    }

    #[test]
    fn parameter_store_materialises_config_defaults() {
        let config = CommonsConfig::default();
        let params = ParameterStore::from_config(&config);
        assert_eq!(params.get(Param::NeedPerTurn), 2.0);
        assert_eq!(params.get(Param::MaxRelationships), 5.0);
        assert_eq!(params.original(Param::GrowChance), 1.0);
        assert_eq!(Param::parse("need_per_turn"), Ok(Param::NeedPerTurn));
        assert!(matches!(
            Param::parse("does_not_exist"),
            Err(ConfigError::UnknownParameter(_))
        ));
    }

    #[test]
    fn epoch_overrides_apply_and_revert() {
        let mut params = ParameterStore::from_config(&CommonsConfig::default());
        params.add_epoch(Epoch::new(10, 20, vec![(Param::NeedPerTurn, 4.0)]));

        params.apply_epochs(9);
        assert_eq!(params.get(Param::NeedPerTurn), 2.0);
        for turn in 10..=20 {
            params.apply_epochs(turn);
            assert_eq!(params.get(Param::NeedPerTurn), 4.0, "turn {turn}");
        }
        params.apply_epochs(21);
        assert_eq!(params.get(Param::NeedPerTurn), 2.0);
    }

    #[test]
    fn epoch_application_is_idempotent_within_a_turn() {
        let mut params = ParameterStore::from_config(&CommonsConfig::default());
        params.add_epoch(Epoch::new(10, 20, vec![(Param::NeedPerTurn, 4.0)]));
        params.apply_epochs(15);
        params.set(Param::NeedPerTurn, 9.0);
        params.apply_epochs(15);
        assert_eq!(params.get(Param::NeedPerTurn), 9.0);
        params.apply_epochs(16);
        assert_eq!(params.get(Param::NeedPerTurn), 4.0);
    }

    #[test]
    fn expired_epoch_resets_keys_a_later_active_epoch_governs() {
        // Reversion resets to the ORIGINAL default even while another active
        // epoch governs the same key; only a later-registered active epoch
        // re-applies its override within the same turn.
        let mut params = ParameterStore::from_config(&CommonsConfig::default());
        params.add_epoch(Epoch::new(0, 10, vec![(Param::NeedPerTurn, 5.0)]));
        params.add_epoch(Epoch::new(0, 5, vec![(Param::NeedPerTurn, 3.0)]));

        params.apply_epochs(4);
        assert_eq!(params.get(Param::NeedPerTurn), 3.0);
        // The short epoch expired; its reversion runs after the long epoch
        // applied, so the original default wins even though the long epoch is
        // still active.
        params.apply_epochs(6);
        assert_eq!(params.get(Param::NeedPerTurn), 2.0);
    }

    #[test]
    fn resource_pool_consume_and_replenish_are_bounded() {
        let mut pool = ResourcePool::new(4, 2.0).expect("pool");
        assert_eq!(pool.total(), 8.0);
        assert_eq!(pool.consume(0, 1.5), 1.5);
        assert_eq!(pool.consume(0, 10.0), 0.5);
        assert_eq!(pool.consume(0, 1.0), 0.0);
        pool.replenish(0, 100.0);
        assert_eq!(pool.get(0), Some(2.0));
        pool.replenish(99, 1.0);
        assert_eq!(pool.total(), 8.0);
    }

    #[test]
    fn harvest_rejects_oversized_samples() {
        let pool = ResourcePool::new(4, 2.0).expect("pool");
        let mut rng = SmallRng::seed_from_u64(1);
        let sampled = pool.harvest(&mut rng, 3).expect("sample");
        assert_eq!(sampled.len(), 3);
        let mut unique = sampled.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 3);

        let err = pool.harvest(&mut rng, 5).expect_err("oversized");
        assert_eq!(err.requested, 5);
        assert_eq!(err.available, 4);
    }

    #[test]
    fn pool_growth_respects_the_stochastic_gate() {
        let mut pool = ResourcePool::new(8, 2.0).expect("pool");
        let mut rng = SmallRng::seed_from_u64(3);
        for index in 0..pool.len() {
            pool.consume(index, 2.0);
        }
        pool.grow(&mut rng, 1.0, 0.0);
        assert_eq!(pool.total(), 0.0);
        pool.grow(&mut rng, 1.0, 1.0);
        assert_eq!(pool.total(), 8.0);
        pool.grow(&mut rng, 5.0, 1.0);
        assert_eq!(pool.total(), 16.0);
    }

    #[test]
    fn relationship_add_is_idempotent_and_rejects_self_edges() {
        let mut graph = RelationshipGraph::new();
        let a = bogus_id(1);
        let b = bogus_id(2);
        assert!(graph.add(a, b, 0.5).is_some());
        assert!(graph.add(a, b, 0.5).is_none());
        assert!(graph.add(a, a, 0.5).is_none());
        assert_eq!(graph.edge_count(), 1);
        assert!(graph.get(b, a).is_none());
    }

    #[test]
    fn debt_adjustments_clamp_and_record_history() {
        let mut graph = RelationshipGraph::new();
        let a = bogus_id(1);
        let b = bogus_id(2);
        graph.add(a, b, 0.9);
        let edge = graph.get_mut(a, b).expect("edge");
        edge.raise_debt(0.1, Turn(1));
        edge.raise_debt(0.1, Turn(2));
        assert_eq!(edge.debt(), 1.0);
        edge.lower_debt(0.4, Turn(3));
        edge.lower_debt(0.9, Turn(4));
        assert_eq!(edge.debt(), 0.0);
        assert_eq!(edge.history().len(), 4);
    }

    #[test]
    fn record_borrow_updates_the_inverse_edge() {
        let mut graph = RelationshipGraph::new();
        let a = bogus_id(1);
        let b = bogus_id(2);
        graph.add(a, b, 0.5);
        graph.add(b, a, 0.5);
        graph.record_borrow(a, b, 0.1, Turn(0));
        assert!((graph.get(a, b).expect("forward").debt() - 0.6).abs() < 1e-12);
        assert!((graph.get(b, a).expect("inverse").debt() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn trait_lookup_falls_back_to_shared_defaults() {
        let params = ParameterStore::from_config(&CommonsConfig::default());
        let traits = TraitSet::default();
        assert_eq!(traits.get(TraitKey::MaxDebt, &params), 0.7);
        assert_eq!(traits.get(TraitKey::MinReproduceAge, &params), 18.0);

        let mut overridden = TraitSet::default();
        overridden.set(TraitKey::MaxDebt, 0.2);
        assert_eq!(overridden.get(TraitKey::MaxDebt, &params), 0.2);
    }

    #[test]
    fn child_traits_are_perturbed_by_ten_percent() {
        let mut rng = SmallRng::seed_from_u64(11);
        let mut parent = TraitSet::default();
        parent.set(TraitKey::ChildChance, 0.5);
        parent.set(TraitKey::MinStockpileForBreeding, 10.0);
        for _ in 0..32 {
            let child = TraitSet::inherit(&parent, &mut rng);
            let chance = child.override_value(TraitKey::ChildChance).expect("chance");
            assert!(
                (chance - 0.45).abs() < 1e-12 || (chance - 0.55).abs() < 1e-12,
                "unexpected perturbation {chance}"
            );
            let floor = child
                .override_value(TraitKey::MinStockpileForBreeding)
                .expect("floor");
            assert!((floor - 9.0).abs() < 1e-12 || (floor - 11.0).abs() < 1e-12);
        }
    }

    #[test]
    fn dependents_draw_from_the_parent_stockpile() {
        let mut world = empty_world();
        let parent = quiet_adult(&mut world, 30, 20.0);
        let child = quiet_adult(&mut world, 3, 0.0);
        world.people_mut().person_mut(child).expect("child").parent = Some(parent);
        world
            .people_mut()
            .person_mut(parent)
            .expect("parent")
            .children
            .push(child);
        drain_pool(&mut world);

        world.step().expect("step");

        let child_state = world.people().person(child).expect("child");
        assert!(child_state.alive);
        assert_eq!(child_state.needs_source, Some(NeedsSource::Parent));
        assert_eq!(child_state.stockpile_source, Some(StockpileSource::NotNeeded));
        // Parent covered the child's subsidy and its own need from stockpile.
        let parent_state = world.people().person(parent).expect("parent");
        assert!((parent_state.stockpile - 16.0).abs() < 1e-9);
    }

    #[test]
    fn starvation_death_zeroes_the_stockpile() {
        let mut world = empty_world();
        let id = quiet_adult(&mut world, 50, 10.0);
        drain_pool(&mut world);

        let mut events = TurnEvents::default();
        for _ in 0..6 {
            events = world.step().expect("step");
        }

        let person = world.people().person(id).expect("person");
        assert!(!person.alive);
        assert_eq!(person.cause, Some(DeathCause::Starved));
        assert_eq!(person.died, Some(Turn(5)));
        assert_eq!(person.stockpile, 0.0);
        assert_eq!(person.needs_source, Some(NeedsSource::Unmet));
        assert_eq!(events.deaths, 1);
        assert_eq!(world.people().alive_count(), 0);
        assert_eq!(world.people().total_count(), 1);
    }

    #[test]
    fn death_splits_the_stockpile_across_alive_children() {
        let mut world = empty_world();
        let parent = quiet_adult(&mut world, 50, 5.0);
        let heir_a = quiet_adult(&mut world, 20, 0.0);
        let heir_b = quiet_adult(&mut world, 22, 0.0);
        let dead_child = quiet_adult(&mut world, 25, 0.0);
        world.kill_person(dead_child, DeathCause::Starved);
        {
            let person = world.people_mut().person_mut(parent).expect("parent");
            person.children = vec![heir_a, heir_b, dead_child];
        }

        world.kill_person(parent, DeathCause::Starved);

        assert_eq!(world.people().person(parent).expect("parent").stockpile, 0.0);
        assert_eq!(world.people().person(heir_a).expect("heir").stockpile, 2.0);
        assert_eq!(world.people().person(heir_b).expect("heir").stockpile, 2.0);
        assert_eq!(
            world.people().person(dead_child).expect("dead").stockpile,
            0.0
        );
        assert!(!world.people().alive_ids().contains(&parent));
        assert_eq!(world.people().total_count(), 4);
    }

    #[test]
    fn newborns_join_the_alive_set_next_turn() {
        let mut world = empty_world();
        let parent = world.spawn_person(20);
        {
            let person = world.people_mut().person_mut(parent).expect("parent");
            person.stockpile = 100.0;
            person.stockpiling_need = 0.0;
            person.traits.set(TraitKey::ChildChance, 1.0);
            person.traits.set(TraitKey::MinStockpileForBreeding, 0.0);
        }

        let events = world.step().expect("step");
        assert_eq!(events.births, 1);
        assert_eq!(world.people().total_count(), 2);
        assert_eq!(world.people().alive_count(), 1);

        let child = world
            .people()
            .iter()
            .find(|(id, _)| *id != parent)
            .map(|(id, _)| id)
            .expect("child");
        assert!(world.people().is_alive(child));
        assert!(!world.people().alive_ids().contains(&child));
        let child_state = world.people().person(child).expect("child");
        assert_eq!(child_state.parent, Some(parent));
        assert_eq!(child_state.age, 0);
        assert_eq!(child_state.born, Turn(0));

        world.step().expect("step");
        assert!(world.people().alive_ids().contains(&child));
    }

    #[test]
    fn borrowing_debits_the_partner_and_adjusts_both_edges() {
        let mut world = empty_world();
        let a = quiet_adult(&mut world, 30, 0.0);
        let b = quiet_adult(&mut world, 30, 10.0);
        world.people_mut().person_mut(a).expect("a").need_per_turn = 3.0;
        world.people_mut().person_mut(b).expect("b").need_per_turn = 3.0;
        world.relationships_mut().add(a, b, 0.5);
        world.relationships_mut().add(b, a, 0.5);
        world.people_mut().person_mut(a).expect("a").relationships = vec![b];
        world.people_mut().person_mut(b).expect("b").relationships = vec![a];
        drain_pool(&mut world);

        world.step().expect("step");

        let a_state = world.people().person(a).expect("a");
        assert!(a_state.alive);
        assert_eq!(a_state.needs_source, Some(NeedsSource::Relationships));
        // B lost 3 to its own need and 3 to the pull.
        let b_state = world.people().person(b).expect("b");
        assert!((b_state.stockpile - 4.0).abs() < 1e-9);

        let forward = world.relationships().get(a, b).expect("forward");
        assert!((forward.debt() - 0.6).abs() < 1e-9);
        assert_eq!(forward.history().len(), 1);
        let inverse = world.relationships().get(b, a).expect("inverse");
        assert!((inverse.debt() - 0.4).abs() < 1e-9);
        assert_eq!(inverse.history().len(), 1);
    }

    #[test]
    fn borrowing_skips_edges_over_the_debt_threshold() {
        let mut world = empty_world();
        let a = quiet_adult(&mut world, 30, 0.0);
        let b = quiet_adult(&mut world, 30, 10.0);
        world.relationships_mut().add(a, b, 0.8);
        world.people_mut().person_mut(a).expect("a").relationships = vec![b];
        drain_pool(&mut world);

        world.step().expect("step");

        let a_state = world.people().person(a).expect("a");
        assert!(!a_state.alive);
        assert_eq!(a_state.cause, Some(DeathCause::Starved));
        // B met its own need from stockpile and was never debited.
        let b_state = world.people().person(b).expect("b");
        assert!((b_state.stockpile - 8.0).abs() < 1e-9);
        let edge = world.relationships().get(a, b).expect("edge");
        assert!((edge.debt() - 0.8).abs() < 1e-12);
        assert!(edge.history().is_empty());
    }

    #[test]
    fn relationship_formation_respects_cap_and_age_window() {
        let mut world = empty_world();
        let center = quiet_adult(&mut world, 30, 5.0);
        for age in [27, 28, 29, 31, 32, 33, 34] {
            quiet_adult(&mut world, age, 5.0);
        }
        // Outside the ±5 window.
        quiet_adult(&mut world, 50, 5.0);
        quiet_adult(&mut world, 3, 5.0);

        for _ in 0..4 {
            world.step().expect("step");
        }

        let max = world.config().max_relationships as usize;
        for (id, person) in world.people().iter() {
            assert!(person.relationships.len() <= max);
            assert!(!person.relationships.contains(&id));
        }
        let center_state = world.people().person(center).expect("center");
        assert!(!center_state.relationships.is_empty());
        for &partner in &center_state.relationships {
            let partner_age = world.people().person(partner).expect("partner").age;
            // Pairs only form inside the window, and everyone ages together.
            assert!(partner_age.abs_diff(center_state.age) <= 5);
        }
    }

    #[test]
    fn world_initialises_population_from_config() {
        let config = CommonsConfig {
            start_population: 50,
            start_resources: 64,
            rng_seed: Some(13),
            ..CommonsConfig::default()
        };
        let world = World::new(config).expect("world");
        assert_eq!(world.people().alive_count(), 50);
        assert_eq!(world.resources().total(), 128.0);
        for (_, person) in world.people().iter() {
            assert!(person.age >= 1 && person.age <= 80);
            assert!(person.max_age >= person.age);
            assert!(person.stockpiling_need >= 0.1 && person.stockpiling_need < 0.5);
        }
    }

    #[test]
    fn invalid_configurations_are_rejected() {
        let config = CommonsConfig {
            harvest_sample_size: 10,
            start_resources: 5,
            ..CommonsConfig::default()
        };
        assert!(matches!(
            World::new(config),
            Err(ConfigError::InvalidConfig(_))
        ));

        let config = CommonsConfig {
            stockpiling_need_min: 0.5,
            stockpiling_need_max: 0.1,
            ..CommonsConfig::default()
        };
        assert!(config.validate().is_err());

        let config = CommonsConfig {
            max_age_min: 80,
            max_age_max: 60,
            ..CommonsConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn seeded_runs_are_deterministic() {
        let config = CommonsConfig {
            start_population: 30,
            start_resources: 64,
            rng_seed: Some(42),
            stats_interval: 1,
            history_capacity: 64,
            ..CommonsConfig::default()
        };
        let mut world_a = World::new(config.clone()).expect("world_a");
        let mut world_b = World::new(config).expect("world_b");
        for _ in 0..25 {
            world_a.step().expect("step");
            world_b.step().expect("step");
        }
        assert_eq!(world_a.people().alive_count(), world_b.people().alive_count());
        assert_eq!(world_a.resources().total(), world_b.resources().total());
        assert!(world_a.history().eq(world_b.history()));
    }

    fn temp_snapshot_path(prefix: &str) -> std::path::PathBuf {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "{prefix}-{}-{timestamp}.json",
            std::process::id()
        ))
    }

    #[test]
    fn snapshot_roundtrip_preserves_the_object_graph() {
        let config = CommonsConfig {
            start_population: 40,
            start_resources: 64,
            rng_seed: Some(11),
            stats_interval: 1,
            history_capacity: 64,
            ..CommonsConfig::default()
        };
        let mut world = World::new(config).expect("world");
        world.add_epoch(Epoch::new(4, 8, vec![(Param::GrowChance, 0.5)]));
        for _ in 0..12 {
            world.step().expect("step");
        }

        let path = temp_snapshot_path("commons-snapshot");
        world.save_snapshot(&path).expect("save");
        let restored = World::load_snapshot(&path).expect("load");
        let _ = std::fs::remove_file(&path);

        assert_eq!(restored.turn(), world.turn());
        assert_eq!(
            restored.people().alive_count(),
            world.people().alive_count()
        );
        assert_eq!(
            restored.people().total_count(),
            world.people().total_count()
        );
        assert_eq!(restored.resources().total(), world.resources().total());
        assert_eq!(restored.params(), world.params());
        assert!(restored.history().eq(world.history()));
        assert_eq!(
            restored.relationships().edge_count(),
            world.relationships().edge_count()
        );
        for (id, person) in world.people().iter() {
            let twin = restored.people().person(id).expect("restored person");
            assert_eq!(twin, person);
        }
    }

    #[test]
    fn snapshot_with_unknown_identities_is_rejected() {
        let mut world = empty_world();
        let a = quiet_adult(&mut world, 30, 1.0);

        let mut snapshot = world.snapshot();
        snapshot.relationships.add(a, bogus_id(777), 0.5);
        assert!(matches!(
            snapshot.restore(),
            Err(SnapshotError::UnknownPerson(_))
        ));

        let mut snapshot = world.snapshot();
        snapshot
            .people
            .person_mut(a)
            .expect("person")
            .parent = Some(bogus_id(778));
        assert!(matches!(
            snapshot.restore(),
            Err(SnapshotError::UnknownPerson(_))
        ));
    }
}
