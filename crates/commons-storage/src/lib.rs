//! DuckDB-backed persistence layer for the Commons simulation.

use commons_core::{
    BirthRecord, DeathRecord, PersonId, PersonState, TraitKey, TurnBatch, TurnPersistence,
};
use duckdb::{Connection, Transaction, params};
use slotmap::Key;
use std::{
    sync::{Arc, Mutex, OnceLock, mpsc},
    thread,
};
use thiserror::Error;

const DEFAULT_TURN_BUFFER: usize = 32;
const DEFAULT_PERSON_BUFFER: usize = 1024;
const DEFAULT_METRIC_BUFFER: usize = 256;
const DEFAULT_LIFECYCLE_BUFFER: usize = 512;

const PERSON_COLUMNS: &[&str] = &[
    "turn",
    "person_id",
    "born",
    "age",
    "max_age",
    "alive",
    "stockpile",
    "need_per_turn",
    "stockpiling_need",
    "need_from_parent",
    "parent",
    "children",
    "relationships",
    "child_chance",
    "min_stockpile_for_breeding",
    "needs_source",
    "stockpile_source",
    "resources_available",
];

/// Storage error wrapper.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error("storage worker error: {0}")]
    Worker(String),
}

/// Summary row written to the `turns` table.
#[derive(Debug, Clone)]
struct TurnRow {
    turn: i64,
    population: i64,
    alive: i64,
    dead: i64,
    births: i64,
    deaths: i64,
    starved: i64,
    old_age: i64,
    total_stockpile: f64,
    total_resources: f64,
}

/// Metric row written to the `metrics` table.
#[derive(Debug, Clone)]
struct MetricRow {
    turn: i64,
    name: String,
    value: f64,
}

/// Per-person sample row.
#[derive(Debug, Clone)]
struct PersonRow {
    turn: i64,
    person_id: i64,
    born: i64,
    age: i64,
    max_age: i64,
    alive: bool,
    stockpile: f64,
    need_per_turn: f64,
    stockpiling_need: f64,
    need_from_parent: f64,
    parent: Option<i64>,
    children: i64,
    relationships: i64,
    child_chance: Option<f64>,
    min_stockpile_for_breeding: Option<f64>,
    needs_source: Option<&'static str>,
    stockpile_source: Option<&'static str>,
    resources_available: Option<f64>,
}

#[derive(Debug, Clone)]
struct BirthRow {
    turn: i64,
    person_id: i64,
    parent: Option<i64>,
}

#[derive(Debug, Clone)]
struct DeathRow {
    turn: i64,
    person_id: i64,
    age: i64,
    cause: &'static str,
}

/// Latest metric reading fetched for analytics displays.
#[derive(Debug, Clone)]
pub struct MetricReading {
    pub turn: i64,
    pub name: String,
    pub value: f64,
}

/// People ranked by average banked stockpile across recorded turns.
#[derive(Debug, Clone)]
pub struct StockpilerStats {
    pub person_id: u64,
    pub avg_stockpile: f64,
    pub last_turn: i64,
}

#[derive(Default)]
struct StorageBuffer {
    turns: Vec<TurnRow>,
    metrics: Vec<MetricRow>,
    people: Vec<PersonRow>,
    births: Vec<BirthRow>,
    deaths: Vec<DeathRow>,
}

impl StorageBuffer {
    fn is_empty(&self) -> bool {
        self.turns.is_empty()
            && self.metrics.is_empty()
            && self.people.is_empty()
            && self.births.is_empty()
            && self.deaths.is_empty()
    }

    fn clear(&mut self) {
        self.turns.clear();
        self.metrics.clear();
        self.people.clear();
        self.births.clear();
        self.deaths.clear();
    }
}

/// DuckDB-backed persistence sink with buffered writes.
pub struct Storage {
    conn: Connection,
    buffer: StorageBuffer,
    turn_flush_threshold: usize,
    person_flush_threshold: usize,
    metric_flush_threshold: usize,
    birth_flush_threshold: usize,
    death_flush_threshold: usize,
}

impl Storage {
    /// Open or create a DuckDB database at the provided path with default
    /// buffering thresholds.
    pub fn open(path: &str) -> Result<Self, StorageError> {
        Self::with_thresholds(
            path,
            DEFAULT_TURN_BUFFER,
            DEFAULT_PERSON_BUFFER,
            DEFAULT_METRIC_BUFFER,
        )
    }

    /// Override flush thresholds for turns, people, and metrics respectively.
    pub fn with_thresholds(
        path: &str,
        turn: usize,
        person: usize,
        metric: usize,
    ) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let mut storage = Self {
            conn,
            buffer: StorageBuffer::default(),
            turn_flush_threshold: turn,
            person_flush_threshold: person,
            metric_flush_threshold: metric,
            birth_flush_threshold: DEFAULT_LIFECYCLE_BUFFER,
            death_flush_threshold: DEFAULT_LIFECYCLE_BUFFER,
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    fn initialize_schema(&mut self) -> Result<(), StorageError> {
        self.conn.execute(
            "create table if not exists turns (
                turn bigint primary key,
                population integer,
                alive integer,
                dead integer,
                births integer,
                deaths integer,
                starved integer,
                old_age integer,
                total_stockpile double,
                total_resources double
            )",
            [],
        )?;
        self.conn.execute(
            "create table if not exists metrics (
                turn bigint,
                name text,
                value double,
                primary key (turn, name)
            )",
            [],
        )?;
        self.conn.execute(
            "create table if not exists people (
                turn bigint,
                person_id bigint,
                born bigint,
                age integer,
                max_age integer,
                alive boolean,
                stockpile double,
                need_per_turn double,
                stockpiling_need double,
                need_from_parent double,
                parent bigint,
                children integer,
                relationships integer,
                child_chance double,
                min_stockpile_for_breeding double,
                needs_source text,
                stockpile_source text,
                resources_available double,
                primary key (turn, person_id)
            )",
            [],
        )?;
        self.conn.execute(
            "create table if not exists births (
                turn bigint,
                person_id bigint,
                parent bigint,
                primary key (turn, person_id)
            )",
            [],
        )?;
        self.conn.execute(
            "create table if not exists deaths (
                turn bigint,
                person_id bigint,
                age integer,
                cause text,
                primary key (turn, person_id)
            )",
            [],
        )?;
        Ok(())
    }

    fn enqueue(&mut self, batch: &TurnBatch) -> Result<(), StorageError> {
        let summary = &batch.summary;
        let turn = summary.turn.0 as i64;

        self.buffer.turns.push(TurnRow {
            turn,
            population: summary.population as i64,
            alive: summary.alive as i64,
            dead: summary.dead as i64,
            births: summary.births as i64,
            deaths: summary.deaths as i64,
            starved: summary.starved as i64,
            old_age: summary.old_age as i64,
            total_stockpile: summary.total_stockpile,
            total_resources: summary.total_resources,
        });

        for metric in &batch.metrics {
            self.buffer.metrics.push(MetricRow {
                turn,
                name: metric.name.to_string(),
                value: metric.value,
            });
        }

        for state in &batch.people {
            self.buffer.people.push(person_row_from_state(turn, state));
        }

        for birth in &batch.births {
            self.buffer.births.push(birth_row_from_record(birth));
        }

        for death in &batch.deaths {
            self.buffer.deaths.push(death_row_from_record(death));
        }

        self.maybe_flush()?;
        Ok(())
    }

    /// Persist a turn batch, buffering until thresholds are met.
    pub fn persist(&mut self, batch: &TurnBatch) -> Result<(), StorageError> {
        self.enqueue(batch)
    }

    fn maybe_flush(&mut self) -> Result<(), StorageError> {
        if self.buffer.turns.len() >= self.turn_flush_threshold
            || self.buffer.metrics.len() >= self.metric_flush_threshold
            || self.buffer.people.len() >= self.person_flush_threshold
            || self.buffer.births.len() >= self.birth_flush_threshold
            || self.buffer.deaths.len() >= self.death_flush_threshold
        {
            self.flush()?;
        }
        Ok(())
    }

    fn insert_turns(tx: &Transaction<'_>, rows: &[TurnRow]) -> Result<(), duckdb::Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut stmt = tx.prepare(
            "insert or replace into turns (
                turn, population, alive, dead, births, deaths,
                starved, old_age, total_stockpile, total_resources
            ) values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        for row in rows {
            stmt.execute(params![
                row.turn,
                row.population,
                row.alive,
                row.dead,
                row.births,
                row.deaths,
                row.starved,
                row.old_age,
                row.total_stockpile,
                row.total_resources,
            ])?;
        }
        Ok(())
    }

    fn insert_metrics(tx: &Transaction<'_>, rows: &[MetricRow]) -> Result<(), duckdb::Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut stmt =
            tx.prepare("insert or replace into metrics (turn, name, value) values (?, ?, ?)")?;
        for row in rows {
            stmt.execute(params![row.turn, row.name, row.value])?;
        }
        Ok(())
    }

    fn insert_people(tx: &Transaction<'_>, rows: &[PersonRow]) -> Result<(), duckdb::Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut stmt = tx.prepare(Self::person_insert_sql())?;
        for row in rows {
            stmt.execute(params![
                row.turn,
                row.person_id,
                row.born,
                row.age,
                row.max_age,
                row.alive,
                row.stockpile,
                row.need_per_turn,
                row.stockpiling_need,
                row.need_from_parent,
                row.parent,
                row.children,
                row.relationships,
                row.child_chance,
                row.min_stockpile_for_breeding,
                row.needs_source,
                row.stockpile_source,
                row.resources_available,
            ])?;
        }
        Ok(())
    }

    fn person_insert_sql() -> &'static str {
        static SQL: OnceLock<String> = OnceLock::new();
        SQL.get_or_init(|| {
            let columns = PERSON_COLUMNS.join(", ");
            let placeholders = std::iter::repeat_n("?", PERSON_COLUMNS.len())
                .collect::<Vec<_>>()
                .join(", ");
            format!("insert or replace into people ({columns}) values ({placeholders})")
        })
    }

    fn insert_births(tx: &Transaction<'_>, rows: &[BirthRow]) -> Result<(), duckdb::Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut stmt = tx.prepare(
            "insert or replace into births (turn, person_id, parent) values (?, ?, ?)",
        )?;
        for row in rows {
            stmt.execute(params![row.turn, row.person_id, row.parent])?;
        }
        Ok(())
    }

    fn insert_deaths(tx: &Transaction<'_>, rows: &[DeathRow]) -> Result<(), duckdb::Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut stmt = tx.prepare(
            "insert or replace into deaths (turn, person_id, age, cause) values (?, ?, ?, ?)",
        )?;
        for row in rows {
            stmt.execute(params![row.turn, row.person_id, row.age, row.cause])?;
        }
        Ok(())
    }

    /// Force flush buffered records to disk.
    pub fn flush(&mut self) -> Result<(), StorageError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        Self::insert_turns(&tx, &self.buffer.turns)?;
        Self::insert_metrics(&tx, &self.buffer.metrics)?;
        Self::insert_people(&tx, &self.buffer.people)?;
        Self::insert_births(&tx, &self.buffer.births)?;
        Self::insert_deaths(&tx, &self.buffer.deaths)?;
        tx.commit()?;
        self.buffer.clear();
        Ok(())
    }

    /// Run database maintenance to optimize and compact storage.
    pub fn optimize(&mut self) -> Result<(), StorageError> {
        self.flush()?;
        self.conn.execute("PRAGMA optimize;", [])?;
        self.conn.execute("VACUUM;", [])?;
        Ok(())
    }

    /// Fetch the latest recorded metrics (ordered by name) up to `limit`.
    pub fn latest_metrics(&mut self, limit: usize) -> Result<Vec<MetricReading>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        self.flush()?;
        let mut stmt = self.conn.prepare("select max(turn) from metrics")?;
        let mut rows = stmt.query([])?;
        let latest_turn = match rows.next()? {
            Some(row) => row.get::<_, Option<i64>>(0)?,
            None => None,
        };
        drop(rows);

        let Some(turn) = latest_turn else {
            return Ok(Vec::new());
        };

        let mut metrics_stmt = self.conn.prepare(
            "select name, value
             from metrics
             where turn = ?
             order by name asc
             limit ?",
        )?;
        let mut metric_rows = metrics_stmt.query(params![turn, limit as i64])?;
        let mut readings = Vec::new();
        while let Some(row) = metric_rows.next()? {
            readings.push(MetricReading {
                turn,
                name: row.get(0)?,
                value: row.get(1)?,
            });
        }
        Ok(readings)
    }

    /// Total recorded deaths grouped by cause.
    pub fn death_cause_totals(&mut self) -> Result<Vec<(String, i64)>, StorageError> {
        self.flush()?;
        let mut stmt = self.conn.prepare(
            "select cause, count(*)
             from deaths
             group by cause
             order by cause asc",
        )?;
        let mut rows = stmt.query([])?;
        let mut totals = Vec::new();
        while let Some(row) = rows.next()? {
            totals.push((row.get(0)?, row.get(1)?));
        }
        Ok(totals)
    }

    /// People ranked by average banked stockpile across all recorded turns.
    pub fn top_stockpilers(&mut self, limit: usize) -> Result<Vec<StockpilerStats>, StorageError> {
        self.flush()?;
        let mut stmt = self.conn.prepare(
            "select person_id,
                    avg(stockpile) as avg_stockpile,
                    max(turn) as last_turn
             from people
             group by person_id
             order by avg_stockpile desc
             limit ?",
        )?;
        let mut rows = stmt.query(params![limit as i64])?;
        let mut stats = Vec::with_capacity(limit.min(16));
        while let Some(row) = rows.next()? {
            stats.push(StockpilerStats {
                person_id: row.get::<_, i64>(0)? as u64,
                avg_stockpile: row.get(1)?,
                last_turn: row.get(2)?,
            });
        }
        Ok(stats)
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            eprintln!("failed to flush persistence buffer on drop: {err}");
        }
    }
}

impl TurnPersistence for Storage {
    fn on_turn(&mut self, batch: &TurnBatch) {
        if let Err(err) = self.persist(batch) {
            eprintln!(
                "failed to enqueue persistence data for turn {}: {err}",
                batch.summary.turn.0
            );
        }
    }
}

/// Shared handle over a mutex-guarded store, usable as a persistence sink
/// while analytics queries borrow the same storage.
pub struct SharedStorage {
    inner: Arc<Mutex<Storage>>,
}

impl SharedStorage {
    #[must_use]
    pub fn new(inner: Arc<Mutex<Storage>>) -> Self {
        Self { inner }
    }
}

impl TurnPersistence for SharedStorage {
    fn on_turn(&mut self, batch: &TurnBatch) {
        match self.inner.lock() {
            Ok(mut storage) => {
                if let Err(err) = storage.persist(batch) {
                    eprintln!(
                        "failed to enqueue persistence data for turn {}: {err}",
                        batch.summary.turn.0
                    );
                }
            }
            Err(poisoned) => {
                eprintln!(
                    "storage mutex poisoned while persisting turn {}",
                    batch.summary.turn.0
                );
                let mut storage = poisoned.into_inner();
                if let Err(err) = storage.persist(batch) {
                    eprintln!(
                        "failed to persist turn {} after poison: {err}",
                        batch.summary.turn.0
                    );
                }
            }
        }
    }
}

#[derive(Debug)]
enum StorageCommand {
    Persist(TurnBatch),
    Flush,
    Shutdown,
}

/// Asynchronous persistence pipeline backed by a worker thread.
pub struct StoragePipeline {
    tx: mpsc::Sender<StorageCommand>,
    storage: Arc<Mutex<Storage>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StoragePipeline {
    /// Create an asynchronous pipeline using default buffering thresholds.
    pub fn new(path: &str) -> Result<Self, StorageError> {
        Self::with_thresholds(
            path,
            DEFAULT_TURN_BUFFER,
            DEFAULT_PERSON_BUFFER,
            DEFAULT_METRIC_BUFFER,
        )
    }

    /// Create an asynchronous pipeline with explicit thresholds.
    pub fn with_thresholds(
        path: &str,
        turn: usize,
        person: usize,
        metric: usize,
    ) -> Result<Self, StorageError> {
        let storage = Storage::with_thresholds(path, turn, person, metric)?;
        Self::from_storage(storage)
    }

    fn from_storage(storage: Storage) -> Result<Self, StorageError> {
        let shared = Arc::new(Mutex::new(storage));
        let (tx, rx) = mpsc::channel::<StorageCommand>();
        let worker_storage = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("commons-storage-worker".into())
            .spawn(move || {
                while let Ok(command) = rx.recv() {
                    match command {
                        StorageCommand::Persist(batch) => match worker_storage.lock() {
                            Ok(mut storage) => {
                                if let Err(err) = storage.persist(&batch) {
                                    eprintln!(
                                        "failed to persist turn {} asynchronously: {err}",
                                        batch.summary.turn.0
                                    );
                                }
                            }
                            Err(poisoned) => {
                                eprintln!(
                                    "storage mutex poisoned while persisting turn {}",
                                    batch.summary.turn.0
                                );
                                let mut storage = poisoned.into_inner();
                                if let Err(err) = storage.persist(&batch) {
                                    eprintln!(
                                        "failed to persist turn {} after poison: {err}",
                                        batch.summary.turn.0
                                    );
                                }
                            }
                        },
                        StorageCommand::Flush => {
                            if let Ok(mut storage) = worker_storage.lock()
                                && let Err(err) = storage.flush()
                            {
                                eprintln!("failed to flush storage: {err}");
                            }
                        }
                        StorageCommand::Shutdown => {
                            if let Ok(mut storage) = worker_storage.lock() {
                                let _ = storage.flush();
                            }
                            break;
                        }
                    }
                }
            })
            .map_err(|err| {
                StorageError::Worker(format!("failed to spawn storage worker thread: {err}"))
            })?;

        Ok(Self {
            tx,
            storage: shared,
            handle: Some(handle),
        })
    }

    /// Exposes shared access to the underlying storage for analytics queries.
    #[must_use]
    pub fn storage(&self) -> Arc<Mutex<Storage>> {
        Arc::clone(&self.storage)
    }

    /// Request an immediate flush of buffered records.
    pub fn flush(&self) {
        let _ = self.tx.send(StorageCommand::Flush);
    }
}

impl TurnPersistence for StoragePipeline {
    fn on_turn(&mut self, batch: &TurnBatch) {
        if self
            .tx
            .send(StorageCommand::Persist(batch.clone()))
            .is_err()
        {
            eprintln!(
                "storage worker channel closed; turn {} dropped",
                batch.summary.turn.0
            );
        }
    }
}

impl Drop for StoragePipeline {
    fn drop(&mut self) {
        let _ = self.tx.send(StorageCommand::Shutdown);
        if let Some(handle) = self.handle.take()
            && let Err(err) = handle.join()
        {
            eprintln!("storage worker thread panicked: {err:?}");
        }
    }
}

fn key_to_i64(id: PersonId) -> i64 {
    id.data().as_ffi() as i64
}

fn optional_person_id(id: Option<PersonId>) -> Option<i64> {
    id.map(key_to_i64)
}

fn person_row_from_state(turn: i64, state: &PersonState) -> PersonRow {
    let person = &state.person;
    PersonRow {
        turn,
        person_id: key_to_i64(state.id),
        born: person.born.0 as i64,
        age: i64::from(person.age),
        max_age: i64::from(person.max_age),
        alive: person.alive,
        stockpile: person.stockpile,
        need_per_turn: person.need_per_turn,
        stockpiling_need: person.stockpiling_need,
        need_from_parent: person.need_from_parent,
        parent: optional_person_id(person.parent),
        children: person.children.len() as i64,
        relationships: person.relationships.len() as i64,
        child_chance: person.traits.override_value(TraitKey::ChildChance),
        min_stockpile_for_breeding: person
            .traits
            .override_value(TraitKey::MinStockpileForBreeding),
        needs_source: person.needs_source.map(|source| source.as_str()),
        stockpile_source: person.stockpile_source.map(|source| source.as_str()),
        resources_available: person.resources_available,
    }
}

fn birth_row_from_record(record: &BirthRecord) -> BirthRow {
    BirthRow {
        turn: record.turn.0 as i64,
        person_id: key_to_i64(record.id),
        parent: optional_person_id(record.parent),
    }
}

fn death_row_from_record(record: &DeathRecord) -> DeathRow {
    DeathRow {
        turn: record.turn.0 as i64,
        person_id: key_to_i64(record.id),
        age: i64::from(record.age),
        cause: record.cause.as_str(),
    }
}
