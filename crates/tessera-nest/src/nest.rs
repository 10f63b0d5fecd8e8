//! Nest: routes records through every GROUP BY index and level.

use crate::column::GroupByCol;
use crate::level::NestLevel;
use crate::minipage::{MiniPage, MiniPageMut};
use crate::nest_idx::{AccessMode, NestIdx};
use std::sync::Arc;
use tessera_common::{NestConfig, Result, TesseraError, Value};
use tessera_storage::{DirectPath, Record, ScanDirection, Schema, SearchPath};
use tracing::{debug, trace, warn};

/// Counters returned by `Nest::input`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputStats {
    /// Levels whose group state absorbed the record.
    pub levels_updated: usize,
    /// Aggregate inputs left out of their group.
    pub skipped_columns: usize,
    /// Levels that ignored the record entirely.
    pub skipped_levels: usize,
}

/// One materialized group.
#[derive(Debug, Clone)]
pub struct NestRow {
    /// Name of the level that produced the row.
    pub level: String,
    pub record: Record,
}

/// A set of GROUP BY indexes and the levels aggregating into them.
///
/// Indexes and levels are declared up front; the first `input` call closes
/// the declaration phase.
pub struct Nest {
    config: NestConfig,
    indexes: Vec<NestIdx>,
    levels: Vec<NestLevel>,
    /// Output schema of each level, built on attach.
    schemas: Vec<Arc<Schema>>,
    path: Box<dyn SearchPath>,
    started: bool,
}

impl Nest {
    pub fn new(config: NestConfig) -> Result<Self> {
        Self::with_search_path(config, Box::new(DirectPath))
    }

    /// Creates a nest that resolves record fields through `path`.
    pub fn with_search_path(config: NestConfig, path: Box<dyn SearchPath>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            indexes: Vec::new(),
            levels: Vec::new(),
            schemas: Vec::new(),
            path,
            started: false,
        })
    }

    pub fn config(&self) -> &NestConfig {
        &self.config
    }

    pub fn indexes(&self) -> &[NestIdx] {
        &self.indexes
    }

    pub fn levels(&self) -> &[NestLevel] {
        &self.levels
    }

    pub fn index(&self, name: &str) -> Option<&NestIdx> {
        self.indexes.iter().find(|i| i.name() == name)
    }

    pub fn level(&self, name: &str) -> Option<&NestLevel> {
        self.levels.iter().find(|l| l.name() == name)
    }

    fn check_open(&self) -> Result<()> {
        if self.started {
            return Err(TesseraError::ConfigError(
                "nest already received input".to_string(),
            ));
        }
        Ok(())
    }

    /// Declares an index grouping on `columns`.
    pub fn add_index(&mut self, name: impl Into<String>, columns: Vec<GroupByCol>) -> Result<()> {
        self.check_open()?;
        let name = name.into();
        if self.index(&name).is_some() {
            return Err(TesseraError::ConfigError(format!("duplicate nest index {name}")));
        }
        let idx = NestIdx::new(name, columns, self.config.clone())?;
        debug!(index = idx.name(), columns = idx.columns().len(), "added nest index");
        self.indexes.push(idx);
        Ok(())
    }

    /// Attaches `level` to the index called `index_name`. Returns the
    /// level's position.
    pub fn add_level(&mut self, index_name: &str, mut level: NestLevel) -> Result<usize> {
        self.check_open()?;
        if self.level(level.name()).is_some() {
            return Err(TesseraError::ConfigError(format!(
                "duplicate nest level {}",
                level.name()
            )));
        }
        let index = self
            .indexes
            .iter()
            .position(|i| i.name() == index_name)
            .ok_or_else(|| TesseraError::ConfigError(format!("unknown nest index {index_name}")))?;
        let id = u16::try_from(self.levels.len())
            .map_err(|_| TesseraError::ConfigError("too many nest levels".to_string()))?;
        level.attach(id, index, &self.indexes[index])?;

        let pos = self.levels.len();
        self.indexes[index].attach(pos);
        self.schemas.push(Arc::new(Schema::new(level.output_names())));
        debug!(level = level.name(), index = index_name, id, "added nest level");
        self.levels.push(level);
        Ok(pos)
    }

    /// Aggregates one record into every level.
    ///
    /// Unresolvable fields, failed transforms, type mismatches and full
    /// mini-pages are logged and counted; only invariant violations fail
    /// the call.
    pub fn input(&mut self, record: &Record) -> Result<InputStats> {
        self.started = true;
        let mut stats = InputStats::default();
        let path: &dyn SearchPath = &*self.path;

        for idx in self.indexes.iter_mut() {
            if idx.levels().is_empty() {
                continue;
            }
            let mut key_values = Vec::with_capacity(idx.columns().len());
            for col in idx.columns() {
                match col.resolve(record, path) {
                    Ok(value) => key_values.push(Some(value)),
                    Err(e) if e.is_recoverable() => {
                        warn!(index = idx.name(), column = col.name(), error = %e, "group-by column unresolved");
                        stats.skipped_columns += 1;
                        key_values.push(None);
                    }
                    Err(e) => return Err(e),
                }
            }

            let full: Vec<Value> = key_values
                .iter()
                .map(|v| v.clone().unwrap_or(Value::Null))
                .collect();
            if let Err(e) = idx.bind(&full) {
                if !e.is_recoverable() {
                    return Err(e);
                }
                warn!(index = idx.name(), error = %e, "cannot type nest index; skipping record");
                stats.skipped_levels += idx.levels().len();
                continue;
            }
            if key_values.iter().all(Option::is_some) {
                match idx.upsert_full(&full) {
                    Ok(_) => {}
                    Err(e) if e.is_recoverable() => {
                        warn!(index = idx.name(), error = %e, "cannot store record key");
                    }
                    Err(e) => return Err(e),
                }
            }

            for &pos in idx.levels().to_vec().iter() {
                let level = self
                    .levels
                    .get_mut(pos)
                    .ok_or_else(|| TesseraError::Internal(format!("no nest level {pos}")))?;
                level.input(idx, &key_values, record, path, &mut stats)?;
            }
        }
        trace!(?stats, "nest input");
        Ok(stats)
    }

    /// Produces one row per group of every level, index by index in key
    /// order.
    pub fn materialize(&self, direction: ScanDirection) -> Result<Vec<NestRow>> {
        let mut rows = Vec::new();
        for idx in &self.indexes {
            idx.scan_all(direction, |key, value| {
                let page = MiniPage::open(value)?;
                for &pos in idx.levels() {
                    let level = &self.levels[pos];
                    if let Some(values) = level.output_row(key, &page)? {
                        rows.push(NestRow {
                            level: level.name().to_string(),
                            record: Record::new(self.schemas[pos].clone(), values),
                        });
                    }
                }
                Ok(())
            })?;
        }
        Ok(rows)
    }

    /// Produces the rows of the level called `name`.
    pub fn materialize_level(&self, name: &str, direction: ScanDirection) -> Result<Vec<Record>> {
        let pos = self.level_position(name)?;
        let level = &self.levels[pos];
        let mut rows = Vec::new();
        self.indexes[level.index()].scan_all(direction, |key, value| {
            if let Some(values) = level.output_row(key, &MiniPage::open(value)?)? {
                rows.push(Record::new(self.schemas[pos].clone(), values));
            }
            Ok(())
        })?;
        Ok(rows)
    }

    /// Removes the group `keys` of level `name` and returns its final row.
    ///
    /// The index entry is deleted once no level keeps state in it, unless
    /// it is the entry of a complete record key.
    pub fn remove_group(&mut self, name: &str, keys: &[Value]) -> Result<Option<Record>> {
        let pos = self.level_position(name)?;
        let level = &self.levels[pos];
        if keys.len() != level.key_positions().len() {
            return Err(TesseraError::InvalidParameter {
                name: "keys".to_string(),
                value: format!("{} values for {} columns", keys.len(), level.key_positions().len()),
            });
        }
        let idx = &mut self.indexes[level.index()];
        let access = idx.access(level.key_positions(), keys, AccessMode::FETCH)?;
        let Some(data) = access.data else {
            return Ok(None);
        };
        let mut page = MiniPageMut::open(data)?;
        let Some(results) = level.remove_group(&mut page)? else {
            return Ok(None);
        };
        let view = page.view();
        if view.is_empty() && !view.is_full_key() {
            idx.access(level.key_positions(), keys, AccessMode::DELETE)?;
            trace!(level = name, "deleted empty group entry");
        }
        let mut values = keys.to_vec();
        values.extend(results);
        Ok(Some(Record::new(self.schemas[pos].clone(), values)))
    }

    fn level_position(&self, name: &str) -> Result<usize> {
        self.levels
            .iter()
            .position(|l| l.name() == name)
            .ok_or_else(|| TesseraError::ConfigError(format!("unknown nest level {name}")))
    }
}

impl std::fmt::Debug for Nest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nest")
            .field("config", &self.config)
            .field("indexes", &self.indexes)
            .field("levels", &self.levels)
            .finish()
    }
}
