//! NestLevel: one GROUP BY with its aggregate columns.
//!
//! Each aggregate column is bound on its own. COUNT and COUNT(*) bind when
//! the level is attached; every other column binds on its first non-NULL
//! input, whose type picks the accumulator and therefore the state width.
//! A group owns one region per bound column in the mini-page of its index
//! entry, keyed by `(level id, column)`. Columns that bind after a group
//! was created get their region the next time that group is reached.

use crate::accum::Accumulator;
use crate::column::NestAggCol;
use crate::minipage::{MiniPage, MiniPageMut, region_footprint};
use crate::nest::InputStats;
use crate::nest_idx::{AccessMode, NestIdx};
use tessera_common::{Result, TesseraError, TypeId, Value};
use tessera_storage::{Record, SearchPath};
use tracing::{debug, trace, warn};

/// Accumulator bound to a concrete input type.
pub struct BoundColumn {
    pub accumulator: Box<dyn Accumulator>,
    /// State bytes, as reported by the accumulator.
    pub size: usize,
    pub input_type: TypeId,
}

/// State layout of a level, one slot per aggregate column.
#[derive(Default)]
pub struct LevelLayout {
    pub columns: Vec<Option<BoundColumn>>,
}

impl LevelLayout {
    /// Mini-page bytes one group needs for the columns bound so far.
    pub fn footprint(&self) -> usize {
        self.columns
            .iter()
            .flatten()
            .map(|c| region_footprint(c.size))
            .sum()
    }

    pub fn is_complete(&self) -> bool {
        self.columns.iter().all(Option::is_some)
    }
}

pub struct NestLevel {
    id: u16,
    name: String,
    group_by: Vec<String>,
    aggregates: Vec<NestAggCol>,
    /// Position of the NestIdx this level is attached to.
    index: usize,
    /// Index column of each group-by column.
    key_positions: Vec<usize>,
    layout: LevelLayout,
}

impl NestLevel {
    /// Declares a level grouping on the index columns named `group_by`.
    pub fn new<I, S>(name: impl Into<String>, group_by: I, aggregates: Vec<NestAggCol>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: 0,
            name: name.into(),
            group_by: group_by.into_iter().map(Into::into).collect(),
            aggregates,
            index: 0,
            key_positions: Vec::new(),
            layout: LevelLayout::default(),
        }
    }

    /// Attaches the level to `idx`, which sits at position `index`, and
    /// binds the columns that do not depend on an input type.
    pub(crate) fn attach(&mut self, id: u16, index: usize, idx: &NestIdx) -> Result<()> {
        if self.aggregates.is_empty() {
            return Err(TesseraError::ConfigError(format!(
                "level {} has no aggregate columns",
                self.name
            )));
        }
        let mut positions = Vec::with_capacity(self.group_by.len());
        for name in &self.group_by {
            let pos = idx.position(name).ok_or_else(|| {
                TesseraError::ConfigError(format!(
                    "level {}: index {} has no column {}",
                    self.name,
                    idx.name(),
                    name
                ))
            })?;
            if positions.contains(&pos) {
                return Err(TesseraError::ConfigError(format!(
                    "level {}: column {} grouped twice",
                    self.name, name
                )));
            }
            positions.push(pos);
        }
        let mut columns = Vec::with_capacity(self.aggregates.len());
        for agg in &self.aggregates {
            columns.push(if agg.factory().needs_input_type() {
                None
            } else {
                Some(bind_column(agg, TypeId::Null)?)
            });
        }
        self.id = id;
        self.index = index;
        self.key_positions = positions;
        self.layout = LevelLayout { columns };
        Ok(())
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group_by(&self) -> &[String] {
        &self.group_by
    }

    pub fn aggregates(&self) -> &[NestAggCol] {
        &self.aggregates
    }

    /// Position of the index in its nest.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn key_positions(&self) -> &[usize] {
        &self.key_positions
    }

    pub fn layout(&self) -> &LevelLayout {
        &self.layout
    }

    /// True once every aggregate column has an accumulator.
    pub fn is_bound(&self) -> bool {
        !self.layout.columns.is_empty() && self.layout.is_complete()
    }

    /// Column names of the rows this level produces: group-by columns
    /// followed by aggregates.
    pub fn output_names(&self) -> Vec<String> {
        self.group_by
            .iter()
            .cloned()
            .chain(self.aggregates.iter().map(|a| a.name().to_string()))
            .collect()
    }

    fn resolve_inputs(
        &self,
        record: &Record,
        path: &dyn SearchPath,
        stats: &mut InputStats,
    ) -> Result<Vec<Option<Value>>> {
        self.aggregates
            .iter()
            .map(|agg| match agg.resolve(record, path) {
                Ok(value) => Ok(Some(value)),
                Err(e) if e.is_recoverable() => {
                    warn!(level = %self.name, column = agg.name(), error = %e, "skipping aggregate input");
                    stats.skipped_columns += 1;
                    Ok(None)
                }
                Err(e) => Err(e),
            })
            .collect()
    }

    /// Binds every unbound column whose input carries a type.
    fn bind_pending(&mut self, inputs: &[Option<Value>], stats: &mut InputStats) -> Result<()> {
        for (item, (agg, input)) in self.aggregates.iter().zip(inputs).enumerate() {
            let Some(value) = input else {
                continue;
            };
            if value.is_null() || self.layout.columns[item].is_some() {
                continue;
            }
            match bind_column(agg, value.type_id()) {
                Ok(column) => {
                    debug!(
                        level = %self.name,
                        column = agg.name(),
                        input_type = %column.input_type,
                        size = column.size,
                        "bound aggregate column"
                    );
                    self.layout.columns[item] = Some(column);
                }
                Err(e) if e.is_recoverable() => {
                    warn!(level = %self.name, column = agg.name(), error = %e, "cannot bind aggregate column");
                    stats.skipped_columns += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Feeds one record into the group it belongs to.
    ///
    /// `key_values` holds the resolved value of every index column, None
    /// where resolution failed. Only an unresolved group key or an index
    /// failure skips the level; problems with single aggregate inputs skip
    /// just those columns. Everything skipped is logged and counted.
    pub(crate) fn input(
        &mut self,
        idx: &mut NestIdx,
        key_values: &[Option<Value>],
        record: &Record,
        path: &dyn SearchPath,
        stats: &mut InputStats,
    ) -> Result<()> {
        let mut keys = Vec::with_capacity(self.key_positions.len());
        for (&pos, name) in self.key_positions.iter().zip(&self.group_by) {
            match key_values.get(pos) {
                Some(Some(value)) => keys.push(value.clone()),
                _ => {
                    warn!(level = %self.name, column = %name, "group-by column unresolved; skipping record");
                    stats.skipped_levels += 1;
                    return Ok(());
                }
            }
        }

        let inputs = self.resolve_inputs(record, path, stats)?;
        self.bind_pending(&inputs, stats)?;
        if self.layout.columns.iter().all(Option::is_none) {
            trace!(level = %self.name, "no aggregate column bound yet");
            return Ok(());
        }

        let access = match idx.access(&self.key_positions, &keys, AccessMode::UPSERT) {
            Ok(access) => access,
            Err(e) if e.is_recoverable() => {
                warn!(level = %self.name, error = %e, "cannot store group; skipping record");
                stats.skipped_levels += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let inserted = access.inserted;
        let data = access
            .data
            .ok_or_else(|| TesseraError::Internal("upsert returned no value".to_string()))?;

        let mut page = MiniPageMut::open(data)?;
        if self.feed(&mut page, &inputs, stats)? {
            stats.levels_updated += 1;
            return Ok(());
        }
        warn!(level = %self.name, "no room for group state; skipping record");
        stats.skipped_levels += 1;
        let empty = page.view().is_empty();
        if inserted && empty {
            idx.access(&self.key_positions, &keys, AccessMode::DELETE)?;
        }
        Ok(())
    }

    /// Adds missing regions for bound columns, then folds `inputs` into
    /// them. Returns false if the group has no state at all.
    fn feed(
        &self,
        page: &mut MiniPageMut<'_>,
        inputs: &[Option<Value>],
        stats: &mut InputStats,
    ) -> Result<bool> {
        let existed = page.view().has_level(self.id);
        for (item, column) in self.layout.columns.iter().enumerate() {
            let Some(column) = column else {
                continue;
            };
            if page.value(self.id, item as u16).is_some() {
                continue;
            }
            match page.add(self.id, item as u16, column.size) {
                Ok(region) => column.accumulator.initialize(region),
                Err(e) if e.is_recoverable() => {
                    warn!(
                        level = %self.name,
                        column = self.aggregates[item].name(),
                        error = %e,
                        "no room for aggregate column"
                    );
                    stats.skipped_columns += 1;
                }
                Err(e) => return Err(e),
            }
        }
        if !page.view().has_level(self.id) {
            return Ok(false);
        }
        if !existed {
            trace!(level = %self.name, "created group");
        }

        for (item, (column, input)) in self.layout.columns.iter().zip(inputs).enumerate() {
            let (Some(column), Some(value)) = (column, input) else {
                continue;
            };
            let Some(region) = page.value_mut(self.id, item as u16) else {
                continue;
            };
            if let Err(e) = column.accumulator.input(region, value) {
                if !e.is_recoverable() {
                    return Err(e);
                }
                warn!(
                    level = %self.name,
                    column = self.aggregates[item].name(),
                    error = %e,
                    "skipping aggregate input"
                );
                stats.skipped_columns += 1;
            }
        }
        Ok(true)
    }

    /// Current value of every aggregate column of the group in `page`.
    /// Columns without state read as NULL.
    fn results(&self, page: &MiniPage<'_>) -> Result<Vec<Value>> {
        self.layout
            .columns
            .iter()
            .enumerate()
            .map(|(item, column)| match (column, page.value(self.id, item as u16)) {
                (Some(column), Some(region)) => column.accumulator.result(region),
                _ => Ok(Value::Null),
            })
            .collect()
    }

    /// Builds the output row of the group stored under `key`, or None if
    /// this level has no state in `page`.
    pub(crate) fn output_row(&self, key: &[Value], page: &MiniPage<'_>) -> Result<Option<Vec<Value>>> {
        if !page.has_level(self.id) {
            return Ok(None);
        }
        let mut row = Vec::with_capacity(self.key_positions.len() + self.aggregates.len());
        for &pos in &self.key_positions {
            let value = key
                .get(pos)
                .ok_or_else(|| TesseraError::Internal(format!("key has no column {pos}")))?;
            row.push(value.clone());
        }
        row.extend(self.results(page)?);
        Ok(Some(row))
    }

    /// Finalizes the group in `page` and removes its regions. Returns the
    /// group's last aggregate values.
    pub(crate) fn remove_group(&self, page: &mut MiniPageMut<'_>) -> Result<Option<Vec<Value>>> {
        if !page.view().has_level(self.id) {
            return Ok(None);
        }
        let results = self.results(&page.view())?;
        for (item, column) in self.layout.columns.iter().enumerate() {
            if let (Some(column), Some(region)) = (column, page.value_mut(self.id, item as u16)) {
                column.accumulator.finalize(region);
            }
            page.remove(self.id, item as u16);
        }
        trace!(level = %self.name, "removed group");
        Ok(Some(results))
    }
}

fn bind_column(agg: &NestAggCol, input_type: TypeId) -> Result<BoundColumn> {
    let accumulator = agg.factory().bind(input_type)?;
    Ok(BoundColumn {
        size: accumulator.size(),
        accumulator,
        input_type,
    })
}

impl std::fmt::Debug for NestLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NestLevel")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("group_by", &self.group_by)
            .field("aggregates", &self.aggregates)
            .field(
                "bound",
                &self
                    .layout
                    .columns
                    .iter()
                    .map(Option::is_some)
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}
