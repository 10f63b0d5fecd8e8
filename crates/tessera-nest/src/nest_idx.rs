//! NestIdx: a GROUP BY index shared by one or more nest levels.
//!
//! The index key is the full list of group-by columns. A level that groups
//! on a subset of them addresses the index with NULL in every column it
//! does not use, so `(time)` and `(time, sensor)` groups live side by side
//! in one tree. Every leaf value is a mini-page holding the accumulator
//! state of all levels that reached that key.

use crate::column::GroupByCol;
use crate::minipage::{self, MiniPageMut};
use std::ops::BitOr;
use tessera_common::config::MAX_KEY_COLUMNS;
use tessera_common::{NestConfig, Result, TesseraError, TypeId, Value};
use tessera_storage::{BTreeIndex, KeyColumn, ScanDirection, key_of};
use tracing::debug;

/// Access mode flags for `NestIdx::access`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessMode(u16);

impl AccessMode {
    pub const FETCH: AccessMode = AccessMode(1);
    pub const INSERT: AccessMode = AccessMode(2);
    pub const DELETE: AccessMode = AccessMode(4);
    /// Fetch the entry, inserting it first if absent.
    pub const UPSERT: AccessMode = AccessMode(1 | 2);

    pub fn contains(&self, other: AccessMode) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for AccessMode {
    type Output = AccessMode;

    fn bitor(self, rhs: AccessMode) -> AccessMode {
        AccessMode(self.0 | rhs.0)
    }
}

/// Result of one `NestIdx::access` call.
#[derive(Debug, Default)]
pub struct NestIdxAccess<'a> {
    /// The key was present when the call started.
    pub exists: bool,
    /// The key was inserted by this call.
    pub inserted: bool,
    /// The key was deleted by this call.
    pub deleted: bool,
    /// Mini-page bytes of the entry, for fetch and insert access.
    pub data: Option<&'a mut [u8]>,
}

/// A named GROUP BY index.
pub struct NestIdx {
    name: String,
    columns: Vec<GroupByCol>,
    config: NestConfig,
    /// Created from the first record routed to the index.
    index: Option<BTreeIndex>,
    /// Positions of the nest levels attached to this index.
    levels: Vec<usize>,
}

impl NestIdx {
    /// Creates an unbound index over `columns`.
    pub fn new(name: impl Into<String>, columns: Vec<GroupByCol>, config: NestConfig) -> Result<Self> {
        let name = name.into();
        config.validate()?;
        if columns.is_empty() {
            return Err(TesseraError::ConfigError(format!(
                "nest index {name} has no columns"
            )));
        }
        if columns.len() > MAX_KEY_COLUMNS {
            return Err(TesseraError::TooManyColumns {
                max: MAX_KEY_COLUMNS,
            });
        }
        for (i, col) in columns.iter().enumerate() {
            if columns[..i].iter().any(|c| c.name() == col.name()) {
                return Err(TesseraError::ConfigError(format!(
                    "nest index {name} has duplicate column {}",
                    col.name()
                )));
            }
        }
        Ok(Self {
            name,
            columns,
            config,
            index: None,
            levels: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[GroupByCol] {
        &self.columns
    }

    /// Position of the column called `name`.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name() == name)
    }

    pub fn levels(&self) -> &[usize] {
        &self.levels
    }

    pub(crate) fn attach(&mut self, level: usize) {
        self.levels.push(level);
    }

    pub fn is_bound(&self) -> bool {
        self.index.is_some()
    }

    /// The underlying tree, once bound.
    pub fn index(&self) -> Option<&BTreeIndex> {
        self.index.as_ref()
    }

    /// Number of distinct keys stored.
    pub fn len(&self) -> usize {
        self.index.as_ref().map_or(0, BTreeIndex::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Types the key columns after `values`, creating the tree on the first
    /// call.
    ///
    /// A column first seen as NULL is typed `TypeId::Null` and holds only
    /// NULL keys. The first non-NULL value for it retypes the column; the
    /// tree is rebuilt with its entries carried over, which is cheap since
    /// all of them still have NULL in that column.
    pub fn bind(&mut self, values: &[Value]) -> Result<()> {
        if values.len() != self.columns.len() {
            return Err(TesseraError::InvalidParameter {
                name: "key".to_string(),
                value: format!("{} of {} columns", values.len(), self.columns.len()),
            });
        }
        let Some(index) = self.index.as_ref() else {
            let types: Vec<TypeId> = values.iter().map(Value::type_id).collect();
            self.index = Some(self.new_tree(&types)?);
            debug!(index = %self.name, columns = ?types, "bound nest index");
            return Ok(());
        };

        let current: Vec<TypeId> = index.schema().columns().iter().map(|c| c.type_id).collect();
        let widened: Vec<TypeId> = current
            .iter()
            .zip(values)
            .map(|(&ty, value)| if ty == TypeId::Null { value.type_id() } else { ty })
            .collect();
        if widened == current {
            return Ok(());
        }
        let mut entries = Vec::with_capacity(index.len());
        self.scan_all(ScanDirection::Forward, |key, value| {
            entries.push((key.to_vec(), value.to_vec()));
            Ok(())
        })?;
        let mut rebuilt = self.new_tree(&widened)?;
        for (key, value) in entries {
            rebuilt.insert(&key_of(key))?.copy_from_slice(&value);
        }
        debug!(
            index = %self.name,
            from = ?current,
            to = ?widened,
            entries = rebuilt.len(),
            "retyped nest index"
        );
        self.index = Some(rebuilt);
        Ok(())
    }

    fn new_tree(&self, types: &[TypeId]) -> Result<BTreeIndex> {
        let mut index = BTreeIndex::new(self.config.index_config())?;
        for (col, &ty) in self.columns.iter().zip(types) {
            index.add_column(KeyColumn::by_value(col.name(), ty))?;
        }
        Ok(index)
    }

    /// Upserts the entry for a complete record key and flags it as such.
    /// Returns true if the entry is new.
    pub fn upsert_full(&mut self, values: &[Value]) -> Result<bool> {
        let cols: Vec<usize> = (0..self.columns.len()).collect();
        let access = self.access(&cols, values, AccessMode::UPSERT)?;
        let data = access
            .data
            .ok_or_else(|| TesseraError::Internal("upsert returned no value".to_string()))?;
        MiniPageMut::open(data)?.mark_full_key();
        Ok(access.inserted)
    }

    /// Builds a full key from the values of columns `cols`. Columns not
    /// named get NULL.
    fn full_key(&self, cols: &[usize], keys: &[Value]) -> Result<Vec<Value>> {
        if cols.len() != keys.len() {
            return Err(TesseraError::InvalidParameter {
                name: "keys".to_string(),
                value: format!("{} values for {} columns", keys.len(), cols.len()),
            });
        }
        let mut full = vec![Value::Null; self.columns.len()];
        for (&col, key) in cols.iter().zip(keys) {
            let slot = full.get_mut(col).ok_or_else(|| TesseraError::InvalidParameter {
                name: "column".to_string(),
                value: col.to_string(),
            })?;
            *slot = key.clone();
        }
        Ok(full)
    }

    /// Looks up, inserts or deletes the entry addressed by `cols`/`keys`.
    ///
    /// `FETCH | INSERT` returns the existing mini-page or a freshly
    /// initialized one. `INSERT` alone reports `exists` without data when
    /// the key is taken. `DELETE` cannot be combined with other modes.
    pub fn access(&mut self, cols: &[usize], keys: &[Value], mode: AccessMode) -> Result<NestIdxAccess<'_>> {
        if mode.is_empty() || (mode.contains(AccessMode::DELETE) && mode != AccessMode::DELETE) {
            return Err(TesseraError::InvalidAccess(format!("access mode {:#x}", mode.0)));
        }
        let full = key_of(self.full_key(cols, keys)?);
        let Some(index) = self.index.as_mut() else {
            if mode.contains(AccessMode::INSERT) {
                return Err(TesseraError::InvalidAccess(format!(
                    "nest index {} is not bound",
                    self.name
                )));
            }
            return Ok(NestIdxAccess::default());
        };

        if mode == AccessMode::DELETE {
            let deleted = index.delete(&full)?;
            return Ok(NestIdxAccess {
                exists: deleted,
                deleted,
                ..Default::default()
            });
        }

        if mode.contains(AccessMode::INSERT) {
            if mode.contains(AccessMode::FETCH) {
                let upsert = index.upsert(&full)?;
                if upsert.inserted {
                    minipage::initialize(upsert.value)?;
                }
                return Ok(NestIdxAccess {
                    exists: !upsert.inserted,
                    inserted: upsert.inserted,
                    deleted: false,
                    data: Some(upsert.value),
                });
            }
            return match index.insert(&full) {
                Ok(value) => {
                    minipage::initialize(value)?;
                    Ok(NestIdxAccess {
                        inserted: true,
                        data: Some(value),
                        ..Default::default()
                    })
                }
                Err(TesseraError::DuplicateKey) => Ok(NestIdxAccess {
                    exists: true,
                    ..Default::default()
                }),
                Err(e) => Err(e),
            };
        }

        let data = index.find_mut(&full)?;
        Ok(NestIdxAccess {
            exists: data.is_some(),
            data,
            ..Default::default()
        })
    }

    /// Calls `f` with the key and mini-page of every entry, in key order.
    /// Returns the number of entries visited.
    pub fn scan_all<F>(&self, direction: ScanDirection, mut f: F) -> Result<usize>
    where
        F: FnMut(&[Value], &[u8]) -> Result<()>,
    {
        let Some(index) = self.index.as_ref() else {
            return Ok(0);
        };
        let mut visited = 0;
        for entry in index.scan_begin(Vec::new(), direction)? {
            let entry = entry?;
            f(entry.key_values(), entry.value)?;
            visited += 1;
        }
        Ok(visited)
    }
}

impl std::fmt::Debug for NestIdx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NestIdx")
            .field("name", &self.name)
            .field("columns", &self.columns)
            .field("bound", &self.is_bound())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::minipage::MiniPage;

    fn config() -> NestConfig {
        NestConfig {
            node_size: 1024,
            value_size: 64,
        }
    }

    fn time_sensor() -> NestIdx {
        NestIdx::new(
            "by_time_sensor",
            vec![GroupByCol::field("time"), GroupByCol::field("sensor")],
            config(),
        )
        .unwrap()
    }

    fn bound() -> NestIdx {
        let mut idx = time_sensor();
        idx.bind(&[Value::Int64(0), Value::Int32(0)]).unwrap();
        idx
    }

    #[test]
    fn test_access_mode_flags() {
        assert!(AccessMode::UPSERT.contains(AccessMode::FETCH));
        assert!(AccessMode::UPSERT.contains(AccessMode::INSERT));
        assert!(!AccessMode::UPSERT.contains(AccessMode::DELETE));
        assert_eq!(AccessMode::FETCH | AccessMode::INSERT, AccessMode::UPSERT);
    }

    #[test]
    fn test_new_rejects_bad_columns() {
        assert!(matches!(
            NestIdx::new("empty", Vec::new(), config()),
            Err(TesseraError::ConfigError(_))
        ));
        let dup = vec![GroupByCol::field("time"), GroupByCol::field("time")];
        assert!(matches!(
            NestIdx::new("dup", dup, config()),
            Err(TesseraError::ConfigError(_))
        ));
        let many = (0..11).map(|i: usize| GroupByCol::field(i)).collect();
        assert!(matches!(
            NestIdx::new("many", many, config()),
            Err(TesseraError::TooManyColumns { max: 10 })
        ));
    }

    fn column_types(idx: &NestIdx) -> Vec<TypeId> {
        idx.index()
            .unwrap()
            .schema()
            .columns()
            .iter()
            .map(|c| c.type_id)
            .collect()
    }

    #[test]
    fn test_bind_types_columns() {
        let mut idx = time_sensor();
        assert!(!idx.is_bound());
        idx.bind(&[Value::Int64(5), Value::Int32(1)]).unwrap();
        assert_eq!(column_types(&idx), vec![TypeId::Int64, TypeId::Int32]);
        assert_eq!(idx.position("sensor"), Some(1));
        assert!(idx.bind(&[Value::Int64(5)]).is_err());
    }

    #[test]
    fn test_null_column_typed_by_later_value() {
        let mut idx = time_sensor();
        idx.bind(&[Value::Int64(5), Value::Null]).unwrap();
        assert_eq!(column_types(&idx), vec![TypeId::Int64, TypeId::Null]);
        idx.upsert_full(&[Value::Int64(5), Value::Null]).unwrap();
        idx.upsert_full(&[Value::Int64(2), Value::Null]).unwrap();
        let access = idx.access(&[0], &[Value::Int64(5)], AccessMode::FETCH).unwrap();
        MiniPageMut::open(access.data.unwrap()).unwrap().add(0, 0, 8).unwrap()[0] = 7;

        idx.bind(&[Value::Int64(5), Value::Int32(3)]).unwrap();
        assert_eq!(column_types(&idx), vec![TypeId::Int64, TypeId::Int32]);
        assert_eq!(idx.len(), 2);
        let access = idx.access(&[0], &[Value::Int64(5)], AccessMode::FETCH).unwrap();
        let page = MiniPage::open(access.data.unwrap()).unwrap();
        assert_eq!(page.value(0, 0).unwrap()[0], 7);
        assert!(page.is_full_key());

        assert!(idx.upsert_full(&[Value::Int64(5), Value::Int32(3)]).unwrap());
        assert!(!idx.upsert_full(&[Value::Int64(5), Value::Int32(3)]).unwrap());
        assert_eq!(idx.len(), 3);
        idx.bind(&[Value::Null, Value::Null]).unwrap();
        assert_eq!(column_types(&idx), vec![TypeId::Int64, TypeId::Int32]);
    }

    #[test]
    fn test_unbound_access() {
        let mut idx = time_sensor();
        let access = idx.access(&[0], &[Value::Int64(1)], AccessMode::FETCH).unwrap();
        assert!(!access.exists);
        assert!(matches!(
            idx.access(&[0], &[Value::Int64(1)], AccessMode::UPSERT),
            Err(TesseraError::InvalidAccess(_))
        ));
        assert_eq!(idx.scan_all(ScanDirection::Forward, |_, _| Ok(())).unwrap(), 0);
    }

    #[test]
    fn test_upsert_initializes_mini_page() {
        let mut idx = bound();
        let access = idx
            .access(&[0, 1], &[Value::Int64(10), Value::Int32(1)], AccessMode::UPSERT)
            .unwrap();
        assert!(access.inserted);
        assert!(!access.exists);
        let data = access.data.unwrap();
        assert_eq!(data.len(), 64);
        MiniPageMut::open(data).unwrap().add(0, 0, 8).unwrap()[0] = 42;

        let access = idx
            .access(&[0, 1], &[Value::Int64(10), Value::Int32(1)], AccessMode::UPSERT)
            .unwrap();
        assert!(access.exists);
        assert!(!access.inserted);
        let page = MiniPage::open(access.data.unwrap()).unwrap();
        assert_eq!(page.value(0, 0).unwrap()[0], 42);
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn test_placeholders_share_index() {
        let mut idx = bound();
        idx.access(&[0, 1], &[Value::Int64(10), Value::Int32(2)], AccessMode::UPSERT)
            .unwrap();
        idx.access(&[0], &[Value::Int64(10)], AccessMode::UPSERT).unwrap();
        idx.access(&[0, 1], &[Value::Int64(10), Value::Int32(1)], AccessMode::UPSERT)
            .unwrap();
        assert_eq!(idx.len(), 3);

        let mut keys = Vec::new();
        idx.scan_all(ScanDirection::Forward, |key, value| {
            MiniPage::open(value)?;
            keys.push(key.to_vec());
            Ok(())
        })
        .unwrap();
        assert_eq!(
            keys,
            vec![
                vec![Value::Int64(10), Value::Int32(1)],
                vec![Value::Int64(10), Value::Int32(2)],
                vec![Value::Int64(10), Value::Null],
            ]
        );

        let access = idx.access(&[0], &[Value::Int64(10)], AccessMode::FETCH).unwrap();
        assert!(access.exists);
    }

    #[test]
    fn test_insert_only_and_delete() {
        let mut idx = bound();
        let key = [Value::Int64(3), Value::Int32(3)];
        let access = idx.access(&[0, 1], &key, AccessMode::INSERT).unwrap();
        assert!(access.inserted);
        assert!(access.data.is_some());

        let access = idx.access(&[0, 1], &key, AccessMode::INSERT).unwrap();
        assert!(access.exists);
        assert!(!access.inserted);
        assert!(access.data.is_none());

        let access = idx.access(&[0, 1], &key, AccessMode::DELETE).unwrap();
        assert!(access.deleted);
        let access = idx.access(&[0, 1], &key, AccessMode::DELETE).unwrap();
        assert!(!access.exists);
        assert!(idx.is_empty());
    }

    #[test]
    fn test_invalid_access() {
        let mut idx = bound();
        let key = [Value::Int64(1)];
        assert!(matches!(
            idx.access(&[0], &key, AccessMode::DELETE | AccessMode::FETCH),
            Err(TesseraError::InvalidAccess(_))
        ));
        assert!(matches!(
            idx.access(&[0], &key, AccessMode(0)),
            Err(TesseraError::InvalidAccess(_))
        ));
        assert!(matches!(
            idx.access(&[5], &key, AccessMode::FETCH),
            Err(TesseraError::InvalidParameter { .. })
        ));
        assert!(matches!(
            idx.access(&[0, 1], &key, AccessMode::FETCH),
            Err(TesseraError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_scan_all_backward() {
        let mut idx = bound();
        for t in [5i64, 1, 9, 3] {
            idx.access(&[0, 1], &[Value::Int64(t), Value::Int32(0)], AccessMode::UPSERT)
                .unwrap();
        }
        let mut times = Vec::new();
        let visited = idx
            .scan_all(ScanDirection::Backward, |key, _| {
                times.push(key[0].as_i64().unwrap_or_default());
                Ok(())
            })
            .unwrap();
        assert_eq!(visited, 4);
        assert_eq!(times, vec![9, 5, 3, 1]);
    }
}
