//! Record representation, record store and field resolution.
//!
//! Records are the rows fed into indexes and nests. By-reference key
//! columns store only a `RecordId` and pin the record through a
//! `RecordStore` whenever the key must be compared.

use parking_lot::RwLock;
use std::sync::Arc;
use tessera_common::{Result, TesseraError, Value};

/// Handle of a record inside a `RecordStore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(pub u64);

impl RecordId {
    /// Invalid record ID.
    pub const INVALID: RecordId = RecordId(u64::MAX);

    /// Returns true if this is a valid record ID.
    pub fn is_valid(&self) -> bool {
        self.0 != u64::MAX
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Field names of a record, shared by every record of the same shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    names: Vec<String>,
}

impl Schema {
    /// Creates a schema from field names.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the position of the field called `name`.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Returns the field names.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// A row of values.
#[derive(Debug, Clone)]
pub struct Record {
    schema: Arc<Schema>,
    values: Vec<Value>,
}

impl Record {
    /// Creates a record. Missing trailing values read as NULL.
    pub fn new(schema: Arc<Schema>, values: Vec<Value>) -> Self {
        Self { schema, values }
    }

    /// Returns the record schema.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Returns the value at `position`, if the schema has that field.
    pub fn get(&self, position: usize) -> Option<&Value> {
        if position >= self.schema.len() {
            return None;
        }
        Some(self.values.get(position).unwrap_or(&Value::Null))
    }

    /// Returns the value of the field called `name`.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.schema.position(name).and_then(|p| self.get(p))
    }

    /// Returns all stored values.
    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

/// Reference to one field of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldRef {
    Position(usize),
    Name(String),
}

impl From<usize> for FieldRef {
    fn from(position: usize) -> Self {
        FieldRef::Position(position)
    }
}

impl From<&str> for FieldRef {
    fn from(name: &str) -> Self {
        FieldRef::Name(name.to_string())
    }
}

impl std::fmt::Display for FieldRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldRef::Position(p) => write!(f, "#{}", p),
            FieldRef::Name(n) => write!(f, "{}", n),
        }
    }
}

/// Source of records for by-reference key columns.
pub trait RecordStore: Send + Sync {
    /// Pins the record, keeping it alive while the caller holds the `Arc`.
    fn pin(&self, id: RecordId) -> Option<Arc<Record>>;

    /// Reads one field of a stored record.
    fn field_at(&self, id: RecordId, position: usize) -> Result<Value> {
        let record = self.pin(id).ok_or(TesseraError::RecordNotFound(id.0))?;
        record
            .get(position)
            .cloned()
            .ok_or_else(|| TesseraError::FieldNotResolved(format!("{}#{}", id, position)))
    }
}

/// Append-only in-memory record store.
#[derive(Default)]
pub struct MemRecordStore {
    records: RwLock<Vec<Arc<Record>>>,
}

impl MemRecordStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a record and returns its handle.
    pub fn insert(&self, record: Record) -> RecordId {
        let mut records = self.records.write();
        records.push(Arc::new(record));
        RecordId(records.len() as u64 - 1)
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl RecordStore for MemRecordStore {
    fn pin(&self, id: RecordId) -> Option<Arc<Record>> {
        self.records.read().get(id.0 as usize).cloned()
    }
}

/// Resolves a logical field reference against a record.
pub trait SearchPath {
    fn resolve(&self, record: &Record, field: &FieldRef) -> Result<Value>;
}

/// Resolves positions directly and names through the record schema.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectPath;

impl SearchPath for DirectPath {
    fn resolve(&self, record: &Record, field: &FieldRef) -> Result<Value> {
        let value = match field {
            FieldRef::Position(p) => record.get(*p),
            FieldRef::Name(n) => record.get_by_name(n),
        };
        value
            .cloned()
            .ok_or_else(|| TesseraError::FieldNotResolved(field.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensor_schema() -> Arc<Schema> {
        Arc::new(Schema::new(["time", "sensor", "temp"]))
    }

    #[test]
    fn test_record_id() {
        assert!(RecordId(0).is_valid());
        assert!(!RecordId::INVALID.is_valid());
        assert_eq!(RecordId(42).to_string(), "r42");
    }

    #[test]
    fn test_record_get() {
        let record = Record::new(sensor_schema(), vec![Value::Int64(100), Value::Int32(1)]);
        assert_eq!(record.get(0), Some(&Value::Int64(100)));
        assert_eq!(record.get_by_name("sensor"), Some(&Value::Int32(1)));
        // Declared but absent values read as NULL.
        assert_eq!(record.get(2), Some(&Value::Null));
        assert_eq!(record.get(3), None);
        assert_eq!(record.get_by_name("humidity"), None);
    }

    #[test]
    fn test_mem_store_pin() {
        let store = MemRecordStore::new();
        assert!(store.is_empty());
        let id = store.insert(Record::new(sensor_schema(), vec![Value::Int64(5)]));
        assert_eq!(id, RecordId(0));
        assert_eq!(store.len(), 1);

        let pinned = store.pin(id).unwrap();
        assert_eq!(pinned.get(0), Some(&Value::Int64(5)));
        assert!(store.pin(RecordId(9)).is_none());
    }

    #[test]
    fn test_mem_store_field_at() {
        let store = MemRecordStore::new();
        let id = store.insert(Record::new(
            sensor_schema(),
            vec![Value::Int64(5), Value::Int32(2), Value::Float64(70.5)],
        ));
        assert_eq!(store.field_at(id, 2).unwrap(), Value::Float64(70.5));
        assert!(matches!(
            store.field_at(RecordId(3), 0),
            Err(TesseraError::RecordNotFound(3))
        ));
        assert!(matches!(
            store.field_at(id, 7),
            Err(TesseraError::FieldNotResolved(_))
        ));
    }

    #[test]
    fn test_direct_path() {
        let record = Record::new(sensor_schema(), vec![Value::Int64(1), Value::Int32(9)]);
        let path = DirectPath;
        assert_eq!(path.resolve(&record, &FieldRef::from(1)).unwrap(), Value::Int32(9));
        assert_eq!(
            path.resolve(&record, &FieldRef::from("time")).unwrap(),
            Value::Int64(1)
        );
        let err = path.resolve(&record, &FieldRef::from("nope")).unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(err.to_string(), "Field not resolved: nope");
    }
}
