//! Key columns, key encoding and comparison.
//!
//! A stored key is the concatenation of its columns. Each column starts
//! with a presence tag (0 = NULL, 1 = present) followed by:
//! - `ByValue`, fixed-size type: the value, little-endian
//! - `ByValue`, variable-length type: u16 length + bytes
//! - `ByReference`: the u64 record id
//! - `BySlot`: the u32 index into the index's slot table
//!
//! Comparison always works on decoded values, so NULL ordering and
//! cross-type numeric rules come from `Value::compare`.

use crate::tuple::{RecordId, RecordStore};
use bytes::{BufMut, Bytes, BytesMut};
use std::cmp::Ordering;
use std::collections::HashMap;
use tessera_common::{Result, TesseraError, TypeId, Value};

const TAG_NULL: u8 = 0;
const TAG_PRESENT: u8 = 1;

/// How a key column is stored in a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStrategy {
    /// The value bytes are embedded in the key.
    ByValue,
    /// A record handle is embedded; the field is fetched from the record
    /// store on every comparison.
    ByReference,
    /// An index into the slot table of record handles is embedded.
    BySlot,
}

/// Descriptor of one key column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyColumn {
    pub name: String,
    pub type_id: TypeId,
    pub strategy: KeyStrategy,
    pub nullable: bool,
    /// Record field read by `ByReference` and `BySlot` columns.
    pub field: Option<usize>,
}

impl KeyColumn {
    /// Creates a nullable by-value column.
    pub fn by_value(name: impl Into<String>, type_id: TypeId) -> Self {
        Self {
            name: name.into(),
            type_id,
            strategy: KeyStrategy::ByValue,
            nullable: true,
            field: None,
        }
    }

    /// Creates a column that stores a record handle and compares on
    /// `field` of the referenced record.
    pub fn by_reference(name: impl Into<String>, type_id: TypeId, field: usize) -> Self {
        Self {
            name: name.into(),
            type_id,
            strategy: KeyStrategy::ByReference,
            nullable: true,
            field: Some(field),
        }
    }

    /// Like `by_reference`, but the handle goes through the slot table.
    pub fn by_slot(name: impl Into<String>, type_id: TypeId, field: usize) -> Self {
        Self {
            name: name.into(),
            type_id,
            strategy: KeyStrategy::BySlot,
            nullable: true,
            field: Some(field),
        }
    }

    /// Rejects NULL for this column.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// One caller-supplied key component.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyDatum {
    Value(Value),
    Record(RecordId),
}

impl From<Value> for KeyDatum {
    fn from(value: Value) -> Self {
        KeyDatum::Value(value)
    }
}

impl From<RecordId> for KeyDatum {
    fn from(id: RecordId) -> Self {
        KeyDatum::Record(id)
    }
}

/// Wraps plain values as key data.
pub fn key_of<I, V>(values: I) -> Vec<KeyDatum>
where
    I: IntoIterator<Item = V>,
    V: Into<Value>,
{
    values.into_iter().map(|v| KeyDatum::Value(v.into())).collect()
}

/// De-duplicated side table of record handles for `BySlot` columns.
#[derive(Debug, Default)]
pub struct SlotTable {
    records: Vec<RecordId>,
    positions: HashMap<RecordId, u32>,
}

impl SlotTable {
    /// Returns the slot of `id`, adding it on first use.
    pub fn intern(&mut self, id: RecordId) -> u32 {
        if let Some(&slot) = self.positions.get(&id) {
            return slot;
        }
        let slot = self.records.len() as u32;
        self.records.push(id);
        self.positions.insert(id, slot);
        slot
    }

    /// Drops every slot at or past `len`.
    pub fn truncate(&mut self, len: usize) {
        for id in self.records.drain(len.min(self.records.len())..) {
            self.positions.remove(&id);
        }
    }

    pub fn get(&self, slot: u32) -> Option<RecordId> {
        self.records.get(slot as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Collaborators needed to decode reference columns.
#[derive(Clone, Copy)]
pub struct KeyContext<'a> {
    pub store: Option<&'a dyn RecordStore>,
    pub slots: &'a SlotTable,
}

impl KeyContext<'_> {
    fn fetch(&self, id: RecordId, field: Option<usize>) -> Result<Value> {
        let store = self
            .store
            .ok_or_else(|| TesseraError::ConfigError("reference key without record store".into()))?;
        let field = field
            .ok_or_else(|| TesseraError::ConfigError("reference key without field".into()))?;
        store.field_at(id, field)
    }
}

/// Direction of a trim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimEnd {
    Front,
    Back,
}

/// Direction of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    Forward,
    Backward,
}

/// Ordered list of key columns.
#[derive(Debug, Clone, Default)]
pub struct KeySchema {
    columns: Vec<KeyColumn>,
}

impl KeySchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, column: KeyColumn) {
        self.columns.push(column);
    }

    pub fn columns(&self) -> &[KeyColumn] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Position of the column called `name`.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Encodes a full key for storage. `BySlot` handles are interned into
    /// `slots`.
    pub fn encode(&self, key: &[KeyDatum], slots: &mut SlotTable) -> Result<Bytes> {
        if key.len() != self.columns.len() {
            return Err(TesseraError::InvalidParameter {
                name: "key".to_string(),
                value: format!("{} of {} columns", key.len(), self.columns.len()),
            });
        }
        let mut buf = BytesMut::new();
        for (column, datum) in self.columns.iter().zip(key) {
            match (column.strategy, datum) {
                (_, KeyDatum::Value(Value::Null)) => {
                    if !column.nullable {
                        return Err(TesseraError::type_mismatch(column.type_id, TypeId::Null));
                    }
                    buf.put_u8(TAG_NULL);
                }
                (KeyStrategy::ByValue, KeyDatum::Value(value)) => {
                    let value = value.cast_to(column.type_id)?;
                    buf.put_u8(TAG_PRESENT);
                    if column.type_id.is_variable() {
                        let len = value.encoded_len();
                        if len > u16::MAX as usize {
                            return Err(TesseraError::KeyTooLarge {
                                size: len,
                                max: u16::MAX as usize,
                            });
                        }
                        buf.put_u16_le(len as u16);
                    }
                    value.encode_binary(&mut buf);
                }
                (KeyStrategy::ByReference, KeyDatum::Record(id)) => {
                    buf.put_u8(TAG_PRESENT);
                    buf.put_u64_le(id.0);
                }
                (KeyStrategy::BySlot, KeyDatum::Record(id)) => {
                    buf.put_u8(TAG_PRESENT);
                    buf.put_u32_le(slots.intern(*id));
                }
                (KeyStrategy::ByValue, KeyDatum::Record(_)) => {
                    return Err(TesseraError::type_mismatch(column.type_id, "record handle"));
                }
                (_, KeyDatum::Value(value)) => {
                    return Err(TesseraError::type_mismatch("record handle", value.type_id()));
                }
            }
        }
        Ok(buf.freeze())
    }

    /// Resolves caller key data into comparison values. The probe may name
    /// fewer columns than the schema; it then matches every key sharing
    /// that prefix.
    pub fn probe(&self, key: &[KeyDatum], ctx: &KeyContext<'_>) -> Result<Vec<Value>> {
        if key.len() > self.columns.len() {
            return Err(TesseraError::InvalidParameter {
                name: "key".to_string(),
                value: format!("{} of {} columns", key.len(), self.columns.len()),
            });
        }
        self.columns
            .iter()
            .zip(key)
            .map(|(column, datum)| match datum {
                KeyDatum::Value(value) => Ok(value.clone()),
                KeyDatum::Record(id) => ctx.fetch(*id, column.field),
            })
            .collect()
    }

    /// Decodes the first `count` columns of a stored key.
    pub fn decode_prefix(
        &self,
        stored: &[u8],
        count: usize,
        ctx: &KeyContext<'_>,
    ) -> Result<Vec<Value>> {
        let mut values = Vec::with_capacity(count);
        let mut pos = 0;
        for column in self.columns.iter().take(count) {
            values.push(self.decode_column(column, stored, &mut pos, ctx)?);
        }
        Ok(values)
    }

    /// Decodes every column of a stored key.
    pub fn decode(&self, stored: &[u8], ctx: &KeyContext<'_>) -> Result<Vec<Value>> {
        self.decode_prefix(stored, self.columns.len(), ctx)
    }

    fn decode_column(
        &self,
        column: &KeyColumn,
        stored: &[u8],
        pos: &mut usize,
        ctx: &KeyContext<'_>,
    ) -> Result<Value> {
        let tag = *take(stored, pos, 1)?
            .first()
            .ok_or_else(|| corrupt_key(&column.name))?;
        if tag == TAG_NULL {
            return Ok(Value::Null);
        }
        match column.strategy {
            KeyStrategy::ByValue => {
                let len = match column.type_id.fixed_size() {
                    Some(size) => size,
                    None => {
                        let raw = take(stored, pos, 2)?;
                        u16::from_le_bytes([raw[0], raw[1]]) as usize
                    }
                };
                Value::decode_binary(column.type_id, take(stored, pos, len)?)
            }
            KeyStrategy::ByReference => {
                let raw = take(stored, pos, 8)?;
                let id = u64::from_le_bytes([
                    raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
                ]);
                ctx.fetch(RecordId(id), column.field)
            }
            KeyStrategy::BySlot => {
                let raw = take(stored, pos, 4)?;
                let slot = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                let id = ctx
                    .slots
                    .get(slot)
                    .ok_or_else(|| TesseraError::BTreeCorrupted(format!("unknown key slot {slot}")))?;
                ctx.fetch(id, column.field)
            }
        }
    }

    /// Compares a probe against a stored key, column by column. Columns
    /// beyond the probe's length are ignored.
    pub fn compare(&self, probe: &[Value], stored: &[u8], ctx: &KeyContext<'_>) -> Result<Ordering> {
        let mut pos = 0;
        for (column, value) in self.columns.iter().zip(probe) {
            let other = self.decode_column(column, stored, &mut pos, ctx)?;
            match value.compare(&other) {
                Ordering::Equal => {}
                ord => return Ok(ord),
            }
        }
        Ok(Ordering::Equal)
    }

    /// Compares two stored keys.
    pub fn compare_stored(&self, a: &[u8], b: &[u8], ctx: &KeyContext<'_>) -> Result<Ordering> {
        let probe = self.decode(a, ctx)?;
        self.compare(&probe, b, ctx)
    }
}

/// Compares two decoded keys column by column.
pub fn compare_values(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        match x.compare(y) {
            Ordering::Equal => {}
            ord => return ord,
        }
    }
    a.len().cmp(&b.len())
}

fn take<'a>(stored: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = *pos + len;
    let slice = stored
        .get(*pos..end)
        .ok_or_else(|| TesseraError::BTreeCorrupted("truncated key".to_string()))?;
    *pos = end;
    Ok(slice)
}

fn corrupt_key(column: &str) -> TesseraError {
    TesseraError::BTreeCorrupted(format!("missing tag for key column {column}"))
}
