//! Ordered scans with per-column qualifiers.
//!
//! Qualifiers on the first key column also position the scan: the tightest
//! bound in the scan direction picks the starting leaf, and the same
//! qualifier stops the scan once no later entry can satisfy it.

use super::arena::NodeId;
use super::index::{BTreeIndex, SearchMode};
use super::types::{ScanDirection, TrimEnd};
use std::cmp::Ordering;
use tessera_common::{Result, TesseraError, Value};

/// Comparison applied to one key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    IsNull,
    IsNotNull,
}

/// A qualifier on one key column.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanKey {
    pub column: usize,
    pub op: ScanOp,
    /// Ignored by `IsNull` and `IsNotNull`.
    pub value: Value,
}

impl ScanKey {
    pub fn new(column: usize, op: ScanOp, value: impl Into<Value>) -> Self {
        Self {
            column,
            op,
            value: value.into(),
        }
    }

    pub fn is_null(column: usize) -> Self {
        Self::new(column, ScanOp::IsNull, Value::Null)
    }

    pub fn is_not_null(column: usize) -> Self {
        Self::new(column, ScanOp::IsNotNull, Value::Null)
    }
}

/// One entry produced by a scan.
#[derive(Debug, Clone)]
pub struct ScanEntry<'a> {
    /// Stored key bytes.
    pub key: &'a [u8],
    /// Value bytes.
    pub value: &'a [u8],
    values: Vec<Value>,
}

impl ScanEntry<'_> {
    /// Decoded key columns.
    pub fn key_values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_key_values(self) -> Vec<Value> {
        self.values
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Match,
    Skip,
    Stop,
}

type Predicate = Box<dyn Fn(&Value) -> Verdict + Send + Sync>;

/// Returns true when a failed comparison on the leading column means no
/// later entry in `direction` can match.
fn ends_range(op: ScanOp, ord: Ordering, direction: ScanDirection) -> bool {
    match direction {
        ScanDirection::Forward => match op {
            ScanOp::Eq | ScanOp::Le => ord == Ordering::Greater,
            ScanOp::Lt => ord != Ordering::Less,
            _ => false,
        },
        ScanDirection::Backward => match op {
            ScanOp::Eq | ScanOp::Ge => ord == Ordering::Less,
            ScanOp::Gt => ord != Ordering::Greater,
            _ => false,
        },
    }
}

fn compile(key: &ScanKey, direction: ScanDirection) -> Predicate {
    let leading = key.column == 0;
    let forward = direction == ScanDirection::Forward;
    let op = key.op;
    match op {
        // NULLs sort last, so they form the tail of a forward scan and the
        // head of a backward one.
        ScanOp::IsNull => Box::new(move |v: &Value| {
            if v.is_null() {
                Verdict::Match
            } else if leading && !forward {
                Verdict::Stop
            } else {
                Verdict::Skip
            }
        }),
        ScanOp::IsNotNull => Box::new(move |v: &Value| {
            if !v.is_null() {
                Verdict::Match
            } else if leading && forward {
                Verdict::Stop
            } else {
                Verdict::Skip
            }
        }),
        _ => {
            let bound = key.value.clone();
            Box::new(move |v: &Value| {
                // Comparisons never match NULL.
                if bound.is_null() {
                    return Verdict::Stop;
                }
                if v.is_null() {
                    return if leading && forward {
                        Verdict::Stop
                    } else {
                        Verdict::Skip
                    };
                }
                let ord = v.compare(&bound);
                let ok = match op {
                    ScanOp::Eq => ord == Ordering::Equal,
                    ScanOp::Lt => ord == Ordering::Less,
                    ScanOp::Le => ord != Ordering::Greater,
                    ScanOp::Gt => ord == Ordering::Greater,
                    ScanOp::Ge => ord != Ordering::Less,
                    ScanOp::IsNull | ScanOp::IsNotNull => false,
                };
                if ok {
                    Verdict::Match
                } else if leading && ends_range(op, ord, direction) {
                    Verdict::Stop
                } else {
                    Verdict::Skip
                }
            })
        }
    }
}

/// Picks the leading-column bound that positions the scan.
fn start_bound(keys: &[ScanKey], direction: ScanDirection) -> Option<(Value, SearchMode)> {
    let mut best: Option<(Value, SearchMode)> = None;
    for key in keys.iter().filter(|k| k.column == 0 && !k.value.is_null()) {
        let mode = match (direction, key.op) {
            (ScanDirection::Forward, ScanOp::Eq | ScanOp::Ge) => SearchMode::Lower,
            (ScanDirection::Forward, ScanOp::Gt) => SearchMode::Upper,
            (ScanDirection::Backward, ScanOp::Eq | ScanOp::Le) => SearchMode::Upper,
            (ScanDirection::Backward, ScanOp::Lt) => SearchMode::Lower,
            _ => continue,
        };
        // On equal values the strict bound wins.
        let tighter = match &best {
            None => true,
            Some((value, _)) => {
                let ord = key.value.compare(value);
                match direction {
                    ScanDirection::Forward => {
                        ord == Ordering::Greater
                            || (ord == Ordering::Equal && mode == SearchMode::Upper)
                    }
                    ScanDirection::Backward => {
                        ord == Ordering::Less
                            || (ord == Ordering::Equal && mode == SearchMode::Lower)
                    }
                }
            }
        };
        if tighter {
            best = Some((key.value.clone(), mode));
        }
    }
    best
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    Unpositioned,
    Active,
    Done,
}

/// Iterator over the entries of a `BTreeIndex` that satisfy every
/// qualifier.
pub struct BTreeScan<'a> {
    index: &'a BTreeIndex,
    keys: Vec<ScanKey>,
    predicates: Vec<(usize, Predicate)>,
    direction: ScanDirection,
    leaf: NodeId,
    /// Forward: next entry to read. Backward: one past it.
    next: usize,
    cursor: Cursor,
    returned: usize,
}

impl<'a> BTreeScan<'a> {
    /// Qualifiers this scan was opened with.
    pub fn keys(&self) -> &[ScanKey] {
        &self.keys
    }

    pub fn direction(&self) -> ScanDirection {
        self.direction
    }

    /// Restarts the scan and returns its first entry.
    pub fn first(&mut self) -> Option<Result<ScanEntry<'a>>> {
        self.cursor = Cursor::Unpositioned;
        self.returned = 0;
        self.next()
    }

    /// Closes the scan and returns how many entries it produced.
    pub fn end(self) -> usize {
        self.returned
    }

    fn seek(&mut self) -> Result<()> {
        let index = self.index;
        match start_bound(&self.keys, self.direction) {
            Some((value, mode)) => {
                let probe = [value];
                let (_, leaf) = index.descend(&probe, mode)?;
                let node = index.node(leaf)?;
                self.leaf = leaf;
                self.next = index.bound_in(&node, node.len(), &probe, mode)?;
            }
            None => {
                let end = match self.direction {
                    ScanDirection::Forward => TrimEnd::Front,
                    ScanDirection::Backward => TrimEnd::Back,
                };
                let (_, leaf) = index.descend_edge(end)?;
                self.leaf = leaf;
                self.next = match self.direction {
                    ScanDirection::Forward => 0,
                    ScanDirection::Backward => index.node(leaf)?.len(),
                };
            }
        }
        self.cursor = Cursor::Active;
        Ok(())
    }

    fn evaluate(&self, values: &[Value]) -> Verdict {
        let mut verdict = Verdict::Match;
        for (column, predicate) in &self.predicates {
            let value = values.get(*column).unwrap_or(&Value::Null);
            match predicate(value) {
                Verdict::Stop => return Verdict::Stop,
                Verdict::Skip => verdict = Verdict::Skip,
                Verdict::Match => {}
            }
        }
        verdict
    }

    fn advance(&mut self) -> Result<Option<ScanEntry<'a>>> {
        match self.cursor {
            Cursor::Done => return Ok(None),
            Cursor::Unpositioned => self.seek()?,
            Cursor::Active => {}
        }
        let index = self.index;
        loop {
            let node = index.node(self.leaf)?;
            let at = match self.direction {
                ScanDirection::Forward => {
                    if self.next >= node.len() {
                        if node.right().is_none() {
                            self.cursor = Cursor::Done;
                            return Ok(None);
                        }
                        self.leaf = node.right();
                        self.next = 0;
                        continue;
                    }
                    self.next += 1;
                    self.next - 1
                }
                ScanDirection::Backward => {
                    if self.next == 0 {
                        let left = node.left();
                        if left.is_none() {
                            self.cursor = Cursor::Done;
                            return Ok(None);
                        }
                        self.leaf = left;
                        self.next = index.node(left)?.len();
                        continue;
                    }
                    self.next -= 1;
                    self.next
                }
            };
            let key = node.key(at);
            let values = index.schema().decode(key, &index.ctx())?;
            match self.evaluate(&values) {
                Verdict::Match => {
                    self.returned += 1;
                    return Ok(Some(ScanEntry {
                        key,
                        value: node.payload(at),
                        values,
                    }));
                }
                Verdict::Skip => {}
                Verdict::Stop => {
                    self.cursor = Cursor::Done;
                    return Ok(None);
                }
            }
        }
    }
}

impl<'a> Iterator for BTreeScan<'a> {
    type Item = Result<ScanEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(entry) => entry.map(Ok),
            Err(e) => {
                self.cursor = Cursor::Done;
                Some(Err(e))
            }
        }
    }
}

impl BTreeIndex {
    /// Opens a scan returning the entries that satisfy every qualifier.
    pub fn scan_begin(&self, keys: Vec<ScanKey>, direction: ScanDirection) -> Result<BTreeScan<'_>> {
        if let Some(key) = keys.iter().find(|k| k.column >= self.schema().len()) {
            return Err(TesseraError::InvalidParameter {
                name: "scan column".to_string(),
                value: key.column.to_string(),
            });
        }
        let predicates = keys
            .iter()
            .map(|k| (k.column, compile(k, direction)))
            .collect();
        Ok(BTreeScan {
            index: self,
            keys,
            predicates,
            direction,
            leaf: NodeId::NONE,
            next: 0,
            cursor: Cursor::Unpositioned,
            returned: 0,
        })
    }
}
