//! Aggregate accumulators.
//!
//! An accumulator is bound once to the type of the values it will see and
//! keeps all of its state in a fixed-width byte region. The nest stores that
//! region inside the mini-page of a leaf value, so accumulators must not
//! hold per-group state anywhere else.

use tessera_common::page::align_up;
use tessera_common::{Result, TesseraError, TypeId, Value};

/// Aggregate state machine over a fixed-width byte region.
pub trait Accumulator: Send + Sync {
    /// Width of the state region in bytes.
    fn size(&self) -> usize;

    /// Prepares a zeroed state region.
    fn initialize(&self, state: &mut [u8]);

    /// Folds one input value into the state.
    fn input(&self, state: &mut [u8], value: &Value) -> Result<()>;

    /// Computes the current aggregate value.
    fn result(&self, state: &[u8]) -> Result<Value>;

    /// Releases anything held by the state. Called before the region is
    /// dropped.
    fn finalize(&self, _state: &mut [u8]) {}

    /// Type of the values returned by `result`.
    fn output_type(&self) -> TypeId;
}

/// Creates accumulators for a concrete input type.
pub trait AccumulatorFactory: Send + Sync {
    /// Display name, used for output column naming and diagnostics.
    fn name(&self) -> &str;

    /// Binds an accumulator to `input_type`. `TypeId::Null` means no
    /// non-null value was observed yet.
    fn bind(&self, input_type: TypeId) -> Result<Box<dyn Accumulator>>;

    /// False when the accumulator works the same for every input type, so
    /// it can be bound before any value is seen.
    fn needs_input_type(&self) -> bool {
        true
    }
}

/// Built-in aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateKind {
    CountStar,
    Count,
    Sum,
    Avg,
    Min,
    Max,
    VarSamp,
    VarPop,
    StdDev,
}

impl AggregateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateKind::CountStar => "count_star",
            AggregateKind::Count => "count",
            AggregateKind::Sum => "sum",
            AggregateKind::Avg => "avg",
            AggregateKind::Min => "min",
            AggregateKind::Max => "max",
            AggregateKind::VarSamp => "var_samp",
            AggregateKind::VarPop => "var_pop",
            AggregateKind::StdDev => "stddev",
        }
    }

    /// Returns true for aggregates that only accept numeric input.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            AggregateKind::Sum
                | AggregateKind::Avg
                | AggregateKind::VarSamp
                | AggregateKind::VarPop
                | AggregateKind::StdDev
        )
    }
}

impl std::fmt::Display for AggregateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AccumulatorFactory for AggregateKind {
    fn name(&self) -> &str {
        self.as_str()
    }

    fn needs_input_type(&self) -> bool {
        !matches!(self, AggregateKind::CountStar | AggregateKind::Count)
    }

    fn bind(&self, input_type: TypeId) -> Result<Box<dyn Accumulator>> {
        if self.is_numeric() && !(input_type.is_numeric() || input_type == TypeId::Null) {
            return Err(TesseraError::UnsupportedType(format!(
                "{} over {}",
                self, input_type
            )));
        }
        let acc: Box<dyn Accumulator> = match self {
            AggregateKind::CountStar => Box::new(CountAccumulator { star: true }),
            AggregateKind::Count => Box::new(CountAccumulator { star: false }),
            AggregateKind::Sum if input_type.is_integer() => Box::new(IntSumAccumulator),
            AggregateKind::Sum => Box::new(FloatSumAccumulator),
            AggregateKind::Avg => Box::new(AvgAccumulator),
            AggregateKind::Min | AggregateKind::Max => {
                let width = input_type.extreme_width().ok_or_else(|| {
                    TesseraError::UnsupportedType(format!("{} over {}", self, input_type))
                })?;
                Box::new(ExtremeAccumulator {
                    type_id: input_type,
                    width,
                    keep: if *self == AggregateKind::Min {
                        std::cmp::Ordering::Less
                    } else {
                        std::cmp::Ordering::Greater
                    },
                })
            }
            AggregateKind::VarSamp => Box::new(VarianceAccumulator {
                mode: VarianceMode::Sample,
            }),
            AggregateKind::VarPop => Box::new(VarianceAccumulator {
                mode: VarianceMode::Population,
            }),
            AggregateKind::StdDev => Box::new(VarianceAccumulator {
                mode: VarianceMode::StdDev,
            }),
        };
        Ok(acc)
    }
}

// =============================================================================
// State helpers
// =============================================================================

fn read_i64(state: &[u8], off: usize) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&state[off..off + 8]);
    i64::from_le_bytes(buf)
}

fn write_i64(state: &mut [u8], off: usize, value: i64) {
    state[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

fn read_f64(state: &[u8], off: usize) -> f64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&state[off..off + 8]);
    f64::from_le_bytes(buf)
}

fn write_f64(state: &mut [u8], off: usize, value: f64) {
    state[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

fn numeric(value: &Value) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| TesseraError::type_mismatch(TypeId::Float64, value.type_id()))
}

// =============================================================================
// COUNT
// =============================================================================

/// `[count: i64]`
struct CountAccumulator {
    star: bool,
}

impl Accumulator for CountAccumulator {
    fn size(&self) -> usize {
        8
    }

    fn initialize(&self, state: &mut [u8]) {
        write_i64(state, 0, 0);
    }

    fn input(&self, state: &mut [u8], value: &Value) -> Result<()> {
        if self.star || !value.is_null() {
            write_i64(state, 0, read_i64(state, 0) + 1);
        }
        Ok(())
    }

    fn result(&self, state: &[u8]) -> Result<Value> {
        Ok(Value::Int64(read_i64(state, 0)))
    }

    fn output_type(&self) -> TypeId {
        TypeId::Int64
    }
}

// =============================================================================
// SUM
// =============================================================================

/// `[seen: u8, pad: 7][sum: i64]`
struct IntSumAccumulator;

impl Accumulator for IntSumAccumulator {
    fn size(&self) -> usize {
        16
    }

    fn initialize(&self, state: &mut [u8]) {
        state[..16].fill(0);
    }

    fn input(&self, state: &mut [u8], value: &Value) -> Result<()> {
        if value.is_null() {
            return Ok(());
        }
        let v = value
            .as_i64()
            .ok_or_else(|| TesseraError::type_mismatch(TypeId::Int64, value.type_id()))?;
        let sum = read_i64(state, 8)
            .checked_add(v)
            .ok_or_else(|| TesseraError::TransformFailed("integer sum overflow".to_string()))?;
        state[0] = 1;
        write_i64(state, 8, sum);
        Ok(())
    }

    fn result(&self, state: &[u8]) -> Result<Value> {
        if state[0] == 0 {
            return Ok(Value::Null);
        }
        Ok(Value::Int64(read_i64(state, 8)))
    }

    fn output_type(&self) -> TypeId {
        TypeId::Int64
    }
}

/// `[seen: u8, pad: 7][sum: f64]`
struct FloatSumAccumulator;

impl Accumulator for FloatSumAccumulator {
    fn size(&self) -> usize {
        16
    }

    fn initialize(&self, state: &mut [u8]) {
        state[..16].fill(0);
    }

    fn input(&self, state: &mut [u8], value: &Value) -> Result<()> {
        if value.is_null() {
            return Ok(());
        }
        let v = numeric(value)?;
        state[0] = 1;
        write_f64(state, 8, read_f64(state, 8) + v);
        Ok(())
    }

    fn result(&self, state: &[u8]) -> Result<Value> {
        if state[0] == 0 {
            return Ok(Value::Null);
        }
        Ok(Value::Float64(read_f64(state, 8)))
    }

    fn output_type(&self) -> TypeId {
        TypeId::Float64
    }
}

// =============================================================================
// AVG
// =============================================================================

/// `[count: i64][sum: f64]`
struct AvgAccumulator;

impl Accumulator for AvgAccumulator {
    fn size(&self) -> usize {
        16
    }

    fn initialize(&self, state: &mut [u8]) {
        state[..16].fill(0);
    }

    fn input(&self, state: &mut [u8], value: &Value) -> Result<()> {
        if value.is_null() {
            return Ok(());
        }
        let v = numeric(value)?;
        write_i64(state, 0, read_i64(state, 0) + 1);
        write_f64(state, 8, read_f64(state, 8) + v);
        Ok(())
    }

    fn result(&self, state: &[u8]) -> Result<Value> {
        let count = read_i64(state, 0);
        if count == 0 {
            return Ok(Value::Null);
        }
        Ok(Value::Float64(read_f64(state, 8) / count as f64))
    }

    fn output_type(&self) -> TypeId {
        TypeId::Float64
    }
}

// =============================================================================
// MIN / MAX
// =============================================================================

/// `[seen: u8, pad: 7][value: width bytes]`
struct ExtremeAccumulator {
    type_id: TypeId,
    width: usize,
    /// Ordering of a new value against the current one that replaces it.
    keep: std::cmp::Ordering,
}

impl ExtremeAccumulator {
    fn current(&self, state: &[u8]) -> Result<Value> {
        Value::decode_binary(self.type_id, &state[8..8 + self.width])
    }
}

impl Accumulator for ExtremeAccumulator {
    fn size(&self) -> usize {
        8 + align_up(self.width)
    }

    fn initialize(&self, state: &mut [u8]) {
        state[..self.size()].fill(0);
    }

    fn input(&self, state: &mut [u8], value: &Value) -> Result<()> {
        if value.is_null() {
            return Ok(());
        }
        let value = value.cast_to(self.type_id)?;
        if state[0] != 0 && value.compare(&self.current(state)?) != self.keep {
            return Ok(());
        }
        let mut buf = bytes::BytesMut::with_capacity(self.width);
        value.encode_binary(&mut buf);
        state[8..8 + self.width].copy_from_slice(&buf);
        state[0] = 1;
        Ok(())
    }

    fn result(&self, state: &[u8]) -> Result<Value> {
        if state[0] == 0 {
            return Ok(Value::Null);
        }
        self.current(state)
    }

    fn output_type(&self) -> TypeId {
        self.type_id
    }
}

// =============================================================================
// VARIANCE / STDDEV (Welford)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VarianceMode {
    Sample,
    Population,
    StdDev,
}

/// `[count: i64][mean: f64][m2: f64]`
struct VarianceAccumulator {
    mode: VarianceMode,
}

impl Accumulator for VarianceAccumulator {
    fn size(&self) -> usize {
        24
    }

    fn initialize(&self, state: &mut [u8]) {
        state[..24].fill(0);
    }

    fn input(&self, state: &mut [u8], value: &Value) -> Result<()> {
        if value.is_null() {
            return Ok(());
        }
        let x = numeric(value)?;
        let count = read_i64(state, 0) + 1;
        let mean = read_f64(state, 8);
        let delta = x - mean;
        let mean = mean + delta / count as f64;
        let m2 = read_f64(state, 16) + delta * (x - mean);
        write_i64(state, 0, count);
        write_f64(state, 8, mean);
        write_f64(state, 16, m2);
        Ok(())
    }

    fn result(&self, state: &[u8]) -> Result<Value> {
        let count = read_i64(state, 0);
        let m2 = read_f64(state, 16);
        let value = match self.mode {
            VarianceMode::Population if count >= 1 => m2 / count as f64,
            VarianceMode::Sample if count >= 2 => m2 / (count - 1) as f64,
            VarianceMode::StdDev if count >= 2 => (m2 / (count - 1) as f64).sqrt(),
            _ => return Ok(Value::Null),
        };
        Ok(Value::Float64(value))
    }

    fn output_type(&self) -> TypeId {
        TypeId::Float64
    }
}
