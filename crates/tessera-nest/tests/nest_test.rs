//! Integration tests for nest ingest and materialization.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tessera_common::{NestConfig, Result, TesseraError, Value};
use tessera_nest::{
    AggregateKind, FnTransform, GroupByCol, Nest, NestAggCol, NestLevel, ValueTransform,
};
use tessera_storage::{FieldRef, Record, ScanDirection, Schema, SearchPath};

// =============================================================================
// Helpers
// =============================================================================

fn config() -> NestConfig {
    NestConfig {
        node_size: 1024,
        value_size: 64,
    }
}

fn schema() -> Arc<Schema> {
    Arc::new(Schema::new(["time", "sensor", "temp"]))
}

fn reading(time: i64, sensor: i32, temp: impl Into<Value>) -> Record {
    Record::new(schema(), vec![Value::Int64(time), Value::Int32(sensor), temp.into()])
}

fn agg(field: &str, kind: AggregateKind) -> NestAggCol {
    NestAggCol::new(field, Arc::new(kind))
}

fn count_star() -> NestAggCol {
    NestAggCol::count_star(Arc::new(AggregateKind::CountStar))
}

fn values(rows: &[Record]) -> Vec<Vec<Value>> {
    rows.iter().map(|r| r.values().to_vec()).collect()
}

/// Every permutation of `items`, by Heap's algorithm.
fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
    fn heap<T: Clone>(k: usize, items: &mut Vec<T>, out: &mut Vec<Vec<T>>) {
        if k <= 1 {
            out.push(items.clone());
            return;
        }
        for i in 0..k {
            heap(k - 1, items, out);
            if k % 2 == 0 {
                items.swap(i, k - 1);
            } else {
                items.swap(0, k - 1);
            }
        }
    }
    let mut items = items.to_vec();
    let mut out = Vec::new();
    heap(items.len(), &mut items, &mut out);
    out
}

/// Index "ts" on (time, sensor) with level "per_time" on (time) and level
/// "per_sensor" on (time, sensor).
fn shared_nest() -> Nest {
    let mut nest = Nest::new(config()).unwrap();
    nest.add_index("ts", vec![GroupByCol::field("time"), GroupByCol::field("sensor")])
        .unwrap();
    nest.add_level("ts", NestLevel::new("per_time", ["time"], vec![count_star()]))
        .unwrap();
    nest.add_level(
        "ts",
        NestLevel::new("per_sensor", ["time", "sensor"], vec![count_star()]),
    )
    .unwrap();
    nest
}

// =============================================================================
// Aggregation results
// =============================================================================

#[test]
fn test_count_identical_keys() {
    let mut nest = Nest::new(config()).unwrap();
    nest.add_index("t", vec![GroupByCol::field("time")]).unwrap();
    nest.add_level("t", NestLevel::new("n", ["time"], vec![count_star()]))
        .unwrap();

    let m = 1_000;
    for i in 0..m {
        nest.input(&reading(42, i % 7, 70.0)).unwrap();
    }
    assert_eq!(nest.index("t").unwrap().len(), 1);
    let rows = nest.materialize_level("n", ScanDirection::Forward).unwrap();
    assert_eq!(values(&rows), vec![vec![Value::Int64(42), Value::Int64(m as i64)]]);
}

#[test]
fn test_avg_is_order_independent() {
    let temps = [72, 75, 78, 69, 70, 81];
    let orders = permutations(&temps);
    assert_eq!(orders.len(), 720);

    for order in orders {
        let mut nest = Nest::new(config()).unwrap();
        nest.add_index("t", vec![GroupByCol::field("time")]).unwrap();
        nest.add_level("t", NestLevel::new("avg", ["time"], vec![agg("temp", AggregateKind::Avg)]))
            .unwrap();
        for temp in order {
            nest.input(&reading(1, 1, Value::Int32(temp))).unwrap();
        }
        let rows = nest.materialize_level("avg", ScanDirection::Forward).unwrap();
        let avg = rows[0].get_by_name("avg_temp").and_then(Value::as_f64).unwrap();
        assert!((avg - 74.166_666_666).abs() < 1e-6, "avg {avg}");
    }
}

#[test]
fn test_commutative_aggregates_ignore_order() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut readings: Vec<(i64, i32, i32)> = (0..600)
        .map(|i| (i % 5, (i % 3) as i32, (i * 37 % 101) as i32))
        .collect();

    let mut results = Vec::new();
    for _ in 0..3 {
        readings.shuffle(&mut rng);
        let mut nest = Nest::new(config()).unwrap();
        nest.add_index("ts", vec![GroupByCol::field("time"), GroupByCol::field("sensor")])
            .unwrap();
        nest.add_level(
            "ts",
            NestLevel::new(
                "stats",
                ["time", "sensor"],
                vec![
                    agg("temp", AggregateKind::Sum),
                    agg("temp", AggregateKind::Min),
                    agg("temp", AggregateKind::Max),
                    agg("temp", AggregateKind::Count),
                ],
            ),
        )
        .unwrap();
        for &(t, s, v) in &readings {
            let stats = nest.input(&reading(t, s, Value::Int32(v))).unwrap();
            assert_eq!(stats.levels_updated, 1);
        }
        let rows = nest.materialize_level("stats", ScanDirection::Forward).unwrap();
        assert_eq!(rows.len(), 15);
        results.push(values(&rows));
    }
    assert_eq!(results[0], results[1]);
    assert_eq!(results[1], results[2]);
}

// =============================================================================
// Shared index
// =============================================================================

#[test]
fn test_levels_share_one_index() {
    let mut nest = shared_nest();
    for _ in 0..6 {
        nest.input(&reading(1_000, 1, 70.0)).unwrap();
    }
    let stats = nest.input(&reading(1_000, 2, 71.0)).unwrap();
    assert_eq!(stats.levels_updated, 2);

    let per_sensor = nest.materialize_level("per_sensor", ScanDirection::Forward).unwrap();
    assert_eq!(
        values(&per_sensor),
        vec![
            vec![Value::Int64(1_000), Value::Int32(1), Value::Int64(6)],
            vec![Value::Int64(1_000), Value::Int32(2), Value::Int64(1)],
        ]
    );
    let per_time = nest.materialize_level("per_time", ScanDirection::Forward).unwrap();
    assert_eq!(values(&per_time), vec![vec![Value::Int64(1_000), Value::Int64(7)]]);

    // (1000, 1), (1000, 2) and the (1000, NULL) entry of the coarser level.
    assert_eq!(nest.index("ts").unwrap().len(), 3);
}

#[test]
fn test_materialize_both_directions() {
    let mut nest = shared_nest();
    for (t, s) in [(20, 1), (10, 2), (10, 1), (30, 1), (20, 2)] {
        nest.input(&reading(t, s, 0.0)).unwrap();
    }

    let forward = nest.materialize(ScanDirection::Forward).unwrap();
    let summary: Vec<(String, Vec<Value>)> = forward
        .iter()
        .map(|r| (r.level.clone(), r.record.values().to_vec()))
        .collect();
    let row = |level: &str, vals: Vec<Value>| (level.to_string(), vals);
    assert_eq!(
        summary,
        vec![
            row("per_sensor", vec![Value::Int64(10), Value::Int32(1), Value::Int64(1)]),
            row("per_sensor", vec![Value::Int64(10), Value::Int32(2), Value::Int64(1)]),
            row("per_time", vec![Value::Int64(10), Value::Int64(2)]),
            row("per_sensor", vec![Value::Int64(20), Value::Int32(1), Value::Int64(1)]),
            row("per_sensor", vec![Value::Int64(20), Value::Int32(2), Value::Int64(1)]),
            row("per_time", vec![Value::Int64(20), Value::Int64(2)]),
            row("per_sensor", vec![Value::Int64(30), Value::Int32(1), Value::Int64(1)]),
            row("per_time", vec![Value::Int64(30), Value::Int64(1)]),
        ]
    );
    assert_eq!(forward[2].record.schema().names(), &["time", "count_star"]);

    let backward = nest.materialize_level("per_time", ScanDirection::Backward).unwrap();
    let times: Vec<Value> = backward.iter().map(|r| r.values()[0].clone()).collect();
    assert_eq!(times, vec![Value::Int64(30), Value::Int64(20), Value::Int64(10)]);
}

fn index_keys(nest: &Nest, name: &str) -> Vec<Vec<Value>> {
    let mut keys = Vec::new();
    nest.index(name)
        .unwrap()
        .scan_all(ScanDirection::Forward, |key, _| {
            keys.push(key.to_vec());
            Ok(())
        })
        .unwrap();
    keys
}

#[test]
fn test_coarse_level_over_finer_index() {
    let mut nest = Nest::new(config()).unwrap();
    nest.add_index("ts", vec![GroupByCol::field("time"), GroupByCol::field("sensor")])
        .unwrap();
    nest.add_level("ts", NestLevel::new("per_time", ["time"], vec![count_star()]))
        .unwrap();
    for s in [1, 2, 3] {
        nest.input(&reading(1, s, 0.0)).unwrap();
    }

    // Every record key gets its entry even though no level groups on it.
    assert_eq!(
        index_keys(&nest, "ts"),
        vec![
            vec![Value::Int64(1), Value::Int32(1)],
            vec![Value::Int64(1), Value::Int32(2)],
            vec![Value::Int64(1), Value::Int32(3)],
            vec![Value::Int64(1), Value::Null],
        ]
    );
    let rows = nest.materialize_level("per_time", ScanDirection::Forward).unwrap();
    assert_eq!(values(&rows), vec![vec![Value::Int64(1), Value::Int64(3)]]);
}

#[test]
fn test_null_group_key_on_first_record() {
    let mut nest = shared_nest();
    let no_sensor = Record::new(schema(), vec![Value::Int64(1), Value::Null, Value::Float64(0.0)]);
    let stats = nest.input(&no_sensor).unwrap();
    assert_eq!(stats.levels_updated, 2);
    assert_eq!(stats.skipped_levels, 0);

    nest.input(&reading(1, 2, 0.0)).unwrap();
    nest.input(&reading(2, 2, 0.0)).unwrap();

    let per_sensor = nest.materialize_level("per_sensor", ScanDirection::Forward).unwrap();
    assert_eq!(
        values(&per_sensor),
        vec![
            vec![Value::Int64(1), Value::Int32(2), Value::Int64(1)],
            vec![Value::Int64(1), Value::Null, Value::Int64(1)],
            vec![Value::Int64(2), Value::Int32(2), Value::Int64(1)],
        ]
    );
    // The NULL-sensor group shares its entry with the coarse (1) group.
    let per_time = nest.materialize_level("per_time", ScanDirection::Forward).unwrap();
    assert_eq!(
        values(&per_time),
        vec![
            vec![Value::Int64(1), Value::Int64(2)],
            vec![Value::Int64(2), Value::Int64(1)],
        ]
    );
    assert_eq!(nest.index("ts").unwrap().len(), 4);
}

fn mixed_nest() -> Nest {
    // Five regions take 104 bytes of mini-page.
    let config = NestConfig {
        node_size: 4096,
        value_size: 128,
    };
    let mut nest = Nest::new(config).unwrap();
    nest.add_index("ts", vec![GroupByCol::field("time"), GroupByCol::field("sensor")])
        .unwrap();
    nest.add_level(
        "ts",
        NestLevel::new(
            "mixed",
            ["time", "sensor"],
            vec![
                count_star(),
                agg("temp", AggregateKind::Max),
                agg("temp", AggregateKind::Min),
                agg("temp", AggregateKind::Sum),
                agg("temp", AggregateKind::Count),
            ],
        ),
    )
    .unwrap();
    nest
}

#[test]
fn test_count_star_survives_null_first_input() {
    let mut nest = mixed_nest();
    let stats = nest.input(&reading(1, 1, Value::Null)).unwrap();
    assert_eq!(stats.levels_updated, 1);
    assert_eq!(stats.skipped_levels, 0);
    nest.input(&reading(1, 1, 70.0)).unwrap();
    nest.input(&reading(1, 1, 64.0)).unwrap();

    let rows = nest.materialize_level("mixed", ScanDirection::Forward).unwrap();
    assert_eq!(
        values(&rows),
        vec![vec![
            Value::Int64(1),
            Value::Int32(1),
            Value::Int64(3),
            Value::Float64(70.0),
            Value::Float64(64.0),
            Value::Float64(134.0),
            Value::Int64(2),
        ]]
    );
}

#[test]
fn test_count_star_survives_missing_first_input() {
    let mut nest = mixed_nest();
    let bare = Record::new(
        Arc::new(Schema::new(["time", "sensor"])),
        vec![Value::Int64(1), Value::Int32(1)],
    );
    let stats = nest.input(&bare).unwrap();
    // MAX, MIN, SUM and COUNT cannot resolve temp; COUNT(*) still counts.
    assert_eq!(stats.skipped_columns, 4);
    assert_eq!(stats.levels_updated, 1);
    let rows = nest.materialize_level("mixed", ScanDirection::Forward).unwrap();
    assert_eq!(
        values(&rows),
        vec![vec![
            Value::Int64(1),
            Value::Int32(1),
            Value::Int64(1),
            Value::Null,
            Value::Null,
            Value::Null,
            Value::Int64(0),
        ]]
    );

    nest.input(&reading(1, 1, 70.0)).unwrap();
    let rows = nest.materialize_level("mixed", ScanDirection::Forward).unwrap();
    assert_eq!(
        rows[0].values()[2..],
        [
            Value::Int64(2),
            Value::Float64(70.0),
            Value::Float64(70.0),
            Value::Float64(70.0),
            Value::Int64(1),
        ]
    );
}

// =============================================================================
// Transforms and resolution
// =============================================================================

fn minute() -> Arc<dyn ValueTransform> {
    Arc::new(FnTransform::new("minute", |v: &Value| match v {
        Value::Int64(t) => Ok(Value::Int64(t - t.rem_euclid(60))),
        other => Err(TesseraError::TransformFailed(format!("not a time: {other}"))),
    }))
}

#[test]
fn test_transformed_group_by() {
    let mut nest = Nest::new(config()).unwrap();
    nest.add_index("m", vec![GroupByCol::derived("minute", "time", minute())])
        .unwrap();
    nest.add_level(
        "m",
        NestLevel::new(
            "per_minute",
            ["minute"],
            vec![count_star(), agg("temp", AggregateKind::Max)],
        ),
    )
    .unwrap();

    for (t, temp) in [(5, 70.0), (59, 71.5), (60, 69.0), (125, 80.0), (61, 68.0)] {
        nest.input(&reading(t, 1, temp)).unwrap();
    }
    let rows = nest.materialize_level("per_minute", ScanDirection::Forward).unwrap();
    assert_eq!(
        values(&rows),
        vec![
            vec![Value::Int64(0), Value::Int64(2), Value::Float64(71.5)],
            vec![Value::Int64(60), Value::Int64(2), Value::Float64(69.0)],
            vec![Value::Int64(120), Value::Int64(1), Value::Float64(80.0)],
        ]
    );
}

#[test]
fn test_failed_transform_skips_record() {
    let mut nest = Nest::new(config()).unwrap();
    nest.add_index("m", vec![GroupByCol::derived("minute", "time", minute())])
        .unwrap();
    nest.add_level("m", NestLevel::new("per_minute", ["minute"], vec![count_star()]))
        .unwrap();

    nest.input(&reading(10, 1, 0.0)).unwrap();
    let odd = Record::new(schema(), vec![Value::Text("noon".into()), Value::Int32(1)]);
    let stats = nest.input(&odd).unwrap();
    assert_eq!(stats.skipped_columns, 1);
    assert_eq!(stats.skipped_levels, 1);
    assert_eq!(stats.levels_updated, 0);

    let rows = nest.materialize_level("per_minute", ScanDirection::Forward).unwrap();
    assert_eq!(values(&rows), vec![vec![Value::Int64(0), Value::Int64(1)]]);
}

#[test]
fn test_transformed_aggregate_input() {
    let fahrenheit: Arc<dyn ValueTransform> = Arc::new(FnTransform::new("f", |v: &Value| {
        v.as_f64()
            .map(|c| Value::Float64(c * 9.0 / 5.0 + 32.0))
            .ok_or_else(|| TesseraError::TransformFailed(format!("not a number: {v}")))
    }));
    let mut nest = Nest::new(config()).unwrap();
    nest.add_index("s", vec![GroupByCol::field("sensor")]).unwrap();
    nest.add_level(
        "s",
        NestLevel::new(
            "hot",
            ["sensor"],
            vec![
                agg("temp", AggregateKind::Max)
                    .with_transform(fahrenheit)
                    .named("max_f"),
                count_star(),
            ],
        ),
    )
    .unwrap();

    nest.input(&reading(1, 4, 100.0)).unwrap();
    nest.input(&reading(2, 4, 0.0)).unwrap();
    let stats = nest.input(&reading(3, 4, "warm")).unwrap();
    // The bad temperature is dropped but COUNT(*) still counts the record.
    assert_eq!(stats.skipped_columns, 1);
    assert_eq!(stats.levels_updated, 1);

    let rows = nest.materialize_level("hot", ScanDirection::Forward).unwrap();
    assert_eq!(rows[0].get_by_name("max_f"), Some(&Value::Float64(212.0)));
    assert_eq!(rows[0].get_by_name("count_star"), Some(&Value::Int64(3)));
}

/// Resolves names case-insensitively.
struct CaseInsensitivePath;

impl SearchPath for CaseInsensitivePath {
    fn resolve(&self, record: &Record, field: &FieldRef) -> Result<Value> {
        let position = match field {
            FieldRef::Position(p) => Some(*p),
            FieldRef::Name(n) => record
                .schema()
                .names()
                .iter()
                .position(|name| name.eq_ignore_ascii_case(n)),
        };
        position
            .and_then(|p| record.get(p))
            .cloned()
            .ok_or_else(|| TesseraError::FieldNotResolved(field.to_string()))
    }
}

#[test]
fn test_custom_search_path() {
    let mut nest = Nest::with_search_path(config(), Box::new(CaseInsensitivePath)).unwrap();
    nest.add_index("s", vec![GroupByCol::field("SENSOR")]).unwrap();
    nest.add_level("s", NestLevel::new("n", ["SENSOR"], vec![agg("Temp", AggregateKind::Sum)]))
        .unwrap();
    nest.input(&reading(1, 1, Value::Int32(5))).unwrap();
    nest.input(&reading(2, 1, Value::Int32(6))).unwrap();

    let rows = nest.materialize_level("n", ScanDirection::Forward).unwrap();
    assert_eq!(values(&rows), vec![vec![Value::Int32(1), Value::Int64(11)]]);
    assert_eq!(rows[0].schema().names(), &["SENSOR", "sum_Temp"]);
}

#[test]
fn test_text_group_keys() {
    let schema = Arc::new(Schema::new(["city", "temp"]));
    let mut nest = Nest::new(config()).unwrap();
    nest.add_index("c", vec![GroupByCol::field("city")]).unwrap();
    nest.add_level("c", NestLevel::new("avg", ["city"], vec![agg("temp", AggregateKind::Avg)]))
        .unwrap();
    for (city, temp) in [("oslo", 2.0), ("lima", 20.0), ("oslo", 4.0), ("cairo", 30.0)] {
        nest.input(&Record::new(schema.clone(), vec![city.into(), temp.into()]))
            .unwrap();
    }
    let rows = nest.materialize_level("avg", ScanDirection::Forward).unwrap();
    assert_eq!(
        values(&rows),
        vec![
            vec![Value::from("cairo"), Value::Float64(30.0)],
            vec![Value::from("lima"), Value::Float64(20.0)],
            vec![Value::from("oslo"), Value::Float64(3.0)],
        ]
    );
}

// =============================================================================
// Capacity and removal
// =============================================================================

#[test]
fn test_full_mini_page_skips_level() {
    // 32 bytes: 24 for regions, room for one 16-byte COUNT(*) region only.
    let config = NestConfig {
        node_size: 512,
        value_size: 32,
    };
    let mut nest = Nest::new(config).unwrap();
    nest.add_index("t", vec![GroupByCol::field("time")]).unwrap();
    nest.add_level("t", NestLevel::new("first", ["time"], vec![count_star()]))
        .unwrap();
    nest.add_level("t", NestLevel::new("second", ["time"], vec![count_star()]))
        .unwrap();

    let stats = nest.input(&reading(1, 1, 0.0)).unwrap();
    assert_eq!(stats.levels_updated, 1);
    assert_eq!(stats.skipped_levels, 1);
    nest.input(&reading(1, 1, 0.0)).unwrap();

    let first = nest.materialize_level("first", ScanDirection::Forward).unwrap();
    assert_eq!(values(&first), vec![vec![Value::Int64(1), Value::Int64(2)]]);
    assert!(nest
        .materialize_level("second", ScanDirection::Forward)
        .unwrap()
        .is_empty());
}

#[test]
fn test_remove_group_keeps_shared_entry() {
    let mut nest = shared_nest();
    for s in [1, 1, 2] {
        nest.input(&reading(5, s, 0.0)).unwrap();
    }

    // Removing the coarse group deletes its (5, NULL) entry.
    let removed = nest.remove_group("per_time", &[Value::Int64(5)]).unwrap().unwrap();
    assert_eq!(removed.values(), &[Value::Int64(5), Value::Int64(3)]);
    assert_eq!(nest.index("ts").unwrap().len(), 2);
    assert!(nest
        .materialize_level("per_time", ScanDirection::Forward)
        .unwrap()
        .is_empty());

    let removed = nest
        .remove_group("per_sensor", &[Value::Int64(5), Value::Int32(1)])
        .unwrap()
        .unwrap();
    assert_eq!(removed.get_by_name("count_star"), Some(&Value::Int64(2)));
    // (5, 1) is a record key, so its entry stays.
    assert_eq!(nest.index("ts").unwrap().len(), 2);

    // The group comes back from scratch.
    nest.input(&reading(5, 1, 0.0)).unwrap();
    let rows = nest.materialize_level("per_sensor", ScanDirection::Forward).unwrap();
    assert_eq!(
        values(&rows),
        vec![
            vec![Value::Int64(5), Value::Int32(1), Value::Int64(1)],
            vec![Value::Int64(5), Value::Int32(2), Value::Int64(1)],
        ]
    );
}

#[test]
fn test_many_groups_split_the_index() {
    let mut nest = Nest::new(config()).unwrap();
    nest.add_index("ts", vec![GroupByCol::field("time"), GroupByCol::field("sensor")])
        .unwrap();
    nest.add_level("ts", NestLevel::new("n", ["time", "sensor"], vec![count_star()]))
        .unwrap();

    let mut keys: Vec<(i64, i32)> = (0..200).flat_map(|t| (0..3).map(move |s| (t, s))).collect();
    keys.shuffle(&mut StdRng::seed_from_u64(11));
    for &(t, s) in &keys {
        nest.input(&reading(t, s, 0.0)).unwrap();
    }

    let index = nest.index("ts").unwrap().index().unwrap();
    assert!(index.depth() > 1);
    index.check_invariants().unwrap();

    let rows = nest.materialize_level("n", ScanDirection::Backward).unwrap();
    assert_eq!(rows.len(), 600);
    assert_eq!(rows[0].values()[..2], [Value::Int64(199), Value::Int32(2)]);
    assert_eq!(rows[599].values()[..2], [Value::Int64(0), Value::Int32(0)]);
}

// =============================================================================
// Configuration
// =============================================================================

#[test]
fn test_nest_config_serde_roundtrip() {
    let original = NestConfig {
        node_size: 2048,
        value_size: 96,
    };
    let json = serde_json::to_string(&original).unwrap();
    let restored: NestConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(restored.node_size, 2048);
    assert_eq!(restored.value_size, 96);
    assert!(Nest::new(restored).is_ok());
}

#[test]
fn test_invalid_config_rejected() {
    let config = NestConfig {
        node_size: 1024,
        value_size: 4096,
    };
    assert!(matches!(Nest::new(config), Err(TesseraError::ConfigError(_))));
}
