//! Group-by and aggregate column descriptors.

use crate::accum::AccumulatorFactory;
use std::sync::Arc;
use tessera_common::{Result, TesseraError, Value};
use tessera_storage::{FieldRef, Record, SearchPath};

/// Derives a value from a resolved field, e.g. a time bucket.
pub trait ValueTransform: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, value: &Value) -> Result<Value>;
}

/// `ValueTransform` backed by a closure.
pub struct FnTransform<F> {
    name: String,
    f: F,
}

impl<F> FnTransform<F>
where
    F: Fn(&Value) -> Result<Value> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> ValueTransform for FnTransform<F>
where
    F: Fn(&Value) -> Result<Value> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, value: &Value) -> Result<Value> {
        (self.f)(value)
    }
}

/// Resolves `field` and runs the optional transform over it.
fn derive(
    record: &Record,
    path: &dyn SearchPath,
    field: &FieldRef,
    transform: Option<&Arc<dyn ValueTransform>>,
) -> Result<Value> {
    let value = path.resolve(record, field)?;
    match transform {
        None => Ok(value),
        Some(t) => t.apply(&value).map_err(|e| match e {
            TesseraError::TransformFailed(_) => e,
            other => TesseraError::TransformFailed(format!("{}: {}", t.name(), other)),
        }),
    }
}

/// A GROUP BY column: a record field, optionally transformed.
#[derive(Clone)]
pub struct GroupByCol {
    name: String,
    field: FieldRef,
    transform: Option<Arc<dyn ValueTransform>>,
}

impl GroupByCol {
    /// Groups on the field itself, named after it.
    pub fn field(field: impl Into<FieldRef>) -> Self {
        let field = field.into();
        Self {
            name: field.to_string(),
            field,
            transform: None,
        }
    }

    /// Groups on `transform(field)`.
    pub fn derived(
        name: impl Into<String>,
        field: impl Into<FieldRef>,
        transform: Arc<dyn ValueTransform>,
    ) -> Self {
        Self {
            name: name.into(),
            field: field.into(),
            transform: Some(transform),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_ref(&self) -> &FieldRef {
        &self.field
    }

    pub fn resolve(&self, record: &Record, path: &dyn SearchPath) -> Result<Value> {
        derive(record, path, &self.field, self.transform.as_ref())
    }
}

impl std::fmt::Debug for GroupByCol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupByCol")
            .field("name", &self.name)
            .field("field", &self.field)
            .field("transform", &self.transform.as_ref().map(|t| t.name()))
            .finish()
    }
}

/// An aggregate output column.
#[derive(Clone)]
pub struct NestAggCol {
    name: String,
    /// None for COUNT(*).
    field: Option<FieldRef>,
    transform: Option<Arc<dyn ValueTransform>>,
    factory: Arc<dyn AccumulatorFactory>,
}

impl NestAggCol {
    /// Aggregates `field` with `factory`, named `<factory>_<field>`.
    pub fn new(field: impl Into<FieldRef>, factory: Arc<dyn AccumulatorFactory>) -> Self {
        let field = field.into();
        Self {
            name: format!("{}_{}", factory.name(), field),
            field: Some(field),
            transform: None,
            factory,
        }
    }

    /// Aggregates without an input field; the accumulator sees NULL for
    /// every record.
    pub fn count_star(factory: Arc<dyn AccumulatorFactory>) -> Self {
        Self {
            name: factory.name().to_string(),
            field: None,
            transform: None,
            factory,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_transform(mut self, transform: Arc<dyn ValueTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn factory(&self) -> &Arc<dyn AccumulatorFactory> {
        &self.factory
    }

    /// Resolves the value fed to the accumulator for `record`.
    pub fn resolve(&self, record: &Record, path: &dyn SearchPath) -> Result<Value> {
        match &self.field {
            None => Ok(Value::Null),
            Some(field) => derive(record, path, field, self.transform.as_ref()),
        }
    }
}

impl std::fmt::Debug for NestAggCol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NestAggCol")
            .field("name", &self.name)
            .field("field", &self.field)
            .field("factory", &self.factory.name())
            .finish()
    }
}
