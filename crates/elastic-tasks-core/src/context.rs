//! Per-run variable context for the template resolver.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};

/// A typed template variable.
///
/// Format specs change how a value is written, never its type.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
}

impl TemplateValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Bool(_) => "boolean",
            Self::Date(_) => "date",
            Self::DateTime(_) => "datetime",
        }
    }
}

impl fmt::Display for TemplateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Integer(n) => write!(f, "{n}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Self::DateTime(dt) => f.write_str(&dt.to_rfc3339_opts(SecondsFormat::Secs, true)),
        }
    }
}

impl From<&str> for TemplateValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for TemplateValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for TemplateValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for TemplateValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for TemplateValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<NaiveDate> for TemplateValue {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

impl From<DateTime<Utc>> for TemplateValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::DateTime(value)
    }
}

/// Variables visible to one run. Created fresh per trigger.
///
/// Ambient variables set by [`RunContext::new`]:
///
/// | Name | Type | Value |
/// |------|------|-------|
/// | `task_id` | text | the task identifier |
/// | `trigger`, `now` | datetime | the trigger timestamp |
/// | `today`, `yesterday`, `tomorrow` | date | UTC calendar days around the trigger |
/// | `last_run` | datetime | previous recorded run cursor, or the UNIX epoch |
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    task_id: String,
    trigger: DateTime<Utc>,
    variables: BTreeMap<String, TemplateValue>,
}

impl RunContext {
    pub fn new(task_id: impl Into<String>, trigger: DateTime<Utc>) -> Self {
        let task_id = task_id.into();
        let today = trigger.date_naive();

        let mut variables = BTreeMap::new();
        variables.insert("task_id".to_string(), TemplateValue::Text(task_id.clone()));
        variables.insert("trigger".to_string(), TemplateValue::DateTime(trigger));
        variables.insert("now".to_string(), TemplateValue::DateTime(trigger));
        variables.insert("today".to_string(), TemplateValue::Date(today));
        variables.insert(
            "yesterday".to_string(),
            TemplateValue::Date(today - Duration::days(1)),
        );
        variables.insert(
            "tomorrow".to_string(),
            TemplateValue::Date(today + Duration::days(1)),
        );
        variables.insert(
            "last_run".to_string(),
            TemplateValue::DateTime(DateTime::<Utc>::UNIX_EPOCH),
        );

        Self {
            task_id,
            trigger,
            variables,
        }
    }

    /// Set the prior run cursor. `None` keeps the epoch fallback.
    pub fn with_last_run(mut self, last_run: Option<DateTime<Utc>>) -> Self {
        if let Some(ts) = last_run {
            self.variables
                .insert("last_run".to_string(), TemplateValue::DateTime(ts));
        }
        self
    }

    /// Set (or replace) a variable.
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<TemplateValue>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Add task-level variables. Existing names are never shadowed.
    pub fn with_defaults<'a, I>(mut self, defaults: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a TemplateValue)>,
    {
        for (name, value) in defaults {
            self.variables
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&TemplateValue> {
        self.variables.get(name)
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn trigger(&self) -> DateTime<Utc> {
        self.trigger
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.variables.keys().map(String::as_str)
    }
}
