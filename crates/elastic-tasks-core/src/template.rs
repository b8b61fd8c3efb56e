//! Template resolver for task request bodies.
//!
//! A body template is text with placeholders of the form `{{name}}` or
//! `{{name:spec}}`. Resolution happens in two explicit steps:
//!
//! 1. [`Template::parse`] makes a single left-to-right pass over the text
//!    and produces a list of [`Segment`]s (literal text or a placeholder
//!    with a parsed [`FormatSpec`]). Syntax errors surface here.
//! 2. [`Template::render`] evaluates the segments against a
//!    [`RunContext`]. Unknown names and specs that do not fit the value's
//!    type surface here.
//!
//! Both steps are pure: no I/O, no global state. The same
//! `(template, context)` pair always resolves to the same output, and a
//! partially resolved body is never returned.
//!
//! # Format specs
//!
//! | Spec | Applies to | Output |
//! |------|-----------|--------|
//! | *(none)* | any | default rendering (dates as `yyyy-MM-dd`, datetimes as RFC 3339) |
//! | `05` | integer | zero-padded to width 5 |
//! | `.2` | float | two decimals |
//! | `json` | any | JSON literal (strings quoted and escaped) |
//! | `upper`, `lower` | text | case-converted |
//! | `iso` | date, datetime | ISO 8601 |
//! | `epoch_millis`, `epoch_second` | date, datetime | UNIX timestamp |
//! | `yyyy-MM-dd'T'HH:mm` | date, datetime | date pattern |
//!
//! Date patterns understand `yyyy`, `yy`, `MM`, `dd`, `HH`, `mm`, `ss` and
//! `SSS`; text inside single quotes and any non-letter character are
//! copied through.
//!
//! # Example
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use elastic_tasks_core::context::RunContext;
//! use elastic_tasks_core::template::Template;
//!
//! let ctx = RunContext::new("daily", Utc.with_ymd_and_hms(2024, 3, 5, 2, 0, 0).unwrap());
//! let tpl = Template::parse(r#"{"query":{"term":{"date":"{{today:yyyy-MM-dd}}"}}}"#).unwrap();
//! assert_eq!(tpl.render(&ctx).unwrap(), r#"{"query":{"term":{"date":"2024-03-05"}}}"#);
//! ```

use chrono::{DateTime, NaiveTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::context::{RunContext, TemplateValue};
use crate::error::TemplateError;
use crate::models::TaskDefinition;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// One token of a date pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateToken {
    Year4,
    Year2,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    Millis,
    Literal(String),
}

/// Parsed `:spec` part of a placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatSpec {
    Width(usize),
    Precision(usize),
    Json,
    Upper,
    Lower,
    Iso,
    EpochMillis,
    EpochSecond,
    Pattern(Vec<DateToken>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub name: String,
    pub spec: Option<FormatSpec>,
    /// Byte offset of the opening `{{` in the source.
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Placeholder(Placeholder),
}

/// A parsed body template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut cursor = 0;

        while let Some(rel) = source[cursor..].find(OPEN) {
            let open = cursor + rel;
            literal.push_str(&source[cursor..open]);

            let inner_start = open + OPEN.len();
            let close = source[inner_start..]
                .find(CLOSE)
                .map(|r| inner_start + r)
                .ok_or_else(|| TemplateError::invalid_format(open, "unterminated placeholder"))?;

            let placeholder = parse_placeholder(&source[inner_start..close], open)?;
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Placeholder(placeholder));
            cursor = close + CLOSE.len();
        }

        literal.push_str(&source[cursor..]);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Names referenced by this template, in order of appearance.
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder(p) => Some(p.name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    pub fn render(&self, ctx: &RunContext) -> Result<String, TemplateError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(p) => {
                    let value = ctx.get(&p.name).ok_or_else(|| TemplateError::UnknownVariable {
                        name: p.name.clone(),
                    })?;
                    out.push_str(&format_value(value, p.spec.as_ref(), p.offset)?);
                }
            }
        }
        Ok(out)
    }
}

fn parse_placeholder(inner: &str, offset: usize) -> Result<Placeholder, TemplateError> {
    let (name, spec) = match inner.split_once(':') {
        Some((name, spec)) => (name.trim(), Some(spec.trim())),
        None => (inner.trim(), None),
    };

    if !is_valid_name(name) {
        return Err(TemplateError::invalid_format(
            offset,
            format!("invalid placeholder name '{name}'"),
        ));
    }

    let spec = spec
        .map(|s| parse_spec(s, offset))
        .transpose()?;

    Ok(Placeholder {
        name: name.to_string(),
        spec,
        offset,
    })
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

fn parse_spec(spec: &str, offset: usize) -> Result<FormatSpec, TemplateError> {
    if spec.is_empty() {
        return Err(TemplateError::invalid_format(offset, "empty format spec"));
    }
    if spec.bytes().all(|b| b.is_ascii_digit()) {
        return parse_bounded(spec, offset, "width").map(FormatSpec::Width);
    }
    if let Some(digits) = spec.strip_prefix('.') {
        return parse_bounded(digits, offset, "precision").map(FormatSpec::Precision);
    }
    match spec {
        "json" => Ok(FormatSpec::Json),
        "upper" => Ok(FormatSpec::Upper),
        "lower" => Ok(FormatSpec::Lower),
        "iso" => Ok(FormatSpec::Iso),
        "epoch_millis" => Ok(FormatSpec::EpochMillis),
        "epoch_second" => Ok(FormatSpec::EpochSecond),
        pattern => parse_date_pattern(pattern, offset).map(FormatSpec::Pattern),
    }
}

/// Width and precision above this are rejected; `format!` panics on
/// runtime arguments past `u16::MAX`.
const MAX_PADDING: usize = 64;

fn parse_bounded(digits: &str, offset: usize, what: &str) -> Result<usize, TemplateError> {
    match digits.parse::<usize>() {
        Ok(n) if n <= MAX_PADDING => Ok(n),
        Ok(n) => Err(TemplateError::invalid_format(
            offset,
            format!("{what} {n} exceeds {MAX_PADDING}"),
        )),
        Err(_) => Err(TemplateError::invalid_format(
            offset,
            format!("invalid {what} '{digits}'"),
        )),
    }
}

fn parse_date_pattern(pattern: &str, offset: usize) -> Result<Vec<DateToken>, TemplateError> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '\'' {
            let end = chars[i + 1..]
                .iter()
                .position(|&q| q == '\'')
                .map(|p| i + 1 + p)
                .ok_or_else(|| {
                    TemplateError::invalid_format(offset, "unterminated quote in date pattern")
                })?;
            tokens.push(DateToken::Literal(chars[i + 1..end].iter().collect()));
            i = end + 1;
        } else if c.is_ascii_alphabetic() {
            let run = chars[i..].iter().take_while(|&&x| x == c).count();
            let token = match (c, run) {
                ('y', 4) => DateToken::Year4,
                ('y', 2) => DateToken::Year2,
                ('M', 2) => DateToken::Month,
                ('d', 2) => DateToken::Day,
                ('H', 2) => DateToken::Hour,
                ('m', 2) => DateToken::Minute,
                ('s', 2) => DateToken::Second,
                ('S', 3) => DateToken::Millis,
                _ => {
                    let field: String = std::iter::repeat(c).take(run).collect();
                    return Err(TemplateError::invalid_format(
                        offset,
                        format!("unsupported date pattern field '{field}'"),
                    ));
                }
            };
            tokens.push(token);
            i += run;
        } else {
            tokens.push(DateToken::Literal(c.to_string()));
            i += 1;
        }
    }

    Ok(tokens)
}

fn format_value(
    value: &TemplateValue,
    spec: Option<&FormatSpec>,
    offset: usize,
) -> Result<String, TemplateError> {
    let spec = match spec {
        None => return Ok(value.to_string()),
        Some(spec) => spec,
    };

    let mismatch = || {
        TemplateError::invalid_format(
            offset,
            format!("format {:?} does not apply to a {} value", spec, value.type_name()),
        )
    };

    match (spec, value) {
        (FormatSpec::Json, v) => Ok(to_json(v).to_string()),
        (FormatSpec::Width(w), TemplateValue::Integer(n)) => Ok(format!("{:0w$}", n, w = *w)),
        (FormatSpec::Precision(p), TemplateValue::Float(x)) => Ok(format!("{:.p$}", x, p = *p)),
        (FormatSpec::Upper, TemplateValue::Text(s)) => Ok(s.to_uppercase()),
        (FormatSpec::Lower, TemplateValue::Text(s)) => Ok(s.to_lowercase()),
        (FormatSpec::Iso, TemplateValue::Date(d)) => Ok(d.format("%Y-%m-%d").to_string()),
        (FormatSpec::Iso, TemplateValue::DateTime(dt)) => {
            Ok(dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        }
        (FormatSpec::EpochMillis, v) => as_datetime(v)
            .map(|dt| dt.timestamp_millis().to_string())
            .ok_or_else(mismatch),
        (FormatSpec::EpochSecond, v) => as_datetime(v)
            .map(|dt| dt.timestamp().to_string())
            .ok_or_else(mismatch),
        (FormatSpec::Pattern(tokens), v) => as_datetime(v)
            .map(|dt| render_pattern(&dt, tokens))
            .ok_or_else(mismatch),
        _ => Err(mismatch()),
    }
}

fn as_datetime(value: &TemplateValue) -> Option<DateTime<Utc>> {
    match value {
        TemplateValue::Date(d) => Some(d.and_time(NaiveTime::MIN).and_utc()),
        TemplateValue::DateTime(dt) => Some(*dt),
        _ => None,
    }
}

fn render_pattern(dt: &DateTime<Utc>, tokens: &[DateToken]) -> String {
    let mut fmt = String::new();
    for token in tokens {
        match token {
            DateToken::Year4 => fmt.push_str("%Y"),
            DateToken::Year2 => fmt.push_str("%y"),
            DateToken::Month => fmt.push_str("%m"),
            DateToken::Day => fmt.push_str("%d"),
            DateToken::Hour => fmt.push_str("%H"),
            DateToken::Minute => fmt.push_str("%M"),
            DateToken::Second => fmt.push_str("%S"),
            DateToken::Millis => fmt.push_str("%3f"),
            DateToken::Literal(text) => fmt.push_str(&text.replace('%', "%%")),
        }
    }
    dt.format(&fmt).to_string()
}

fn to_json(value: &TemplateValue) -> Value {
    match value {
        TemplateValue::Text(s) => Value::String(s.clone()),
        TemplateValue::Integer(n) => Value::from(*n),
        TemplateValue::Float(x) => Value::from(*x),
        TemplateValue::Bool(b) => Value::Bool(*b),
        other => Value::String(other.to_string()),
    }
}

/// A fully resolved, syntactically complete request.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRequest {
    pub body: Value,
    /// Resolved target document for single-document updates.
    pub document_id: Option<String>,
}

/// Resolve a body template into a JSON request body.
pub fn resolve(body_template: &str, ctx: &RunContext) -> Result<ResolvedRequest, TemplateError> {
    let text = Template::parse(body_template)?.render(ctx)?;
    let body = serde_json::from_str(&text).map_err(|e| TemplateError::MalformedBody(e.to_string()))?;
    Ok(ResolvedRequest {
        body,
        document_id: None,
    })
}

/// Resolve everything a task needs before dispatch: body and document id.
pub fn resolve_task(
    definition: &TaskDefinition,
    ctx: &RunContext,
) -> Result<ResolvedRequest, TemplateError> {
    let mut request = resolve(&definition.body, ctx)?;
    if let Some(id_template) = &definition.document_id {
        let id = Template::parse(id_template)?.render(ctx)?;
        if id.trim().is_empty() {
            return Err(TemplateError::MalformedBody(
                "document id resolved to an empty string".to_string(),
            ));
        }
        request.document_id = Some(id);
    }
    Ok(request)
}
