//! Task executor: one Elasticsearch call per run, classified into a
//! [`RunOutcome`].
//!
//! | Operation | Request | Affected documents |
//! |-----------|---------|--------------------|
//! | `search` | `POST /{index}/_search` | `hits.total` |
//! | `update` + `document_id` | `POST /{index}/_update/{id}` | 1, or 0 for `noop` |
//! | `update` | `POST /{index}/_update_by_query` | `updated` |
//! | `bulk-update` | `POST /_bulk` (NDJSON) | items that succeeded |
//!
//! Errors never escape [`execute`]: transport failures, non-2xx answers and
//! malformed responses all become a failed outcome whose error carries the
//! upstream status and body verbatim. Nothing is retried.

use std::time::Duration;

use elastic_tasks_core::error::{BulkItemFailure, ConfigError, ExecutionError, TemplateError};
use elastic_tasks_core::models::{OperationKind, TaskDefinition};
use elastic_tasks_core::outcome::{aggregate_bulk, BulkItemResult, RunOutcome};
use elastic_tasks_core::template::ResolvedRequest;
use reqwest::{Method, RequestBuilder};
use serde_json::{json, Map, Value};
use tokio::sync::watch;

use crate::connection::ClientHandle;

/// Cancellation signal from the scheduler. Sending `true` cancels the run.
pub type CancelSignal = watch::Receiver<bool>;

/// Keys of a bulk item that are forwarded as the update payload.
const BULK_PAYLOAD_KEYS: &[&str] = &["doc", "script", "doc_as_upsert", "upsert", "scripted_upsert"];

/// Dispatch `request` and classify the result.
pub async fn execute(
    handle: &ClientHandle,
    definition: &TaskDefinition,
    index: Option<&str>,
    request: &ResolvedRequest,
) -> RunOutcome {
    let result = match definition.operation {
        OperationKind::Search => match require_index(index) {
            Ok(index) => search(handle, definition, index, &request.body).await,
            Err(e) => return RunOutcome::failed(e),
        },
        OperationKind::Update => match require_index(index) {
            Ok(index) => match &request.document_id {
                Some(id) => update_document(handle, index, id, &request.body).await,
                None => update_by_query(handle, index, &request.body).await,
            },
            Err(e) => return RunOutcome::failed(e),
        },
        OperationKind::BulkUpdate => {
            let lines = match bulk_lines(index, &request.body) {
                Ok(lines) => lines,
                Err(e) => return RunOutcome::failed(e),
            };
            bulk_update(handle, lines).await
        }
    };
    result.unwrap_or_else(RunOutcome::failed)
}

/// [`execute`], raced against a deadline and an optional cancel signal.
///
/// Either one firing abandons the in-flight request and fails the run with
/// [`ExecutionError::Timeout`]. Writes Elasticsearch already applied stay
/// applied.
pub async fn execute_until(
    handle: &ClientHandle,
    definition: &TaskDefinition,
    index: Option<&str>,
    request: &ResolvedRequest,
    deadline: Duration,
    cancel: Option<CancelSignal>,
) -> RunOutcome {
    tokio::select! {
        outcome = tokio::time::timeout(deadline, execute(handle, definition, index, request)) => {
            outcome.unwrap_or_else(|_| {
                RunOutcome::failed(ExecutionError::Timeout(format!(
                    "run exceeded its deadline of {}s",
                    deadline.as_secs()
                )))
            })
        }
        _ = cancelled(cancel) => {
            RunOutcome::failed(ExecutionError::Timeout("run cancelled by scheduler".into()))
        }
    }
}

async fn cancelled(cancel: Option<CancelSignal>) {
    if let Some(mut rx) = cancel {
        if rx.wait_for(|c| *c).await.is_ok() {
            return;
        }
    }
    // No signal, or the sender went away without cancelling.
    std::future::pending::<()>().await
}

fn require_index(index: Option<&str>) -> Result<&str, ConfigError> {
    index
        .filter(|i| !i.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingOption("index".into()))
}

async fn search(
    handle: &ClientHandle,
    definition: &TaskDefinition,
    index: &str,
    body: &Value,
) -> Result<RunOutcome, ExecutionError> {
    let path = format!("{}/_search", encode_segment(index));
    let response = send_json(handle.request(Method::POST, &path).json(body)).await?;

    let count = hits_total(&response)?;
    let report = hit_report(&response, &definition.log_fields);

    tracing::debug!(task_id = %definition.id, index, count, "search completed");

    if let Some(expected) = &definition.expected_results {
        if !expected.contains(count) {
            let mut outcome = RunOutcome::failed(ExecutionError::UnexpectedResults {
                count,
                expected: expected.to_string(),
            })
            .with_report(report);
            outcome.affected_documents = count;
            return Ok(outcome);
        }
    }
    Ok(RunOutcome::succeeded(count, report))
}

/// `hits.total.value`, or the pre-7.0 numeric `hits.total`.
fn hits_total(response: &Value) -> Result<u64, ExecutionError> {
    let total = response
        .get("hits")
        .and_then(|h| h.get("total"))
        .ok_or_else(|| ExecutionError::InvalidResponse("search response has no hits.total".into()))?;
    total
        .as_u64()
        .or_else(|| total.get("value").and_then(Value::as_u64))
        .ok_or_else(|| ExecutionError::InvalidResponse(format!("unrecognized hits.total: {total}")))
}

/// One line per hit: `_id` followed by the requested `_source` fields.
fn hit_report(response: &Value, fields: &[String]) -> Option<String> {
    if fields.is_empty() {
        return None;
    }
    let hits = response
        .get("hits")
        .and_then(|h| h.get("hits"))
        .and_then(Value::as_array)?;

    let lines: Vec<String> = hits
        .iter()
        .map(|hit| {
            let id = hit.get("_id").and_then(Value::as_str).unwrap_or("?");
            let source = hit.get("_source");
            let values: Vec<String> = fields
                .iter()
                .map(|field| {
                    let value = source
                        .and_then(|s| lookup_path(s, field))
                        .map(|v| match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .unwrap_or_else(|| "-".to_string());
                    format!("{field}={value}")
                })
                .collect();
            format!("{id}: {}", values.join(", "))
        })
        .collect();

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Look up a dotted path, preferring a literal dotted key when present.
fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(v) = value.get(path) {
        return Some(v);
    }
    path.split('.').try_fold(value, |v, key| v.get(key))
}

async fn update_document(
    handle: &ClientHandle,
    index: &str,
    id: &str,
    body: &Value,
) -> Result<RunOutcome, ExecutionError> {
    let path = format!("{}/_update/{}", encode_segment(index), encode_segment(id));
    let response = send_json(handle.request(Method::POST, &path).json(body)).await?;

    let result = response
        .get("result")
        .and_then(Value::as_str)
        .ok_or_else(|| ExecutionError::InvalidResponse("update response has no result".into()))?;
    let affected = match result {
        "noop" => 0,
        _ => 1,
    };
    Ok(RunOutcome::succeeded(affected, None))
}

async fn update_by_query(
    handle: &ClientHandle,
    index: &str,
    body: &Value,
) -> Result<RunOutcome, ExecutionError> {
    let path = format!("{}/_update_by_query", encode_segment(index));
    let response = send_json(handle.request(Method::POST, &path).json(body)).await?;

    let updated = response.get("updated").and_then(Value::as_u64).ok_or_else(|| {
        ExecutionError::InvalidResponse("update_by_query response has no updated count".into())
    })?;

    let failures: Vec<BulkItemFailure> = response
        .get("failures")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|f| BulkItemFailure {
                    id: f
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    status: status_of(f),
                    reason: error_reason(f.get("cause")),
                })
                .collect()
        })
        .unwrap_or_default();

    if failures.is_empty() {
        Ok(RunOutcome::succeeded(updated, None))
    } else {
        Ok(RunOutcome::failed(ExecutionError::BulkItemsFailed {
            total: updated as usize + failures.len(),
            failures,
        }))
    }
}

/// Translate the resolved bulk body into NDJSON action/payload lines.
///
/// The body must be an array of objects with an `_id`, an optional
/// `_index` (defaulting to the task index), and at least `doc` or `script`.
fn bulk_lines(index: Option<&str>, body: &Value) -> Result<Vec<Value>, TemplateError> {
    let items = body.as_array().ok_or_else(|| {
        TemplateError::MalformedBody("bulk-update body must be a JSON array of items".into())
    })?;

    let mut lines = Vec::with_capacity(items.len() * 2);
    for (pos, item) in items.iter().enumerate() {
        let item = item.as_object().ok_or_else(|| {
            TemplateError::MalformedBody(format!("bulk item {pos} is not an object"))
        })?;
        let id = match item.get("_id") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(TemplateError::MalformedBody(format!(
                    "bulk item {pos} has no _id"
                )))
            }
        };
        let item_index = match item.get("_index") {
            Some(Value::String(s)) => s.as_str(),
            Some(_) => {
                return Err(TemplateError::MalformedBody(format!(
                    "bulk item {pos} has a non-string _index"
                )))
            }
            None => index.ok_or_else(|| {
                TemplateError::MalformedBody(format!(
                    "bulk item {pos} has no _index and the task has no index"
                ))
            })?,
        };

        let payload: Map<String, Value> = item
            .iter()
            .filter(|(k, _)| BULK_PAYLOAD_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if !payload.contains_key("doc") && !payload.contains_key("script") {
            return Err(TemplateError::MalformedBody(format!(
                "bulk item {pos} needs a doc or a script"
            )));
        }

        lines.push(json!({ "update": { "_index": item_index, "_id": id } }));
        lines.push(Value::Object(payload));
    }
    Ok(lines)
}

async fn bulk_update(handle: &ClientHandle, lines: Vec<Value>) -> Result<RunOutcome, ExecutionError> {
    if lines.is_empty() {
        return Ok(RunOutcome::succeeded(0, None));
    }

    let mut ndjson = String::new();
    for line in &lines {
        ndjson.push_str(&line.to_string());
        ndjson.push('\n');
    }

    let request = handle
        .request(Method::POST, "_bulk")
        .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
        .body(ndjson);
    let response = send_json(request).await?;

    let items = response
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| ExecutionError::InvalidResponse("bulk response has no items".into()))?;

    let results = items
        .iter()
        .map(|entry| {
            let item = entry
                .get("update")
                .or_else(|| entry.as_object().and_then(|o| o.values().next()))
                .ok_or_else(|| ExecutionError::InvalidResponse(format!("bad bulk item: {entry}")))?;
            Ok(BulkItemResult {
                id: item
                    .get("_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                status: status_of(item),
                error: item.get("error").map(|e| error_reason(Some(e))),
            })
        })
        .collect::<Result<Vec<_>, ExecutionError>>()?;

    if results.len() * 2 != lines.len() {
        return Err(ExecutionError::InvalidResponse(format!(
            "bulk response has {} items for {} requests",
            results.len(),
            lines.len() / 2
        )));
    }

    Ok(aggregate_bulk(&results))
}

fn status_of(item: &Value) -> u16 {
    item.get("status")
        .and_then(Value::as_u64)
        .and_then(|s| u16::try_from(s).ok())
        .unwrap_or(0)
}

/// `type: reason` of an Elasticsearch error object.
fn error_reason(error: Option<&Value>) -> String {
    match error {
        Some(Value::Object(e)) => {
            let reason = e.get("reason").and_then(Value::as_str).unwrap_or("unknown");
            match e.get("type").and_then(Value::as_str) {
                Some(kind) => format!("{kind}: {reason}"),
                None => reason.to_string(),
            }
        }
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "unknown".to_string(),
    }
}

async fn send_json(request: RequestBuilder) -> Result<Value, ExecutionError> {
    let response = request.send().await.map_err(transport_error)?;
    let status = response.status();
    let text = response.text().await.map_err(transport_error)?;

    if !status.is_success() {
        let message = if text.trim().is_empty() {
            status.canonical_reason().unwrap_or("no response body").to_string()
        } else {
            text
        };
        return Err(ExecutionError::UpstreamError {
            status: status.as_u16(),
            message,
        });
    }

    serde_json::from_str(&text)
        .map_err(|e| ExecutionError::InvalidResponse(format!("response is not JSON: {e}")))
}

fn transport_error(err: reqwest::Error) -> ExecutionError {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    if err.is_timeout() {
        ExecutionError::Timeout(message)
    } else {
        ExecutionError::ConnectionFailed(message)
    }
}

/// Percent-encode one URL path segment.
fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for b in segment.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'*' | b','
            | b'+' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hits_total_both_shapes() {
        assert_eq!(
            hits_total(&json!({"hits": {"total": {"value": 7, "relation": "eq"}}})).unwrap(),
            7
        );
        assert_eq!(hits_total(&json!({"hits": {"total": 3}})).unwrap(), 3);
        assert_eq!(
            hits_total(&json!({"took": 1})).unwrap_err().kind(),
            "execution.invalid_response"
        );
    }

    #[test]
    fn test_hit_report_fields() {
        let response = json!({"hits": {"hits": [
            {"_id": "1", "_source": {"user": "ann", "geo": {"city": "Oslo"}}},
            {"_id": "2", "_source": {"user": "bob"}},
        ]}});
        let report = hit_report(&response, &["user".into(), "geo.city".into()]).unwrap();
        assert_eq!(report, "1: user=ann, geo.city=Oslo\n2: user=bob, geo.city=-");
        assert!(hit_report(&response, &[]).is_none());
    }

    #[test]
    fn test_bulk_lines_defaults_index() {
        let body = json!([
            {"_id": "a", "doc": {"flag": true}},
            {"_id": 7, "_index": "other", "script": {"source": "ctx._source.n++"}},
        ]);
        let lines = bulk_lines(Some("main"), &body).unwrap();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], json!({"update": {"_index": "main", "_id": "a"}}));
        assert_eq!(lines[1], json!({"doc": {"flag": true}}));
        assert_eq!(lines[2], json!({"update": {"_index": "other", "_id": "7"}}));
    }

    #[test]
    fn test_bulk_lines_rejects_bad_items() {
        assert!(bulk_lines(Some("i"), &json!({"_id": "a"})).is_err());
        assert!(bulk_lines(Some("i"), &json!([{"doc": {}}])).is_err());
        assert!(bulk_lines(Some("i"), &json!([{"_id": "a"}])).is_err());
        let err = bulk_lines(None, &json!([{"_id": "a", "doc": {}}])).unwrap_err();
        assert!(err.to_string().contains("no _index"));
    }

    #[test]
    fn test_error_reason() {
        let e = json!({"type": "version_conflict_engine_exception", "reason": "conflict"});
        assert_eq!(
            error_reason(Some(&e)),
            "version_conflict_engine_exception: conflict"
        );
        assert_eq!(error_reason(None), "unknown");
    }

    #[test]
    fn test_encode_segment() {
        assert_eq!(encode_segment("logs-*"), "logs-*");
        assert_eq!(encode_segment("a/b c"), "a%2Fb%20c");
    }
}
