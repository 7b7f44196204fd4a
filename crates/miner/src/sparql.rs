//! SPARQL text the pipeline sends to the store.
//!
//! Every update and query the miner issues is built here, so the wire shapes
//! live in one place: the container-prefix delete, the drop-graph replace,
//! the rename batch with its `tracker:uri` rewrites, and the three probe
//! queries (children, mtime match, presence).
//!
//! All triples describing one file live in the named graph keyed by that
//! file's URI, which is what makes the drop-and-insert replacement atomic.

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use crate::file_ref::FileRef;

// ── Escaping & formatting ────────────────────────────────────────────

/// Escape a string for use inside a double-quoted SPARQL literal.
pub fn escape_literal(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Format a filesystem mtime the way the store records it: seconds
/// resolution, UTC, `YYYY-MM-DDTHH:MM:SSZ`.
pub fn format_mtime_utc(mtime: SystemTime) -> String {
    let utc: DateTime<Utc> = mtime.into();
    utc.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

// ── Update templates ─────────────────────────────────────────────────

/// Two-statement delete removing a resource and everything recorded below
/// it: first every resource whose container path starts with `<uri>/`, then
/// the resource itself.
pub fn delete_resource(uri: &str) -> String {
    format!(
        "DELETE FROM <{uri}> {{ ?u a rdfs:Resource }} \
         WHERE {{ ?u nfo:belongsToContainer ?p . FILTER (fn:starts-with(?p, \"{uri}/\")) }}\n\
         DELETE FROM <{uri}> {{ <{uri}> a rdfs:Resource }}"
    )
}

/// Atomic replacement of one file's graph with freshly extracted triples.
pub fn replace_graph(uri: &str, triples: &str) -> String {
    format!("DROP GRAPH <{uri}>\n{triples}")
}

/// One combined batch for an in-place rename: drop the source's recorded
/// file name, insert the new name at the target, and rewrite every
/// descendant URI that was discovered under the source.
pub fn rename_batch(
    source_uri: &str,
    target_uri: &str,
    display_name: &str,
    child_rewrites: &[(String, String)],
) -> String {
    let mut batch = format!(
        "DELETE FROM <{source_uri}> {{ <{source_uri}> nfo:fileName ?o }} \
         WHERE {{ <{source_uri}> nfo:fileName ?o }}\n\
         INSERT INTO <{target_uri}> {{\n  <{source_uri}> nfo:fileName \"{}\" .\n",
        escape_literal(display_name)
    );
    for (child, rewritten) in child_rewrites {
        batch.push_str(&format!("  <{child}> tracker:uri <{rewritten}> .\n"));
    }
    batch.push('}');
    batch
}

// ── Query templates ──────────────────────────────────────────────────

/// Direct children of a container, one binding per row.
pub fn children_query(uri: &str) -> String {
    format!("SELECT ?child WHERE {{ ?child nfo:belongsToContainer <{uri}> }}")
}

/// Non-empty iff the store already records `mtime` for this resource.
pub fn mtime_match_query(uri: &str, mtime: &str) -> String {
    format!("SELECT ?file {{ ?file nfo:fileLastModified \"{mtime}\" . FILTER(?file = <{uri}>) }}")
}

/// Non-empty iff the resource exists in the store at all.
pub fn presence_query(uri: &str) -> String {
    format!("SELECT ?s WHERE {{ ?s a rdfs:Resource . FILTER(?s = <{uri}>) }}")
}

// ── MutationBuilder ──────────────────────────────────────────────────

/// Write-once triple buffer for a single file.
///
/// The extractor holds one clone and accumulates triples into it; the
/// in-flight job keeps another and renders the final `INSERT` once the
/// extractor reports completion. Dropping the job discards the buffer.
#[derive(Clone, Default)]
pub struct MutationBuilder {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MutationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a triple whose object is another resource.
    pub fn insert_iri(&self, subject: &str, predicate: &str, object: &str) {
        self.push(format!("<{subject}> {predicate} <{object}> ."));
    }

    /// Record a triple whose object is a string literal. The value is
    /// escaped here.
    pub fn insert_string(&self, subject: &str, predicate: &str, value: &str) {
        self.push(format!("<{subject}> {predicate} \"{}\" .", escape_literal(value)));
    }

    /// Record a triple whose object is a timestamp literal, formatted the
    /// way the store expects mtimes.
    pub fn insert_date(&self, subject: &str, predicate: &str, when: SystemTime) {
        self.push(format!(
            "<{subject}> {predicate} \"{}\" .",
            format_mtime_utc(when)
        ));
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().map(|l| l.is_empty()).unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.lines.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Render the accumulated triples as one `INSERT INTO <graph>` block.
    pub(crate) fn render(&self, graph_uri: &str) -> String {
        let mut body = String::new();
        if let Ok(lines) = self.lines.lock() {
            for line in lines.iter() {
                body.push_str("  ");
                body.push_str(line);
                body.push('\n');
            }
        }
        format!("INSERT INTO <{graph_uri}> {{\n{body}}}")
    }

    fn push(&self, line: String) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line);
        }
    }
}

/// Build the update submitted when a file's extraction succeeds: drop the
/// old graph, insert the buffered triples.
pub(crate) fn extraction_update(file: &FileRef, builder: &MutationBuilder) -> String {
    let uri = file.uri();
    let triples = builder.render(&uri);
    replace_graph(&uri, &triples)
}

// ── Tests ────────────────────────────────────────────────────────────
