//! The streaming, line-oriented state machine that reconstructs
//! INSERT/UPDATE/DELETE events from the external decoder's textual output.
//!
//! [`Parser::feed`] accepts one logical line at a time (already stripped of
//! the decoder's `### ` prefix and trailing newline) and [`Parser::finish`]
//! flushes whatever event is in progress at end-of-stream. Completed events
//! are handed to a caller-supplied sink closure as soon as they're known to
//! be valid and translatable - never buffered beyond the current event.

use std::collections::HashSet;

use mygrate_schema::SchemaCatalog;
use mygrate_types::{ColumnMap, Event, TableId, Value};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

static INSERT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^INSERT INTO (.+)$").unwrap());
static UPDATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^UPDATE (.+)$").unwrap());
static DELETE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^DELETE FROM (.+)$").unwrap());
static COLUMN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^  @(\d+)=(.*)$").unwrap());
static INT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^-?\d+$").unwrap());
static FLOAT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^-?\d+\.\d+$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Insert,
    Update,
    Delete,
}

impl Kind {
    fn action(self) -> &'static str {
        match self {
            Kind::Insert => "INSERT",
            Kind::Update => "UPDATE",
            Kind::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initial,
    Where,
    Set,
}

struct InProgress {
    kind: Kind,
    table: TableId,
    phase: Phase,
    invalid: bool,
    where_values: Vec<Value>,
    set_values: Vec<Value>,
    last_where_idx: u64,
    last_set_idx: u64,
}

impl InProgress {
    fn new(kind: Kind, table: TableId) -> Self {
        let phase = match kind {
            Kind::Insert => Phase::Set,
            Kind::Update => Phase::Initial,
            Kind::Delete => Phase::Where,
        };
        InProgress {
            kind,
            table,
            phase,
            invalid: false,
            where_values: Vec::new(),
            set_values: Vec::new(),
            last_where_idx: 0,
            last_set_idx: 0,
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    fn push_column(&mut self, idx: u64, value: Value) {
        let expected = match self.phase {
            Phase::Where => self.last_where_idx + 1,
            Phase::Set => self.last_set_idx + 1,
            Phase::Initial => {
                self.invalid = true;
                return;
            }
        };
        if idx != expected {
            self.invalid = true;
        }
        match self.phase {
            Phase::Where => {
                self.last_where_idx = idx;
                self.where_values.push(value);
            }
            Phase::Set => {
                self.last_set_idx = idx;
                self.set_values.push(value);
            }
            Phase::Initial => unreachable!(),
        }
    }
}

/// The event-reconstruction state machine. Holds at most one in-progress
/// event at a time.
pub struct Parser<'a> {
    catalog: &'a SchemaCatalog,
    current: Option<InProgress>,
    warned_unknown_charsets: HashSet<TableId>,
}

impl<'a> Parser<'a> {
    pub fn new(catalog: &'a SchemaCatalog) -> Self {
        Parser {
            catalog,
            current: None,
            warned_unknown_charsets: HashSet::new(),
        }
    }

    /// Feeds one decoded line into the state machine, invoking `sink` with
    /// any event that completes as a result.
    pub fn feed(&mut self, line: &str, mut sink: impl FnMut(Event)) {
        if let Some(captures) = INSERT_RE.captures(line) {
            self.complete_current(&mut sink);
            self.start_event(Kind::Insert, &captures[1]);
            return;
        }
        if let Some(captures) = UPDATE_RE.captures(line) {
            self.complete_current(&mut sink);
            self.start_event(Kind::Update, &captures[1]);
            return;
        }
        if let Some(captures) = DELETE_RE.captures(line) {
            self.complete_current(&mut sink);
            self.start_event(Kind::Delete, &captures[1]);
            return;
        }

        if self.current.is_none() {
            // Not inside any tracked event: ignore until the next header.
            return;
        }

        if line == "SET" {
            self.current.as_mut().unwrap().set_phase(Phase::Set);
            return;
        }
        if line == "WHERE" {
            self.current.as_mut().unwrap().set_phase(Phase::Where);
            return;
        }

        if let Some(captures) = COLUMN_RE.captures(line) {
            let idx: u64 = match captures[1].parse() {
                Ok(idx) => idx,
                Err(_) => {
                    self.current.as_mut().unwrap().invalid = true;
                    return;
                }
            };
            let table = self.current.as_ref().unwrap().table.clone();
            let charset = self.catalog.charset(&table).map(str::to_owned);
            let value = self.decode_value(&captures[2], &table, charset.as_deref());
            self.current.as_mut().unwrap().push_column(idx, value);
            return;
        }

        if !line.is_empty() {
            self.current.as_mut().unwrap().invalid = true;
        }
    }

    /// Decodes one `@idx=value` token, warning at most once per table for the
    /// lifetime of this parser if `charset` names an encoding that isn't
    /// recognized.
    fn decode_value(&mut self, token: &str, table: &TableId, charset: Option<&str>) -> Value {
        let value = parse_value(token);
        let (Value::Text(text), Some(charset_name)) = (&value, charset) else {
            return value;
        };

        let Some(label) = normalize_charset_label(charset_name) else {
            // MySQL's "binary" pseudo-charset means "no text encoding": leave
            // the bytes exactly as decoded.
            return value;
        };

        let Some(encoding) = encoding_rs::Encoding::for_label(label.as_bytes()) else {
            if self.warned_unknown_charsets.insert(table.clone()) {
                warn!(%table, charset = charset_name, "unrecognized charset, leaving value undecoded");
            }
            return value;
        };

        Value::Text(decode_charset(text, encoding))
    }

    /// Flushes whatever event is in progress at end-of-stream.
    pub fn finish(&mut self, mut sink: impl FnMut(Event)) {
        self.complete_current(&mut sink);
    }

    fn start_event(&mut self, kind: Kind, raw_table: &str) {
        let table = TableId::from_dotted(raw_table);
        if self.catalog.column_names(&table).is_some() {
            self.current = Some(InProgress::new(kind, table));
        } else {
            self.current = None;
        }
    }

    /// The table ids this parser has already logged an unrecognized-charset
    /// warning for, exposed so callers and tests can observe the dedup
    /// without needing a tracing subscriber.
    pub fn warned_unknown_charsets(&self) -> &HashSet<TableId> {
        &self.warned_unknown_charsets
    }

    fn complete_current(&mut self, sink: &mut impl FnMut(Event)) {
        let Some(current) = self.current.take() else {
            return;
        };
        if current.invalid {
            return;
        }
        let Some(columns) = self.catalog.column_names(&current.table) else {
            return;
        };

        match current.kind {
            Kind::Insert => {
                let Some(set) = translate(columns, &current.set_values, &current.table, "SET")
                else {
                    return;
                };
                sink(Event::Insert {
                    table: current.table,
                    set,
                });
            }
            Kind::Update => {
                let Some(r#where) =
                    translate(columns, &current.where_values, &current.table, "WHERE")
                else {
                    return;
                };
                let Some(set) = translate(columns, &current.set_values, &current.table, "SET")
                else {
                    return;
                };
                sink(Event::Update {
                    table: current.table,
                    r#where,
                    set,
                });
            }
            Kind::Delete => {
                let Some(r#where) =
                    translate(columns, &current.where_values, &current.table, "WHERE")
                else {
                    return;
                };
                sink(Event::Delete {
                    table: current.table,
                    r#where,
                });
            }
        }
    }
}

fn translate(
    columns: &[String],
    values: &[Value],
    table: &TableId,
    phase_name: &str,
) -> Option<ColumnMap> {
    if values.len() != columns.len() {
        warn!(
            %table,
            phase = phase_name,
            expected = columns.len(),
            got = values.len(),
            "column count mismatch, dropping event"
        );
        return None;
    }
    Some(
        columns
            .iter()
            .cloned()
            .zip(values.iter().cloned())
            .collect(),
    )
}

/// Decodes one `@idx=value` token into a [`Value`], per the grammar:
/// integer | float | single-quoted string | null marker, with the decoder's
/// "strip trailing annotation past the first space and retry" fallback.
/// Charset re-decoding of the resulting text, if any, happens in the caller.
fn parse_value(token: &str) -> Value {
    if let Some(literal) = parse_literal(token) {
        return literal;
    }

    match token.split_once(' ') {
        Some((prefix, _)) => parse_value(prefix),
        None => Value::Null,
    }
}

fn parse_literal(token: &str) -> Option<Value> {
    if token == "NULL" {
        return Some(Value::Null);
    }
    if INT_RE.is_match(token) {
        return token.parse::<i64>().ok().map(Value::Int);
    }
    if FLOAT_RE.is_match(token) {
        return token.parse::<f64>().ok().map(Value::Float);
    }
    if token.len() >= 2 && token.starts_with('\'') && token.ends_with('\'') {
        return Some(Value::Text(unescape(&token[1..token.len() - 1])));
    }
    None
}

/// Reverses the decoder's backslash-escaping of quoted string literals.
fn unescape(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('0') => out.push('\0'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('b') => out.push('\u{8}'),
            Some('Z') => out.push('\u{1a}'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Maps a MySQL charset name to the WHATWG encoding label `encoding_rs`
/// expects, for the handful of names that don't already coincide: MySQL's
/// `utf8mb4` is plain UTF-8 to a decoder, and its `binary` pseudo-charset
/// means "do not decode" rather than naming an encoding at all.
fn normalize_charset_label(name: &str) -> Option<&str> {
    match name {
        "utf8mb4" => Some("utf-8"),
        "binary" => None,
        other => Some(other),
    }
}

/// Reinterprets `text` as raw bytes (one byte per char, as the original
/// Python `str.decode(charset)` call did) and decodes those bytes through
/// `encoding`, falling back to the original text unchanged if any character
/// doesn't fit in a byte or the decode produces errors.
fn decode_charset(text: &str, encoding: &'static encoding_rs::Encoding) -> String {
    let mut bytes = Vec::with_capacity(text.len());
    for c in text.chars() {
        let Ok(byte) = u8::try_from(c as u32) else {
            return text.to_owned();
        };
        bytes.push(byte);
    }
    let (decoded, _, had_errors) = encoding.decode(&bytes);
    if had_errors {
        text.to_owned()
    } else {
        decoded.into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn catalog(tables: &[(&str, &[&str], Option<&str>)]) -> SchemaCatalog {
        let mut columns = BTreeMap::new();
        let mut charsets = BTreeMap::new();
        for (table, cols, charset) in tables {
            let id = TableId::from(*table);
            columns.insert(id.clone(), cols.iter().map(|s| s.to_string()).collect());
            charsets.insert(id, charset.map(str::to_owned));
        }
        SchemaCatalog::from_parts(columns, charsets)
    }

    #[test]
    fn insert_parsing() {
        let cat = catalog(&[("db1.t1", &["id", "name"], None)]);
        let mut parser = Parser::new(&cat);
        let mut events = Vec::new();

        for line in ["INSERT INTO `db1`.`t1`", "SET", "  @1=42", "  @2='hello'"] {
            parser.feed(line, |e| events.push(e));
        }
        parser.finish(|e| events.push(e));

        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Insert { table, set } => {
                assert_eq!(table.as_str(), "db1.t1");
                assert_eq!(set.get("id"), Some(&Value::Int(42)));
                assert_eq!(set.get("name"), Some(&Value::Text("hello".into())));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn update_with_charset_decode() {
        let cat = catalog(&[("db1.t1", &["id", "note"], Some("latin1"))]);
        let mut parser = Parser::new(&cat);
        let mut events = Vec::new();

        for line in [
            "UPDATE `db1`.`t1`",
            "WHERE",
            "  @1=7",
            "  @2='old'",
            "SET",
            "  @1=7",
            "  @2='new'",
        ] {
            parser.feed(line, |e| events.push(e));
        }
        parser.finish(|e| events.push(e));

        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Update { table, r#where, set } => {
                assert_eq!(table.as_str(), "db1.t1");
                assert_eq!(r#where.get("note"), Some(&Value::Text("old".into())));
                assert_eq!(set.get("note"), Some(&Value::Text("new".into())));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn trailing_metadata_tolerance() {
        let cat = catalog(&[("db1.t1", &["id"], None)]);
        let mut parser = Parser::new(&cat);
        let mut events = Vec::new();
        for line in ["INSERT INTO `db1`.`t1`", "SET", "  @1=1234 /* INT meta */"] {
            parser.feed(line, |e| events.push(e));
        }
        parser.finish(|e| events.push(e));

        match &events[0] {
            Event::Insert { set, .. } => assert_eq!(set.get("id"), Some(&Value::Int(1234))),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn untracked_table_is_dropped_silently() {
        let cat = catalog(&[]);
        let mut parser = Parser::new(&cat);
        let mut events = Vec::new();
        for line in ["INSERT INTO `db1`.`other`", "SET", "  @1=1"] {
            parser.feed(line, |e| events.push(e));
        }
        parser.finish(|e| events.push(e));
        assert!(events.is_empty());
    }

    #[test]
    fn out_of_order_index_invalidates_event() {
        let cat = catalog(&[("db1.t1", &["id", "name"], None)]);
        let mut parser = Parser::new(&cat);
        let mut events = Vec::new();
        for line in ["INSERT INTO `db1`.`t1`", "SET", "  @2='skip'", "  @1=1"] {
            parser.feed(line, |e| events.push(e));
        }
        parser.finish(|e| events.push(e));
        assert!(events.is_empty());
    }

    #[test]
    fn malformed_line_invalidates_event() {
        let cat = catalog(&[("db1.t1", &["id"], None)]);
        let mut parser = Parser::new(&cat);
        let mut events = Vec::new();
        for line in ["INSERT INTO `db1`.`t1`", "SET", "garbage"] {
            parser.feed(line, |e| events.push(e));
        }
        parser.finish(|e| events.push(e));
        assert!(events.is_empty());
    }

    #[test]
    fn column_count_mismatch_drops_without_panicking() {
        let cat = catalog(&[("db1.t1", &["id", "name"], None)]);
        let mut parser = Parser::new(&cat);
        let mut events = Vec::new();
        for line in ["INSERT INTO `db1`.`t1`", "SET", "  @1=1"] {
            parser.feed(line, |e| events.push(e));
        }
        parser.finish(|e| events.push(e));
        assert!(events.is_empty());
    }

    #[test]
    fn unknown_charset_warns_once_per_table() {
        let cat = catalog(&[("db1.t1", &["id", "note"], Some("klingon1"))]);
        let mut parser = Parser::new(&cat);
        let mut events = Vec::new();
        for line in [
            "INSERT INTO `db1`.`t1`",
            "SET",
            "  @1=1",
            "  @2='first'",
            "INSERT INTO `db1`.`t1`",
            "SET",
            "  @1=2",
            "  @2='second'",
        ] {
            parser.feed(line, |e| events.push(e));
        }
        parser.finish(|e| events.push(e));

        assert_eq!(events.len(), 2);
        // Values pass through unchanged since the charset is unrecognized.
        match &events[0] {
            Event::Insert { set, .. } => assert_eq!(set.get("note"), Some(&Value::Text("first".into()))),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(parser.warned_unknown_charsets().len(), 1);
        assert!(parser.warned_unknown_charsets().contains(&TableId::from("db1.t1")));
    }

    #[test]
    fn utf8mb4_and_binary_are_recognized_aliases() {
        let cat = catalog(&[
            ("db1.t1", &["id", "note"], Some("utf8mb4")),
            ("db1.t2", &["id", "note"], Some("binary")),
        ]);
        let mut parser = Parser::new(&cat);
        let mut events = Vec::new();
        for line in [
            "INSERT INTO `db1`.`t1`",
            "SET",
            "  @1=1",
            "  @2='hi'",
            "INSERT INTO `db1`.`t2`",
            "SET",
            "  @1=2",
            "  @2='raw'",
        ] {
            parser.feed(line, |e| events.push(e));
        }
        parser.finish(|e| events.push(e));

        assert_eq!(events.len(), 2);
        assert!(parser.warned_unknown_charsets().is_empty());
    }

    #[test]
    fn two_inserts_in_sequence() {
        let cat = catalog(&[("db1.t1", &["id"], None)]);
        let mut parser = Parser::new(&cat);
        let mut events = Vec::new();
        for line in [
            "INSERT INTO `db1`.`t1`",
            "SET",
            "  @1=1",
            "INSERT INTO `db1`.`t1`",
            "SET",
            "  @1=2",
        ] {
            parser.feed(line, |e| events.push(e));
        }
        parser.finish(|e| events.push(e));
        assert_eq!(events.len(), 2);
    }
}
