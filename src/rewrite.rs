//! SQLite-dialect to backend-dialect translation.
//!
//! Pure text-to-text. The input is SQLite dialect (often malformed by the
//! backend's standards), so transforms run over a string-and-comment-aware
//! token walk rather than an AST; anything the walk cannot make sense of
//! passes through unchanged and the backend gets to produce the error.

use std::hash::Hasher;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};

use crate::config::Config;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteFlags {
    /// Statement belongs to an on-deck-style carousel family (classified by
    /// substring; these degrade to an empty result under stack pressure).
    pub contains_on_deck_query: bool,
    /// A `MATCH` clause was lowered to `ILIKE`.
    pub is_full_text_search: bool,
    /// Columns were appended to satisfy strict `GROUP BY`.
    pub had_group_by_fixup: bool,
}

/// What kind of execution a statement wants. The rewriter only classifies;
/// the statement engine decides what to do with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Produces rows; executed with a row-returning query.
    Query,
    /// INSERT; affected count and `lastval()` are captured after it.
    Insert,
    /// UPDATE / DELETE / other row-count-only statements.
    Write,
    /// BEGIN; opens the thread's transaction pin.
    Begin,
    /// COMMIT / ROLLBACK / END; closes the pin.
    TxnEnd,
    /// SAVEPOINT; an outermost bare savepoint opens a transaction (and the
    /// pin) the way it does in SQLite.
    Savepoint,
    /// RELEASE / ROLLBACK TO; executes on the pinned connection without
    /// opening or closing anything.
    Release,
}

#[derive(Debug)]
pub struct Rewritten {
    pub sql: String,
    pub flags: RewriteFlags,
    pub kind: StatementKind,
    /// Count of `$n` placeholders in the output.
    pub param_count: usize,
    /// False when the statement can only mean anything to the shadow
    /// SQLite (catalog tables, `sqlite_*` built-ins); such statements are
    /// prepared on the shadow with their real text and never reach the
    /// backend.
    pub is_backend_only: bool,
}

// ---------------------------------------------------------------------------
// Lexing

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokKind {
    Word,
    QuotedIdent,
    Backtick,
    Str,
    Number,
    Param,
    Punct,
    Comment,
    Space,
}

#[derive(Debug, Clone, Copy)]
struct Tok {
    kind: TokKind,
    start: usize,
    end: usize,
}

fn tokenize(sql: &str) -> Vec<Tok> {
    let b = sql.as_bytes();
    let mut toks = Vec::with_capacity(sql.len() / 4);
    let mut i = 0;
    while i < b.len() {
        let start = i;
        let kind = match b[i] {
            c if c.is_ascii_whitespace() => {
                while i < b.len() && b[i].is_ascii_whitespace() {
                    i += 1;
                }
                TokKind::Space
            }
            b'\'' | b'"' | b'`' => {
                let quote = b[i];
                i += 1;
                while i < b.len() {
                    if b[i] == quote {
                        if i + 1 < b.len() && b[i + 1] == quote {
                            i += 2; // doubled quote inside literal
                            continue;
                        }
                        i += 1;
                        break;
                    }
                    i += 1;
                }
                match quote {
                    b'\'' => TokKind::Str,
                    b'"' => TokKind::QuotedIdent,
                    _ => TokKind::Backtick,
                }
            }
            b'-' if i + 1 < b.len() && b[i + 1] == b'-' => {
                while i < b.len() && b[i] != b'\n' {
                    i += 1;
                }
                TokKind::Comment
            }
            b'/' if i + 1 < b.len() && b[i + 1] == b'*' => {
                i += 2;
                while i + 1 < b.len() && !(b[i] == b'*' && b[i + 1] == b'/') {
                    i += 1;
                }
                i = (i + 2).min(b.len());
                TokKind::Comment
            }
            b'?' => {
                i += 1;
                while i < b.len() && b[i].is_ascii_digit() {
                    i += 1;
                }
                TokKind::Param
            }
            b':' | b'@' if i + 1 < b.len() && (b[i + 1].is_ascii_alphanumeric() || b[i + 1] == b'_') => {
                i += 1;
                while i < b.len() && (b[i].is_ascii_alphanumeric() || b[i] == b'_') {
                    i += 1;
                }
                TokKind::Param
            }
            b'$' if i + 1 < b.len() && b[i + 1].is_ascii_digit() => {
                i += 1;
                while i < b.len() && b[i].is_ascii_digit() {
                    i += 1;
                }
                TokKind::Param
            }
            c if c.is_ascii_digit() => {
                while i < b.len() && (b[i].is_ascii_alphanumeric() || b[i] == b'.') {
                    i += 1;
                }
                TokKind::Number
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                while i < b.len() && (b[i].is_ascii_alphanumeric() || b[i] == b'_') {
                    i += 1;
                }
                TokKind::Word
            }
            _ => {
                i += 1;
                TokKind::Punct
            }
        };
        toks.push(Tok {
            kind,
            start,
            end: i,
        });
    }
    toks
}

fn text<'a>(sql: &'a str, t: &Tok) -> &'a str {
    &sql[t.start..t.end]
}

fn is_word(sql: &str, t: &Tok, kw: &str) -> bool {
    t.kind == TokKind::Word && text(sql, t).eq_ignore_ascii_case(kw)
}

/// Index of the next token that is not whitespace or a comment.
fn next_sig(toks: &[Tok], mut i: usize) -> Option<usize> {
    i += 1;
    while i < toks.len() {
        if !matches!(toks[i].kind, TokKind::Space | TokKind::Comment) {
            return Some(i);
        }
        i += 1;
    }
    None
}

const AGGREGATES: &[&str] = &[
    "count",
    "sum",
    "avg",
    "min",
    "max",
    "total",
    "group_concat",
    "string_agg",
];

const EXPR_KEYWORDS: &[&str] = &[
    "and", "or", "not", "null", "like", "ilike", "glob", "in", "is", "between", "distinct",
    "collate", "as", "case", "when", "then", "else", "end", "escape", "cast", "asc", "desc",
    "current_timestamp", "current_date", "current_time", "true", "false",
];

// ---------------------------------------------------------------------------
// Pass 1: quoting, placeholders, schema qualification, FTS lowering

struct Pass1<'a> {
    cfg: &'a Config,
    sql: &'a str,
    toks: &'a [Tok],
    out: String,
    params: usize,
    expect_table: bool,
    from_depth: Vec<i32>,
    depth: i32,
    last_word_as: bool,
    flags: RewriteFlags,
    skip_heavy: bool,
    /// FTS target seen in table position, for `MATCH` clauses whose left
    /// side is not itself the virtual table name.
    active_fts: Option<crate::config::FtsTarget>,
}

impl<'a> Pass1<'a> {
    fn quoted_ident(&mut self, raw: &str) {
        // raw includes the surrounding quotes; inner doubled quotes unescape.
        let quote = raw.as_bytes()[0] as char;
        let inner = raw
            .trim_matches(quote)
            .replace(&format!("{quote}{quote}"), &quote.to_string());
        self.out.push('"');
        self.out.push_str(&inner.replace('"', "\"\""));
        self.out.push('"');
    }

    fn emit_param(&mut self, raw: &str) {
        if let Some(rest) = raw.strip_prefix('$') {
            // Already backend-style; keep the numbering authoritative.
            self.out.push_str(raw);
            if let Ok(n) = rest.parse::<usize>() {
                self.params = self.params.max(n);
            }
            return;
        }
        if let Some(rest) = raw.strip_prefix('?') {
            if let Ok(n) = rest.parse::<usize>() {
                self.out.push('$');
                self.out.push_str(rest);
                self.params = self.params.max(n);
                return;
            }
        }
        self.params += 1;
        self.out.push('$');
        self.out.push_str(&self.params.to_string());
    }

    /// Emit a table reference in table position, qualifying known tables
    /// and swapping virtual FTS tables for their backing table.
    fn emit_table_ref(&mut self, i: usize) -> usize {
        let word = text(self.sql, &self.toks[i]).to_string();
        // Already qualified (schema.table): pass both parts through.
        if let Some(dot) = next_sig(self.toks, i) {
            if self.toks[dot].kind == TokKind::Punct && text(self.sql, &self.toks[dot]) == "." {
                self.out.push_str(&word);
                return i;
            }
        }
        if let Some(target) = self.cfg.fts_tables.get(word.to_ascii_lowercase().as_str()) {
            if !self.skip_heavy {
                self.flags.is_full_text_search = true;
                self.active_fts = Some(target.clone());
                self.out.push_str(&self.cfg.schema);
                self.out.push('.');
                self.out.push_str(&target.table);
                return i;
            }
        }
        if self.cfg.is_known_table(&word) {
            self.out.push_str(&self.cfg.schema);
            self.out.push('.');
        }
        self.out.push_str(&word);
        i
    }

    /// `X MATCH pat` lowers to `col ILIKE ('%' || pat || '%')`. Lossy and
    /// documented as such; covers the attested carousel/search families.
    fn try_lower_match(&mut self, i: usize) -> Option<usize> {
        if self.skip_heavy {
            return None;
        }
        let m = next_sig(self.toks, i)?;
        if !is_word(self.sql, &self.toks[m], "match") {
            return None;
        }
        let operand = next_sig(self.toks, m)?;
        let left = text(self.sql, &self.toks[i]).to_ascii_lowercase();
        let target = self
            .cfg
            .fts_tables
            .get(left.as_str())
            .cloned()
            .or_else(|| self.active_fts.clone())?;
        self.flags.is_full_text_search = true;
        self.out.push_str(&target.column);
        self.out.push_str(" ILIKE ('%' || ");
        match self.toks[operand].kind {
            TokKind::Param => {
                let raw = text(self.sql, &self.toks[operand]).to_string();
                self.emit_param(&raw);
            }
            _ => self.out.push_str(text(self.sql, &self.toks[operand])),
        }
        self.out.push_str(" || '%')");
        Some(operand)
    }

    fn run(mut self) -> (String, usize, RewriteFlags) {
        let mut i = 0;
        let mut leading = true;
        while i < self.toks.len() {
            let t = self.toks[i];
            let raw = text(self.sql, &t);
            match t.kind {
                TokKind::Space | TokKind::Comment => self.out.push_str(raw),
                TokKind::Str => {
                    if self.last_word_as {
                        // AS 'alias' is SQLite leniency; the backend wants
                        // a quoted identifier here.
                        self.quoted_ident(raw);
                    } else {
                        self.out.push_str(raw);
                    }
                    self.last_word_as = false;
                    self.expect_table = false;
                }
                TokKind::Backtick => {
                    self.quoted_ident(raw);
                    self.last_word_as = false;
                    self.expect_table = false;
                }
                TokKind::Param => {
                    let raw = raw.to_string();
                    self.emit_param(&raw);
                    self.last_word_as = false;
                    self.expect_table = false;
                }
                TokKind::Punct => {
                    match raw {
                        "(" => self.depth += 1,
                        ")" => {
                            self.depth -= 1;
                            while self.from_depth.last().is_some_and(|d| *d > self.depth) {
                                self.from_depth.pop();
                            }
                        }
                        "," => {
                            if self.from_depth.last() == Some(&self.depth) {
                                self.expect_table = true;
                            }
                        }
                        ";" => {
                            self.from_depth.clear();
                            self.expect_table = false;
                        }
                        _ => {}
                    }
                    self.out.push_str(raw);
                    self.last_word_as = false;
                }
                TokKind::Number | TokKind::QuotedIdent => {
                    self.out.push_str(raw);
                    self.last_word_as = false;
                    self.expect_table = false;
                }
                TokKind::Word => {
                    let lower = raw.to_ascii_lowercase();
                    // Normalise transaction openers for the backend.
                    if leading && lower == "begin" {
                        self.out.push_str("BEGIN");
                        if let Some(n) = next_sig(self.toks, i) {
                            let nw = text(self.sql, &self.toks[n]).to_ascii_lowercase();
                            if matches!(nw.as_str(), "immediate" | "exclusive" | "deferred") {
                                i = n;
                            }
                        }
                        leading = false;
                        i += 1;
                        continue;
                    }
                    match lower.as_str() {
                        "from" | "join" | "into" | "update" => {
                            self.expect_table = true;
                            if lower == "from" || lower == "join" {
                                if self.from_depth.last() != Some(&self.depth) {
                                    self.from_depth.push(self.depth);
                                }
                            }
                            self.out.push_str(raw);
                        }
                        "or" | "rollback" | "abort" | "replace" | "fail" | "ignore"
                            if self.expect_table =>
                        {
                            // UPDATE OR REPLACE <table> and friends.
                            self.out.push_str(raw);
                        }
                        "select" | "where" | "group" | "order" | "limit" | "having" | "offset"
                        | "set" | "union" | "except" | "intersect" | "on" | "using"
                        | "window" => {
                            self.expect_table = false;
                            if self.from_depth.last() == Some(&self.depth)
                                && !matches!(lower.as_str(), "on" | "using" | "union" | "except" | "intersect")
                            {
                                self.from_depth.pop();
                            }
                            self.out.push_str(raw);
                        }
                        _ => {
                            if let Some(consumed) = self.try_lower_match(i) {
                                i = consumed + 1;
                                self.last_word_as = false;
                                self.expect_table = false;
                                leading = false;
                                continue;
                            }
                            if self.expect_table {
                                i = self.emit_table_ref(i);
                                self.expect_table = false;
                            } else {
                                self.out.push_str(raw);
                            }
                        }
                    }
                    self.last_word_as = lower == "as";
                }
            }
            if !matches!(t.kind, TokKind::Space | TokKind::Comment) {
                leading = false;
            }
            i += 1;
        }
        (self.out, self.params, self.flags)
    }
}

// ---------------------------------------------------------------------------
// Pass 2: strict GROUP BY completion

/// A column reference collected from the select list, normalised for
/// comparison ("tbl.col" or "col", original text kept for emission).
#[derive(Debug, Clone)]
struct ColRef {
    original: String,
    lower: String,
}

fn collect_col_refs(sql: &str, toks: &[Tok], refs: &mut Vec<ColRef>) {
    let mut depth = 0i32;
    let mut case_depth = 0u32;
    let mut skip_until_depth: Option<i32> = None;
    let mut i = 0;
    while i < toks.len() {
        let t = &toks[i];
        match t.kind {
            TokKind::Punct => match text(sql, t) {
                "(" => depth += 1,
                ")" => {
                    depth -= 1;
                    if skip_until_depth.is_some_and(|d| depth < d) {
                        skip_until_depth = None;
                    }
                }
                _ => {}
            },
            TokKind::Word if skip_until_depth.is_none() && case_depth == 0 => {
                let lower = text(sql, t).to_ascii_lowercase();
                if lower == "case" {
                    case_depth += 1;
                } else if AGGREGATES.contains(&lower.as_str()) {
                    if let Some(n) = next_sig(toks, i) {
                        if text(sql, &toks[n]) == "(" {
                            // Aggregated arguments never need grouping.
                            skip_until_depth = Some(depth + 1);
                        }
                    }
                } else if lower == "select" {
                    // Subquery: its columns are its own problem.
                    skip_until_depth = Some(depth);
                } else if !EXPR_KEYWORDS.contains(&lower.as_str()) {
                    // Function call?
                    if let Some(n) = next_sig(toks, i) {
                        if text(sql, &toks[n]) == "(" {
                            i += 1;
                            continue;
                        }
                    }
                    // Qualified reference: ident(.ident)*
                    let mut parts = vec![text(sql, t).to_string()];
                    let mut j = i;
                    while let Some(dot) = next_sig(toks, j) {
                        if text(sql, &toks[dot]) != "." {
                            break;
                        }
                        let Some(field) = next_sig(toks, dot) else { break };
                        if !matches!(toks[field].kind, TokKind::Word | TokKind::QuotedIdent) {
                            break;
                        }
                        parts.push(text(sql, &toks[field]).to_string());
                        j = field;
                    }
                    i = j;
                    let original = parts.join(".");
                    refs.push(ColRef {
                        lower: original.to_ascii_lowercase(),
                        original,
                    });
                }
            }
            TokKind::Word => {
                let lower = text(sql, t).to_ascii_lowercase();
                if lower == "case" {
                    case_depth += 1;
                } else if lower == "end" && case_depth > 0 {
                    case_depth -= 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
}

/// Split a token range on top-level commas.
fn split_commas(sql: &str, toks: &[Tok]) -> Vec<(usize, usize)> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, t) in toks.iter().enumerate() {
        if t.kind == TokKind::Punct {
            match text(sql, t) {
                "(" => depth += 1,
                ")" => depth -= 1,
                "," if depth == 0 => {
                    parts.push((start, i));
                    start = i + 1;
                }
                _ => {}
            }
        }
    }
    parts.push((start, toks.len()));
    parts
}

fn trimmed_text(sql: &str, toks: &[Tok]) -> String {
    let mut s = String::new();
    for t in toks {
        if matches!(t.kind, TokKind::Comment) {
            continue;
        }
        if t.kind == TokKind::Space {
            if !s.is_empty() && !s.ends_with(' ') {
                s.push(' ');
            }
            continue;
        }
        s.push_str(text(sql, t));
    }
    s.trim().to_string()
}

fn last_segment(s: &str) -> &str {
    s.rsplit('.').next().unwrap_or(s)
}

fn group_by_complete(sql: &str) -> (String, bool) {
    let toks = tokenize(sql);

    // Top-level clause boundaries.
    let mut depth = 0i32;
    let mut select_at = None;
    let mut from_at = None;
    let mut group_at = None;
    let mut group_end = toks.len();
    for (i, t) in toks.iter().enumerate() {
        if t.kind == TokKind::Punct {
            match text(sql, t) {
                "(" => depth += 1,
                ")" => depth -= 1,
                ";" if depth == 0 && group_at.is_some() => {
                    group_end = i;
                    break;
                }
                _ => {}
            }
            continue;
        }
        if depth != 0 || t.kind != TokKind::Word {
            continue;
        }
        let lower = text(sql, t).to_ascii_lowercase();
        match lower.as_str() {
            "select" if select_at.is_none() => select_at = Some(i),
            "from" if select_at.is_some() && from_at.is_none() => from_at = Some(i),
            "group" if from_at.is_some() && group_at.is_none() => {
                if let Some(by) = next_sig(&toks, i) {
                    if is_word(sql, &toks[by], "by") {
                        group_at = Some((i, by));
                    }
                }
            }
            "having" | "order" | "limit" | "offset" | "union" | "except" | "intersect"
                if group_at.is_some() && group_end == toks.len() =>
            {
                group_end = i;
            }
            _ => {}
        }
    }
    let (Some(select_at), Some(from_at), Some((_, by_at))) = (select_at, from_at, group_at)
    else {
        return (sql.to_string(), false);
    };

    // Select list: skip DISTINCT/ALL, split into expressions.
    let mut list_start = select_at + 1;
    if let Some(n) = next_sig(&toks, select_at) {
        let w = text(sql, &toks[n]).to_ascii_lowercase();
        if w == "distinct" || w == "all" {
            list_start = n + 1;
        }
    }
    let list_start = list_start.min(from_at);
    let select_list = &toks[list_start..from_at];

    let mut alias_of: FxHashMap<String, String> = FxHashMap::default();
    let mut candidates: Vec<ColRef> = Vec::new();
    for (s, e) in split_commas(sql, select_list) {
        let expr = &select_list[s..e];
        // Trailing `AS alias` splits off; the underlying expression is what
        // grouping wants.
        let mut body_end = expr.len();
        let mut alias = None;
        let sig: Vec<usize> = expr
            .iter()
            .enumerate()
            .filter(|(_, t)| !matches!(t.kind, TokKind::Space | TokKind::Comment))
            .map(|(i, _)| i)
            .collect();
        if sig.len() >= 2 {
            let a = sig[sig.len() - 2];
            if is_word(sql, &expr[a], "as") {
                alias = Some(text(sql, &expr[sig[sig.len() - 1]]).to_string());
                body_end = a;
            }
        }
        let body = &expr[..body_end];
        let body_text = trimmed_text(sql, body);
        if body_text == "*" || body_text.ends_with(".*") || body_text.is_empty() {
            continue;
        }

        let before = candidates.len();
        collect_col_refs(sql, body, &mut candidates);
        if let Some(alias) = alias {
            let alias = alias.trim_matches('"').to_ascii_lowercase();
            // A bare-column expression lets the alias expand to it.
            if candidates.len() == before + 1 && candidates[before].lower == body_text.to_ascii_lowercase() {
                alias_of.insert(alias, candidates[before].lower.clone());
            }
        }
    }
    if candidates.is_empty() {
        return (sql.to_string(), false);
    }
    let mut seen = Vec::new();
    candidates.retain(|c| {
        if seen.contains(&c.lower) {
            false
        } else {
            seen.push(c.lower.clone());
            true
        }
    });

    // Existing GROUP BY entries, with aliases expanded.
    let group_list = &toks[by_at + 1..group_end];
    let mut present: Vec<String> = Vec::new();
    for (s, e) in split_commas(sql, group_list) {
        let entry = trimmed_text(sql, &group_list[s..e]).to_ascii_lowercase();
        if entry.is_empty() {
            continue;
        }
        if let Some(underlying) = alias_of.get(entry.trim_matches('"')) {
            present.push(underlying.clone());
        }
        present.push(entry);
    }

    let missing: Vec<&ColRef> = candidates
        .iter()
        .filter(|c| {
            !present.iter().any(|p| {
                p == &c.lower
                    || last_segment(p) == c.lower
                    || p == last_segment(&c.lower)
            })
        })
        .collect();
    if missing.is_empty() {
        return (sql.to_string(), false);
    }

    // Append after the last existing entry, before HAVING/ORDER/….
    let insert_at = group_list
        .iter()
        .rev()
        .find(|t| !matches!(t.kind, TokKind::Space | TokKind::Comment))
        .map(|t| t.end)
        .unwrap_or_else(|| toks[by_at].end);
    let mut out = String::with_capacity(sql.len() + 32 * missing.len());
    out.push_str(&sql[..insert_at]);
    for c in &missing {
        out.push_str(", ");
        out.push_str(&c.original);
    }
    out.push_str(&sql[insert_at..]);
    (out, true)
}

// ---------------------------------------------------------------------------
// Entry points and cache

pub fn classify_statement(sql: &str) -> StatementKind {
    let toks = tokenize(sql);
    let mut words = toks
        .iter()
        .filter(|t| !matches!(t.kind, TokKind::Space | TokKind::Comment));
    let first = match words.next() {
        Some(t) if t.kind == TokKind::Word => text(sql, t).to_ascii_lowercase(),
        _ => return StatementKind::Write,
    };
    match first.as_str() {
        "select" | "values" | "with" | "explain" => StatementKind::Query,
        "insert" => StatementKind::Insert,
        "begin" => StatementKind::Begin,
        "commit" | "end" => StatementKind::TxnEnd,
        // ROLLBACK ends the transaction; ROLLBACK TO only rewinds it.
        "rollback" => match words.next() {
            Some(t) if is_word(sql, t, "to") => StatementKind::Release,
            _ => StatementKind::TxnEnd,
        },
        "savepoint" => StatementKind::Savepoint,
        "release" => StatementKind::Release,
        _ => StatementKind::Write,
    }
}

/// Statements over SQLite's own surface (`sqlite_master` and the other
/// `sqlite_*` catalog tables and built-ins) have no backend counterpart;
/// they stay on the shadow library untouched.
pub fn is_shadow_resident(sql: &str) -> bool {
    let toks = tokenize(sql);
    toks.iter().any(|t| {
        t.kind == TokKind::Word && text(sql, t).to_ascii_lowercase().starts_with("sqlite_")
    })
}

/// Statements SQLite owns outright; these are never redirected and the
/// host's handle is never registered.
pub fn is_passthrough(sql: &str) -> bool {
    let toks = tokenize(sql);
    for t in &toks {
        if t.kind == TokKind::Word {
            let w = text(sql, t).to_ascii_lowercase();
            return matches!(w.as_str(), "pragma" | "vacuum" | "analyze" | "attach" | "detach" | "reindex");
        }
        if !matches!(t.kind, TokKind::Space | TokKind::Comment) {
            return false;
        }
    }
    // Empty or comment-only text: let the original library produce its
    // usual response.
    true
}

/// Byte offset just past the first complete statement, its terminating
/// `;` included. Semicolons inside strings and comments do not count.
pub fn statement_end(sql: &str) -> usize {
    let toks = tokenize(sql);
    for t in &toks {
        if t.kind == TokKind::Punct && text(sql, t) == ";" {
            return t.end;
        }
    }
    sql.len()
}

/// One full rewrite, uncached.
pub fn rewrite_uncached(cfg: &Config, sql: &str, skip_heavy: bool) -> Rewritten {
    let lower = sql.to_ascii_lowercase();
    let mut flags = RewriteFlags {
        contains_on_deck_query: cfg.on_deck_markers.iter().any(|m| lower.contains(m)),
        ..RewriteFlags::default()
    };

    if is_shadow_resident(sql) {
        return Rewritten {
            kind: classify_statement(sql),
            sql: sql.to_string(),
            flags,
            param_count: 0,
            is_backend_only: false,
        };
    }

    let toks = tokenize(sql);
    let pass1 = Pass1 {
        cfg,
        sql,
        toks: &toks,
        out: String::with_capacity(sql.len() + 32),
        params: 0,
        expect_table: false,
        from_depth: Vec::new(),
        depth: 0,
        last_word_as: false,
        flags,
        skip_heavy,
        active_fts: None,
    };
    let (mut out, params, pass_flags) = pass1.run();
    flags = pass_flags;

    if !skip_heavy {
        let (completed, fixed) = group_by_complete(&out);
        out = completed;
        flags.had_group_by_fixup = fixed;
    }

    Rewritten {
        kind: classify_statement(&out),
        sql: out,
        flags,
        param_count: params,
        is_backend_only: true,
    }
}

struct CacheEntry {
    input: Box<str>,
    output: Arc<Rewritten>,
}

#[derive(Default)]
struct CacheMap {
    buckets: FxHashMap<u64, Vec<Arc<CacheEntry>>>,
    order: Vec<u64>,
    len: usize,
}

/// The rewriter cache. Lookup walks an immutable snapshot published with
/// release/acquire semantics; insert briefly holds a lock to build and
/// publish the next snapshot. Entries are immutable once inserted.
pub struct Rewriter {
    cache: ArcSwap<CacheMap>,
    insert_lock: Mutex<()>,
    cap: usize,
    max_sql: usize,
}

fn hash_sql(sql: &str) -> u64 {
    let mut h = FxHasher::default();
    h.write(sql.as_bytes());
    h.finish()
}

impl Rewriter {
    pub fn new(cap: usize, max_sql: usize) -> Rewriter {
        Rewriter {
            cache: ArcSwap::from_pointee(CacheMap::default()),
            insert_lock: Mutex::new(()),
            cap,
            max_sql,
        }
    }

    pub fn rewrite(&self, cfg: &Config, sql: &str, skip_heavy: bool) -> Arc<Rewritten> {
        // Degraded rewrites and oversized inputs bypass the cache so a
        // statement prepared under pressure cannot poison the full variant.
        if skip_heavy || sql.len() > self.max_sql {
            return Arc::new(rewrite_uncached(cfg, sql, skip_heavy));
        }
        let key = hash_sql(sql);
        {
            let snap = self.cache.load();
            if let Some(bucket) = snap.buckets.get(&key) {
                for entry in bucket {
                    if &*entry.input == sql {
                        return Arc::clone(&entry.output);
                    }
                }
            }
        }

        let output = Arc::new(rewrite_uncached(cfg, sql, false));
        let _g = self.insert_lock.lock();
        let cur = self.cache.load_full();
        // Lost the race? The other writer's entry is equivalent.
        if let Some(bucket) = cur.buckets.get(&key) {
            if bucket.iter().any(|e| &*e.input == sql) {
                return output;
            }
        }
        let mut next = CacheMap {
            buckets: cur.buckets.clone(),
            order: cur.order.clone(),
            len: cur.len,
        };
        next.buckets.entry(key).or_default().push(Arc::new(CacheEntry {
            input: sql.into(),
            output: Arc::clone(&output),
        }));
        next.order.push(key);
        next.len += 1;
        while next.len > self.cap && !next.order.is_empty() {
            let victim = next.order.remove(0);
            if let Some(bucket) = next.buckets.get_mut(&victim) {
                if !bucket.is_empty() {
                    bucket.remove(0);
                }
                if bucket.is_empty() {
                    next.buckets.remove(&victim);
                }
            }
            next.len -= 1;
        }
        self.cache.store(Arc::new(next));
        output
    }

    /// Child-side of fork: publish a fresh empty snapshot so no lock state
    /// or entry from the parent is ever touched again.
    pub fn reset_after_fork(&self) {
        self.cache.store(Arc::new(CacheMap::default()));
    }

    #[cfg(test)]
    fn cached_len(&self) -> usize {
        self.cache.load().len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        Config::from_env()
    }

    fn full(sql: &str) -> Rewritten {
        rewrite_uncached(&cfg(), sql, false)
    }

    #[test]
    fn placeholders_become_dollar_n_in_order() {
        let r = full("SELECT id, title FROM metadata_items WHERE id = ? AND title > ?");
        assert_eq!(
            r.sql,
            "SELECT id, title FROM plex.metadata_items WHERE id = $1 AND title > $2"
        );
        assert_eq!(r.param_count, 2);
    }

    #[test]
    fn placeholders_in_strings_and_comments_stay() {
        let r = full("SELECT '?' /* ? */ FROM plugins WHERE id = ? -- trailing ?");
        assert!(r.sql.contains("'?'"));
        assert!(r.sql.contains("/* ? */"));
        assert!(r.sql.contains("-- trailing ?"));
        assert!(r.sql.contains("id = $1"));
        assert_eq!(r.param_count, 1);
    }

    #[test]
    fn schema_qualifies_table_position_only() {
        let r = full("SELECT id, title FROM metadata_items WHERE id = ?");
        assert_eq!(
            r.sql,
            "SELECT id, title FROM plex.metadata_items WHERE id = $1"
        );
    }

    #[test]
    fn already_qualified_tables_are_untouched() {
        let r = full("SELECT * FROM plex.metadata_items");
        assert_eq!(r.sql, "SELECT * FROM plex.metadata_items");
    }

    #[test]
    fn joins_and_comma_lists_qualify() {
        let r = full("SELECT * FROM metadata_items, media_items JOIN media_parts ON 1");
        assert!(r.sql.contains("FROM plex.metadata_items, plex.media_items"));
        assert!(r.sql.contains("JOIN plex.media_parts"));
    }

    #[test]
    fn unknown_tables_stay_bare() {
        let r = full("SELECT * FROM sqlite_master");
        assert_eq!(r.sql, "SELECT * FROM sqlite_master");
    }

    #[test]
    fn insert_and_update_qualify() {
        let r = full("INSERT INTO metadata_items (id) VALUES (?)");
        assert_eq!(r.sql, "INSERT INTO plex.metadata_items (id) VALUES ($1)");
        let r = full("UPDATE media_parts SET file = ? WHERE id = ?");
        assert_eq!(r.sql, "UPDATE plex.media_parts SET file = $1 WHERE id = $2");
    }

    #[test]
    fn quoted_alias_becomes_identifier() {
        let r = full("select plugins.id as 'plugins_id' from plugins");
        assert!(r.sql.contains("as \"plugins_id\""));
        assert!(r.sql.contains("from plex.plugins"));
    }

    #[test]
    fn backtick_identifiers_convert() {
        let r = full("SELECT `title` FROM `metadata_items`");
        assert!(r.sql.contains("\"title\""));
        assert!(r.sql.contains("\"metadata_items\""));
    }

    #[test]
    fn group_by_strict_completion() {
        let r = full(
            "SELECT metadata_items.id, metadata_items.title, COUNT(*) FROM metadata_items GROUP BY metadata_items.id",
        );
        assert!(r.flags.had_group_by_fixup);
        assert!(r
            .sql
            .ends_with("GROUP BY metadata_items.id, metadata_items.title"));
    }

    #[test]
    fn group_by_preserves_having_and_order() {
        let r = full(
            "SELECT a.x, a.y, COUNT(*) FROM accounts a GROUP BY a.x HAVING COUNT(*) > 1 ORDER BY a.y",
        );
        assert!(r.sql.contains("GROUP BY a.x, a.y HAVING COUNT(*) > 1 ORDER BY a.y"));
    }

    #[test]
    fn group_by_alias_expansion() {
        let r = full("SELECT a.x AS label, COUNT(*) FROM accounts a GROUP BY label");
        assert!(!r.flags.had_group_by_fixup, "alias covers the column: {}", r.sql);
    }

    #[test]
    fn group_by_skips_case_subquery_and_constants() {
        let r = full(
            "SELECT a.x, CASE WHEN a.y THEN 1 ELSE 0 END, (SELECT MAX(id) FROM tags), 'k', COUNT(*) FROM accounts a GROUP BY a.x",
        );
        assert!(!r.flags.had_group_by_fixup, "{}", r.sql);
    }

    #[test]
    fn group_by_complete_without_group_clause_is_noop() {
        let r = full("SELECT a.x, COUNT(*) FROM accounts a");
        assert!(!r.flags.had_group_by_fixup);
    }

    #[test]
    fn fts_match_lowers_to_ilike() {
        let r = full("SELECT * FROM fts4_metadata_titles WHERE fts4_metadata_titles MATCH ?");
        assert!(r.flags.is_full_text_search);
        assert!(r.sql.contains("FROM plex.metadata_items"));
        assert!(r.sql.contains("title ILIKE ('%' || $1 || '%')"));
    }

    #[test]
    fn fts_match_with_literal_pattern() {
        let r = full("SELECT * FROM fts4_tag_titles WHERE fts4_tag_titles MATCH 'comedy'");
        assert!(r.sql.contains("tag ILIKE ('%' || 'comedy' || '%')"));
    }

    #[test]
    fn degraded_skips_heavy_passes() {
        let r = rewrite_uncached(
            &cfg(),
            "SELECT metadata_items.id, metadata_items.title, COUNT(*) FROM metadata_items GROUP BY metadata_items.id",
            true,
        );
        assert!(!r.flags.had_group_by_fixup);
        // The minimal rewrite still runs.
        assert!(r.sql.contains("plex.metadata_items"));
    }

    #[test]
    fn begin_immediate_normalises() {
        let r = full("BEGIN IMMEDIATE");
        assert_eq!(r.sql, "BEGIN");
        assert_eq!(r.kind, StatementKind::Begin);
    }

    #[test]
    fn classification() {
        assert_eq!(classify_statement("SELECT 1"), StatementKind::Query);
        assert_eq!(classify_statement("  with x as (select 1) select * from x"), StatementKind::Query);
        assert_eq!(classify_statement("INSERT INTO t VALUES (1)"), StatementKind::Insert);
        assert_eq!(classify_statement("DELETE FROM t"), StatementKind::Write);
        assert_eq!(classify_statement("COMMIT"), StatementKind::TxnEnd);
        assert_eq!(classify_statement("ROLLBACK"), StatementKind::TxnEnd);
        assert_eq!(classify_statement("SAVEPOINT sp1"), StatementKind::Savepoint);
        assert_eq!(classify_statement("RELEASE SAVEPOINT sp1"), StatementKind::Release);
        assert_eq!(classify_statement("rollback to savepoint sp1"), StatementKind::Release);
        assert_eq!(classify_statement("ROLLBACK TO sp1"), StatementKind::Release);
    }

    #[test]
    fn sqlite_internal_statements_are_shadow_resident() {
        assert!(is_shadow_resident("SELECT name FROM sqlite_master WHERE type = 'table'"));
        assert!(is_shadow_resident("select sqlite_version()"));
        assert!(!is_shadow_resident("SELECT * FROM metadata_items"));
        // Only identifiers count; the word inside a string does not.
        assert!(!is_shadow_resident("SELECT 'sqlite_master' FROM plugins"));

        let r = full("SELECT name FROM sqlite_master WHERE name = ?");
        assert!(!r.is_backend_only);
        // The text is left for the shadow library, placeholders included.
        assert_eq!(r.sql, "SELECT name FROM sqlite_master WHERE name = ?");

        assert!(full("SELECT id FROM metadata_items").is_backend_only);
    }

    #[test]
    fn passthrough_statements() {
        assert!(is_passthrough("PRAGMA cache_size = 2000"));
        assert!(is_passthrough("  -- nothing\n"));
        assert!(is_passthrough("VACUUM"));
        assert!(!is_passthrough("SELECT 1"));
    }

    #[test]
    fn rewrite_is_idempotent() {
        let samples = [
            "SELECT id, title FROM metadata_items WHERE id = ? AND title LIKE '%x%'",
            "select plugins.id as 'plugins_id' from plugins",
            "SELECT metadata_items.id, metadata_items.title, COUNT(*) FROM metadata_items GROUP BY metadata_items.id",
            "SELECT * FROM fts4_metadata_titles WHERE fts4_metadata_titles MATCH 'x'",
            "INSERT INTO metadata_items (id, title) VALUES (?, ?)",
        ];
        let cfg = cfg();
        for sql in samples {
            let once = rewrite_uncached(&cfg, sql, false);
            let twice = rewrite_uncached(&cfg, &once.sql, false);
            assert_eq!(once.sql, twice.sql, "not idempotent for {sql}");
        }
    }

    #[test]
    fn statement_end_respects_strings_and_comments() {
        let sql = "SELECT ';' FROM t; SELECT 2";
        assert_eq!(&sql[..statement_end(sql)], "SELECT ';' FROM t;");
        assert_eq!(statement_end("SELECT 1"), "SELECT 1".len());
        let commented = "SELECT 1 -- a ; in a comment\n; SELECT 2";
        assert_eq!(
            &commented[..statement_end(commented)],
            "SELECT 1 -- a ; in a comment\n;"
        );
    }

    #[test]
    fn on_deck_classification_by_marker() {
        let r = full("SELECT * FROM metadata_items -- on_deck hub");
        assert!(r.flags.contains_on_deck_query);
        assert!(!full("SELECT 1").flags.contains_on_deck_query);
    }

    #[test]
    fn cache_hits_and_shares_output() {
        let rw = Rewriter::new(16, 1024);
        let cfg = cfg();
        let a = rw.rewrite(&cfg, "SELECT * FROM plugins WHERE id = ?", false);
        let b = rw.rewrite(&cfg, "SELECT * FROM plugins WHERE id = ?", false);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(rw.cached_len(), 1);
    }

    #[test]
    fn cache_evicts_in_insertion_order() {
        let rw = Rewriter::new(2, 1024);
        let cfg = cfg();
        let first = rw.rewrite(&cfg, "SELECT 1", false);
        rw.rewrite(&cfg, "SELECT 2", false);
        rw.rewrite(&cfg, "SELECT 3", false);
        assert_eq!(rw.cached_len(), 2);
        // Re-request of the evicted entry produces a fresh arc.
        let again = rw.rewrite(&cfg, "SELECT 1", false);
        assert!(!Arc::ptr_eq(&first, &again));
    }

    #[test]
    fn cache_bypass_for_oversized_and_degraded() {
        let rw = Rewriter::new(16, 32);
        let cfg = cfg();
        let long = "SELECT 1 /* padding padding padding */";
        assert!(long.len() > 32);
        rw.rewrite(&cfg, long, false);
        rw.rewrite(&cfg, "SELECT 2", true);
        assert_eq!(rw.cached_len(), 0);
    }

    #[test]
    fn fork_reset_clears_entries() {
        let rw = Rewriter::new(16, 1024);
        let cfg = cfg();
        rw.rewrite(&cfg, "SELECT 1", false);
        assert_eq!(rw.cached_len(), 1);
        rw.reset_after_fork();
        assert_eq!(rw.cached_len(), 0);
    }
}
