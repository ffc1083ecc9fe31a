//! SQL Security Validator
//!
//! Gatekeeper between SQL generation and execution. Given the generated SQL,
//! the tenant the turn is scoped to and the dataset's [`IsolationConfig`], it
//! runs three independent checks:
//!
//! 1. **Tenant Filter** - `field = id` must be present. Row-level datasets
//!    require it to be a conjunct of the WHERE clause of every top-level
//!    SELECT; hierarchical datasets accept it anywhere.
//! 2. **Single Tenant** - the filter field is never compared to any other
//!    value, put in a multi-value list, negated or ranged.
//! 3. **Read-Only** - no mutating keyword appears as a whole token.
//!
//! The validator works on text (whitespace-collapsed, string literals masked)
//! rather than a parsed AST. It is a pure function: no I/O, same input gives
//! the same [`ValidationResult`] apart from the measured elapsed time.
//!
//! Execution only accepts [`ApprovedSql`], which can only be obtained from
//! [`approve`] when every check passed.

use std::fmt;
use std::ops::Range;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::isolation::{IsolationConfig, IsolationMethod, TenantId};

/// Keywords that make a statement non read-only
pub const MUTATING_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "TRUNCATE", "CREATE", "GRANT", "REVOKE",
    "MERGE", "COPY",
];

static MUTATING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)\b({})\b", MUTATING_KEYWORDS.join("|"))).expect("static regex")
});

/// Words the structural scan cares about
static CLAUSE_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(WITH|AS|SELECT|FROM|JOIN|ON|USING|WHERE|AND|OR|NOT|IN|EXISTS|BETWEEN|LIKE|CASE|WHEN|THEN|ELSE|END|GROUP|HAVING|ORDER|LIMIT|OFFSET|FETCH|WINDOW|RETURNING|UNION|INTERSECT|EXCEPT)\b",
    )
    .expect("static regex")
});

static SELECT_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bSELECT\b").expect("static regex"));
static WHERE_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bWHERE\b").expect("static regex"));
static UNION_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bUNION\b").expect("static regex"));
static EXTRA_STATEMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r";\s*\S").expect("static regex"));

// Patterns applied to the text right after an occurrence of the filter field
static EQ_SUBQUERY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*=\s*(?:\(\s*SELECT\b|(?:ANY|ALL|SOME)\b)").expect("static regex")
});
static COMPARE_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(=|!=|<>|<=|>=|<|>)\s*('[^']*'|-?\d+(?:\.\d+)?)").expect("static regex")
});
static INEQUALITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(!=|<>|<=|>=|<|>)").expect("static regex"));
static NOT_IN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*NOT\s+IN\b").expect("static regex"));
static IN_LIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*IN\s*\(([^)]*)\)").expect("static regex"));
static RANGE_OR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:NOT\s+)?(BETWEEN|I?LIKE|SIMILAR\s+TO)\b").expect("static regex")
});

// Applied to the text right before an occurrence (`42 = client_id`)
static LITERAL_BEFORE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"('[^']*'|-?\b\d+(?:\.\d+)?)\s*(=|!=|<>|<=|>=|<|>)\s*$").expect("static regex")
});

// A comparison is standalone only between these: anything else (`+`, `||`,
// `::`, `IS`, `NOT`, ...) makes it part of a larger expression.
static PREDICATE_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:^|[(,;]|\b(?:WHERE|AND|OR|ON|WHEN|HAVING|SELECT|THEN|ELSE))\s*$")
        .expect("static regex")
});
static PREDICATE_END: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:$|[;),]|(?:AND|OR|AS|FROM|WHERE|GROUP|ORDER|LIMIT|OFFSET|FETCH|HAVING|WINDOW|UNION|INTERSECT|EXCEPT|THEN|WHEN|ELSE|END|JOIN|INNER|LEFT|RIGHT|FULL|CROSS|ON|RETURNING)\b)",
    )
    .expect("static regex")
});

static DOLLAR_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\$(?:[A-Za-z_][A-Za-z0-9_]*)?\$").expect("static regex"));

/// Words that end the WHERE clause they appear in
const CLAUSE_BOUNDARIES: &[&str] = &[
    "SELECT", "FROM", "JOIN", "ON", "USING", "GROUP", "HAVING", "ORDER", "LIMIT", "OFFSET",
    "FETCH", "WINDOW", "RETURNING", "UNION", "INTERSECT", "EXCEPT", "CASE", "WHEN", "THEN",
    "ELSE", "END",
];

const SET_OPERATORS: &[&str] = &["UNION", "INTERSECT", "EXCEPT"];

/// Words that end a FROM list
const FROM_LIST_END: &[&str] = &[
    "WHERE", "GROUP", "HAVING", "ORDER", "LIMIT", "OFFSET", "FETCH", "WINDOW", "UNION",
    "INTERSECT", "EXCEPT", "RETURNING",
];

// ============================================================================
// Result types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckName {
    TenantFilter,
    SingleTenant,
    ReadOnly,
}

impl fmt::Display for CheckName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckName::TenantFilter => "Tenant Filter",
            CheckName::SingleTenant => "Single Tenant",
            CheckName::ReadOnly => "Read-Only",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationCheck {
    pub name: CheckName,
    pub status: CheckStatus,
    pub message: String,
}

impl ValidationCheck {
    fn pass(name: CheckName, message: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Pass,
            message: message.into(),
        }
    }

    fn fail(name: CheckName, message: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Fail,
            message: message.into(),
        }
    }

    pub fn passed(&self) -> bool {
        self.status == CheckStatus::Pass
    }
}

/// Advisory findings; they never fail validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningCode {
    MultipleWhere,
    Subquery,
    Union,
    MultipleStatements,
    HierarchyTableNotJoined,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub code: WarningCode,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub checks: Vec<ValidationCheck>,
    pub warnings: Vec<ValidationWarning>,
    pub elapsed: Duration,
}

/// Equality ignores `elapsed`, which is the only non-deterministic field.
impl PartialEq for ValidationResult {
    fn eq(&self, other: &Self) -> bool {
        self.passed == other.passed
            && self.checks == other.checks
            && self.warnings == other.warnings
    }
}

impl Eq for ValidationResult {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub total_checks: usize,
    pub passed_checks: usize,
    pub failed_checks: usize,
    pub has_warnings: bool,
}

impl ValidationResult {
    pub fn failed_checks(&self) -> impl Iterator<Item = &ValidationCheck> {
        self.checks.iter().filter(|c| !c.passed())
    }

    pub fn check(&self, name: CheckName) -> Option<&ValidationCheck> {
        self.checks.iter().find(|c| c.name == name)
    }

    pub fn summary(&self) -> ValidationSummary {
        let passed_checks = self.checks.iter().filter(|c| c.passed()).count();
        ValidationSummary {
            total_checks: self.checks.len(),
            passed_checks,
            failed_checks: self.checks.len() - passed_checks,
            has_warnings: !self.warnings.is_empty(),
        }
    }
}

/// SQL that passed every security check for one tenant.
///
/// Only [`approve`] constructs this, so code that executes SQL cannot be
/// handed text that skipped validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovedSql {
    sql: String,
    tenant: TenantId,
}

impl ApprovedSql {
    pub fn as_str(&self) -> &str {
        &self.sql
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }
}

impl fmt::Display for ApprovedSql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

// ============================================================================
// Entry points
// ============================================================================

/// Validate `sql` for `tenant`. A missing config falls back to row-level
/// isolation on `client_id`.
pub fn validate(
    sql: &str,
    tenant: &TenantId,
    isolation: Option<&IsolationConfig>,
) -> ValidationResult {
    let started = Instant::now();

    let default_config;
    let config = match isolation {
        Some(config) => config,
        None => {
            warn!("no isolation config supplied, defaulting to row_level client_id");
            default_config = IsolationConfig::default();
            &default_config
        }
    };
    if let Err(problem) = config.validate() {
        warn!(%problem, "isolation config is malformed");
    }

    let text = SqlText::new(sql);
    let checks = match FieldPatterns::new(&config.filter_field, tenant) {
        Ok(patterns) => vec![
            tenant_filter_check(&text, &patterns, tenant, config),
            single_tenant_check(&text, &patterns, tenant, &config.filter_field),
            read_only_check(&text),
        ],
        Err(e) => vec![
            ValidationCheck::fail(
                CheckName::TenantFilter,
                format!("Unusable filter field '{}': {}", config.filter_field, e),
            ),
            ValidationCheck::fail(CheckName::SingleTenant, "Not evaluated"),
            read_only_check(&text),
        ],
    };
    let warnings = collect_warnings(&text, config);
    let passed = checks.iter().all(ValidationCheck::passed);

    let result = ValidationResult {
        passed,
        checks,
        warnings,
        elapsed: started.elapsed(),
    };
    debug!(
        passed,
        tenant = %tenant,
        method = %config.method,
        elapsed_us = result.elapsed.as_micros() as u64,
        "SQL validated"
    );
    result
}

/// Validate and, if every check passed, hand back executable SQL.
pub fn approve(
    sql: &str,
    tenant: &TenantId,
    isolation: Option<&IsolationConfig>,
) -> (ValidationResult, Option<ApprovedSql>) {
    let result = validate(sql, tenant, isolation);
    let approved = result.passed.then(|| ApprovedSql {
        sql: strip_comments(sql).trim().to_string(),
        tenant: tenant.clone(),
    });
    (result, approved)
}

// ============================================================================
// Text preparation
// ============================================================================

#[derive(Debug, Clone)]
struct Word {
    start: usize,
    end: usize,
    text: String,
    depth: i32,
}

impl Word {
    fn is(&self, word: &str) -> bool {
        self.text == word
    }

    fn is_any(&self, words: &[&str]) -> bool {
        words.contains(&self.text.as_str())
    }
}

/// Comment-free, whitespace-collapsed SQL plus a same-length copy with
/// quoted contents masked, and the parenthesis depth at every byte.
struct SqlText {
    normalized: String,
    masked: String,
    depth: Vec<i32>,
    words: Vec<Word>,
}

impl SqlText {
    fn new(sql: &str) -> Self {
        let normalized = strip_comments(sql)
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let masked = mask_literals(&normalized);
        let depth = paren_depths(&masked);
        let words = CLAUSE_WORD
            .find_iter(&masked)
            .map(|m| Word {
                start: m.start(),
                end: m.end(),
                text: m.as_str().to_ascii_uppercase(),
                depth: depth.get(m.start()).copied().unwrap_or(0),
            })
            .collect();
        Self {
            normalized,
            masked,
            depth,
            words,
        }
    }

    /// Whether the comparison spanning `range` stands on its own rather than
    /// being an operand of a larger expression.
    fn is_standalone(&self, range: Range<usize>) -> bool {
        PREDICATE_START.is_match(&self.masked[..range.start])
            && PREDICATE_END.is_match(&self.masked[range.end..])
    }

    fn depth_at(&self, pos: usize) -> i32 {
        self.depth.get(pos).copied().unwrap_or(0)
    }

    /// Index of the `(` opening the depth-`k` group that contains `pos`.
    fn group_open(&self, pos: usize, k: i32) -> Option<usize> {
        (0..pos).rev().find(|&i| self.depth[i] < k)
    }

    /// End (exclusive) of the depth-`k` group that contains `pos`.
    fn group_close(&self, pos: usize, k: i32) -> usize {
        (pos..self.depth.len())
            .find(|&i| self.depth[i] < k)
            .unwrap_or(self.depth.len())
    }

    fn words_in(&self, range: Range<usize>, depth: i32) -> impl Iterator<Item = &Word> {
        self.words
            .iter()
            .filter(move |w| w.depth == depth && w.start >= range.start && w.end <= range.end)
    }

    /// Parts that must each carry their own filter: top-level SELECT
    /// branches split at depth-0 set operators and statement separators.
    fn branches(&self) -> Vec<Range<usize>> {
        let mut cuts: Vec<Range<usize>> = self
            .words_in(0..self.masked.len(), 0)
            .filter(|w| w.is_any(SET_OPERATORS))
            .map(|w| w.start..w.end)
            .chain(self.statement_breaks())
            .collect();
        cuts.sort_by_key(|cut| cut.start);
        self.split_at(cuts)
    }

    /// Individual statements split at depth-0 `;`.
    fn statements(&self) -> Vec<Range<usize>> {
        self.split_at(self.statement_breaks().collect())
    }

    fn statement_breaks(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        self.masked
            .bytes()
            .enumerate()
            .filter(move |&(i, b)| b == b';' && self.depth_at(i) == 0)
            .map(|(i, _)| i..i + 1)
    }

    /// Ranges between `cuts`, dropping blank ones (a trailing `;`).
    fn split_at(&self, cuts: Vec<Range<usize>>) -> Vec<Range<usize>> {
        let mut parts = Vec::with_capacity(cuts.len() + 1);
        let mut start = 0;
        for cut in cuts {
            parts.push(start..cut.start);
            start = cut.end;
        }
        parts.push(start..self.masked.len());
        parts.retain(|part| !self.masked[part.clone()].trim().is_empty());
        parts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment {
    Code,
    Comment,
    /// Body of a string literal, dollar-quoted string or quoted identifier
    Quoted,
}

/// Split `sql` into code, comments and quoted bodies the way Postgres lexes
/// them. Delimiters (quotes, dollar tags) are reported as code.
fn scan<'a>(sql: &'a str, mut emit: impl FnMut(&'a str, Segment)) {
    let bytes = sql.as_bytes();
    let mut code_start = 0;
    let mut i = 0;
    while i < bytes.len() {
        let rest = &sql[i..];
        // (body start, body end, resume at, kind)
        let special = if rest.starts_with("--") {
            let end = rest.find('\n').map_or(sql.len(), |n| i + n);
            Some((i, end, end, Segment::Comment))
        } else if rest.starts_with("/*") {
            let end = block_comment_end(sql, i);
            Some((i, end, end, Segment::Comment))
        } else if bytes[i] == b'\'' {
            let close = literal_end(sql, i + 1, is_escape_string(&sql[..i]));
            Some((i + 1, close, (close + 1).min(sql.len()), Segment::Quoted))
        } else if bytes[i] == b'"' {
            let close = rest[1..].find('"').map_or(sql.len(), |n| i + 1 + n);
            Some((i + 1, close, (close + 1).min(sql.len()), Segment::Quoted))
        } else if bytes[i] == b'$' && !continues_identifier(&sql[..i]) {
            DOLLAR_TAG.find(rest).and_then(|tag| {
                let tag = tag.as_str();
                let body = i + tag.len();
                sql[body..]
                    .find(tag)
                    .map(|n| (body, body + n, body + n + tag.len(), Segment::Quoted))
            })
        } else {
            None
        };

        match special {
            Some((body_start, body_end, resume, kind)) => {
                emit(&sql[code_start..body_start], Segment::Code);
                emit(&sql[body_start..body_end], kind);
                code_start = body_end;
                i = resume;
            }
            None => i += rest.chars().next().map_or(1, char::len_utf8),
        }
    }
    emit(&sql[code_start..], Segment::Code);
}

/// End (exclusive) of the possibly nested block comment opening at `start`.
fn block_comment_end(sql: &str, start: usize) -> usize {
    let bytes = sql.as_bytes();
    let mut depth = 0usize;
    let mut i = start;
    while i + 1 < bytes.len() {
        match (bytes[i], bytes[i + 1]) {
            (b'/', b'*') => {
                depth += 1;
                i += 2;
            }
            (b'*', b'/') => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return i;
                }
            }
            _ => i += 1,
        }
    }
    sql.len()
}

/// Index of the quote closing a literal whose body starts at `from`.
fn literal_end(sql: &str, from: usize, escapes: bool) -> usize {
    let bytes = sql.as_bytes();
    let mut i = from;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if escapes => i += 2,
            b'\'' if bytes.get(i + 1) == Some(&b'\'') => i += 2,
            b'\'' => return i,
            _ => i += 1,
        }
    }
    sql.len()
}

/// `E'...'` literals honour backslash escapes.
fn is_escape_string(before: &str) -> bool {
    let mut rev = before.chars().rev();
    matches!(rev.next(), Some('e' | 'E')) && !rev.next().is_some_and(is_identifier_char)
}

fn continues_identifier(before: &str) -> bool {
    before
        .chars()
        .next_back()
        .is_some_and(|c| is_identifier_char(c) || c == '$')
}

fn is_identifier_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Replace every comment with a single space; everything else is kept.
fn strip_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    scan(sql, |piece, segment| match segment {
        Segment::Comment => out.push(' '),
        Segment::Code | Segment::Quoted => out.push_str(piece),
    });
    out
}

/// Replace quoted bodies with `_`, keeping byte offsets.
fn mask_literals(sql: &str) -> String {
    let mut masked = String::with_capacity(sql.len());
    scan(sql, |piece, segment| match segment {
        Segment::Code => masked.push_str(piece),
        Segment::Comment | Segment::Quoted => masked.push_str(&"_".repeat(piece.len())),
    });
    masked
}

/// Depth before each byte; a parenthesis itself sits at the outer depth.
fn paren_depths(masked: &str) -> Vec<i32> {
    let mut depths = Vec::with_capacity(masked.len());
    let mut depth = 0i32;
    for byte in masked.bytes() {
        match byte {
            b'(' => {
                depths.push(depth);
                depth += 1;
            }
            b')' => {
                depth -= 1;
                depths.push(depth);
            }
            _ => depths.push(depth),
        }
    }
    depths
}

/// Dynamic patterns for one filter field and tenant
struct FieldPatterns {
    field: Regex,
    equals_tenant: Regex,
}

impl FieldPatterns {
    fn new(field: &str, tenant: &TenantId) -> Result<Self, regex::Error> {
        let field_re = regex::escape(field);
        let id = regex::escape(tenant.as_str());
        Ok(Self {
            field: Regex::new(&format!(
                r"(?i)(?:\b[A-Za-z_][A-Za-z0-9_]*\s*\.\s*)?\b{}\b",
                field_re
            ))?,
            equals_tenant: Regex::new(&format!(r"^\s*=\s*(?:'{id}'|{id}\b)", id = id))?,
        })
    }

    /// Byte ranges of every standalone `field = id` (or `id = field`)
    /// predicate.
    fn tenant_predicates(&self, text: &SqlText, tenant: &TenantId) -> Vec<Range<usize>> {
        let mut found = Vec::new();
        for m in self.field.find_iter(&text.masked) {
            let after = &text.normalized[m.end()..];
            if let Some(eq) = self.equals_tenant.find(after) {
                let end = m.end() + eq.end();
                if text.is_standalone(m.start()..end) {
                    found.push(m.start()..end);
                    continue;
                }
            }
            let before = &text.normalized[..m.start()];
            if let Some(caps) = LITERAL_BEFORE.captures(before) {
                let Some(literal) = caps.get(1) else { continue };
                if &caps[2] == "="
                    && tenant.matches_literal(literal.as_str())
                    && text.is_standalone(literal.start()..m.end())
                {
                    found.push(literal.start()..m.end());
                }
            }
        }
        found
    }
}

// ============================================================================
// Check 1: tenant filter presence
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterDefect {
    NotConjunct,
    Disjunction,
    NotInWhere,
    SubqueryOnly,
    CteOnly,
    BesideOtherRelations,
    NestedSetOperation,
}

impl FilterDefect {
    fn describe(&self, predicate: &str) -> String {
        match self {
            FilterDefect::NotConjunct => {
                format!("{} is not bound by WHERE or AND", predicate)
            }
            FilterDefect::Disjunction => {
                format!("{} is combined with OR and does not restrict every row", predicate)
            }
            FilterDefect::NotInWhere => format!("{} is not part of a WHERE clause", predicate),
            FilterDefect::SubqueryOnly => {
                format!("{} only restricts a subquery, not the outer query", predicate)
            }
            FilterDefect::CteOnly => {
                format!("{} only restricts a CTE; the outer query needs its own", predicate)
            }
            FilterDefect::BesideOtherRelations => format!(
                "{} restricts a derived table that shares its FROM list with other relations",
                predicate
            ),
            FilterDefect::NestedSetOperation => format!(
                "{} sits inside a parenthesised set operation; filter each top-level branch",
                predicate
            ),
        }
    }
}

fn tenant_filter_check(
    text: &SqlText,
    patterns: &FieldPatterns,
    tenant: &TenantId,
    config: &IsolationConfig,
) -> ValidationCheck {
    let predicate = format!("{} = {}", config.filter_field, tenant);
    let predicates = patterns.tenant_predicates(text, tenant);

    if predicates.is_empty() {
        return ValidationCheck::fail(
            CheckName::TenantFilter,
            format!("Missing WHERE {} filter", predicate),
        );
    }

    if config.method == IsolationMethod::Hierarchical {
        let statements = text.statements();
        let unfiltered = statements
            .iter()
            .position(|s| !predicates.iter().any(|p| s.contains(&p.start)));
        return match unfiltered {
            Some(index) => ValidationCheck::fail(
                CheckName::TenantFilter,
                format!("Missing {} filter in statement {}", predicate, index + 1),
            ),
            None => ValidationCheck::pass(
                CheckName::TenantFilter,
                format!("Found {} filter (hierarchical)", predicate),
            ),
        };
    }

    let branches = text.branches();
    for (index, branch) in branches.iter().enumerate() {
        let mut defect = None;
        let mut satisfied = false;
        for found in predicates.iter().filter(|p| branch.contains(&p.start)) {
            match where_scope(text, found.start).and_then(|w| restricts_outer(text, w)) {
                Ok(()) => {
                    satisfied = true;
                    break;
                }
                Err(d) => {
                    defect.get_or_insert(d);
                }
            }
        }
        if satisfied {
            continue;
        }
        let location = if branches.len() > 1 {
            format!(" in branch {}", index + 1)
        } else {
            String::new()
        };
        let message = match defect {
            Some(d) => format!("{}{}", d.describe(&predicate), location),
            None => format!("Missing WHERE {} filter{}", predicate, location),
        };
        return ValidationCheck::fail(CheckName::TenantFilter, message);
    }

    ValidationCheck::pass(
        CheckName::TenantFilter,
        format!("Found WHERE {} filter", predicate),
    )
}

/// Find the WHERE keyword that governs the predicate at `pred_start`,
/// requiring the predicate to be a pure conjunct at every nesting level.
fn where_scope(text: &SqlText, pred_start: usize) -> Result<usize, FilterDefect> {
    let mut pos = pred_start;
    let mut k = text.depth_at(pos);

    loop {
        let open = if k > 0 { text.group_open(pos, k) } else { None };
        let group_start = open.map(|i| i + 1).unwrap_or(0);
        let preceding: Vec<&Word> = text.words_in(group_start..pos, k).collect();

        match preceding.last() {
            Some(w) if w.is("AND") || w.is("WHERE") => {}
            Some(_) => return Err(FilterDefect::NotConjunct),
            None => {}
        }

        if let Some(idx) = preceding.iter().rposition(|w| w.is("WHERE")) {
            if preceding[idx + 1..]
                .iter()
                .any(|w| w.is_any(CLAUSE_BOUNDARIES))
            {
                return Err(FilterDefect::NotInWhere);
            }
            let where_word = preceding[idx];
            let clause_end = where_clause_end(text, where_word);
            if text
                .words_in(where_word.end..clause_end, k)
                .any(|w| w.is("OR"))
            {
                return Err(FilterDefect::Disjunction);
            }
            return Ok(where_word.start);
        }

        let Some(open) = open else {
            return Err(FilterDefect::NotInWhere);
        };
        if preceding.iter().any(|w| w.is_any(CLAUSE_BOUNDARIES)) {
            return Err(FilterDefect::NotInWhere);
        }
        let close = text.group_close(pos, k);
        if text.words_in(group_start..close, k).any(|w| w.is("OR")) {
            return Err(FilterDefect::Disjunction);
        }

        pos = open;
        k = text.depth_at(open);
    }
}

fn where_clause_end(text: &SqlText, where_word: &Word) -> usize {
    let k = where_word.depth;
    let group_end = text.group_close(where_word.end, k);
    let boundary = text
        .words_in(where_word.end..group_end, k)
        .find(|w| w.is_any(CLAUSE_BOUNDARIES))
        .map(|w| w.start)
        .unwrap_or(group_end);
    let statement_end = text.masked[where_word.end..boundary]
        .find(';')
        .map(|i| where_word.end + i)
        .unwrap_or(boundary);
    boundary.min(statement_end)
}

/// A WHERE nested in parentheses only counts when every enclosing group is
/// the sole relation of its FROM list, a set-operation operand or a plain
/// parenthesised query. Filters inside CTE bodies never count.
fn restricts_outer(text: &SqlText, where_pos: usize) -> Result<(), FilterDefect> {
    let mut pos = where_pos;
    let mut k = text.depth_at(pos);
    while k > 0 {
        let Some(open) = text.group_open(pos, k) else {
            break;
        };
        let outer = text.depth_at(open);
        let outer_start = if outer > 0 {
            text.group_open(open, outer).map(|i| i + 1).unwrap_or(0)
        } else {
            0
        };
        match text.words_in(outer_start..open, outer).last() {
            None => {}
            Some(w) if w.is_any(SET_OPERATORS) => {}
            Some(w) if w.is("FROM") => sole_relation(text, w.end, open, outer)?,
            Some(w) if w.is("AS") => return Err(FilterDefect::CteOnly),
            Some(_) => return Err(FilterDefect::SubqueryOnly),
        }
        let close = text.group_close(open + 1, k);
        if text
            .words_in(open..close, k)
            .any(|w| w.is_any(SET_OPERATORS))
        {
            return Err(FilterDefect::NestedSetOperation);
        }
        pos = open;
        k = outer;
    }
    Ok(())
}

/// The derived table opening at `open` must be the only relation between
/// its FROM (ending at `from_end`) and the end of that FROM list.
fn sole_relation(
    text: &SqlText,
    from_end: usize,
    open: usize,
    depth: i32,
) -> Result<(), FilterDefect> {
    if !text.masked[from_end..open].trim().is_empty() {
        return Err(FilterDefect::BesideOtherRelations);
    }
    let close = text.group_close(open + 1, depth + 1);
    let scope_end = text.group_close(close + 1, depth);

    let mut list_end = scope_end;
    for word in text.words_in(close..scope_end, depth) {
        if word.is("JOIN") {
            return Err(FilterDefect::BesideOtherRelations);
        }
        if word.is_any(FROM_LIST_END) {
            list_end = word.start;
            break;
        }
    }
    let list_end = text.masked[close..list_end]
        .find(';')
        .map_or(list_end, |i| close + i);
    let another = (close..list_end)
        .any(|i| text.masked.as_bytes()[i] == b',' && text.depth_at(i) == depth);
    if another {
        Err(FilterDefect::BesideOtherRelations)
    } else {
        Ok(())
    }
}

// ============================================================================
// Check 2: single tenant
// ============================================================================

fn single_tenant_check(
    text: &SqlText,
    patterns: &FieldPatterns,
    tenant: &TenantId,
    field: &str,
) -> ValidationCheck {
    let mut violations: Vec<String> = Vec::new();

    for m in patterns.field.find_iter(&text.masked) {
        let after = &text.normalized[m.end()..];
        let before = &text.normalized[..m.start()];

        if EQ_SUBQUERY.is_match(after) {
            violations.push(format!("{} compared to a subquery or ANY/ALL", field));
        } else if let Some(caps) = COMPARE_LITERAL.captures(after) {
            let (op, value) = (&caps[1], &caps[2]);
            let end = m.end() + caps[0].len();
            if op != "=" {
                violations.push(format!("{} used with {} {}", field, op, value));
            } else if !tenant.matches_literal(value) {
                violations.push(format!("{} compared to {}", field, value));
            } else if !text.is_standalone(m.start()..end) {
                violations.push(format!(
                    "{} = {} is part of a larger expression",
                    field, value
                ));
            }
        } else if let Some(caps) = INEQUALITY.captures(after) {
            violations.push(format!("{} used with {}", field, &caps[1]));
        } else if NOT_IN.is_match(after) {
            violations.push(format!("{} used with NOT IN", field));
        } else if let Some(caps) = IN_LIST.captures(after) {
            let items: Vec<&str> = caps[1]
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect();
            let is_subquery = items
                .first()
                .is_some_and(|first| first.to_ascii_uppercase().starts_with("SELECT"));
            if is_subquery {
                violations.push(format!("{} used with IN (subquery)", field));
            } else if items.len() != 1 {
                violations.push(format!(
                    "{} used with IN list of {} values",
                    field,
                    items.len()
                ));
            } else if !tenant.matches_literal(items[0]) {
                violations.push(format!("{} compared to {}", field, items[0]));
            }
        } else if let Some(caps) = RANGE_OR_PATTERN.captures(after) {
            violations.push(format!(
                "{} used with {}",
                field,
                caps[1].to_ascii_uppercase()
            ));
        }

        if let Some(caps) = LITERAL_BEFORE.captures(before) {
            let (value, op) = (&caps[1], &caps[2]);
            let start = caps.get(1).map_or(m.start(), |c| c.start());
            if op != "=" {
                violations.push(format!("{} used with {} {}", field, op, value));
            } else if !tenant.matches_literal(value) {
                violations.push(format!("{} compared to {}", field, value));
            } else if !text.is_standalone(start..m.end()) {
                violations.push(format!(
                    "{} = {} is part of a larger expression",
                    value, field
                ));
            }
        }
    }

    if violations.is_empty() {
        ValidationCheck::pass(
            CheckName::SingleTenant,
            format!("Query scoped to {} = {} only", field, tenant),
        )
    } else {
        violations.dedup();
        ValidationCheck::fail(CheckName::SingleTenant, violations.join("; "))
    }
}

// ============================================================================
// Check 3: read-only
// ============================================================================

fn read_only_check(text: &SqlText) -> ValidationCheck {
    let mut found: Vec<String> = MUTATING
        .find_iter(&text.normalized)
        .map(|m| m.as_str().to_ascii_uppercase())
        .collect();
    found.dedup();

    if found.is_empty() {
        ValidationCheck::pass(CheckName::ReadOnly, "No mutating keywords")
    } else {
        ValidationCheck::fail(
            CheckName::ReadOnly,
            format!("Mutating keyword(s) found: {}", found.join(", ")),
        )
    }
}

// ============================================================================
// Warnings
// ============================================================================

fn collect_warnings(text: &SqlText, config: &IsolationConfig) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();
    let mut push = |code, message: String| warnings.push(ValidationWarning { code, message });

    let where_count = WHERE_WORD.find_iter(&text.masked).count();
    if where_count > 1 {
        push(
            WarningCode::MultipleWhere,
            format!("Query contains {} WHERE clauses", where_count),
        );
    }
    if SELECT_WORD.find_iter(&text.masked).count() > 1 {
        push(
            WarningCode::Subquery,
            "Query contains a subquery".to_string(),
        );
    }
    if UNION_WORD.is_match(&text.masked) {
        push(WarningCode::Union, "Query uses UNION".to_string());
    }
    if EXTRA_STATEMENT.is_match(&text.masked) {
        push(
            WarningCode::MultipleStatements,
            "Query contains more than one statement".to_string(),
        );
    }
    if config.method == IsolationMethod::Hierarchical {
        if let Some(table) = &config.filter_table {
            let bare = table.rsplit('.').next().unwrap_or(table);
            let referenced = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(bare)))
                .map(|re| re.is_match(&text.masked))
                .unwrap_or(false);
            if !referenced {
                push(
                    WarningCode::HierarchyTableNotJoined,
                    format!("Query does not reference {}", table),
                );
            }
        }
    }
    warnings
}
