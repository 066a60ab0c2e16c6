//! SQL fragments with tracked bind positions, and executable statements

use crate::dialect::Dialect;
use crate::value::Value;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Placeholder written in the marker form of a statement
pub const BIND_MARKER: &str = "?";

/// SQL text plus the arguments bound into it
///
/// Bind positions are recorded as byte offsets when an argument is pushed,
/// so text and arguments cannot drift apart. Rendering to a concrete
/// placeholder syntax happens only at the end.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fragment {
    text: String,
    binds: Vec<usize>,
    args: Vec<Value>,
}

impl Fragment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fragment of literal SQL without arguments
    pub fn raw(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn push_str(&mut self, text: &str) -> &mut Self {
        self.text.push_str(text);
        self
    }

    /// Append a placeholder bound to `value`
    pub fn push_bind(&mut self, value: impl Into<Value>) -> &mut Self {
        self.binds.push(self.text.len());
        self.args.push(value.into());
        self
    }

    /// Append `(?,?,...)` with one placeholder per value
    pub fn push_bind_list(&mut self, values: impl IntoIterator<Item = Value>) -> &mut Self {
        self.text.push('(');
        for (i, value) in values.into_iter().enumerate() {
            if i > 0 {
                self.text.push(',');
            }
            self.push_bind(value);
        }
        self.text.push(')');
        self
    }

    /// Append another fragment, shifting its bind positions
    pub fn append(&mut self, other: Fragment) -> &mut Self {
        let offset = self.text.len();
        self.text.push_str(&other.text);
        self.binds.extend(other.binds.into_iter().map(|b| b + offset));
        self.args.extend(other.args);
        self
    }

    /// Join fragments with a separator
    pub fn join(parts: impl IntoIterator<Item = Fragment>, separator: &str) -> Fragment {
        let mut out = Fragment::new();
        for (i, part) in parts.into_iter().enumerate() {
            if i > 0 {
                out.push_str(separator);
            }
            out.append(part);
        }
        out
    }

    /// Wrap the fragment in parentheses
    pub fn parenthesized(self) -> Fragment {
        let mut out = Fragment::raw("(");
        out.append(self);
        out.push_str(")");
        out
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Raw text without placeholders
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Render with `bind(i)` (1-based) at each placeholder position
    pub fn render(&self, mut bind: impl FnMut(usize) -> String) -> String {
        let mut out = String::with_capacity(self.text.len() + self.binds.len() * 2);
        let mut last = 0;
        for (i, &pos) in self.binds.iter().enumerate() {
            out.push_str(&self.text[last..pos]);
            out.push_str(&bind(i + 1));
            last = pos;
        }
        out.push_str(&self.text[last..]);
        out
    }
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(|_| BIND_MARKER.to_string()))
    }
}

/// Outcome of an executed mutation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

/// Compiled statement bound to a dialect
#[derive(Clone)]
pub struct Statement {
    fragment: Fragment,
    dialect: Arc<dyn Dialect>,
    started: Option<DateTime<Utc>>,
    finished: Option<DateTime<Utc>>,
    result: Option<ExecResult>,
}

impl Statement {
    pub fn new(fragment: Fragment, dialect: Arc<dyn Dialect>) -> Self {
        Self {
            fragment,
            dialect,
            started: None,
            finished: None,
            result: None,
        }
    }

    /// Statement text with `?` markers
    pub fn query(&self) -> String {
        self.fragment.to_string()
    }

    /// Statement text with the dialect's placeholders, as sent to the driver
    pub fn sql(&self) -> String {
        self.fragment.render(|i| self.dialect.bind(i))
    }

    pub fn args(&self) -> &[Value] {
        self.fragment.args()
    }

    pub fn fragment(&self) -> &Fragment {
        &self.fragment
    }

    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.dialect
    }

    pub(crate) fn start_trace(&mut self) {
        self.started = Some(Utc::now());
    }

    pub(crate) fn stop_trace(&mut self) {
        self.finished = Some(Utc::now());
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started
    }

    /// Time between start and stop of the last execution
    pub fn elapsed(&self) -> Duration {
        match (self.started, self.finished) {
            (Some(start), Some(end)) => (end - start).to_std().unwrap_or_default(),
            _ => Duration::ZERO,
        }
    }

    pub fn result(&self) -> Option<&ExecResult> {
        self.result.as_ref()
    }

    pub(crate) fn set_result(&mut self, result: ExecResult) {
        self.result = Some(result);
    }
}

/// Fully interpolated form for logs; never executed
impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args = self.fragment.args();
        let text = self
            .fragment
            .render(|i| args.get(i - 1).map(|v| self.dialect.literal(v)).unwrap_or_default());
        f.write_str(&text)
    }
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statement")
            .field("sql", &self.sql())
            .field("args", &self.args())
            .field("dialect", &self.dialect.name())
            .field("elapsed", &self.elapsed())
            .finish()
    }
}
