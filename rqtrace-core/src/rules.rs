//! Global, reconfigurable rule set and the "master mask" derived from it
//! (spec.md §4.F).
//!
//! Every mutation happens under a single lock; the derived [`MasterMask`]
//! is read locklessly on the hot path, so a reader can observe a
//! momentarily stale snapshot — at worst one over- or under-captured
//! request, which spec.md explicitly accepts (§5).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::event_class;
use crate::sink::{Sink, SinkRegistry};

pub const MAX_LIST: usize = 32;
pub const MAX_STMTS: usize = 16;

/// Sentinel opcode the `sql` rule attribute adds to `opcode_list` — the
/// original's requests don't number a real opcode this way, so any value
/// outside the live opcode range works; negative keeps it unambiguous.
pub const OP_SQL: i64 = -1;

/// An inclusive `[from, to]` range; either bound `None` means unbounded
/// on that side (the original's `-1` sentinel).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Range<T> {
    pub from: Option<T>,
    pub to: Option<T>,
}

impl<T: PartialOrd + Copy> Range<T> {
    pub fn unbounded() -> Self {
        Range { from: None, to: None }
    }

    pub fn contains(&self, value: T) -> bool {
        if let Some(from) = self.from {
            if value < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if value > to {
                return false;
            }
        }
        true
    }
}

impl std::fmt::Display for Range<i64> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.from, self.to) {
            (None, None) => write!(f, "any"),
            (Some(a), None) => write!(f, "{a}+"),
            (None, Some(b)) => write!(f, "{b}-"),
            (Some(a), Some(b)) => write!(f, "{a}..{b}"),
        }
    }
}

impl std::fmt::Display for Range<f64> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.from, self.to) {
            (None, None) => write!(f, "any"),
            (Some(a), None) => write!(f, "{a}+"),
            (None, Some(b)) => write!(f, "{b}-"),
            (Some(a), Some(b)) => write!(f, "{a}..{b}"),
        }
    }
}

/// A bounded list of up to [`MAX_LIST`] integers plus a polarity flag.
/// An empty list matches every value, regardless of polarity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntList {
    values: Vec<i64>,
    /// `true` means "not in set".
    invert: bool,
}

impl IntList {
    /// Adds `value` with the given polarity. Changing polarity clears the
    /// list first (mirrors the original's `add_list`). Returns `false` if
    /// the list is already at [`MAX_LIST`] and `value` is new — callers
    /// should treat that as "criteria exceeded its bound" (spec.md's
    /// "list limits exceeded" master-mask trigger).
    pub fn add(&mut self, value: i64, invert: bool) -> bool {
        if invert != self.invert {
            self.values.clear();
            self.invert = invert;
        }
        if self.values.contains(&value) {
            return true;
        }
        if self.values.len() >= MAX_LIST {
            return false;
        }
        self.values.push(value);
        true
    }

    pub fn contains_match(&self, value: i64) -> bool {
        if self.values.is_empty() {
            return true;
        }
        let found = self.values.contains(&value);
        found != self.invert
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[i64] {
        &self.values
    }

    pub fn invert(&self) -> bool {
        self.invert
    }
}

impl std::fmt::Display for IntList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.values.is_empty() {
            return write!(f, "any");
        }
        write!(f, "{}", if self.invert { "not in " } else { "in " })?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        Ok(())
    }
}

/// One configured filtering/dispatch rule.
pub struct Rule {
    pub name: String,
    pub active: bool,
    /// Remaining matches before the rule self-deletes; `0` means
    /// unlimited.
    pub count_remaining: i64,
    pub duration_range: Range<i64>,
    pub retries_range: Range<i64>,
    pub vreplays_range: Range<i64>,
    pub sql_cost_range: Range<f64>,
    pub sql_rows_range: Range<i64>,
    pub rc_list: IntList,
    pub opcode_list: IntList,
    pub tablename: Option<String>,
    pub stmt_substr: Option<String>,
    pub event_mask: u32,
    pub sink: Arc<Sink>,
}

impl Rule {
    fn new(name: &str, sink: Arc<Sink>) -> Self {
        Rule {
            name: name.to_string(),
            active: false,
            count_remaining: 0,
            duration_range: Range::unbounded(),
            retries_range: Range::unbounded(),
            vreplays_range: Range::unbounded(),
            sql_cost_range: Range::unbounded(),
            sql_rows_range: Range::unbounded(),
            rc_list: IntList::default(),
            opcode_list: IntList::default(),
            tablename: None,
            stmt_substr: None,
            event_mask: 0,
            sink,
        }
    }

    pub fn format_stat(&self) -> String {
        format!(
            "rule '{}' {} cnt={} ms={} retries={} vreplays={} cost={} rows={} opcode={} rc={} table={} stmt={} events=0x{:x} sink={}",
            self.name,
            if self.active { "active" } else { "inactive" },
            self.count_remaining,
            self.duration_range,
            self.retries_range,
            self.vreplays_range,
            self.sql_cost_range,
            self.sql_rows_range,
            self.opcode_list,
            self.rc_list,
            self.tablename.as_deref().unwrap_or("any"),
            self.stmt_substr.as_deref().unwrap_or("any"),
            self.event_mask,
            self.sink.filename(),
        )
    }
}

/// Derived, lock-freely-read digest of what the active rule set cares
/// about (spec.md §3 "Master mask (derived)").
#[derive(Debug, Clone, Default)]
pub struct MasterMask {
    pub event_mask: u32,
    pub track_tables: bool,
    pub all_requests: bool,
    pub opcode_allow: IntList,
    pub opcode_block: IntList,
    pub stmt_substrs: Vec<String>,
}

impl MasterMask {
    /// Whether a request with this opcode and (optionally) this SQL text
    /// should have capture enabled by the master mask alone (spec.md
    /// §4.F "On request begin").
    pub fn admits(&self, opcode: i32, stmt: Option<&str>) -> bool {
        if self.all_requests {
            return true;
        }
        if !self.opcode_allow.is_empty() && self.opcode_allow.contains_match(opcode as i64) {
            return true;
        }
        if !self.opcode_block.is_empty() && self.opcode_block.contains_match(opcode as i64) {
            return true;
        }
        if let Some(stmt) = stmt {
            if self.stmt_substrs.iter().any(|s| stmt.contains(s.as_str())) {
                return true;
            }
        }
        false
    }
}

struct RuleSetInner {
    rules: Vec<Rule>,
}

/// Guards the rule list and owns the derived master mask. Mutations take
/// the lock; the master mask is published to an `RwLock` so hot-path
/// readers never contend with a mutation in flight for longer than a
/// pointer swap would — in practice a cloned-out `Arc` is cheapest, so
/// that's what's stored.
pub struct RuleSet {
    inner: Mutex<RuleSetInner>,
    master: RwLock<Arc<MasterMask>>,
    verbose: AtomicU32,
}

impl RuleSet {
    pub fn new() -> Self {
        RuleSet {
            inner: Mutex::new(RuleSetInner { rules: Vec::new() }),
            master: RwLock::new(Arc::new(MasterMask::default())),
            verbose: AtomicU32::new(0),
        }
    }

    pub fn set_verbose(&self, on: bool) {
        self.verbose.store(on as u32, Ordering::Relaxed);
    }

    pub fn verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed) != 0
    }

    /// Lock-freely reads the current master mask.
    pub fn master_mask(&self) -> Arc<MasterMask> {
        self.master.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Looks up a rule by name, creating it (inactive, pointed at the
    /// default sink) if it doesn't exist yet, runs `f` against it, then
    /// recomputes the master mask. Mirrors the original locking a single
    /// command line's worth of attribute mutations before rescanning.
    pub fn edit<R>(
        &self,
        name: &str,
        default_sink: &Arc<Sink>,
        sinks: &SinkRegistry,
        f: impl FnOnce(&mut Rule, &SinkRegistry) -> R,
    ) -> R {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let idx = match inner.rules.iter().position(|r| r.name == name) {
            Some(i) => i,
            None => {
                default_sink.incref();
                inner.rules.push(Rule::new(name, default_sink.clone()));
                inner.rules.len() - 1
            }
        };
        let result = f(&mut inner.rules[idx], sinks);
        self.scan_rules_locked(&inner.rules);
        result
    }

    pub fn delete(&self, name: &str, sinks: &SinkRegistry) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(idx) = inner.rules.iter().position(|r| r.name == name) {
            let rule = inner.rules.remove(idx);
            sinks.deref_output(&rule.sink);
            self.scan_rules_locked(&inner.rules);
            true
        } else {
            false
        }
    }

    /// For the dispatcher: run `f` against every active rule, under the
    /// rules lock, removing rules whose `count_remaining` reaches zero.
    /// `f` returns `true` if the rule matched.
    pub fn for_each_active_matching(
        &self,
        sinks: &SinkRegistry,
        mut f: impl FnMut(&Rule) -> bool,
    ) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut to_remove = Vec::new();
        let mut rescan = false;
        for (idx, rule) in inner.rules.iter_mut().enumerate() {
            if !rule.active {
                continue;
            }
            if f(rule) && rule.count_remaining > 0 {
                rule.count_remaining -= 1;
                if rule.count_remaining == 0 {
                    to_remove.push(idx);
                }
            }
        }
        for idx in to_remove.into_iter().rev() {
            let rule = inner.rules.remove(idx);
            tracing::info!(rule = %rule.name, "discarding logging rule (count exhausted)");
            sinks.deref_output(&rule.sink);
            rescan = true;
        }
        if rescan {
            self.scan_rules_locked(&inner.rules);
        }
    }

    pub fn format_stat(&self) -> String {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = String::new();
        for rule in inner.rules.iter() {
            out.push_str(&rule.format_stat());
            out.push('\n');
        }
        out
    }

    fn scan_rules_locked(&self, rules: &[Rule]) {
        let mut mask = MasterMask {
            all_requests: true,
            ..Default::default()
        };
        let mut log_all = false;
        let mut event_mask = 0u32;
        for rule in rules.iter().filter(|r| r.active) {
            if rule.opcode_list.is_empty() && rule.stmt_substr.is_none() {
                log_all = true;
            }
            for &v in rule.opcode_list.values() {
                let added = if rule.opcode_list.invert() {
                    mask.opcode_block.add(v, true)
                } else {
                    mask.opcode_allow.add(v, false)
                };
                if !added {
                    log_all = true;
                }
            }
            if rule.tablename.is_some() {
                mask.track_tables = true;
            }
            if let Some(stmt) = &rule.stmt_substr {
                if mask.stmt_substrs.len() >= MAX_STMTS {
                    log_all = true;
                } else if !mask.stmt_substrs.contains(stmt) {
                    mask.stmt_substrs.push(stmt.clone());
                }
            }
            event_mask |= rule.event_mask;
        }
        mask.event_mask = event_mask;
        mask.all_requests = log_all;

        if self.verbose() {
            tracing::info!(
                event_mask = mask.event_mask,
                track_tables = mask.track_tables,
                all_requests = mask.all_requests,
                "scanned rules"
            );
        } else {
            tracing::debug!(
                event_mask = mask.event_mask,
                all_requests = mask.all_requests,
                "scanned rules"
            );
        }

        *self.master.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(mask);
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses a range token of the form `N+`, `N-`, or `N..M` into an integer
/// [`Range`]. Returns `None` on a malformed token (§7: "Range parse
/// error" — logged by the caller, rule attribute left unchanged).
pub fn parse_int_range(tok: &str) -> Option<Range<i64>> {
    if let Some(stripped) = tok.strip_suffix('+') {
        let from = stripped.parse().ok()?;
        return Some(Range {
            from: Some(from),
            to: None,
        });
    }
    if let Some(stripped) = tok.strip_suffix('-') {
        let to = stripped.parse().ok()?;
        return Some(Range {
            from: None,
            to: Some(to),
        });
    }
    if let Some((a, b)) = tok.split_once("..") {
        let from = a.parse().ok()?;
        let to = b.parse().ok()?;
        return Some(Range {
            from: Some(from),
            to: Some(to),
        });
    }
    None
}

/// Same grammar as [`parse_int_range`] but for floating-point bounds
/// (`cost`/`sql_cost_range` uses this).
pub fn parse_f64_range(tok: &str) -> Option<Range<f64>> {
    if let Some(stripped) = tok.strip_suffix('+') {
        let from = stripped.parse().ok()?;
        return Some(Range {
            from: Some(from),
            to: None,
        });
    }
    if let Some(stripped) = tok.strip_suffix('-') {
        let to = stripped.parse().ok()?;
        return Some(Range {
            from: None,
            to: Some(to),
        });
    }
    if let Some((a, b)) = tok.split_once("..") {
        let from = a.parse().ok()?;
        let to = b.parse().ok()?;
        return Some(Range {
            from: Some(from),
            to: Some(to),
        });
    }
    None
}

pub fn event_mask_for_attr(attr: &str) -> Option<u32> {
    match attr {
        "trace" => Some(event_class::TRACE),
        "results" => Some(event_class::RESULTS),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::StderrLogger;

    fn registry() -> SinkRegistry {
        SinkRegistry::new(Arc::new(StderrLogger))
    }

    #[test]
    fn range_parsing() {
        assert_eq!(
            parse_int_range("100+"),
            Some(Range {
                from: Some(100),
                to: None
            })
        );
        assert_eq!(
            parse_int_range("100-"),
            Some(Range {
                from: None,
                to: Some(100)
            })
        );
        assert_eq!(
            parse_int_range("10..20"),
            Some(Range {
                from: Some(10),
                to: Some(20)
            })
        );
        assert_eq!(parse_int_range("garbage"), None);
    }

    #[test]
    fn admits_does_not_double_negate_opcode_block() {
        let mut mask = MasterMask::default();
        mask.opcode_block.add(5, true);
        assert!(!mask.admits(5, None));
        assert!(mask.admits(6, None));
    }

    #[test]
    fn empty_list_and_unbounded_range_accept_everything() {
        let list = IntList::default();
        assert!(list.contains_match(12345));
        let range: Range<i64> = Range::unbounded();
        assert!(range.contains(i64::MIN));
        assert!(range.contains(i64::MAX));
    }

    #[test]
    fn seventeen_distinct_stmt_substrings_force_all_requests() {
        let reg = registry();
        let rs = RuleSet::new();
        let default_sink = reg.default_sink();
        for i in 0..17 {
            rs.edit(&format!("r{i}"), &default_sink, &reg, |rule, _| {
                rule.active = true;
                rule.stmt_substr = Some(format!("needle-{i}"));
            });
        }
        assert!(rs.master_mask().all_requests);
    }

    #[test]
    fn inactive_rules_do_not_affect_master_mask() {
        let reg = registry();
        let rs = RuleSet::new();
        let default_sink = reg.default_sink();
        rs.edit("0", &default_sink, &reg, |rule, _| {
            rule.event_mask = event_class::TRACE;
            rule.active = false;
        });
        assert_eq!(rs.master_mask().event_mask, 0);
    }

    #[test]
    fn scan_rules_is_idempotent() {
        let reg = registry();
        let rs = RuleSet::new();
        let default_sink = reg.default_sink();
        rs.edit("0", &default_sink, &reg, |rule, _| {
            rule.active = true;
            rule.event_mask = event_class::TRACE;
        });
        let a = rs.master_mask();
        rs.edit("0", &default_sink, &reg, |_, _| {});
        let b = rs.master_mask();
        assert_eq!(a.event_mask, b.event_mask);
        assert_eq!(a.all_requests, b.all_requests);
    }

    #[test]
    fn count_remaining_removes_rule_after_matches() {
        let reg = registry();
        let rs = RuleSet::new();
        let default_sink = reg.default_sink();
        rs.edit("R3", &default_sink, &reg, |rule, _| {
            rule.active = true;
            rule.count_remaining = 2;
        });

        let mut matches = 0;
        for _ in 0..3 {
            rs.for_each_active_matching(&reg, |_rule| {
                matches += 1;
                true
            });
        }
        assert_eq!(matches, 2);
    }
}
