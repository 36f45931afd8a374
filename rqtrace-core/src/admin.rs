//! Operator command surface (spec.md §6 "Mutations arrive as
//! pre-tokenized commands").
//!
//! One line at a time, pre-split into tokens the way the original
//! receives its command buffer already split on whitespace (with quoted
//! segments kept intact by [`parse_stmt_token`]). Every line is handled
//! under a single [`crate::rules::RuleSet`] lock acquisition: lookup (or
//! create) the named rule, apply every attribute token in order, then
//! rescan once.

use std::sync::Arc;

use crate::event_class;
use crate::rules::{event_mask_for_attr, parse_f64_range, parse_int_range, RuleSet, OP_SQL};
use crate::sink::SinkRegistry;

pub const HELP_TEXT: &str = "\
longrequest ms #             set threshold for long request warning (ms)
longsqlrequest ms #           set threshold for long sql request warning (ms)
longreqfile file              set file to dump long request digests to
diffstat #                    set interval (seconds) for host diffstat dump
truncate #                     truncate captured statement text to # bytes
vbon                          enable verbose rule-scan logging
vbof                          disable verbose rule-scan logging
stat                          print current rule set and statistics
help                          print this text
<rule> go                     activate rule
<rule> stop                   deactivate rule
<rule> delete                 remove rule
<rule> cnt #                  match at most # times then auto-delete
<rule> file <name>            route matches to file <name>
<rule> stdout                 route matches to the default sink
<rule> ms <range>              match on request duration (N+, N-, N..M)
<rule> retries <range>        match on retry count
<rule> vreplays <range>       match on verify-replay count
<rule> cost <range>           match on sql cost
<rule> rows <range>           match on sql row count
<rule> sql                    match sql requests only
<rule> stmt <substr>          match requests whose statement text contains <substr>
<rule> opcode [!]<n>          match (or, with a leading !, exclude) an opcode
<rule> rc [!]<n>              match (or, with a leading !, exclude) a return code
<rule> table <name>           match requests touching table <name>
<rule> trace                  include trace-class events in the dump
<rule> results                include results-class events in the dump
";

/// Runtime-tunable knobs that live outside any single rule (original's
/// file-scope `long_request_ms` &c.).
pub struct AdminConfig {
    pub long_request_ms: std::sync::atomic::AtomicI64,
    pub long_sql_request_ms: std::sync::atomic::AtomicI64,
    pub diffstat_interval_s: std::sync::atomic::AtomicI64,
    pub truncate_stmt_bytes: std::sync::atomic::AtomicI64,
    pub long_request_file: std::sync::Mutex<Option<String>>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        AdminConfig {
            long_request_ms: std::sync::atomic::AtomicI64::new(0),
            long_sql_request_ms: std::sync::atomic::AtomicI64::new(0),
            diffstat_interval_s: std::sync::atomic::AtomicI64::new(0),
            truncate_stmt_bytes: std::sync::atomic::AtomicI64::new(1024),
            long_request_file: std::sync::Mutex::new(None),
        }
    }
}

/// Result of dispatching one command line.
#[derive(Debug, PartialEq)]
pub enum AdminOutcome {
    Ok,
    Help,
    Stat,
    UnknownVerb(String),
    UnknownAttribute { rule: String, attr: String },
    BadValue { rule: String, attr: String, value: String },
}

/// Dispatches one pre-tokenized command line.
pub fn process_line(
    tokens: &[&str],
    rules: &RuleSet,
    sinks: &SinkRegistry,
    config: &AdminConfig,
) -> AdminOutcome {
    use std::sync::atomic::Ordering;

    let Some(&first) = tokens.first() else {
        return AdminOutcome::Ok;
    };

    match first {
        "help" => return AdminOutcome::Help,
        "stat" => return AdminOutcome::Stat,
        "vbon" => {
            rules.set_verbose(true);
            return AdminOutcome::Ok;
        }
        "vbof" => {
            rules.set_verbose(false);
            return AdminOutcome::Ok;
        }
        "longrequest" => {
            if let Some(ms) = tokens.get(1).and_then(|t| t.parse::<i64>().ok()) {
                config.long_request_ms.store(ms, Ordering::Relaxed);
                return AdminOutcome::Ok;
            }
            return AdminOutcome::BadValue {
                rule: first.to_string(),
                attr: "ms".to_string(),
                value: tokens.get(1).unwrap_or(&"").to_string(),
            };
        }
        "longsqlrequest" => {
            if let Some(ms) = tokens.get(1).and_then(|t| t.parse::<i64>().ok()) {
                config.long_sql_request_ms.store(ms, Ordering::Relaxed);
                return AdminOutcome::Ok;
            }
            return AdminOutcome::BadValue {
                rule: first.to_string(),
                attr: "ms".to_string(),
                value: tokens.get(1).unwrap_or(&"").to_string(),
            };
        }
        "longreqfile" => {
            if let Some(&file) = tokens.get(1) {
                *config.long_request_file.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(file.to_string());
                return AdminOutcome::Ok;
            }
            return AdminOutcome::BadValue {
                rule: first.to_string(),
                attr: "file".to_string(),
                value: String::new(),
            };
        }
        "diffstat" => {
            if let Some(s) = tokens.get(1).and_then(|t| t.parse::<i64>().ok()) {
                config.diffstat_interval_s.store(s, Ordering::Relaxed);
                return AdminOutcome::Ok;
            }
            return AdminOutcome::BadValue {
                rule: first.to_string(),
                attr: "seconds".to_string(),
                value: tokens.get(1).unwrap_or(&"").to_string(),
            };
        }
        "truncate" => {
            if let Some(n) = tokens.get(1).and_then(|t| t.parse::<i64>().ok()) {
                config.truncate_stmt_bytes.store(n, Ordering::Relaxed);
                return AdminOutcome::Ok;
            }
            return AdminOutcome::BadValue {
                rule: first.to_string(),
                attr: "bytes".to_string(),
                value: tokens.get(1).unwrap_or(&"").to_string(),
            };
        }
        _ => {}
    }

    // Not a top-level verb: `first` is a rule name (digits/'.'  prefixed,
    // or anything at all — an implicit rule named "0" is used when the
    // line has no leading rulename token, which this function's callers
    // are expected to supply explicitly rather than infer).
    let rule_name = first;
    let rest = &tokens[1..];

    if rest.first() == Some(&"delete") {
        rules.delete(rule_name, sinks);
        return AdminOutcome::Ok;
    }

    let default_sink = sinks.default_sink();
    let mut outcome = AdminOutcome::Ok;
    rules.edit(rule_name, &default_sink, sinks, |rule, sinks| {
        let mut i = 0;
        while i < rest.len() {
            let attr = rest[i];
            match attr {
                "go" => rule.active = true,
                "stop" => rule.active = false,
                "stdout" => {
                    sinks.deref_output(&rule.sink);
                    rule.sink = sinks.default_sink();
                }
                "cnt" => {
                    i += 1;
                    match rest.get(i).and_then(|t| t.parse::<i64>().ok()) {
                        Some(n) => rule.count_remaining = n,
                        None => {
                            outcome = AdminOutcome::BadValue {
                                rule: rule_name.to_string(),
                                attr: attr.to_string(),
                                value: rest.get(i).unwrap_or(&"").to_string(),
                            };
                        }
                    }
                }
                "file" => {
                    i += 1;
                    if let Some(&filename) = rest.get(i) {
                        sinks.deref_output(&rule.sink);
                        rule.sink = sinks.get_output(filename);
                    } else {
                        outcome = AdminOutcome::BadValue {
                            rule: rule_name.to_string(),
                            attr: attr.to_string(),
                            value: String::new(),
                        };
                    }
                }
                "ms" => {
                    i += 1;
                    match rest.get(i).and_then(|t| parse_int_range(t)) {
                        Some(r) => rule.duration_range = r,
                        None => {
                            outcome = bad(rule_name, attr, rest.get(i));
                        }
                    }
                }
                "retries" => {
                    i += 1;
                    match rest.get(i).and_then(|t| parse_int_range(t)) {
                        Some(r) => rule.retries_range = r,
                        None => outcome = bad(rule_name, attr, rest.get(i)),
                    }
                }
                "vreplays" => {
                    i += 1;
                    match rest.get(i).and_then(|t| parse_int_range(t)) {
                        Some(r) => rule.vreplays_range = r,
                        None => outcome = bad(rule_name, attr, rest.get(i)),
                    }
                }
                "cost" => {
                    i += 1;
                    match rest.get(i).and_then(|t| parse_f64_range(t)) {
                        Some(r) => rule.sql_cost_range = r,
                        None => outcome = bad(rule_name, attr, rest.get(i)),
                    }
                }
                "rows" => {
                    i += 1;
                    match rest.get(i).and_then(|t| parse_int_range(t)) {
                        Some(r) => rule.sql_rows_range = r,
                        None => outcome = bad(rule_name, attr, rest.get(i)),
                    }
                }
                "sql" => {
                    if !rule.opcode_list.add(OP_SQL, false) {
                        outcome = AdminOutcome::BadValue {
                            rule: rule_name.to_string(),
                            attr: attr.to_string(),
                            value: "list limit exceeded".to_string(),
                        };
                    }
                }
                "stmt" => {
                    i += 1;
                    match rest.get(i) {
                        Some(&tok) => rule.stmt_substr = Some(parse_stmt_token(tok)),
                        None => outcome = bad(rule_name, attr, None),
                    }
                }
                "table" => {
                    i += 1;
                    match rest.get(i) {
                        Some(&tok) => rule.tablename = Some(tok.to_string()),
                        None => outcome = bad(rule_name, attr, None),
                    }
                }
                "opcode" => {
                    i += 1;
                    match rest.get(i).map(|t| parse_inverted_int(t)) {
                        Some(Some((v, invert))) => {
                            if !rule.opcode_list.add(v, invert) {
                                outcome = AdminOutcome::BadValue {
                                    rule: rule_name.to_string(),
                                    attr: attr.to_string(),
                                    value: "list limit exceeded".to_string(),
                                };
                            }
                        }
                        _ => outcome = bad(rule_name, attr, rest.get(i)),
                    }
                }
                "rc" => {
                    i += 1;
                    match rest.get(i).map(|t| parse_inverted_int(t)) {
                        Some(Some((v, invert))) => {
                            if !rule.rc_list.add(v, invert) {
                                outcome = AdminOutcome::BadValue {
                                    rule: rule_name.to_string(),
                                    attr: attr.to_string(),
                                    value: "list limit exceeded".to_string(),
                                };
                            }
                        }
                        _ => outcome = bad(rule_name, attr, rest.get(i)),
                    }
                }
                other => {
                    if event_mask_for_attr(other).is_some() {
                        rule.event_mask |= event_mask_for_attr(other).unwrap();
                    } else {
                        outcome = AdminOutcome::UnknownAttribute {
                            rule: rule_name.to_string(),
                            attr: other.to_string(),
                        };
                    }
                }
            }
            i += 1;
        }
    });

    outcome
}

/// Parses `[!]N`: a leading `!` inverts, the remainder must be a plain
/// integer. Mirrors the original's `tok[0] == '!'` prefix check ahead of
/// `toknum`/`a2req`.
fn parse_inverted_int(tok: &str) -> Option<(i64, bool)> {
    let (invert, digits) = match tok.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, tok),
    };
    digits.parse::<i64>().ok().map(|v| (v, invert))
}

fn bad(rule: &str, attr: &str, value: Option<&&str>) -> AdminOutcome {
    AdminOutcome::BadValue {
        rule: rule.to_string(),
        attr: attr.to_string(),
        value: value.map(|s| s.to_string()).unwrap_or_default(),
    }
}

/// Strips surrounding quotes (`"` or `'`) from a statement-substring
/// token, if present, unescaping a doubled quote character to a single
/// literal one along the way. Unquoted tokens pass through unchanged.
/// Mirrors the original's `tokquoted` helper: a doubled quote inside a
/// quoted string is a literal quote, not the terminator.
pub fn parse_stmt_token(tok: &str) -> String {
    let chars: Vec<char> = tok.chars().collect();
    if chars.len() < 2 {
        return tok.to_string();
    }
    let quote = chars[0];
    if quote != '"' && quote != '\'' {
        return tok.to_string();
    }
    let mut out = String::new();
    let mut i = 1;
    while i < chars.len() {
        let ch = chars[i];
        if ch == quote {
            if i + 1 < chars.len() && chars[i + 1] == quote {
                out.push(quote);
                i += 2;
                continue;
            }
            break;
        }
        out.push(ch);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::StderrLogger;

    fn setup() -> (RuleSet, SinkRegistry, AdminConfig) {
        (
            RuleSet::new(),
            SinkRegistry::new(Arc::new(StderrLogger)),
            AdminConfig::default(),
        )
    }

    #[test]
    fn help_and_stat_are_recognized() {
        let (rules, sinks, cfg) = setup();
        assert_eq!(
            process_line(&["help"], &rules, &sinks, &cfg),
            AdminOutcome::Help
        );
        assert_eq!(
            process_line(&["stat"], &rules, &sinks, &cfg),
            AdminOutcome::Stat
        );
    }

    #[test]
    fn activating_a_rule_via_go_updates_master_mask() {
        let (rules, sinks, cfg) = setup();
        process_line(&["0", "go", "trace"], &rules, &sinks, &cfg);
        assert_eq!(rules.master_mask().event_mask, event_class::TRACE);
        assert!(rules.master_mask().all_requests);
    }

    #[test]
    fn quoted_stmt_token_is_unwrapped() {
        assert_eq!(parse_stmt_token("\"select * from foo\""), "select * from foo");
        assert_eq!(parse_stmt_token("bareword"), "bareword");
    }

    #[test]
    fn doubled_quote_unescapes_to_a_literal_quote() {
        assert_eq!(parse_stmt_token("'it''s broken'"), "it's broken");
        assert_eq!(parse_stmt_token("\"say \"\"hi\"\"\""), "say \"hi\"");
    }

    #[test]
    fn opcode_bang_prefix_inverts_match() {
        let (rules, sinks, cfg) = setup();
        process_line(&["0", "go", "opcode", "!5"], &rules, &sinks, &cfg);
        let mask = rules.master_mask();
        assert!(mask.opcode_block.contains_match(6));
        assert!(!mask.opcode_block.contains_match(5));
    }

    #[test]
    fn sql_attr_adds_sentinel_opcode_without_consuming_a_token() {
        let (rules, sinks, cfg) = setup();
        let outcome = process_line(&["0", "go", "sql", "trace"], &rules, &sinks, &cfg);
        assert_eq!(outcome, AdminOutcome::Ok);
        let mask = rules.master_mask();
        assert!(mask.opcode_allow.contains_match(crate::rules::OP_SQL));
        assert_eq!(mask.event_mask, event_class::TRACE);
    }

    #[test]
    fn stmt_attr_sets_statement_substring() {
        let (rules, sinks, cfg) = setup();
        process_line(&["0", "go", "stmt", "'select 1'"], &rules, &sinks, &cfg);
        assert!(rules.master_mask().stmt_substrs.iter().any(|s| s == "select 1"));
    }

    #[test]
    fn bad_range_token_is_reported() {
        let (rules, sinks, cfg) = setup();
        let outcome = process_line(&["0", "go", "ms", "garbage"], &rules, &sinks, &cfg);
        assert!(matches!(outcome, AdminOutcome::BadValue { .. }));
    }

    #[test]
    fn unknown_attribute_is_reported() {
        let (rules, sinks, cfg) = setup();
        let outcome = process_line(&["0", "go", "bogus"], &rules, &sinks, &cfg);
        assert_eq!(
            outcome,
            AdminOutcome::UnknownAttribute {
                rule: "0".to_string(),
                attr: "bogus".to_string()
            }
        );
    }

    #[test]
    fn delete_removes_rule() {
        let (rules, sinks, cfg) = setup();
        process_line(&["R", "go"], &rules, &sinks, &cfg);
        assert!(process_line(&["R", "delete"], &rules, &sinks, &cfg) == AdminOutcome::Ok);
        assert!(!rules.format_stat().contains("'R'"));
    }
}
