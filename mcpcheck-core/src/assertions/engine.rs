//! Rule evaluation
//!
//! [`evaluate`] is pure: it reads the history and the rules and produces a
//! [`CompositeAssertionResult`]. Problems with the rules themselves (a bad
//! regex, an empty `requireAny`) show up as failed rules, never as errors.

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

use super::model::{AssertionSpec, Matcher, NameMatcher, OrderItem};
use super::result::{AssertionResult, CompositeAssertionResult};
use crate::history::{CallHistory, CallKind, CallRecord};

/// Check every configured rule of `spec` against `history`
pub fn evaluate(history: &CallHistory, spec: &AssertionSpec) -> CompositeAssertionResult {
    let tool_calls = history.tool_calls().count();

    CompositeAssertionResult {
        tools_used: spec
            .tools_used
            .as_deref()
            .map(|matchers| presence(history, CallKind::Tool, matchers)),
        require_any: spec
            .require_any
            .as_deref()
            .map(|matchers| any_of(history, CallKind::Tool, matchers)),
        tools_not_used: spec
            .tools_not_used
            .as_deref()
            .map(|matchers| absence(history, CallKind::Tool, matchers)),
        min_tool_calls: spec.min_tool_calls.map(|min| {
            if tool_calls < min {
                AssertionResult::fail(format!("Expected at least {} tool calls, got {}", min, tool_calls))
            } else {
                AssertionResult::pass()
            }
        }),
        max_tool_calls: spec.max_tool_calls.map(|max| {
            if tool_calls > max {
                AssertionResult::fail(format!("Expected at most {} tool calls, got {}", max, tool_calls))
            } else {
                AssertionResult::pass()
            }
        }),
        resources_read: spec
            .resources_read
            .as_deref()
            .map(|matchers| presence(history, CallKind::Resource, matchers)),
        resources_not_read: spec
            .resources_not_read
            .as_deref()
            .map(|matchers| absence(history, CallKind::Resource, matchers)),
        prompts_used: spec
            .prompts_used
            .as_deref()
            .map(|matchers| presence(history, CallKind::Prompt, matchers)),
        prompts_not_used: spec
            .prompts_not_used
            .as_deref()
            .map(|matchers| absence(history, CallKind::Prompt, matchers)),
        call_order: spec.call_order.as_deref().map(|items| call_order(history, items)),
        no_duplicate_calls: match spec.no_duplicate_calls {
            Some(true) => Some(no_duplicates(history)),
            _ => None,
        },
    }
}

enum NameTest<'a> {
    Exact(&'a str),
    Pattern(Regex),
    Any,
}

impl NameTest<'_> {
    fn matches(&self, name: &str) -> bool {
        match self {
            NameTest::Exact(expected) => name == *expected,
            NameTest::Pattern(regex) => regex.is_match(name),
            NameTest::Any => true,
        }
    }
}

fn compile(matcher: &Matcher) -> Result<NameTest<'_>, String> {
    match &matcher.name {
        NameMatcher::Exact(name) => Ok(NameTest::Exact(name)),
        NameMatcher::Pattern(pattern) => Regex::new(pattern)
            .map(NameTest::Pattern)
            .map_err(|e| format!("Invalid pattern '{}' for server '{}': {}", pattern, matcher.server, e)),
        NameMatcher::Any => Ok(NameTest::Any),
    }
}

/// First record of `kind` the matcher selects
fn first_match<'h>(
    history: &'h CallHistory,
    kind: CallKind,
    matcher: &Matcher,
) -> Result<Option<&'h CallRecord>, String> {
    let test = compile(matcher)?;
    Ok(history
        .of_kind(kind)
        .find(|record| record.server_name == matcher.server && test.matches(&record.name)))
}

fn presence(history: &CallHistory, kind: CallKind, matchers: &[Matcher]) -> AssertionResult {
    for matcher in matchers {
        match first_match(history, kind, matcher) {
            Ok(Some(_)) => {}
            Ok(None) => {
                return AssertionResult::fail(format!("Expected a call to {}", matcher.describe(kind)));
            }
            Err(reason) => return AssertionResult::fail(reason),
        }
    }
    AssertionResult::pass()
}

fn any_of(history: &CallHistory, kind: CallKind, matchers: &[Matcher]) -> AssertionResult {
    if matchers.is_empty() {
        return AssertionResult::fail("requireAny lists no matchers and can never be satisfied");
    }

    let mut invalid = Vec::new();
    for matcher in matchers {
        match first_match(history, kind, matcher) {
            Ok(Some(_)) => return AssertionResult::pass(),
            Ok(None) => {}
            Err(reason) => invalid.push(reason),
        }
    }

    let mut reason = format!(
        "Expected a call to at least one of {} options, starting with {}",
        matchers.len(),
        matchers[0].describe(kind)
    );
    if !invalid.is_empty() {
        reason.push_str("; ");
        reason.push_str(&invalid.join("; "));
    }
    AssertionResult::fail(reason)
}

fn absence(history: &CallHistory, kind: CallKind, matchers: &[Matcher]) -> AssertionResult {
    for matcher in matchers {
        match first_match(history, kind, matcher) {
            Ok(None) => {}
            Ok(Some(record)) => {
                return AssertionResult::fail(format!(
                    "Unexpected call to {}: '{}' at sequence {}",
                    matcher.describe(kind),
                    record.name,
                    record.sequence
                ));
            }
            Err(reason) => return AssertionResult::fail(reason),
        }
    }
    AssertionResult::pass()
}

/// Greedy subsequence match; a record satisfies at most one item
fn call_order(history: &CallHistory, items: &[OrderItem]) -> AssertionResult {
    let records = history.records();
    let mut cursor = 0;

    for (satisfied, item) in items.iter().enumerate() {
        let found = records[cursor..].iter().position(|record| {
            record.kind == item.kind && record.server_name == item.server && record.name == item.name
        });

        match found {
            Some(offset) => cursor += offset + 1,
            None => {
                return AssertionResult::fail(format!(
                    "Call order broken: {} not found after {} of {} expected calls",
                    item,
                    satisfied,
                    items.len()
                ));
            }
        }
    }

    AssertionResult::pass()
}

/// Key-order independent form of a call's arguments; absent means `{}`
fn canonical_arguments(arguments: &Value) -> String {
    if arguments.is_null() {
        return "{}".to_string();
    }
    serde_jcs::to_string(arguments).unwrap_or_else(|_| arguments.to_string())
}

fn no_duplicates(history: &CallHistory) -> AssertionResult {
    let mut seen: HashMap<(&str, &str, String), u64> = HashMap::new();

    for record in history.tool_calls() {
        let key = (
            record.server_name.as_str(),
            record.name.as_str(),
            canonical_arguments(&record.arguments),
        );
        if let Some(first) = seen.get(&key) {
            return AssertionResult::fail(format!(
                "Duplicate call to tool '{}' on server '{}' with arguments {} (sequences {} and {})",
                record.name, record.server_name, key.2, first, record.sequence
            ));
        }
        seen.insert(key, record.sequence);
    }

    AssertionResult::pass()
}
