//! Assertion outcomes

use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Outcome of one rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionResult {
    pub passed: bool,

    /// Why the rule failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AssertionResult {
    pub fn pass() -> Self {
        Self {
            passed: true,
            reason: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: Some(reason.into()),
        }
    }
}

/// One result per rule kind; `None` means the rule was not configured
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeAssertionResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools_used: Option<AssertionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_any: Option<AssertionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools_not_used: Option<AssertionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_tool_calls: Option<AssertionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tool_calls: Option<AssertionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources_read: Option<AssertionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources_not_read: Option<AssertionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts_used: Option<AssertionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts_not_used: Option<AssertionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_order: Option<AssertionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_duplicate_calls: Option<AssertionResult>,
}

impl CompositeAssertionResult {
    /// Configured rules in a fixed order, keyed by their document name
    pub fn results(&self) -> Vec<(&'static str, &AssertionResult)> {
        [
            ("toolsUsed", &self.tools_used),
            ("requireAny", &self.require_any),
            ("toolsNotUsed", &self.tools_not_used),
            ("minToolCalls", &self.min_tool_calls),
            ("maxToolCalls", &self.max_tool_calls),
            ("resourcesRead", &self.resources_read),
            ("resourcesNotRead", &self.resources_not_read),
            ("promptsUsed", &self.prompts_used),
            ("promptsNotUsed", &self.prompts_not_used),
            ("callOrder", &self.call_order),
            ("noDuplicateCalls", &self.no_duplicate_calls),
        ]
        .into_iter()
        .filter_map(|(rule, result)| result.as_ref().map(|r| (rule, r)))
        .collect()
    }

    /// True when every configured rule passed
    pub fn all_passed(&self) -> bool {
        self.results().iter().all(|(_, r)| r.passed)
    }

    /// `(rule, reason)` for each failed rule
    pub fn failures(&self) -> Vec<(&'static str, &str)> {
        self.results()
            .into_iter()
            .filter(|(_, r)| !r.passed)
            .map(|(rule, r)| (rule, r.reason.as_deref().unwrap_or("failed")))
            .collect()
    }

    /// Whether no rule was configured at all
    pub fn is_empty(&self) -> bool {
        self.results().is_empty()
    }
}

/// Final verdict for one task run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    pub assertions: CompositeAssertionResult,
}

impl From<CompositeAssertionResult> for Verdict {
    fn from(assertions: CompositeAssertionResult) -> Self {
        Self {
            passed: assertions.all_passed(),
            assertions,
        }
    }
}

impl Verdict {
    /// Multi-line report, one line per configured rule
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let results = self.assertions.results();
        let failed = results.iter().filter(|(_, r)| !r.passed).count();

        let _ = writeln!(
            out,
            "{}: {} of {} rules passed",
            if self.passed { "PASS" } else { "FAIL" },
            results.len() - failed,
            results.len()
        );
        for (rule, result) in results {
            match (&result.reason, result.passed) {
                (_, true) => {
                    let _ = writeln!(out, "  ok   {}", rule);
                }
                (Some(reason), false) => {
                    let _ = writeln!(out, "  FAIL {}: {}", rule, reason);
                }
                (None, false) => {
                    let _ = writeln!(out, "  FAIL {}", rule);
                }
            }
        }
        out
    }
}
