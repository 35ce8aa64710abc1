//! Declarative assertion documents

use crate::config::document_figment;
use crate::error::Result;
use crate::history::CallKind;
use figment::Figment;
use figment::providers::{Format, Yaml};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How a matcher selects the called name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameMatcher {
    /// Name must equal this string
    Exact(String),
    /// Name must contain a match of this regular expression
    Pattern(String),
    /// Any name
    Any,
}

impl NameMatcher {
    /// Exact wins when both are set; empty strings count as unset
    pub fn from_parts(exact: Option<String>, pattern: Option<String>) -> Self {
        match (exact.filter(|s| !s.is_empty()), pattern.filter(|s| !s.is_empty())) {
            (Some(exact), _) => NameMatcher::Exact(exact),
            (None, Some(pattern)) => NameMatcher::Pattern(pattern),
            (None, None) => NameMatcher::Any,
        }
    }

    fn to_parts(&self) -> (Option<String>, Option<String>) {
        match self {
            NameMatcher::Exact(name) => (Some(name.clone()), None),
            NameMatcher::Pattern(pattern) => (None, Some(pattern.clone())),
            NameMatcher::Any => (None, None),
        }
    }
}

/// Selects records of one server by name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matcher {
    pub server: String,
    pub name: NameMatcher,
}

impl Matcher {
    pub fn exact(server: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            name: NameMatcher::Exact(name.into()),
        }
    }

    pub fn pattern(server: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            name: NameMatcher::Pattern(pattern.into()),
        }
    }

    /// Matches every record from `server`
    pub fn any(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            name: NameMatcher::Any,
        }
    }

    /// Human-readable form, e.g. `tool matching 'pods_.*' on server 'kubernetes'`
    pub fn describe(&self, kind: CallKind) -> String {
        match &self.name {
            NameMatcher::Exact(name) => format!("{} '{}' on server '{}'", kind, name, self.server),
            NameMatcher::Pattern(pattern) => {
                format!("{} matching '{}' on server '{}'", kind, pattern, self.server)
            }
            NameMatcher::Any => format!("any {} on server '{}'", kind, self.server),
        }
    }
}

// Each matcher list uses its own key names (`tool`/`toolPattern`, ...) on
// the wire; the in-memory form is shared.
macro_rules! matcher_keys {
    ($module:ident, $exact:tt, $pattern:tt) => {
        mod $module {
            use super::{Matcher, NameMatcher};
            use serde::{Deserialize, Deserializer, Serialize, Serializer};

            #[derive(Serialize, Deserialize)]
            struct Wire {
                server: String,
                #[serde(rename = $exact, default, skip_serializing_if = "Option::is_none")]
                exact: Option<String>,
                #[serde(rename = $pattern, default, skip_serializing_if = "Option::is_none")]
                pattern: Option<String>,
            }

            pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<Matcher>>, D::Error>
            where
                D: Deserializer<'de>,
            {
                let wire = Option::<Vec<Wire>>::deserialize(deserializer)?;
                Ok(wire.map(|list| {
                    list.into_iter()
                        .map(|w| Matcher {
                            server: w.server,
                            name: NameMatcher::from_parts(w.exact, w.pattern),
                        })
                        .collect()
                }))
            }

            pub fn serialize<S>(matchers: &Option<Vec<Matcher>>, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let wire: Option<Vec<Wire>> = matchers.as_ref().map(|list| {
                    list.iter()
                        .map(|m| {
                            let (exact, pattern) = m.name.to_parts();
                            Wire {
                                server: m.server.clone(),
                                exact,
                                pattern,
                            }
                        })
                        .collect()
                });
                wire.serialize(serializer)
            }
        }
    };
}

matcher_keys!(tool_keys, "tool", "toolPattern");
matcher_keys!(resource_keys, "uri", "uriPattern");
matcher_keys!(prompt_keys, "prompt", "promptPattern");

/// One required step of a call sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    #[serde(rename = "type")]
    pub kind: CallKind,
    pub server: String,
    pub name: String,
}

impl OrderItem {
    pub fn new(kind: CallKind, server: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            server: server.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for OrderItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} '{}' on server '{}'", self.kind, self.name, self.server)
    }
}

/// Rules to check against a call history; unset rules are not checked
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionSpec {
    /// Every matcher must be satisfied by some tool call
    #[serde(default, with = "tool_keys", skip_serializing_if = "Option::is_none")]
    pub tools_used: Option<Vec<Matcher>>,

    /// At least one matcher must be satisfied by some tool call
    #[serde(default, with = "tool_keys", skip_serializing_if = "Option::is_none")]
    pub require_any: Option<Vec<Matcher>>,

    /// No matcher may be satisfied by any tool call
    #[serde(default, with = "tool_keys", skip_serializing_if = "Option::is_none")]
    pub tools_not_used: Option<Vec<Matcher>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_tool_calls: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tool_calls: Option<usize>,

    #[serde(default, with = "resource_keys", skip_serializing_if = "Option::is_none")]
    pub resources_read: Option<Vec<Matcher>>,

    #[serde(default, with = "resource_keys", skip_serializing_if = "Option::is_none")]
    pub resources_not_read: Option<Vec<Matcher>>,

    #[serde(default, with = "prompt_keys", skip_serializing_if = "Option::is_none")]
    pub prompts_used: Option<Vec<Matcher>>,

    #[serde(default, with = "prompt_keys", skip_serializing_if = "Option::is_none")]
    pub prompts_not_used: Option<Vec<Matcher>>,

    /// Calls that must appear in this relative order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_order: Option<Vec<OrderItem>>,

    /// `true` forbids repeating a tool call with identical arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_duplicate_calls: Option<bool>,
}

impl AssertionSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load an assertion document (YAML, JSON or TOML by extension)
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(document_figment(path.as_ref())?.extract()?)
    }

    /// Parse an assertion document held in memory
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(Figment::new().merge(Yaml::string(text)).extract()?)
    }

    pub fn tool_used(mut self, matcher: Matcher) -> Self {
        self.tools_used.get_or_insert_with(Vec::new).push(matcher);
        self
    }

    pub fn any_tool(mut self, matcher: Matcher) -> Self {
        self.require_any.get_or_insert_with(Vec::new).push(matcher);
        self
    }

    pub fn tool_not_used(mut self, matcher: Matcher) -> Self {
        self.tools_not_used.get_or_insert_with(Vec::new).push(matcher);
        self
    }

    pub fn min_tool_calls(mut self, min: usize) -> Self {
        self.min_tool_calls = Some(min);
        self
    }

    pub fn max_tool_calls(mut self, max: usize) -> Self {
        self.max_tool_calls = Some(max);
        self
    }

    pub fn resource_read(mut self, matcher: Matcher) -> Self {
        self.resources_read.get_or_insert_with(Vec::new).push(matcher);
        self
    }

    pub fn resource_not_read(mut self, matcher: Matcher) -> Self {
        self.resources_not_read.get_or_insert_with(Vec::new).push(matcher);
        self
    }

    pub fn prompt_used(mut self, matcher: Matcher) -> Self {
        self.prompts_used.get_or_insert_with(Vec::new).push(matcher);
        self
    }

    pub fn prompt_not_used(mut self, matcher: Matcher) -> Self {
        self.prompts_not_used.get_or_insert_with(Vec::new).push(matcher);
        self
    }

    /// Append a step to the required call order
    pub fn then(mut self, kind: CallKind, server: impl Into<String>, name: impl Into<String>) -> Self {
        self.call_order
            .get_or_insert_with(Vec::new)
            .push(OrderItem::new(kind, server, name));
        self
    }

    pub fn no_duplicate_calls(mut self) -> Self {
        self.no_duplicate_calls = Some(true);
        self
    }
}
