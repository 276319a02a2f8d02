//! Minimal element model and selector matching for click classification.
//!
//! The recorder hands us a flattened view of the clicked element
//! ([`ClickTarget`]); ignore-selectors are matched against it with a small
//! compound-selector matcher supporting `tag`, `#id`, `.class`, `[attr]`
//! and `[attr="value"]`, combined and comma-separated. Selectors using
//! combinators (descendant, child, sibling) never match.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Snapshot of a clicked DOM element, keyed by the recorder's node id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickTarget {
    pub node_id: u64,
    pub tag_name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl ClickTarget {
    pub fn new(node_id: u64, tag_name: impl Into<String>) -> Self {
        Self {
            node_id,
            tag_name: tag_name.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn tag(&self) -> String {
        self.tag_name.to_ascii_uppercase()
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.contains_key(&name.to_ascii_lowercase())
    }

    fn has_class(&self, class: &str) -> bool {
        self.attribute("class")
            .map(|classes| classes.split_whitespace().any(|c| c == class))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    Id(String),
    Class(String),
    HasAttribute(String),
    AttributeEquals(String, String),
}

#[derive(Debug, Clone, PartialEq)]
struct CompoundSelector {
    tag: Option<String>,
    conditions: Vec<Condition>,
}

impl CompoundSelector {
    fn matches(&self, target: &ClickTarget) -> bool {
        if let Some(ref tag) = self.tag {
            if !tag.eq_ignore_ascii_case(&target.tag_name) {
                return false;
            }
        }
        self.conditions.iter().all(|condition| match condition {
            Condition::Id(id) => target.attribute("id") == Some(id.as_str()),
            Condition::Class(class) => target.has_class(class),
            Condition::HasAttribute(name) => target.has_attribute(name),
            Condition::AttributeEquals(name, value) => {
                target.attribute(name) == Some(value.as_str())
            }
        })
    }
}

fn compound_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^([A-Za-z][A-Za-z0-9-]*|\*)?((?:#[\w-]+|\.[\w-]+|\[[^\]]+\])*)$"#)
            .expect("static selector regex")
    })
}

fn condition_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"#([\w-]+)|\.([\w-]+)|\[\s*([\w-]+)\s*(?:=\s*["']?([^"'\]]*)["']?\s*)?\]"#)
            .expect("static selector regex")
    })
}

/// A comma-separated list of compound selectors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectorList {
    selectors: Vec<CompoundSelector>,
}

impl SelectorList {
    /// Parses `selector`, silently skipping parts this matcher cannot express.
    pub fn parse(selector: &str) -> Self {
        let selectors = selector
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .filter_map(Self::parse_compound)
            .collect();
        Self { selectors }
    }

    fn parse_compound(part: &str) -> Option<CompoundSelector> {
        let caps = compound_regex().captures(part)?;
        let tag = caps
            .get(1)
            .map(|m| m.as_str())
            .filter(|t| *t != "*")
            .map(str::to_string);
        let conditions = caps
            .get(2)
            .map(|rest| {
                condition_regex()
                    .captures_iter(rest.as_str())
                    .filter_map(|c| {
                        if let Some(id) = c.get(1) {
                            Some(Condition::Id(id.as_str().to_string()))
                        } else if let Some(class) = c.get(2) {
                            Some(Condition::Class(class.as_str().to_string()))
                        } else {
                            let name = c.get(3)?.as_str().to_ascii_lowercase();
                            Some(match c.get(4) {
                                Some(value) => {
                                    Condition::AttributeEquals(name, value.as_str().to_string())
                                }
                                None => Condition::HasAttribute(name),
                            })
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        Some(CompoundSelector { tag, conditions })
    }

    pub fn is_empty(&self) -> bool {
        self.selectors.is_empty()
    }

    pub fn matches(&self, target: &ClickTarget) -> bool {
        self.selectors.iter().any(|s| s.matches(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn button() -> ClickTarget {
        ClickTarget::new(1, "button")
            .with_attribute("class", "btn primary")
            .with_attribute("id", "save")
            .with_attribute("data-track", "yes")
    }

    #[test]
    fn matches_tag_id_class_and_attributes() {
        assert!(SelectorList::parse("button").matches(&button()));
        assert!(SelectorList::parse("#save").matches(&button()));
        assert!(SelectorList::parse(".primary").matches(&button()));
        assert!(SelectorList::parse("button.btn[data-track]").matches(&button()));
        assert!(SelectorList::parse("[data-track=\"yes\"]").matches(&button()));
        assert!(!SelectorList::parse("[data-track=\"no\"]").matches(&button()));
        assert!(!SelectorList::parse("a.btn").matches(&button()));
    }

    #[test]
    fn comma_lists_match_any_member() {
        let list = SelectorList::parse(".nope, #save");
        assert!(list.matches(&button()));
    }

    #[test]
    fn combinators_are_skipped() {
        let list = SelectorList::parse("form button");
        assert!(list.is_empty());
        assert!(!list.matches(&button()));
    }
}
