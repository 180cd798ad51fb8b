//! Exclusion rules for the source tree walk.

use {
    heddle_protocol::Index,
    regex::Regex,
    serde::{Deserialize, Serialize},
};

/// One exclusion rule. Path rules see the slash-separated path relative to the backup
/// root; name rules see the last component only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    NameEquals(String),
    NameMatches(#[serde(with = "serde_regex")] Regex),
    PathEquals(String),
    PathMatches(#[serde(with = "serde_regex")] Regex),
}

impl Rule {
    #[must_use]
    #[inline]
    pub fn matches(&self, index: &Index) -> bool {
        let name = index.last_name().unwrap_or_default();
        match self {
            Self::NameEquals(needle) => name == needle,
            Self::NameMatches(regex) => regex.is_match(name),
            Self::PathEquals(needle) => index.to_relative_string() == *needle,
            Self::PathMatches(regex) => regex.is_match(&index.to_relative_string()),
        }
    }
}

/// An entry is excluded, together with everything below it, if any rule matches it.
/// The root is never excluded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rules(pub Vec<Rule>);

impl Rules {
    #[must_use]
    #[inline]
    pub fn excludes(&self, index: &Index) -> bool {
        !index.is_root() && self.0.iter().any(|rule| rule.matches(index))
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "test")]
mod tests {
    use super::*;

    #[test]
    fn rules_from_config() {
        let rules: Rules = serde_json::from_str(
            r#"[{"name_equals": ".git"}, {"path_matches": "^cache/.*\\.tmp$"}]"#,
        )
        .unwrap();
        assert!(rules.excludes(&"a/.git".parse().unwrap()));
        assert!(rules.excludes(&"cache/x.tmp".parse().unwrap()));
        assert!(!rules.excludes(&"cache/x.txt".parse().unwrap()));
        assert!(!rules.excludes(&"other/cache/x.tmp".parse().unwrap()));
        assert!(!rules.excludes(&Index::root()));
    }
}
