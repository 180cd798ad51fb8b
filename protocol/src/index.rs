use {
    anyhow::{Result, bail},
    serde::{Deserialize, Deserializer, Serialize, de::Error},
    std::{
        fmt,
        path::{Path, PathBuf},
        str::FromStr,
    },
};

/// Position of an entry inside a backed up tree.
///
/// An index is a list of path components relative to the backup root. The root itself
/// has an empty index. Indexes are ordered lexicographically by component, which is
/// the order of every tree walk, volume and signature stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Index(Vec<String>);

impl Index {
    #[must_use]
    #[inline]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    #[inline]
    pub fn from_components(components: Vec<String>) -> Result<Self> {
        for component in &components {
            check_component(component)?;
        }
        Ok(Self(components))
    }

    /// Parses a relative slash-separated path. `""` and `"."` denote the root.
    #[inline]
    pub fn from_relative_str(path: &str) -> Result<Self> {
        let path = path.trim_end_matches('/');
        if path.is_empty() || path == "." {
            return Ok(Self::root());
        }
        if path.starts_with('/') {
            bail!("index path must be relative: {path:?}");
        }
        Self::from_components(path.split('/').map(ToOwned::to_owned).collect())
    }

    #[must_use]
    #[inline]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    #[inline]
    pub fn components(&self) -> &[String] {
        &self.0
    }

    #[inline]
    pub fn join_one(&self, file_name: &str) -> Result<Index> {
        check_component(file_name)?;
        let mut components = self.0.clone();
        components.push(file_name.to_owned());
        Ok(Self(components))
    }

    #[must_use]
    #[inline]
    pub fn parent(&self) -> Option<Index> {
        let (_, parent) = self.0.split_last()?;
        Some(Self(parent.to_vec()))
    }

    #[must_use]
    #[inline]
    pub fn last_name(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    #[must_use]
    #[inline]
    pub fn starts_with(&self, prefix: &Index) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Re-roots `self` at `prefix`. Returns `None` if `self` is outside of `prefix`.
    #[must_use]
    #[inline]
    pub fn strip_prefix(&self, prefix: &Index) -> Option<Index> {
        self.0
            .strip_prefix(prefix.0.as_slice())
            .map(|rest| Self(rest.to_vec()))
    }

    /// Keeps at most `len` leading components.
    #[must_use]
    #[inline]
    pub fn truncated(&self, len: usize) -> Index {
        Self(self.0.iter().take(len).cloned().collect())
    }

    #[must_use]
    #[inline]
    pub fn to_path(&self, base: &Path) -> PathBuf {
        let mut path = base.to_path_buf();
        path.extend(&self.0);
        path
    }

    /// Slash-separated path without the root marker. The root is an empty string.
    #[must_use]
    #[inline]
    pub fn to_relative_string(&self) -> String {
        self.0.join("/")
    }
}

fn check_component(component: &str) -> Result<()> {
    if component.is_empty() {
        bail!("index component cannot be empty");
    }
    if component == "." || component == ".." {
        bail!("invalid index component: {component:?}");
    }
    if component.contains('/') || component.contains('\0') {
        bail!("index component cannot contain '/' or NUL: {component:?}");
    }
    Ok(())
}

impl FromStr for Index {
    type Err = anyhow::Error;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_relative_str(s)
    }
}

impl fmt::Display for Index {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, ".")
        } else {
            write!(f, "{}", self.0.join("/"))
        }
    }
}

impl<'de> Deserialize<'de> for Index {
    #[inline]
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let components = Vec::<String>::deserialize(deserializer)?;
        Self::from_components(components).map_err(D::Error::custom)
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "test")]
mod tests {
    use super::*;

    fn i(s: &str) -> Index {
        s.parse().unwrap()
    }

    #[test]
    fn parse_and_display() {
        assert!(i("").is_root());
        assert!(i(".").is_root());
        assert_eq!(i("a/b/c").components(), ["a", "b", "c"]);
        assert_eq!(i("a/b/").to_string(), "a/b");
        assert_eq!(Index::root().to_string(), ".");
        "/a".parse::<Index>().unwrap_err();
        "a//b".parse::<Index>().unwrap_err();
        "a/../b".parse::<Index>().unwrap_err();
    }

    #[test]
    fn ordering_is_by_component() {
        // "a/b" sorts before "a.b" because the first components differ as "a" < "a.b".
        let mut items = vec![i("a.b"), i("a/b"), i(""), i("a"), i("b")];
        items.sort();
        assert_eq!(items, vec![i(""), i("a"), i("a/b"), i("a.b"), i("b")]);
    }

    #[test]
    fn prefixes() {
        assert!(i("a/b/c").starts_with(&i("a/b")));
        assert!(!i("a/bc").starts_with(&i("a/b")));
        assert!(i("a").starts_with(&Index::root()));
        assert_eq!(i("a/b/c").strip_prefix(&i("a")), Some(i("b/c")));
        assert_eq!(i("a/b").strip_prefix(&i("a/b")), Some(Index::root()));
        assert_eq!(i("x/b").strip_prefix(&i("a")), None);
        assert_eq!(i("a/b/c").truncated(2), i("a/b"));
        assert_eq!(i("a/b").parent(), Some(i("a")));
        assert_eq!(Index::root().parent(), None);
    }
}
