//! The consolidated `ignore`/`only`/`scope` predicate. Built once from
//! config and injected wherever packages are selected, so every component
//! agrees on what is in scope.

use globset::{Glob, GlobSet, GlobSetBuilder};

#[derive(Debug, Default)]
pub struct PackageFilter {
    only: Option<GlobSet>,
    ignore: Option<GlobSet>,
    scope: Option<GlobSet>,
}

fn name_glob_set(patterns: &[String]) -> Result<Option<GlobSet>, globset::Error> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(Some(builder.build()?))
}

impl PackageFilter {
    pub fn new(
        only: &[String],
        ignore: &[String],
        scope: Option<&str>,
    ) -> Result<Self, globset::Error> {
        Ok(Self {
            only: name_glob_set(only)?,
            ignore: name_glob_set(ignore)?,
            scope: match scope {
                Some(pattern) => name_glob_set(&[pattern.to_string()])?,
                None => None,
            },
        })
    }

    /// An empty filter; every package is in scope.
    pub fn accept_all() -> Self {
        Self::default()
    }

    /// Whether a package name is selected. `only` and `scope` narrow,
    /// `ignore` removes.
    pub fn matches(&self, name: &str) -> bool {
        if let Some(only) = &self.only {
            if !only.is_match(name) {
                return false;
            }
        }
        if let Some(scope) = &self.scope {
            if !scope.is_match(name) {
                return false;
            }
        }
        if let Some(ignore) = &self.ignore {
            if ignore.is_match(name) {
                return false;
            }
        }
        true
    }
}
