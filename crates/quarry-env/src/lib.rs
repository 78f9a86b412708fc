#![deny(clippy::all)]

//! Environment variable capture for fingerprinting. Only allow-listed
//! variables ever become cache-key material; the allow list supports `*`
//! wildcards and `!` exclusions.

use std::{
    collections::BTreeMap,
    env,
    ops::{Deref, DerefMut},
};

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("Failed to parse wildcard pattern: {0}")]
    Regex(#[from] regex::Error),
}

// BTreeMap so that hashable output is deterministic without a sort pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct EnvironmentVariableMap(BTreeMap<String, String>);

impl EnvironmentVariableMap {
    /// Snapshot of the process environment.
    pub fn infer() -> Self {
        EnvironmentVariableMap(env::vars().collect())
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }

    /// A list of "k=v" strings for env variables and their values.
    pub fn to_hashable(&self) -> Vec<String> {
        self.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.keys().cloned().collect()
    }

    // Takes another EnvironmentVariableMap and adds it into `self`.
    // Overwrites values if they already exist.
    pub fn union(&mut self, another: &EnvironmentVariableMap) {
        for (key, value) in &another.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    // Takes another EnvironmentVariableMap and removes matching keys
    // from `self`.
    pub fn difference(&mut self, another: &EnvironmentVariableMap) {
        for key in another.0.keys() {
            self.0.remove(key);
        }
    }

    /// Returns the variables whose names match an array of wildcard
    /// patterns. A leading `!` turns a pattern into an exclusion, and
    /// exclusions have primacy over inclusions.
    pub fn from_wildcards(
        &self,
        wildcard_patterns: &[impl AsRef<str>],
    ) -> Result<EnvironmentVariableMap, Error> {
        if wildcard_patterns.is_empty() {
            return Ok(EnvironmentVariableMap::default());
        }

        let mut include_patterns = Vec::new();
        let mut exclude_patterns = Vec::new();
        for wildcard_pattern in wildcard_patterns {
            let wildcard_pattern = wildcard_pattern.as_ref();
            if let Some(rest) = wildcard_pattern.strip_prefix('!') {
                exclude_patterns.push(wildcard_to_regex_pattern(rest));
            } else if wildcard_pattern.starts_with("\\!") {
                include_patterns.push(wildcard_to_regex_pattern(&wildcard_pattern[1..]));
            } else {
                include_patterns.push(wildcard_to_regex_pattern(wildcard_pattern));
            }
        }

        let include_regex = Regex::new(&format!("^({})$", include_patterns.join("|")))?;
        let exclude_regex = Regex::new(&format!("^({})$", exclude_patterns.join("|")))?;

        let mut output = EnvironmentVariableMap::default();
        for (env_var, env_value) in &self.0 {
            if !include_patterns.is_empty() && include_regex.is_match(env_var) {
                output.insert(env_var.clone(), env_value.clone());
            }
        }
        for env_var in self.0.keys() {
            if !exclude_patterns.is_empty() && exclude_regex.is_match(env_var) {
                output.remove(env_var);
            }
        }

        Ok(output)
    }
}

impl From<BTreeMap<String, String>> for EnvironmentVariableMap {
    fn from(map: BTreeMap<String, String>) -> Self {
        EnvironmentVariableMap(map)
    }
}

impl FromIterator<(String, String)> for EnvironmentVariableMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        EnvironmentVariableMap(iter.into_iter().collect())
    }
}

impl Deref for EnvironmentVariableMap {
    type Target = BTreeMap<String, String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for EnvironmentVariableMap {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

const WILDCARD: char = '*';
const WILDCARD_ESCAPE: char = '\\';
const REGEX_WILDCARD_SEGMENT: &str = ".*";

fn wildcard_to_regex_pattern(pattern: &str) -> String {
    let mut regex_string = Vec::new();
    let mut previous_index = 0;
    let mut previous_char: Option<char> = None;

    for (i, char) in pattern.chars().enumerate() {
        if char == WILDCARD {
            if previous_char == Some(WILDCARD_ESCAPE) {
                // Found a literal *
                // Replace the trailing "\*" with just "*" before adding the segment.
                regex_string.push(regex::escape(&format!(
                    "{}*",
                    &pattern[previous_index..(i - 1)]
                )));
            } else {
                // Found a wildcard
                // Add in the static segment since the last wildcard. Can be zero length.
                regex_string.push(regex::escape(&pattern[previous_index..i]));

                // Add a dynamic segment if it isn't adjacent to another dynamic segment.
                if let Some(last_segment) = regex_string.last() {
                    if last_segment != REGEX_WILDCARD_SEGMENT {
                        regex_string.push(REGEX_WILDCARD_SEGMENT.to_string());
                    }
                }
            }

            // Advance the pointer.
            previous_index = i + 1;
        }
        previous_char = Some(char);
    }

    // Add the last static segment. Can be zero length.
    regex_string.push(regex::escape(&pattern[previous_index..]));

    regex_string.join("")
}
