//! The persisted repo-level indirect-dependency record: relationships the
//! resolver inferred on a previous run, replayed into the graph before the
//! next one so they survive manifest churn.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use quarry_paths::{AbsoluteSystemPath, AnchoredSystemPathBuf};
use quarry_repository::package_graph::PackageGraph;

use crate::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndirectDepRecord(pub BTreeMap<AnchoredSystemPathBuf, Vec<AnchoredSystemPathBuf>>);

impl IndirectDepRecord {
    pub fn load(path: &AbsoluteSystemPath) -> Result<Option<Self>, Error> {
        match path.read_existing_to_string()? {
            Some(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            None => Ok(None),
        }
    }

    pub fn save(&self, path: &AbsoluteSystemPath) -> Result<(), Error> {
        path.create_with_contents(serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Captures every transitively-resolved edge in the graph.
    pub fn from_graph(graph: &PackageGraph) -> Self {
        let mut record = BTreeMap::new();
        for (path, dep_record) in graph.dep_map() {
            let indirect: Vec<AnchoredSystemPathBuf> = dep_record
                .local_deps
                .iter()
                .filter(|(_, edge)| !edge.is_direct())
                .map(|(dep_path, _)| dep_path.clone())
                .collect();
            if !indirect.is_empty() {
                record.insert(path.clone(), indirect);
            }
        }
        Self(record)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
