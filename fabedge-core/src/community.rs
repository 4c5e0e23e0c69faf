use std::collections::BTreeSet;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A named set of endpoint names that must be fully meshed.
///
/// Members may come from any federated cluster; names that don't resolve to
/// a stored endpoint are tolerated and skipped at materialization time.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Community {
    pub name: String,
    #[serde(default)]
    pub members: BTreeSet<String>,
}

impl Community {
    pub fn new(name: impl Into<String>, members: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            members: members.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, endpoint_name: &str) -> bool {
        self.members.contains(endpoint_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn members_are_deduplicated() {
        let community = Community::new("edges", ["bj.edge1", "bj.edge2", "bj.edge1"]);

        assert_eq!(community.members.len(), 2);
        assert!(community.contains("bj.edge2"));
        assert!(!community.contains("bj.connector"));
    }
}
