// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The artifact context threaded between stages.

use indexmap::IndexMap;

/// Artifacts produced by one stage: name to value (usually a path), in
/// production order.
pub type ArtifactSet = IndexMap<String, String>;

/// An immutable snapshot of everything produced so far for one group.
///
/// Stages receive a `&StageContext` and return an [ArtifactSet]; the
/// orchestrator merges the two into a fresh snapshot for downstream stages.
/// No stage ever holds a mutable handle on a context another stage can see.
#[derive(Debug, Clone, Default)]
pub struct StageContext {
    artifacts: ArtifactSet,
}

impl StageContext {
    pub fn new(initial: ArtifactSet) -> StageContext {
        StageContext { artifacts: initial }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.artifacts.get(name).map(|s| s.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.artifacts.contains_key(name)
    }

    /// A new snapshot with `additions` merged in. Later values win on a name
    /// collision, which lets a stage refine an upstream artifact (e.g. the
    /// calibrated visibility set replacing the raw one).
    #[must_use]
    pub fn with(&self, additions: ArtifactSet) -> StageContext {
        let mut artifacts = self.artifacts.clone();
        artifacts.extend(additions);
        StageContext { artifacts }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.artifacts.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use indexmap::indexmap;

    use super::*;

    #[test]
    fn with_produces_a_new_snapshot() {
        let base = StageContext::new(indexmap! {
            "group_key".to_string() => "2025-10-02T00:10:00".to_string(),
        });
        let derived = base.with(indexmap! {
            "vis_set".to_string() => "/out/a.ms".to_string(),
        });
        // The original snapshot is untouched.
        assert_eq!(base.len(), 1);
        assert!(!base.contains("vis_set"));
        assert_eq!(derived.get("vis_set"), Some("/out/a.ms"));
        assert_eq!(derived.get("group_key"), Some("2025-10-02T00:10:00"));
    }

    #[test]
    fn later_values_win_collisions() {
        let base = StageContext::new(indexmap! {
            "vis_set".to_string() => "/out/raw.ms".to_string(),
        });
        let derived = base.with(indexmap! {
            "vis_set".to_string() => "/out/calibrated.ms".to_string(),
        });
        assert_eq!(derived.get("vis_set"), Some("/out/calibrated.ms"));
        assert_eq!(base.get("vis_set"), Some("/out/raw.ms"));
    }
}
