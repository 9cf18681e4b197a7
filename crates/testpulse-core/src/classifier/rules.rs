//! Rule-based impact tiers.
//!
//! The rules are evaluated over pre-fetched [`ImpactInputs`] so that this
//! module stays synchronous and free of store access.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use testpulse_state::{Area, AreaId, FileId, Test, TestId};

/// The four mutually exclusive impact tiers, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactTier {
    High,
    Medium,
    Low,
    Unassigned,
}

/// Test ids per tier, before name deduplication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TierSets {
    pub high: BTreeSet<TestId>,
    pub medium: BTreeSet<TestId>,
    pub low: BTreeSet<TestId>,
    pub unassigned: BTreeSet<TestId>,
}

impl TierSets {
    pub fn insert(&mut self, tier: ImpactTier, id: TestId) {
        self.set_mut(tier).insert(id);
    }

    pub fn get(&self, tier: ImpactTier) -> &BTreeSet<TestId> {
        match tier {
            ImpactTier::High => &self.high,
            ImpactTier::Medium => &self.medium,
            ImpactTier::Low => &self.low,
            ImpactTier::Unassigned => &self.unassigned,
        }
    }

    fn set_mut(&mut self, tier: ImpactTier) -> &mut BTreeSet<TestId> {
        match tier {
            ImpactTier::High => &mut self.high,
            ImpactTier::Medium => &mut self.medium,
            ImpactTier::Low => &mut self.low,
            ImpactTier::Unassigned => &mut self.unassigned,
        }
    }

    fn tier_of(&self, id: &TestId) -> Option<ImpactTier> {
        [
            ImpactTier::High,
            ImpactTier::Medium,
            ImpactTier::Low,
            ImpactTier::Unassigned,
        ]
        .into_iter()
        .find(|tier| self.get(*tier).contains(id))
    }

    /// Collapse tests sharing a name into one entry placed in the strongest
    /// tier any of them reached.
    ///
    /// The representative row of a name is its lowest-id test in that tier.
    /// Output lists are ordered by test name.
    pub fn dedupe_by_name(&self, tests: &[Test]) -> TieredTests {
        let mut best: BTreeMap<&str, (ImpactTier, &Test)> = BTreeMap::new();
        let mut sorted: Vec<&Test> = tests.iter().collect();
        sorted.sort_by(|a, b| a.id.cmp(&b.id));

        for test in sorted {
            let Some(tier) = self.tier_of(&test.id) else {
                continue;
            };
            match best.get(test.name.as_str()) {
                Some((current, _)) if *current <= tier => {}
                _ => {
                    best.insert(test.name.as_str(), (tier, test));
                }
            }
        }

        let mut tiered = TieredTests::default();
        for (tier, test) in best.into_values() {
            tiered.list_mut(tier).push(test.clone());
        }
        tiered
    }
}

/// Deduplicated tests per tier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TieredTests {
    pub high: Vec<Test>,
    pub medium: Vec<Test>,
    pub low: Vec<Test>,
    pub unassigned: Vec<Test>,
}

impl TieredTests {
    pub fn get(&self, tier: ImpactTier) -> &[Test] {
        match tier {
            ImpactTier::High => &self.high,
            ImpactTier::Medium => &self.medium,
            ImpactTier::Low => &self.low,
            ImpactTier::Unassigned => &self.unassigned,
        }
    }

    fn list_mut(&mut self, tier: ImpactTier) -> &mut Vec<Test> {
        match tier {
            ImpactTier::High => &mut self.high,
            ImpactTier::Medium => &mut self.medium,
            ImpactTier::Low => &mut self.low,
            ImpactTier::Unassigned => &mut self.unassigned,
        }
    }

    pub fn len(&self) -> usize {
        self.high.len() + self.medium.len() + self.low.len() + self.unassigned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Files and areas touched by the commits that caused a closed, fixed
/// project defect, with the tests linked to it.
#[derive(Debug, Clone, Default)]
pub(crate) struct CausalFootprint {
    pub tests: BTreeSet<TestId>,
    pub files: HashSet<FileId>,
    pub areas: HashSet<AreaId>,
}

/// Everything the rules look at, fetched once per classification.
#[derive(Debug, Clone, Default)]
pub(crate) struct ImpactInputs {
    pub commit_files: HashSet<FileId>,
    /// Areas of the commit set, Default Area excluded.
    pub commit_areas: HashSet<AreaId>,
    pub areas: HashMap<AreaId, Area>,
    pub fixed_defects: Vec<CausalFootprint>,
    /// Tests linked to a Project defect of any status.
    pub project_defect_tests: HashSet<TestId>,
    pub dependency_depth: usize,
}

pub(crate) fn classify(tests: &[Test], inputs: &ImpactInputs) -> TierSets {
    let mut sets = TierSets::default();
    for test in tests {
        sets.insert(tier_for(test, inputs), test.id.clone());
    }
    sets
}

fn tier_for(test: &Test, inputs: &ImpactInputs) -> ImpactTier {
    let linked: Vec<&CausalFootprint> = inputs
        .fixed_defects
        .iter()
        .filter(|d| d.tests.contains(&test.id))
        .collect();

    let touches_changed_file = test
        .associated_files
        .iter()
        .any(|f| inputs.commit_files.contains(f));
    let regressed_file = linked
        .iter()
        .any(|d| d.files.iter().any(|f| inputs.commit_files.contains(f)));
    if touches_changed_file || regressed_file {
        return ImpactTier::High;
    }

    let reachable = reachable_areas(&test.associated_areas, &inputs.areas, inputs.dependency_depth);
    let touches_changed_area = reachable.iter().any(|a| inputs.commit_areas.contains(a));
    let regressed_area = test.area.as_ref().is_some_and(|own| {
        inputs.commit_areas.contains(own) && linked.iter().any(|d| d.areas.contains(own))
    });
    if touches_changed_area || regressed_area {
        return ImpactTier::Medium;
    }

    if !inputs.project_defect_tests.contains(&test.id) && !test.has_associations() {
        return ImpactTier::Unassigned;
    }
    ImpactTier::Low
}

/// `start` plus every area reachable along dependency edges in at most
/// `max_hops` steps.
pub(crate) fn reachable_areas(
    start: &BTreeSet<AreaId>,
    areas: &HashMap<AreaId, Area>,
    max_hops: usize,
) -> HashSet<AreaId> {
    let mut visited: HashSet<AreaId> = start.iter().cloned().collect();
    let mut worklist: VecDeque<(AreaId, usize)> = start.iter().map(|a| (a.clone(), 0)).collect();

    while let Some((area, hops)) = worklist.pop_front() {
        if hops >= max_hops {
            continue;
        }
        let Some(node) = areas.get(&area) else {
            continue;
        };
        for dep in &node.dependencies {
            if visited.insert(dep.clone()) {
                worklist.push_back((dep.clone(), hops + 1));
            }
        }
    }
    visited
}
