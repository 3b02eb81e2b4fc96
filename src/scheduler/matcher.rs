//! Requirement matching.
//!
//! Turns a test's environment requirements into ordered
//! [`RequirementGroup`]s and searches the [`NodeRegistry`] for
//! (node, product set) matches covering them.
//!
//! # Ordering
//!
//! Groups are matched longest expression first, so rare, specific
//! environments claim products before common ones exhaust the pool. Within a
//! group, candidate nodes are scanned lowest load first, counting slots
//! already promised to earlier matches in the same search.
//!
//! # Coverage
//!
//! A search returns matches for every group or nothing at all. Finding no
//! match is not an error: the request stays pending for the next pass.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use regex::Regex;

use crate::environment::{EnvironmentCompiler, EnvironmentError, EnvironmentResult, PatternGroup};
use crate::node::{FreeProduct, Node, NodeId, NodeRegistry, NodeSnapshot};
use crate::test_case::{Target, TestCase};

/// One environment a test needs, with how many matches would cover it.
#[derive(Debug, Clone)]
pub struct RequirementGroup {
    pub environment: String,
    pub patterns: Vec<Regex>,
    /// Number of packages declaring this environment (1 for tests without
    /// packages).
    pub demand: usize,
}

/// Compiles the requirement groups of `test`.
///
/// `NOSE` tests need no products and get no groups. `FLASH` tests get one
/// group per distinct package environment, sorted by descending expression
/// length; ties keep declaration order.
pub fn requirement_groups(
    test: &TestCase,
    compiler: &dyn EnvironmentCompiler,
) -> EnvironmentResult<Vec<RequirementGroup>> {
    if test.target != Target::Flash {
        return Ok(Vec::new());
    }

    let mut order: Vec<String> = Vec::new();
    let mut demand: HashMap<String, usize> = HashMap::new();
    for package in test.effective_packages() {
        let environment = package.required_environment.unwrap_or_default();
        let environment = environment.trim().to_string();
        if environment.is_empty() {
            return Err(EnvironmentError::Empty);
        }
        if !demand.contains_key(&environment) {
            order.push(environment.clone());
        }
        *demand.entry(environment).or_default() += 1;
    }

    let mut groups = order
        .into_iter()
        .map(|environment| {
            let group = PatternGroup::compile(compiler, &environment)?;
            Ok(RequirementGroup {
                demand: demand[&environment],
                environment,
                patterns: group.patterns,
            })
        })
        .collect::<EnvironmentResult<Vec<_>>>()?;
    groups.sort_by(|a, b| b.environment.len().cmp(&a.environment.len()));
    Ok(groups)
}

/// Requirement groups for re-running a single sub-test: every group is
/// covered by one match.
pub fn restart_groups(groups: &[RequirementGroup]) -> Vec<RequirementGroup> {
    groups
        .iter()
        .map(|g| RequirementGroup {
            demand: 1,
            ..g.clone()
        })
        .collect()
}

/// A set of products on one node satisfying one group.
#[derive(Debug, Clone)]
pub struct ProductSet {
    pub node: Arc<Node>,
    pub products: Vec<String>,
}

/// All matches found for one environment.
#[derive(Debug, Clone)]
pub struct GroupMatch {
    pub environment: String,
    pub sets: Vec<ProductSet>,
}

struct Candidate {
    node: Arc<Node>,
    snapshot: NodeSnapshot,
    tentative: usize,
}

impl Candidate {
    fn has_slot(&self, max_per_node: usize) -> bool {
        self.snapshot.running + self.tentative < max_per_node
    }
}

/// Searches `registry` for matches covering every group of a `FLASH` test.
///
/// No product appears in more than one returned set, and no node is given
/// more sets than it has spare slots. Returns `None` when any group finds no
/// match.
pub fn match_flash(
    registry: &NodeRegistry,
    groups: &[RequirementGroup],
    max_per_node: usize,
    pinned: Option<&str>,
) -> Option<Vec<GroupMatch>> {
    if groups.is_empty() {
        return None;
    }

    let mut candidates: Vec<Candidate> = registry
        .flash_candidates(max_per_node, pinned)
        .into_iter()
        .map(|(node, snapshot)| Candidate {
            node,
            snapshot,
            tentative: 0,
        })
        .collect();
    let mut committed: HashSet<(NodeId, String)> = HashSet::new();
    let mut result = Vec::with_capacity(groups.len());

    for group in groups {
        candidates.sort_by(|a, b| {
            a.snapshot
                .load
                .with_extra(a.tentative)
                .cmp(&b.snapshot.load.with_extra(b.tentative))
                .then_with(|| a.node.id().cmp(b.node.id()))
        });

        let mut sets = Vec::new();
        for candidate in candidates.iter_mut() {
            while sets.len() < group.demand && candidate.has_slot(max_per_node) {
                let free: Vec<&FreeProduct> = candidate
                    .snapshot
                    .free
                    .iter()
                    .filter(|p| !committed.contains(&(candidate.node.id().clone(), p.imei.clone())))
                    .collect();
                if free.len() < group.patterns.len() {
                    break;
                }
                let Some(products) = find_set(&group.patterns, &free) else {
                    break;
                };
                for imei in &products {
                    committed.insert((candidate.node.id().clone(), imei.clone()));
                }
                candidate.tentative += 1;
                sets.push(ProductSet {
                    node: candidate.node.clone(),
                    products,
                });
            }
            if sets.len() >= group.demand {
                break;
            }
        }

        if sets.is_empty() {
            return None;
        }
        result.push(GroupMatch {
            environment: group.environment.clone(),
            sets,
        });
    }

    Some(result)
}

/// Picks the least-loaded node with a spare slot for a `NOSE` test.
pub fn match_nose(
    registry: &NodeRegistry,
    max_per_node: usize,
    pinned: Option<&str>,
) -> Option<Vec<GroupMatch>> {
    let node = registry.first_with_capacity(max_per_node, pinned)?;
    Some(vec![GroupMatch {
        environment: String::new(),
        sets: vec![ProductSet {
            node,
            products: Vec::new(),
        }],
    }])
}

/// Finds distinct products matching each pattern, in pattern order.
fn find_set(patterns: &[Regex], free: &[&FreeProduct]) -> Option<Vec<String>> {
    fn search(
        patterns: &[Regex],
        free: &[&FreeProduct],
        used: &mut Vec<bool>,
        chosen: &mut Vec<usize>,
    ) -> bool {
        let Some(pattern) = patterns.get(chosen.len()) else {
            return true;
        };
        for (i, product) in free.iter().enumerate() {
            if used[i] || !pattern.is_match(&product.attributes) {
                continue;
            }
            used[i] = true;
            chosen.push(i);
            if search(patterns, free, used, chosen) {
                return true;
            }
            chosen.pop();
            used[i] = false;
        }
        false
    }

    let mut used = vec![false; free.len()];
    let mut chosen = Vec::with_capacity(patterns.len());
    search(patterns, free, &mut used, &mut chosen)
        .then(|| chosen.into_iter().map(|i| free[i].imei.clone()).collect())
}
