//! Test splitting.
//!
//! Divides a test's packages across the matches found for their
//! environments. For an environment with `p` packages and `m` matches each
//! match receives a contiguous run of `ceil(p / m)` packages; matches left
//! without packages are dropped. Every resulting assignment is one sub-test.

use std::sync::Arc;

use crate::node::Node;
use crate::scheduler::matcher::GroupMatch;
use crate::test_case::{Package, ProductRef, TestCase};

/// A sub-test bound to a node and product set, ready to be reserved.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub test: TestCase,
    pub node: Arc<Node>,
    pub products: Vec<String>,
}

/// Splits `test` across `matches`.
///
/// Sub-tests are numbered from 1 in match order, unless a single sub-test
/// takes the whole parent, in which case it keeps the parent's identity.
pub fn split(test: &TestCase, matches: Vec<GroupMatch>) -> Vec<Assignment> {
    let packages = test.effective_packages();
    let mut units: Vec<(String, Vec<Package>, Arc<Node>, Vec<String>)> = Vec::new();

    for group in matches {
        let for_env: Vec<Package> = packages
            .iter()
            .filter(|p| p.required_environment.as_deref().unwrap_or_default().trim() == group.environment)
            .cloned()
            .collect();
        if for_env.is_empty() || group.sets.is_empty() {
            continue;
        }
        let per_match = for_env.len().div_ceil(group.sets.len());
        for (chunk, set) in for_env.chunks(per_match).zip(group.sets) {
            units.push((group.environment.clone(), chunk.to_vec(), set.node, set.products));
        }
    }

    let numbered = units.len() != 1;
    units
        .into_iter()
        .enumerate()
        .map(|(i, (environment, packages, node, products))| {
            let mut sub = test.clone();
            sub.sub_id = numbered.then_some(i + 1);
            sub.required_environment = environment;
            sub.files = merge_files(&packages);
            if !test.packages.is_empty() {
                sub.packages = packages;
            }
            sub.reserved_products = product_refs(&node, &products);
            Assignment {
                test: sub,
                node,
                products,
            }
        })
        .collect()
}

/// Binds an already-split sub-test to a new match, keeping its identity.
pub fn rebind(test: &TestCase, matches: Vec<GroupMatch>) -> Option<Assignment> {
    let set = matches.into_iter().next()?.sets.into_iter().next()?;
    let mut sub = test.clone();
    sub.reserved_products = product_refs(&set.node, &set.products);
    Some(Assignment {
        test: sub,
        node: set.node,
        products: set.products,
    })
}

fn merge_files(packages: &[Package]) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    for file in packages.iter().flat_map(|p| &p.files) {
        if !files.contains(file) {
            files.push(file.clone());
        }
    }
    files
}

fn product_refs(node: &Node, products: &[String]) -> Vec<ProductRef> {
    products
        .iter()
        .map(|imei| ProductRef {
            node: node.id().to_string(),
            imei: imei.clone(),
        })
        .collect()
}
