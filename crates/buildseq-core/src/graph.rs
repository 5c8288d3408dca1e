//! Package dependency graph and build planning.
//!
//! An edge `gcc → binutils` means "gcc depends on binutils": binutils must
//! complete every phase before gcc may start.
//!
//! Cycle detection runs once, when the graph is built, so every
//! [`DependencyGraph`] in hand is acyclic. Plans are computed with Kahn's
//! algorithm per phase group, always picking the lexicographically smallest
//! ready package so the same manifest yields the same plan.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::manifest::{Manifest, Package};

/// Whether declared phase groups partition the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupOrdering {
    /// Groups run in declared order; a later group starts only after the
    /// earlier one finished.
    #[default]
    Enforce,
    /// Treat the whole manifest as one group.
    Ignore,
}

/// A package in a [`BuildPlan`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanStep {
    /// 0-indexed position across the whole plan.
    pub position: usize,
    pub package: String,
    pub version: String,
    /// Direct dependencies, in manifest order.
    pub depends_on: Vec<String>,
    /// Kahn wave: 0 for packages without dependencies, otherwise one more
    /// than the deepest dependency. Same-level packages may build together.
    pub level: usize,
}

/// One phase group of a plan. `name` is `None` for the implicit group
/// holding packages without a declared group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanGroup {
    pub name: Option<String>,
    pub steps: Vec<PlanStep>,
}

/// Phase-grouped, dependency-ordered package sequence for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildPlan {
    pub groups: Vec<PlanGroup>,
}

impl BuildPlan {
    /// Every step in plan order.
    pub fn steps(&self) -> impl Iterator<Item = &PlanStep> {
        self.groups.iter().flat_map(|g| g.steps.iter())
    }

    /// Package names in plan order.
    pub fn order(&self) -> Vec<&str> {
        self.steps().map(|s| s.package.as_str()).collect()
    }

    /// Index of the group containing `package`.
    pub fn group_index(&self, package: &str) -> Option<usize> {
        self.groups
            .iter()
            .position(|g| g.steps.iter().any(|s| s.package == package))
    }

    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.steps.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for BuildPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for group in &self.groups {
            match &group.name {
                Some(name) => writeln!(f, "[{name}]")?,
                None if self.groups.len() > 1 => writeln!(f, "[ungrouped]")?,
                None => {}
            }
            for step in &group.steps {
                write!(
                    f,
                    "{:>4}  {}-{}  (level {})",
                    step.position + 1,
                    step.package,
                    step.version,
                    step.level
                )?;
                if !step.depends_on.is_empty() {
                    write!(f, "  <- {}", step.depends_on.join(", "))?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Colour {
    Unvisited,
    InProgress,
    Done,
}

/// Acyclic dependency graph over the packages of one manifest.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    packages: BTreeMap<String, Package>,
    /// `package → dependencies`, in manifest order.
    upstream: BTreeMap<String, Vec<String>>,
    /// `dependency → dependents`.
    downstream: BTreeMap<String, BTreeSet<String>>,
    phase_groups: Vec<String>,
}

impl DependencyGraph {
    /// Build the graph and reject dependency cycles.
    pub fn build(manifest: &Manifest) -> Result<Self, GraphError> {
        let mut packages = BTreeMap::new();
        let mut upstream = BTreeMap::new();
        let mut downstream: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for pkg in manifest.packages() {
            packages.insert(pkg.name.clone(), pkg.clone());
            upstream.insert(pkg.name.clone(), pkg.dependencies.clone());
            downstream.entry(pkg.name.clone()).or_default();
            for dep in &pkg.dependencies {
                downstream
                    .entry(dep.clone())
                    .or_default()
                    .insert(pkg.name.clone());
            }
        }

        let graph = Self {
            packages,
            upstream,
            downstream,
            phase_groups: manifest.phase_groups().to_vec(),
        };
        if let Some(path) = graph.find_cycle() {
            return Err(GraphError::CyclicDependency { path });
        }
        Ok(graph)
    }

    pub fn package(&self, name: &str) -> Option<&Package> {
        self.packages.get(name)
    }

    /// Packages ordered by name.
    pub fn packages(&self) -> impl Iterator<Item = &Package> {
        self.packages.values()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Direct dependencies of `name`, in manifest order.
    pub fn dependencies_of(&self, name: &str) -> Result<&[String], GraphError> {
        self.upstream
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| not_found(name))
    }

    /// Direct dependents of `name`, ordered by name.
    pub fn dependents_of(&self, name: &str) -> Result<Vec<&str>, GraphError> {
        self.downstream
            .get(name)
            .map(|set| set.iter().map(String::as_str).collect())
            .ok_or_else(|| not_found(name))
    }

    /// Every package that directly or indirectly depends on `name`, ordered
    /// by name. Does not include `name` itself.
    pub fn transitive_dependents_of(&self, name: &str) -> Result<Vec<String>, GraphError> {
        if !self.packages.contains_key(name) {
            return Err(not_found(name));
        }
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::from([name.to_string()]);
        while let Some(current) = queue.pop_front() {
            if let Some(deps) = self.downstream.get(&current) {
                for dep in deps {
                    if visited.insert(dep.clone()) {
                        queue.push_back(dep.clone());
                    }
                }
            }
        }
        Ok(visited.into_iter().collect())
    }

    /// Compute the build plan.
    ///
    /// With [`GroupOrdering::Enforce`] and declared phase groups, each group
    /// is planned on its own, in declared order, followed by an implicit
    /// group for ungrouped packages. A package may only depend on packages of
    /// its own or an earlier group.
    pub fn build_plan(&self, ordering: GroupOrdering) -> Result<BuildPlan, GraphError> {
        let levels = self.levels();
        let partition = self.partition(ordering)?;

        let mut groups = Vec::with_capacity(partition.len());
        let mut position = 0;
        for (name, members) in partition {
            let mut steps = Vec::with_capacity(members.len());
            for pkg_name in self.kahn_order(&members) {
                let pkg = &self.packages[pkg_name];
                steps.push(PlanStep {
                    position,
                    package: pkg.name.clone(),
                    version: pkg.version.clone(),
                    depends_on: pkg.dependencies.clone(),
                    level: levels.get(pkg_name).copied().unwrap_or(0),
                });
                position += 1;
            }
            groups.push(PlanGroup { name, steps });
        }
        Ok(BuildPlan { groups })
    }

    /// Split packages into ordered groups and check cross-group edges.
    fn partition(
        &self,
        ordering: GroupOrdering,
    ) -> Result<Vec<(Option<String>, BTreeSet<&str>)>, GraphError> {
        if ordering == GroupOrdering::Ignore || self.phase_groups.is_empty() {
            let all = self.packages.keys().map(String::as_str).collect();
            return Ok(vec![(None, all)]);
        }

        let ungrouped = self.phase_groups.len();
        let group_index = |pkg: &Package| -> usize {
            pkg.group
                .as_ref()
                .and_then(|g| self.phase_groups.iter().position(|d| d == g))
                .unwrap_or(ungrouped)
        };

        let mut buckets: Vec<BTreeSet<&str>> = vec![BTreeSet::new(); ungrouped + 1];
        for pkg in self.packages.values() {
            let idx = group_index(pkg);
            for dep in &pkg.dependencies {
                let dep_pkg = &self.packages[dep];
                if group_index(dep_pkg) > idx {
                    return Err(GraphError::GroupOrderViolation {
                        package: pkg.name.clone(),
                        package_group: group_label(pkg),
                        dependency: dep.clone(),
                        dependency_group: group_label(dep_pkg),
                    });
                }
            }
            buckets[idx].insert(pkg.name.as_str());
        }

        Ok(buckets
            .into_iter()
            .enumerate()
            .filter(|(_, members)| !members.is_empty())
            .map(|(i, members)| (self.phase_groups.get(i).cloned(), members))
            .collect())
    }

    /// Kahn's algorithm restricted to `members`; edges to packages outside the
    /// set belong to earlier groups and are already satisfied.
    fn kahn_order<'a>(&'a self, members: &BTreeSet<&'a str>) -> Vec<&'a str> {
        let mut in_degree: HashMap<&str, usize> = members
            .iter()
            .map(|&name| {
                let inside = self.upstream[name]
                    .iter()
                    .filter(|d| members.contains(d.as_str()))
                    .count();
                (name, inside)
            })
            .collect();

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&name, _)| name)
            .collect();

        let mut order = Vec::with_capacity(members.len());
        while let Some(name) = ready.pop_first() {
            order.push(name);
            for dependent in &self.downstream[name] {
                if let Some(deg) = in_degree.get_mut(dependent.as_str()) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(dependent.as_str());
                    }
                }
            }
        }
        order
    }

    /// Kahn wave number per package over the whole graph.
    pub fn levels(&self) -> BTreeMap<&str, usize> {
        let mut levels: BTreeMap<&str, usize> = BTreeMap::new();
        let all: BTreeSet<&str> = self.packages.keys().map(String::as_str).collect();
        for name in self.kahn_order(&all) {
            let level = self.upstream[name]
                .iter()
                .filter_map(|d| levels.get(d.as_str()))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            levels.insert(name, level);
        }
        levels
    }

    /// Three-colour DFS. Roots are visited in name order and edges in
    /// declaration order, so the reported cycle is stable.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut colour: HashMap<&str, Colour> = self
            .packages
            .keys()
            .map(|k| (k.as_str(), Colour::Unvisited))
            .collect();
        let mut path = Vec::new();
        for root in self.packages.keys() {
            if colour[root.as_str()] == Colour::Unvisited {
                if let Some(cycle) = self.visit(root, &mut colour, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        colour: &mut HashMap<&'a str, Colour>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        colour.insert(node, Colour::InProgress);
        path.push(node);
        for dep in &self.upstream[node] {
            match colour[dep.as_str()] {
                Colour::InProgress => {
                    let start = path.iter().position(|&p| p == dep.as_str())?;
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
                Colour::Unvisited => {
                    if let Some(cycle) = self.visit(dep, colour, path) {
                        return Some(cycle);
                    }
                }
                Colour::Done => {}
            }
        }
        path.pop();
        colour.insert(node, Colour::Done);
        None
    }
}

fn not_found(name: &str) -> GraphError {
    GraphError::PackageNotFound {
        name: name.to_string(),
    }
}

fn group_label(pkg: &Package) -> String {
    pkg.group.clone().unwrap_or_else(|| "(ungrouped)".to_string())
}
