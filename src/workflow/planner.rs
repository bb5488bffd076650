//! Execution Planner
//!
//! Resolves the `requires` graph of a template into execution levels:
//! - Logical-name indexing (with duplicate detection)
//! - Cycle detection by three-colour depth-first search
//! - Memoized level computation
//! - Bucketing by level and parallel group

use std::collections::{BTreeMap, HashMap};

use log::{debug, info};

use super::model::{Template, Workflow, WorkflowKey};
use crate::error::GraphError;

/// Bucket name for workflows without a parallel group.
pub const SEQUENTIAL_BUCKET: &str = "_sequential_";

/// Members of one named parallel group within a level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelGroup {
    pub name: String,
    pub members: Vec<WorkflowKey>,
}

/// Workflows whose dependencies all sit in earlier levels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionLevel {
    /// Dependency depth (0 = no requirements)
    pub depth: usize,
    /// Workflows run one at a time, sorted by key
    pub sequential: Vec<WorkflowKey>,
    /// Named groups, taken up in name order
    pub groups: Vec<ParallelGroup>,
}

impl ExecutionLevel {
    /// Every key in this level, sequential bucket first.
    pub fn keys(&self) -> impl Iterator<Item = &WorkflowKey> {
        self.sequential
            .iter()
            .chain(self.groups.iter().flat_map(|g| g.members.iter()))
    }

    pub fn len(&self) -> usize {
        self.keys().count()
    }

    pub fn is_empty(&self) -> bool {
        self.sequential.is_empty() && self.groups.iter().all(|g| g.members.is_empty())
    }
}

/// Ordered list of levels for one template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub levels: Vec<ExecutionLevel>,
}

impl ExecutionPlan {
    pub fn workflow_count(&self) -> usize {
        self.levels.iter().map(ExecutionLevel::len).sum()
    }

    /// Position of the level containing `key`.
    pub fn level_of(&self, key: &WorkflowKey) -> Option<usize> {
        self.levels
            .iter()
            .position(|level| level.keys().any(|k| k == key))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Visited,
}

/// Depth-first level resolver over logical names.
struct LevelResolver<'a> {
    by_name: HashMap<&'a str, (&'a WorkflowKey, &'a Workflow)>,
    marks: HashMap<&'a str, Mark>,
    levels: HashMap<&'a str, usize>,
}

impl<'a> LevelResolver<'a> {
    fn new(template: &'a Template) -> Result<Self, GraphError> {
        let mut by_name: HashMap<&str, (&WorkflowKey, &Workflow)> = HashMap::new();

        for (key, workflow) in &template.workflows {
            if let Some((first, _)) = by_name.insert(key.logical_name(), (key, workflow)) {
                return Err(GraphError::DuplicateLogicalName {
                    name: key.logical_name().to_string(),
                    first: first.to_string(),
                    second: key.to_string(),
                });
            }
        }

        let marks = by_name.keys().map(|name| (*name, Mark::Unvisited)).collect();

        Ok(Self {
            by_name,
            marks,
            levels: HashMap::new(),
        })
    }

    /// level(name) = 0 without requirements, else 1 + max(level(dep)).
    fn visit(&mut self, name: &'a str) -> Result<usize, GraphError> {
        match self.marks.get(name).copied() {
            Some(Mark::Visited) => return Ok(self.levels[name]),
            Some(Mark::Visiting) => {
                return Err(GraphError::Cycle {
                    name: name.to_string(),
                })
            }
            Some(Mark::Unvisited) | None => {}
        }

        let (_, workflow) = self.by_name[name];
        self.marks.insert(name, Mark::Visiting);

        let mut level = 0;
        for dep in &workflow.requires {
            let Some(dep_name) = self.by_name.get_key_value(dep.as_str()).map(|(n, _)| *n) else {
                return Err(GraphError::UnknownDependency {
                    workflow: name.to_string(),
                    dependency: dep.clone(),
                });
            };
            let dep_level = self.visit(dep_name)?;
            level = level.max(dep_level + 1);
        }

        self.marks.insert(name, Mark::Visited);
        self.levels.insert(name, level);
        Ok(level)
    }
}

/// Computes the level of every workflow, keyed by workflow key.
pub fn compute_levels(template: &Template) -> Result<BTreeMap<WorkflowKey, usize>, GraphError> {
    let mut resolver = LevelResolver::new(template)?;

    let mut levels = BTreeMap::new();
    for key in template.workflows.keys() {
        let level = resolver.visit(key.logical_name())?;
        levels.insert(key.clone(), level);
    }
    Ok(levels)
}

/// Builds the execution plan for a template.
///
/// Workflows are bucketed by `(level, parallel_group or "_sequential_")`.
/// Buckets are ordered deterministically: keys sorted within a bucket,
/// named groups sorted by name, empty levels compacted out.
pub fn build_levels(template: &Template) -> Result<ExecutionPlan, GraphError> {
    let levels = compute_levels(template)?;

    let mut buckets: BTreeMap<usize, BTreeMap<String, Vec<WorkflowKey>>> = BTreeMap::new();
    for (key, level) in &levels {
        let bucket = template.workflows[key]
            .group()
            .unwrap_or(SEQUENTIAL_BUCKET)
            .to_string();
        buckets
            .entry(*level)
            .or_default()
            .entry(bucket)
            .or_default()
            .push(key.clone());
    }

    let mut plan = ExecutionPlan::default();
    for (depth, mut groups) in buckets {
        let sequential = groups.remove(SEQUENTIAL_BUCKET).unwrap_or_default();
        let level = ExecutionLevel {
            depth,
            sequential,
            groups: groups
                .into_iter()
                .map(|(name, members)| ParallelGroup { name, members })
                .collect(),
        };
        if level.is_empty() {
            continue;
        }
        debug!(
            "Level {}: sequential {:?}, groups {:?}",
            depth,
            level.sequential.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
            level.groups.iter().map(|g| &g.name).collect::<Vec<_>>()
        );
        plan.levels.push(level);
    }

    info!(
        "Planned {} workflows across {} levels",
        plan.workflow_count(),
        plan.levels.len()
    );
    Ok(plan)
}
