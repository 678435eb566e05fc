//! Dependency graph evaluation.
//!
//! Blocked state is derived from scratch on every call: edges are grouped by
//! dependent, and each dependent is checked against the statuses of its
//! direct dependencies. Nothing here is patched incrementally and nothing is
//! transitive; a task only waits on its one-hop predecessors.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use crate::cache::TaskCache;
use crate::fields::{MissingDependencyPolicy, Status};
use crate::task::{BlockedInfo, DependencyEdge, Task, TaskId};

/// Dependent id → direct dependency ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    deps: BTreeMap<TaskId, BTreeSet<TaskId>>,
}

impl DependencyGraph {
    pub fn from_edges<'a, I>(edges: I) -> Self
    where
        I: IntoIterator<Item = &'a DependencyEdge>,
    {
        let mut deps: BTreeMap<TaskId, BTreeSet<TaskId>> = BTreeMap::new();
        for edge in edges {
            deps.entry(edge.dependent_id).or_default().insert(edge.dependency_id);
        }
        DependencyGraph { deps }
    }

    /// Direct dependencies of a task.
    pub fn dependencies_of(&self, id: TaskId) -> impl Iterator<Item = TaskId> + '_ {
        self.deps.get(&id).into_iter().flatten().copied()
    }

    /// Tasks that directly depend on `id`.
    pub fn dependents_of(&self, id: TaskId) -> Vec<TaskId> {
        self.deps
            .iter()
            .filter(|(_, set)| set.contains(&id))
            .map(|(&dependent, _)| dependent)
            .collect()
    }

    pub fn dependents(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.deps.keys().copied()
    }

    /// Whether adding `dependent -> dependency` would close a cycle, i.e. the
    /// dependency already (transitively) waits on the dependent.
    pub fn would_create_cycle(&self, dependent: TaskId, dependency: TaskId) -> bool {
        if dependent == dependency {
            return true;
        }
        let mut visited: HashSet<TaskId> = HashSet::new();
        let mut queue: VecDeque<TaskId> = VecDeque::from([dependency]);
        while let Some(current) = queue.pop_front() {
            if current == dependent {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            queue.extend(self.dependencies_of(current).filter(|d| !visited.contains(d)));
        }
        false
    }

    /// Dependencies of `id` that do not count as done under `policy`.
    pub fn incomplete_dependencies(
        &self,
        id: TaskId,
        statuses: &HashMap<TaskId, Status>,
        policy: MissingDependencyPolicy,
    ) -> Vec<TaskId> {
        self.dependencies_of(id)
            .filter(|dep| match statuses.get(dep) {
                Some(status) => *status != Status::Done,
                None => policy == MissingDependencyPolicy::FailClosed,
            })
            .collect()
    }
}

/// Compute blocked state with the fail-closed policy.
pub fn compute_blocked<'a, I>(tasks: I, edges: &[DependencyEdge]) -> HashMap<TaskId, BlockedInfo>
where
    I: IntoIterator<Item = &'a Task>,
{
    compute_blocked_with(tasks, edges, MissingDependencyPolicy::FailClosed)
}

/// Compute blocked state for every supplied task and every dependent named
/// by an edge.
///
/// Tasks without outgoing edges are vacuously unblocked. A dependency that is
/// not among `tasks` is treated according to `policy`.
pub fn compute_blocked_with<'a, I>(
    tasks: I,
    edges: &[DependencyEdge],
    policy: MissingDependencyPolicy,
) -> HashMap<TaskId, BlockedInfo>
where
    I: IntoIterator<Item = &'a Task>,
{
    let statuses: HashMap<TaskId, Status> = tasks.into_iter().map(|t| (t.id, t.status)).collect();
    let graph = DependencyGraph::from_edges(edges);

    let mut out: HashMap<TaskId, BlockedInfo> = statuses
        .keys()
        .map(|&id| (id, BlockedInfo::default()))
        .collect();

    for dependent in graph.dependents() {
        let incomplete = graph.incomplete_dependencies(dependent, &statuses, policy);
        out.insert(
            dependent,
            BlockedInfo {
                has_dependencies: true,
                dependencies_completed: incomplete.is_empty(),
            },
        );
    }
    out
}

fn cache_statuses(cache: &TaskCache) -> HashMap<TaskId, Status> {
    cache
        .outside_scope()
        .chain(cache.all())
        .map(|t| (t.id, t.status))
        .collect()
}

/// Evaluate blocked state over everything the cache currently knows.
pub fn evaluate_cache(cache: &TaskCache, policy: MissingDependencyPolicy) -> HashMap<TaskId, BlockedInfo> {
    compute_blocked_with(cache.outside_scope().chain(cache.all()), cache.edges(), policy)
}

/// Fresh blocked state for one cached task.
pub fn blocked_in_cache(cache: &TaskCache, id: TaskId, policy: MissingDependencyPolicy) -> BlockedInfo {
    let graph = DependencyGraph::from_edges(cache.edges());
    if graph.dependencies_of(id).next().is_none() {
        return BlockedInfo::default();
    }
    let statuses = cache_statuses(cache);
    BlockedInfo {
        has_dependencies: true,
        dependencies_completed: graph.incomplete_dependencies(id, &statuses, policy).is_empty(),
    }
}

/// Incomplete direct dependencies of one cached task, for user messages.
pub fn blockers_in_cache(cache: &TaskCache, id: TaskId, policy: MissingDependencyPolicy) -> Vec<TaskId> {
    let graph = DependencyGraph::from_edges(cache.edges());
    graph.incomplete_dependencies(id, &cache_statuses(cache), policy)
}

/// Recompute and re-attach dependency flags on every cached entry.
pub fn rederive(cache: &mut TaskCache, policy: MissingDependencyPolicy) {
    let blocked = evaluate_cache(cache, policy);
    let changed: Vec<Task> = cache
        .all()
        .into_iter()
        .filter_map(|task| {
            let fresh = blocked.get(&task.id).copied().unwrap_or_default();
            (task.dependencies != fresh).then(|| Task {
                dependencies: fresh,
                ..task.clone()
            })
        })
        .collect();
    if !changed.is_empty() {
        cache.upsert_many(changed);
    }
}
