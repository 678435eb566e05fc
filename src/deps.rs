//! Dependency store access.
//!
//! Reads and writes dependency edges through the store interfaces. Edge
//! creation validates the graph first: self-edges and edges that would close
//! a cycle are refused before any command is issued.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{BoardError, Result, StoreError, StoreResult};
use crate::graph::DependencyGraph;
use crate::store::{TaskCommand, TaskQuery};
use crate::task::{DependencyEdge, TaskId};

/// Outcome of replacing a task's dependency list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyDiff {
    pub added: Vec<TaskId>,
    pub removed: Vec<TaskId>,
}

impl DependencyDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub struct DependencyStore<B: ?Sized> {
    backend: Arc<B>,
}

impl<B: ?Sized> Clone for DependencyStore<B> {
    fn clone(&self) -> Self {
        DependencyStore {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B> DependencyStore<B>
where
    B: TaskQuery + TaskCommand + ?Sized,
{
    pub fn new(backend: Arc<B>) -> Self {
        DependencyStore { backend }
    }

    /// Edges for a set of dependents, deduplicated and ordered.
    pub async fn load_for(&self, dependents: &[TaskId]) -> StoreResult<Vec<DependencyEdge>> {
        if dependents.is_empty() {
            return Ok(Vec::new());
        }
        let edges = self.backend.fetch_edges(dependents).await?;
        Ok(edges.into_iter().collect::<BTreeSet<_>>().into_iter().collect())
    }

    /// Direct dependencies of one task.
    pub async fn dependencies_of(&self, dependent: TaskId) -> StoreResult<Vec<TaskId>> {
        Ok(self
            .load_for(&[dependent])
            .await?
            .into_iter()
            .map(|e| e.dependency_id)
            .collect())
    }

    /// Load the part of the graph reachable from `start` by following
    /// dependency edges.
    async fn reachable_graph(&self, start: TaskId) -> StoreResult<DependencyGraph> {
        let mut seen: HashSet<TaskId> = HashSet::from([start]);
        let mut frontier = vec![start];
        let mut edges = Vec::new();
        while !frontier.is_empty() {
            let batch = self.load_for(&frontier).await?;
            frontier = batch
                .iter()
                .map(|e| e.dependency_id)
                .filter(|id| seen.insert(*id))
                .collect();
            edges.extend(batch);
        }
        Ok(DependencyGraph::from_edges(&edges))
    }

    /// Make `dependent` wait on `dependency`.
    ///
    /// Adding an edge that already exists succeeds without a second insert.
    pub async fn add(&self, dependent: TaskId, dependency: TaskId) -> Result<DependencyEdge> {
        if dependent == dependency {
            return Err(BoardError::SelfDependency(dependent));
        }
        let edge = DependencyEdge::new(dependent, dependency);
        let graph = self.reachable_graph(dependency).await?;
        if graph.would_create_cycle(dependent, dependency) {
            return Err(BoardError::DependencyCycle {
                dependent_id: dependent,
                dependency_id: dependency,
            });
        }
        match self.backend.insert_edge(edge).await {
            Ok(()) => {
                info!(dependent, dependency, "dependency added");
                Ok(edge)
            }
            Err(StoreError::DuplicateEdge { .. }) => {
                debug!(dependent, dependency, "dependency already present");
                Ok(edge)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the edge with exactly this ordered pair.
    pub async fn remove(&self, dependent: TaskId, dependency: TaskId) -> Result<()> {
        self.backend
            .delete_edge(DependencyEdge::new(dependent, dependency))
            .await?;
        info!(dependent, dependency, "dependency removed");
        Ok(())
    }

    /// Replace the whole dependency list of `dependent` with `desired`,
    /// issuing only the inserts and deletes that differ.
    ///
    /// Every new edge is validated before any command runs, so a rejected
    /// list leaves the store untouched.
    pub async fn replace(&self, dependent: TaskId, desired: &[TaskId]) -> Result<DependencyDiff> {
        let current: BTreeSet<TaskId> = self.dependencies_of(dependent).await?.into_iter().collect();
        let desired: BTreeSet<TaskId> = desired.iter().copied().collect();

        let added: Vec<TaskId> = desired.difference(&current).copied().collect();
        let removed: Vec<TaskId> = current.difference(&desired).copied().collect();

        for &dependency in &added {
            if dependency == dependent {
                return Err(BoardError::SelfDependency(dependent));
            }
            if self.reachable_graph(dependency).await?.would_create_cycle(dependent, dependency) {
                return Err(BoardError::DependencyCycle {
                    dependent_id: dependent,
                    dependency_id: dependency,
                });
            }
        }

        for &dependency in &removed {
            self.remove(dependent, dependency).await?;
        }
        for &dependency in &added {
            self.add(dependent, dependency).await?;
        }
        Ok(DependencyDiff { added, removed })
    }
}
