//! Dependency graph over migration records.
//!
//! Records point at their dependencies; the graph rejects duplicates,
//! dangling dependencies and cycles at construction time, so every
//! `MigrationGraph` value has exactly one topological order.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;

use super::record::{MigrationId, MigrationRecord};
use crate::error::{Result, StrataError};
use crate::schema::ProjectState;

/// Validated DAG of migration records.
#[derive(Debug, Clone, Default)]
pub struct MigrationGraph {
    records: BTreeMap<MigrationId, MigrationRecord>,
    children: BTreeMap<MigrationId, BTreeSet<MigrationId>>,
    order: Vec<MigrationId>,
    position: HashMap<MigrationId, usize>,
}

impl MigrationGraph {
    /// Build and validate a graph.
    pub fn new(records: impl IntoIterator<Item = MigrationRecord>) -> Result<Self> {
        let mut by_id = BTreeMap::new();
        for record in records {
            if by_id.contains_key(&record.id) {
                return Err(StrataError::DuplicateMigration(record.id));
            }
            by_id.insert(record.id.clone(), record);
        }

        let mut children: BTreeMap<MigrationId, BTreeSet<MigrationId>> = BTreeMap::new();
        for record in by_id.values() {
            for dep in &record.dependencies {
                if !by_id.contains_key(dep) {
                    return Err(StrataError::MissingDependency {
                        migration: record.id.clone(),
                        dependency: dep.clone(),
                    });
                }
                children
                    .entry(dep.clone())
                    .or_default()
                    .insert(record.id.clone());
            }
        }

        if let Some(cycle) = find_cycle(&by_id) {
            return Err(StrataError::DependencyCycle { cycle });
        }

        let order = topological_sort(&by_id, &children);
        let position = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        debug!("Built migration graph with {} records", order.len());

        Ok(Self {
            records: by_id,
            children,
            order,
            position,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: &MigrationId) -> bool {
        self.records.contains_key(id)
    }

    pub fn get(&self, id: &MigrationId) -> Option<&MigrationRecord> {
        self.records.get(id)
    }

    /// Look up a record, failing with `NotFound`.
    pub fn record(&self, id: &MigrationId) -> Result<&MigrationRecord> {
        self.get(id)
            .ok_or_else(|| StrataError::NotFound(format!("migration {}", id)))
    }

    /// The unique application order.
    pub fn topological_order(&self) -> &[MigrationId] {
        &self.order
    }

    /// Records in application order.
    pub fn records(&self) -> impl Iterator<Item = &MigrationRecord> {
        self.order.iter().filter_map(|id| self.records.get(id))
    }

    /// Index of a record in the application order.
    pub fn position(&self, id: &MigrationId) -> Option<usize> {
        self.position.get(id).copied()
    }

    /// Namespaces present in the graph.
    pub fn apps(&self) -> BTreeSet<String> {
        self.records.keys().map(|id| id.app.clone()).collect()
    }

    pub fn children(&self, id: &MigrationId) -> impl Iterator<Item = &MigrationId> {
        self.children.get(id).into_iter().flatten()
    }

    /// Every record `id` transitively depends on, excluding `id`.
    pub fn ancestors(&self, id: &MigrationId) -> BTreeSet<MigrationId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&MigrationId> = self
            .records
            .get(id)
            .map(|r| r.dependencies.iter().collect())
            .unwrap_or_default();
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                if let Some(record) = self.records.get(next) {
                    stack.extend(record.dependencies.iter());
                }
            }
        }
        seen
    }

    /// Every record that transitively depends on `id`, excluding `id`.
    pub fn descendants(&self, id: &MigrationId) -> BTreeSet<MigrationId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&MigrationId> = self.children(id).collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(self.children(next));
            }
        }
        seen
    }

    /// `id` and its ancestors in application order.
    pub fn forwards_plan(&self, id: &MigrationId) -> Result<Vec<MigrationId>> {
        self.record(id)?;
        let mut wanted = self.ancestors(id);
        wanted.insert(id.clone());
        Ok(self.in_order(&wanted))
    }

    /// `id` and its descendants in reverse application order.
    pub fn backwards_plan(&self, id: &MigrationId) -> Result<Vec<MigrationId>> {
        self.record(id)?;
        let mut wanted = self.descendants(id);
        wanted.insert(id.clone());
        let mut plan = self.in_order(&wanted);
        plan.reverse();
        Ok(plan)
    }

    /// Sort a set of ids into application order.
    pub fn in_order(&self, ids: &BTreeSet<MigrationId>) -> Vec<MigrationId> {
        self.order
            .iter()
            .filter(|id| ids.contains(*id))
            .cloned()
            .collect()
    }

    /// Records of `app` with no child in the same namespace.
    pub fn leaf_nodes(&self, app: &str) -> Vec<MigrationId> {
        self.order
            .iter()
            .filter(|id| id.app == app)
            .filter(|id| !self.children(id).any(|c| c.app == app))
            .cloned()
            .collect()
    }

    /// Replay the operations of the selected records, in order, from empty.
    pub fn make_state<F>(&self, mut include: F) -> Result<ProjectState>
    where
        F: FnMut(&MigrationId) -> bool,
    {
        let mut state = ProjectState::new();
        for record in self.records() {
            if !include(&record.id) {
                continue;
            }
            for (index, op) in record.operations.iter().enumerate() {
                op.state_forwards(record.app(), &mut state)
                    .map_err(|e| e.in_operation(&record.id, index, op.describe()))?;
            }
        }
        Ok(state)
    }
}

/// Find a dependency cycle, returned as a closed path (first == last).
fn find_cycle(records: &BTreeMap<MigrationId, MigrationRecord>) -> Option<Vec<MigrationId>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        id: &'a MigrationId,
        records: &'a BTreeMap<MigrationId, MigrationRecord>,
        marks: &mut HashMap<&'a MigrationId, Mark>,
        path: &mut Vec<&'a MigrationId>,
    ) -> Option<Vec<MigrationId>> {
        match marks.get(id) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = path.iter().position(|p| *p == id).unwrap_or(0);
                let mut cycle: Vec<MigrationId> = path[start..].iter().map(|p| (*p).clone()).collect();
                cycle.push(id.clone());
                return Some(cycle);
            }
            None => {}
        }

        marks.insert(id, Mark::Visiting);
        path.push(id);
        if let Some(record) = records.get(id) {
            for dep in &record.dependencies {
                if let Some(cycle) = visit(dep, records, marks, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        marks.insert(id, Mark::Done);
        None
    }

    let mut marks = HashMap::new();
    for id in records.keys() {
        let mut path = Vec::new();
        if let Some(cycle) = visit(id, records, &mut marks, &mut path) {
            return Some(cycle);
        }
    }
    None
}

/// Kahn's algorithm with `(app, name)` ordering among ready records.
fn topological_sort(
    records: &BTreeMap<MigrationId, MigrationRecord>,
    children: &BTreeMap<MigrationId, BTreeSet<MigrationId>>,
) -> Vec<MigrationId> {
    let mut remaining: HashMap<&MigrationId, usize> = records
        .iter()
        .map(|(id, r)| {
            let distinct: BTreeSet<&MigrationId> = r.dependencies.iter().collect();
            (id, distinct.len())
        })
        .collect();

    let mut ready: BTreeSet<&MigrationId> = remaining
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut order = Vec::with_capacity(records.len());
    while let Some(next) = ready.pop_first() {
        order.push(next.clone());
        if let Some(kids) = children.get(next) {
            for child in kids {
                if let Some(n) = remaining.get_mut(child) {
                    *n -= 1;
                    if *n == 0 {
                        ready.insert(child);
                    }
                }
            }
        }
    }
    order
}
