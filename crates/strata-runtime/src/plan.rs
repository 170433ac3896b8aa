use std::collections::{BTreeSet, HashSet};
use std::fmt;

use strata_core::error::{Result, StrataError};
use strata_core::migration::{MigrationGraph, MigrationId};

/// Where a run should leave the schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationTarget {
    /// Apply every pending record.
    Latest,
    /// Leave exactly `id` and its ancestors applied within its namespace.
    To(MigrationId),
    /// Unapply every record of a namespace.
    Zero(String),
}

impl fmt::Display for MigrationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationTarget::Latest => write!(f, "latest"),
            MigrationTarget::To(id) => write!(f, "{}", id),
            MigrationTarget::Zero(app) => write!(f, "{}.zero", app),
        }
    }
}

/// Direction of a plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forwards,
    Backwards,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    pub id: MigrationId,
    pub direction: Direction,
}

impl PlanStep {
    pub fn forwards(id: MigrationId) -> Self {
        Self {
            id,
            direction: Direction::Forwards,
        }
    }

    pub fn backwards(id: MigrationId) -> Self {
        Self {
            id,
            direction: Direction::Backwards,
        }
    }

    pub fn is_backwards(&self) -> bool {
        self.direction == Direction::Backwards
    }
}

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            Direction::Forwards => write!(f, "Apply {}", self.id),
            Direction::Backwards => write!(f, "Unapply {}", self.id),
        }
    }
}

/// Ordered steps that move the applied set to a target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationPlan {
    pub steps: Vec<PlanStep>,
}

impl MigrationPlan {
    /// Compute the steps needed to reach `target` from `applied`.
    ///
    /// Forward steps follow the graph's topological order, backward steps the
    /// reverse of it. Applied ids unknown to the graph are ignored.
    pub fn build(
        graph: &MigrationGraph,
        applied: &HashSet<MigrationId>,
        target: &MigrationTarget,
    ) -> Result<Self> {
        let steps = match target {
            MigrationTarget::Latest => graph
                .topological_order()
                .iter()
                .filter(|id| !applied.contains(*id))
                .cloned()
                .map(PlanStep::forwards)
                .collect(),

            MigrationTarget::To(id) => {
                graph.record(id)?;
                if applied.contains(id) {
                    let roots = graph.children(id).filter(|c| c.app == id.app).cloned();
                    backwards_from(graph, applied, roots)
                } else {
                    graph
                        .forwards_plan(id)?
                        .into_iter()
                        .filter(|step| !applied.contains(step))
                        .map(PlanStep::forwards)
                        .collect()
                }
            }

            MigrationTarget::Zero(app) => {
                if !graph.apps().contains(app) {
                    return Err(StrataError::NotFound(format!(
                        "no migrations for app '{}'",
                        app
                    )));
                }
                let roots = graph
                    .topological_order()
                    .iter()
                    .filter(|id| &id.app == app)
                    .cloned();
                backwards_from(graph, applied, roots)
            }
        };
        Ok(Self { steps })
    }

    /// Unapply the `count` most recently applied records (by graph order)
    /// together with their applied descendants.
    pub fn rollback_last(graph: &MigrationGraph, applied: &HashSet<MigrationId>, count: usize) -> Self {
        let roots = graph
            .topological_order()
            .iter()
            .rev()
            .filter(|id| applied.contains(*id))
            .take(count)
            .cloned()
            .collect::<Vec<_>>();
        Self {
            steps: backwards_from(graph, applied, roots),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn forwards(&self) -> impl Iterator<Item = &MigrationId> {
        self.steps
            .iter()
            .filter(|s| !s.is_backwards())
            .map(|s| &s.id)
    }

    pub fn backwards(&self) -> impl Iterator<Item = &MigrationId> {
        self.steps
            .iter()
            .filter(|s| s.is_backwards())
            .map(|s| &s.id)
    }
}

/// Applied members of `roots` and their applied descendants, newest first.
fn backwards_from(
    graph: &MigrationGraph,
    applied: &HashSet<MigrationId>,
    roots: impl IntoIterator<Item = MigrationId>,
) -> Vec<PlanStep> {
    let mut wanted = BTreeSet::new();
    for root in roots {
        if !applied.contains(&root) {
            continue;
        }
        wanted.extend(
            graph
                .descendants(&root)
                .into_iter()
                .filter(|d| applied.contains(d)),
        );
        wanted.insert(root);
    }
    let mut order = graph.in_order(&wanted);
    order.reverse();
    order.into_iter().map(PlanStep::backwards).collect()
}
