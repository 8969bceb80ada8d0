use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, trace};

use super::failure::DispatchFailure;
use super::index_writer::IndexWriter;
use super::payload::{ChangeKind, ChangePayload, EntityReference};
use crate::error::PayloadError;
use crate::store::OutboxEvent;

/// Net change to apply to one entity, standing for every batch event on it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityWork {
    pub entity: EntityReference,
    pub kind: ChangeKind,
    /// Document carried by the latest event.
    pub document: Vec<u8>,
    /// Outbox rows this work accounts for, ascending.
    pub event_ids: Vec<u64>,
}

#[derive(Debug)]
struct Rejected {
    entity: EntityReference,
    event_ids: Vec<u64>,
    cause: Arc<PayloadError>,
}

/// Coalesced operations for one batch. Built in memory, never persisted.
#[derive(Debug, Default)]
pub struct ProcessingPlan {
    works: Vec<EntityWork>,
    rejected: Vec<Rejected>,
}

impl ProcessingPlan {
    /// Group `events` by entity, in order of first appearance, and fold each
    /// group into a single net operation.
    ///
    /// An entity with an undecodable event is not dispatched at all: every
    /// event on it is reported as failed.
    pub fn build(events: &[OutboxEvent]) -> Self {
        let mut order: Vec<EntityReference> = Vec::new();
        let mut groups: HashMap<EntityReference, Vec<&OutboxEvent>> = HashMap::new();
        for event in events {
            let entity = EntityReference::new(&event.entity_name, &event.entity_id);
            groups
                .entry(entity.clone())
                .or_insert_with(|| {
                    order.push(entity);
                    Vec::new()
                })
                .push(event);
        }

        let mut plan = ProcessingPlan::default();
        for entity in order {
            let Some(mut group) = groups.remove(&entity) else {
                continue;
            };
            group.sort_by_key(|e| e.id);
            let event_ids: Vec<u64> = group.iter().map(|e| e.id).collect();

            match coalesce(&group) {
                Ok((kind, document)) => plan.works.push(EntityWork {
                    entity,
                    kind,
                    document,
                    event_ids,
                }),
                Err(cause) => plan.rejected.push(Rejected {
                    entity,
                    event_ids,
                    cause: Arc::new(cause),
                }),
            }
        }
        plan
    }

    pub fn works(&self) -> &[EntityWork] {
        &self.works
    }

    pub fn is_empty(&self) -> bool {
        self.works.is_empty() && self.rejected.is_empty()
    }

    /// Execute every work item, isolating failures per entity.
    pub fn dispatch(&self, writer: &dyn IndexWriter) -> DispatchReport {
        let mut report = DispatchReport::default();

        for rejected in &self.rejected {
            debug!(entity = %rejected.entity, "skipping entity with undecodable payload");
            let failure = DispatchFailure {
                entity: rejected.entity.clone(),
                operation: format!("decode payload of {}", rejected.entity),
                cause: rejected.cause.clone(),
            };
            report.fail(&rejected.event_ids, failure);
        }

        for work in &self.works {
            match writer.execute(work) {
                Ok(()) => {
                    trace!(entity = %work.entity, kind = %work.kind, "indexed");
                    report.succeeded.extend(work.event_ids.iter().copied());
                }
                Err(err) => {
                    debug!(entity = %work.entity, kind = %work.kind, error = %err, "index write failed");
                    let failure = DispatchFailure {
                        entity: work.entity.clone(),
                        operation: format!("{} {}", work.kind, work.entity),
                        cause: Arc::from(err),
                    };
                    report.fail(&work.event_ids, failure);
                }
            }
        }

        report
    }
}

fn coalesce(group: &[&OutboxEvent]) -> Result<(ChangeKind, Vec<u8>), PayloadError> {
    let mut net: Option<ChangeKind> = None;
    let mut document = Vec::new();
    for event in group {
        let payload = ChangePayload::decode(&event.payload)?;
        net = Some(match net {
            None => payload.kind,
            Some(earlier) => earlier.then(payload.kind),
        });
        document = payload.document;
    }
    // groups are never empty
    Ok((net.unwrap_or(ChangeKind::Update), document))
}

/// Per-event outcome of dispatching a plan.
#[derive(Debug, Default, Clone)]
pub struct DispatchReport {
    succeeded: BTreeSet<u64>,
    failures: HashMap<u64, DispatchFailure>,
}

impl DispatchReport {
    fn fail(&mut self, event_ids: &[u64], failure: DispatchFailure) {
        for id in event_ids {
            self.failures.insert(*id, failure.clone());
        }
    }

    pub fn failure(&self, event_id: u64) -> Option<&DispatchFailure> {
        self.failures.get(&event_id)
    }

    pub fn is_success(&self, event_id: u64) -> bool {
        self.succeeded.contains(&event_id)
    }

    pub fn succeeded_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failures.len()
    }
}
