//! Pure state materialisation.
//!
//! A reducer folds one event into the prior snapshot of its entity. It does
//! no I/O and never reads the clock: every timestamp comes from the event.
//! Event types a family does not recognise still advance the bookkeeping
//! fields (`last_event_id`, `updated_at`) but change nothing else; the caller
//! decides how to surface that through [`Disposition`].

use crate::core::events::{Event, EventId};
use crate::storage::layout::EntityKind;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

/// Errors raised while folding an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReduceError {
    #[error("Event {event_id} ({kind}) has no prior state and is not a creation event")]
    MissingCreation { event_id: EventId, kind: String },
    #[error("Creation event {event_id} applied to existing entity '{entity_id}'")]
    AlreadyCreated { entity_id: String, event_id: EventId },
    #[error("Event {event_id} ({kind}) carries invalid data: {reason}")]
    InvalidData {
        event_id: EventId,
        kind: String,
        reason: String,
    },
    #[error("Event {event_id} belongs to '{found}', not '{expected}'")]
    EntityMismatch {
        event_id: EventId,
        expected: String,
        found: String,
    },
}

/// How an event was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// A known event type changed domain state.
    Applied,
    /// An `ext.*` event; recorded, no domain change.
    Extension,
    /// An unrecognised type; recorded, no domain change, worth a warning.
    Unknown(String),
}

/// Result of folding one event.
#[derive(Debug, Clone)]
pub struct Reduced<S> {
    pub snapshot: S,
    pub disposition: Disposition,
}

/// Materialised state of one entity.
pub trait EntitySnapshot:
    Clone + PartialEq + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn id(&self) -> &str;

    fn last_event_id(&self) -> &EventId;

    /// Advances the bookkeeping fields to `event`.
    fn touch(&mut self, event: &Event);
}

/// Folds events of one entity family.
pub trait Reducer {
    type Snapshot: EntitySnapshot;

    /// Family whose files this reducer owns.
    const KIND: EntityKind;

    /// Returns true for the family's creation type.
    fn is_creation(kind: &str) -> bool;

    /// Returns true for types mirrored into the lifecycle log.
    fn is_lifecycle(kind: &str) -> bool;

    /// Builds the first snapshot from a creation event.
    ///
    /// # Errors
    /// Returns [`ReduceError::InvalidData`] when the payload is malformed.
    fn create(event: &Event) -> Result<Self::Snapshot, ReduceError>;

    /// Folds a non-creation event into `snapshot`.
    ///
    /// # Errors
    /// Returns [`ReduceError::InvalidData`] when the payload is malformed.
    fn fold(snapshot: &mut Self::Snapshot, event: &Event) -> Result<Disposition, ReduceError>;

    /// `(prior, event) -> next`.
    ///
    /// # Errors
    /// Fails when a non-creation event arrives without prior state, when a
    /// creation event arrives with prior state, when the event names a
    /// different entity, or when the payload is malformed.
    fn apply(
        prior: Option<Self::Snapshot>,
        event: &Event,
    ) -> Result<Reduced<Self::Snapshot>, ReduceError> {
        match prior {
            None => {
                if !Self::is_creation(&event.kind) {
                    return Err(ReduceError::MissingCreation {
                        event_id: event.id.clone(),
                        kind: event.kind.clone(),
                    });
                }
                let mut snapshot = Self::create(event)?;
                snapshot.touch(event);
                Ok(Reduced {
                    snapshot,
                    disposition: Disposition::Applied,
                })
            }
            Some(mut snapshot) => {
                if snapshot.id() != event.entity_id {
                    return Err(ReduceError::EntityMismatch {
                        event_id: event.id.clone(),
                        expected: snapshot.id().to_string(),
                        found: event.entity_id.clone(),
                    });
                }
                if Self::is_creation(&event.kind) {
                    return Err(ReduceError::AlreadyCreated {
                        entity_id: event.entity_id.clone(),
                        event_id: event.id.clone(),
                    });
                }
                let disposition = Self::fold(&mut snapshot, event)?;
                snapshot.touch(event);
                Ok(Reduced {
                    snapshot,
                    disposition,
                })
            }
        }
    }
}

/// Decodes an event's `data` into a typed payload.
///
/// # Errors
/// Returns [`ReduceError::InvalidData`] with the JSON error as the reason.
pub fn decode_data<T: DeserializeOwned>(event: &Event) -> Result<T, ReduceError> {
    T::deserialize(&event.data).map_err(|e| ReduceError::InvalidData {
        event_id: event.id.clone(),
        kind: event.kind.clone(),
        reason: e.to_string(),
    })
}

/// Logs the disposition of a folded event.
pub fn log_disposition(disposition: &Disposition, event: &Event) {
    if let Disposition::Unknown(kind) = disposition {
        warn!(
            event_id = %event.id,
            entity_id = %event.entity_id,
            kind = %kind,
            "unknown event type recorded without state change"
        );
    }
}

/// Folds a whole log from empty state, in log order.
///
/// Returns `None` for an empty log.
///
/// # Errors
/// Propagates the first [`ReduceError`].
pub fn replay<R: Reducer>(events: &[Event]) -> Result<Option<R::Snapshot>, ReduceError> {
    let mut state: Option<R::Snapshot> = None;
    for event in events {
        let reduced = R::apply(state.take(), event)?;
        log_disposition(&reduced.disposition, event);
        state = Some(reduced.snapshot);
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        id: String,
        value: i64,
        last_event_id: EventId,
    }

    impl EntitySnapshot for Counter {
        fn id(&self) -> &str {
            &self.id
        }

        fn last_event_id(&self) -> &EventId {
            &self.last_event_id
        }

        fn touch(&mut self, event: &Event) {
            self.last_event_id = event.id.clone();
        }
    }

    struct CounterReducer;

    impl Reducer for CounterReducer {
        type Snapshot = Counter;
        const KIND: EntityKind = EntityKind::Task;

        fn is_creation(kind: &str) -> bool {
            kind == "counter.created"
        }

        fn is_lifecycle(kind: &str) -> bool {
            Self::is_creation(kind)
        }

        fn create(event: &Event) -> Result<Counter, ReduceError> {
            Ok(Counter {
                id: event.entity_id.clone(),
                value: 0,
                last_event_id: event.id.clone(),
            })
        }

        fn fold(snapshot: &mut Counter, event: &Event) -> Result<Disposition, ReduceError> {
            match event.kind.as_str() {
                "counter.added" => {
                    #[derive(Deserialize)]
                    struct Added {
                        by: i64,
                    }
                    snapshot.value += decode_data::<Added>(event)?.by;
                    Ok(Disposition::Applied)
                }
                kind if kind.starts_with("ext.") => Ok(Disposition::Extension),
                other => Ok(Disposition::Unknown(other.to_string())),
            }
        }
    }

    fn ev(kind: &str, data: serde_json::Value) -> Event {
        Event::new("c1", kind, "tester", data)
    }

    #[test]
    fn replay_folds_in_log_order() {
        let events = vec![
            ev("counter.created", json!({})),
            ev("counter.added", json!({"by": 2})),
            ev("counter.added", json!({"by": 5})),
        ];
        let state = replay::<CounterReducer>(&events).unwrap().unwrap();
        assert_eq!(state.value, 7);
        assert_eq!(state.last_event_id, events[2].id);
    }

    #[test]
    fn missing_creation_is_rejected() {
        let err = CounterReducer::apply(None, &ev("counter.added", json!({"by": 1}))).unwrap_err();
        assert!(matches!(err, ReduceError::MissingCreation { .. }));
    }

    #[test]
    fn creation_over_existing_state_is_rejected() {
        let created = CounterReducer::apply(None, &ev("counter.created", json!({}))).unwrap();
        let err = CounterReducer::apply(Some(created.snapshot), &ev("counter.created", json!({})))
            .unwrap_err();
        assert!(matches!(err, ReduceError::AlreadyCreated { .. }));
    }

    #[test]
    fn unknown_types_only_move_bookkeeping() {
        let created = CounterReducer::apply(None, &ev("counter.created", json!({}))).unwrap();
        let mystery = ev("counter.squared", json!({}));
        let reduced = CounterReducer::apply(Some(created.snapshot.clone()), &mystery).unwrap();

        assert_eq!(reduced.disposition, Disposition::Unknown("counter.squared".to_string()));
        assert_eq!(reduced.snapshot.value, created.snapshot.value);
        assert_eq!(reduced.snapshot.last_event_id, mystery.id);

        let ext = CounterReducer::apply(Some(reduced.snapshot), &ev("ext.audit", json!({}))).unwrap();
        assert_eq!(ext.disposition, Disposition::Extension);
    }

    #[test]
    fn foreign_entity_is_rejected() {
        let created = CounterReducer::apply(None, &ev("counter.created", json!({}))).unwrap();
        let foreign = Event::new("c2", "counter.added", "tester", json!({"by": 1}));
        let err = CounterReducer::apply(Some(created.snapshot), &foreign).unwrap_err();
        assert!(matches!(err, ReduceError::EntityMismatch { .. }));
    }

    #[test]
    fn malformed_payload_is_invalid_data() {
        let created = CounterReducer::apply(None, &ev("counter.created", json!({}))).unwrap();
        let err = CounterReducer::apply(Some(created.snapshot), &ev("counter.added", json!({"by": "x"})))
            .unwrap_err();
        assert!(matches!(err, ReduceError::InvalidData { .. }));
    }
}
