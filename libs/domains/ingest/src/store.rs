//! The [`ingest_core::Store`] implementation backed by Postgres.

use async_trait::async_trait;
use ingest_core::{classify, ErrorKind, ProcessingError, Store, StoreError};
use sea_orm::sea_query::OnConflict;
use sea_orm::{ActiveValue::Set, DatabaseConnection, DbErr, EntityTrait, SqlErr};
use tracing::debug;
use uuid::Uuid;

use crate::entity::{self, Entity as Events};

/// Persists decoded events into the `events` table.
///
/// Idempotent on `event_id`: a second insert of an already-seen event is a
/// silent no-op via `ON CONFLICT (event_id) DO NOTHING`, which is what lets
/// the processing loop commit an offset and later redeliver the same record
/// without double-counting it.
#[derive(Clone)]
pub struct PostgresStore {
    db: DatabaseConnection,
}

impl PostgresStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn insert_event(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &[u8],
    ) -> Result<(), StoreError> {
        let uuid = Uuid::parse_str(event_id)
            .map_err(|e| ProcessingError::permanent(format!("event_id is not a valid UUID: {e}")))?;

        let payload: serde_json::Value = serde_json::from_slice(payload).map_err(|e| {
            ProcessingError::permanent(format!("event payload is not valid JSON: {e}"))
        })?;

        let active_model = entity::ActiveModel {
            event_id: Set(uuid),
            event_type: Set(event_type.to_string()),
            payload: Set(payload),
            inserted_at: Set(chrono::Utc::now().into()),
        };

        let result = Events::insert(active_model)
            .on_conflict(
                OnConflict::column(entity::Column::EventId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec(&self.db)
            .await;

        match result {
            Ok(_) => Ok(()),
            // SeaORM reports a `do_nothing` conflict that touched zero rows
            // as this error rather than a successful no-op insert.
            Err(DbErr::RecordNotInserted) => {
                debug!(event_id, "event already present, skipping duplicate insert");
                Ok(())
            }
            Err(e) => Err(db_err_to_processing_error(e)),
        }
    }
}

/// Classifies via SeaORM's own SQLSTATE-derived `sql_err()` when it
/// recognizes a constraint violation, falling back to the generic
/// substring classifier for everything else (connection faults, check
/// constraints, bad input syntax) SeaORM doesn't surface as a `SqlErr`.
fn db_err_to_processing_error(err: DbErr) -> StoreError {
    let kind = match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) | Some(SqlErr::ForeignKeyConstraintViolation(_)) => {
            ErrorKind::Permanent
        }
        _ => classify(&err),
    };
    let message = err.to_string();
    StoreError::Processing(ProcessingError::new(kind, message).with_cause(err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unparseable_event_id_is_a_permanent_processing_error() {
        let result = Uuid::parse_str("not-a-uuid");
        assert!(result.is_err());
    }

    #[test]
    fn record_not_found_classifies_as_permanent_via_string_fallback() {
        let err = DbErr::RecordNotFound("events".to_string());
        let StoreError::Processing(p) = db_err_to_processing_error(err);
        // No SqlErr available for this variant; falls back to the generic
        // classifier, which defaults unrecognized errors to transient.
        assert_eq!(p.kind, ErrorKind::Transient);
    }

    #[tokio::test]
    #[ignore] // requires Docker
    async fn duplicate_event_id_is_a_silent_no_op() {
        let db = test_utils::TestDatabase::new().await;
        let store = PostgresStore::new(db.connection());

        let event_id = "3f1b6f0a-6e21-4f1e-8a7e-1f9c9a6f0a10";
        let payload = br#"{"amount":99}"#;

        store.insert_event(event_id, "purchase", payload).await.unwrap();
        store.insert_event(event_id, "purchase", payload).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // requires Docker
    async fn invalid_payload_json_is_a_permanent_error() {
        let db = test_utils::TestDatabase::new().await;
        let store = PostgresStore::new(db.connection());

        let result = store
            .insert_event("3f1b6f0a-6e21-4f1e-8a7e-1f9c9a6f0a10", "purchase", b"{not-json}")
            .await;

        assert!(matches!(result, Err(StoreError::Processing(p)) if p.kind == ErrorKind::Permanent));
    }
}
