//! Local metadata of objects uploaded to the storage provider.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use driveline_common::{Container, Result, Subject};

use crate::db::Database;

/// Metadata of one uploaded object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredObject {
    /// Local row id.
    pub id: i64,
    /// Provider-assigned object id.
    pub remote_object_id: String,
    /// Filename within the container.
    pub logical_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub uploaded_at: DateTime<Utc>,
    /// Who uploaded the latest content.
    pub uploader: String,
    /// Identity whose credential reaches the remote object.
    pub owner: Subject,
    /// Product or order the object is attached to.
    pub container: Container,
}

/// Fields written by an upload.
#[derive(Debug, Clone)]
pub struct NewStoredObject {
    pub remote_object_id: String,
    pub logical_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub uploaded_at: DateTime<Utc>,
    pub uploader: String,
    pub owner: Subject,
    pub container: Container,
}

const COLUMNS: &str = "id, remote_object_id, logical_name, mime_type, size_bytes, uploaded_at, \
                       uploader, owner, container_kind, container_id";

fn conversion_err(column: usize, e: driveline_common::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
}

fn row_to_object(row: &Row<'_>) -> rusqlite::Result<StoredObject> {
    let size: i64 = row.get(4)?;
    let uploaded_ms: i64 = row.get(5)?;
    let owner: String = row.get(7)?;
    let kind: String = row.get(8)?;

    Ok(StoredObject {
        id: row.get(0)?,
        remote_object_id: row.get(1)?,
        logical_name: row.get(2)?,
        mime_type: row.get(3)?,
        size_bytes: u64::try_from(size).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(4, size))?,
        uploaded_at: DateTime::from_timestamp_millis(uploaded_ms)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(5, uploaded_ms))?,
        uploader: row.get(6)?,
        owner: Subject::from_key(&owner).map_err(|e| conversion_err(7, e))?,
        container: Container::new(kind.parse().map_err(|e| conversion_err(8, e))?, row.get(9)?),
    })
}

/// Stored object table access.
#[derive(Clone)]
pub struct MetadataIndex {
    db: Arc<Database>,
}

impl MetadataIndex {
    /// Create an index over a shared database.
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Look up an object by its provider id.
    pub fn find_by_remote_id(&self, remote_object_id: &str) -> Result<Option<StoredObject>> {
        let sql = format!("SELECT {} FROM stored_objects WHERE remote_object_id = ?1", COLUMNS);
        self.db.with_conn(|conn| {
            conn.query_row(&sql, [remote_object_id], row_to_object)
                .optional()
        })
    }

    /// Look up an object by filename within a container.
    pub fn find_by_name(&self, container: &Container, logical_name: &str) -> Result<Option<StoredObject>> {
        let sql = format!(
            "SELECT {} FROM stored_objects \
             WHERE container_kind = ?1 AND container_id = ?2 AND logical_name = ?3",
            COLUMNS
        );
        self.db.with_conn(|conn| {
            conn.query_row(
                &sql,
                params![container.kind.as_str(), container.id, logical_name],
                row_to_object,
            )
            .optional()
        })
    }

    /// Insert the object, or replace the mutable fields of the row with the
    /// same container and filename, in one statement.
    ///
    /// # Errors
    /// - `Database` if the remote id already belongs to another row
    pub fn upsert(&self, object: &NewStoredObject) -> Result<StoredObject> {
        let size = i64::try_from(object.size_bytes).map_err(|_| {
            driveline_common::Error::InvalidInput(format!("Object too large: {} bytes", object.size_bytes))
        })?;
        let sql = format!(
            r#"
            INSERT INTO stored_objects
                (remote_object_id, logical_name, mime_type, size_bytes, uploaded_at,
                 uploader, owner, container_kind, container_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(container_kind, container_id, logical_name) DO UPDATE SET
                remote_object_id = excluded.remote_object_id,
                mime_type = excluded.mime_type,
                size_bytes = excluded.size_bytes,
                uploaded_at = excluded.uploaded_at,
                uploader = excluded.uploader,
                owner = excluded.owner
            RETURNING {}
            "#,
            COLUMNS
        );

        let stored = self.db.with_conn(|conn| {
            conn.query_row(
                &sql,
                params![
                    object.remote_object_id,
                    object.logical_name,
                    object.mime_type,
                    size,
                    object.uploaded_at.timestamp_millis(),
                    object.uploader,
                    object.owner.key(),
                    object.container.kind.as_str(),
                    object.container.id,
                ],
                row_to_object,
            )
        })?;

        debug!(
            remote_id = %stored.remote_object_id,
            container = %stored.container,
            name = %stored.logical_name,
            "Indexed object"
        );
        Ok(stored)
    }

    /// All objects of a container, ordered by filename.
    pub fn list_container(&self, container: &Container) -> Result<Vec<StoredObject>> {
        let sql = format!(
            "SELECT {} FROM stored_objects \
             WHERE container_kind = ?1 AND container_id = ?2 ORDER BY logical_name",
            COLUMNS
        );
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![container.kind.as_str(), container.id], row_to_object)?;
            rows.collect()
        })
    }

    /// Drop the row of a remote object.
    ///
    /// # Returns
    /// `true` if a row existed.
    pub fn delete_by_remote_id(&self, remote_object_id: &str) -> Result<bool> {
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM stored_objects WHERE remote_object_id = ?1",
                [remote_object_id],
            )
        })?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driveline_common::Error;

    fn index() -> MetadataIndex {
        MetadataIndex::new(Arc::new(Database::in_memory().unwrap()))
    }

    fn new_object(remote_id: &str, container: Container, name: &str, size: u64) -> NewStoredObject {
        NewStoredObject {
            remote_object_id: remote_id.to_string(),
            logical_name: name.to_string(),
            mime_type: "image/png".to_string(),
            size_bytes: size,
            uploaded_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            uploader: "user-9".to_string(),
            owner: Subject::Service,
            container,
        }
    }

    #[test]
    fn test_insert_and_find() {
        let index = index();
        let stored = index
            .upsert(&new_object("r1", Container::product(42), "x.png", 10))
            .unwrap();

        assert_eq!(stored.remote_object_id, "r1");
        assert_eq!(stored.container, Container::product(42));
        assert_eq!(index.find_by_remote_id("r1").unwrap(), Some(stored.clone()));
        assert_eq!(
            index.find_by_name(&Container::product(42), "x.png").unwrap(),
            Some(stored)
        );
        assert!(index.find_by_remote_id("missing").unwrap().is_none());
    }

    #[test]
    fn test_upsert_same_name_updates_in_place() {
        let index = index();
        let first = index
            .upsert(&new_object("r1", Container::product(42), "x.png", 10))
            .unwrap();

        let mut again = new_object("r1", Container::product(42), "x.png", 99);
        again.mime_type = "image/jpeg".to_string();
        again.uploader = "user-7".to_string();
        let second = index.upsert(&again).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.size_bytes, 99);
        assert_eq!(second.mime_type, "image/jpeg");
        assert_eq!(second.uploader, "user-7");
        assert_eq!(index.list_container(&Container::product(42)).unwrap().len(), 1);
    }

    #[test]
    fn test_same_name_in_other_container_is_distinct() {
        let index = index();
        index.upsert(&new_object("r1", Container::product(42), "x.png", 1)).unwrap();
        index.upsert(&new_object("r2", Container::order(42), "x.png", 1)).unwrap();
        index.upsert(&new_object("r3", Container::product(43), "x.png", 1)).unwrap();

        assert_eq!(index.list_container(&Container::product(42)).unwrap().len(), 1);
        assert_eq!(index.list_container(&Container::order(42)).unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_remote_id_rejected() {
        let index = index();
        index.upsert(&new_object("r1", Container::product(42), "x.png", 1)).unwrap();

        let result = index.upsert(&new_object("r1", Container::product(42), "y.png", 1));
        assert!(matches!(result, Err(Error::Database(_))));
    }

    #[test]
    fn test_list_container_sorted_by_name() {
        let index = index();
        let container = Container::order(7);
        index.upsert(&new_object("r1", container, "b.pdf", 1)).unwrap();
        index.upsert(&new_object("r2", container, "a.pdf", 1)).unwrap();

        let names: Vec<String> = index
            .list_container(&container)
            .unwrap()
            .into_iter()
            .map(|o| o.logical_name)
            .collect();
        assert_eq!(names, vec!["a.pdf", "b.pdf"]);
        assert!(index.list_container(&Container::order(8)).unwrap().is_empty());
    }

    #[test]
    fn test_delete_by_remote_id() {
        let index = index();
        index.upsert(&new_object("r1", Container::product(1), "x.png", 1)).unwrap();

        assert!(index.delete_by_remote_id("r1").unwrap());
        assert!(!index.delete_by_remote_id("r1").unwrap());
        assert!(index.find_by_remote_id("r1").unwrap().is_none());
    }

    #[test]
    fn test_owner_roundtrip() {
        let index = index();
        let mut object = new_object("r1", Container::product(1), "x.png", 1);
        object.owner = Subject::user("user-9").unwrap();

        let stored = index.upsert(&object).unwrap();
        assert_eq!(stored.owner, Subject::User("user-9".to_string()));
    }
}
