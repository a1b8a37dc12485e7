//! SQLite storage for users, face samples, places and recognition events.
//!
//! Schema:
//! - users: id, name, created_at
//! - face_samples: user_id -> image_path
//! - places: id, name, description
//! - recognition_events: user_id, place_id, timestamp, image_path, confidence
//!
//! Timestamps are stored as RFC 3339 text in UTC.

use chrono::{DateTime, SecondsFormat, Utc};
use facewatch_core::ports::{Datastore, PortError};
use facewatch_core::types::{Identity, IdentityId, ImageRef, RecognitionEvent};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS face_samples (
    id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL,
    image_path TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS places (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT
);

CREATE TABLE IF NOT EXISTS recognition_events (
    id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL,
    place_id INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    image_path TEXT NOT NULL,
    confidence REAL,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (place_id) REFERENCES places(id)
);

CREATE INDEX IF NOT EXISTS idx_face_samples_user ON face_samples(user_id);
CREATE INDEX IF NOT EXISTS idx_events_user ON recognition_events(user_id);
CREATE INDEX IF NOT EXISTS idx_events_place ON recognition_events(place_id);
CREATE INDEX IF NOT EXISTS idx_events_timestamp ON recognition_events(timestamp);
";

const EVENT_COLUMNS: &str = "id, user_id, place_id, timestamp, image_path, confidence";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn identity(&self) -> Identity {
        Identity { id: IdentityId(self.id), name: self.name.clone() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceSample {
    pub id: i64,
    pub user_id: i64,
    pub image_path: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Place {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub id: i64,
    pub user_id: i64,
    pub place_id: i64,
    pub timestamp: DateTime<Utc>,
    pub image_path: String,
    pub confidence: Option<f32>,
}

/// Database connection wrapper.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;",
        )?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(path = %path.display(), "database opened");
        Ok(Self { conn })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    // Users

    pub fn add_user(&self, name: &str) -> Result<User, StoreError> {
        let created_at = Utc::now();
        self.conn.execute(
            "INSERT INTO users (name, created_at) VALUES (?1, ?2)",
            params![name, to_text(&created_at)],
        )?;
        let id = self.conn.last_insert_rowid();
        tracing::info!(user_id = id, name, "user added");
        Ok(User { id, name: name.to_string(), created_at })
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, created_at FROM users WHERE id = ?1",
                params![id],
                user_from_row,
            )
            .optional()?)
    }

    /// First user with exactly this name.
    pub fn find_user(&self, name: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, created_at FROM users WHERE name = ?1 ORDER BY id LIMIT 1",
                params![name],
                user_from_row,
            )
            .optional()?)
    }

    pub fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, created_at FROM users ORDER BY id")?;
        let users = stmt
            .query_map([], user_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    pub fn rename_user(&self, id: i64, name: &str) -> Result<User, StoreError> {
        let rows = self
            .conn
            .execute("UPDATE users SET name = ?1 WHERE id = ?2", params![name, id])?;
        if rows == 0 {
            return Err(StoreError::NotFound { kind: "user", id });
        }
        self.get_user(id)?
            .ok_or(StoreError::NotFound { kind: "user", id })
    }

    // Face samples

    pub fn add_face_sample(&self, user_id: i64, image_path: &str) -> Result<FaceSample, StoreError> {
        if self.get_user(user_id)?.is_none() {
            return Err(StoreError::NotFound { kind: "user", id: user_id });
        }
        let created_at = Utc::now();
        self.conn.execute(
            "INSERT INTO face_samples (user_id, image_path, created_at) VALUES (?1, ?2, ?3)",
            params![user_id, image_path, to_text(&created_at)],
        )?;
        Ok(FaceSample {
            id: self.conn.last_insert_rowid(),
            user_id,
            image_path: image_path.to_string(),
            created_at,
        })
    }

    pub fn list_face_samples(&self, user_id: i64) -> Result<Vec<FaceSample>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, image_path, created_at FROM face_samples WHERE user_id = ?1 ORDER BY id",
        )?;
        let samples = stmt
            .query_map(params![user_id], |row| {
                Ok(FaceSample {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    image_path: row.get(2)?,
                    created_at: timestamp_at(row, 3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(samples)
    }

    pub fn count_face_samples(&self, user_id: i64) -> Result<usize, StoreError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM face_samples WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    // Places

    pub fn add_place(&self, name: &str, description: Option<&str>) -> Result<Place, StoreError> {
        self.conn.execute(
            "INSERT INTO places (name, description) VALUES (?1, ?2)",
            params![name, description],
        )?;
        let id = self.conn.last_insert_rowid();
        tracing::info!(place_id = id, name, "place added");
        Ok(Place {
            id,
            name: name.to_string(),
            description: description.map(str::to_string),
        })
    }

    pub fn get_place(&self, id: i64) -> Result<Option<Place>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, description FROM places WHERE id = ?1",
                params![id],
                place_from_row,
            )
            .optional()?)
    }

    pub fn list_places(&self) -> Result<Vec<Place>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, description FROM places ORDER BY id")?;
        let places = stmt
            .query_map([], place_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(places)
    }

    /// Change a place's name and/or description; `None` leaves a field as is.
    pub fn update_place(
        &self,
        id: i64,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<Place, StoreError> {
        let rows = self.conn.execute(
            "UPDATE places SET name = COALESCE(?1, name), description = COALESCE(?2, description) WHERE id = ?3",
            params![name, description, id],
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound { kind: "place", id });
        }
        self.get_place(id)?
            .ok_or(StoreError::NotFound { kind: "place", id })
    }

    /// The place called `name`, created if it does not exist yet.
    pub fn ensure_place(&self, name: &str) -> Result<Place, StoreError> {
        let existing = self
            .conn
            .query_row(
                "SELECT id, name, description FROM places WHERE name = ?1 ORDER BY id LIMIT 1",
                params![name],
                place_from_row,
            )
            .optional()?;
        match existing {
            Some(place) => Ok(place),
            None => self.add_place(name, Some("Default recognition location")),
        }
    }

    // Recognition events

    pub fn add_event(
        &self,
        user_id: i64,
        place_id: i64,
        image_path: &str,
        confidence: Option<f32>,
    ) -> Result<EventRecord, StoreError> {
        let timestamp = Utc::now();
        self.conn.execute(
            "INSERT INTO recognition_events (user_id, place_id, timestamp, image_path, confidence)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, place_id, to_text(&timestamp), image_path, confidence.map(f64::from)],
        )?;
        Ok(EventRecord {
            id: self.conn.last_insert_rowid(),
            user_id,
            place_id,
            timestamp,
            image_path: image_path.to_string(),
            confidence,
        })
    }

    /// A user's events, newest first.
    pub fn events_for_user(&self, user_id: i64) -> Result<Vec<EventRecord>, StoreError> {
        self.query_events(
            &format!("SELECT {EVENT_COLUMNS} FROM recognition_events WHERE user_id = ?1 ORDER BY timestamp DESC, id DESC"),
            params![user_id],
        )
    }

    /// Events at a place, newest first.
    pub fn events_at_place(&self, place_id: i64) -> Result<Vec<EventRecord>, StoreError> {
        self.query_events(
            &format!("SELECT {EVENT_COLUMNS} FROM recognition_events WHERE place_id = ?1 ORDER BY timestamp DESC, id DESC"),
            params![place_id],
        )
    }

    /// The `limit` most recent events.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<EventRecord>, StoreError> {
        self.query_events(
            &format!("SELECT {EVENT_COLUMNS} FROM recognition_events ORDER BY timestamp DESC, id DESC LIMIT ?1"),
            params![limit as i64],
        )
    }

    /// Mean confidence over a user's events that carry one.
    pub fn average_confidence(&self, user_id: i64) -> Result<Option<f32>, StoreError> {
        let avg: Option<f64> = self.conn.query_row(
            "SELECT AVG(confidence) FROM recognition_events WHERE user_id = ?1 AND confidence IS NOT NULL",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(avg.map(|v| v as f32))
    }

    fn query_events(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<EventRecord>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let events = stmt
            .query_map(params, |row| {
                Ok(EventRecord {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    place_id: row.get(2)?,
                    timestamp: timestamp_at(row, 3)?,
                    image_path: row.get(4)?,
                    confidence: row.get::<_, Option<f64>>(5)?.map(|v| v as f32),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }
}

impl Datastore for Store {
    fn list_identities(&self) -> Result<Vec<Identity>, PortError> {
        let users = self
            .list_users()
            .map_err(|e| PortError::new("list_identities", e))?;
        Ok(users.iter().map(User::identity).collect())
    }

    fn list_samples(&self, identity: IdentityId) -> Result<Vec<ImageRef>, PortError> {
        let samples = self
            .list_face_samples(identity.0)
            .map_err(|e| PortError::new("list_samples", e))?;
        Ok(samples.into_iter().map(|s| ImageRef(s.image_path)).collect())
    }

    fn record_event(&self, event: &RecognitionEvent) -> Result<(), PortError> {
        self.add_event(event.identity.0, event.place, &event.image.0, Some(event.confidence))
            .map_err(|e| PortError::new("record_event", e))?;
        Ok(())
    }
}

fn to_text(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: timestamp_at(row, 2)?,
    })
}

fn place_from_row(row: &Row<'_>) -> rusqlite::Result<Place> {
    Ok(Place {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_users_roundtrip() {
        let store = Store::in_memory().unwrap();
        let alice = store.add_user("Alice").unwrap();
        let bob = store.add_user("Bob").unwrap();

        let users = store.list_users().unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].name, "Alice");
        assert_eq!(store.get_user(bob.id).unwrap().unwrap().name, "Bob");
        assert_eq!(store.find_user("Alice").unwrap().unwrap().id, alice.id);
        assert!(store.get_user(999).unwrap().is_none());
    }

    #[test]
    fn test_rename_user() {
        let store = Store::in_memory().unwrap();
        let alice = store.add_user("Alice").unwrap();
        let renamed = store.rename_user(alice.id, "Alicia").unwrap();
        assert_eq!(renamed.name, "Alicia");
        assert!(matches!(
            store.rename_user(42, "Nobody"),
            Err(StoreError::NotFound { kind: "user", id: 42 })
        ));
    }

    #[test]
    fn test_face_samples() {
        let store = Store::in_memory().unwrap();
        let alice = store.add_user("Alice").unwrap();
        store.add_face_sample(alice.id, "/data/a1.png").unwrap();
        store.add_face_sample(alice.id, "/data/a2.png").unwrap();

        let samples = store.list_face_samples(alice.id).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].image_path, "/data/a2.png");
        assert_eq!(store.count_face_samples(alice.id).unwrap(), 2);
        assert!(matches!(
            store.add_face_sample(77, "/data/x.png"),
            Err(StoreError::NotFound { kind: "user", .. })
        ));
    }

    #[test]
    fn test_places() {
        let store = Store::in_memory().unwrap();
        let lobby = store.add_place("Lobby", None).unwrap();
        let updated = store.update_place(lobby.id, None, Some("Ground floor")).unwrap();
        assert_eq!(updated.name, "Lobby");
        assert_eq!(updated.description.as_deref(), Some("Ground floor"));

        let renamed = store.update_place(lobby.id, Some("Front desk"), None).unwrap();
        assert_eq!(renamed.description.as_deref(), Some("Ground floor"));
        assert_eq!(store.list_places().unwrap().len(), 1);
        assert!(store.update_place(9, Some("x"), None).is_err());
    }

    #[test]
    fn test_ensure_place_is_idempotent() {
        let store = Store::in_memory().unwrap();
        let first = store.ensure_place("Default Location").unwrap();
        let second = store.ensure_place("Default Location").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.list_places().unwrap().len(), 1);
    }

    #[test]
    fn test_event_queries() {
        let store = Store::in_memory().unwrap();
        let alice = store.add_user("Alice").unwrap();
        let bob = store.add_user("Bob").unwrap();
        let lobby = store.add_place("Lobby", None).unwrap();
        let lab = store.add_place("Lab", None).unwrap();

        store.add_event(alice.id, lobby.id, "e1.jpg", Some(80.0)).unwrap();
        store.add_event(alice.id, lab.id, "e2.jpg", Some(90.0)).unwrap();
        store.add_event(bob.id, lobby.id, "e3.jpg", None).unwrap();

        let alice_events = store.events_for_user(alice.id).unwrap();
        assert_eq!(alice_events.len(), 2);
        assert_eq!(alice_events[0].image_path, "e2.jpg");

        let lobby_events = store.events_at_place(lobby.id).unwrap();
        assert_eq!(lobby_events.len(), 2);
        assert_eq!(lobby_events[0].user_id, bob.id);

        let recent = store.recent_events(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].image_path, "e3.jpg");

        let avg = store.average_confidence(alice.id).unwrap().unwrap();
        assert!((avg - 85.0).abs() < 1e-4);
        assert_eq!(store.average_confidence(bob.id).unwrap(), None);
    }

    #[test]
    fn test_datastore_trait() {
        let store = Store::in_memory().unwrap();
        let alice = store.add_user("Alice").unwrap();
        store.add_face_sample(alice.id, "a1.png").unwrap();
        let place = store.ensure_place("Default Location").unwrap();

        let ids = store.list_identities().unwrap();
        assert_eq!(ids, vec![Identity { id: IdentityId(alice.id), name: "Alice".into() }]);
        assert_eq!(
            store.list_samples(IdentityId(alice.id)).unwrap(),
            vec![ImageRef("a1.png".into())]
        );

        store
            .record_event(&RecognitionEvent {
                identity: IdentityId(alice.id),
                place: place.id,
                image: ImageRef("event.jpg".into()),
                confidence: 80.0,
            })
            .unwrap();
        let events = store.recent_events(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].confidence, Some(80.0));
    }

    #[test]
    fn test_event_for_unknown_user_fails() {
        let store = Store::in_memory().unwrap();
        let place = store.ensure_place("Default Location").unwrap();
        let err = store
            .record_event(&RecognitionEvent {
                identity: IdentityId(5),
                place: place.id,
                image: ImageRef("event.jpg".into()),
                confidence: 80.0,
            })
            .unwrap_err();
        assert_eq!(err.context(), "record_event");
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/facewatch.db");
        {
            let store = Store::open(&path).unwrap();
            store.add_user("Alice").unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.list_users().unwrap().len(), 1);
    }
}
