//! Session records with running cost and message counters.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{JsonDocument, StoreError};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Archived,
    Closed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Archived => write!(f, "archived"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// A persistent conversational context with accumulated cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub project_path: String,
    pub model: String,
    pub status: SessionStatus,
    pub total_cost_usd: f64,
    pub messages_count: u64,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Fields accepted when creating a session.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub project_path: String,
    pub model: String,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Partial update applied by [`SessionStore::update`].
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub model: Option<String>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

/// Filters for [`SessionStore::list`].
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub project_path: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SessionsDoc {
    #[serde(default)]
    sessions: HashMap<Uuid, Session>,
}

/// Store for session records, backed by `sessions.json`.
pub struct SessionStore {
    doc: JsonDocument<SessionsDoc>,
}

impl SessionStore {
    /// Open (or create) the store at `dir/sessions.json`.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            doc: JsonDocument::open(dir.join("sessions.json"))?,
        })
    }

    /// Create a new session record.
    pub async fn create(&self, new: NewSession) -> Result<Session, StoreError> {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            project_path: new.project_path,
            model: new.model,
            status: SessionStatus::Active,
            total_cost_usd: 0.0,
            messages_count: 0,
            metadata: new.metadata,
        };

        let stored = session.clone();
        self.doc
            .with_lock(move |doc| {
                doc.sessions.insert(stored.id, stored);
            })
            .await?;

        Ok(session)
    }

    /// Fetch a session by id.
    pub async fn get(&self, id: Uuid) -> Result<Option<Session>, StoreError> {
        self.doc.read(|doc| doc.sessions.get(&id).cloned()).await
    }

    /// Apply a partial update; returns the updated session, or `None` when
    /// the id is unknown.
    pub async fn update(
        &self,
        id: Uuid,
        patch: SessionPatch,
    ) -> Result<Option<Session>, StoreError> {
        self.doc
            .with_lock(move |doc| {
                let session = doc.sessions.get_mut(&id)?;
                if let Some(status) = patch.status {
                    session.status = status;
                }
                if let Some(model) = patch.model {
                    session.model = model;
                }
                if let Some(metadata) = patch.metadata {
                    session.metadata = metadata;
                }
                session.updated_at = Utc::now();
                Some(session.clone())
            })
            .await
    }

    /// Remove a session. Returns `true` when a record was deleted.
    pub async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        self.doc
            .with_lock(move |doc| doc.sessions.remove(&id).is_some())
            .await
    }

    /// List sessions sorted by `updated_at` descending.
    pub async fn list(&self, filter: SessionFilter) -> Result<Vec<Session>, StoreError> {
        self.doc
            .read(|doc| {
                let mut sessions: Vec<Session> = doc
                    .sessions
                    .values()
                    .filter(|s| filter.status.map_or(true, |status| s.status == status))
                    .filter(|s| {
                        filter
                            .project_path
                            .as_deref()
                            .map_or(true, |p| s.project_path == p)
                    })
                    .cloned()
                    .collect();
                sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
                if let Some(limit) = filter.limit {
                    sessions.truncate(limit);
                }
                sessions
            })
            .await
    }

    /// Substring search over session ids and metadata values.
    pub async fn search(
        &self,
        query: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Session>, StoreError> {
        let query = query.to_lowercase();
        self.doc
            .read(move |doc| {
                let mut matches: Vec<Session> = doc
                    .sessions
                    .values()
                    .filter(|s| {
                        s.id.to_string().to_lowercase().contains(&query)
                            || s.metadata.iter().any(|(key, value)| {
                                key.to_lowercase().contains(&query)
                                    || value
                                        .as_str()
                                        .map_or_else(
                                            || value.to_string(),
                                            |v| v.to_string(),
                                        )
                                        .to_lowercase()
                                        .contains(&query)
                            })
                    })
                    .cloned()
                    .collect();
                matches.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
                if let Some(limit) = limit {
                    matches.truncate(limit);
                }
                matches
            })
            .await
    }

    /// Delete sessions whose `updated_at` is older than `retention_days`.
    /// Returns how many records were removed.
    pub async fn cleanup(&self, retention_days: u32) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        self.doc
            .with_lock(move |doc| {
                let before = doc.sessions.len();
                doc.sessions.retain(|_, s| s.updated_at >= cutoff);
                before - doc.sessions.len()
            })
            .await
    }

    /// Bump the message counter. Counters never decrease.
    pub async fn increment_messages(&self, id: Uuid) -> Result<Option<Session>, StoreError> {
        self.doc
            .with_lock(move |doc| {
                let session = doc.sessions.get_mut(&id)?;
                session.messages_count += 1;
                session.updated_at = Utc::now();
                Some(session.clone())
            })
            .await
    }

    /// Add to the running cost. Negative amounts are ignored so the
    /// counter stays monotonic.
    pub async fn add_cost(&self, id: Uuid, usd: f64) -> Result<Option<Session>, StoreError> {
        self.doc
            .with_lock(move |doc| {
                let session = doc.sessions.get_mut(&id)?;
                if usd > 0.0 {
                    session.total_cost_usd += usd;
                }
                session.updated_at = Utc::now();
                Some(session.clone())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn new_session(project: &str) -> NewSession {
        NewSession {
            project_path: project.to_string(),
            model: "claude-sonnet-4".to_string(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_create_and_roundtrip_through_disk() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();

        let session = store.create(new_session("/tmp/project")).await.unwrap();

        // A fresh store over the same directory returns the same record.
        let reopened = SessionStore::open(dir.path()).unwrap();
        let loaded = reopened.get(session.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.project_path, "/tmp/project");
        assert_eq!(loaded.status, SessionStatus::Active);
        assert_eq!(loaded.messages_count, 0);
    }

    #[tokio::test]
    async fn test_cost_and_messages_are_monotonic() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let session = store.create(new_session("/tmp/p")).await.unwrap();

        store.add_cost(session.id, 0.25).await.unwrap();
        store.add_cost(session.id, -1.0).await.unwrap();
        store.increment_messages(session.id).await.unwrap();
        store.increment_messages(session.id).await.unwrap();

        let loaded = store.get(session.id).await.unwrap().unwrap();
        assert!((loaded.total_cost_usd - 0.25).abs() < f64::EPSILON);
        assert_eq!(loaded.messages_count, 2);
        assert!(loaded.updated_at >= loaded.created_at);
    }

    #[tokio::test]
    async fn test_list_sorts_by_updated_at_descending() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();

        let first = store.create(new_session("/tmp/a")).await.unwrap();
        let second = store.create(new_session("/tmp/b")).await.unwrap();
        // Touch the first session so it becomes the most recent.
        store.increment_messages(first.id).await.unwrap();

        let listed = store.list(SessionFilter::default()).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, first.id);
        assert_eq!(listed[1].id, second.id);
    }

    #[tokio::test]
    async fn test_list_filters_by_status_and_project() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();

        let keep = store.create(new_session("/tmp/a")).await.unwrap();
        let archived = store.create(new_session("/tmp/a")).await.unwrap();
        store.create(new_session("/tmp/b")).await.unwrap();
        store
            .update(
                archived.id,
                SessionPatch {
                    status: Some(SessionStatus::Archived),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let listed = store
            .list(SessionFilter {
                status: Some(SessionStatus::Active),
                project_path: Some("/tmp/a".to_string()),
                limit: None,
            })
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, keep.id);
    }

    #[tokio::test]
    async fn test_search_matches_id_and_metadata() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();

        let mut metadata = HashMap::new();
        metadata.insert(
            "ticket".to_string(),
            serde_json::Value::String("JIRA-1234".to_string()),
        );
        let tagged = store
            .create(NewSession {
                project_path: "/tmp/a".to_string(),
                model: "claude-sonnet-4".to_string(),
                metadata,
            })
            .await
            .unwrap();
        let other = store.create(new_session("/tmp/b")).await.unwrap();

        let by_meta = store.search("jira-12", None).await.unwrap();
        assert_eq!(by_meta.len(), 1);
        assert_eq!(by_meta[0].id, tagged.id);

        let id_prefix = other.id.to_string()[..8].to_string();
        let by_id = store.search(&id_prefix, None).await.unwrap();
        assert!(by_id.iter().any(|s| s.id == other.id));
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_stale_sessions() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();

        let stale = store.create(new_session("/tmp/a")).await.unwrap();
        let fresh = store.create(new_session("/tmp/b")).await.unwrap();

        // Backdate the stale session past the retention window.
        store
            .doc
            .with_lock(|doc| {
                let session = doc.sessions.get_mut(&stale.id).unwrap();
                session.updated_at = Utc::now() - Duration::days(40);
            })
            .await
            .unwrap();

        let removed = store.cleanup(30).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(stale.id).await.unwrap().is_none());
        assert!(store.get(fresh.id).await.unwrap().is_some());
    }
}
