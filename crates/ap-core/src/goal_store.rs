use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::Goal;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GoalStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("goal already stored: {0}")]
    Duplicate(Uuid),
    #[error("goal not found: {0}")]
    NotFound(Uuid),
}

pub type Result<T> = std::result::Result<T, GoalStoreError>;

// ---------------------------------------------------------------------------
// GoalStore
// ---------------------------------------------------------------------------

/// Ordered goal collection, optionally backed by a directory of JSON files.
///
/// Each goal is stored as `<dir>/<id>.json` and written through a temp file
/// plus rename, so a crash never leaves a half-written record. Insert order
/// is kept through a monotonically increasing `seq` stamped on each goal.
pub struct GoalStore {
    dir: Option<PathBuf>,
    goals: HashMap<Uuid, Goal>,
    next_seq: u64,
}

impl GoalStore {
    /// A store that never touches disk (useful for testing).
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            goals: HashMap::new(),
            next_seq: 1,
        }
    }

    /// Open (or create) a store rooted at `dir`, loading every readable record.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut goals = HashMap::new();
        let mut max_seq = 0;
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = match std::fs::read_to_string(&path) {
                Ok(d) => d,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable goal record, skipping");
                    continue;
                }
            };
            match serde_json::from_str::<Goal>(&data) {
                Ok(goal) => {
                    max_seq = max_seq.max(goal.seq);
                    goals.insert(goal.id, goal);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt goal record, skipping");
                }
            }
        }

        debug!(dir = %dir.display(), count = goals.len(), "goal store opened");
        Ok(Self {
            dir: Some(dir),
            goals,
            next_seq: max_seq + 1,
        })
    }

    /// Insert a new goal, assigning it the next sequence number.
    pub fn insert(&mut self, mut goal: Goal) -> Result<&Goal> {
        if self.goals.contains_key(&goal.id) {
            return Err(GoalStoreError::Duplicate(goal.id));
        }
        goal.seq = self.next_seq;
        self.persist(&goal)?;
        self.next_seq += 1;
        let id = goal.id;
        self.goals.insert(id, goal);
        self.goals.get(&id).ok_or(GoalStoreError::NotFound(id))
    }

    /// Replace an existing goal. The stored sequence number is preserved.
    pub fn update(&mut self, mut goal: Goal) -> Result<()> {
        let existing = self
            .goals
            .get(&goal.id)
            .ok_or(GoalStoreError::NotFound(goal.id))?;
        goal.seq = existing.seq;
        self.persist(&goal)?;
        self.goals.insert(goal.id, goal);
        Ok(())
    }

    /// Delete a goal. Returns the removed goal, if it existed.
    pub fn remove(&mut self, id: Uuid) -> Result<Option<Goal>> {
        let removed = self.goals.remove(&id);
        if removed.is_some() {
            if let Some(path) = self.record_path(&id) {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
            }
        }
        Ok(removed)
    }

    pub fn get(&self, id: Uuid) -> Option<&Goal> {
        self.goals.get(&id)
    }

    /// All goals in insertion (sequence) order.
    pub fn list(&self) -> Vec<&Goal> {
        let mut goals: Vec<&Goal> = self.goals.values().collect();
        goals.sort_by_key(|g| g.seq);
        goals
    }

    pub fn len(&self) -> usize {
        self.goals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.goals.is_empty()
    }

    fn record_path(&self, id: &Uuid) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{id}.json")))
    }

    fn persist(&self, goal: &Goal) -> Result<()> {
        let Some(path) = self.record_path(&goal.id) else {
            return Ok(());
        };
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(goal)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GoalStatus;

    fn temp_store() -> (GoalStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = GoalStore::open(dir.path()).expect("open store");
        (store, dir)
    }

    #[test]
    fn insert_assigns_increasing_seq() {
        let mut store = GoalStore::in_memory();
        let a = store.insert(Goal::new("a", "health")).unwrap().seq;
        let b = store.insert(Goal::new("b", "career")).unwrap().seq;
        assert!(b > a);
        let titles: Vec<_> = store.list().iter().map(|g| g.title.clone()).collect();
        assert_eq!(titles, vec!["a", "b"]);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut store = GoalStore::in_memory();
        let goal = Goal::new("a", "health");
        store.insert(goal.clone()).unwrap();
        assert!(matches!(
            store.insert(goal),
            Err(GoalStoreError::Duplicate(_))
        ));
    }

    #[test]
    fn update_unknown_goal_fails() {
        let mut store = GoalStore::in_memory();
        let err = store.update(Goal::new("ghost", "x")).unwrap_err();
        assert!(matches!(err, GoalStoreError::NotFound(_)));
    }

    #[test]
    fn reopen_restores_goals_and_sequence() {
        let (mut store, dir) = temp_store();
        let first = store.insert(Goal::new("first", "finance")).unwrap().id;
        let mut second = store.insert(Goal::new("second", "finance")).unwrap().clone();
        second.status = GoalStatus::Active;
        second.progress = 0.4;
        store.update(second.clone()).unwrap();
        drop(store);

        let mut reopened = GoalStore::open(dir.path()).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.list()[0].id, first);
        let loaded = reopened.get(second.id).unwrap();
        assert_eq!(loaded.status, GoalStatus::Active);
        assert_eq!(loaded.progress, 0.4);

        let third = reopened.insert(Goal::new("third", "finance")).unwrap();
        assert_eq!(third.seq, 3);
    }

    #[test]
    fn corrupt_record_is_skipped() {
        let (mut store, dir) = temp_store();
        store.insert(Goal::new("ok", "health")).unwrap();
        std::fs::write(dir.path().join("garbage.json"), "{not json").unwrap();

        let reopened = GoalStore::open(dir.path()).unwrap();
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn remove_deletes_file() {
        let (mut store, dir) = temp_store();
        let id = store.insert(Goal::new("gone", "x")).unwrap().id;
        assert!(dir.path().join(format!("{id}.json")).exists());
        assert!(store.remove(id).unwrap().is_some());
        assert!(!dir.path().join(format!("{id}.json")).exists());
        assert!(store.remove(id).unwrap().is_none());
    }
}
