//! Durable record store boundary. The production backend lives outside this
//! crate; the orchestrator only sees this trait. [`MemoryRepository`] backs
//! tests and short-lived tooling.
//!
//! Callers are expected to serialize access; the orchestrator reads and
//! writes as if under a single-writer lock.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use sbx_types::{Error, Result, Sandbox, Snapshot};

#[async_trait]
pub trait Repository: Send + Sync {
    /// Inserts a new sandbox record. `AlreadyExists` on a duplicate id or a
    /// duplicate name among live sandboxes.
    async fn create_sandbox(&self, sandbox: Sandbox) -> Result<()>;
    async fn get_sandbox(&self, id: &str) -> Result<Sandbox>;
    async fn find_sandbox_by_name(&self, name: &str) -> Result<Sandbox>;
    async fn update_sandbox(&self, sandbox: Sandbox) -> Result<()>;
    async fn delete_sandbox(&self, id: &str) -> Result<()>;
    async fn list_sandboxes(&self) -> Result<Vec<Sandbox>>;

    async fn create_snapshot(&self, snapshot: Snapshot) -> Result<()>;
    async fn get_snapshot(&self, id: &str) -> Result<Snapshot>;
    async fn find_snapshot_by_name(&self, name: &str) -> Result<Snapshot>;
    async fn delete_snapshot(&self, id: &str) -> Result<()>;
    async fn list_snapshots(&self) -> Result<Vec<Snapshot>>;
}

#[derive(Default)]
pub struct MemoryRepository {
    sandboxes: Mutex<HashMap<String, Sandbox>>,
    snapshots: Mutex<HashMap<String, Snapshot>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn create_sandbox(&self, sandbox: Sandbox) -> Result<()> {
        let mut map = self.sandboxes.lock().unwrap();
        if map.contains_key(&sandbox.id) {
            return Err(Error::AlreadyExists(format!("sandbox {}", sandbox.id)));
        }
        if map.values().any(|s| s.name == sandbox.name) {
            return Err(Error::AlreadyExists(format!(
                "sandbox named {:?}",
                sandbox.name
            )));
        }
        map.insert(sandbox.id.clone(), sandbox);
        Ok(())
    }

    async fn get_sandbox(&self, id: &str) -> Result<Sandbox> {
        self.sandboxes
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("sandbox {id}")))
    }

    async fn find_sandbox_by_name(&self, name: &str) -> Result<Sandbox> {
        self.sandboxes
            .lock()
            .unwrap()
            .values()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("sandbox named {name:?}")))
    }

    async fn update_sandbox(&self, sandbox: Sandbox) -> Result<()> {
        let mut map = self.sandboxes.lock().unwrap();
        if !map.contains_key(&sandbox.id) {
            return Err(Error::NotFound(format!("sandbox {}", sandbox.id)));
        }
        map.insert(sandbox.id.clone(), sandbox);
        Ok(())
    }

    async fn delete_sandbox(&self, id: &str) -> Result<()> {
        self.sandboxes
            .lock()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("sandbox {id}")))
    }

    async fn list_sandboxes(&self) -> Result<Vec<Sandbox>> {
        let mut all: Vec<Sandbox> = self.sandboxes.lock().unwrap().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }

    async fn create_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let mut map = self.snapshots.lock().unwrap();
        if map.contains_key(&snapshot.id) {
            return Err(Error::AlreadyExists(format!("snapshot {}", snapshot.id)));
        }
        if map.values().any(|s| s.name == snapshot.name) {
            return Err(Error::AlreadyExists(format!(
                "snapshot named {:?}",
                snapshot.name
            )));
        }
        map.insert(snapshot.id.clone(), snapshot);
        Ok(())
    }

    async fn get_snapshot(&self, id: &str) -> Result<Snapshot> {
        self.snapshots
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("snapshot {id}")))
    }

    async fn find_snapshot_by_name(&self, name: &str) -> Result<Snapshot> {
        self.snapshots
            .lock()
            .unwrap()
            .values()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("snapshot named {name:?}")))
    }

    async fn delete_snapshot(&self, id: &str) -> Result<()> {
        self.snapshots
            .lock()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("snapshot {id}")))
    }

    async fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        let mut all: Vec<Snapshot> = self.snapshots.lock().unwrap().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }
}
