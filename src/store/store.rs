//! File-backed node store.
//!
//! Every operation takes the store-wide lock, loads the whole document,
//! applies its change and writes the document back through a temp file and
//! rename. Readers and writers never observe a torn document.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::bootstrap::HostFacts;
use super::types::{
    Dossier, FormatSpec, Group, MembershipStatus, NodeStoreDocument, StatusWrite,
};
use crate::error::{ClusterError, Result};

pub struct NodeStore {
    path: PathBuf,
    host_facts: Arc<dyn HostFacts>,
    lock: Mutex<()>,
}

impl NodeStore {
    pub fn new(path: impl Into<PathBuf>, host_facts: Arc<dyn HostFacts>) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            host_facts,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the document, creating it on first run.
    pub async fn init(&self) -> Result<Dossier> {
        let _guard = self.lock.lock().await;
        let doc = self.read_or_bootstrap().await?;
        Ok(doc.self_node[0].clone())
    }

    /// Full copy of the current document.
    pub async fn snapshot(&self) -> Result<NodeStoreDocument> {
        let _guard = self.lock.lock().await;
        self.read_or_bootstrap().await
    }

    pub async fn self_descriptor(&self) -> Result<Dossier> {
        let _guard = self.lock.lock().await;
        let doc = self.read_or_bootstrap().await?;
        Ok(doc.self_node[0].clone())
    }

    /// Typed copy of one group.
    pub async fn list(&self, group: Group) -> Result<Vec<Dossier>> {
        let _guard = self.lock.lock().await;
        let doc = self.read_or_bootstrap().await?;
        Ok(doc.group(group).clone())
    }

    /// Projection of one group.
    pub async fn load_all(&self, group: Group, format: &FormatSpec) -> Result<Vec<Value>> {
        self.list(group)
            .await?
            .iter()
            .map(|record| record.project(format))
            .collect()
    }

    pub async fn find_by_id(&self, group: Group, id: &str) -> Result<Option<Dossier>> {
        let _guard = self.lock.lock().await;
        let doc = self.read_or_bootstrap().await?;
        Ok(doc.group(group).iter().find(|d| d.id == id).cloned())
    }

    /// Appends a record. Fails if the id is already present.
    pub async fn upsert(&self, group: Group, record: Dossier) -> Result<()> {
        if group == Group::SelfNode {
            return Err(ClusterError::validation("'self' holds exactly one entry"));
        }

        let _guard = self.lock.lock().await;
        let mut doc = self.read_or_bootstrap().await?;
        let records = doc.group_mut(group);
        if records.iter().any(|d| d.id == record.id) {
            return Err(ClusterError::Duplicate(record.id));
        }

        tracing::debug!("Store: inserting {} into '{}'", record.id, group);
        records.push(record);
        self.write(&doc).await
    }

    /// Removes a record. Returns `false` when the id was not present.
    pub async fn remove_by_id(&self, group: Group, id: &str) -> Result<bool> {
        if group == Group::SelfNode {
            return Err(ClusterError::validation("the 'self' entry cannot be removed"));
        }

        let _guard = self.lock.lock().await;
        let mut doc = self.read_or_bootstrap().await?;
        let records = doc.group_mut(group);
        let before = records.len();
        records.retain(|d| d.id != id);
        if records.len() == before {
            tracing::debug!("Store: remove of absent id {} in '{}'", id, group);
            return Ok(false);
        }

        self.write(&doc).await?;
        Ok(true)
    }

    /// Applies `mutate` to the record with `id`.
    ///
    /// Returns `false` (and writes nothing) when the id is absent. If `mutate`
    /// fails the document is left untouched.
    pub async fn update_by_id<F>(&self, group: Group, id: &str, mutate: F) -> Result<bool>
    where
        F: FnOnce(&mut Dossier) -> Result<()>,
    {
        let _guard = self.lock.lock().await;
        let mut doc = self.read_or_bootstrap().await?;
        let Some(record) = doc.group_mut(group).iter_mut().find(|d| d.id == id) else {
            tracing::debug!("Store: update of absent id {} in '{}'", id, group);
            return Ok(false);
        };

        let mut updated = record.clone();
        mutate(&mut updated)?;
        if updated.id != id {
            return Err(ClusterError::validation("id is immutable"));
        }
        *record = updated;

        self.write(&doc).await?;
        Ok(true)
    }

    /// Sets the membership status of a peer.
    pub async fn set_status(&self, id: &str, status: MembershipStatus) -> Result<bool> {
        self.update_by_id(Group::Nodes, id, |d| {
            d.status = status;
            Ok(())
        })
        .await
    }

    /// Moves a peer to `next` unless it has been disabled.
    ///
    /// Used by the scheduler, whose view of the peer may be older than an
    /// administrator's last write.
    pub async fn advance_status(&self, id: &str, next: MembershipStatus) -> Result<StatusWrite> {
        let mut outcome = StatusWrite::Missing;
        self.update_by_id(Group::Nodes, id, |record| {
            outcome = if record.status == MembershipStatus::Disabled {
                StatusWrite::KeptDisabled
            } else {
                let previous = record.status;
                record.status = next;
                StatusWrite::Applied { previous }
            };
            Ok(())
        })
        .await?;
        Ok(outcome)
    }

    /// Replaces stale entries for a peer with its authoritative descriptor.
    ///
    /// Removes `stale_id` (if given) and every entry sharing the new record's
    /// id or address, then inserts `record`, all in one write. Returns how
    /// many entries were removed.
    pub async fn supersede(
        &self,
        group: Group,
        stale_id: Option<&str>,
        record: Dossier,
    ) -> Result<usize> {
        if group == Group::SelfNode {
            return Err(ClusterError::validation("'self' cannot be superseded"));
        }

        let _guard = self.lock.lock().await;
        let mut doc = self.read_or_bootstrap().await?;
        let removed = replace_entries(doc.group_mut(group), stale_id, record);
        self.write(&doc).await?;
        Ok(removed)
    }

    /// Like [`supersede`](Self::supersede), but only while `pending_id` is
    /// still present and not disabled.
    ///
    /// The check and the replacement happen under one lock acquisition, so an
    /// administrator's delete or disable that lands first always wins. Returns
    /// `None` (and writes nothing) when the ACK has to be dropped.
    pub async fn supersede_pending(
        &self,
        group: Group,
        pending_id: &str,
        record: Dossier,
    ) -> Result<Option<usize>> {
        if group == Group::SelfNode {
            return Err(ClusterError::validation("'self' cannot be superseded"));
        }

        let _guard = self.lock.lock().await;
        let mut doc = self.read_or_bootstrap().await?;
        let records = doc.group_mut(group);
        match records.iter().find(|d| d.id == pending_id) {
            Some(pending) if pending.status != MembershipStatus::Disabled => {}
            Some(_) => {
                tracing::debug!("Store: {} was disabled, keeping it", pending_id);
                return Ok(None);
            }
            None => {
                tracing::debug!("Store: {} is gone from '{}'", pending_id, group);
                return Ok(None);
            }
        }

        let removed = replace_entries(records, Some(pending_id), record);
        self.write(&doc).await?;
        Ok(Some(removed))
    }

    async fn read_or_bootstrap(&self) -> Result<NodeStoreDocument> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let doc: NodeStoreDocument = serde_json::from_slice(&bytes).map_err(|e| {
                    ClusterError::Storage(format!("{} is malformed: {}", self.path.display(), e))
                })?;
                doc.validate()?;
                Ok(doc)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    "Node store {} does not exist, creating it",
                    self.path.display()
                );
                let doc = NodeStoreDocument::with_self(self.host_facts.self_descriptor());
                self.write(&doc).await?;
                Ok(doc)
            }
            Err(e) => Err(ClusterError::Storage(format!(
                "cannot read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn write(&self, doc: &NodeStoreDocument) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(doc)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Drops `stale_id` and every entry sharing `record`'s id or address, then
/// appends `record`. Returns how many entries were dropped.
fn replace_entries(records: &mut Vec<Dossier>, stale_id: Option<&str>, record: Dossier) -> usize {
    let before = records.len();
    records.retain(|d| {
        Some(d.id.as_str()) != stale_id && d.id != record.id && !d.same_address(&record)
    });
    let removed = before - records.len();

    tracing::debug!(
        "Store: superseding {} entr(y/ies) with {} at {}",
        removed,
        record.id,
        record.address()
    );
    records.push(record);
    removed
}
