//! Persona store access: a remote document store keyed by persona id,
//! with a read-only seed fallback when the store is unreachable at
//! load. Writes are optimistic; remote divergence is surfaced through
//! a per-entity sync status instead of being silently swallowed.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;

use crate::core::config::StoreConfig;
use crate::core::ids::IdFactory;
use crate::core::state::{Persona, MAX_REF_IMAGES};
use crate::services::blob::{self, BlobStore};

#[async_trait]
pub trait PersonaStore: Send + Sync + Debug {
    /// Most-recent-first.
    async fn list(&self) -> Result<Vec<Persona>>;
    async fn upsert(&self, persona: &Persona) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Storage representation. The remote store omits empty lists, so
/// `niche` and `ref_images` are optional on the wire and normalize to
/// empty on the way back in.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PersonaRecord {
    pub id: String,
    pub name: String,
    pub location: String,
    pub country: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub niche: Option<Vec<String>>,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub avatar_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_images: Option<Vec<String>>,
}

pub fn map_persona_to_record(persona: &Persona) -> PersonaRecord {
    PersonaRecord {
        id: persona.id.clone(),
        name: persona.name.clone(),
        location: persona.location.clone(),
        country: persona.country.clone(),
        niche: if persona.niche.is_empty() {
            None
        } else {
            Some(persona.niche.clone())
        },
        bio: persona.bio.clone(),
        avatar_url: persona.avatar_url.clone(),
        ref_images: if persona.ref_images.is_empty() {
            None
        } else {
            Some(persona.ref_images.clone())
        },
    }
}

pub fn map_persona_from_record(record: PersonaRecord) -> Persona {
    Persona {
        id: record.id,
        name: record.name,
        location: record.location,
        country: record.country,
        niche: record.niche.unwrap_or_default(),
        bio: record.bio,
        avatar_url: record.avatar_url,
        ref_images: record.ref_images.unwrap_or_default(),
    }
}

// --- REST implementation ---

#[derive(Debug)]
pub struct RestPersonaStore {
    base_url: String,
    api_key: String,
    collection: String,
    client: reqwest::Client,
}

impl RestPersonaStore {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            collection: config.collection.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn collection_url(&self) -> String {
        format!("{}/{}", self.base_url, self.collection)
    }
}

#[async_trait]
impl PersonaStore for RestPersonaStore {
    async fn list(&self) -> Result<Vec<Persona>> {
        let resp = self
            .client
            .get(format!("{}?order=updated.desc", self.collection_url()))
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("Persona store list failed: {}", error_text));
        }

        let records: Vec<PersonaRecord> = resp
            .json()
            .await
            .context("Persona store returned an unexpected list payload")?;
        Ok(records.into_iter().map(map_persona_from_record).collect())
    }

    async fn upsert(&self, persona: &Persona) -> Result<()> {
        let record = map_persona_to_record(persona);
        let resp = self
            .client
            .put(format!("{}/{}", self.collection_url(), persona.id))
            .bearer_auth(&self.api_key)
            .json(&record)
            .send()
            .await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("Persona store upsert failed: {}", error_text));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let resp = self
            .client
            .delete(format!("{}/{}", self.collection_url(), id))
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("Persona store delete failed: {}", error_text));
        }
        Ok(())
    }
}

// --- Directory ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Local write done, remote write still in flight.
    Pending,
    Synced,
    /// Local and remote state may diverge.
    Failed,
}

/// In-memory persona view backed by a remote store. Mutations update
/// the local list first; the remote outcome lands in `sync_status`.
pub struct PersonaDirectory {
    store: Box<dyn PersonaStore>,
    personas: Vec<Persona>,
    sync_status: HashMap<String, SyncStatus>,
    connected: bool,
    ids: IdFactory,
}

impl PersonaDirectory {
    pub async fn load(store: Box<dyn PersonaStore>) -> Self {
        match store.list().await {
            Ok(personas) => {
                let sync_status = personas
                    .iter()
                    .map(|p| (p.id.clone(), SyncStatus::Synced))
                    .collect();
                Self {
                    store,
                    personas,
                    sync_status,
                    connected: true,
                    ids: IdFactory::new(),
                }
            }
            Err(e) => {
                log::warn!(
                    "Persona store unavailable, falling back to read-only seed data: {:#}",
                    e
                );
                Self {
                    store,
                    personas: seed_personas(),
                    sync_status: HashMap::new(),
                    connected: false,
                    ids: IdFactory::new(),
                }
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Most-recent-first.
    pub fn personas(&self) -> &[Persona] {
        &self.personas
    }

    pub fn get(&self, id: &str) -> Option<&Persona> {
        self.personas.iter().find(|p| p.id == id)
    }

    pub fn sync_status(&self, id: &str) -> Option<SyncStatus> {
        self.sync_status.get(id).copied()
    }

    /// Optimistic write: the local entry is replaced (and moved to the
    /// front) before the remote call. On a remote failure the local
    /// update stays and the error is returned with the entry marked
    /// Failed. Disconnected mode keeps local-only state silently.
    pub async fn upsert(&mut self, persona: Persona) -> Result<()> {
        let id = persona.id.clone();
        self.personas.retain(|p| p.id != id);
        self.personas.insert(0, persona.clone());

        if !self.connected {
            self.sync_status.insert(id, SyncStatus::Failed);
            return Ok(());
        }

        self.sync_status.insert(id.clone(), SyncStatus::Pending);
        match self.store.upsert(&persona).await {
            Ok(()) => {
                self.sync_status.insert(id, SyncStatus::Synced);
                Ok(())
            }
            Err(e) => {
                self.sync_status.insert(id.clone(), SyncStatus::Failed);
                Err(e).with_context(|| format!("Persona {} saved locally only", id))
            }
        }
    }

    pub async fn delete(&mut self, id: &str) -> Result<()> {
        self.personas.retain(|p| p.id != id);

        if !self.connected {
            self.sync_status.remove(id);
            return Ok(());
        }

        match self.store.delete(id).await {
            Ok(()) => {
                self.sync_status.remove(id);
                Ok(())
            }
            Err(e) => {
                self.sync_status.insert(id.to_string(), SyncStatus::Failed);
                Err(e).with_context(|| format!("Persona {} deleted locally only", id))
            }
        }
    }

    pub async fn set_avatar(
        &mut self,
        blob: &dyn BlobStore,
        id: &str,
        data: &[u8],
        mime_type: &str,
    ) -> Result<()> {
        let mut persona = self
            .get(id)
            .cloned()
            .with_context(|| format!("Unknown persona: {}", id))?;
        let key = blob::object_key(id, "avatar", self.ids.next_timestamp(), mime_type);
        persona.avatar_url = blob.upload(data, &key, mime_type).await?;
        self.upsert(persona).await
    }

    pub async fn add_ref_image(
        &mut self,
        blob: &dyn BlobStore,
        id: &str,
        data: &[u8],
        mime_type: &str,
    ) -> Result<()> {
        let mut persona = self
            .get(id)
            .cloned()
            .with_context(|| format!("Unknown persona: {}", id))?;
        if persona.ref_images.len() >= MAX_REF_IMAGES {
            anyhow::bail!(
                "Persona {} already has {} reference images",
                id,
                MAX_REF_IMAGES
            );
        }
        let key = blob::object_key(id, "ref", self.ids.next_timestamp(), mime_type);
        persona.ref_images.push(blob.upload(data, &key, mime_type).await?);
        self.upsert(persona).await
    }
}

/// Built-in dataset used when the store cannot be reached at startup.
fn seed_personas() -> Vec<Persona> {
    vec![
        Persona {
            id: "seed-ana".to_string(),
            name: "Ana".to_string(),
            location: "Zagreb".to_string(),
            country: "Croatia".to_string(),
            niche: vec!["coffee".to_string(), "running".to_string()],
            bio: "Morning runs, better espresso.".to_string(),
            avatar_url: String::new(),
            ref_images: vec![],
        },
        Persona {
            id: "seed-mateo".to_string(),
            name: "Mateo".to_string(),
            location: "Lisbon".to_string(),
            country: "Portugal".to_string(),
            niche: vec!["surf".to_string(), "food".to_string()],
            bio: "Chasing waves and pasteis.".to_string(),
            avatar_url: String::new(),
            ref_images: vec![],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug)]
    struct MockPersonaStore {
        list_fails: bool,
        upsert_fails: bool,
        upserts: Arc<Mutex<Vec<String>>>,
    }

    impl MockPersonaStore {
        fn new(list_fails: bool, upsert_fails: bool) -> Self {
            Self {
                list_fails,
                upsert_fails,
                upserts: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl PersonaStore for MockPersonaStore {
        async fn list(&self) -> Result<Vec<Persona>> {
            if self.list_fails {
                return Err(anyhow!("connection refused"));
            }
            Ok(vec![Persona {
                id: "remote-1".to_string(),
                name: "Remote".to_string(),
                location: "Oslo".to_string(),
                country: "Norway".to_string(),
                ..Default::default()
            }])
        }

        async fn upsert(&self, persona: &Persona) -> Result<()> {
            if self.upsert_fails {
                return Err(anyhow!("write refused"));
            }
            self.upserts.lock().unwrap().push(persona.id.clone());
            Ok(())
        }

        async fn delete(&self, _id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn local_persona(id: &str) -> Persona {
        Persona {
            id: id.to_string(),
            name: "Local".to_string(),
            location: "Zagreb".to_string(),
            country: "Croatia".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_record_round_trip_normalizes_absent_lists() {
        let persona = Persona {
            id: "p1".to_string(),
            name: "Ana".to_string(),
            location: "Zagreb".to_string(),
            country: "Croatia".to_string(),
            niche: vec![],
            bio: "bio".to_string(),
            avatar_url: "https://cdn.example.com/a.png".to_string(),
            ref_images: vec![],
        };

        let record = map_persona_to_record(&persona);
        assert!(record.niche.is_none());
        assert!(record.ref_images.is_none());

        let back = map_persona_from_record(record);
        assert_eq!(back, persona);
    }

    #[test]
    fn test_record_round_trip_keeps_populated_lists() {
        let persona = Persona {
            id: "p1".to_string(),
            name: "Ana".to_string(),
            location: "Zagreb".to_string(),
            country: "Croatia".to_string(),
            niche: vec!["coffee".to_string()],
            bio: String::new(),
            avatar_url: String::new(),
            ref_images: vec!["https://cdn.example.com/r.jpg".to_string()],
        };

        let json = serde_json::to_string(&map_persona_to_record(&persona)).unwrap();
        assert!(json.contains("refImages"), "wire format is camelCase");

        let record: PersonaRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(map_persona_from_record(record), persona);
    }

    #[tokio::test]
    async fn test_load_failure_falls_back_to_seed_data() {
        let directory = PersonaDirectory::load(Box::new(MockPersonaStore::new(true, false))).await;

        assert!(!directory.is_connected());
        assert!(!directory.personas().is_empty());
        assert!(directory.get("seed-ana").is_some());
    }

    #[tokio::test]
    async fn test_disconnected_writes_stay_local_only() {
        let mut directory =
            PersonaDirectory::load(Box::new(MockPersonaStore::new(true, false))).await;

        directory.upsert(local_persona("new-1")).await.unwrap();
        assert!(directory.get("new-1").is_some());
        assert_eq!(directory.sync_status("new-1"), Some(SyncStatus::Failed));
    }

    #[tokio::test]
    async fn test_connected_upsert_syncs_and_moves_to_front() {
        let store = MockPersonaStore::new(false, false);
        let upserts = store.upserts.clone();
        let mut directory = PersonaDirectory::load(Box::new(store)).await;
        assert!(directory.is_connected());

        directory.upsert(local_persona("new-1")).await.unwrap();
        assert_eq!(directory.personas()[0].id, "new-1");
        assert_eq!(directory.sync_status("new-1"), Some(SyncStatus::Synced));
        assert_eq!(*upserts.lock().unwrap(), vec!["new-1".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_remote_write_keeps_local_state_and_surfaces() {
        let mut directory =
            PersonaDirectory::load(Box::new(MockPersonaStore::new(false, true))).await;

        let err = directory.upsert(local_persona("new-1")).await.unwrap_err();
        assert!(format!("{:#}", err).contains("saved locally only"));
        // Optimistic update is not rolled back; divergence is visible.
        assert!(directory.get("new-1").is_some());
        assert_eq!(directory.sync_status("new-1"), Some(SyncStatus::Failed));
    }

    #[tokio::test]
    async fn test_ref_image_cap() {
        #[derive(Debug)]
        struct NullBlob;

        #[async_trait]
        impl BlobStore for NullBlob {
            async fn upload(&self, _data: &[u8], key: &str, _mime: &str) -> Result<String> {
                Ok(format!("https://blobs.example.com/{}", key))
            }
        }

        let mut directory =
            PersonaDirectory::load(Box::new(MockPersonaStore::new(false, false))).await;

        for _ in 0..MAX_REF_IMAGES {
            directory
                .add_ref_image(&NullBlob, "remote-1", b"img", "image/png")
                .await
                .unwrap();
        }
        let err = directory
            .add_ref_image(&NullBlob, "remote-1", b"img", "image/png")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("reference images"));

        let persona = directory.get("remote-1").unwrap();
        assert_eq!(persona.ref_images.len(), MAX_REF_IMAGES);
        assert!(persona.ref_images[0].starts_with("https://blobs.example.com/personas/remote-1/ref-"));
    }
}
