use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use email_service::{models::template::Template, store::TemplateCache};
use uuid::Uuid;

/// In-process stand-in for the Redis template cache.
#[derive(Default)]
pub struct MapCache {
    entries: Mutex<HashMap<Uuid, Template>>,
    broken: AtomicBool,
    pub hits: AtomicUsize,
    pub invalidations: AtomicUsize,
}

impl MapCache {
    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.entries.lock().unwrap().contains_key(&id)
    }

    /// Plants a stale copy, as if another process had cached an older version.
    pub fn plant(&self, template: Template) {
        self.entries.lock().unwrap().insert(template.id, template);
    }

    fn check(&self) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            Err(anyhow!("cache is down"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TemplateCache for MapCache {
    async fn get(&self, id: Uuid) -> Result<Option<Template>> {
        self.check()?;
        let found = self.entries.lock().unwrap().get(&id).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
        Ok(found)
    }

    async fn put(&self, template: &Template) -> Result<()> {
        self.check()?;
        self.entries
            .lock()
            .unwrap()
            .insert(template.id, template.clone());
        Ok(())
    }

    async fn invalidate(&self, id: Uuid) -> Result<()> {
        self.check()?;
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().unwrap().remove(&id);
        Ok(())
    }
}
