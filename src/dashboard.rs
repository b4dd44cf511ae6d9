//! The server-side copy of the dashboard's committed filter state.
//!
//! Commits are persisted through [`ViewStore`] and trigger a background recompute of the
//! geographic groups. Recomputes are tagged with a [`Generation`] ticket so that only the
//! newest one is ever published.

use std::sync::Arc;

use anyhow::Context;
use duckdb::Connection;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::generation::Generation;
use crate::model::GeographicalGroup;
use crate::pipeline::{self, GeoRequest};
use crate::source::DuckDbSource;
use crate::views::{SavedView, ViewStore};

pub struct Dashboard {
    db: Arc<Mutex<Connection>>,
    views: Mutex<ViewStore>,
    groups: Generation<Vec<GeographicalGroup>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub generation: u64,
    pub filters: GeoRequest,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum GroupsSnapshot {
    Ready {
        generation: u64,
        groups: Vec<GeographicalGroup>,
    },
    Pending {
        generation: u64,
    },
}

impl Dashboard {
    pub fn new(db: Arc<Mutex<Connection>>, views: ViewStore) -> Arc<Self> {
        Arc::new(Self {
            db,
            views: Mutex::new(views),
            groups: Generation::new(),
        })
    }

    /// Kicks off the first recompute for whatever state was loaded from disk.
    pub async fn start(self: &Arc<Self>) -> JoinHandle<bool> {
        let views = self.views.lock().await;
        let ticket = self.groups.begin();
        self.spawn_recompute(ticket, views.current().clone())
    }

    pub async fn state(&self) -> StateSnapshot {
        let views = self.views.lock().await;
        StateSnapshot {
            generation: self.groups.current(),
            filters: views.current().clone(),
        }
    }

    pub fn groups(&self) -> GroupsSnapshot {
        let generation = self.groups.current();
        match self.groups.ready() {
            Some(groups) => GroupsSnapshot::Ready { generation, groups },
            None => GroupsSnapshot::Pending { generation },
        }
    }

    /// Persists `filters` as the current state and schedules a recompute.
    pub async fn commit(
        self: &Arc<Self>,
        filters: GeoRequest,
    ) -> anyhow::Result<(StateSnapshot, JoinHandle<bool>)> {
        let mut views = self.views.lock().await;
        views
            .set_current(filters.clone())
            .context("save dashboard state")?;
        // Ticket is taken under the views lock so generations follow commit order.
        let ticket = self.groups.begin();
        let handle = self.spawn_recompute(ticket, filters.clone());
        Ok((
            StateSnapshot {
                generation: ticket,
                filters,
            },
            handle,
        ))
    }

    pub async fn views(&self) -> Vec<SavedView> {
        self.views.lock().await.views().to_vec()
    }

    /// Saves a view; without explicit filters the current state is captured.
    pub async fn save_view(
        &self,
        name: &str,
        filters: Option<GeoRequest>,
    ) -> anyhow::Result<SavedView> {
        let mut views = self.views.lock().await;
        let filters = filters.unwrap_or_else(|| views.current().clone());
        views.create(name, filters)
    }

    pub async fn delete_view(&self, id: u64) -> anyhow::Result<bool> {
        self.views.lock().await.delete(id)
    }

    /// Makes a saved view current. `Ok(None)` if the id is unknown.
    pub async fn apply_view(
        self: &Arc<Self>,
        id: u64,
    ) -> anyhow::Result<Option<(StateSnapshot, JoinHandle<bool>)>> {
        let mut views = self.views.lock().await;
        let Some(filters) = views.apply(id)? else {
            return Ok(None);
        };
        let ticket = self.groups.begin();
        let handle = self.spawn_recompute(ticket, filters.clone());
        Ok(Some((
            StateSnapshot {
                generation: ticket,
                filters,
            },
            handle,
        )))
    }

    fn spawn_recompute(self: &Arc<Self>, ticket: u64, filters: GeoRequest) -> JoinHandle<bool> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = {
                let db = this.db.lock().await;
                if !this.groups.is_current(ticket) {
                    tracing::debug!("generation {} superseded before fetch", ticket);
                    return false;
                }
                pipeline::geographic_groups(&DuckDbSource::new(&db), &filters)
            };
            let groups = match result {
                Ok(groups) => groups,
                Err(e) => {
                    tracing::warn!("recompute for generation {} failed: {:#}", ticket, e);
                    Vec::new()
                }
            };
            let published = this.groups.publish(ticket, groups);
            if !published {
                tracing::debug!("discarded stale groups for generation {}", ticket);
            }
            published
        })
    }
}
