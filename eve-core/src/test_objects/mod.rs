use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::esi_client::{AuthToken, EsiClientTrait, PageResponse, PaginatedResource};
use eve_domain::{ActiveShip, CharacterId, CharacterLocation, Error, Result, VerifiedCharacter};

/// A scriptable upstream for pagination, cache, and route tests: fixed
/// page bodies, optional per-page failures, artificial latency, and
/// invocation counters.
#[derive(Debug, Default)]
pub struct FakeEsiClient {
    pub page_bodies: Vec<Vec<u8>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub expires_per_page: Vec<Option<DateTime<Utc>>>,
    pub page_delay: Duration,
    pub transient_pages: HashSet<u32>,
    pub auth_pages: HashSet<u32>,
    pub not_modified: AtomicBool,
    pub first_page_calls: AtomicUsize,
    pub page_calls: AtomicUsize,
}

impl FakeEsiClient {
    pub fn with_pages(page_bodies: Vec<Vec<u8>>) -> Self {
        FakeEsiClient {
            page_bodies,
            ..Default::default()
        }
    }

    pub fn first_page_fetches(&self) -> usize {
        self.first_page_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EsiClientTrait for FakeEsiClient {
    async fn get_page(&self, _resource: &PaginatedResource, page: u32, cancel: CancellationToken) -> Result<PageResponse> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        if page == 1 {
            self.first_page_calls.fetch_add(1, Ordering::SeqCst);
        }

        if !self.page_delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::transient("request cancelled")),
                _ = tokio::time::sleep(self.page_delay) => {}
            }
        }

        if self.not_modified.load(Ordering::SeqCst) && page == 1 {
            return Ok(PageResponse {
                body: Vec::new(),
                pages: Some(self.page_bodies.len() as u32),
                expires_at: self.expires_at,
                not_modified: true,
            });
        }

        if self.transient_pages.contains(&page) {
            return Err(Error::transient(format!("fake upstream 502 on page {page}")));
        }
        if self.auth_pages.contains(&page) {
            return Err(Error::Auth(format!("fake upstream 403 on page {page}")));
        }

        let body = self
            .page_bodies
            .get((page - 1) as usize)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("fake upstream has no page {page}")))?;

        let expires_at = self
            .expires_per_page
            .get((page - 1) as usize)
            .copied()
            .flatten()
            .or(self.expires_at);

        Ok(PageResponse {
            body,
            pages: Some(self.page_bodies.len() as u32),
            expires_at,
            not_modified: false,
        })
    }

    async fn get_location(&self, _character_id: CharacterId, _token: &AuthToken, _cancel: CancellationToken) -> Result<CharacterLocation> {
        unimplemented!("FakeEsiClient only serves pages; use MockEsiClientTrait for character endpoints")
    }

    async fn get_active_ship(&self, _character_id: CharacterId, _token: &AuthToken, _cancel: CancellationToken) -> Result<ActiveShip> {
        unimplemented!("FakeEsiClient only serves pages; use MockEsiClientTrait for character endpoints")
    }

    async fn get_skill_levels(&self, _character_id: CharacterId, _token: &AuthToken, _cancel: CancellationToken) -> Result<HashMap<i32, u8>> {
        unimplemented!("FakeEsiClient only serves pages; use MockEsiClientTrait for character endpoints")
    }

    async fn verify(&self, _token: &AuthToken, _cancel: CancellationToken) -> Result<VerifiedCharacter> {
        unimplemented!("FakeEsiClient only serves pages; use MockEsiClientTrait for character endpoints")
    }
}
