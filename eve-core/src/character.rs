use itertools::Itertools;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

use crate::esi_client::{AuthToken, EsiClientTrait, PaginatedResource};
use crate::pagination::BatchPager;
use eve_domain::{ActiveShip, CharacterContext, CharacterId, CharacterLocation, Error, EsiAsset, Result, ShipFitting, TradingSkills, TypeId, VerifiedCharacter};

const CONTEXT_TTL: Duration = Duration::from_secs(300);
const ASSETS_DEADLINE: Duration = Duration::from_secs(15);

/// Resolves a caller to the context route computation needs: where they
/// are, what they fly, what is fitted, and what they know.
///
/// Transient upstream trouble degrades to conservative defaults (all-zero
/// skills, empty fitting) instead of failing the request; authorization
/// failures always surface.
#[derive(Debug)]
pub struct CharacterContextResolver {
    client: Arc<dyn EsiClientTrait>,
    pager: BatchPager,
    skills_cache: Cache<CharacterId, TradingSkills>,
    fitting_cache: Cache<(CharacterId, i64), ShipFitting>,
}

impl CharacterContextResolver {
    pub fn new(client: Arc<dyn EsiClientTrait>, bp_workers: usize) -> Self {
        CharacterContextResolver {
            pager: BatchPager::new(client.clone(), bp_workers),
            client,
            skills_cache: Cache::builder().time_to_live(CONTEXT_TTL).max_capacity(10_000).build(),
            fitting_cache: Cache::builder().time_to_live(CONTEXT_TTL).max_capacity(10_000).build(),
        }
    }

    pub async fn verify(&self, token: &AuthToken, cancel: CancellationToken) -> Result<VerifiedCharacter> {
        self.client.verify(token, cancel).await
    }

    pub async fn location(&self, character_id: CharacterId, token: &AuthToken, cancel: CancellationToken) -> Result<CharacterLocation> {
        self.client.get_location(character_id, token, cancel).await
    }

    pub async fn active_ship(&self, character_id: CharacterId, token: &AuthToken, cancel: CancellationToken) -> Result<ActiveShip> {
        self.client.get_active_ship(character_id, token, cancel).await
    }

    /// Trade-relevant skill levels, cached per character. Degrades to
    /// all-zero levels (worst fees, smallest hold) on transient failure;
    /// defaults are not cached so recovery is immediate.
    pub async fn skills(&self, character_id: CharacterId, token: &AuthToken, cancel: CancellationToken) -> Result<TradingSkills> {
        if let Some(cached) = self.skills_cache.get(&character_id).await {
            return Ok(cached);
        }

        match self.client.get_skill_levels(character_id, token, cancel).await {
            Ok(levels) => {
                let skills = TradingSkills::from_skill_levels(&levels);
                self.skills_cache.insert(character_id, skills).await;
                Ok(skills)
            }
            Err(e) if e.is_degradable() => {
                event!(Level::WARN, "Skills for character {} unavailable, using conservative defaults: {}", character_id, e);
                Ok(TradingSkills::default())
            }
            Err(e) => Err(e),
        }
    }

    /// All assets of a character, paginated. The boolean reports whether
    /// every page landed.
    pub async fn assets(&self, character_id: CharacterId, token: &AuthToken, cancel: CancellationToken) -> Result<(Vec<EsiAsset>, bool)> {
        let resource = PaginatedResource::character_assets(character_id, token.clone());
        let deadline = tokio::time::Instant::now() + ASSETS_DEADLINE;
        let page_set = self.pager.fetch_all_pages(resource, deadline, cancel).await?;

        let mut assets = Vec::new();
        for (page_no, body) in &page_set.pages {
            let page: Vec<EsiAsset> =
                serde_json::from_slice(body).map_err(|e| Error::protocol(format!("asset page {page_no} of character {character_id}: {e}")))?;
            assets.extend(page);
        }
        Ok((assets, page_set.complete))
    }

    /// The modules fitted to a specific hull instance, derived from the
    /// asset list by slot tag. Cached per (character, hull); degrades to
    /// an empty fit on transient failure.
    pub async fn fitting(&self, character_id: CharacterId, ship_instance_id: i64, token: &AuthToken, cancel: CancellationToken) -> Result<ShipFitting> {
        let key = (character_id, ship_instance_id);
        if let Some(cached) = self.fitting_cache.get(&key).await {
            return Ok(cached);
        }

        match self.assets(character_id, token, cancel).await {
            Ok((assets, complete)) => {
                let modules_by_slot = assets
                    .iter()
                    .filter(|asset| asset.location_id == ship_instance_id)
                    .filter_map(|asset| asset.fitted_slot_class().map(|slot| (slot, TypeId(asset.type_id))))
                    .sorted()
                    .collect_vec();
                let fitting = ShipFitting { modules_by_slot };

                if complete {
                    self.fitting_cache.insert(key, fitting.clone()).await;
                } else {
                    event!(Level::WARN, "Asset list for character {} incomplete, fitting derived from partial data", character_id);
                }
                Ok(fitting)
            }
            Err(e) if e.is_degradable() => {
                event!(Level::WARN, "Assets for character {} unavailable, assuming empty fit: {}", character_id, e);
                Ok(ShipFitting::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Full context resolution with the per-datum degradation policy:
    /// location has no sensible default and surfaces as an authorization
    /// problem, the active ship falls back to an explicit caller choice,
    /// skills and fitting fall back to conservative defaults.
    pub async fn resolve(
        &self,
        character_id: CharacterId,
        token: &AuthToken,
        ship_choice: Option<TypeId>,
        cancel: CancellationToken,
    ) -> Result<CharacterContext> {
        let location = match self.location(character_id, token, cancel.clone()).await {
            Ok(location) => location,
            Err(e @ Error::Auth(_)) => return Err(e),
            Err(e) if e.is_degradable() => {
                return Err(Error::Auth(format!("cannot establish location of character {character_id}: {e}")));
            }
            Err(e) => return Err(e),
        };

        let active_ship = match self.active_ship(character_id, token, cancel.clone()).await {
            Ok(ship) => ship,
            Err(e @ Error::Auth(_)) => return Err(e),
            Err(e) if e.is_degradable() => match ship_choice {
                Some(type_id) => {
                    event!(Level::WARN, "Active ship of character {} unavailable, using supplied choice {}: {}", character_id, type_id, e);
                    ActiveShip { type_id, instance_id: 0 }
                }
                None => {
                    return Err(Error::Auth(format!("active ship of character {character_id} unavailable and no ship choice supplied: {e}")));
                }
            },
            Err(e) => return Err(e),
        };

        let trading_skills = self.skills(character_id, token, cancel.clone()).await?;
        let ship_fitting = self.fitting(character_id, active_ship.instance_id, token, cancel).await?;

        Ok(CharacterContext {
            character_id,
            location,
            active_ship,
            ship_fitting,
            trading_skills,
            resolved_at: chrono::Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::esi_client::{MockEsiClientTrait, PageResponse};
    use eve_domain::{SlotClass, StationId, SystemId};
    use std::collections::HashMap;

    fn token() -> AuthToken {
        AuthToken("test-token".to_string())
    }

    fn asset(item_id: i64, type_id: i32, location_id: i64, flag: &str) -> EsiAsset {
        EsiAsset {
            item_id,
            type_id,
            location_id,
            location_flag: flag.to_string(),
            is_singleton: true,
            quantity: 1,
        }
    }

    fn assets_page(assets: &[EsiAsset]) -> PageResponse {
        PageResponse {
            body: serde_json::to_vec(assets).unwrap(),
            pages: Some(1),
            expires_at: None,
            not_modified: false,
        }
    }

    fn docked_location() -> CharacterLocation {
        CharacterLocation {
            system_id: SystemId(30000142),
            station_id: Some(StationId(60003760)),
        }
    }

    #[tokio::test]
    async fn skills_are_cached_per_character() {
        let mut mock = MockEsiClientTrait::new();
        mock.expect_get_skill_levels()
            .times(1)
            .returning(|_, _, _| Ok(HashMap::from([(eve_domain::skill::ACCOUNTING, 4)])));
        let resolver = CharacterContextResolver::new(Arc::new(mock), 2);

        let first = resolver.skills(CharacterId(7), &token(), CancellationToken::new()).await.unwrap();
        let second = resolver.skills(CharacterId(7), &token(), CancellationToken::new()).await.unwrap();

        assert_eq!(first.accounting, 4);
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn transient_skill_failure_degrades_to_zero_levels() {
        let mut mock = MockEsiClientTrait::new();
        mock.expect_get_skill_levels()
            .returning(|_, _, _| Err(Error::transient("upstream 502")));
        let resolver = CharacterContextResolver::new(Arc::new(mock), 2);

        let skills = resolver.skills(CharacterId(7), &token(), CancellationToken::new()).await.unwrap();
        assert_eq!(skills, TradingSkills::default());
    }

    #[tokio::test]
    async fn auth_failure_on_skills_is_never_masked() {
        let mut mock = MockEsiClientTrait::new();
        mock.expect_get_skill_levels()
            .returning(|_, _, _| Err(Error::Auth("token expired".to_string())));
        let resolver = CharacterContextResolver::new(Arc::new(mock), 2);

        let err = resolver.skills(CharacterId(7), &token(), CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind().as_str(), "auth_error");
    }

    #[tokio::test]
    async fn fitting_filters_assets_by_hull_and_slot_tag() {
        let ship_instance = 9_000_001;
        let assets = vec![
            asset(1, 1319, ship_instance, "HiSlot0"),
            asset(2, 1405, ship_instance, "LoSlot1"),
            asset(3, 31117, ship_instance, "RigSlot0"),
            // hangar clutter and cargo never count as fitted
            asset(4, 34, ship_instance, "Cargo"),
            asset(5, 1319, 60003760, "Hangar"),
            // fitted, but to a different hull
            asset(6, 1405, 9_000_002, "LoSlot0"),
        ];
        let mut mock = MockEsiClientTrait::new();
        mock.expect_get_page().returning(move |_, _, _| Ok(assets_page(&assets)));
        let resolver = CharacterContextResolver::new(Arc::new(mock), 2);

        let fitting = resolver
            .fitting(CharacterId(7), ship_instance, &token(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            fitting.modules_by_slot,
            vec![(SlotClass::Hi, TypeId(1319)), (SlotClass::Low, TypeId(1405)), (SlotClass::Rig, TypeId(31117))]
        );
    }

    #[tokio::test]
    async fn transient_asset_failure_degrades_to_empty_fit() {
        let mut mock = MockEsiClientTrait::new();
        mock.expect_get_page().returning(|_, _, _| Err(Error::transient("upstream 503")));
        let resolver = CharacterContextResolver::new(Arc::new(mock), 2);

        let fitting = resolver
            .fitting(CharacterId(7), 9_000_001, &token(), CancellationToken::new())
            .await
            .unwrap();
        assert!(fitting.modules_by_slot.is_empty());
    }

    #[tokio::test]
    async fn resolve_uses_ship_choice_when_active_ship_is_unavailable() {
        let mut mock = MockEsiClientTrait::new();
        mock.expect_get_location().returning(|_, _, _| Ok(docked_location()));
        mock.expect_get_active_ship()
            .returning(|_, _, _| Err(Error::transient("upstream 502")));
        mock.expect_get_skill_levels().returning(|_, _, _| Ok(HashMap::new()));
        mock.expect_get_page().returning(|_, _, _| Ok(assets_page(&[])));
        let resolver = CharacterContextResolver::new(Arc::new(mock), 2);

        let ctx = resolver
            .resolve(CharacterId(7), &token(), Some(TypeId(650)), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ctx.active_ship.type_id, TypeId(650));
        assert_eq!(ctx.active_ship.instance_id, 0);
    }

    #[tokio::test]
    async fn resolve_without_ship_choice_surfaces_auth_error() {
        let mut mock = MockEsiClientTrait::new();
        mock.expect_get_location().returning(|_, _, _| Ok(docked_location()));
        mock.expect_get_active_ship()
            .returning(|_, _, _| Err(Error::transient("upstream 502")));
        let resolver = CharacterContextResolver::new(Arc::new(mock), 2);

        let err = resolver
            .resolve(CharacterId(7), &token(), None, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind().as_str(), "auth_error");
    }

    #[tokio::test]
    async fn resolve_has_no_fallback_for_location() {
        let mut mock = MockEsiClientTrait::new();
        mock.expect_get_location()
            .returning(|_, _, _| Err(Error::transient("upstream timeout")));
        let resolver = CharacterContextResolver::new(Arc::new(mock), 2);

        let err = resolver
            .resolve(CharacterId(7), &token(), Some(TypeId(650)), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind().as_str(), "auth_error");
    }

    #[tokio::test]
    async fn resolve_assembles_the_full_context() {
        let ship_instance = 9_000_001;
        let assets = vec![asset(1, 1319, ship_instance, "LoSlot0")];
        let mut mock = MockEsiClientTrait::new();
        mock.expect_get_location().returning(|_, _, _| Ok(docked_location()));
        mock.expect_get_active_ship().returning(move |_, _, _| {
            Ok(ActiveShip {
                type_id: TypeId(650),
                instance_id: ship_instance,
            })
        });
        mock.expect_get_skill_levels()
            .returning(|_, _, _| Ok(HashMap::from([(eve_domain::skill::ACCOUNTING, 5), (eve_domain::skill::NAVIGATION, 3)])));
        mock.expect_get_page().returning(move |_, _, _| Ok(assets_page(&assets)));
        let resolver = CharacterContextResolver::new(Arc::new(mock), 2);

        let ctx = resolver
            .resolve(CharacterId(7), &token(), None, CancellationToken::new())
            .await
            .unwrap();

        assert!(ctx.location.is_docked());
        assert_eq!(ctx.active_ship.instance_id, ship_instance);
        assert_eq!(ctx.trading_skills.accounting, 5);
        assert_eq!(ctx.trading_skills.navigation, 3);
        assert_eq!(ctx.ship_fitting.modules_by_slot, vec![(SlotClass::Low, TypeId(1319))]);
    }
}
