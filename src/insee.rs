// 🗺️ INSEE Resolution - (postal code, city) → commune code via geo.api.gouv.fr
// Results are cached in the `insee_mapping` artifact between runs.

use crate::config::ApiConfig;
use crate::fetcher::{Throttle, Transport};
use crate::reconciler::EntityKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedCommune {
    pub insee_code: String,
    pub commune_name: String,
}

/// Keyed by `"{postal}|{city}"`
pub type InseeMapping = BTreeMap<String, ResolvedCommune>;

pub fn location_key(postal_code: &str, city: &str) -> String {
    format!("{}|{}", postal_code.trim(), city.trim())
}

/// INSEE code → commune name, for valid codes only
pub fn names_by_code(mapping: &InseeMapping) -> BTreeMap<EntityKey, String> {
    mapping
        .values()
        .filter_map(|r| Some((EntityKey::insee(&r.insee_code)?, r.commune_name.clone())))
        .collect()
}

#[derive(Debug, Deserialize)]
struct GeoCommune {
    code: String,
    nom: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveStats {
    pub cached: usize,
    pub resolved: usize,
    pub by_name: usize,
    pub fallback: usize,
    pub unresolved: usize,
}

pub struct GeoResolver<'t, T: Transport + ?Sized> {
    transport: &'t T,
    communes_url: String,
    throttle: Throttle,
}

impl<'t, T: Transport + ?Sized> GeoResolver<'t, T> {
    pub fn new(transport: &'t T, api: &ApiConfig) -> Self {
        GeoResolver {
            transport,
            communes_url: format!("{}/communes", api.base_url.trim_end_matches('/')),
            throttle: Throttle::new(api.delay()),
        }
    }

    fn candidates(&mut self, postal_code: &str) -> Option<Vec<GeoCommune>> {
        let query = vec![("codePostal".to_string(), postal_code.to_string())];
        self.throttle.wait();

        let body = match self.transport.get(&self.communes_url, &query) {
            Ok(body) => body,
            Err(e) => {
                warn!(postal_code, error = %e, "geo lookup failed");
                return None;
            }
        };
        match serde_json::from_slice(&body) {
            Ok(communes) => Some(communes),
            Err(e) => {
                warn!(postal_code, error = %e, "geo response not understood");
                None
            }
        }
    }

    /// One location; the name match is case-insensitive
    pub fn resolve(&mut self, postal_code: &str, city: &str, stats: &mut ResolveStats) -> Option<ResolvedCommune> {
        let communes = self.candidates(postal_code)?;

        let chosen = match communes.len() {
            0 => None,
            1 => {
                stats.resolved += 1;
                communes.into_iter().next()
            }
            n => {
                let wanted = city.trim().to_lowercase();
                let position = communes.iter().position(|c| c.nom.to_lowercase() == wanted);
                match position {
                    Some(index) => {
                        stats.by_name += 1;
                        communes.into_iter().nth(index)
                    }
                    None => {
                        stats.fallback += 1;
                        debug!(postal_code, city, options = n, "no name match, first commune used");
                        communes.into_iter().next()
                    }
                }
            }
        };

        chosen.map(|c| ResolvedCommune {
            insee_code: c.code,
            commune_name: c.nom,
        })
    }

    /// Fill `mapping` for every location not already cached
    pub fn resolve_all<'a>(
        &mut self,
        locations: impl IntoIterator<Item = (&'a str, &'a str)>,
        mapping: &mut InseeMapping,
    ) -> ResolveStats {
        let mut stats = ResolveStats::default();

        for (postal_code, city) in locations {
            let key = location_key(postal_code, city);
            if mapping.contains_key(&key) {
                stats.cached += 1;
                continue;
            }
            match self.resolve(postal_code, city, &mut stats) {
                Some(resolved) => {
                    mapping.insert(key, resolved);
                }
                None => stats.unresolved += 1,
            }
        }

        info!(
            cached = stats.cached,
            resolved = stats.resolved,
            by_name = stats.by_name,
            fallback = stats.fallback,
            unresolved = stats.unresolved,
            "INSEE mapping updated"
        );
        stats
    }
}
