//! Parameter mutation policy.
//!
//! After each request the route's parameters get new values. Parameters
//! whose current value reached a query of the latest request are moved to
//! a live value of the same column, so the next request follows data the
//! application actually stores. Everything else gets a random value of its
//! inferred type.

use crate::catalog::Route;
use crate::phase::Phase;
use crate::query::{search_queries_for_params, QueryMetadata};
use crate::rng::FuzzRng;
use log::debug;
use routefuzz_target::{Storage, StoreError};

/// What one mutation pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MutationSummary {
    /// Parameters moved to a live store value.
    pub from_store: usize,
    /// Parameters given a random value.
    pub naive: usize,
}

/// Choose values for the next request against `route`.
///
/// Store values are used only after a request that reached new source
/// lines, since the query mapping describes that request alone. When some
/// mapped parameters fed a failed query, only those are moved.
pub fn mutate_route(
    route: &mut Route,
    phase: Phase,
    src_delta: bool,
    storage: &mut dyn Storage,
    rng: &mut FuzzRng,
) -> Result<MutationSummary, StoreError> {
    let mut summary = MutationSummary::default();

    if src_delta {
        let queries = route.latest_queries().to_vec();
        search_queries_for_params(route.params_mut(), &queries);

        let mapped: Vec<(usize, bool)> = route
            .params()
            .enumerate()
            .filter(|(_, p)| !p.latest_query_metadata().is_empty())
            .map(|(i, p)| (i, tied_to_failure(p.latest_query_metadata())))
            .collect();
        let any_failed = mapped.iter().any(|(_, failed)| *failed);
        let targets: Vec<(usize, String, String)> = mapped
            .iter()
            .filter(|(_, failed)| *failed || !any_failed)
            .filter_map(|(i, _)| {
                let param = route.params().nth(*i)?;
                let md = pick_metadata(param.latest_query_metadata())?;
                Some((*i, md.table.clone(), md.column.clone()))
            })
            .collect();

        if !targets.is_empty() {
            for (i, table, column) in targets {
                if let Some(param) = route.params_mut().nth(i) {
                    let value = param.update_from_store(&table, &column, storage, rng)?;
                    debug!("{} <- {:?} from {}.{}", param.name, value, table, column);
                    summary.from_store += 1;
                }
            }
            return Ok(summary);
        }
    }

    let respect_seed = phase == Phase::Replay || src_delta;
    for param in route.params_mut() {
        param.mutate_naive(respect_seed, rng);
        summary.naive += 1;
    }
    Ok(summary)
}

fn tied_to_failure(found: &[QueryMetadata]) -> bool {
    found.iter().any(|md| !md.query.successful)
}

/// First failed match, else the first match.
fn pick_metadata(found: &[QueryMetadata]) -> Option<&QueryMetadata> {
    found
        .iter()
        .find(|md| !md.query.successful)
        .or_else(|| found.first())
}
