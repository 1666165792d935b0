//! # Routing Subsystem Module
//!
//! Routes are ordered, keyed lists of endpoints that an MSU may emit to.
//! Each route delivers to exactly one MSU type; each endpoint names a
//! target MSU instance and its locality (on this runtime or on a peer).
//!
//! ## Strategies
//!
//! Endpoint selection is pluggable per destination MSU type:
//!
//! - **Key-based** (the default): the endpoint with the smallest key ≥ the
//!   message key, wrapping to the first endpoint past the largest key.
//!   Backs consistent range sharding.
//! - **Shortest-queue**: the local endpoint whose owning worker currently
//!   has the shortest (approximate, possibly stale) data queue; ties break
//!   toward the lower MSU id.
//! - **Origin-runtime**: the endpoint located on the runtime the envelope
//!   originally arrived from.
//!
//! Targeted sends (`call_local`) use [`Route::endpoint_to_msu`] directly
//! rather than a strategy.
//!
//! ## Concurrency
//!
//! Routes are read-mostly. The endpoint list sits behind a per-route
//! reader-writer lock: structural changes (MODIFY_ROUTE) take the write
//! side for the duration of the splice, readers snapshot a consistent list
//! under the read side. Within one route, endpoint keys are strictly
//! increasing, which keeps lookups a binary search and makes "ties broken
//! by insertion order" vacuous.
//!
//! The [`RouteTable`] is the id-keyed arena for routes: MSUs hold
//! `Arc<Route>` references and all cross-references elsewhere are plain
//! route ids, so no reference cycles form across threads.

use crate::error::{CoreError, CoreResult};
use crate::message::{
    Envelope, ModifyRoutePayload, MsuId, MsuTypeId, RouteId, RouteOp, RuntimeId, WireLocality,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Where an endpoint's target MSU lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locality {
    Local,
    Remote(RuntimeId),
}

/// One entry in a route: key, target MSU, locality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub key: i32,
    pub msu_id: MsuId,
    pub locality: Locality,
}

/// Routing strategy selected per destination MSU type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteStrategy {
    #[default]
    KeyBased,
    ShortestQueue,
    OriginRuntime,
}

/// An ordered, keyed set of endpoints delivering to one MSU type.
pub struct Route {
    pub id: RouteId,
    pub target_type: MsuTypeId,
    endpoints: RwLock<Vec<Endpoint>>,
}

impl Route {
    pub fn new(id: RouteId, target_type: MsuTypeId) -> Self {
        Self {
            id,
            target_type,
            endpoints: RwLock::new(Vec::new()),
        }
    }

    /// Insert an endpoint, preserving the strictly-increasing key order.
    ///
    /// A second endpoint with an existing key is a conflict.
    pub fn add_endpoint(&self, endpoint: Endpoint) -> CoreResult<()> {
        let mut eps = self.endpoints.write();
        match eps.binary_search_by_key(&endpoint.key, |e| e.key) {
            Ok(_) => Err(CoreError::EndpointConflict {
                route_id: self.id,
                key: endpoint.key,
            }),
            Err(pos) => {
                eps.insert(pos, endpoint);
                Ok(())
            }
        }
    }

    /// Remove the endpoint at `key`.
    pub fn remove_endpoint(&self, key: i32) -> CoreResult<Endpoint> {
        let mut eps = self.endpoints.write();
        match eps.binary_search_by_key(&key, |e| e.key) {
            Ok(pos) => Ok(eps.remove(pos)),
            Err(_) => Err(CoreError::EndpointConflict {
                route_id: self.id,
                key,
            }),
        }
    }

    /// Re-point the endpoint at `key` to a new target without changing its
    /// position in the key order.
    pub fn modify_endpoint(&self, key: i32, msu_id: MsuId, locality: Locality) -> CoreResult<()> {
        let mut eps = self.endpoints.write();
        match eps.binary_search_by_key(&key, |e| e.key) {
            Ok(pos) => {
                eps[pos].msu_id = msu_id;
                eps[pos].locality = locality;
                Ok(())
            }
            Err(_) => Err(CoreError::EndpointConflict {
                route_id: self.id,
                key,
            }),
        }
    }

    /// Key-based selection: smallest endpoint key ≥ `key`, wrapping to the
    /// first endpoint when `key` exceeds the largest.
    pub fn endpoint_for_key(&self, key: i32) -> CoreResult<Endpoint> {
        let eps = self.endpoints.read();
        if eps.is_empty() {
            return Err(CoreError::EndpointNotFound { route_id: self.id });
        }
        let pos = match eps.binary_search_by_key(&key, |e| e.key) {
            Ok(pos) => pos,
            Err(pos) if pos == eps.len() => 0,
            Err(pos) => pos,
        };
        Ok(eps[pos])
    }

    /// Targeted lookup: the endpoint for `msu_id`, iff present on this
    /// route.
    pub fn endpoint_to_msu(&self, msu_id: MsuId) -> CoreResult<Endpoint> {
        let eps = self.endpoints.read();
        eps.iter()
            .find(|e| e.msu_id == msu_id)
            .copied()
            .ok_or(CoreError::EndpointNotFound { route_id: self.id })
    }

    /// The endpoint located on `runtime_id`, where `local_runtime_id`
    /// resolves which endpoints count as being "on" this process.
    pub fn endpoint_on_runtime(
        &self,
        runtime_id: RuntimeId,
        local_runtime_id: RuntimeId,
    ) -> CoreResult<Endpoint> {
        let eps = self.endpoints.read();
        eps.iter()
            .find(|e| match e.locality {
                Locality::Local => runtime_id == local_runtime_id,
                Locality::Remote(rt) => rt == runtime_id,
            })
            .copied()
            .ok_or(CoreError::EndpointNotFound { route_id: self.id })
    }

    /// Shortest-queue selection over LOCAL endpoints only.
    ///
    /// `queue_len` reports the approximate data-queue length of the worker
    /// owning an MSU, or `None` when the MSU has no known placement (such
    /// endpoints are skipped). Staleness is tolerated; ties break toward
    /// the lower MSU id.
    pub fn shortest_queue(
        &self,
        queue_len: &dyn Fn(MsuId) -> Option<usize>,
    ) -> CoreResult<Endpoint> {
        let eps = self.endpoints.read();
        let mut best: Option<(usize, Endpoint)> = None;
        for ep in eps.iter().filter(|e| e.locality == Locality::Local) {
            let Some(len) = queue_len(ep.msu_id) else {
                continue;
            };
            let better = match best {
                None => true,
                Some((best_len, best_ep)) => {
                    len < best_len || (len == best_len && ep.msu_id < best_ep.msu_id)
                }
            };
            if better {
                best = Some((len, *ep));
            }
        }
        best.map(|(_, ep)| ep)
            .ok_or(CoreError::EndpointNotFound { route_id: self.id })
    }

    /// A consistent snapshot of the endpoint list.
    pub fn snapshot(&self) -> Vec<Endpoint> {
        self.endpoints.read().clone()
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.read().is_empty()
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("target_type", &self.target_type)
            .field("endpoints", &self.snapshot())
            .finish()
    }
}

/// Context a strategy may consult while selecting an endpoint.
pub struct StrategyContext<'a> {
    pub local_runtime_id: RuntimeId,
    pub queue_len: &'a dyn Fn(MsuId) -> Option<usize>,
}

/// Apply `strategy` to pick the next endpoint for `env` on `route`.
pub fn select_endpoint(
    route: &Route,
    strategy: RouteStrategy,
    env: &Envelope,
    cx: &StrategyContext<'_>,
) -> CoreResult<Endpoint> {
    match strategy {
        RouteStrategy::KeyBased => route.endpoint_for_key(env.key),
        RouteStrategy::ShortestQueue => route.shortest_queue(cx.queue_len),
        RouteStrategy::OriginRuntime => {
            let origin = env
                .origin_runtime
                .ok_or(CoreError::EndpointNotFound { route_id: route.id })?;
            route.endpoint_on_runtime(origin, cx.local_runtime_id)
        }
    }
}

/// Id-keyed arena of routes for one runtime.
#[derive(Default)]
pub struct RouteTable {
    routes: RwLock<HashMap<RouteId, Arc<Route>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a route with an empty endpoint set.
    pub fn create(&self, id: RouteId, target_type: MsuTypeId) -> CoreResult<Arc<Route>> {
        let mut routes = self.routes.write();
        if routes.contains_key(&id) {
            return Err(CoreError::RouteExists(id));
        }
        let route = Arc::new(Route::new(id, target_type));
        routes.insert(id, Arc::clone(&route));
        debug!(route_id = id, target_type, "created route");
        Ok(route)
    }

    pub fn get(&self, id: RouteId) -> CoreResult<Arc<Route>> {
        self.routes
            .read()
            .get(&id)
            .cloned()
            .ok_or(CoreError::UnknownRoute(id))
    }

    /// Drop the table's reference. The route itself lives until the last
    /// MSU holding it lets go.
    pub fn remove(&self, id: RouteId) -> CoreResult<()> {
        self.routes
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(CoreError::UnknownRoute(id))
    }

    /// Apply a MODIFY_ROUTE mutation from the controller.
    pub fn apply_modify(&self, msg: &ModifyRoutePayload) -> CoreResult<()> {
        let route = self.get(msg.route_id)?;
        let locality = match msg.locality {
            WireLocality::Local => Locality::Local,
            WireLocality::Remote => Locality::Remote(msg.runtime_id),
        };
        match msg.op {
            RouteOp::AddEndpoint => route.add_endpoint(Endpoint {
                key: msg.key,
                msu_id: msg.msu_id,
                locality,
            }),
            RouteOp::DelEndpoint => route.remove_endpoint(msg.key).map(|_| ()),
            RouteOp::ModEndpoint => route.modify_endpoint(msg.key, msg.msu_id, locality),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn local(key: i32, msu_id: MsuId) -> Endpoint {
        Endpoint {
            key,
            msu_id,
            locality: Locality::Local,
        }
    }

    fn route_with(endpoints: &[Endpoint]) -> Route {
        let route = Route::new(1, 10);
        for ep in endpoints {
            route.add_endpoint(*ep).unwrap();
        }
        route
    }

    #[test]
    fn key_lookup_picks_smallest_key_at_least_message_key() {
        let route = route_with(&[local(10, 20), local(20, 21), local(30, 22)]);
        let expect = [
            (5, 20),
            (10, 20),
            (15, 21),
            (20, 21),
            (25, 22),
            (30, 22),
            (35, 20), // past the largest key: wrap to the first endpoint
        ];
        for (key, msu) in expect {
            assert_eq!(route.endpoint_for_key(key).unwrap().msu_id, msu, "key {key}");
        }
    }

    #[test]
    fn key_lookup_on_empty_route_fails() {
        let route = Route::new(3, 10);
        assert!(matches!(
            route.endpoint_for_key(0).unwrap_err(),
            CoreError::EndpointNotFound { route_id: 3 }
        ));
    }

    /// Randomized check of the lookup against a linear-scan reference.
    #[test]
    fn key_lookup_matches_linear_reference() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let mut keys: Vec<i32> = (0..rng.gen_range(1..20))
                .map(|_| rng.gen_range(-1000..1000))
                .collect();
            keys.sort_unstable();
            keys.dedup();
            let route = route_with(
                &keys
                    .iter()
                    .enumerate()
                    .map(|(i, &k)| local(k, 100 + i as u32))
                    .collect::<Vec<_>>(),
            );
            for _ in 0..50 {
                let probe = rng.gen_range(-1100..1100);
                let reference = keys
                    .iter()
                    .find(|&&k| k >= probe)
                    .or_else(|| keys.first())
                    .unwrap();
                let got = route.endpoint_for_key(probe).unwrap();
                assert_eq!(got.key, *reference);
            }
        }
    }

    #[test]
    fn duplicate_key_is_a_conflict() {
        let route = route_with(&[local(10, 20)]);
        let err = route.add_endpoint(local(10, 99)).unwrap_err();
        assert!(matches!(err, CoreError::EndpointConflict { key: 10, .. }));
        // Inserting out of order still lands sorted.
        route.add_endpoint(local(5, 19)).unwrap();
        let keys: Vec<i32> = route.snapshot().iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![5, 10]);
    }

    #[test]
    fn shortest_queue_picks_least_loaded_local_endpoint() {
        let route = route_with(&[local(0, 10), local(1, 11), local(2, 12)]);
        let lens = |msu: MsuId| -> Option<usize> {
            match msu {
                10 => Some(5),
                11 => Some(1),
                12 => Some(3),
                _ => None,
            }
        };
        assert_eq!(route.shortest_queue(&lens).unwrap().msu_id, 11);
    }

    #[test]
    fn shortest_queue_breaks_ties_by_id_and_skips_remote() {
        let route = Route::new(1, 10);
        route
            .add_endpoint(Endpoint {
                key: 0,
                msu_id: 9,
                locality: Locality::Remote(2),
            })
            .unwrap();
        route.add_endpoint(local(1, 12)).unwrap();
        route.add_endpoint(local(2, 11)).unwrap();
        let lens = |_msu: MsuId| Some(4usize);
        // Remote #9 is never considered; equal lengths prefer the lower id.
        assert_eq!(route.shortest_queue(&lens).unwrap().msu_id, 11);
    }

    #[test]
    fn origin_runtime_strategy_requires_an_origin() {
        let route = Route::new(1, 10);
        route
            .add_endpoint(Endpoint {
                key: 0,
                msu_id: 30,
                locality: Locality::Remote(7),
            })
            .unwrap();
        route.add_endpoint(local(1, 31)).unwrap();

        let cx = StrategyContext {
            local_runtime_id: 1,
            queue_len: &|_| None,
        };
        let from_peer = Envelope::new(99, 0, Vec::new()).with_origin(7);
        let picked =
            select_endpoint(&route, RouteStrategy::OriginRuntime, &from_peer, &cx).unwrap();
        assert_eq!(picked.msu_id, 30);

        // An origin equal to the local runtime id selects local endpoints.
        let from_self = Envelope::new(99, 0, Vec::new()).with_origin(1);
        let picked =
            select_endpoint(&route, RouteStrategy::OriginRuntime, &from_self, &cx).unwrap();
        assert_eq!(picked.msu_id, 31);

        // No origin recorded: the strategy cannot apply.
        let unstamped = Envelope::new(99, 0, Vec::new());
        assert!(select_endpoint(&route, RouteStrategy::OriginRuntime, &unstamped, &cx).is_err());
    }

    #[test]
    fn modify_route_ops_round_trip() {
        let table = RouteTable::new();
        table.create(5, 10).unwrap();
        table
            .apply_modify(&ModifyRoutePayload {
                route_id: 5,
                op: RouteOp::AddEndpoint,
                key: 10,
                msu_id: 20,
                locality: WireLocality::Local,
                runtime_id: 0,
            })
            .unwrap();
        table
            .apply_modify(&ModifyRoutePayload {
                route_id: 5,
                op: RouteOp::ModEndpoint,
                key: 10,
                msu_id: 21,
                locality: WireLocality::Remote,
                runtime_id: 3,
            })
            .unwrap();
        let route = table.get(5).unwrap();
        assert_eq!(
            route.snapshot(),
            vec![Endpoint {
                key: 10,
                msu_id: 21,
                locality: Locality::Remote(3),
            }]
        );
        table
            .apply_modify(&ModifyRoutePayload {
                route_id: 5,
                op: RouteOp::DelEndpoint,
                key: 10,
                msu_id: 0,
                locality: WireLocality::Local,
                runtime_id: 0,
            })
            .unwrap();
        assert!(route.is_empty());
        // Unknown route id surfaces as such, not as an endpoint error.
        assert!(matches!(
            table
                .apply_modify(&ModifyRoutePayload {
                    route_id: 99,
                    op: RouteOp::AddEndpoint,
                    key: 0,
                    msu_id: 0,
                    locality: WireLocality::Local,
                    runtime_id: 0,
                })
                .unwrap_err(),
            CoreError::UnknownRoute(99)
        ));
    }

    #[test]
    fn duplicate_route_id_is_rejected() {
        let table = RouteTable::new();
        table.create(5, 10).unwrap();
        assert!(matches!(
            table.create(5, 11).unwrap_err(),
            CoreError::RouteExists(5)
        ));
    }
}
