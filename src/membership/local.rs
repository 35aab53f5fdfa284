//! In-process stand-in for a gossip transport.
//!
//! Every node registered on the same [`LocalNetwork`] can join the others by
//! address. Views are merged on join the way a push/pull gossip sync would,
//! and join/leave events are pushed into each node's [`Delegate`]. The
//! network also exposes fault injection (partitions, isolated nodes and
//! crashes) so whole clusters can be exercised inside one test process.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ::log::debug;

use super::{Delegate, Member, Membership, MembershipError};
use crate::config::Config;

const MAX_HEALTH_SCORE: usize = 8;

struct Endpoint {
    address: String,
    delegate: Delegate,
    generation: u64,
    running: bool,
    isolated: bool,
    /// Members this node currently considers alive, itself included.
    view: BTreeSet<String>,
    /// Every member this node has ever seen since it last joined.
    known: BTreeSet<String>,
    secret_key: Option<Vec<u8>>,
}

#[derive(Default)]
struct Hub {
    endpoints: BTreeMap<String, Endpoint>,
    groups: Vec<BTreeSet<String>>,
    next_generation: u64,
}

impl Hub {
    fn member(&self, id: &str) -> Option<Member> {
        self.endpoints.get(id).map(|ep| Member::new(id, &ep.address))
    }

    fn same_side(&self, a: &str, b: &str) -> bool {
        self.groups.is_empty()
            || self
                .groups
                .iter()
                .any(|group| group.contains(a) && group.contains(b))
    }

    fn running(&self, id: &str) -> bool {
        self.endpoints.get(id).is_some_and(|ep| ep.running)
    }

    fn reachable(&self, a: &str, b: &str) -> bool {
        self.running(a) && self.running(b) && self.same_side(a, b)
    }

    fn deliverable(&self, from: &str, to: &str) -> bool {
        let isolated = |id: &str| self.endpoints.get(id).is_some_and(|ep| ep.isolated);
        self.reachable(from, to) && !isolated(from) && !isolated(to)
    }

    fn current(&self, id: &str, generation: u64) -> Result<&Endpoint, MembershipError> {
        match self.endpoints.get(id) {
            Some(ep) if ep.generation == generation && ep.running => Ok(ep),
            _ => Err(MembershipError::NotRunning),
        }
    }

    /// Adds `b` to `a`'s view and tells `a` about it.
    fn link(&mut self, a: &str, b: &str) {
        let Some(member) = self.member(b) else {
            return;
        };
        if let Some(ep) = self.endpoints.get_mut(a) {
            ep.known.insert(b.to_string());
            if ep.view.insert(b.to_string()) {
                ep.delegate.notify_join(member);
            }
        }
    }

    fn unlink(&mut self, a: &str, b: &str) {
        let Some(member) = self.member(b) else {
            return;
        };
        if let Some(ep) = self.endpoints.get_mut(a) {
            if ep.view.remove(b) {
                ep.delegate.notify_leave(member);
            }
        }
    }

    /// Removes `id` from every other view, as failure detection eventually would.
    fn unlink_everywhere(&mut self, id: &str) {
        let watchers: Vec<String> = self
            .endpoints
            .iter()
            .filter(|(other, ep)| other.as_str() != id && ep.view.contains(id))
            .map(|(other, _)| other.clone())
            .collect();
        for watcher in watchers {
            self.unlink(&watcher, id);
        }
    }
}

#[derive(Clone, Default)]
pub struct LocalNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches a node to the network. Re-registering an ID that is no longer
    /// running (after a crash or shutdown) replaces the old endpoint.
    pub fn register(
        &self,
        config: &Config,
        delegate: Delegate,
    ) -> Result<LocalMembership, MembershipError> {
        let address = config.bind_addr();
        let secret_key = config
            .secret_key()
            .map_err(|e| MembershipError::Transport(e.to_string()))?;
        let mut hub = self.hub();

        if hub
            .endpoints
            .iter()
            .any(|(id, ep)| ep.running && (*id == config.id || ep.address == address))
        {
            return Err(MembershipError::Transport(format!(
                "{} or {address} is already in use",
                config.id
            )));
        }

        hub.next_generation += 1;
        let generation = hub.next_generation;
        let own: BTreeSet<String> = [config.id.clone()].into_iter().collect();
        hub.endpoints.insert(
            config.id.clone(),
            Endpoint {
                address,
                delegate,
                generation,
                running: true,
                isolated: false,
                view: own.clone(),
                known: own,
                secret_key,
            },
        );
        debug!("Registered {} on local network", config.id);

        Ok(LocalMembership {
            id: config.id.clone(),
            generation,
            network: self.clone(),
        })
    }

    /// Connector suitable for `Raft::initialize`.
    pub fn connector(
        &self,
    ) -> impl FnOnce(&Config, Delegate) -> Result<Arc<dyn Membership>, MembershipError> + Send + 'static
    {
        let network = self.clone();
        move |config: &Config, delegate: Delegate| {
            let membership = network.register(config, delegate)?;
            Ok(Arc::new(membership) as Arc<dyn Membership>)
        }
    }

    /// Splits the network. Members listed in different groups stop seeing
    /// each other; members listed in no group are cut off from everyone.
    pub fn partition(&self, groups: &[&[&str]]) {
        let mut hub = self.hub();
        hub.groups = groups
            .iter()
            .map(|group| group.iter().map(|id| id.to_string()).collect())
            .collect();

        let pairs: Vec<(String, String)> = hub
            .endpoints
            .iter()
            .flat_map(|(a, ep)| ep.view.iter().map(move |b| (a.clone(), b.clone())))
            .filter(|(a, b)| a != b)
            .collect();
        for (a, b) in pairs {
            if !hub.same_side(&a, &b) {
                hub.unlink(&a, &b);
            }
        }
    }

    /// Removes all partitions and reconnects members that knew each other.
    pub fn heal(&self) {
        let mut hub = self.hub();
        hub.groups.clear();

        let pairs: Vec<(String, String)> = hub
            .endpoints
            .iter()
            .filter(|(_, ep)| ep.running)
            .flat_map(|(a, ep)| {
                ep.known
                    .iter()
                    .filter(move |b| !ep.view.contains(*b))
                    .map(move |b| (a.clone(), b.clone()))
            })
            .collect();
        for (a, b) in pairs {
            if hub.running(&b) {
                hub.link(&a, &b);
            }
        }
    }

    /// Drops every message to and from `id` while leaving membership untouched.
    pub fn isolate(&self, id: &str) {
        if let Some(ep) = self.hub().endpoints.get_mut(id) {
            ep.isolated = true;
        }
    }

    pub fn restore(&self, id: &str) {
        if let Some(ep) = self.hub().endpoints.get_mut(id) {
            ep.isolated = false;
        }
    }

    /// Stops `id` without a graceful leave; the others see it fail.
    pub fn crash(&self, id: &str) {
        let mut hub = self.hub();
        if let Some(ep) = hub.endpoints.get_mut(id) {
            ep.running = false;
        }
        hub.unlink_everywhere(id);
    }

    /// Address a registered node listens on.
    pub fn address_of(&self, id: &str) -> Option<String> {
        self.hub().endpoints.get(id).map(|ep| ep.address.clone())
    }
}

impl LocalMembership {
    /// Key the endpoint was registered with, if any.
    pub fn secret_key(&self) -> Option<Vec<u8>> {
        let hub = self.network.hub();
        hub.current(&self.id, self.generation)
            .ok()
            .and_then(|ep| ep.secret_key.clone())
    }
}

/// One node's handle onto a [`LocalNetwork`].
pub struct LocalMembership {
    id: String,
    generation: u64,
    network: LocalNetwork,
}

impl Membership for LocalMembership {
    fn local_id(&self) -> &str {
        &self.id
    }

    fn members(&self) -> Vec<Member> {
        let hub = self.network.hub();
        match hub.current(&self.id, self.generation) {
            Ok(ep) => ep.view.iter().filter_map(|id| hub.member(id)).collect(),
            Err(_) => vec![],
        }
    }

    fn join(&self, peers: &[String]) -> Result<usize, MembershipError> {
        let mut hub = self.network.hub();
        let own_view = hub.current(&self.id, self.generation)?.view.clone();

        let targets: Vec<String> = hub
            .endpoints
            .iter()
            .filter(|(id, ep)| **id != self.id && ep.running && peers.contains(&ep.address))
            .map(|(id, _)| id.clone())
            .filter(|id| hub.same_side(&self.id, id))
            .collect();
        if targets.is_empty() {
            return Err(MembershipError::NoPeersReachable(peers.to_vec()));
        }

        let mut cluster = own_view;
        for target in &targets {
            if let Some(ep) = hub.endpoints.get(target) {
                cluster.extend(ep.view.iter().cloned());
            }
        }
        cluster.retain(|id| hub.reachable(&self.id, id));

        for a in &cluster {
            for b in &cluster {
                if a != b {
                    hub.link(a, b);
                }
            }
        }
        Ok(targets.len())
    }

    fn leave(&self, _timeout: Duration) -> Result<(), MembershipError> {
        let mut hub = self.network.hub();
        hub.current(&self.id, self.generation)?;

        hub.unlink_everywhere(&self.id);
        for ep in hub.endpoints.values_mut() {
            ep.known.remove(&self.id);
        }
        if let Some(ep) = hub.endpoints.get_mut(&self.id) {
            ep.view.retain(|id| *id == self.id);
            ep.known = ep.view.clone();
        }
        Ok(())
    }

    fn shutdown_transport(&self) -> Result<(), MembershipError> {
        let mut hub = self.network.hub();
        hub.current(&self.id, self.generation)?;
        if let Some(ep) = hub.endpoints.get_mut(&self.id) {
            ep.running = false;
        }
        hub.unlink_everywhere(&self.id);
        Ok(())
    }

    fn send(&self, member_id: &str, message: Vec<u8>) -> Result<(), MembershipError> {
        let hub = self.network.hub();
        let own = hub.current(&self.id, self.generation)?;
        if !own.view.contains(member_id) {
            return Err(MembershipError::UnknownMember(member_id.to_string()));
        }
        if !hub.deliverable(&self.id, member_id) {
            return Err(MembershipError::Unreachable(member_id.to_string()));
        }
        match hub.endpoints.get(member_id) {
            Some(target) => {
                target.delegate.notify_msg(message);
                Ok(())
            }
            None => Err(MembershipError::UnknownMember(member_id.to_string())),
        }
    }

    fn health_score(&self) -> usize {
        let hub = self.network.hub();
        match hub.current(&self.id, self.generation) {
            Ok(ep) => ep.known.difference(&ep.view).count().min(MAX_HEALTH_SCORE),
            Err(_) => MAX_HEALTH_SCORE,
        }
    }
}
