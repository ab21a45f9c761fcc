//! Core bookkeeping shared by all operations.
//!
//! The core owns what every operation needs to coordinate with its
//! siblings: the registry that maps outstanding transaction ids to
//! operations, the rotation counter that spreads load over the
//! nameserver list, the injectable id generator and the per-server RTT
//! hints.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Duration;

use crate::conf::Config;
use crate::error::Error;
use crate::idgen::IdGenerator;
use crate::ip::Ip;
use crate::op::OpId;

/// How often to draw a fresh id before giving up.
///
/// With a uniform generator the failure probability is negligible until
/// the registry is nearly saturated; the bound only keeps a saturated
/// registry from spinning.
const MAX_ID_TRIES: usize = 10;

//------------ Core ----------------------------------------------------------

/// Shared state of the resolver.
pub(crate) struct Core {
    /// The configuration the context was created with.
    pub conf: Config,

    /// Outstanding transaction ids and the operations waiting on them.
    registry: HashMap<u16, OpId>,

    /// The id source.
    idgen: Box<dyn IdGenerator>,

    /// Ever-growing rotation offset for the `rotate` option.
    rotation: usize,

    /// Smoothed-over-nothing last observed RTT per nameserver.
    rtt: HashMap<Ip, Duration>,
}

impl Core {
    /// Creates the core.
    pub fn new(conf: Config, idgen: Box<dyn IdGenerator>) -> Self {
        Core {
            conf,
            registry: HashMap::new(),
            idgen,
            rotation: 0,
            rtt: HashMap::new(),
        }
    }

    /// Draws a free transaction id and registers the operation under it.
    pub fn allocate(&mut self, op: OpId) -> Result<u16, Error> {
        for _ in 0..MAX_ID_TRIES {
            let id = self.idgen.generate();
            if let Entry::Vacant(entry) = self.registry.entry(id) {
                entry.insert(op);
                return Ok(id);
            }
        }
        Err(Error::Exhausted)
    }

    /// Re-registers an operation under the id it used before.
    ///
    /// Returns `false` when the id has been taken in the meantime; the
    /// caller then has to allocate a fresh one.
    pub fn reregister(&mut self, id: u16, op: OpId) -> bool {
        match self.registry.entry(id) {
            Entry::Vacant(entry) => {
                entry.insert(op);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// Releases a transaction id.
    pub fn unregister(&mut self, id: u16) {
        self.registry.remove(&id);
    }

    /// Returns the operation waiting on a transaction id.
    pub fn lookup(&self, id: u16) -> Option<OpId> {
        self.registry.get(&id).copied()
    }

    /// Returns the number of outstanding registrations.
    pub fn outstanding(&self) -> usize {
        self.registry.len()
    }

    /// Returns the starting nameserver index for a new operation.
    ///
    /// Without the `rotate` option every operation starts at the head of
    /// the list; with it the start advances by one per operation.
    pub fn next_start(&mut self, servers: usize) -> usize {
        if !self.conf.rotate || servers == 0 {
            return 0;
        }
        let start = self.rotation % servers;
        self.rotation = self.rotation.wrapping_add(1);
        start
    }

    /// Records an observed round-trip time for a nameserver.
    pub fn note_rtt(&mut self, ip: Ip, rtt: Duration) {
        self.rtt.insert(ip, rtt);
    }

    /// Returns the last observed round-trip time for a nameserver.
    pub fn rtt(&self, ip: Ip) -> Option<Duration> {
        self.rtt.get(&ip).copied()
    }
}

//============ Testing ======================================================
