//! The resource ledger: every mediated primitive charges here before (and
//! after) doing real work.
//!
//! Renewable resources drain at their granted rate and block the charging
//! thread while oversubscribed. Fungible item resources are capacity-bounded
//! token sets. Port resources are fixed allow-sets checked per use. The
//! ledger is one explicitly-constructed object shared across every sandbox
//! thread; there is no ambient global table.

pub mod decay;

use crate::config::types::{Fungible, PortResource, Renewable, Result, SandboxError};
use crate::config::ResourceLimits;
use crate::platform::clock::RuntimeClock;
use decay::{decay, drain_seconds};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

/// Unique token identifying one fungible-item reservation.
pub type ItemToken = Uuid;

/// Mint a fresh reservation token.
pub fn new_token() -> ItemToken {
    Uuid::new_v4()
}

struct MeterState {
    consumed: f64,
    updated_at: f64,
}

/// One renewable meter; each has its own lock so chargers of different
/// resources never contend.
struct RenewableMeter {
    limit: f64,
    state: Mutex<MeterState>,
}

struct FungiblePool {
    cap: u64,
    members: Mutex<HashSet<ItemToken>>,
}

struct PortGrant {
    allowed: BTreeSet<u16>,
    used: Mutex<BTreeSet<u16>>,
}

pub struct ResourceLedger {
    clock: RuntimeClock,
    renewables: HashMap<Renewable, RenewableMeter>,
    fungibles: HashMap<Fungible, FungiblePool>,
    ports: HashMap<PortResource, PortGrant>,
}

// A poisoned meter lock means some charger panicked mid-update; the meter
// value itself is still sound (floats, no tearing), so keep enforcing.
fn relock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ResourceLedger {
    pub fn new(limits: &ResourceLimits, clock: RuntimeClock) -> ResourceLedger {
        let start = clock.now();
        let mut renewables = HashMap::new();
        for resource in Renewable::ALL {
            renewables.insert(
                resource,
                RenewableMeter {
                    limit: limits.renewable_rate(resource),
                    state: Mutex::new(MeterState {
                        consumed: 0.0,
                        updated_at: start,
                    }),
                },
            );
        }
        let mut fungibles = HashMap::new();
        for resource in Fungible::ALL {
            fungibles.insert(
                resource,
                FungiblePool {
                    cap: limits.fungible_cap(resource),
                    members: Mutex::new(HashSet::new()),
                },
            );
        }
        let mut ports = HashMap::new();
        for resource in [PortResource::MessPort, PortResource::ConnPort] {
            ports.insert(
                resource,
                PortGrant {
                    allowed: limits.allowed_ports(resource),
                    used: Mutex::new(BTreeSet::new()),
                },
            );
        }
        ResourceLedger {
            clock,
            renewables,
            fungibles,
            ports,
        }
    }

    /// Charge `amount` units against a renewable resource, blocking until
    /// consumption drains back under the granted rate. `amount` may be zero,
    /// which is the "wait for headroom" barrier used before real I/O.
    ///
    /// The meter lock is dropped across each sleep so concurrent chargers
    /// interleave; the loop re-checks because they may have pushed the meter
    /// back over quota in the meantime.
    pub fn charge_renewable(&self, resource: Renewable, amount: f64) -> Result<()> {
        if amount < 0.0 || !amount.is_finite() {
            crate::fatal::internal_error(&format!(
                "resource '{}' charged a negative or non-finite quantity {}",
                resource, amount
            ));
        }
        let meter = &self.renewables[&resource];
        if meter.limit == 0.0 {
            return Err(SandboxError::Starved(resource.name()));
        }

        let mut state = relock(&meter.state);
        let now = self.clock.now();
        state.consumed = decay(state.consumed, now - state.updated_at, meter.limit);
        state.updated_at = now;
        state.consumed += amount;

        while state.consumed > meter.limit {
            let wait = drain_seconds(state.consumed, meter.limit);
            drop(state);
            std::thread::sleep(Duration::from_secs_f64(wait));
            state = relock(&meter.state);
            let now = self.clock.now();
            state.consumed = decay(state.consumed, now - state.updated_at, meter.limit);
            state.updated_at = now;
        }
        Ok(())
    }

    /// Record a fungible reservation. The token is recorded before the cap
    /// check, so on `ResourceExceeded` the caller still owns a matching
    /// `release_item` — release stays symmetric whether or not the
    /// reservation succeeded.
    pub fn reserve_item(&self, resource: Fungible, token: ItemToken) -> Result<()> {
        let pool = &self.fungibles[&resource];
        let mut members = relock(&pool.members);
        members.insert(token);
        if members.len() as u64 > pool.cap {
            return Err(SandboxError::ResourceExceeded(resource.name()));
        }
        Ok(())
    }

    /// Release a fungible reservation. Releasing an absent token is not an
    /// error.
    pub fn release_item(&self, resource: Fungible, token: &ItemToken) {
        let pool = &self.fungibles[&resource];
        relock(&pool.members).remove(token);
    }

    /// Keep retrying a reservation until a slot frees up. Used where the
    /// caller would rather wait than fail (event dispatch). The token stays
    /// recorded between attempts.
    pub fn reserve_item_blocking(&self, resource: Fungible, token: ItemToken) {
        loop {
            match self.reserve_item(resource, token) {
                Ok(()) => return,
                Err(_) => std::thread::sleep(Duration::from_millis(100)),
            }
        }
    }

    /// Check a discrete grant (a port number) against its allow-set and
    /// record the usage.
    pub fn check_individual(&self, resource: PortResource, port: u16) -> Result<()> {
        let grant = &self.ports[&resource];
        if !grant.allowed.contains(&port) {
            return Err(SandboxError::Denied {
                resource: resource.name(),
                port,
            });
        }
        relock(&grant.used).insert(port);
        Ok(())
    }

    /// Current (decayed) consumption of a renewable resource.
    pub fn renewable_consumption(&self, resource: Renewable) -> f64 {
        let meter = &self.renewables[&resource];
        let state = relock(&meter.state);
        decay(
            state.consumed,
            self.clock.now() - state.updated_at,
            meter.limit,
        )
    }

    /// Live member count of a fungible pool.
    pub fn item_count(&self, resource: Fungible) -> usize {
        relock(&self.fungibles[&resource].members).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceLimits;
    use std::sync::Arc;
    use std::time::Instant;

    fn limits_with(renewable: &[(Renewable, f64)], fungible: &[(Fungible, u64)]) -> ResourceLimits {
        let mut limits = ResourceLimits::default();
        limits.renewable.insert(Renewable::Cpu, 0.5);
        limits.memory = 1 << 20;
        limits.diskused = 1 << 20;
        for (r, v) in renewable {
            limits.renewable.insert(*r, *v);
        }
        for (f, v) in fungible {
            limits.fungible.insert(*f, *v);
        }
        limits
    }

    fn ledger(renewable: &[(Renewable, f64)], fungible: &[(Fungible, u64)]) -> ResourceLedger {
        ResourceLedger::new(&limits_with(renewable, fungible), RuntimeClock::start())
    }

    #[test]
    fn leaky_bucket_blocks_for_the_expected_interval() {
        // Limit 10/sec, six charges of 5 units: 30 units total can only
        // clear once (30-10)/10 = 2 seconds have drained away. The charge
        // that pushes the meter over blocks until it is back under quota.
        let ledger = ledger(&[(Renewable::NetSend, 10.0)], &[]);
        let start = Instant::now();
        for _ in 0..6 {
            ledger.charge_renewable(Renewable::NetSend, 5.0).unwrap();
        }
        let waited = start.elapsed().as_secs_f64();
        assert!(waited > 1.5, "drained too fast: {:.2}s", waited);
        assert!(waited < 4.0, "drained too slow: {:.2}s", waited);

        // With the meter drained to its limit, a zero-quantity barrier
        // passes straight through.
        let start = Instant::now();
        ledger.charge_renewable(Renewable::NetSend, 0.0).unwrap();
        assert!(start.elapsed().as_secs_f64() < 0.5);
    }

    #[test]
    fn zero_amount_never_increases_consumption() {
        let ledger = ledger(&[(Renewable::FileRead, 100.0)], &[]);
        ledger.charge_renewable(Renewable::FileRead, 50.0).unwrap();
        let before = ledger.renewable_consumption(Renewable::FileRead);
        ledger.charge_renewable(Renewable::FileRead, 0.0).unwrap();
        let after = ledger.renewable_consumption(Renewable::FileRead);
        assert!(after <= before + 1e-9);
    }

    #[test]
    fn zero_limit_starves_immediately() {
        let ledger = ledger(&[], &[]);
        let start = Instant::now();
        let err = ledger
            .charge_renewable(Renewable::NetSend, 0.0)
            .unwrap_err();
        assert!(matches!(err, SandboxError::Starved("netsend")));
        assert!(start.elapsed().as_millis() < 100, "Starved must not block");
    }

    #[test]
    fn fungible_cap_enforced_at_the_boundary() {
        let ledger = ledger(&[], &[(Fungible::OutSockets, 3)]);
        let tokens: Vec<ItemToken> = (0..3).map(|_| new_token()).collect();
        for t in &tokens {
            ledger.reserve_item(Fungible::OutSockets, *t).unwrap();
        }
        // A 4th distinct token must be refused, but stays recorded for the
        // caller's symmetric release.
        let extra = new_token();
        assert!(matches!(
            ledger.reserve_item(Fungible::OutSockets, extra),
            Err(SandboxError::ResourceExceeded("outsockets"))
        ));
        ledger.release_item(Fungible::OutSockets, &extra);

        // Releasing one member makes room again at exactly the cap.
        ledger.release_item(Fungible::OutSockets, &tokens[0]);
        ledger.reserve_item(Fungible::OutSockets, new_token()).unwrap();
        assert_eq!(ledger.item_count(Fungible::OutSockets), 3);
    }

    #[test]
    fn releasing_an_absent_token_is_not_an_error() {
        let ledger = ledger(&[], &[(Fungible::Events, 1)]);
        ledger.release_item(Fungible::Events, &new_token());
    }

    #[test]
    fn port_allow_set_membership() {
        let mut limits = limits_with(&[], &[]);
        limits
            .ports
            .entry(PortResource::MessPort)
            .or_default()
            .insert(12345);
        let ledger = ResourceLedger::new(&limits, RuntimeClock::start());
        ledger.check_individual(PortResource::MessPort, 12345).unwrap();
        assert!(matches!(
            ledger.check_individual(PortResource::MessPort, 54321),
            Err(SandboxError::Denied { port: 54321, .. })
        ));
        assert!(matches!(
            ledger.check_individual(PortResource::ConnPort, 12345),
            Err(SandboxError::Denied { .. })
        ));
    }

    #[test]
    fn concurrent_chargers_all_get_through() {
        let ledger = Arc::new(ledger(&[(Renewable::LoopSend, 1000.0)], &[]));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let ledger = Arc::clone(&ledger);
            handles.push(std::thread::spawn(move || {
                for _ in 0..10 {
                    ledger.charge_renewable(Renewable::LoopSend, 10.0).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // 400 units against 1000/sec: everyone finishes well under a second
        // of drain debt.
        assert!(ledger.renewable_consumption(Renewable::LoopSend) <= 1000.0 + 1e-6);
    }
}
