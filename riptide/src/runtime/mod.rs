// Riptide: Compiling Network Policies into Flow-Table Updates
// Copyright (C) 2021  Tibor Schneider
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! # Runtime
//!
//! The [`Runtime`] keeps the flow tables of all switches consistent with the policy. Every
//! change, be it a new policy, a dynamic policy assigning a new sub-policy, or a committed
//! topology change, triggers an update cycle:
//!
//! 1. The affected tables are compiled (see [`crate::compile`]), and virtual fields are packed
//!    into the VLAN tag (see [`crate::vheader`]).
//! 2. The classifier is specialized for every switch (see [`specialize()`]), and stamped with
//!    a [`Cookie`] of the next generation.
//! 3. The new rules are compared with the installed ones (see [`RuleTable::get_diff`]).
//! 4. Count and netflow buckets are told which of their rules were added, deleted or kept.
//! 5. The changes are sent to the switch driver, fenced by barriers.
//!
//! The runtime further interprets packets sent to the controller, forwards flow statistics to
//! the count buckets waiting for them, and feeds topology events into the [`NetworkView`].
//!
//! Locks are always taken in the order *policy*, *network*, *update-buckets*, and then the
//! lock of a single bucket. The switch driver is owned by a worker thread, which executes the
//! commands of each cycle in order, without holding any other lock.

mod config;
mod cookie;
mod diff;
mod driver;
mod specialize;
mod stats;

pub use config::{CompileBackend, InstallMode, RuntimeConfig};
pub use cookie::{Cookie, GenerationCounter, MAX_GENERATION, MAX_TABLE};
pub use diff::{DiffError, InstalledRule, RuleModifier, RulePatch, RuleSlot, RuleTable};
pub use driver::{
    ConcreteAction, DriverCommand, DriverError, FlowSpec, FlowStat, RecordingDriver, SwitchDriver,
};
pub use specialize::{
    concretize, default_rules, inportize, specialize, SwitchRule, DEFAULT_HIGH_PRIORITY,
    RULE_PRIORITY_BASE, TABLE_MISS_PRIORITY,
};
pub use stats::{PendingDeletes, QueryTracker};

use crate::buckets::{BucketRef, CountBucket, PullStatus, RuleKey};
use crate::classifier::{Classifier, Match, Sink, Trace};
use crate::compile::{CompileError, Compiler};
use crate::lock;
use crate::netkat::{self, CompileService, NetkatError};
use crate::network::{NetworkView, PortNo, PortType, SwitchId, Topology, TopologyEvent};
use crate::packet::{HeaderMap, HeaderValue, Packet, INPORT, OUTPORT, PORT, SWITCH, VLAN_ID, VLAN_PCP};
use crate::policy::{propagate_network, sequential, Policy};
use crate::vheader::{join_tag, split_tag, VHeaderError, VirtualFieldRegistry};

use log::*;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Error of the runtime
#[derive(Error, Debug, PartialEq)]
pub enum RuntimeError {
    /// The policy could not be compiled
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),
    /// Virtual fields could not be packed into the tag
    #[error("Virtual header error: {0}")]
    VHeader(#[from] VHeaderError),
    /// The installed rules are inconsistent with the computed patch
    #[error("Rule table error: {0}")]
    Diff(#[from] DiffError),
    /// The NetKAT backend failed
    #[error("NetKAT error: {0}")]
    Netkat(#[from] NetkatError),
    /// The configuration is invalid
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// The NetKAT backend is selected, but no compile service is attached
    #[error("The NetKAT backend requires a compile service")]
    NoCompileService,
    /// The table id does not fit into the cookie
    #[error("Table {0} does not exist")]
    UnknownTable(u8),
}

struct PolicyState {
    tables: BTreeMap<u8, Policy>,
    registry: VirtualFieldRegistry,
    installed: BTreeMap<u8, RuleTable>,
    compiled: BTreeMap<u8, Classifier>,
    ready: BTreeSet<SwitchId>,
    subscribed: HashSet<usize>,
}

enum FlushJob {
    Commands(Vec<DriverCommand>),
    Sync(Sender<()>),
}

fn driver_worker<D: SwitchDriver>(mut driver: D, jobs: Receiver<FlushJob>) {
    for job in jobs {
        match job {
            FlushJob::Commands(commands) => {
                for cmd in commands {
                    if let Err(e) = driver.execute(cmd) {
                        warn!("Switch driver: {}", e);
                    }
                }
            }
            FlushJob::Sync(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

/// # Runtime
/// Update engine and controller-side interpreter.
pub struct Runtime {
    config: RuntimeConfig,
    policy: Mutex<PolicyState>,
    network: Mutex<NetworkView>,
    update_buckets: Mutex<()>,
    generations: Mutex<BTreeMap<u8, GenerationCounter>>,
    queries: Mutex<QueryTracker>,
    deletes: Mutex<PendingDeletes>,
    flush_tx: Mutex<Sender<FlushJob>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    changes_tx: Mutex<Sender<usize>>,
    changes_rx: Mutex<Receiver<usize>>,
    compile_service: Option<Box<dyn CompileService>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Runtime {
    /// Create a runtime without any policy. Commands are sent to `driver` from a worker thread.
    pub fn new<D: SwitchDriver + 'static>(config: RuntimeConfig, driver: D) -> Self {
        let (flush_tx, flush_rx) = channel();
        let (changes_tx, changes_rx) = channel();
        let flusher = thread::spawn(move || driver_worker(driver, flush_rx));
        Self {
            network: Mutex::new(NetworkView::new(config.debounce())),
            queries: Mutex::new(QueryTracker::new(config.requery_interval())),
            config,
            policy: Mutex::new(PolicyState {
                tables: BTreeMap::new(),
                registry: VirtualFieldRegistry::new(),
                installed: BTreeMap::new(),
                compiled: BTreeMap::new(),
                ready: BTreeSet::new(),
                subscribed: HashSet::new(),
            }),
            update_buckets: Mutex::new(()),
            generations: Mutex::new(BTreeMap::new()),
            deletes: Mutex::new(PendingDeletes::new()),
            flush_tx: Mutex::new(flush_tx),
            flusher: Mutex::new(Some(flusher)),
            changes_tx: Mutex::new(changes_tx),
            changes_rx: Mutex::new(changes_rx),
            compile_service: None,
            workers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Attach the transport of the NetKAT backend
    pub fn with_compile_service<S: CompileService + 'static>(mut self, service: S) -> Self {
        self.compile_service = Some(Box::new(service));
        self
    }

    /// The configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Install a policy in table 0.
    pub fn set_policy(&self, policy: Policy) -> Result<(), RuntimeError> {
        self.set_table_policy(0, policy)
    }

    /// Install a policy in a table and run an update cycle. If compilation fails, the error is
    /// returned and the installed rules stay the same.
    pub fn set_table_policy(&self, table: u8, policy: Policy) -> Result<(), RuntimeError> {
        if table > MAX_TABLE {
            return Err(RuntimeError::UnknownTable(table));
        }
        let mut state = lock(&self.policy);
        let topo = lock(&self.network).current().clone();
        propagate_network(&policy, &topo);
        let previous = state.tables.insert(table, policy);
        self.subscribe_dynamics(&mut state);
        let result = self.update_tables(&mut state, &[table], false);
        if result.is_err() {
            match previous {
                Some(p) => state.tables.insert(table, p),
                None => state.tables.remove(&table),
            };
        }
        result
    }

    /// Policy of table 0
    pub fn policy(&self) -> Policy {
        lock(&self.policy).tables.get(&0).cloned().unwrap_or(Policy::Drop)
    }

    /// Policy applied to a packet that was sent to the controller by a rule of `table`: the
    /// sequential composition of the policies of all tables from `table` on.
    pub fn effective_policy(&self, table: u8) -> Policy {
        let state = lock(&self.policy);
        sequential(state.tables.range(table..).map(|(_, p)| p.clone()).collect())
    }

    /// Register a virtual field, see [`VirtualFieldRegistry::register`].
    pub fn register_virtual_field(
        &self,
        name: &str,
        values: Vec<HeaderValue>,
        stage: u32,
    ) -> Result<(), RuntimeError> {
        lock(&self.policy).registry.register(name, values, stage)?;
        Ok(())
    }

    /// Returns a copy of the installed rules of every table
    pub fn installed(&self) -> BTreeMap<u8, RuleTable> {
        lock(&self.policy).installed.clone()
    }

    /// Returns the last classifier compiled for the table
    pub fn classifier(&self, table: u8) -> Option<Classifier> {
        lock(&self.policy).compiled.get(&table).cloned()
    }

    /// Returns the last generation of the table
    pub fn generation(&self, table: u8) -> u16 {
        lock(&self.generations).get(&table).map(GenerationCounter::current).unwrap_or(0)
    }

    /// Returns a copy of the current topology
    pub fn topology(&self) -> Topology {
        lock(&self.network).current().clone()
    }

    fn emit(&self, commands: Vec<DriverCommand>) {
        if commands.is_empty() {
            return;
        }
        if lock(&self.flush_tx).send(FlushJob::Commands(commands)).is_err() {
            error!("The switch driver worker is gone");
        }
    }

    /// Wait until the driver worker executed every command emitted so far.
    pub fn flush(&self) {
        let (tx, rx) = channel();
        if lock(&self.flush_tx).send(FlushJob::Sync(tx)).is_ok() {
            let _ = rx.recv();
        }
    }

    fn subscribe_dynamics(&self, state: &mut PolicyState) {
        let tx = lock(&self.changes_tx).clone();
        let dynamics: Vec<_> = state.tables.values().flat_map(|p| p.dynamics()).collect();
        for d in dynamics {
            if state.subscribed.insert(d.id()) {
                d.subscribe(tx.clone());
            }
        }
    }

    fn compile_table(
        &self,
        registry: &VirtualFieldRegistry,
        policy: &Policy,
        topo: &Topology,
        force: bool,
    ) -> Result<Classifier, RuntimeError> {
        let classifier = match self.config.compile_backend {
            CompileBackend::InMemory => {
                Compiler::new().with_registry(registry).forced(force).compile(policy)?
            }
            CompileBackend::Netkat => {
                let service = self.compile_service.as_ref().ok_or(RuntimeError::NoCompileService)?;
                let switch_count = topo.switches().last().copied().unwrap_or(0);
                let request = netkat::to_request(policy, switch_count)?;
                let (response, seconds) = service.compile(&request)?;
                debug!("NetKAT compilation took {:.3}s", seconds);
                netkat::from_response(&response, &policy.buckets())?
            }
        };
        Ok(registry.rewrite_classifier(classifier, self.config.multi_table)?)
    }

    /// Run an update cycle for the given tables. All tables are compiled before anything is
    /// installed, so a compile error leaves every table unchanged.
    fn update_tables(
        &self,
        state: &mut PolicyState,
        tables: &[u8],
        force: bool,
    ) -> Result<(), RuntimeError> {
        let topo = lock(&self.network).current().clone();
        let mut compiled = Vec::new();
        for table in tables {
            let policy = match state.tables.get(table) {
                Some(p) => p,
                None => continue,
            };
            match self.compile_table(&state.registry, policy, &topo, force) {
                Ok(c) => compiled.push((*table, c)),
                Err(e) => {
                    error!("Cannot compile table {}: {}", table, e);
                    return Err(e);
                }
            }
        }

        let fresh: BTreeSet<SwitchId> =
            topo.switches().into_iter().filter(|s| !state.ready.contains(s)).collect();
        let mut commands = Vec::new();
        for (table, classifier) in compiled {
            let (generation, wrapped) =
                lock(&self.generations).entry(table).or_insert_with(GenerationCounter::new).next();
            let nuclear = self.config.install_mode == InstallMode::Nuclear || wrapped || generation == 1;
            let cookie = Cookie::new(table, generation);

            let mut new_rules = RuleTable::new();
            for (switch, rules) in specialize(&classifier, &topo, self.config.multi_table) {
                for r in rules {
                    new_rules.insert(InstalledRule {
                        slot: RuleSlot { switch, matches: r.matches, priority: r.priority },
                        actions: r.actions,
                        cookie,
                    });
                }
            }

            let mut installed = state.installed.remove(&table).unwrap_or_default();
            let patch = if nuclear {
                installed.get_nuclear_diff(&new_rules)
            } else {
                installed.get_diff(&new_rules)
            };
            self.bookkeep(&patch);
            if let Err(e) = installed.apply_patch(&patch) {
                warn!("Installed rules of table {} are inconsistent ({}), replacing them", table, e);
                installed = new_rules;
            }
            state.installed.insert(table, installed);
            state.compiled.insert(table, classifier);

            commands.extend(self.patch_commands(table, &patch, nuclear, &topo, &fresh));
            let (adds, deletes, modifies, stays) = patch.counts();
            info!(
                "Table {} generation {}{}: {} adds, {} deletes, {} modifies, {} stays",
                table,
                generation,
                if nuclear { " (nuclear)" } else { "" },
                adds,
                deletes,
                modifies,
                stays
            );
        }
        state.ready.extend(fresh);
        self.emit(commands);
        Ok(())
    }

    fn patch_commands(
        &self,
        table: u8,
        patch: &RulePatch,
        nuclear: bool,
        topo: &Topology,
        fresh: &BTreeSet<SwitchId>,
    ) -> Vec<DriverCommand> {
        let spec = |r: &InstalledRule| FlowSpec {
            switch: r.slot.switch,
            table,
            matches: r.slot.matches.clone(),
            priority: r.slot.priority,
            actions: concretize(&r.actions),
            cookie: r.cookie,
            notify_on_remove: self.config.notify_on_remove
                && r.buckets().iter().any(|b| matches!(b, BucketRef::Count(_))),
        };
        let mut deletes: HashMap<SwitchId, Vec<DriverCommand>> = HashMap::new();
        let mut adds: HashMap<SwitchId, Vec<DriverCommand>> = HashMap::new();
        let mut modifies: HashMap<SwitchId, Vec<DriverCommand>> = HashMap::new();
        for m in patch.modifiers.iter() {
            let switch = m.slot().switch;
            match m {
                RuleModifier::Delete(r) if !nuclear => {
                    deletes.entry(switch).or_default().push(DriverCommand::Delete {
                        switch,
                        table,
                        matches: r.slot.matches.clone(),
                        priority: r.slot.priority,
                    })
                }
                RuleModifier::Add(r) => {
                    adds.entry(switch).or_default().push(DriverCommand::Install(spec(r)))
                }
                RuleModifier::Modify { to, .. } => {
                    modifies.entry(switch).or_default().push(DriverCommand::Modify(spec(to)))
                }
                _ => {}
            }
        }

        let mut commands = Vec::new();
        for switch in topo.switches() {
            let clear = nuclear || fresh.contains(&switch);
            let mut body = Vec::new();
            if clear {
                body.push(DriverCommand::Clear { switch, table });
                for (matches, priority, actions) in default_rules(switch, table) {
                    body.push(DriverCommand::Install(FlowSpec {
                        switch,
                        table,
                        matches,
                        priority,
                        actions,
                        cookie: Cookie::new(table, 0),
                        notify_on_remove: false,
                    }));
                }
            }
            body.extend(deletes.remove(&switch).unwrap_or_default());
            body.extend(adds.remove(&switch).unwrap_or_default());
            body.extend(modifies.remove(&switch).unwrap_or_default());
            if body.is_empty() {
                continue;
            }
            commands.push(DriverCommand::Barrier { switch });
            commands.extend(body);
            commands.push(DriverCommand::Barrier { switch });
        }
        commands
    }

    fn stats_match(&self, m: &Match) -> Match {
        if self.config.multi_table {
            m.without(OUTPORT)
        } else {
            m.clone()
        }
    }

    fn rule_key(&self, r: &InstalledRule) -> RuleKey {
        RuleKey {
            matches: self.stats_match(&r.slot.matches),
            priority: r.slot.priority,
            version: r.cookie.raw(),
        }
    }

    fn track_add(&self, bucket: &BucketRef, r: &InstalledRule) {
        match bucket {
            BucketRef::Count(b) => b.add_match(self.rule_key(r)),
            BucketRef::Netflow(b) => b.add_match(r.slot.matches.clone()),
            _ => {}
        }
    }

    fn track_delete(&self, bucket: &BucketRef, r: &InstalledRule) {
        match bucket {
            BucketRef::Count(b) => {
                let key = self.rule_key(r);
                b.delete_match(&key);
                if self.config.notify_on_remove {
                    lock(&self.deletes).add(r.slot.switch, key, b.clone());
                }
            }
            BucketRef::Netflow(b) => b.delete_match(&r.slot.matches),
            _ => {}
        }
    }

    /// The rule stays on the switch, but no longer feeds the bucket.
    fn track_retire(&self, bucket: &BucketRef, r: &InstalledRule) {
        match bucket {
            BucketRef::Count(b) => b.retire_match(&self.rule_key(r)),
            BucketRef::Netflow(b) => b.delete_match(&r.slot.matches),
            _ => {}
        }
    }

    /// Tell every bucket about the rules it is installed on. Deleted rules wait for their
    /// flow-removed notification. Modified rules keep their counters on the switch.
    fn bookkeep(&self, patch: &RulePatch) {
        let _guard = lock(&self.update_buckets);
        let mut buckets: Vec<BucketRef> = Vec::new();
        for m in patch.modifiers.iter() {
            let rules: Vec<&InstalledRule> = match m {
                RuleModifier::Add(r) | RuleModifier::Delete(r) => vec![r],
                RuleModifier::Modify { from, to } | RuleModifier::Stay { from, to } => vec![from, to],
            };
            for b in rules.into_iter().flat_map(|r| r.buckets()) {
                if !buckets.contains(&b) {
                    buckets.push(b);
                }
            }
        }
        buckets.iter().for_each(BucketRef::start_update);
        for m in patch.modifiers.iter() {
            match m {
                RuleModifier::Add(r) => r.buckets().iter().for_each(|b| self.track_add(b, r)),
                RuleModifier::Delete(r) => r.buckets().iter().for_each(|b| self.track_delete(b, r)),
                RuleModifier::Modify { from, to } | RuleModifier::Stay { from, to } => {
                    let before = from.buckets();
                    let after = to.buckets();
                    for b in before.iter().filter(|b| !after.contains(b)) {
                        self.track_retire(b, from);
                    }
                    let (old, new) = (self.rule_key(from), self.rule_key(to));
                    for b in after.iter() {
                        match b {
                            BucketRef::Count(c) if old != new && before.contains(b) => {
                                c.replace_match(&old, new.clone())
                            }
                            BucketRef::Count(c) => c.carry_over(new.clone()),
                            b => self.track_add(b, to),
                        }
                    }
                }
            }
        }
        buckets.iter().for_each(BucketRef::finish_update);
    }

    /// Apply a topology event. Events referring to unknown switches or ports are logged and
    /// skipped. If the debounce window is zero, the change is committed right away.
    pub fn handle_event(&self, event: &TopologyEvent) -> Result<(), RuntimeError> {
        let now = Instant::now();
        let mut state = lock(&self.policy);
        let effect = match lock(&self.network).apply(event, now) {
            Ok(effect) => effect,
            Err(e) => {
                warn!("Skipping {}: {}", event, e);
                return Ok(());
            }
        };
        if let TopologyEvent::SwitchPart { switch } = event {
            self.forget_switch(&mut state, *switch);
        }
        self.emit(
            effect.discover.into_iter().map(|location| DriverCommand::InjectDiscovery { location }).collect(),
        );
        if effect.changed {
            self.commit_topology(&mut state, now)?;
        }
        Ok(())
    }

    fn forget_switch(&self, state: &mut PolicyState, switch: SwitchId) {
        for installed in state.installed.values_mut() {
            let mut patch = RulePatch::new();
            for r in installed.remove_switch(switch) {
                patch.add(RuleModifier::Delete(r));
            }
            self.bookkeep(&patch);
        }
        state.ready.remove(&switch);
        lock(&self.queries).forget_switch(switch);
    }

    fn commit_topology(&self, state: &mut PolicyState, now: Instant) -> Result<bool, RuntimeError> {
        let topo = match lock(&self.network).poll(now) {
            Some(topo) => topo.clone(),
            None => return Ok(false),
        };
        for policy in state.tables.values() {
            propagate_network(policy, &topo);
        }
        self.subscribe_dynamics(state);
        let tables: Vec<u8> = state.tables.keys().copied().collect();
        self.update_tables(state, &tables, true)?;
        Ok(true)
    }

    /// Commit the topology if the debounce window elapsed. Returns `true` if an update cycle ran.
    pub fn tick(&self, now: Instant) -> Result<bool, RuntimeError> {
        let mut state = lock(&self.policy);
        self.commit_topology(&mut state, now)
    }

    /// Replace the topology as a whole, and run an update cycle for every table.
    pub fn load_topology(&self, topo: Topology) -> Result<(), RuntimeError> {
        let mut state = lock(&self.policy);
        lock(&self.network).reset(topo.clone());
        state.ready.retain(|s| topo.contains_switch(*s));
        for policy in state.tables.values() {
            propagate_network(policy, &topo);
        }
        self.subscribe_dynamics(&mut state);
        let tables: Vec<u8> = state.tables.keys().copied().collect();
        self.update_tables(&mut state, &tables, true)
    }

    /// A switch connected
    pub fn handle_switch_join(&self, switch: SwitchId) -> Result<(), RuntimeError> {
        self.handle_event(&TopologyEvent::SwitchJoin { switch })
    }

    /// A switch disconnected
    pub fn handle_switch_part(&self, switch: SwitchId) -> Result<(), RuntimeError> {
        self.handle_event(&TopologyEvent::SwitchPart { switch })
    }

    /// A port was added
    pub fn handle_port_join(
        &self,
        switch: SwitchId,
        port: PortNo,
        config_up: bool,
        status_up: bool,
        port_type: PortType,
    ) -> Result<(), RuntimeError> {
        self.handle_event(&TopologyEvent::PortJoin { switch, port, config_up, status_up, port_type })
    }

    /// A port was removed
    pub fn handle_port_part(&self, switch: SwitchId, port: PortNo) -> Result<(), RuntimeError> {
        self.handle_event(&TopologyEvent::PortPart { switch, port })
    }

    /// The flags of a port changed
    pub fn handle_port_mod(
        &self,
        switch: SwitchId,
        port: PortNo,
        config_up: bool,
        status_up: bool,
    ) -> Result<(), RuntimeError> {
        self.handle_event(&TopologyEvent::PortMod { switch, port, config_up, status_up })
    }

    /// Link discovery found a link
    pub fn handle_link_update(
        &self,
        s1: SwitchId,
        p1: PortNo,
        s2: SwitchId,
        p2: PortNo,
    ) -> Result<(), RuntimeError> {
        self.handle_event(&TopologyEvent::LinkUpdate { s1, p1, s2, p2 })
    }

    /// Ask the switches of the bucket for their flow statistics. A switch that was asked
    /// recently and has not replied yet is not asked again.
    pub fn pull_stats(&self, bucket: &Arc<CountBucket>) -> PullStatus {
        let status = bucket.begin_pull();
        if let PullStatus::Requested(switches) = &status {
            let now = Instant::now();
            let mut queries = lock(&self.queries);
            let commands = switches
                .iter()
                .filter(|s| queries.register(**s, bucket.clone(), now))
                .map(|s| DriverCommand::FlowStatsRequest { switch: *s })
                .collect();
            drop(queries);
            self.emit(commands);
        }
        status
    }

    /// Number of deleted rules whose final counters have not arrived yet
    pub fn pending_deletes(&self) -> usize {
        lock(&self.deletes).len()
    }

    fn stat_key(&self, switch: SwitchId, stat: &FlowStat) -> RuleKey {
        RuleKey {
            matches: self.stats_match(&stat.matches.clone().with(SWITCH, switch)),
            priority: stat.priority,
            version: stat.cookie.raw(),
        }
    }

    /// Forward the flow statistics of a switch to the buckets waiting for them. Counters of the
    /// default rules and of rules no bucket tracks are ignored.
    pub fn handle_flow_stats_reply(&self, switch: SwitchId, stats: &[FlowStat]) {
        let buckets = lock(&self.queries).take(switch);
        if buckets.is_empty() {
            debug!("Dropping unrequested flow statistics of switch {}", switch);
            return;
        }
        let entries: Vec<(RuleKey, u64, u64)> = stats
            .iter()
            .filter(|s| !s.cookie.is_default())
            .map(|s| (self.stat_key(switch, s), s.packets, s.bytes))
            .collect();
        for b in buckets {
            b.handle_flow_stats_reply(switch, &entries);
        }
        let mut deletes = lock(&self.deletes);
        entries.iter().for_each(|(key, _, _)| deletes.settle(switch, key));
    }

    /// Deliver the final counters of a removed rule.
    pub fn handle_flow_removed(&self, switch: SwitchId, stat: &FlowStat) {
        let key = self.stat_key(switch, stat);
        let buckets = lock(&self.deletes).take(switch, &key);
        if buckets.is_empty() {
            debug!("Flow removed for unknown rule {:?} on switch {}", key, switch);
            return;
        }
        for b in buckets {
            b.handle_flow_removed(&key, stat.packets, stat.bytes);
        }
    }

    /// Interpret a packet sent to the controller by a rule with the given cookie. Buckets
    /// reached by the packet are served after the policy lock is released. Returns the number
    /// of packets sent back into the network.
    pub fn handle_packet_in(&self, concrete: Packet, cookie: Cookie) -> usize {
        let (outputs, trace) = {
            let state = lock(&self.policy);
            let mut pkt = to_located(concrete);
            if !state.registry.is_empty() {
                pkt = expand_vheaders(&state.registry, pkt);
            }
            let effective =
                sequential(state.tables.range(cookie.table()..).map(|(_, p)| p.clone()).collect());
            let mut trace = Trace::new();
            let mut outputs = Vec::new();
            for out in effective.eval_traced(&pkt, &mut trace) {
                match to_concrete(&state.registry, &out) {
                    Ok(Some(c)) => outputs.push(c),
                    Ok(None) => debug!("Packet {} has no output port", out),
                    Err(e) => warn!("Cannot send {}: {}", out, e),
                }
            }
            (outputs, trace)
        };
        for (sink, pkt) in trace.iter() {
            match sink {
                Sink::Bucket(b) => b.deliver(pkt),
                Sink::Controller => debug!("Packet {} reached the controller", pkt),
            }
        }
        let sent = outputs.len();
        self.emit(outputs.into_iter().map(|packet| DriverCommand::SendPacket { packet }).collect());
        sent
    }

    /// Recompile the tables affected by dynamic policies that changed since the last call.
    /// Returns the number of changed dynamic policies.
    pub fn process_events(&self) -> Result<usize, RuntimeError> {
        let changed: BTreeSet<usize> = lock(&self.changes_rx).try_iter().collect();
        if changed.is_empty() {
            return Ok(0);
        }
        let mut state = lock(&self.policy);
        let topo = lock(&self.network).current().clone();
        let mut tables = Vec::new();
        for (table, policy) in state.tables.iter() {
            propagate_network(policy, &topo);
            if invalidate_ancestors(policy, &changed) {
                tables.push(*table);
            }
        }
        self.subscribe_dynamics(&mut state);
        debug!("Dynamic policies {:?} changed, updating tables {:?}", changed, tables);
        self.update_tables(&mut state, &tables, false)?;
        Ok(changed.len())
    }

    /// Run [`Self::process_events`] on a worker thread.
    pub fn spawn_recompile(self: &Arc<Self>) {
        let rt = self.clone();
        let handle = thread::spawn(move || {
            if let Err(e) = rt.process_events() {
                error!("Recompilation failed: {}", e);
            }
        });
        lock(&self.workers).push(handle);
    }

    /// Wait for all recompilation workers.
    pub fn join_workers(&self) {
        let handles = std::mem::take(&mut *lock(&self.workers));
        for h in handles {
            if h.join().is_err() {
                error!("A recompilation worker panicked");
            }
        }
    }

    /// Start the event loop. It processes dynamic policy changes and commits debounced topology
    /// changes every `interval`, until [`Self::stop`] is called.
    pub fn start(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let rt = self.clone();
        thread::spawn(move || {
            while rt.running.load(Ordering::SeqCst) {
                if let Err(e) = rt.process_events() {
                    error!("Recompilation failed: {}", e);
                }
                if let Err(e) = rt.tick(Instant::now()) {
                    error!("Topology update failed: {}", e);
                }
                thread::sleep(interval);
            }
        })
    }

    /// Stop the event loop
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let (tx, _) = channel();
        *lock(&self.flush_tx) = tx;
        if let Some(handle) = lock(&self.flusher).take() {
            if handle.join().is_err() {
                error!("The switch driver worker panicked");
            }
        }
    }
}

/// Invalidate the memoized classifier of every dynamic policy containing one of the changed
/// policies. Returns `true` if the policy contains one of them.
fn invalidate_ancestors(policy: &Policy, changed: &BTreeSet<usize>) -> bool {
    fn inner(p: &Policy, changed: &BTreeSet<usize>, memo: &mut HashMap<usize, bool>) -> bool {
        match p {
            Policy::Dynamic(d) => {
                if let Some(hit) = memo.get(&d.id()) {
                    return *hit;
                }
                memo.insert(d.id(), false);
                let hit = inner(&d.policy(), changed, memo) | changed.contains(&d.id());
                if hit {
                    d.invalidate_classifier();
                }
                memo.insert(d.id(), hit);
                hit
            }
            Policy::Recurse(r) => changed.contains(&r.id()),
            Policy::Negate(p) => inner(p, changed, memo),
            Policy::Difference(p, q) => inner(p, changed, memo) | inner(q, changed, memo),
            Policy::If(c, t, f) => {
                inner(c, changed, memo) | inner(t, changed, memo) | inner(f, changed, memo)
            }
            Policy::Union(ps) | Policy::Intersection(ps) | Policy::Parallel(ps) | Policy::Sequential(ps) => {
                ps.iter().fold(false, |acc, p| inner(p, changed, memo) | acc)
            }
            _ => false,
        }
    }
    inner(policy, changed, &mut HashMap::new())
}

/// The concrete `port` of a packet from the driver becomes the `inport`.
fn to_located(pkt: Packet) -> Packet {
    match pkt.get(PORT).cloned() {
        Some(port) => pkt.modify(PORT, HeaderValue::Absent).modify(INPORT, port),
        None => pkt,
    }
}

/// Replace the VLAN tag of the packet by the virtual fields it encodes.
fn expand_vheaders(registry: &VirtualFieldRegistry, pkt: Packet) -> Packet {
    let id = pkt.get_int(VLAN_ID).unwrap_or(0);
    let pcp = pkt.get_int(VLAN_PCP).unwrap_or(0);
    pkt.modify(VLAN_ID, HeaderValue::Absent)
        .modify(VLAN_PCP, HeaderValue::Absent)
        .modify_many(&registry.expand(join_tag(id, pcp)))
}

/// Turn a located packet into the packet sent by the driver: `outport` becomes `port`, and
/// virtual fields are packed into the VLAN tag. Returns `None` if the packet has no output port.
fn to_concrete(registry: &VirtualFieldRegistry, pkt: &Packet) -> Result<Option<Packet>, VHeaderError> {
    let outport = match pkt.get(OUTPORT) {
        Some(p) => p.clone(),
        None => return Ok(None),
    };
    let mut out =
        pkt.modify(OUTPORT, HeaderValue::Absent).modify(INPORT, HeaderValue::Absent).modify(PORT, outport);
    if registry.is_empty() {
        return Ok(Some(out));
    }
    let assignment: HeaderMap = pkt
        .fields()
        .filter(|(h, _)| registry.is_virtual(h))
        .map(|(h, v)| (h.to_string(), v.clone()))
        .collect();
    for h in assignment.keys() {
        out = out.modify(h, HeaderValue::Absent);
    }
    let tag = registry.encode_all(&assignment)?;
    if tag != 0 {
        let (id, pcp) = split_tag(tag);
        out = out.modify(VLAN_ID, HeaderValue::Int(id)).modify(VLAN_PCP, HeaderValue::Int(pcp));
    }
    Ok(Some(out))
}

