// SPDX-License-Identifier: MIT OR Apache-2.0
//! The master state machine.
//!
//! Everything here runs on one task: registration and replay, the lock
//! table, processed accounting and idle detection, descriptor routing,
//! retry scheduling, and the two-phase shutdown. Storage is only ever
//! touched from this loop (the disk backend's checkpoint thread works on
//! its own shared index, not through this path).

use crate::MasterCommand;
use crate::sched::Scheduler;
use rebus_core::config::output_altering_signature;
use rebus_proto::{RpcRequest, RpcResponse, Signal};
use rebus_storage::{NameConfig, Storage};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sender id used for replayed and re-injected descriptors.
const STORAGE_SENDER: &str = "storage";

/// Tunables of a master instance.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Number of agent-id tokens pre-published at startup.
    pub initial_id_pool: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            initial_id_pool: 10_000,
        }
    }
}

/// Outcome of handling one command.
#[derive(PartialEq)]
enum Flow {
    Continue,
    Stop,
}

/// A retry re-injection queued by `unlock(failed=true)`.
struct RetryAction {
    sender_id: String,
    agent_name: String,
    domain: String,
    uuid: Uuid,
    selector: String,
}

pub(crate) struct Master {
    storage: Box<dyn Storage>,
    /// agent id → display path.
    clients: HashMap<String, String>,
    /// agent id → logical name.
    agent_names: HashMap<String, String>,
    /// agent id → full configuration string.
    agent_full_config: HashMap<String, String>,
    /// agent id → output-altering configuration signature.
    agent_output_config: HashMap<String, String>,
    /// (name, output-config) → ids of the instances running it.
    uniq_conf_clients: HashMap<NameConfig, Vec<String>>,
    /// domain → set of held (lock id, selector).
    locks: HashMap<String, HashSet<(String, String)>>,
    /// Descriptors accepted since this master started.
    descriptor_count: i64,
    /// (name, output-config) → descriptors handled (processed or declared
    /// processable). Starts below zero when a joining agent owes replayed
    /// work predating this master instance.
    handled_counts: HashMap<NameConfig, i64>,
    /// (name, output-config, domain, selector) → remaining retries.
    retry_counters: HashMap<(String, String, String, String), u32>,
    user_request_counter: u64,
    subscribers: HashMap<String, mpsc::UnboundedSender<Signal>>,
    id_pool: VecDeque<u64>,
    next_id: u64,
    sched: Scheduler<RetryAction>,
    exiting: bool,
    idle_announced: bool,
}

impl Master {
    pub(crate) fn new(storage: Box<dyn Storage>, config: MasterConfig) -> Self {
        let mut id_pool = VecDeque::new();
        id_pool.extend(0..config.initial_id_pool);
        Master {
            storage,
            clients: HashMap::new(),
            agent_names: HashMap::new(),
            agent_full_config: HashMap::new(),
            agent_output_config: HashMap::new(),
            uniq_conf_clients: HashMap::new(),
            locks: HashMap::new(),
            descriptor_count: 0,
            handled_counts: HashMap::new(),
            retry_counters: HashMap::new(),
            user_request_counter: 0,
            subscribers: HashMap::new(),
            next_id: config.initial_id_pool,
            id_pool,
            sched: Scheduler::new(),
            exiting: false,
            idle_announced: false,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<MasterCommand>) {
        info!("master loop started");
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle(cmd) == Flow::Stop {
                            break;
                        }
                    }
                    None => break,
                },
                action = self.sched.next_ready() => self.fire_retry(action),
            }
        }
        info!("master loop stopping, flushing storage");
        if let Err(err) = self.storage.store_state() {
            warn!(error = %err, "storage flush on shutdown failed");
        }
    }

    fn handle(&mut self, cmd: MasterCommand) -> Flow {
        match cmd {
            MasterCommand::Rpc { request, reply } => {
                let (response, flow) = self.dispatch(request);
                let _ = reply.send(response);
                flow
            }
            MasterCommand::AllocateId { reply } => {
                let token = self.id_pool.pop_front().unwrap_or_else(|| {
                    // Pool exhausted: mint directly rather than refusing.
                    let t = self.next_id;
                    self.next_id += 1;
                    t
                });
                let _ = reply.send(token);
                Flow::Continue
            }
            MasterCommand::Subscribe { key, sender } => {
                self.subscribers.insert(key, sender);
                Flow::Continue
            }
            MasterCommand::Unsubscribe { key } => {
                self.subscribers.remove(&key);
                Flow::Continue
            }
            MasterCommand::Shutdown { force } => self.shutdown(force),
        }
    }

    fn dispatch(&mut self, request: RpcRequest) -> (RpcResponse, Flow) {
        match request {
            RpcRequest::Register {
                agent_id,
                domain,
                path,
                config,
            } => (self.register(&agent_id, &domain, path, &config), Flow::Continue),
            RpcRequest::Unregister { agent_id } => self.unregister(&agent_id),
            RpcRequest::Lock {
                agent_id,
                lock_id,
                domain,
                selector,
            } => (
                RpcResponse::Bool(self.lock(&agent_id, &lock_id, &domain, &selector)),
                Flow::Continue,
            ),
            RpcRequest::Unlock {
                agent_id,
                lock_id,
                domain,
                selector,
                failed,
                retries,
                wait_time_secs,
            } => {
                self.unlock(&agent_id, &lock_id, &domain, &selector, failed, retries, wait_time_secs);
                (RpcResponse::Unit, Flow::Continue)
            }
            RpcRequest::Push {
                agent_id,
                descriptor,
            } => (self.push(&agent_id, *descriptor), Flow::Continue),
            RpcRequest::Get {
                agent_id,
                domain,
                selector,
            } => {
                debug!("GET: {agent_id} {domain}:{selector}");
                (
                    RpcResponse::Descriptor(self.storage.get_descriptor(&domain, &selector)),
                    Flow::Continue,
                )
            }
            RpcRequest::GetValue {
                agent_id,
                domain,
                selector,
            } => {
                debug!("GETVALUE: {agent_id} {domain}:{selector}");
                (
                    RpcResponse::Value(self.storage.get_value(&domain, &selector)),
                    Flow::Continue,
                )
            }
            RpcRequest::ListUuids { agent_id, domain } => {
                debug!("LISTUUIDS: {agent_id} {domain}");
                (RpcResponse::Uuids(self.storage.list_uuids(&domain)), Flow::Continue)
            }
            RpcRequest::Find {
                agent_id,
                domain,
                selector_regex,
                limit,
                offset,
            } => {
                debug!("FIND: {agent_id} {domain}:{selector_regex} (max {limit} skip {offset})");
                let response = match self.storage.find(&domain, &selector_regex, limit, offset) {
                    Ok(selectors) => RpcResponse::Selectors(selectors),
                    Err(err) => RpcResponse::Error(err.to_string()),
                };
                (response, Flow::Continue)
            }
            RpcRequest::FindBySelector {
                agent_id,
                domain,
                prefix,
                limit,
                offset,
            } => {
                debug!("FINDBYSELECTOR: {agent_id} {domain} {prefix} (max {limit} skip {offset})");
                (
                    RpcResponse::Descriptors(
                        self.storage.find_by_selector(&domain, &prefix, limit, offset),
                    ),
                    Flow::Continue,
                )
            }
            RpcRequest::FindByUuid {
                agent_id,
                domain,
                uuid,
            } => {
                debug!("FINDBYUUID: {agent_id} {domain}:{uuid}");
                (
                    RpcResponse::Descriptors(self.storage.find_by_uuid(&domain, uuid)),
                    Flow::Continue,
                )
            }
            RpcRequest::FindByValue {
                agent_id,
                domain,
                prefix,
                value_regex,
            } => {
                debug!("FINDBYVALUE: {agent_id} {domain} {prefix} {value_regex}");
                let response = match self.storage.find_by_value(&domain, &prefix, &value_regex) {
                    Ok(descriptors) => RpcResponse::Descriptors(descriptors),
                    Err(err) => RpcResponse::Error(err.to_string()),
                };
                (response, Flow::Continue)
            }
            RpcRequest::MarkProcessed {
                agent_id,
                domain,
                selector,
            } => (self.mark_processed(&agent_id, &domain, &selector), Flow::Continue),
            RpcRequest::MarkProcessable {
                agent_id,
                domain,
                selector,
            } => (
                self.mark_processable(&agent_id, &domain, &selector),
                Flow::Continue,
            ),
            RpcRequest::GetProcessable {
                agent_id,
                domain,
                selector,
            } => {
                debug!("GET_PROCESSABLE: {domain}:{selector} {agent_id}");
                (
                    RpcResponse::NameConfigs(self.storage.get_processable(&domain, &selector)),
                    Flow::Continue,
                )
            }
            RpcRequest::ListAgents { agent_id } => {
                debug!("LIST_AGENTS: {agent_id}");
                let mut counts: BTreeMap<String, u32> = BTreeMap::new();
                for name in self.agent_names.values() {
                    *counts.entry(name.clone()).or_default() += 1;
                }
                (RpcResponse::AgentCounts(counts), Flow::Continue)
            }
            RpcRequest::ProcessedStats { agent_id, domain } => {
                debug!("PROCESSED_STATS: {agent_id} {domain}");
                let (per_agent, total) = self.storage.processed_stats(&domain);
                (RpcResponse::Stats { per_agent, total }, Flow::Continue)
            }
            RpcRequest::GetChildren {
                agent_id,
                domain,
                selector,
                recurse,
            } => {
                debug!("GET_CHILDREN: {agent_id} {domain}:{selector}");
                (
                    RpcResponse::Descriptors(self.storage.get_children(&domain, &selector, recurse)),
                    Flow::Continue,
                )
            }
            RpcRequest::StoreInternalState { agent_id, state } => {
                (self.store_internal_state(&agent_id, &state), Flow::Continue)
            }
            RpcRequest::LoadInternalState { agent_id } => {
                let response = match self.agent_names.get(&agent_id) {
                    Some(name) => {
                        debug!("LOAD_INTSTATE: {name}");
                        if self.storage.stores_internal_state() {
                            RpcResponse::State(self.storage.load_agent_state(name))
                        } else {
                            RpcResponse::State(Vec::new())
                        }
                    }
                    None => unknown_agent(&agent_id),
                };
                (response, Flow::Continue)
            }
            RpcRequest::RequestProcessing {
                agent_id,
                domain,
                selector,
                targets,
            } => (
                self.request_processing(&agent_id, &domain, &selector, targets),
                Flow::Continue,
            ),
        }
    }

    // -- registration -------------------------------------------------------

    fn register(
        &mut self,
        agent_id: &str,
        agent_domain: &str,
        path: String,
        config: &str,
    ) -> RpcResponse {
        // Replenish the id pool by the one token this agent consumed.
        self.id_pool.push_back(self.next_id);
        self.next_id += 1;

        let agent_name = agent_name_of(agent_id);
        let output_config = match output_altering_signature(config) {
            Ok(sig) => sig,
            Err(err) => return RpcResponse::Error(format!("bad configuration: {err}")),
        };
        let name_config: NameConfig = (agent_name.clone(), output_config.clone());
        let already_running = self
            .uniq_conf_clients
            .get(&name_config)
            .is_some_and(|ids| !ids.is_empty());
        self.uniq_conf_clients
            .entry(name_config.clone())
            .or_default()
            .push(agent_id.to_owned());

        self.clients.insert(agent_id.to_owned(), path.clone());
        self.agent_names
            .insert(agent_id.to_owned(), agent_name.clone());
        self.agent_output_config
            .insert(agent_id.to_owned(), output_config.clone());
        self.agent_full_config
            .insert(agent_id.to_owned(), config.to_owned());
        info!("new client {path} ({agent_id}) in domain {agent_domain} with config {config}");

        if !already_running {
            // First instance of this uniquely-configured agent: replay
            // everything it has missed. A peer with identical config would
            // already be working through the backlog.
            let unprocessed = self
                .storage
                .list_unprocessed_by_agent(&agent_name, &output_config);
            self.handled_counts.insert(
                name_config,
                self.descriptor_count - unprocessed.len() as i64,
            );
            self.idle_announced = false;
            for (domain, uuid, selector) in unprocessed {
                self.emit(Signal::TargetedDescriptor {
                    sender_id: STORAGE_SENDER.to_owned(),
                    domain,
                    uuid,
                    selector,
                    targets: vec![agent_name.clone()],
                    user_request: None,
                });
            }
        }
        RpcResponse::Unit
    }

    fn unregister(&mut self, agent_id: &str) -> (RpcResponse, Flow) {
        info!("agent {agent_id} has unregistered");
        let Some(agent_name) = self.agent_names.remove(agent_id) else {
            return (unknown_agent(agent_id), Flow::Continue);
        };
        let output_config = self
            .agent_output_config
            .remove(agent_id)
            .unwrap_or_default();
        if let Some(full_config) = self.agent_full_config.remove(agent_id) {
            debug!("released config for {agent_id}: {full_config}");
        }
        self.clients.remove(agent_id);
        let name_config: NameConfig = (agent_name, output_config);
        if let Some(ids) = self.uniq_conf_clients.get_mut(&name_config) {
            ids.retain(|id| id != agent_id);
            if ids.is_empty() {
                self.uniq_conf_clients.remove(&name_config);
                self.handled_counts.remove(&name_config);
            }
        }
        self.check_idle();
        if self.exiting {
            if self.clients.is_empty() {
                info!("exiting - no agents are running");
                return (RpcResponse::Unit, Flow::Stop);
            }
            info!("expecting {} more agents to exit", self.clients.len());
        }
        (RpcResponse::Unit, Flow::Continue)
    }

    // -- locking ------------------------------------------------------------

    fn lock(&mut self, agent_id: &str, lock_id: &str, domain: &str, selector: &str) -> bool {
        let locks = self.locks.entry(domain.to_owned()).or_default();
        let key = (lock_id.to_owned(), selector.to_owned());
        let taken = locks.contains(&key);
        debug!("LOCK:{lock_id} {agent_id} => {} {domain}:{selector}", !taken);
        if taken {
            return false;
        }
        locks.insert(key);
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn unlock(
        &mut self,
        agent_id: &str,
        lock_id: &str,
        domain: &str,
        selector: &str,
        failed: bool,
        retries: u32,
        wait_time_secs: f64,
    ) {
        debug!("UNLOCK:{lock_id} {agent_id} => {failed} {retries}:{wait_time_secs}");
        let key = (lock_id.to_owned(), selector.to_owned());
        let held = self
            .locks
            .get_mut(domain)
            .is_some_and(|locks| locks.remove(&key));
        if !held || !failed {
            return;
        }
        let Some(agent_name) = self.agent_names.get(agent_id).cloned() else {
            return;
        };
        let output_config = self
            .agent_output_config
            .get(agent_id)
            .cloned()
            .unwrap_or_default();
        let retry_key = (
            agent_name.clone(),
            output_config,
            domain.to_owned(),
            selector.to_owned(),
        );
        let counter = self.retry_counters.entry(retry_key).or_insert(retries);
        if *counter == 0 {
            return;
        }
        *counter -= 1;
        let Some(meta) = self.storage.get_descriptor(domain, selector) else {
            warn!("retry requested for unknown descriptor {domain}:{selector}");
            return;
        };
        self.sched.schedule(
            Duration::from_secs_f64(wait_time_secs.max(0.0)),
            RetryAction {
                sender_id: agent_id.to_owned(),
                agent_name,
                domain: domain.to_owned(),
                uuid: meta.uuid(),
                selector: selector.to_owned(),
            },
        );
    }

    fn fire_retry(&mut self, action: RetryAction) {
        debug!(
            "retrying {}:{} for {}",
            action.domain, action.selector, action.agent_name
        );
        self.emit(Signal::TargetedDescriptor {
            sender_id: action.sender_id,
            domain: action.domain,
            uuid: action.uuid,
            selector: action.selector,
            targets: vec![action.agent_name],
            user_request: None,
        });
    }

    // -- publication --------------------------------------------------------

    fn push(&mut self, agent_id: &str, descriptor: rebus_core::Descriptor) -> RpcResponse {
        let domain = descriptor.domain().to_owned();
        let uuid = descriptor.uuid();
        let selector = descriptor.selector().to_owned();
        match self.storage.add(descriptor) {
            Ok(true) => {
                self.descriptor_count += 1;
                self.idle_announced = false;
                debug!("PUSH: {agent_id} => {domain}:{selector}");
                if !self.exiting {
                    self.emit(Signal::NewDescriptor {
                        sender_id: agent_id.to_owned(),
                        domain,
                        uuid,
                        selector,
                    });
                }
                self.check_idle();
                RpcResponse::Bool(true)
            }
            Ok(false) => {
                debug!("PUSH: {agent_id} already seen => {domain}:{selector}");
                self.check_idle();
                RpcResponse::Bool(false)
            }
            Err(err) => {
                warn!(error = %err, "PUSH failed for {domain}:{selector}");
                RpcResponse::Error(err.to_string())
            }
        }
    }

    // -- processed accounting & idle ----------------------------------------

    fn mark_processed(&mut self, agent_id: &str, domain: &str, selector: &str) -> RpcResponse {
        let Some(agent_name) = self.agent_names.get(agent_id).cloned() else {
            return unknown_agent(agent_id);
        };
        let output_config = self
            .agent_output_config
            .get(agent_id)
            .cloned()
            .unwrap_or_default();
        debug!("MARK_PROCESSED: {domain}:{selector} {agent_id} {output_config}");
        let newly = self
            .storage
            .mark_processed(domain, selector, &agent_name, &output_config);
        if newly {
            self.bump_handled(agent_name, output_config);
        }
        RpcResponse::Bool(newly)
    }

    fn mark_processable(&mut self, agent_id: &str, domain: &str, selector: &str) -> RpcResponse {
        let Some(agent_name) = self.agent_names.get(agent_id).cloned() else {
            return unknown_agent(agent_id);
        };
        let output_config = self
            .agent_output_config
            .get(agent_id)
            .cloned()
            .unwrap_or_default();
        debug!("MARK_PROCESSABLE: {domain}:{selector} {agent_id} {output_config}");
        let newly = self
            .storage
            .mark_processable(domain, selector, &agent_name, &output_config);
        if newly {
            self.bump_handled(agent_name, output_config);
        }
        RpcResponse::Bool(newly)
    }

    /// A uniquely-configured agent accounted for one more descriptor.
    fn bump_handled(&mut self, agent_name: String, output_config: String) {
        *self
            .handled_counts
            .entry((agent_name, output_config))
            .or_insert(0) += 1;
        self.idle_announced = false;
        self.check_idle();
    }

    /// Emit `on_idle` when every descriptor is handled by every
    /// uniquely-configured agent — once per quiescent period.
    fn check_idle(&mut self) {
        if self.exiting || self.idle_announced {
            return;
        }
        let distinct = self.handled_counts.len() as i64;
        let handled: i64 = self.handled_counts.values().sum();
        if self.descriptor_count * distinct == handled {
            debug!(
                "IDLE: {distinct} agents having distinct (name, config) \
                 {} descriptors {handled} handled",
                self.descriptor_count
            );
            self.idle_announced = true;
            self.emit(Signal::OnIdle);
        }
    }

    // -- targeted re-injection ----------------------------------------------

    fn request_processing(
        &mut self,
        agent_id: &str,
        domain: &str,
        selector: &str,
        targets: Vec<String>,
    ) -> RpcResponse {
        debug!("REQUEST_PROCESSING: {agent_id} {domain}:{selector} targets {targets:?}");
        let Some(meta) = self.storage.get_descriptor(domain, selector) else {
            return RpcResponse::Error(format!("unknown descriptor {domain}:{selector}"));
        };
        self.user_request_counter += 1;
        self.emit(Signal::TargetedDescriptor {
            sender_id: agent_id.to_owned(),
            domain: domain.to_owned(),
            uuid: meta.uuid(),
            selector: selector.to_owned(),
            targets,
            user_request: Some(self.user_request_counter),
        });
        RpcResponse::Unit
    }

    // -- internal state ------------------------------------------------------

    fn store_internal_state(&mut self, agent_id: &str, state: &[u8]) -> RpcResponse {
        let Some(agent_name) = self.agent_names.get(agent_id).cloned() else {
            return unknown_agent(agent_id);
        };
        debug!("STORE_INTSTATE: {agent_name}");
        if self.storage.stores_internal_state() {
            if let Err(err) = self.storage.store_agent_state(&agent_name, state) {
                warn!(error = %err, "internal state for {agent_name} not persisted");
                return RpcResponse::Error(err.to_string());
            }
        }
        RpcResponse::Unit
    }

    // -- shutdown ------------------------------------------------------------

    fn shutdown(&mut self, force: bool) -> Flow {
        if force {
            info!("forced shutdown");
            return Flow::Stop;
        }
        if self.exiting {
            // A second graceful request behaves like a force.
            info!("second shutdown request, exiting now");
            return Flow::Stop;
        }
        self.exiting = true;
        let persist = self.storage.stores_internal_state();
        info!(
            "shutdown: asking {} agents to exit (persist={persist})",
            self.clients.len()
        );
        self.emit(Signal::BusExit {
            persist_state: persist,
        });
        if let Err(err) = self.storage.store_state() {
            warn!(error = %err, "storage flush at shutdown failed");
        }
        if self.clients.is_empty() {
            return Flow::Stop;
        }
        Flow::Continue
    }

    // -- signal fanout -------------------------------------------------------

    /// Deliver a signal to every subscriber, in per-subscriber order.
    fn emit(&mut self, signal: Signal) {
        self.subscribers
            .retain(|key, sender| match sender.send(signal.clone()) {
                Ok(()) => true,
                Err(_) => {
                    debug!("dropping dead subscriber {key}");
                    false
                }
            });
    }
}

/// Logical agent name of an id of the form `<name>-<sequence>`.
fn agent_name_of(agent_id: &str) -> String {
    agent_id
        .rsplit_once('-')
        .map_or(agent_id, |(name, _)| name)
        .to_owned()
}

fn unknown_agent(agent_id: &str) -> RpcResponse {
    RpcResponse::Error(format!("unknown agent id {agent_id:?}"))
}

#[cfg(test)]
mod tests {
    use super::agent_name_of;

    #[test]
    fn names_strip_the_trailing_sequence_only() {
        assert_eq!(agent_name_of("inject-0"), "inject");
        assert_eq!(agent_name_of("link-finder-12"), "link-finder");
        assert_eq!(agent_name_of("plain"), "plain");
    }
}
