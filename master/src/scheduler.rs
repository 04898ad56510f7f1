//! Spawn queue and placement
//!
//! The scheduler owns every spawn task, the queue order, and the
//! task-to-agent assignment. It never talks to the network itself:
//! operations return [`Outbound`] instructions that the caller delivers.
//!
//! ## Placement
//! A task is offered to one agent at a time. The offer reserves a slot on
//! the agent and carries the task's security code. The task only counts as
//! placed once the agent acknowledges; a declined or unanswered offer puts
//! the task back at its original queue position.
//!
//! Agent choice: agents of the requested region (all agents if the region
//! has none, or if no region was requested), carrying the required
//! capabilities, with at least one free slot. The agent with the most free
//! slots wins; ties go to the earliest registration.
//!
//! ## Fairness
//! Every pass walks the queue in submission order, so an earlier task gets
//! the first chance at any freed slot.

use crate::agents::{AgentRegistry, SpawnerAgent};
use crate::auth::Requester;
use crate::config::SchedulerConfig;
use crate::error::{OrchestratorError, Result};
use crate::notify::{StatusChange, StatusNotifier};
use crate::task::{SpawnTask, TaskSnapshot};
use log::{debug, info, warn};
use shared::{AgentId, FinalizationData, PeerId, Properties, RoomId, SpawnStatus, TaskId};
use std::collections::{HashMap, VecDeque};
use std::time::Instant;
use tokio::sync::mpsc;

/// Instructions for the network layer produced by scheduling decisions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Launch {
        agent_peer: PeerId,
        agent_id: AgentId,
        task_id: TaskId,
        code: String,
        options: Properties,
    },
    Kill {
        agent_peer: PeerId,
        task_id: TaskId,
    },
}

pub struct SpawnScheduler {
    config: SchedulerConfig,
    tasks: HashMap<TaskId, SpawnTask>,
    /// Task IDs waiting for placement, oldest first
    queue: VecDeque<TaskId>,
    notifier: StatusNotifier,
}

impl SpawnScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            tasks: HashMap::new(),
            queue: VecDeque::new(),
            notifier: StatusNotifier::default(),
        }
    }

    /// Accepts a spawn request under the given task ID.
    ///
    /// IDs must be handed out in increasing order; queue positions are
    /// derived from them.
    pub fn submit(
        &mut self,
        id: TaskId,
        requester: Requester,
        options: Properties,
        agents: &mut AgentRegistry,
    ) -> Result<Vec<Outbound>> {
        if let Requester::Peer(identity) = &requester {
            if identity.privilege < self.config.min_spawn_privilege {
                return Err(OrchestratorError::PermissionDenied {
                    required: self.config.min_spawn_privilege,
                    actual: identity.privilege,
                });
            }
        }

        let mut task = SpawnTask::new(id, requester, options);
        if self.queue.len() >= self.config.max_queue_len && select_agent(agents, &task).is_none() {
            warn!("Spawn queue full, refusing request from {}", task.requester.name());
            return Err(OrchestratorError::NoCapacity);
        }

        task.transition(SpawnStatus::Queued)?;
        info!(
            "Task {} queued for {} (region {:?})",
            id,
            task.requester.name(),
            task.region()
        );
        let change = status_change(&task, None);
        self.tasks.insert(id, task);
        self.queue.push_back(id);
        self.notifier.publish(change);

        Ok(self.place_queued(agents, Instant::now()))
    }

    /// Retries placement right away, e.g. after an agent freed slots.
    pub fn place(&mut self, agents: &mut AgentRegistry) -> Vec<Outbound> {
        if self.queue.is_empty() {
            return Vec::new();
        }
        self.place_queued(agents, Instant::now())
    }

    /// One placement pass over the queue, in submission order. Offers are
    /// stamped with `now`.
    fn place_queued(&mut self, agents: &mut AgentRegistry, now: Instant) -> Vec<Outbound> {
        let mut outbound = Vec::new();
        let mut placed = Vec::new();

        for id in self.queue.iter().copied() {
            let Some(task) = self.tasks.get_mut(&id) else {
                continue;
            };
            let Some(agent_id) = select_agent(agents, task) else {
                continue;
            };
            if !agents.reserve(agent_id) {
                continue;
            }
            let Some(agent) = agents.get(agent_id) else {
                continue;
            };

            task.set_offer(agent_id, now);
            debug!("Offering task {} to spawner {}", id, agent_id);
            outbound.push(Outbound::Launch {
                agent_peer: agent.peer_id,
                agent_id,
                task_id: id,
                code: task.code_for_agent().to_string(),
                options: task.options.clone(),
            });
            placed.push(id);
        }

        if !placed.is_empty() {
            self.queue.retain(|id| !placed.contains(id));
        }
        outbound
    }

    fn requeue(&mut self, id: TaskId) {
        if self.queue.contains(&id) {
            return;
        }
        let position = self.queue.partition_point(|queued| *queued < id);
        self.queue.insert(position, id);
    }

    fn finish(&mut self, task_id: TaskId, status: SpawnStatus, reason: String) -> Result<()> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(OrchestratorError::UnknownTask(task_id))?;
        task.transition(status)?;
        info!("Task {} {}: {}", task_id, status, reason);
        let change = status_change(task, Some(reason));
        self.queue.retain(|id| *id != task_id);
        self.notifier.publish(change);
        Ok(())
    }

    /// The agent acknowledged it began launching the process at
    /// `started_at` on its own clock.
    pub fn process_started(
        &mut self,
        agent_id: AgentId,
        task_id: TaskId,
        started_at: u64,
        agents: &mut AgentRegistry,
    ) -> Result<Vec<Outbound>> {
        let agent_peer = agents
            .get(agent_id)
            .map(|agent| agent.peer_id)
            .ok_or(OrchestratorError::UnknownAgent(agent_id))?;
        let kill = vec![Outbound::Kill {
            agent_peer,
            task_id,
        }];

        let Some(task) = self.tasks.get_mut(&task_id) else {
            warn!("Spawner {} started unknown task {}", agent_id, task_id);
            return Ok(kill);
        };
        if task.is_terminal() {
            debug!("Task {} ended before spawner {} acknowledged it", task_id, agent_id);
            return Ok(kill);
        }
        if task.offered_to() != Some(agent_id) {
            warn!(
                "Spawner {} acknowledged task {} without a current offer",
                agent_id, task_id
            );
            return Ok(kill);
        }
        if task.age(Instant::now()) > self.config.queue_timeout {
            warn!("Spawner {} acknowledged task {} after it timed out", agent_id, task_id);
            task.take_offer();
            agents.release(agent_id);
            let reason = OrchestratorError::QueueTimeout(task_id).to_string();
            self.finish(task_id, SpawnStatus::Aborted, reason)?;
            return Ok(kill);
        }

        task.assign(agent_id)?;
        task.transition(SpawnStatus::ProcessStarted)?;
        task.take_offer();
        agents.confirm_start(agent_id, started_at);
        info!("Task {} started on spawner {}", task_id, agent_id);
        let change = status_change(task, None);
        self.notifier.publish(change);
        Ok(Vec::new())
    }

    /// The agent refused an offer. The task goes back in line.
    pub fn launch_declined(
        &mut self,
        agent_id: AgentId,
        task_id: TaskId,
        reason: &str,
        agents: &mut AgentRegistry,
    ) {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return;
        };
        if task.offered_to() != Some(agent_id) {
            return;
        }
        task.take_offer();
        agents.release(agent_id);
        warn!("Spawner {} declined task {}: {}", agent_id, task_id, reason);
        if !task.is_terminal() {
            self.requeue(task_id);
        }
    }

    /// Cancels a task that has not started yet.
    pub fn cancel(
        &mut self,
        requester: &Requester,
        task_id: TaskId,
        agents: &mut AgentRegistry,
    ) -> Result<()> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .filter(|task| requester.owns(&task.requester))
            .ok_or(OrchestratorError::UnknownTask(task_id))?;

        if task.status() != SpawnStatus::Queued {
            return Err(OrchestratorError::CannotCancel {
                task_id,
                status: task.status(),
            });
        }
        if let Some(agent_id) = task.take_offer() {
            agents.release(agent_id);
        }
        self.finish(
            task_id,
            SpawnStatus::Aborted,
            format!("cancelled by {}", requester.name()),
        )
    }

    /// Administrative termination. Tells the agent to stop the process.
    pub fn kill(&mut self, task_id: TaskId, agents: &mut AgentRegistry) -> Result<Vec<Outbound>> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(OrchestratorError::UnknownTask(task_id))?;
        if task.is_terminal() {
            return Err(OrchestratorError::InvalidTransition {
                task_id,
                from: task.status(),
                to: SpawnStatus::Killed,
            });
        }

        let mut outbound = Vec::new();
        if let Some(agent_id) = task.take_offer() {
            agents.release(agent_id);
            outbound.extend(kill_on(agents, agent_id, task_id));
        }
        if let Some(agent_id) = task.assigned_agent() {
            outbound.extend(kill_on(agents, agent_id, task_id));
        }

        self.finish(task_id, SpawnStatus::Killed, "killed by administrator".to_string())?;
        Ok(outbound)
    }

    /// Terminates everything placed on a spawner that went away.
    ///
    /// Placed, unfinished tasks are killed. Tasks merely offered to it go
    /// back to the queue. Tasks on other agents are untouched.
    pub fn agent_lost(&mut self, agent_id: AgentId) {
        let mut placed: Vec<TaskId> = Vec::new();
        let mut offered: Vec<TaskId> = Vec::new();
        for task in self.tasks.values_mut().filter(|task| !task.is_terminal()) {
            if task.assigned_agent() == Some(agent_id) {
                placed.push(task.id);
            } else if task.offered_to() == Some(agent_id) {
                task.take_offer();
                offered.push(task.id);
            }
        }
        placed.sort_unstable();

        for task_id in placed {
            if let Err(e) = self.finish(
                task_id,
                SpawnStatus::Killed,
                format!("spawner {} disconnected", agent_id),
            ) {
                warn!("Failed to kill task {}: {}", task_id, e);
            }
        }
        for task_id in offered {
            self.requeue(task_id);
        }
    }

    /// Cancels queued tasks of a requester that disconnected.
    pub fn requester_lost(&mut self, peer_id: PeerId, agents: &mut AgentRegistry) {
        let mut queued: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|task| {
                task.status() == SpawnStatus::Queued && task.requester.peer_id() == Some(peer_id)
            })
            .map(|task| task.id)
            .collect();
        queued.sort_unstable();

        for task_id in queued {
            if let Some(agent_id) = self.tasks.get_mut(&task_id).and_then(SpawnTask::take_offer) {
                agents.release(agent_id);
            }
            if let Err(e) = self.finish(
                task_id,
                SpawnStatus::Aborted,
                "requester disconnected".to_string(),
            ) {
                warn!("Failed to cancel task {}: {}", task_id, e);
            }
        }
    }

    /// A spawned process presents its task ID and security code.
    ///
    /// Any mismatch, including an unknown task or a task not waiting for
    /// registration, is reported the same way so that a caller learns
    /// nothing about which part was wrong.
    pub fn register_process(&mut self, peer_id: PeerId, task_id: TaskId, code: &str) -> Result<Properties> {
        let accepted = self
            .tasks
            .get(&task_id)
            .is_some_and(|task| task.status() == SpawnStatus::ProcessStarted && task.verify_code(code));
        if !accepted {
            warn!(
                "Rejected process registration for task {} from peer {}",
                task_id, peer_id
            );
            return Err(OrchestratorError::InvalidSecurityCode(task_id));
        }

        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(OrchestratorError::InvalidSecurityCode(task_id))?;
        task.bind_process(peer_id);
        task.transition(SpawnStatus::ProcessRegistered)?;
        info!("Task {} registered by process peer {}", task_id, peer_id);
        let options = task.options.clone();
        let change = status_change(task, None);
        self.notifier.publish(change);
        Ok(options)
    }

    /// Checks that `peer_id` may finalize `task_id` right now.
    pub fn check_finalizable(&self, peer_id: PeerId, task_id: TaskId) -> Result<&SpawnTask> {
        let task = self
            .tasks
            .get(&task_id)
            .ok_or(OrchestratorError::UnknownTask(task_id))?;
        if task.process_peer() != Some(peer_id) {
            return Err(OrchestratorError::NotRegistered(task_id));
        }
        if task.finalization().is_some() {
            return Err(OrchestratorError::AlreadyFinalized(task_id));
        }
        if task.status() != SpawnStatus::ProcessRegistered {
            return Err(OrchestratorError::InvalidTransition {
                task_id,
                from: task.status(),
                to: SpawnStatus::Finalized,
            });
        }
        Ok(task)
    }

    pub fn finalize(&mut self, task_id: TaskId, data: FinalizationData, room_id: RoomId) -> Result<()> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(OrchestratorError::UnknownTask(task_id))?;
        task.set_finalization(data, room_id)?;
        self.finish(
            task_id,
            SpawnStatus::Finalized,
            format!("room {} ready", room_id),
        )
    }

    /// Aborts unfinished tasks whose registered process connection dropped.
    pub fn process_lost(&mut self, peer_id: PeerId, agents: &AgentRegistry) -> Vec<Outbound> {
        let mut lost: Vec<(TaskId, Option<AgentId>)> = self
            .tasks
            .values()
            .filter(|task| !task.is_terminal() && task.process_peer() == Some(peer_id))
            .map(|task| (task.id, task.assigned_agent()))
            .collect();
        lost.sort_unstable();

        let mut outbound = Vec::new();
        for (task_id, agent_id) in lost {
            if let Err(e) = self.finish(
                task_id,
                SpawnStatus::Aborted,
                "spawned process disconnected".to_string(),
            ) {
                warn!("Failed to abort task {}: {}", task_id, e);
                continue;
            }
            if let Some(agent_id) = agent_id {
                outbound.extend(kill_on(agents, agent_id, task_id));
            }
        }
        outbound
    }

    /// The agent reports that the process of `task_id` exited.
    pub fn process_exited(&mut self, agent_id: AgentId, task_id: TaskId) -> Result<()> {
        let task = self
            .tasks
            .get(&task_id)
            .filter(|task| task.assigned_agent() == Some(agent_id))
            .ok_or(OrchestratorError::UnknownTask(task_id))?;
        if task.is_terminal() {
            debug!("Process of task {} exited", task_id);
            return Ok(());
        }
        self.finish(
            task_id,
            SpawnStatus::Killed,
            "process exited before finalization".to_string(),
        )
    }

    pub fn finalization(&self, requester: &Requester, task_id: TaskId) -> Result<FinalizationData> {
        let task = self
            .tasks
            .get(&task_id)
            .filter(|task| requester.owns(&task.requester))
            .ok_or(OrchestratorError::UnknownTask(task_id))?;
        match task.finalization() {
            Some(data) if task.status() == SpawnStatus::Finalized => Ok(data.clone()),
            _ => Err(OrchestratorError::NotFinalized(task_id)),
        }
    }

    /// Periodic maintenance: expires old queued tasks, withdraws stale
    /// offers, retries placement, and purges finished tasks.
    ///
    /// Expiry covers offered tasks too and runs before placement, so a
    /// timed-out task can never be placed on a slot that freed up in the
    /// same tick.
    pub fn tick(&mut self, now: Instant, agents: &mut AgentRegistry) -> Vec<Outbound> {
        let mut outbound = Vec::new();

        let mut expired: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|task| task.status() == SpawnStatus::Queued)
            .filter(|task| task.age(now) > self.config.queue_timeout)
            .map(|task| task.id)
            .collect();
        expired.sort_unstable();
        for task_id in expired {
            let offer = self.tasks.get_mut(&task_id).and_then(SpawnTask::take_offer);
            if let Some(agent_id) = offer {
                agents.release(agent_id);
                outbound.extend(kill_on(agents, agent_id, task_id));
            }
            let reason = OrchestratorError::QueueTimeout(task_id).to_string();
            if let Err(e) = self.finish(task_id, SpawnStatus::Aborted, reason) {
                warn!("Failed to expire task {}: {}", task_id, e);
            }
        }

        let stale: Vec<(TaskId, AgentId)> = self
            .tasks
            .values()
            .filter(|task| !task.is_terminal())
            .filter_map(|task| {
                let (agent_id, offered_at) = task.offer()?;
                (now.saturating_duration_since(offered_at) > self.config.offer_timeout)
                    .then_some((task.id, agent_id))
            })
            .collect();
        for (task_id, agent_id) in stale {
            warn!(
                "Spawner {} did not acknowledge task {} in time",
                agent_id, task_id
            );
            if let Some(task) = self.tasks.get_mut(&task_id) {
                task.take_offer();
            }
            agents.release(agent_id);
            self.requeue(task_id);
        }

        outbound.extend(self.place_queued(agents, now));

        let retention = self.config.task_retention;
        self.tasks.retain(|_, task| !task.is_expired(now, retention));
        outbound
    }

    pub fn subscribe_all(&mut self) -> mpsc::UnboundedReceiver<StatusChange> {
        self.notifier.subscribe_all()
    }

    /// Follows one task. A task that already finished yields its terminal
    /// status once and then closes.
    pub fn subscribe_task(&mut self, task_id: TaskId) -> Result<mpsc::UnboundedReceiver<StatusChange>> {
        let task = self
            .tasks
            .get(&task_id)
            .ok_or(OrchestratorError::UnknownTask(task_id))?;
        if task.is_terminal() {
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(status_change(task, None));
            return Ok(rx);
        }
        Ok(self.notifier.subscribe_task(task_id))
    }

    pub fn get(&self, task_id: TaskId) -> Option<&SpawnTask> {
        self.tasks.get(&task_id)
    }

    pub fn queued(&self) -> Vec<TaskId> {
        self.queue.iter().copied().collect()
    }

    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        let mut tasks: Vec<TaskSnapshot> = self.tasks.values().map(SpawnTask::snapshot).collect();
        tasks.sort_by_key(|task| task.id);
        tasks
    }

    #[cfg(test)]
    pub(crate) fn task_mut(&mut self, task_id: TaskId) -> Option<&mut SpawnTask> {
        self.tasks.get_mut(&task_id)
    }
}

fn status_change(task: &SpawnTask, reason: Option<String>) -> StatusChange {
    StatusChange {
        task_id: task.id,
        status: task.status(),
        requester: task.requester.peer_id(),
        reason,
    }
}

fn kill_on(agents: &AgentRegistry, agent_id: AgentId, task_id: TaskId) -> Option<Outbound> {
    agents.get(agent_id).map(|agent| Outbound::Kill {
        agent_peer: agent.peer_id,
        task_id,
    })
}

/// Picks the agent for `task`, or `None` if nothing can take it now.
pub fn select_agent(agents: &AgentRegistry, task: &SpawnTask) -> Option<AgentId> {
    let required = task.required_capabilities();
    let pool: Vec<&SpawnerAgent> = match task.region() {
        Some(region) => {
            let in_region = agents.in_region(region);
            if in_region.is_empty() {
                agents.iter().collect()
            } else {
                in_region
            }
        }
        None => agents.iter().collect(),
    };

    pool.into_iter()
        .filter(|agent| agent.free_slots() > 0 && agent.has_capabilities(&required))
        .max_by(|a, b| {
            a.free_slots()
                .cmp(&b.free_slots())
                .then_with(|| b.id.cmp(&a.id))
        })
        .map(|agent| agent.id)
}
