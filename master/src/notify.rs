//! Status-change fan-out for spawn tasks.
//!
//! Subscribers either follow every task (the network layer, monitoring) or a
//! single task (a lobby waiting for its room). Per-task channels are closed
//! right after the terminal status has been delivered.

use shared::{PeerId, SpawnStatus, TaskId};
use std::collections::HashMap;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub task_id: TaskId,
    pub status: SpawnStatus,
    /// Peer that submitted the task, if it came over the network
    pub requester: Option<PeerId>,
    pub reason: Option<String>,
}

#[derive(Default)]
pub struct StatusNotifier {
    all: Vec<mpsc::UnboundedSender<StatusChange>>,
    per_task: HashMap<TaskId, Vec<mpsc::UnboundedSender<StatusChange>>>,
}

impl StatusNotifier {
    pub fn subscribe_all(&mut self) -> mpsc::UnboundedReceiver<StatusChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.all.push(tx);
        rx
    }

    pub fn subscribe_task(&mut self, task_id: TaskId) -> mpsc::UnboundedReceiver<StatusChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.per_task.entry(task_id).or_default().push(tx);
        rx
    }

    pub fn publish(&mut self, change: StatusChange) {
        self.all.retain(|tx| tx.send(change.clone()).is_ok());

        if change.status.is_terminal() {
            if let Some(subscribers) = self.per_task.remove(&change.task_id) {
                for tx in subscribers {
                    let _ = tx.send(change.clone());
                }
            }
        } else if let Some(subscribers) = self.per_task.get_mut(&change.task_id) {
            subscribers.retain(|tx| tx.send(change.clone()).is_ok());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(task_id: TaskId, status: SpawnStatus) -> StatusChange {
        StatusChange {
            task_id,
            status,
            requester: None,
            reason: None,
        }
    }

    #[test]
    fn test_subscribe_all_sees_every_task() {
        let mut notifier = StatusNotifier::default();
        let mut rx = notifier.subscribe_all();

        notifier.publish(change(1, SpawnStatus::Queued));
        notifier.publish(change(2, SpawnStatus::Queued));

        assert_eq!(rx.try_recv().unwrap().task_id, 1);
        assert_eq!(rx.try_recv().unwrap().task_id, 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_task_channel_closes_after_terminal() {
        let mut notifier = StatusNotifier::default();
        let mut rx = notifier.subscribe_task(1);

        notifier.publish(change(2, SpawnStatus::Queued));
        notifier.publish(change(1, SpawnStatus::Queued));
        notifier.publish(change(1, SpawnStatus::Aborted));

        assert_eq!(rx.try_recv().unwrap().status, SpawnStatus::Queued);
        assert_eq!(rx.try_recv().unwrap().status, SpawnStatus::Aborted);
        assert_eq!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        );
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let mut notifier = StatusNotifier::default();
        drop(notifier.subscribe_all());
        notifier.publish(change(1, SpawnStatus::Queued));
        assert!(notifier.all.is_empty());
    }
}
