//! Cancellation cascade
//!
//! The queue's parent pointers are followed exactly once to produce a
//! `ChainHandles` list. The cascade then walks that list from the last stage
//! to the first, raising the abort flag and revoking with terminate.

use crate::error::{CascadeFailure, CascadeReport};
use pipeline_core::{ExecutionHandle, HandleId, QueueError, TaskQueue};
use std::collections::HashSet;
use tracing::{info, warn};

/// Stage handles of one chain, first to last
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainHandles {
    handles: Vec<HandleId>,
}

impl ChainHandles {
    /// Follow parent links back from the chain handle
    pub async fn collect(queue: &dyn TaskQueue, last: HandleId) -> Result<Self, QueueError> {
        let mut handles = vec![last];
        let mut seen = HashSet::from([last]);
        let mut current = last;

        while let Some(parent) = queue.get_parent(current).await? {
            if !seen.insert(parent) {
                warn!("Parent links of {} loop back to {}", last, parent);
                break;
            }
            handles.push(parent);
            current = parent;
        }

        handles.reverse();
        Ok(Self { handles })
    }

    /// A chain known only by its last handle
    pub fn single(last: HandleId) -> Self {
        Self {
            handles: vec![last],
        }
    }

    /// The chain handle
    pub fn last(&self) -> HandleId {
        self.handles[self.handles.len() - 1]
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &HandleId> {
        self.handles.iter()
    }

    /// Current snapshot of every stage, first to last
    pub async fn snapshot(&self, queue: &dyn TaskQueue) -> Result<Vec<ExecutionHandle>, QueueError> {
        let mut stages = Vec::with_capacity(self.handles.len());
        for &id in &self.handles {
            stages.push(queue.get_handle(id).await?);
        }
        Ok(stages)
    }
}

/// Abort and revoke one handle, recording what failed
async fn signal(queue: &dyn TaskQueue, id: HandleId, terminate: bool, report: &mut CascadeReport) {
    report.visited.push(id);

    if let Err(e) = queue.abort(id).await {
        warn!("Abort of {} failed: {}", id, e);
        report.failures.push(CascadeFailure {
            handle: id,
            error: format!("abort: {e}"),
        });
    }
    if let Err(e) = queue.revoke(id, terminate).await {
        warn!("Revoke of {} failed: {}", id, e);
        report.failures.push(CascadeFailure {
            handle: id,
            error: format!("revoke: {e}"),
        });
    }
}

/// Abort and revoke every stage, last to first. Never stops early.
pub async fn cascade(queue: &dyn TaskQueue, handles: &ChainHandles) -> CascadeReport {
    info!(
        "Cascading cancel over {} stages from {}",
        handles.len(),
        handles.last()
    );

    let mut report = CascadeReport::default();
    for &id in handles.iter().rev() {
        signal(queue, id, true, &mut report).await;
    }
    report
}

/// Abort a single handle and revoke it without terminating, so a unit
/// that is about to return can still record its result
pub async fn revoke_gently(queue: &dyn TaskQueue, id: HandleId) -> CascadeReport {
    let mut report = CascadeReport::default();
    signal(queue, id, false, &mut report).await;
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pipeline_core::{HandleState, Job};
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Queue double holding a fixed chain and recording every signal
    struct RecordingQueue {
        parents: HashMap<HandleId, Option<HandleId>>,
        failing: Option<HandleId>,
        calls: Mutex<Vec<(String, HandleId)>>,
    }

    impl RecordingQueue {
        fn chain(len: usize) -> (Self, Vec<HandleId>) {
            let ids: Vec<HandleId> = (0..len).map(|_| HandleId::new()).collect();
            let parents = ids
                .iter()
                .enumerate()
                .map(|(i, &id)| (id, i.checked_sub(1).map(|p| ids[p])))
                .collect();
            let queue = Self {
                parents,
                failing: None,
                calls: Mutex::new(Vec::new()),
            };
            (queue, ids)
        }

        fn calls(&self) -> Vec<(String, HandleId)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskQueue for RecordingQueue {
        async fn submit(&self, _job: Job) -> Result<HandleId, QueueError> {
            Err(QueueError::Closed)
        }

        async fn get_state(&self, _id: HandleId) -> Result<HandleState, QueueError> {
            Ok(HandleState::Started)
        }

        async fn get_result(&self, id: HandleId, waited: Duration) -> Result<Value, QueueError> {
            Err(QueueError::Timeout { id, waited })
        }

        async fn get_parent(&self, id: HandleId) -> Result<Option<HandleId>, QueueError> {
            self.parents
                .get(&id)
                .copied()
                .ok_or(QueueError::UnknownHandle(id))
        }

        async fn get_handle(&self, id: HandleId) -> Result<ExecutionHandle, QueueError> {
            Err(QueueError::UnknownHandle(id))
        }

        async fn revoke(&self, id: HandleId, terminate: bool) -> Result<(), QueueError> {
            self.calls
                .lock()
                .unwrap()
                .push((format!("revoke:{terminate}"), id));
            if self.failing == Some(id) {
                return Err(QueueError::Closed);
            }
            Ok(())
        }

        async fn abort(&self, id: HandleId) -> Result<(), QueueError> {
            self.calls.lock().unwrap().push(("abort".to_string(), id));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_collect_orders_first_to_last() {
        let (queue, ids) = RecordingQueue::chain(3);
        let handles = ChainHandles::collect(&queue, ids[2]).await.unwrap();
        let collected: Vec<HandleId> = handles.iter().copied().collect();
        assert_eq!(collected, ids);
        assert_eq!(handles.last(), ids[2]);
    }

    #[tokio::test]
    async fn test_cascade_walks_last_to_first() {
        let (queue, ids) = RecordingQueue::chain(3);
        let handles = ChainHandles::collect(&queue, ids[2]).await.unwrap();

        let report = cascade(&queue, &handles).await;
        assert!(report.is_clean());
        assert_eq!(report.visited, vec![ids[2], ids[1], ids[0]]);

        let expected: Vec<(String, HandleId)> = [ids[2], ids[1], ids[0]]
            .into_iter()
            .flat_map(|id| [("abort".to_string(), id), ("revoke:true".to_string(), id)])
            .collect();
        assert_eq!(queue.calls(), expected);
    }

    #[tokio::test]
    async fn test_cascade_continues_past_failures() {
        let (mut queue, ids) = RecordingQueue::chain(3);
        queue.failing = Some(ids[1]);
        let handles = ChainHandles::collect(&queue, ids[2]).await.unwrap();

        let report = cascade(&queue, &handles).await;
        assert_eq!(report.visited.len(), 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].handle, ids[1]);
        assert!(queue.calls().contains(&("revoke:true".to_string(), ids[0])));
    }

    #[tokio::test]
    async fn test_revoke_gently_does_not_terminate() {
        let (queue, ids) = RecordingQueue::chain(1);
        let report = revoke_gently(&queue, ids[0]).await;
        assert!(report.is_clean());
        assert_eq!(
            queue.calls(),
            vec![
                ("abort".to_string(), ids[0]),
                ("revoke:false".to_string(), ids[0])
            ]
        );
    }
}
