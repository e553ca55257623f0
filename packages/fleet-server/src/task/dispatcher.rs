//! Task dispatch over the store's pub/sub.
//!
//! A task aimed at this node runs in-process. Anything else is published on
//! the shared request channel with a fresh single-use reply channel, and the
//! caller waits up to the configured timeout for the first valid reply.
//! There is no retry and no deduplication.

use std::sync::Arc;

use fleet_core::TaskResult;
use tokio::task::JoinHandle;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use super::operation::{Task, TaskRequest};
use crate::cluster::ClusterContext;
use crate::storage::{response_channel, TASK_REQUEST_CHANNEL};
use crate::traits::Subscription;

/// Info string of a failed result produced by a reply timeout.
pub const TIMEOUT_INFO: &str = "timeout";

impl ClusterContext {
    /// Runs `task` on `target_node_id` and returns its outcome.
    ///
    /// Never returns an error: store failures, timeouts and handler errors
    /// all come back as a failed [`TaskResult`].
    pub async fn dispatch(&self, target_node_id: Uuid, task: Task) -> TaskResult {
        if target_node_id == self.node_id {
            return self.execute_local(task).await;
        }
        let kind = task.kind();
        match self.dispatch_remote(target_node_id, task).await {
            Ok(result) => result,
            Err(err) => {
                warn!(task = %kind, target = %target_node_id, error = %err, "task dispatch failed");
                TaskResult::fail(format!("dispatch failed: {err}"))
            }
        }
    }

    /// Runs the registered handler for `task` in this process.
    pub async fn execute_local(&self, task: Task) -> TaskResult {
        let kind = task.kind();
        let Some(handler) = self.tasks.get(kind) else {
            warn!(task = %kind, "no handler registered");
            return TaskResult::fail(format!("no handler for {kind}"));
        };
        let _guard = self.lifecycle.in_flight_guard();
        match handler.handle(self, task).await {
            Ok(result) => result,
            Err(err) => {
                warn!(task = %kind, error = %err, "task handler failed");
                TaskResult::fail(err.to_string())
            }
        }
    }

    async fn dispatch_remote(&self, target_node_id: Uuid, task: Task) -> anyhow::Result<TaskResult> {
        let kind = task.kind();
        let channel = response_channel(Uuid::new_v4());
        // Subscribe before publishing so a fast reply cannot be missed.
        let mut replies = self.store.subscribe(&channel).await?;
        let request = TaskRequest {
            target_node_id,
            response_channel: channel,
            task,
        };
        self.store
            .publish(TASK_REQUEST_CHANNEL, &request.encode()?)
            .await?;

        let timeout = self.config.task_timeout();
        if let Ok(reply) = tokio::time::timeout(timeout, first_reply(&mut replies)).await {
            Ok(reply.unwrap_or_else(|| TaskResult::fail("reply channel closed")))
        } else {
            debug!(
                task = %kind,
                target = %target_node_id,
                timeout_ms = self.config.task_timeout_ms,
                "no reply before timeout"
            );
            Ok(TaskResult::fail(TIMEOUT_INFO))
        }
    }
}

async fn first_reply(replies: &mut Subscription) -> Option<TaskResult> {
    while let Some(payload) = replies.recv().await {
        match TaskResult::parse(&payload) {
            Ok(result) => return Some(result),
            Err(err) => warn!(channel = replies.channel(), error = %err, "ignoring malformed reply"),
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Request listener
// ---------------------------------------------------------------------------

/// Serves task requests addressed to this node until the node starts
/// closing or the subscription ends.
///
/// Every request runs on its own task so a slow handler (a transfer probe,
/// say) never delays unrelated requests.
#[must_use]
pub fn spawn_request_listener(ctx: Arc<ClusterContext>, mut requests: Subscription) -> JoinHandle<()> {
    let span = info_span!("node", node_id = %ctx.node_id);
    tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    payload = requests.recv() => match payload {
                        Some(payload) => serve_request(&ctx, &payload),
                        None => break,
                    },
                    () = ctx.lifecycle.closing() => break,
                }
            }
            debug!("task request listener stopped");
        }
        .instrument(span),
    )
}

fn serve_request(ctx: &Arc<ClusterContext>, payload: &str) {
    let request = match TaskRequest::decode(payload) {
        Ok(request) => request,
        Err(err) => {
            warn!(error = %err, "dropping undecodable task request");
            return;
        }
    };
    if request.target_node_id != ctx.node_id {
        return;
    }
    let kind = request.task.kind();
    if !ctx.tasks.is_registered(kind) {
        warn!(task = %kind, "dropping task request without a registered handler");
        return;
    }

    let guard = ctx.lifecycle.in_flight_guard();
    let ctx = Arc::clone(ctx);
    tokio::spawn(
        async move {
            let _guard = guard;
            let result = ctx.execute_local(request.task).await;
            if let Err(err) = ctx
                .store
                .publish(&request.response_channel, &result.encode())
                .await
            {
                warn!(task = %kind, error = %err, "failed to publish task reply");
            }
        }
        .in_current_span(),
    );
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::cluster::HealthState;
    use crate::storage::MemoryStore;
    use crate::task::{TaskHandler, TaskKind};
    use crate::testing::test_node;
    use crate::traits::ClusterStore;

    struct Echo {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl TaskHandler for Echo {
        async fn handle(&self, ctx: &ClusterContext, task: Task) -> anyhow::Result<TaskResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let Task::BroadcastMessage { message } = task else {
                anyhow::bail!("unexpected task");
            };
            Ok(TaskResult::ok(format!("{}:{message}", ctx.node_id)))
        }
    }

    struct Failing;

    #[async_trait]
    impl TaskHandler for Failing {
        async fn handle(&self, _ctx: &ClusterContext, _task: Task) -> anyhow::Result<TaskResult> {
            anyhow::bail!("session is not connected here")
        }
    }

    fn broadcast(message: &str) -> Task {
        Task::BroadcastMessage {
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn local_dispatch_never_publishes() {
        let store = Arc::new(MemoryStore::new());
        let node = test_node(&store);
        let calls = Arc::new(AtomicU32::new(0));
        node.ctx
            .tasks
            .register(TaskKind::BroadcastMessage, Echo { calls: calls.clone() });

        let result = node.ctx.dispatch(node.ctx.node_id, broadcast("hi")).await;

        assert!(result.ok);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.publish_count(), 0);
    }

    #[tokio::test]
    async fn handler_error_becomes_failed_result() {
        let store = Arc::new(MemoryStore::new());
        let node = test_node(&store);
        node.ctx.tasks.register(TaskKind::BroadcastMessage, Failing);

        let result = node.ctx.execute_local(broadcast("hi")).await;
        assert_eq!(result, TaskResult::fail("session is not connected here"));
    }

    #[tokio::test]
    async fn remote_dispatch_gets_reply_from_target_only() {
        let store = Arc::new(MemoryStore::new());
        let caller = test_node(&store);
        let target = test_node(&store);
        let bystander = test_node(&store);

        let target_calls = Arc::new(AtomicU32::new(0));
        let bystander_calls = Arc::new(AtomicU32::new(0));
        target.ctx.tasks.register(
            TaskKind::BroadcastMessage,
            Echo { calls: target_calls.clone() },
        );
        bystander.ctx.tasks.register(
            TaskKind::BroadcastMessage,
            Echo { calls: bystander_calls.clone() },
        );
        for node in [&target, &bystander] {
            let sub = store.subscribe(TASK_REQUEST_CHANNEL).await.unwrap();
            let _listener = spawn_request_listener(node.ctx.clone(), sub);
        }

        let result = caller.ctx.dispatch(target.ctx.node_id, broadcast("hi")).await;

        assert_eq!(result, TaskResult::ok(format!("{}:hi", target.ctx.node_id)));
        assert_eq!(target_calls.load(Ordering::SeqCst), 1);
        assert_eq!(bystander_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_dispatch_times_out_after_two_seconds() {
        let store = Arc::new(MemoryStore::new());
        let caller = test_node(&store);

        let started = tokio::time::Instant::now();
        let result = caller.ctx.dispatch(Uuid::new_v4(), broadcast("hi")).await;
        let waited = started.elapsed();

        assert_eq!(result, TaskResult::fail(TIMEOUT_INFO));
        assert!(waited >= Duration::from_secs(2), "returned early: {waited:?}");
        assert!(waited < Duration::from_millis(2_100), "returned late: {waited:?}");
    }

    #[tokio::test]
    async fn undecodable_requests_do_not_stop_the_listener() {
        let store = Arc::new(MemoryStore::new());
        let caller = test_node(&store);
        let target = test_node(&store);
        let calls = Arc::new(AtomicU32::new(0));
        target
            .ctx
            .tasks
            .register(TaskKind::BroadcastMessage, Echo { calls: calls.clone() });
        let sub = store.subscribe(TASK_REQUEST_CHANNEL).await.unwrap();
        let _listener = spawn_request_listener(target.ctx.clone(), sub);

        store.publish(TASK_REQUEST_CHANNEL, "{not json").await.unwrap();
        store
            .publish(
                TASK_REQUEST_CHANNEL,
                &format!(
                    r#"{{"type":"SELF_DESTRUCT","targetNodeId":"{}","responseChannel":"c"}}"#,
                    target.ctx.node_id
                ),
            )
            .await
            .unwrap();

        let result = caller.ctx.dispatch(target.ctx.node_id, broadcast("hi")).await;
        assert!(result.ok);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn first_reply_wins() {
        let store = Arc::new(MemoryStore::new());
        let channel = response_channel(Uuid::new_v4());
        let mut replies = store.subscribe(&channel).await.unwrap();
        store.publish(&channel, "garbage").await.unwrap();
        store.publish(&channel, "true_first").await.unwrap();
        store.publish(&channel, "false_second").await.unwrap();

        assert_eq!(first_reply(&mut replies).await, Some(TaskResult::ok("first")));
    }

    #[tokio::test]
    async fn listener_exits_when_node_closes() {
        let store = Arc::new(MemoryStore::new());
        let node = test_node(&store);
        let sub = store.subscribe(TASK_REQUEST_CHANNEL).await.unwrap();
        let listener = spawn_request_listener(node.ctx.clone(), sub);

        node.ctx.lifecycle.advance(HealthState::Closing);
        listener.await.unwrap();
        assert_eq!(store.subscriber_count(TASK_REQUEST_CHANNEL), 0);
    }
}
