use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Logical lane an action can be pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchContext {
    /// Connection lifecycle and other request-issuing work.
    Request,
    /// Caller handlers and event fan-out.
    Response,
}

impl DispatchContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchContext::Request => "request",
            DispatchContext::Response => "response",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("{0} lane is closed")]
    Closed(&'static str),
    #[error("action posted to the {0} lane panicked")]
    Panicked(&'static str),
}

tokio::task_local! {
    static CURRENT: DispatchContext;
}

type Job = BoxFuture<'static, ()>;

/// Two single-consumer lanes, each drained in submission order by one task.
///
/// Cheap to clone; lanes shut down once every clone is dropped.
#[derive(Clone)]
pub struct Dispatcher {
    request_tx: mpsc::UnboundedSender<Job>,
    response_tx: mpsc::UnboundedSender<Job>,
}

impl Dispatcher {
    /// Spawns both lanes on the current tokio runtime.
    pub fn new() -> Self {
        Self {
            request_tx: Self::spawn_lane(DispatchContext::Request),
            response_tx: Self::spawn_lane(DispatchContext::Response),
        }
    }

    fn spawn_lane(context: DispatchContext) -> mpsc::UnboundedSender<Job> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(CURRENT.scope(context, async move {
            while let Some(job) = rx.recv().await {
                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    tracing::error!("Action on the {} lane panicked", context.as_str());
                }
            }
            tracing::debug!("{} lane drained and closed", context.as_str());
        }));
        tx
    }

    /// The lane the calling task is running on, if any.
    pub fn current() -> Option<DispatchContext> {
        CURRENT.try_with(|c| *c).ok()
    }

    pub fn is_on(context: DispatchContext) -> bool {
        Self::current() == Some(context)
    }

    fn lane(&self, context: DispatchContext) -> &mpsc::UnboundedSender<Job> {
        match context {
            DispatchContext::Request => &self.request_tx,
            DispatchContext::Response => &self.response_tx,
        }
    }

    /// Runs `action` on `context` and waits for its result.
    ///
    /// Already on that lane: runs inline, so re-entrant posts cannot deadlock.
    pub async fn post_sync<F, Fut, R>(
        &self,
        context: DispatchContext,
        action: F,
    ) -> Result<R, DispatchError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        if Self::is_on(context) {
            return Ok(action().await);
        }

        let (done_tx, done_rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let result = action().await;
            let _ = done_tx.send(result);
        });

        self.lane(context)
            .send(job)
            .map_err(|_| DispatchError::Closed(context.as_str()))?;

        // A panicking job drops the sender without sending.
        done_rx
            .await
            .map_err(|_| DispatchError::Panicked(context.as_str()))
    }

    /// Queues `action` on `context` without waiting.
    ///
    /// Already on that lane and not `force_async`: runs inline before returning.
    pub async fn post_async<F, Fut>(&self, context: DispatchContext, action: F, force_async: bool)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if !force_async && Self::is_on(context) {
            action().await;
            return;
        }
        self.enqueue(context, action);
    }

    /// Queues `action` from synchronous code.
    pub fn enqueue<F, Fut>(&self, context: DispatchContext, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let job: Job = Box::pin(async move { action().await });
        if self.lane(context).send(job).is_err() {
            tracing::warn!("Dropped action for closed {} lane", context.as_str());
        }
    }

    /// Queues a plain closure, typically a response handler.
    pub fn enqueue_fn<F>(&self, context: DispatchContext, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(context, move || async move { action() });
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[tokio::test]
    async fn same_lane_actions_run_in_submission_order() {
        let dispatcher = Dispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..20 {
            let log = log.clone();
            dispatcher.enqueue_fn(DispatchContext::Response, move || log.lock().push(i));
        }
        let log_end = log.clone();
        dispatcher
            .post_sync(DispatchContext::Response, move || async move {
                log_end.lock().push(99)
            })
            .await
            .unwrap();

        let expected: Vec<i32> = (0..20).chain(std::iter::once(99)).collect();
        assert_eq!(*log.lock(), expected);
    }

    #[tokio::test]
    async fn post_sync_runs_on_the_target_lane() {
        let dispatcher = Dispatcher::new();
        assert_eq!(Dispatcher::current(), None);

        let seen = dispatcher
            .post_sync(DispatchContext::Request, || async { Dispatcher::current() })
            .await
            .unwrap();
        assert_eq!(seen, Some(DispatchContext::Request));
    }

    #[tokio::test]
    async fn nested_post_sync_on_same_lane_runs_inline() {
        let dispatcher = Dispatcher::new();
        let inner = dispatcher.clone();

        let value = dispatcher
            .post_sync(DispatchContext::Request, move || async move {
                inner
                    .post_sync(DispatchContext::Request, || async { 7 })
                    .await
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn panicking_action_does_not_stop_the_lane() {
        let dispatcher = Dispatcher::new();

        let result = dispatcher
            .post_sync(DispatchContext::Response, || async {
                panic!("handler blew up");
            })
            .await;
        assert_eq!(result, Err::<(), _>(DispatchError::Panicked("response")));

        let after = dispatcher
            .post_sync(DispatchContext::Response, || async { "still alive" })
            .await;
        assert_eq!(after, Ok("still alive"));
    }

    #[tokio::test]
    async fn post_async_force_queues_behind_current_action() {
        let dispatcher = Dispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner = dispatcher.clone();
        let outer_log = log.clone();

        dispatcher
            .post_sync(DispatchContext::Request, move || async move {
                let queued = outer_log.clone();
                inner
                    .post_async(
                        DispatchContext::Request,
                        move || async move { queued.lock().push("forced") },
                        true,
                    )
                    .await;
                let inline = outer_log.clone();
                inner
                    .post_async(
                        DispatchContext::Request,
                        move || async move { inline.lock().push("inline") },
                        false,
                    )
                    .await;
                outer_log.lock().push("outer");
            })
            .await
            .unwrap();

        dispatcher
            .post_sync(DispatchContext::Request, || async {})
            .await
            .unwrap();
        assert_eq!(*log.lock(), vec!["inline", "outer", "forced"]);
    }
}
