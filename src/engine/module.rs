use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::dispatcher::{DispatchContext, Dispatcher};
use super::rate_window::RateWindow;
use super::request::{Executable, PartStatus, RequestId};
use super::SchedulerError;
use crate::api::{ApiError, BrokerApi};
use crate::core::metrics::SchedulerMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Idle,
    Started,
    Stopping,
    Stopped,
}

impl ModuleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleState::Idle => "idle",
            ModuleState::Started => "started",
            ModuleState::Stopping => "stopping",
            ModuleState::Stopped => "stopped",
        }
    }
}

/// Generator of system polling requests for one module.
///
/// Called only from the module's own loop, so implementations need no
/// internal synchronisation beyond what they share with the outside.
pub trait AutoRequestSource: Send {
    /// `None` means nothing to poll right now; the loop asks again on its
    /// next wake-up.
    fn next_request(&mut self) -> Option<Box<dyn Executable>>;

    /// Invoked on every `start`, before the loop runs.
    fn restart(&mut self) {}
}

/// Source for modules that only serve user requests.
pub struct NoAutoRequests;

impl AutoRequestSource for NoAutoRequests {
    fn next_request(&mut self) -> Option<Box<dyn Executable>> {
        None
    }
}

/// Hook a module pulls when the broker rejects its credential.
///
/// Must not block: the module exits its loop right after calling it.
pub trait ReconnectTrigger: Send + Sync {
    fn request_reconnect(&self, module: &str);
}

#[derive(Debug, Clone)]
pub struct ModuleConfig {
    pub name: String,
    pub requests_per_second: u32,
    pub idle_wakeup: Duration,
}

impl ModuleConfig {
    pub fn new(name: impl Into<String>, requests_per_second: u32, idle_wakeup: Duration) -> Self {
        Self {
            name: name.into(),
            requests_per_second,
            idle_wakeup,
        }
    }
}

/// Collaborators shared by every module of one client.
#[derive(Clone)]
pub struct ModuleContext {
    pub api: Arc<dyn BrokerApi>,
    pub dispatcher: Dispatcher,
    pub metrics: SchedulerMetrics,
    pub reconnect: Arc<dyn ReconnectTrigger>,
}

struct Shared {
    name: String,
    context: ModuleContext,
    stopping: AtomicBool,
    wake: Notify,
    state: watch::Sender<ModuleState>,
}

impl Shared {
    fn set_state(&self, state: ModuleState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Module {}: {} -> {}", self.name, previous.as_str(), state.as_str());
        }
    }
}

/// Wakes one module from outside, e.g. from another module's response handler.
#[derive(Clone)]
pub struct ModuleWaker {
    shared: Arc<Shared>,
}

impl ModuleWaker {
    pub fn wake(&self) {
        self.shared.wake.notify_one();
    }
}

/// Everything the loop owns while it runs. Handed back on exit so queued
/// user requests survive a stop/start cycle.
struct LoopParts {
    inbox: mpsc::UnboundedReceiver<Box<dyn Executable>>,
    queue: VecDeque<Box<dyn Executable>>,
    source: Box<dyn AutoRequestSource>,
}

#[derive(Default)]
struct Runner {
    parked: Option<LoopParts>,
    handle: Option<JoinHandle<LoopParts>>,
}

/// Single-loop scheduler for one request category.
///
/// At most one request is in flight per module. User requests are served
/// FIFO and always ahead of the auto generator; both share one rate window.
pub struct Module {
    shared: Arc<Shared>,
    window: RateWindow,
    idle_wakeup: Duration,
    inbox: mpsc::UnboundedSender<Box<dyn Executable>>,
    runner: Mutex<Runner>,
}

impl Module {
    pub fn new(
        config: ModuleConfig,
        context: ModuleContext,
        source: Box<dyn AutoRequestSource>,
    ) -> Result<Self, SchedulerError> {
        let window = RateWindow::new(config.requests_per_second)?;
        if config.idle_wakeup.is_zero() {
            return Err(SchedulerError::InvalidIdleWakeup);
        }

        let (inbox, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ModuleState::Idle);

        Ok(Self {
            shared: Arc::new(Shared {
                name: config.name,
                context,
                stopping: AtomicBool::new(false),
                wake: Notify::new(),
                state,
            }),
            window,
            idle_wakeup: config.idle_wakeup,
            inbox,
            runner: Mutex::new(Runner {
                parked: Some(LoopParts {
                    inbox: rx,
                    queue: VecDeque::new(),
                    source,
                }),
                handle: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn budget(&self) -> u32 {
        self.window.budget()
    }

    pub fn state(&self) -> ModuleState {
        *self.shared.state.borrow()
    }

    pub fn is_started(&self) -> bool {
        self.state() == ModuleState::Started
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ModuleState> {
        self.shared.state.subscribe()
    }

    /// Launches the loop with a fresh rate window. No-op while running.
    pub async fn start(&self) {
        let mut runner = self.runner.lock().await;
        if runner.handle.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("Module {} already running", self.shared.name);
            return;
        }
        // The loop may have exited on its own after an authorization failure.
        if let Some(handle) = runner.handle.take() {
            Self::reclaim(&self.shared.name, &mut runner, handle).await;
        }
        let Some(mut parts) = runner.parked.take() else {
            error!("Module {} cannot start: loop state was lost", self.shared.name);
            return;
        };

        parts.source.restart();
        let mut window = self.window.clone();
        window.reset();

        self.shared.stopping.store(false, Ordering::SeqCst);
        self.shared.set_state(ModuleState::Started);
        info!(
            "Module {} started ({} req/s, {} queued)",
            self.shared.name,
            window.budget(),
            parts.queue.len()
        );

        runner.handle = Some(tokio::spawn(run_loop(
            self.shared.clone(),
            window,
            self.idle_wakeup,
            parts,
        )));
    }

    /// Stops the loop and waits for it to finish its current part.
    ///
    /// Idempotent. Queued user requests are kept for the next `start`.
    pub async fn stop(&self) {
        let mut runner = self.runner.lock().await;
        let Some(handle) = runner.handle.take() else {
            return;
        };

        self.shared.stopping.store(true, Ordering::SeqCst);
        if self.state() == ModuleState::Started {
            self.shared.set_state(ModuleState::Stopping);
        }
        self.shared.wake.notify_one();

        Self::reclaim(&self.shared.name, &mut runner, handle).await;
        self.shared.set_state(ModuleState::Stopped);
    }

    async fn reclaim(name: &str, runner: &mut Runner, handle: JoinHandle<LoopParts>) {
        match handle.await {
            Ok(parts) => runner.parked = Some(parts),
            Err(e) => error!("Module {} loop terminated abnormally: {}", name, e),
        }
    }

    /// Queues a user request behind any already waiting.
    pub fn enqueue(&self, request: Box<dyn Executable>) -> RequestId {
        let id = request.id();
        debug!(
            "Module {}: queued {} {}",
            self.shared.name,
            request.kind().as_str(),
            id
        );
        if let Err(mpsc::error::SendError(request)) = self.inbox.send(request) {
            warn!("Module {}: loop is gone, rejecting {}", self.shared.name, id);
            let delivery = request.reject(ApiError::InvalidRequest(format!(
                "module {} is no longer running",
                self.shared.name
            )));
            self.shared
                .context
                .dispatcher
                .enqueue_fn(DispatchContext::Response, delivery);
        }
        id
    }

    /// Makes the loop re-evaluate now, e.g. after its generator gained work.
    pub fn wake(&self) {
        self.shared.wake.notify_one();
    }

    pub fn waker(&self) -> ModuleWaker {
        ModuleWaker {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }
}

async fn run_loop(
    shared: Arc<Shared>,
    mut window: RateWindow,
    idle_wakeup: Duration,
    mut parts: LoopParts,
) -> LoopParts {
    let name = shared.name.as_str();
    let metrics = &shared.context.metrics;
    let mut auto: Option<Box<dyn Executable>> = None;
    let mut sleep_for: Option<Duration> = None;

    loop {
        if let Some(timeout) = sleep_for.take() {
            tokio::select! {
                _ = shared.wake.notified() => {}
                received = parts.inbox.recv() => match received {
                    Some(request) => parts.queue.push_back(request),
                    None => {
                        debug!("Module {}: owner dropped, leaving loop", name);
                        break;
                    }
                },
                _ = tokio::time::sleep(timeout) => {}
            }
        }

        if shared.stopping.load(Ordering::SeqCst) {
            break;
        }

        while let Ok(request) = parts.inbox.try_recv() {
            parts.queue.push_back(request);
        }
        metrics
            .user_queue_depth
            .with_label_values(&[name])
            .set(parts.queue.len() as i64);

        let now = Instant::now();
        let can_execute_now = window.can_execute(now);

        if auto.is_none() {
            auto = parts.source.next_request();
        }

        let from_user = !parts.queue.is_empty();
        let candidate = if let Some(front) = parts.queue.front_mut() {
            front
        } else if let Some(current) = auto.as_mut() {
            current
        } else {
            sleep_for = Some(idle_wakeup);
            continue;
        };

        let rate_limited = candidate.is_rate_limited();
        if rate_limited && !can_execute_now {
            let delay = window.wait_time(now);
            metrics.rate_limit_waits.with_label_values(&[name]).inc();
            debug!(
                "Module {}: budget of {} spent, waiting {:?}",
                name,
                window.budget(),
                delay
            );
            sleep_for = Some(delay);
            continue;
        }

        let id = candidate.id();
        let kind = candidate.kind();
        if rate_limited {
            window.record(Instant::now());
        }
        let outcome = candidate.execute_next_part(shared.context.api.as_ref()).await;
        let part = candidate.parts_executed();
        let done = candidate.is_done();

        let origin = if from_user { "user" } else { "auto" };
        metrics
            .requests_executed
            .with_label_values(&[name, origin])
            .inc();
        debug!(
            "Module {}: {} {} part {} ({}){}",
            name,
            kind.as_str(),
            id,
            part,
            origin,
            if done { ", done" } else { "" }
        );

        if done {
            if from_user {
                parts.queue.pop_front();
            } else {
                auto = None;
            }
        }

        shared
            .context
            .dispatcher
            .enqueue_fn(DispatchContext::Response, outcome.delivery);

        match outcome.status {
            PartStatus::Success => {}
            PartStatus::TransientError => {
                metrics.request_errors.with_label_values(&[name]).inc();
            }
            PartStatus::AuthError => {
                metrics.request_errors.with_label_values(&[name]).inc();
                metrics
                    .authorization_failures
                    .with_label_values(&[name])
                    .inc();
                warn!(
                    "Module {}: authorization rejected on {} {}, stopping for reconnect",
                    name,
                    kind.as_str(),
                    id
                );
                shared.stopping.store(true, Ordering::SeqCst);
                shared.set_state(ModuleState::Stopping);
                shared.context.reconnect.request_reconnect(name);
                break;
            }
        }
    }

    metrics
        .user_queue_depth
        .with_label_values(&[name])
        .set(parts.queue.len() as i64);
    shared.set_state(ModuleState::Stopped);
    info!("Module {} stopped ({} queued)", name, parts.queue.len());
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiResult, MockBrokerApi};
    use crate::engine::request::{Operation, Request, RequestKind, Response};
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::AtomicUsize;

    type Log = Arc<SyncMutex<Vec<(String, Instant)>>>;

    /// Records the instant of every call under `label`.
    struct Probe {
        label: String,
        log: Log,
        fail_with: Option<ApiError>,
        rate_limited: bool,
    }

    impl Probe {
        fn new(label: impl Into<String>, log: &Log) -> Self {
            Self {
                label: label.into(),
                log: log.clone(),
                fail_with: None,
                rate_limited: true,
            }
        }
    }

    #[async_trait]
    impl Operation for Probe {
        type Output = String;

        fn kind(&self) -> RequestKind {
            RequestKind::Custom("probe")
        }

        fn is_rate_limited(&self) -> bool {
            self.rate_limited
        }

        async fn call(&mut self, _api: &dyn BrokerApi) -> ApiResult<String> {
            self.log.lock().push((self.label.clone(), Instant::now()));
            match self.fail_with.take() {
                Some(e) => Err(e),
                None => Ok(self.label.clone()),
            }
        }
    }

    #[derive(Default)]
    struct CountingTrigger {
        calls: AtomicUsize,
    }

    impl ReconnectTrigger for CountingTrigger {
        fn request_reconnect(&self, _module: &str) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Never runs dry.
    struct Endless {
        log: Log,
        produced: usize,
    }

    impl AutoRequestSource for Endless {
        fn next_request(&mut self) -> Option<Box<dyn Executable>> {
            self.produced += 1;
            let probe = Probe::new(format!("auto-{}", self.produced), &self.log);
            Some(Request::with_handler(probe, |_| {}).boxed())
        }
    }

    /// Never has anything to poll; counts how often it was asked.
    struct CountingIdle {
        asked: Arc<AtomicUsize>,
    }

    impl AutoRequestSource for CountingIdle {
        fn next_request(&mut self) -> Option<Box<dyn Executable>> {
            self.asked.fetch_add(1, Ordering::SeqCst);
            None
        }
    }

    fn context(trigger: Arc<CountingTrigger>) -> ModuleContext {
        ModuleContext {
            api: Arc::new(MockBrokerApi::new()),
            dispatcher: Dispatcher::new(),
            metrics: SchedulerMetrics::new().unwrap(),
            reconnect: trigger,
        }
    }

    fn module(budget: u32, source: Box<dyn AutoRequestSource>) -> (Module, Arc<CountingTrigger>) {
        let trigger = Arc::new(CountingTrigger::default());
        let module = Module::new(
            ModuleConfig::new("test", budget, Duration::from_millis(1000)),
            context(trigger.clone()),
            source,
        )
        .unwrap();
        (module, trigger)
    }

    fn user_request(
        probe: Probe,
        done: &mpsc::UnboundedSender<Response<String>>,
    ) -> Box<dyn Executable> {
        let done = done.clone();
        Request::with_handler(probe, move |r| {
            let _ = done.send(r);
        })
        .boxed()
    }

    #[tokio::test]
    async fn bad_configuration_fails_at_construction() {
        let trigger = Arc::new(CountingTrigger::default());
        let zero_budget = Module::new(
            ModuleConfig::new("bad", 0, Duration::from_secs(1)),
            context(trigger.clone()),
            Box::new(NoAutoRequests),
        );
        assert_eq!(zero_budget.err(), Some(SchedulerError::InvalidBudget(0)));

        let zero_idle = Module::new(
            ModuleConfig::new("bad", 2, Duration::ZERO),
            context(trigger),
            Box::new(NoAutoRequests),
        );
        assert_eq!(zero_idle.err(), Some(SchedulerError::InvalidIdleWakeup));
    }

    #[tokio::test(start_paused = true)]
    async fn five_requests_at_two_per_second_span_two_seconds() {
        let (module, _) = module(2, Box::new(NoAutoRequests));
        let log: Log = Default::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for i in 0..5 {
            module.enqueue(user_request(Probe::new(format!("u{}", i), &log), &tx));
        }
        module.start().await;
        for _ in 0..5 {
            rx.recv().await.unwrap();
        }
        module.stop().await;

        let log = log.lock();
        let times: Vec<Instant> = log.iter().map(|(_, t)| *t).collect();
        assert_eq!(times.len(), 5);
        assert!(times[4].duration_since(times[0]) >= Duration::from_secs(2));

        // No rolling second holds more than the budget.
        for (i, start) in times.iter().enumerate() {
            let in_window = times[i..]
                .iter()
                .filter(|t| t.duration_since(*start) < Duration::from_secs(1))
                .count();
            assert!(in_window <= 2, "{} executions within 1s of {:?}", in_window, start);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn user_requests_run_fifo() {
        let (module, _) = module(10, Box::new(NoAutoRequests));
        let log: Log = Default::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        module.start().await;

        module.enqueue(user_request(Probe::new("A", &log), &tx));
        module.enqueue(user_request(Probe::new("B", &log), &tx));
        assert_eq!(rx.recv().await.unwrap().result.unwrap(), "A");
        assert_eq!(rx.recv().await.unwrap().result.unwrap(), "B");
        module.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn endless_auto_polling_does_not_starve_users() {
        let log: Log = Default::default();
        let (module, _) = module(
            3,
            Box::new(Endless {
                log: log.clone(),
                produced: 0,
            }),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        module.start().await;
        tokio::time::sleep(Duration::from_millis(2500)).await;

        for i in 0..4 {
            module.enqueue(user_request(Probe::new(format!("u{}", i), &log), &tx));
        }
        for i in 0..4 {
            let response = rx.recv().await.unwrap();
            assert_eq!(response.result.unwrap(), format!("u{}", i));
        }
        module.stop().await;

        // Once queued, users went ahead of every later auto part.
        let log = log.lock();
        let first_user = log.iter().position(|(l, _)| l == "u0").unwrap();
        let users: Vec<_> = log[first_user..first_user + 4]
            .iter()
            .map(|(l, _)| l.as_str())
            .collect();
        assert_eq!(users, ["u0", "u1", "u2", "u3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn unthrottled_requests_ignore_the_window() {
        let (module, _) = module(1, Box::new(NoAutoRequests));
        let log: Log = Default::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for i in 0..4 {
            let mut probe = Probe::new(format!("admin{}", i), &log);
            probe.rate_limited = false;
            module.enqueue(user_request(probe, &tx));
        }
        let started = Instant::now();
        module.start().await;
        for _ in 0..4 {
            rx.recv().await.unwrap();
        }
        assert!(Instant::now().duration_since(started) < Duration::from_millis(10));
        module.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn authorization_error_stops_module_and_keeps_queue() {
        let (module, trigger) = module(10, Box::new(NoAutoRequests));
        let log: Log = Default::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut failing = Probe::new("bad", &log);
        failing.fail_with = Some(ApiError::Unauthorized("token expired".into()));
        module.enqueue(user_request(failing, &tx));
        module.enqueue(user_request(Probe::new("after", &log), &tx));

        let mut states = module.subscribe_state();
        module.start().await;

        let response = rx.recv().await.unwrap();
        assert!(response.error().is_some_and(ApiError::is_authorization));
        states
            .wait_for(|s| *s == ModuleState::Stopped)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(log.lock().len(), 1);
        assert_eq!(trigger.calls.load(Ordering::SeqCst), 1);

        // The survivor runs once the module is restarted.
        module.start().await;
        assert_eq!(rx.recv().await.unwrap().result.unwrap(), "after");
        module.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn transient_error_keeps_loop_running() {
        let (module, trigger) = module(10, Box::new(NoAutoRequests));
        let log: Log = Default::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        module.start().await;

        let mut failing = Probe::new("flaky", &log);
        failing.fail_with = Some(ApiError::Status {
            operation: "probe".into(),
            status: 503,
        });
        module.enqueue(user_request(failing, &tx));
        module.enqueue(user_request(Probe::new("ok", &log), &tx));

        assert!(rx.recv().await.unwrap().has_error());
        assert_eq!(rx.recv().await.unwrap().result.unwrap(), "ok");
        assert!(module.is_started());
        assert_eq!(trigger.calls.load(Ordering::SeqCst), 0);
        module.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let (module, _) = module(2, Box::new(NoAutoRequests));
        module.stop().await;
        assert_eq!(module.state(), ModuleState::Idle);

        module.start().await;
        assert!(module.is_started());
        module.stop().await;
        assert_eq!(module.state(), ModuleState::Stopped);
        module.stop().await;
        module.stop().await;
        assert_eq!(module.state(), ModuleState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_resets_the_rate_window() {
        let (module, _) = module(1, Box::new(NoAutoRequests));
        let log: Log = Default::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        module.start().await;

        module.enqueue(user_request(Probe::new("first", &log), &tx));
        rx.recv().await.unwrap();
        module.stop().await;

        let before = Instant::now();
        module.start().await;
        module.enqueue(user_request(Probe::new("second", &log), &tx));
        rx.recv().await.unwrap();
        assert!(Instant::now().duration_since(before) < Duration::from_millis(10));
        module.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_a_started_module_ends_its_loop() {
        let asked = Arc::new(AtomicUsize::new(0));
        let (module, _) = module(
            2,
            Box::new(CountingIdle {
                asked: asked.clone(),
            }),
        );
        let mut state = module.subscribe_state();
        module.start().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let before = asked.load(Ordering::SeqCst);
        assert!(before >= 1);

        drop(module);
        state
            .wait_for(|s| *s == ModuleState::Stopped)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(asked.load(Ordering::SeqCst), before);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_module_stops_auto_polling() {
        let log: Log = Default::default();
        let (module, _) = module(
            2,
            Box::new(Endless {
                log: log.clone(),
                produced: 0,
            }),
        );
        let mut state = module.subscribe_state();
        module.start().await;
        tokio::time::sleep(Duration::from_millis(1500)).await;

        drop(module);
        state
            .wait_for(|s| *s == ModuleState::Stopped)
            .await
            .unwrap();
        let polled = log.lock().len();
        assert!(polled >= 2);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(log.lock().len(), polled);
    }
}
