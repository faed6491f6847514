//! Async driver: a single-writer actor around [`ClientScheduler`].
//!
//! Events arrive on an mpsc channel; the epoch timer and a shutdown
//! [`Notify`] are multiplexed with them in one `select!` loop. Commands and
//! work requests go out on spawned tasks, so the loop never waits on the
//! executor or the network. Fetch outcomes come back as `FetchReply` events.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::collaborator::{outcome_of, TaskExecutor, WorkFetcher};
use crate::error::SchedError;
use crate::runner::{ClientScheduler, SchedulerEvent};
use crate::types::Decision;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Cloneable handle for feeding events to a running driver.
#[derive(Clone)]
pub struct DriverHandle {
    tx: mpsc::Sender<SchedulerEvent>,
    shutdown: Arc<Notify>,
}

impl DriverHandle {
    pub async fn send(&self, event: SchedulerEvent) -> Result<(), SchedError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| SchedError::DriverStopped)
    }

    /// Stop the driver loop. Safe to call before the loop starts waiting.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

pub struct SchedulerDriver {
    scheduler: ClientScheduler,
    executor: Arc<dyn TaskExecutor>,
    fetcher: Arc<dyn WorkFetcher>,
    tx: mpsc::Sender<SchedulerEvent>,
    rx: mpsc::Receiver<SchedulerEvent>,
    shutdown: Arc<Notify>,
    tick: Duration,
}

impl SchedulerDriver {
    pub fn new(
        scheduler: ClientScheduler,
        executor: Arc<dyn TaskExecutor>,
        fetcher: Arc<dyn WorkFetcher>,
    ) -> (Self, DriverHandle) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let shutdown = Arc::new(Notify::new());
        let tick = Duration::from_secs_f64(scheduler.config().prefs.period_secs());
        let handle = DriverHandle {
            tx: tx.clone(),
            shutdown: Arc::clone(&shutdown),
        };
        let driver = Self {
            scheduler,
            executor,
            fetcher,
            tx,
            rx,
            shutdown,
            tick,
        };
        (driver, handle)
    }

    /// Override the epoch timer interval.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Run until shutdown. Returns the scheduler so its final state can be
    /// inspected.
    pub async fn run(mut self) -> ClientScheduler {
        info!(
            executor = self.executor.name(),
            tick_secs = self.tick.as_secs_f64(),
            "scheduler driver starting"
        );

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the initial pass covers it.
        ticker.tick().await;

        let decision = self.scheduler.reschedule(Utc::now());
        self.dispatch(decision);

        loop {
            tokio::select! {
                Some(event) = self.rx.recv() => {
                    self.handle(event);
                }
                _ = ticker.tick() => {
                    self.handle(SchedulerEvent::EpochTick);
                }
                _ = self.shutdown.notified() => {
                    info!("scheduler driver shutting down");
                    break;
                }
            }
        }

        self.scheduler
    }

    fn handle(&mut self, event: SchedulerEvent) {
        debug!(event = ?event, "event received");
        match self.scheduler.handle_event(event, Utc::now()) {
            Ok(Some(decision)) => self.dispatch(decision),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "event rejected"),
        }
    }

    fn dispatch(&self, decision: Decision) {
        if !decision.commands.is_empty() {
            let executor = Arc::clone(&self.executor);
            let commands = decision.commands;
            // One task per pass keeps a slot's preempt ahead of its start.
            tokio::spawn(async move {
                for command in &commands {
                    if let Err(e) = executor.apply(command).await {
                        warn!(error = %e, command = ?command, "dispatch command failed");
                    }
                }
            });
        }

        if let Some(request) = decision.fetch {
            let fetcher = Arc::clone(&self.fetcher);
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let outcome = outcome_of(fetcher.request_work(&request).await);
                let reply = SchedulerEvent::FetchReply {
                    request_id: request.request_id,
                    outcome,
                };
                if tx.send(reply).await.is_err() {
                    debug!(project = %request.project, "driver gone before fetch reply");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::{ExecError, FetchError};
    use crate::types::{DispatchCommand, FetchOutcome, WorkRequest};
    use chrono::Duration as ChronoDuration;
    use crunch_core::{Config, Project};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockExecutor {
        tx: mpsc::UnboundedSender<DispatchCommand>,
    }

    #[async_trait::async_trait]
    impl TaskExecutor for MockExecutor {
        async fn apply(&self, command: &DispatchCommand) -> Result<(), ExecError> {
            let _ = self.tx.send(*command);
            Ok(())
        }
        fn name(&self) -> &str {
            "mock"
        }
    }

    struct MockFetcher {
        calls: Arc<AtomicUsize>,
        reachable: bool,
    }

    #[async_trait::async_trait]
    impl WorkFetcher for MockFetcher {
        async fn request_work(&self, request: &WorkRequest) -> Result<FetchOutcome, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.reachable {
                Ok(FetchOutcome::Success { request_delay_secs: Some(3_600.0) })
            } else {
                Err(FetchError::Unreachable(request.project.clone()))
            }
        }
    }

    struct FailingExecutor {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl TaskExecutor for FailingExecutor {
        async fn apply(&self, command: &DispatchCommand) -> Result<(), ExecError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(ExecError::Failed {
                task: command.task(),
                message: "spawn refused".to_string(),
            })
        }
    }

    fn scheduler(with_task: bool) -> ClientScheduler {
        let mut config = Config::default();
        config.prefs.max_cpus = 1;
        config.host.processor_count = 1;
        let mut s = ClientScheduler::new(config, Utc::now()).unwrap();
        s.add_project(Project::new("http://a", "A", 1.0).unwrap()).unwrap();
        if with_task {
            s.add_task(
                &"http://a".into(),
                "a1",
                Utc::now() + ChronoDuration::days(30),
                1_000_000.0,
            )
            .unwrap();
        }
        s
    }

    fn driver(
        scheduler: ClientScheduler,
        reachable: bool,
    ) -> (
        SchedulerDriver,
        DriverHandle,
        mpsc::UnboundedReceiver<DispatchCommand>,
        Arc<AtomicUsize>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let (driver, handle) = SchedulerDriver::new(
            scheduler,
            Arc::new(MockExecutor { tx: cmd_tx }),
            Arc::new(MockFetcher {
                calls: Arc::clone(&calls),
                reachable,
            }),
        );
        (driver, handle, cmd_rx, calls)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn initial_pass_dispatches_and_suspend_preempts() {
        let (driver, handle, mut commands, _) = driver(scheduler(true), true);
        let join = tokio::spawn(driver.run());

        let first = commands.recv().await.unwrap();
        assert!(matches!(first, DispatchCommand::Start { slot: 0, .. }));

        handle
            .send(SchedulerEvent::SuspendProject("http://a".into()))
            .await
            .unwrap();
        let second = commands.recv().await.unwrap();
        assert_eq!(second, DispatchCommand::Preempt { task: first.task(), slot: 0 });

        handle.shutdown();
        let scheduler = join.await.unwrap();
        assert_eq!(scheduler.state().idle_slots(), 1);
    }

    #[tokio::test]
    async fn unreachable_project_backs_off_through_reply_event() {
        let (driver, handle, _commands, calls) = driver(scheduler(false), false);
        let metrics = driver.scheduler.metrics_handle();
        let join = tokio::spawn(driver.run());

        wait_for(|| metrics.read().map(|m| m.fetch_failures == 1).unwrap_or(false)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        handle.shutdown();
        let scheduler = join.await.unwrap();
        let project = scheduler.state().project(&"http://a".into()).unwrap();
        assert_eq!(project.backoff.failures, 1);
        assert!(!project.fetch_in_flight);
        assert!(project.next_contact_not_before.is_some());
    }

    #[tokio::test]
    async fn rejected_event_does_not_stop_the_loop() {
        let (driver, handle, mut commands, _) = driver(scheduler(true), true);
        let join = tokio::spawn(driver.run());
        commands.recv().await.unwrap();

        handle
            .send(SchedulerEvent::SuspendProject("http://missing".into()))
            .await
            .unwrap();
        handle
            .send(SchedulerEvent::SuspendProject("http://a".into()))
            .await
            .unwrap();
        assert!(matches!(
            commands.recv().await.unwrap(),
            DispatchCommand::Preempt { .. }
        ));

        handle.shutdown();
        join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn epoch_timer_closes_epochs() {
        let (driver, handle, _commands, _) = driver(scheduler(true), true);
        let driver = driver.with_tick(Duration::from_secs(60));
        let metrics = driver.scheduler.metrics_handle();
        let join = tokio::spawn(driver.run());

        tokio::time::sleep(Duration::from_secs(125)).await;
        let closed = metrics.read().map(|m| m.epochs_closed).unwrap_or(0);
        // Initial pass plus two timer ticks.
        assert!(closed >= 3, "only {closed} epochs closed");

        handle.shutdown();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn send_after_shutdown_fails() {
        let (driver, handle, _commands, _) = driver(scheduler(true), true);
        let join = tokio::spawn(driver.run());
        handle.shutdown();
        drop(join.await.unwrap());
        let err = handle.send(SchedulerEvent::EpochTick).await.unwrap_err();
        assert!(matches!(err, SchedError::DriverStopped));
    }

    #[tokio::test]
    async fn failed_command_does_not_stop_the_loop() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let (driver, handle) = SchedulerDriver::new(
            scheduler(true),
            Arc::new(FailingExecutor {
                attempts: Arc::clone(&attempts),
            }),
            Arc::new(MockFetcher {
                calls: Arc::new(AtomicUsize::new(0)),
                reachable: true,
            }),
        );
        let join = tokio::spawn(driver.run());

        wait_for(|| attempts.load(Ordering::SeqCst) == 1).await;
        handle
            .send(SchedulerEvent::SuspendProject("http://a".into()))
            .await
            .unwrap();
        wait_for(|| attempts.load(Ordering::SeqCst) == 2).await;

        handle.shutdown();
        let scheduler = join.await.unwrap();
        assert_eq!(scheduler.state().idle_slots(), 1);
    }
}
