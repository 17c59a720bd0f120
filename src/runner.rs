use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Signs the sample document with one artifact as the visible stamp.
#[async_trait]
pub trait SigningService: Send + Sync {
    async fn sign(&self, artifact: &str) -> anyhow::Result<SignedDocument>;
}

/// Loads a signed document and reports whether it could be shown.
#[async_trait]
pub trait Viewer: Send + Sync {
    async fn display(&self, document: &SignedDocument) -> ViewOutcome;
}

/// Output of a successful signing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDocument {
    pub artifact: String,
    pub path: PathBuf,
}

#[derive(Debug)]
pub enum ViewOutcome {
    Loaded,
    LoadFailed(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerConfig {
    /// How long a loaded document (or a signing failure) stays on screen
    /// before its result is recorded.
    pub show_document_for: Duration,
    /// Pause before each signing call, leaving the grid visible.
    pub show_results_for: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            show_document_for: Duration::from_millis(1000),
            show_results_for: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Signing,
    AwaitingDisplay,
    Recording,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Signing => "signing",
            Phase::AwaitingDisplay => "awaiting display",
            Phase::Recording => "recording",
            Phase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Snapshot of the run, published after every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub total: usize,
    /// Index of the artifact being tested; `None` before the first one.
    pub cursor: Option<usize>,
    pub phase: Phase,
    pub results: BTreeMap<usize, bool>,
}

impl Progress {
    fn new(total: usize) -> Self {
        Self {
            total,
            cursor: None,
            phase: Phase::Idle,
            results: BTreeMap::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.results.len() == self.total
    }

    pub fn passed(&self) -> usize {
        self.results.values().filter(|&&ok| ok).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.passed()
    }
}

/// Outcome of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub artifacts: Vec<String>,
    pub results: BTreeMap<usize, bool>,
}

impl RunReport {
    pub fn passed(&self) -> usize {
        self.results.values().filter(|&&ok| ok).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.passed()
    }
}

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("runner event channel closed before the run finished")]
    ChannelClosed,
    #[error("runner task panicked")]
    TaskPanicked(#[source] tokio::task::JoinError),
    #[error("result for artifact #{index} was already recorded")]
    DuplicateResult { index: usize },
}

/// Completion events, tagged with the index they belong to.
#[derive(Debug)]
enum Event {
    Signed {
        index: usize,
        outcome: anyhow::Result<SignedDocument>,
    },
    Displayed {
        index: usize,
        outcome: ViewOutcome,
    },
    HoldElapsed {
        index: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Signing { index: usize },
    AwaitingDisplay { index: usize },
    Recording { index: usize, passed: bool },
    Done,
}

impl State {
    fn phase(self) -> Phase {
        match self {
            State::Idle => Phase::Idle,
            State::Signing { .. } => Phase::Signing,
            State::AwaitingDisplay { .. } => Phase::AwaitingDisplay,
            State::Recording { .. } => Phase::Recording,
            State::Done => Phase::Done,
        }
    }
}

/// Drives a test run over a fixed list of artifacts.
///
/// The run state lives in a single task. Service calls and timers run in
/// tasks of their own and report back through one event channel, so at most
/// one of them is outstanding and results are recorded in index order.
pub struct TestRunner {
    signer: Arc<dyn SigningService>,
    viewer: Arc<dyn Viewer>,
    config: RunnerConfig,
}

impl TestRunner {
    pub fn new(
        signer: Arc<dyn SigningService>,
        viewer: Arc<dyn Viewer>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            signer,
            viewer,
            config,
        }
    }

    /// Spawns the run on the current tokio runtime.
    pub fn start(self, artifacts: Vec<String>) -> RunHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = watch::channel(Progress::new(artifacts.len()));

        let machine = Machine {
            artifacts,
            cursor: None,
            results: BTreeMap::new(),
            state: State::Idle,
            signer: self.signer,
            viewer: self.viewer,
            config: self.config,
            events_tx,
            progress: progress_tx,
        };

        RunHandle {
            progress: progress_rx,
            task: tokio::spawn(machine.run(events_rx)),
        }
    }
}

/// Handle to a running test.
pub struct RunHandle {
    progress: watch::Receiver<Progress>,
    task: JoinHandle<Result<RunReport, RunnerError>>,
}

impl RunHandle {
    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }

    /// Waits for the run to end.
    pub async fn finished(self) -> Result<RunReport, RunnerError> {
        self.task.await.map_err(RunnerError::TaskPanicked)?
    }
}

struct Machine {
    artifacts: Vec<String>,
    cursor: Option<usize>,
    results: BTreeMap<usize, bool>,
    state: State,
    signer: Arc<dyn SigningService>,
    viewer: Arc<dyn Viewer>,
    config: RunnerConfig,
    events_tx: mpsc::UnboundedSender<Event>,
    progress: watch::Sender<Progress>,
}

impl Machine {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) -> Result<RunReport, RunnerError> {
        info!(artifacts = self.artifacts.len(), "starting signing test");

        if self.artifacts.is_empty() {
            self.state = State::Done;
            self.publish();
        } else {
            self.advance();
        }

        while self.state != State::Done {
            let event = events.recv().await.ok_or(RunnerError::ChannelClosed)?;
            self.handle(event)?;
        }

        let report = RunReport {
            artifacts: self.artifacts,
            results: self.results,
        };
        info!(
            passed = report.passed(),
            failed = report.failed(),
            "signing test finished"
        );
        Ok(report)
    }

    fn handle(&mut self, event: Event) -> Result<(), RunnerError> {
        match (self.state, event) {
            (State::Signing { index }, Event::Signed { index: i, outcome }) if index == i => {
                match outcome {
                    Ok(document) => {
                        debug!(index, path = %document.path.display(), "document signed");
                        self.set_state(State::AwaitingDisplay { index });
                        self.spawn_display(index, document);
                    }
                    Err(e) => {
                        warn!(index, artifact = %self.artifacts[index], error = ?e, "signing failed");
                        self.set_state(State::Recording {
                            index,
                            passed: false,
                        });
                        self.spawn_hold(index);
                    }
                }
            }
            (State::AwaitingDisplay { index }, Event::Displayed { index: i, outcome })
                if index == i =>
            {
                match outcome {
                    ViewOutcome::Loaded => {
                        self.set_state(State::Recording {
                            index,
                            passed: true,
                        });
                        self.spawn_hold(index);
                    }
                    ViewOutcome::LoadFailed(e) => {
                        warn!(index, artifact = %self.artifacts[index], error = ?e, "viewer failed to load document");
                        self.set_state(State::Recording {
                            index,
                            passed: false,
                        });
                        self.record(index, false)?;
                        self.advance();
                    }
                }
            }
            (State::Recording { index, passed }, Event::HoldElapsed { index: i }) if index == i => {
                self.record(index, passed)?;
                self.advance();
            }
            (state, event) => {
                warn!(?state, ?event, "dropping unexpected runner event");
            }
        }
        Ok(())
    }

    fn advance(&mut self) {
        let next = self.cursor.map_or(0, |c| c + 1);
        self.cursor = Some(next);

        if next < self.artifacts.len() {
            debug!(index = next, artifact = %self.artifacts[next], "testing artifact");
            self.set_state(State::Signing { index: next });
            self.spawn_sign(next);
        } else {
            self.set_state(State::Done);
        }
    }

    fn record(&mut self, index: usize, passed: bool) -> Result<(), RunnerError> {
        match self.results.entry(index) {
            Entry::Occupied(_) => return Err(RunnerError::DuplicateResult { index }),
            Entry::Vacant(entry) => {
                entry.insert(passed);
            }
        }
        info!(index, artifact = %self.artifacts[index], passed, "recorded result");
        self.publish();
        Ok(())
    }

    fn set_state(&mut self, state: State) {
        debug!(from = %self.state.phase(), to = %state.phase(), "runner transition");
        self.state = state;
        self.publish();
    }

    fn publish(&self) {
        let progress = Progress {
            total: self.artifacts.len(),
            cursor: self.cursor,
            phase: self.state.phase(),
            results: self.results.clone(),
        };
        // Nobody watching is fine.
        self.progress.send_replace(progress);
    }

    fn spawn_sign(&self, index: usize) {
        let signer = Arc::clone(&self.signer);
        let artifact = self.artifacts[index].clone();
        let events = self.events_tx.clone();
        let pause = self.config.show_results_for;

        tokio::spawn(async move {
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
            let call = tokio::spawn(async move { signer.sign(&artifact).await });
            let outcome = match call.await {
                Ok(outcome) => outcome,
                Err(e) => Err(anyhow::anyhow!("signing service panicked: {e}")),
            };
            let _ = events.send(Event::Signed { index, outcome });
        });
    }

    fn spawn_display(&self, index: usize, document: SignedDocument) {
        let viewer = Arc::clone(&self.viewer);
        let events = self.events_tx.clone();

        tokio::spawn(async move {
            let call = tokio::spawn(async move { viewer.display(&document).await });
            let outcome = match call.await {
                Ok(outcome) => outcome,
                Err(e) => ViewOutcome::LoadFailed(anyhow::anyhow!("viewer panicked: {e}")),
            };
            let _ = events.send(Event::Displayed { index, outcome });
        });
    }

    fn spawn_hold(&self, index: usize) {
        let events = self.events_tx.clone();
        let hold = self.config.show_document_for;

        tokio::spawn(async move {
            tokio::time::sleep(hold).await;
            let _ = events.send(Event::HoldElapsed { index });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Tracks calls to both fakes and the number of calls in flight.
    #[derive(Default)]
    struct Calls {
        signed: Mutex<Vec<String>>,
        displayed: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl Calls {
        fn enter(&self) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        }

        fn leave(&self) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct FakeSigner {
        calls: Arc<Calls>,
        failing: HashSet<&'static str>,
        panicking: HashSet<&'static str>,
    }

    #[async_trait]
    impl SigningService for FakeSigner {
        async fn sign(&self, artifact: &str) -> anyhow::Result<SignedDocument> {
            self.calls.enter();
            self.calls.signed.lock().unwrap().push(artifact.to_owned());
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.calls.leave();

            if self.panicking.contains(artifact) {
                panic!("signer exploded");
            }
            if self.failing.contains(artifact) {
                anyhow::bail!("cannot sign {artifact}");
            }
            Ok(SignedDocument {
                artifact: artifact.to_owned(),
                path: PathBuf::from("signedDocument.pdf"),
            })
        }
    }

    struct FakeViewer {
        calls: Arc<Calls>,
        failing: HashSet<&'static str>,
    }

    #[async_trait]
    impl Viewer for FakeViewer {
        async fn display(&self, document: &SignedDocument) -> ViewOutcome {
            self.calls.enter();
            self.calls
                .displayed
                .lock()
                .unwrap()
                .push(document.artifact.clone());
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.calls.leave();

            if self.failing.contains(document.artifact.as_str()) {
                ViewOutcome::LoadFailed(anyhow::anyhow!("corrupt document"))
            } else {
                ViewOutcome::Loaded
            }
        }
    }

    struct Fixture {
        calls: Arc<Calls>,
        sign_failing: HashSet<&'static str>,
        sign_panicking: HashSet<&'static str>,
        view_failing: HashSet<&'static str>,
        config: RunnerConfig,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                calls: Arc::new(Calls::default()),
                sign_failing: HashSet::new(),
                sign_panicking: HashSet::new(),
                view_failing: HashSet::new(),
                config: RunnerConfig::default(),
            }
        }

        fn start(&self, artifacts: &[&str]) -> RunHandle {
            let signer = FakeSigner {
                calls: Arc::clone(&self.calls),
                failing: self.sign_failing.clone(),
                panicking: self.sign_panicking.clone(),
            };
            let viewer = FakeViewer {
                calls: Arc::clone(&self.calls),
                failing: self.view_failing.clone(),
            };
            TestRunner::new(Arc::new(signer), Arc::new(viewer), self.config)
                .start(artifacts.iter().map(|a| a.to_string()).collect())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn every_artifact_gets_exactly_one_result() {
        let fixture = Fixture::new();
        let artifacts = ["a.png", "b.png", "c.png", "d.png", "e.png"];
        let report = fixture.start(&artifacts).finished().await.unwrap();

        assert_eq!(report.results.len(), artifacts.len());
        assert_eq!(
            report.results.keys().copied().collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );
        assert_eq!(report.passed(), 5);
        // Artifacts are signed strictly in list order, each exactly once.
        assert_eq!(*fixture.calls.signed.lock().unwrap(), artifacts);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_artifacts_are_tested_twice() {
        let fixture = Fixture::new();
        let report = fixture.start(&["a.png", "a.png"]).finished().await.unwrap();
        assert_eq!(report.results, BTreeMap::from([(0, true), (1, true)]));
    }

    #[tokio::test(start_paused = true)]
    async fn sign_failure_skips_the_viewer() {
        let mut fixture = Fixture::new();
        fixture.sign_failing.insert("bad.png");
        let report = fixture
            .start(&["bad.png", "good.png"])
            .finished()
            .await
            .unwrap();

        assert_eq!(report.results, BTreeMap::from([(0, false), (1, true)]));
        assert_eq!(*fixture.calls.displayed.lock().unwrap(), ["good.png"]);
    }

    #[tokio::test(start_paused = true)]
    async fn view_failure_is_recorded_as_failed() {
        let mut fixture = Fixture::new();
        fixture.view_failing.insert("a.png");
        let report = fixture.start(&["a.png"]).finished().await.unwrap();

        assert_eq!(report.results, BTreeMap::from([(0, false)]));
        assert_eq!(*fixture.calls.displayed.lock().unwrap(), ["a.png"]);
    }

    #[tokio::test(start_paused = true)]
    async fn mixed_run_reports_pass_and_fail_counts() {
        let mut fixture = Fixture::new();
        fixture.sign_failing.insert("a.png");
        let handle = fixture.start(&["a.png", "b.png"]);
        let progress = handle.subscribe();
        let report = handle.finished().await.unwrap();

        assert_eq!(report.results, BTreeMap::from([(0, false), (1, true)]));
        assert_eq!((report.passed(), report.failed()), (1, 1));

        let last = progress.borrow().clone();
        assert!(last.is_done());
        assert_eq!(last.phase, Phase::Done);
        assert_eq!((last.passed(), last.failed()), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_list_completes_without_calls() {
        let fixture = Fixture::new();
        let handle = fixture.start(&[]);
        let report = handle.finished().await.unwrap();

        assert!(report.results.is_empty());
        assert!(fixture.calls.signed.lock().unwrap().is_empty());
        assert!(fixture.calls.displayed.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_call_is_ever_in_flight() {
        let mut fixture = Fixture::new();
        fixture.sign_failing.insert("c.png");
        fixture.view_failing.insert("d.png");
        fixture.config.show_document_for = Duration::ZERO;
        fixture
            .start(&["a.png", "b.png", "c.png", "d.png"])
            .finished()
            .await
            .unwrap();

        assert_eq!(fixture.calls.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_signer_fails_only_its_artifact() {
        let mut fixture = Fixture::new();
        fixture.sign_panicking.insert("boom.png");
        let report = fixture
            .start(&["boom.png", "fine.png"])
            .finished()
            .await
            .unwrap();

        assert_eq!(report.results, BTreeMap::from([(0, false), (1, true)]));
    }

    #[tokio::test(start_paused = true)]
    async fn display_delay_is_observed_per_outcome() {
        let mut fixture = Fixture::new();
        fixture.sign_failing.insert("sign-fails.png");
        fixture.view_failing.insert("view-fails.png");
        let config = fixture.config;

        for (artifact, expected_hold) in [
            ("ok.png", config.show_document_for),
            ("sign-fails.png", config.show_document_for),
            ("view-fails.png", Duration::ZERO),
        ] {
            let started = Instant::now();
            fixture.start(&[artifact]).finished().await.unwrap();
            let elapsed = started.elapsed();

            // Fake calls take 10ms to sign and 5ms to display.
            assert!(elapsed >= expected_hold, "{artifact}: {elapsed:?}");
            assert!(
                elapsed < expected_hold + Duration::from_millis(50),
                "{artifact}: {elapsed:?}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn results_pause_precedes_each_signing() {
        let mut fixture = Fixture::new();
        fixture.config = RunnerConfig {
            show_document_for: Duration::ZERO,
            show_results_for: Duration::from_millis(500),
        };

        let started = Instant::now();
        fixture.start(&["a.png", "b.png"]).finished().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(1000));
    }

    #[test]
    fn progress_counts_derive_from_results() {
        let progress = Progress {
            total: 3,
            cursor: Some(1),
            phase: Phase::Signing,
            results: BTreeMap::from([(0, true), (1, false)]),
        };
        assert_eq!((progress.passed(), progress.failed()), (1, 1));
        assert!(!progress.is_done());
    }
}
