//! Deterministic fakes for exercising the run controller and HTTP layer
//! without a real browser or model provider.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use errand::config::EngineKind;
use errand::model::{AgentAction, BackendResolver, ModelBackend};
use errand::observe::{PageElement, PageView};
use errand::record::{Finalizer, FrameSink, VideoArtifact};
use errand::run::Step;
use errand::session::{Provisioner, Vehicle};
use errand::{Error, Result};

/// Acquisition/release balance, checked by the resource-safety tests.
#[derive(Default)]
pub struct Counters {
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
}

impl Counters {
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

/// One scripted model turn.
#[derive(Debug)]
pub enum ScriptTurn {
    Action(AgentAction),
    Error(String),
    /// Never resolves — simulates an in-flight model call when the
    /// wall-clock budget fires.
    Hang,
}

/// Backend that replays a fixed script. Once the script is exhausted it
/// keeps returning a benign `wait`, so step-exhaustion tests run the
/// budget dry.
#[derive(Debug)]
pub struct ScriptedBackend {
    script: Mutex<VecDeque<ScriptTurn>>,
}

impl ScriptedBackend {
    pub fn new(turns: Vec<ScriptTurn>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(turns.into()),
        })
    }

    pub fn actions(actions: Vec<AgentAction>) -> Arc<Self> {
        Self::new(actions.into_iter().map(ScriptTurn::Action).collect())
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn id(&self) -> &str {
        "fake-model"
    }

    async fn next_action(
        &self,
        _task: &str,
        _history: &[Step],
        _view: &PageView,
    ) -> Result<AgentAction> {
        let turn = self.script.lock().unwrap().pop_front();
        match turn {
            Some(ScriptTurn::Action(action)) => Ok(action),
            Some(ScriptTurn::Error(message)) => Err(Error::Backend(message)),
            Some(ScriptTurn::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(Error::Backend("hang elapsed".into()))
            }
            None => Ok(AgentAction::Wait { ms: 1 }),
        }
    }
}

/// Vehicle over a canned example.com page. The single observed element
/// means any `click` above index 0 fails like a stale-element click; the
/// magic extract script `__crash__` simulates a browser-process crash.
pub struct FakeVehicle {
    counters: Arc<Counters>,
    sink: FrameSink,
}

#[async_trait]
impl Vehicle for FakeVehicle {
    async fn view(&mut self) -> Result<PageView> {
        Ok(PageView {
            url: "https://example.com/".into(),
            title: "Example Domain".into(),
            elements: vec![PageElement {
                index: 0,
                tag: "a".into(),
                text: "More information...".into(),
                placeholder: None,
                input_type: None,
                selector: "body > div > p:nth-of-type(2) > a".into(),
            }],
        })
    }

    async fn apply(&mut self, action: &AgentAction) -> Result<String> {
        match action {
            AgentAction::Extract { js } if js == "__crash__" => Err(Error::Browser(
                eoka::Error::CdpSimple("browser process crashed".into()),
            )),
            AgentAction::Extract { .. } => Ok("Example Domain".into()),
            AgentAction::Navigate { url } => Ok(format!("at {}", url)),
            AgentAction::Click { index } if *index > 0 => Err(Error::Action(format!(
                "element [{}] not in the current observation (1 elements)",
                index
            ))),
            AgentAction::Wait { ms } => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
                Ok(format!("waited {}ms", ms))
            }
            other => Ok(other.describe()),
        }
    }

    async fn close(self: Box<Self>) -> FrameSink {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
        self.sink
    }
}

/// Counting provisioner; optionally fails every acquire.
pub struct FakeProvisioner {
    pub counters: Arc<Counters>,
    tmp: Arc<tempfile::TempDir>,
    fail: bool,
}

impl FakeProvisioner {
    pub fn new() -> (Arc<Self>, Arc<Counters>) {
        Self::build(false)
    }

    pub fn failing() -> (Arc<Self>, Arc<Counters>) {
        Self::build(true)
    }

    fn build(fail: bool) -> (Arc<Self>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        (
            Arc::new(Self {
                counters: counters.clone(),
                tmp: Arc::new(tempfile::tempdir().expect("tempdir")),
                fail,
            }),
            counters,
        )
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn acquire(&self, run_id: &str, _engine: EngineKind) -> Result<Box<dyn Vehicle>> {
        if self.fail {
            return Err(Error::Provision("engine launch failed: chrome not found".into()));
        }
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        let sink = FrameSink::create(self.tmp.path(), run_id)?;
        Ok(Box::new(FakeVehicle {
            counters: self.counters.clone(),
            sink,
        }))
    }
}

/// Finalizer that either fabricates an artifact or fails to encode.
pub struct FakeFinalizer {
    fail: bool,
    pub calls: AtomicUsize,
}

impl FakeFinalizer {
    pub fn ok() -> Arc<Self> {
        Arc::new(Self {
            fail: false,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Finalizer for FakeFinalizer {
    async fn finalize(&self, sink: FrameSink) -> Result<VideoArtifact> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::Encoding("simulated encode failure".into()));
        }
        Ok(VideoArtifact {
            path: format!("videos/{}.mp4", sink.run_id()).into(),
            frames: sink.frame_count().max(1),
            duration_secs: 1.0,
        })
    }
}

/// Resolver for handler tests: one known id backed by the script, one id
/// with a missing credential, everything else unknown.
pub struct FakeResolver {
    pub backend: Arc<dyn ModelBackend>,
}

impl BackendResolver for FakeResolver {
    fn default_id(&self) -> &str {
        "fake-model"
    }

    fn resolve(&self, id: &str) -> Result<Arc<dyn ModelBackend>> {
        match id {
            "fake-model" => Ok(self.backend.clone()),
            "needs-key" => Err(Error::MissingCredential {
                model: id.into(),
                var: "FAKE_API_KEY",
            }),
            other => Err(Error::UnknownModel(other.into())),
        }
    }
}
