//! Browser session provisioning and the vehicle a run drives.
//!
//! `Vehicle` and `Provisioner` are traits so the orchestration loop can be
//! exercised with scripted fakes; the real implementations wrap an `eoka`
//! browser with its recording sink armed before the first navigation.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use eoka::{Browser, Page, StealthConfig};
use tracing::{debug, info, warn};

use crate::captcha::Solver;
use crate::config::{BrowserConfig, Config, EngineKind};
use crate::model::{AgentAction, ScrollDirection};
use crate::observe::{self, PageView};
use crate::record::FrameSink;
use crate::{Error, Result};

/// A live browser bound to one run. Exclusively owned by its run's
/// controller; `close` must be called on every exit path.
#[async_trait]
pub trait Vehicle: Send {
    /// Observe the current page state.
    async fn view(&mut self) -> Result<PageView>;

    /// Apply one action, returning a human-readable outcome detail.
    /// Action-level failures come back as `Error::Action` and are
    /// recorded rather than aborting the run.
    async fn apply(&mut self, action: &AgentAction) -> Result<String>;

    /// Release the browser and hand back the recording sink. Always
    /// releases, even if the underlying engine misbehaves on shutdown.
    async fn close(self: Box<Self>) -> FrameSink;
}

/// Acquires one vehicle per run.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn acquire(&self, run_id: &str, engine: EngineKind) -> Result<Box<dyn Vehicle>>;
}

/// Real provisioner: launches an `eoka` browser per run, assigns an exit
/// proxy round-robin from the configured pool (stealth engine only), and
/// arms the frame sink before any navigation.
pub struct EokaProvisioner {
    browser: BrowserConfig,
    frames_root: PathBuf,
    proxy_cursor: AtomicUsize,
    solver: Option<Arc<Solver>>,
}

impl EokaProvisioner {
    pub fn new(config: &Config) -> Result<Self> {
        std::fs::create_dir_all(&config.video.frames_root)?;
        let solver = std::env::var("CAPSOLVER_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .map(|k| Arc::new(Solver::new(k)));
        if solver.is_some() {
            info!("capsolver configured, challenge solving enabled");
        }
        Ok(Self {
            browser: config.browser.clone(),
            frames_root: config.video.frames_root.clone(),
            proxy_cursor: AtomicUsize::new(0),
            solver,
        })
    }

    fn next_proxy(&self) -> Option<String> {
        if self.browser.proxies.is_empty() {
            return None;
        }
        let i = self.proxy_cursor.fetch_add(1, Ordering::Relaxed);
        Some(self.browser.proxies[i % self.browser.proxies.len()].clone())
    }

    async fn launch(&self, engine: EngineKind) -> Result<Browser> {
        match engine {
            EngineKind::Standard => Browser::launch()
                .await
                .map_err(|e| Error::Provision(format!("engine launch failed: {}", e))),
            EngineKind::Stealth => {
                let proxy = self.next_proxy();
                if let Some(ref p) = proxy {
                    debug!("stealth session using proxy {}", p);
                }
                let stealth = StealthConfig {
                    headless: self.browser.headless,
                    proxy,
                    user_agent: self.browser.user_agent.clone(),
                    viewport_width: self.browser.viewport.map(|v| v.width).unwrap_or(1280),
                    viewport_height: self.browser.viewport.map(|v| v.height).unwrap_or(720),
                    ..Default::default()
                };
                Browser::launch_with_config(stealth)
                    .await
                    .map_err(|e| Error::Provision(format!("stealth engine launch failed: {}", e)))
            }
        }
    }
}

#[async_trait]
impl Provisioner for EokaProvisioner {
    async fn acquire(&self, run_id: &str, engine: EngineKind) -> Result<Box<dyn Vehicle>> {
        let browser = self.launch(engine).await?;

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                // don't leak the engine process when page creation fails
                if let Err(close_err) = browser.close().await {
                    warn!("close after failed page open also failed: {}", close_err);
                }
                return Err(Error::Provision(format!("page open failed: {}", e)));
            }
        };

        let mut sink = FrameSink::create(&self.frames_root, run_id)?;
        // frame zero before any navigation
        match page.screenshot().await {
            Ok(png) => {
                if let Err(e) = sink.push(&png) {
                    warn!("initial frame write failed: {}", e);
                }
            }
            Err(e) => warn!("initial frame capture failed: {}", e),
        }

        Ok(Box::new(EokaVehicle {
            browser,
            page,
            elements: Vec::new(),
            sink,
            solver: self.solver.clone(),
        }))
    }
}

/// Vehicle over a live `eoka` page. Caches the last observed element list
/// so index-based actions resolve to selectors; the cache is invalidated
/// by anything that changes the page.
pub struct EokaVehicle {
    browser: Browser,
    page: Page,
    elements: Vec<observe::PageElement>,
    sink: FrameSink,
    solver: Option<Arc<Solver>>,
}

/// Upper bound on a model-requested wait.
const MAX_WAIT_MS: u64 = 10_000;
/// Upper bound on recorded extract output.
const MAX_EXTRACT_LEN: usize = 2_000;

impl EokaVehicle {
    fn selector_for(&self, index: usize) -> Result<String> {
        self.elements
            .get(index)
            .map(|el| el.selector.clone())
            .ok_or_else(|| {
                Error::Action(format!(
                    "element [{}] not in the current observation ({} elements)",
                    index,
                    self.elements.len()
                ))
            })
    }

    /// Best-effort settle after an action. Some sites never stop polling,
    /// so an idle timeout is not an error.
    async fn settle(&self) {
        let _ = self.page.wait_for_network_idle(200, 2000).await;
        self.page.wait(50).await;
    }

    async fn capture_frame(&mut self) {
        match self.page.screenshot().await {
            Ok(png) => {
                if let Err(e) = self.sink.push(&png) {
                    warn!("frame write failed: {}", e);
                }
            }
            Err(e) => debug!("frame capture failed: {}", e),
        }
    }

    async fn run_action(&mut self, action: &AgentAction) -> Result<String> {
        match action {
            AgentAction::Navigate { url } => {
                info!("navigate: {}", url);
                self.elements.clear();
                self.page
                    .goto(url)
                    .await
                    .map_err(|e| Error::Action(format!("navigation to {} failed: {}", url, e)))?;
                self.settle().await;
                let landed = self.page.url().await.unwrap_or_else(|_| url.clone());
                Ok(format!("at {}", landed))
            }
            AgentAction::Click { index } => {
                let selector = self.selector_for(*index)?;
                let label = self.elements[*index].to_string();
                info!("click: {}", label);
                self.page
                    .click(&selector)
                    .await
                    .map_err(|e| Error::Action(format!("click on {} failed: {}", label, e)))?;
                self.settle().await;
                self.elements.clear();
                Ok(format!("clicked {}", label))
            }
            AgentAction::Fill { index, text } => {
                let selector = self.selector_for(*index)?;
                let label = self.elements[*index].to_string();
                info!("fill: {} = \"{}\"", label, text);
                self.page
                    .fill(&selector, text)
                    .await
                    .map_err(|e| Error::Action(format!("fill on {} failed: {}", label, e)))?;
                self.settle().await;
                Ok(format!("filled {} with \"{}\"", label, text))
            }
            AgentAction::Scroll { direction } => {
                debug!("scroll: {:?}", direction);
                let js = match direction {
                    ScrollDirection::Up => "window.scrollBy(0, -window.innerHeight * 0.8)",
                    ScrollDirection::Down => "window.scrollBy(0, window.innerHeight * 0.8)",
                    ScrollDirection::Top => "window.scrollTo(0, 0)",
                    ScrollDirection::Bottom => {
                        "window.scrollTo(0, document.body.scrollHeight)"
                    }
                };
                self.page
                    .execute(js)
                    .await
                    .map_err(|e| Error::Action(format!("scroll failed: {}", e)))?;
                self.page.wait(200).await;
                self.elements.clear();
                Ok("scrolled".into())
            }
            AgentAction::PressKey { key } => {
                debug!("press_key: {}", key);
                self.page
                    .human()
                    .press_key(key)
                    .await
                    .map_err(|e| Error::Action(format!("key press {} failed: {}", key, e)))?;
                self.settle().await;
                self.elements.clear();
                Ok(format!("pressed {}", key))
            }
            AgentAction::Extract { js } => {
                debug!("extract: {}", js);
                let escaped = serde_json::to_string(js).unwrap();
                let wrapped = format!("JSON.stringify(eval({}))", escaped);
                let raw: String = self
                    .page
                    .evaluate(&wrapped)
                    .await
                    .map_err(|e| Error::Action(format!("extract failed: {}", e)))?;
                if raw == "null" || raw == "undefined" || raw.is_empty() {
                    return Err(Error::Action("extract returned nothing".into()));
                }
                // unwrap plain JSON strings so the transcript stays readable
                let mut detail = match serde_json::from_str::<serde_json::Value>(&raw) {
                    Ok(serde_json::Value::String(s)) => s,
                    _ => raw,
                };
                if detail.len() > MAX_EXTRACT_LEN {
                    detail = detail.chars().take(MAX_EXTRACT_LEN).collect();
                    detail.push_str("...[truncated]");
                }
                Ok(detail)
            }
            AgentAction::Wait { ms } => {
                let ms = (*ms).min(MAX_WAIT_MS);
                debug!("wait: {}ms", ms);
                self.page.wait(ms).await;
                Ok(format!("waited {}ms", ms))
            }
            AgentAction::Done { summary } => Ok(summary.clone()),
        }
    }
}

#[async_trait]
impl Vehicle for EokaVehicle {
    async fn view(&mut self) -> Result<PageView> {
        let url = self.page.url().await?;
        let title = self.page.title().await.unwrap_or_default();
        self.elements = observe::enumerate(&self.page, true).await?;
        Ok(PageView {
            url,
            title,
            elements: self.elements.clone(),
        })
    }

    async fn apply(&mut self, action: &AgentAction) -> Result<String> {
        let result = self.run_action(action).await;
        if result.is_ok() {
            if let Some(solver) = self.solver.clone() {
                solver.run(&self.page).await;
            }
        }
        self.capture_frame().await;
        result
    }

    async fn close(self: Box<Self>) -> FrameSink {
        let this = *self;
        if let Err(e) = this.browser.close().await {
            warn!("browser close failed: {}", e);
        }
        this.sink
    }
}
