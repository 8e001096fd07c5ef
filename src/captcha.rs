//! CapSolver integration for automatic challenge solving.
//! Supports: Cloudflare Turnstile, reCAPTCHA v2, hCaptcha.
//!
//! Runs best-effort between agent steps — a detection or solve failure
//! never fails the step that triggered it.

use std::time::Duration;

use eoka::Page;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{Error, Result};

const CREATE_TASK_URL: &str = "https://api.capsolver.com/createTask";
const GET_RESULT_URL: &str = "https://api.capsolver.com/getTaskResult";

/// A challenge detected on the current page.
#[derive(Debug, Clone, PartialEq)]
pub enum Challenge {
    Turnstile { sitekey: String },
    RecaptchaV2 { sitekey: String },
    Hcaptcha { sitekey: String },
}

impl Challenge {
    fn kind(&self) -> &'static str {
        match self {
            Challenge::Turnstile { .. } => "turnstile",
            Challenge::RecaptchaV2 { .. } => "recaptcha_v2",
            Challenge::Hcaptcha { .. } => "hcaptcha",
        }
    }
}

#[derive(Serialize)]
struct CreateTaskRequest<'a> {
    #[serde(rename = "clientKey")]
    client_key: &'a str,
    task: CaptchaTask,
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum CaptchaTask {
    #[serde(rename = "AntiTurnstileTaskProxyLess")]
    Turnstile {
        #[serde(rename = "websiteURL")]
        website_url: String,
        #[serde(rename = "websiteKey")]
        website_key: String,
    },
    #[serde(rename = "ReCaptchaV2TaskProxyLess")]
    RecaptchaV2 {
        #[serde(rename = "websiteURL")]
        website_url: String,
        #[serde(rename = "websiteKey")]
        website_key: String,
    },
    #[serde(rename = "HCaptchaTaskProxyLess")]
    Hcaptcha {
        #[serde(rename = "websiteURL")]
        website_url: String,
        #[serde(rename = "websiteKey")]
        website_key: String,
    },
}

#[derive(Deserialize)]
struct CreateTaskResponse {
    #[serde(rename = "errorId")]
    error_id: u32,
    #[serde(rename = "errorDescription")]
    error_description: Option<String>,
    #[serde(rename = "taskId")]
    task_id: Option<String>,
}

#[derive(Serialize)]
struct GetResultRequest<'a> {
    #[serde(rename = "clientKey")]
    client_key: &'a str,
    #[serde(rename = "taskId")]
    task_id: &'a str,
}

#[derive(Deserialize)]
struct GetResultResponse {
    #[serde(rename = "errorId")]
    error_id: u32,
    status: Option<String>,
    solution: Option<Solution>,
}

#[derive(Deserialize)]
struct Solution {
    token: Option<String>,
    #[serde(rename = "gRecaptchaResponse")]
    g_recaptcha_response: Option<String>,
}

/// Sniffs the page for a challenge widget and returns its kind and sitekey.
const DETECT_JS: &str = r#"
(() => {
    const html = document.documentElement.outerHTML;
    const keyEl = document.querySelector('[data-sitekey]');
    const sitekey = keyEl ? keyEl.getAttribute('data-sitekey') : null;

    for (const f of document.querySelectorAll('iframe')) {
        const src = f.src || '';
        if (src.includes('challenges.cloudflare.com') || src.toLowerCase().includes('turnstile')) {
            const m = src.match(/[?&]k=([^&]+)/);
            return JSON.stringify({ kind: 'turnstile', sitekey: m ? m[1] : sitekey });
        }
        if (src.includes('recaptcha') && src.includes('anchor')) {
            const m = src.match(/[?&]k=([^&]+)/);
            return JSON.stringify({ kind: 'recaptcha_v2', sitekey: m ? m[1] : sitekey });
        }
    }
    if (sitekey && (html.includes('cf-turnstile') || html.toLowerCase().includes('turnstile'))) {
        return JSON.stringify({ kind: 'turnstile', sitekey });
    }
    if (sitekey && html.toLowerCase().includes('hcaptcha')) {
        return JSON.stringify({ kind: 'hcaptcha', sitekey });
    }
    if (sitekey && sitekey.startsWith('6L')) {
        return JSON.stringify({ kind: 'recaptcha_v2', sitekey });
    }
    return 'null';
})()
"#;

/// CapSolver client.
pub struct Solver {
    client: reqwest::Client,
    api_key: String,
}

impl Solver {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }

    /// Detect a challenge widget on the page.
    pub async fn detect(page: &Page) -> Option<Challenge> {
        let raw: String = page.evaluate(DETECT_JS).await.ok()?;
        let value: serde_json::Value = serde_json::from_str(&raw).ok()?;
        let sitekey = value["sitekey"].as_str()?.to_string();
        match value["kind"].as_str()? {
            "turnstile" => Some(Challenge::Turnstile { sitekey }),
            "recaptcha_v2" => Some(Challenge::RecaptchaV2 { sitekey }),
            "hcaptcha" => Some(Challenge::Hcaptcha { sitekey }),
            _ => None,
        }
    }

    /// Solve a challenge, returning the token to inject.
    pub async fn solve(&self, challenge: &Challenge, page_url: &str) -> Result<String> {
        let task = match challenge {
            Challenge::Turnstile { sitekey } => CaptchaTask::Turnstile {
                website_url: page_url.to_string(),
                website_key: sitekey.clone(),
            },
            Challenge::RecaptchaV2 { sitekey } => CaptchaTask::RecaptchaV2 {
                website_url: page_url.to_string(),
                website_key: sitekey.clone(),
            },
            Challenge::Hcaptcha { sitekey } => CaptchaTask::Hcaptcha {
                website_url: page_url.to_string(),
                website_key: sitekey.clone(),
            },
        };

        let create: CreateTaskResponse = self
            .client
            .post(CREATE_TASK_URL)
            .json(&CreateTaskRequest {
                client_key: &self.api_key,
                task,
            })
            .send()
            .await
            .map_err(|e| Error::Action(format!("capsolver request failed: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::Action(format!("capsolver response invalid: {}", e)))?;

        if create.error_id != 0 {
            return Err(Error::Action(format!(
                "capsolver rejected task: {}",
                create.error_description.unwrap_or_default()
            )));
        }
        let task_id = create
            .task_id
            .ok_or_else(|| Error::Action("capsolver returned no task id".into()))?;

        // Poll for the solution, bounded at ~2 minutes
        for _ in 0..60 {
            tokio::time::sleep(Duration::from_secs(2)).await;

            let result: GetResultResponse = self
                .client
                .post(GET_RESULT_URL)
                .json(&GetResultRequest {
                    client_key: &self.api_key,
                    task_id: &task_id,
                })
                .send()
                .await
                .map_err(|e| Error::Action(format!("capsolver poll failed: {}", e)))?
                .json()
                .await
                .map_err(|e| Error::Action(format!("capsolver poll invalid: {}", e)))?;

            if result.error_id != 0 {
                return Err(Error::Action("capsolver task errored".into()));
            }
            match result.status.as_deref() {
                Some("ready") => {
                    let solution = result
                        .solution
                        .ok_or_else(|| Error::Action("capsolver ready without solution".into()))?;
                    return solution
                        .token
                        .or(solution.g_recaptcha_response)
                        .ok_or_else(|| Error::Action("capsolver solution empty".into()));
                }
                Some("failed") => return Err(Error::Action("capsolver task failed".into())),
                _ => continue,
            }
        }
        Err(Error::Action("capsolver timed out".into()))
    }

    /// Inject a solved token into the page's response fields and fire the
    /// widget callback if one is registered.
    pub async fn inject(page: &Page, challenge: &Challenge, token: &str) -> Result<()> {
        let token_json = serde_json::to_string(token).unwrap();
        let js = match challenge {
            Challenge::Turnstile { .. } => format!(
                r#"((t) => {{
                    document.querySelectorAll('input[name*="cf-turnstile-response"],input[name*="turnstile"]')
                        .forEach(el => {{ el.value = t; el.dispatchEvent(new Event('change', {{bubbles: true}})); }});
                    const el = document.querySelector('.cf-turnstile,[data-sitekey]');
                    if (el) {{ const cb = el.getAttribute('data-callback'); if (cb && window[cb]) try {{ window[cb](t); }} catch(e) {{}} }}
                }})({})"#,
                token_json
            ),
            Challenge::RecaptchaV2 { .. } => format!(
                r#"((t) => {{
                    document.querySelectorAll('[name="g-recaptcha-response"]')
                        .forEach(el => {{ el.innerHTML = t; el.value = t; el.style.display = 'block'; }});
                    document.querySelectorAll('[data-callback]').forEach(el => {{
                        const cb = el.getAttribute('data-callback');
                        if (cb && window[cb]) try {{ window[cb](t); }} catch(e) {{}}
                    }});
                }})({})"#,
                token_json
            ),
            Challenge::Hcaptcha { .. } => format!(
                r#"((t) => {{
                    const ta = document.querySelector('[name="h-captcha-response"]');
                    if (ta) {{ ta.innerHTML = t; ta.value = t; }}
                    document.querySelectorAll('[data-callback]').forEach(el => {{
                        const cb = el.getAttribute('data-callback');
                        if (cb && window[cb]) try {{ window[cb](t); }} catch(e) {{}}
                    }});
                }})({})"#,
                token_json
            ),
        };
        page.execute(&js).await?;
        Ok(())
    }

    /// Detect, solve and inject in one best-effort pass. Returns whether a
    /// challenge was handled.
    pub async fn run(&self, page: &Page) -> bool {
        let Some(challenge) = Self::detect(page).await else {
            return false;
        };
        info!("{} challenge detected, solving", challenge.kind());

        let url = match page.url().await {
            Ok(u) => u,
            Err(e) => {
                debug!("could not read page url for solve: {}", e);
                return false;
            }
        };
        match self.solve(&challenge, &url).await {
            Ok(token) => match Self::inject(page, &challenge, &token).await {
                Ok(()) => {
                    info!("{} token injected", challenge.kind());
                    true
                }
                Err(e) => {
                    warn!("token injection failed: {}", e);
                    false
                }
            },
            Err(e) => {
                warn!("challenge solve failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_serialization_uses_capsolver_names() {
        let req = CreateTaskRequest {
            client_key: "key",
            task: CaptchaTask::Turnstile {
                website_url: "https://example.com".into(),
                website_key: "0x4AAA".into(),
            },
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["clientKey"], "key");
        assert_eq!(json["task"]["type"], "AntiTurnstileTaskProxyLess");
        assert_eq!(json["task"]["websiteURL"], "https://example.com");
        assert_eq!(json["task"]["websiteKey"], "0x4AAA");
    }

    #[test]
    fn test_solution_prefers_token() {
        let raw = r#"{"errorId":0,"status":"ready","solution":{"token":"tok","gRecaptchaResponse":"grc"}}"#;
        let resp: GetResultResponse = serde_json::from_str(raw).unwrap();
        let solution = resp.solution.unwrap();
        assert_eq!(
            solution.token.or(solution.g_recaptcha_response).as_deref(),
            Some("tok")
        );
    }

    #[test]
    fn test_challenge_kind_labels() {
        assert_eq!(Challenge::Turnstile { sitekey: "k".into() }.kind(), "turnstile");
        assert_eq!(Challenge::Hcaptcha { sitekey: "k".into() }.kind(), "hcaptcha");
    }
}
