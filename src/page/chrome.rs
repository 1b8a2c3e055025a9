//! chromiumoxide によるページ操作

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::ScraperConfig;
use crate::error::ScraperError;
use crate::traits::{Launcher, PageClient};

/// ネットワークアイドル判定のインターバル（ミリ秒）
const NETWORK_IDLE_CHECK_INTERVAL_MS: u64 = 500;
/// DOM安定判定のインターバル（ミリ秒）
const PAGE_STABLE_CHECK_INTERVAL_MS: u64 = 300;
/// 連続でこの回数アイドル／同一長ならOK
const REQUIRED_QUIET_CHECKS: u32 = 3;

/// JS文字列リテラルに変換
fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

/// 要素の操作可否を判定し、可能なら `action` を実行するスクリプト
///
/// 戻り値: "missing" | "blocked" | "ok"
fn interact_script(selector: &str, action: &str) -> String {
    format!(
        r#"
        (() => {{
            const el = document.querySelector({sel});
            if (!el) return 'missing';
            const style = window.getComputedStyle(el);
            if (el.disabled || el.readOnly || el.offsetParent === null ||
                style.visibility === 'hidden' || style.display === 'none') {{
                return 'blocked';
            }}
            el.scrollIntoView({{ block: 'center' }});
            {action}
            return 'ok';
        }})()
        "#,
        sel = js_string(selector),
        action = action,
    )
}

/// 1ブラウザ＝1セッション
pub struct ChromeSession {
    browser: Option<Browser>,
    page: Option<Page>,
    handler_task: Option<JoinHandle<()>>,
    user_data_dir: PathBuf,
    navigation_timeout: Duration,
}

impl ChromeSession {
    /// ブラウザを起動して空ページを開く
    pub async fn launch(config: &ScraperConfig, index: usize) -> Result<Self, ScraperError> {
        info!("Launching browser session #{}...", index);

        // セッションごとに独立したユーザーデータディレクトリ
        let unique_id = format!(
            "{}-{}-{}",
            std::process::id(),
            index,
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        );
        let user_data_dir = std::env::temp_dir().join(format!("term-plan-scraper-{}", unique_id));

        let chrome_path = config.chrome_path.clone().unwrap_or_else(|| {
            std::env::var("CHROME_PATH")
                .or_else(|_| std::env::var("CHROMIUM_PATH"))
                .unwrap_or_else(|_| "chromium".to_string())
                .into()
        });

        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .user_data_dir(&user_data_dir)
            .window_size(1366, 768);

        if !config.headless {
            builder = builder.with_head();
        }

        builder = builder
            .no_sandbox()
            .request_timeout(config.navigation_timeout)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu");

        if config.debug {
            builder = builder.arg("--enable-logging=stderr").arg("--v=1");
        }

        let browser_config = builder.build().map_err(ScraperError::BrowserInit)?;

        let (mut browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| ScraperError::BrowserInit(e.to_string()))?;

        // ブラウザイベントハンドラをバックグラウンドで実行
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser event error: {:?}", e);
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                let _ = browser.close().await;
                handler_task.abort();
                let _ = std::fs::remove_dir_all(&user_data_dir);
                return Err(ScraperError::BrowserInit(e.to_string()));
            }
        };

        info!("Browser session #{} ready", index);
        Ok(Self {
            browser: Some(browser),
            page: Some(page),
            handler_task: Some(handler_task),
            user_data_dir,
            navigation_timeout: config.navigation_timeout,
        })
    }

    fn page(&self) -> Result<&Page, ScraperError> {
        self.page
            .as_ref()
            .ok_or_else(|| ScraperError::BrowserInit("ブラウザが初期化されていません".into()))
    }

    async fn eval<T: serde::de::DeserializeOwned>(&self, script: &str) -> Result<T, ScraperError> {
        self.page()?
            .evaluate(script)
            .await
            .map_err(|e| ScraperError::JavaScript(e.to_string()))?
            .into_value::<T>()
            .map_err(|e| ScraperError::JavaScript(e.to_string()))
    }

    /// document.readyState が complete になるまで待機
    async fn wait_ready_state(&self, deadline: Instant) -> Result<(), ScraperError> {
        loop {
            let state: String = self.eval("document.readyState").await?;
            if state == "complete" {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ScraperError::Timeout(format!("readyState={}", state)));
            }
            sleep(Duration::from_millis(NETWORK_IDLE_CHECK_INTERVAL_MS)).await;
        }
    }

    /// ネットワークリクエストがアイドル状態になるまで待機
    async fn wait_request_idle(&self, deadline: Instant) -> Result<(), ScraperError> {
        let start = Instant::now();
        let mut idle_count = 0;

        while Instant::now() < deadline {
            // 直近500ms以内に開始され未完了のリソースがないか
            let result = self
                .eval::<bool>(
                    r#"
                    (() => {
                        const entries = performance.getEntriesByType('resource');
                        const now = performance.now();
                        const recent = entries.filter(e => (now - e.startTime) < 500 && e.duration === 0);
                        return recent.length === 0 && !(window.__pendingRequests > 0);
                    })()
                    "#,
                )
                .await;

            match result {
                Ok(true) => {
                    idle_count += 1;
                    if idle_count >= REQUIRED_QUIET_CHECKS {
                        debug!("Network idle after {:?}", start.elapsed());
                        return Ok(());
                    }
                }
                Ok(false) => idle_count = 0,
                Err(e) => {
                    debug!("Network idle check error: {}", e);
                    idle_count = 0;
                }
            }

            sleep(Duration::from_millis(NETWORK_IDLE_CHECK_INTERVAL_MS)).await;
        }

        Err(ScraperError::Timeout(format!(
            "network not idle after {:?}",
            start.elapsed()
        )))
    }

    /// HTML長が変化しなくなるまで待機
    async fn wait_stable(&self, deadline: Instant) -> Result<(), ScraperError> {
        let start = Instant::now();
        let mut last_html_len: Option<usize> = None;
        let mut stable_count = 0;

        while Instant::now() < deadline {
            match self
                .eval::<usize>("document.documentElement.outerHTML.length")
                .await
            {
                Ok(current_len) => {
                    match last_html_len {
                        Some(last) if last == current_len => {
                            stable_count += 1;
                            if stable_count >= REQUIRED_QUIET_CHECKS {
                                debug!("Page stable after {:?}", start.elapsed());
                                return Ok(());
                            }
                        }
                        _ => stable_count = 0,
                    }
                    last_html_len = Some(current_len);
                }
                Err(e) => {
                    debug!("Page stable check error: {}", e);
                    stable_count = 0;
                }
            }

            sleep(Duration::from_millis(PAGE_STABLE_CHECK_INTERVAL_MS)).await;
        }

        Err(ScraperError::Timeout(format!(
            "page not stable after {:?}",
            start.elapsed()
        )))
    }

    fn interaction_result(status: &str, selector: &str) -> Result<(), ScraperError> {
        match status {
            "ok" => Ok(()),
            "blocked" => Err(ScraperError::ElementNotInteractable(selector.to_string())),
            _ => Err(ScraperError::ElementNotFound(selector.to_string())),
        }
    }
}

#[async_trait]
impl PageClient for ChromeSession {
    async fn open(&mut self, url: &str) -> Result<(), ScraperError> {
        debug!("Navigating to {}", url);
        let page = self.page()?;

        timeout(self.navigation_timeout, page.goto(url))
            .await
            .map_err(|_| ScraperError::Navigation(format!("{}: goto timed out", url)))?
            .map_err(|e| ScraperError::Navigation(format!("{}: {}", url, e)))?;

        let deadline = Instant::now() + self.navigation_timeout;
        self.wait_ready_state(deadline)
            .await
            .map_err(|e| ScraperError::Navigation(format!("{}: {}", url, e)))
    }

    async fn read(&mut self, selector: &str) -> Result<Option<String>, ScraperError> {
        // null はCDPの戻り値で値なし扱いになるのでオブジェクトで返す
        let script = format!(
            "(() => {{ const el = document.querySelector({}); return {{ found: !!el, text: el ? (el.innerText || el.textContent || '') : '' }}; }})()",
            js_string(selector)
        );
        let result: serde_json::Value = self.eval(&script).await?;
        if !result["found"].as_bool().unwrap_or(false) {
            return Ok(None);
        }
        Ok(Some(result["text"].as_str().unwrap_or_default().to_string()))
    }

    async fn exists(&mut self, selector: &str) -> Result<bool, ScraperError> {
        let script = format!("document.querySelector({}) !== null", js_string(selector));
        self.eval::<bool>(&script).await
    }

    async fn fill(&mut self, selector: &str, value: &str) -> Result<(), ScraperError> {
        // ネイティブsetterで値を入れ、input/change を発火
        let action = format!(
            r#"
            el.focus();
            const setter = Object.getOwnPropertyDescriptor(Object.getPrototypeOf(el), 'value');
            if (setter && setter.set) {{ setter.set.call(el, {value}); }} else {{ el.value = {value}; }}
            el.dispatchEvent(new Event('input', {{ bubbles: true }}));
            el.dispatchEvent(new Event('change', {{ bubbles: true }}));
            el.blur();
            "#,
            value = js_string(value)
        );
        let status: String = self.eval(&interact_script(selector, &action)).await?;
        Self::interaction_result(&status, selector)
    }

    async fn click(&mut self, selector: &str) -> Result<(), ScraperError> {
        let status: String = self.eval(&interact_script(selector, "")).await?;
        Self::interaction_result(&status, selector)?;

        // 通常クリック → 失敗したらJSクリック
        let page = self.page()?;
        let native = match page.find_element(selector).await {
            Ok(element) => element.click().await.map(|_| ()),
            Err(e) => Err(e),
        };

        if let Err(e) = native {
            debug!("Native click on '{}' failed, falling back to JS: {}", selector, e);
            let script = format!(
                "(() => {{ const el = document.querySelector({}); if (!el) return false; el.click(); return true; }})()",
                js_string(selector)
            );
            let clicked: bool = self.eval(&script).await?;
            if !clicked {
                return Err(ScraperError::ElementNotInteractable(selector.to_string()));
            }
        }
        Ok(())
    }

    async fn wait_for_settled(&mut self, timeout: Duration) -> Result<(), ScraperError> {
        let deadline = Instant::now() + timeout;
        self.wait_request_idle(deadline).await?;
        self.wait_stable(deadline).await
    }

    async fn content(&mut self) -> Result<String, ScraperError> {
        self.page()?
            .content()
            .await
            .map_err(|e| ScraperError::JavaScript(e.to_string()))
    }

    async fn current_url(&mut self) -> Result<String, ScraperError> {
        Ok(self
            .page()?
            .url()
            .await
            .map_err(|e| ScraperError::JavaScript(e.to_string()))?
            .unwrap_or_default())
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, ScraperError> {
        self.page()?
            .screenshot(ScreenshotParams::builder().full_page(true).build())
            .await
            .map_err(|e| ScraperError::JavaScript(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), ScraperError> {
        info!("Closing browser session...");

        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                debug!("Failed to close page: {}", e);
            }
        }

        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                warn!("Failed to close browser: {}", e);
            }
            if let Err(e) = browser.wait().await {
                debug!("Failed to wait for browser exit: {}", e);
            }
        }

        if let Some(task) = self.handler_task.take() {
            task.abort();
        }

        if let Err(e) = std::fs::remove_dir_all(&self.user_data_dir) {
            debug!("Failed to remove user data dir {:?}: {}", self.user_data_dir, e);
        }

        info!("Browser session closed");
        Ok(())
    }
}

/// 設定に従って ChromeSession を起動する
#[derive(Debug, Clone)]
pub struct ChromeLauncher {
    config: ScraperConfig,
}

impl ChromeLauncher {
    pub fn new(config: ScraperConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Launcher for ChromeLauncher {
    type Page = ChromeSession;

    async fn launch(&self, index: usize) -> Result<ChromeSession, ScraperError> {
        ChromeSession::launch(&self.config, index).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_js_string_escapes_quotes() {
        assert_eq!(js_string("label[for='75']"), "\"label[for='75']\"");
        assert_eq!(js_string("a[href*=\"-plan\"]"), "\"a[href*=\\\"-plan\\\"]\"");
    }

    #[test]
    fn test_interaction_result_mapping() {
        assert!(ChromeSession::interaction_result("ok", "#age").is_ok());
        assert!(matches!(
            ChromeSession::interaction_result("blocked", "#age"),
            Err(ScraperError::ElementNotInteractable(_))
        ));
        assert!(matches!(
            ChromeSession::interaction_result("missing", "#age"),
            Err(ScraperError::ElementNotFound(_))
        ));
    }

    #[tokio::test]
    #[ignore] // 実ブラウザが必要: cargo test chrome_session_smoke -- --ignored --nocapture
    async fn chrome_session_smoke() {
        let config = ScraperConfig::default();
        let mut session = ChromeSession::launch(&config, 0)
            .await
            .expect("Failed to launch browser");

        session.open("https://example.com").await.expect("open");
        let heading = session.read("h1").await.expect("read");
        assert!(heading.is_some());
        assert_eq!(session.read("#does-not-exist").await.unwrap(), None);

        session.close().await.unwrap();
    }
}
