//! ページ操作の共通処理
//!
//! - `Snapshot`: 抽出用に固定した描画済みDOM
//! - `wait_for_any`: 複数マーカーのいずれかが出るまでポーリング
//! - `open_with_retries`: 読み込み失敗時の再試行

mod chrome;
#[cfg(test)]
pub(crate) mod mock;

pub use chrome::{ChromeLauncher, ChromeSession};

use std::time::Duration;

use scraper::{ElementRef, Html, Selector};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::error::ScraperError;
use crate::traits::PageClient;

/// 描画済みページの写し
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub url: String,
    pub html: String,
}

impl Snapshot {
    pub fn new(url: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            html: html.into(),
        }
    }

    /// HTMLを解析する（`Html` は Send ではないので await をまたいで保持しないこと）
    pub fn document(&self) -> Html {
        Html::parse_document(&self.html)
    }
}

/// CSSセレクタを解析
pub fn parse_selector(selector: &str) -> Result<Selector, ScraperError> {
    Selector::parse(selector)
        .map_err(|e| ScraperError::Layout(format!("セレクタ '{}': {}", selector, e)))
}

/// 要素の表示テキスト（テキストノードごとに改行で連結）
pub fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// いずれかのセレクタが現れるまで待機
///
/// 現れたセレクタの添字を返す。期限切れなら `None`。
pub async fn wait_for_any<P: PageClient + ?Sized>(
    page: &mut P,
    selectors: &[&str],
    timeout: Duration,
    poll_interval: Duration,
) -> Result<Option<usize>, ScraperError> {
    let start = Instant::now();

    loop {
        for (i, selector) in selectors.iter().enumerate() {
            if page.exists(selector).await? {
                debug!("'{}' appeared after {:?}", selector, start.elapsed());
                return Ok(Some(i));
            }
        }

        if start.elapsed() >= timeout {
            return Ok(None);
        }
        sleep(poll_interval).await;
    }
}

/// リトライ付きでURLを開く（一定間隔）
pub async fn open_with_retries<P: PageClient + ?Sized>(
    page: &mut P,
    url: &str,
    attempts: u32,
    delay: Duration,
) -> Result<(), ScraperError> {
    let attempts = attempts.max(1);
    let mut last_error = None;

    for attempt in 0..attempts {
        match page.open(url).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() => {
                warn!(
                    "Navigation attempt {}/{} failed for {}: {}",
                    attempt + 1,
                    attempts,
                    url,
                    e
                );
                if attempt + 1 < attempts {
                    sleep(delay).await;
                }
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error
        .unwrap_or_else(|| ScraperError::Navigation(format!("{}: max retries exceeded", url))))
}
