//! テスト用のインメモリサイト
//!
//! 静的HTMLをURLごとに持ち、クリックでHTMLを差し替えることで
//! 送信→見積表示／バリデーションエラー等の遷移を再現する。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use scraper::{ElementRef, Html};

use super::{element_text, parse_selector};
use crate::error::ScraperError;
use crate::traits::{Launcher, PageClient};

#[derive(Debug, Clone)]
struct Transition {
    /// 表示中のHTMLにこの要素があるときだけ有効
    when: Option<String>,
    selector: String,
    html: String,
}

#[derive(Debug, Clone, Default)]
struct MockDocument {
    html: String,
    transitions: Vec<Transition>,
}

#[derive(Debug, Default)]
pub(crate) struct MockSite {
    documents: HashMap<String, MockDocument>,
    open_failures: Mutex<HashMap<String, usize>>,
    fill_failures: Mutex<HashMap<String, usize>>,
    pub(crate) opened: Mutex<Vec<String>>,
    pub(crate) filled: Mutex<Vec<(String, String)>>,
    pub(crate) launched: AtomicUsize,
    pub(crate) closed: AtomicUsize,
}

impl MockSite {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn page(mut self, url: &str, html: &str) -> Self {
        self.documents.entry(url.to_string()).or_default().html = html.to_string();
        self
    }

    /// `url` 上で `selector` をクリックすると `html` に切り替わる
    pub(crate) fn on_click(self, url: &str, selector: &str, html: &str) -> Self {
        self.add_transition(url, None, selector, html)
    }

    /// `on_click` と同じだが、表示中のHTMLに `when` があるときだけ
    pub(crate) fn on_click_when(self, url: &str, when: &str, selector: &str, html: &str) -> Self {
        self.add_transition(url, Some(when), selector, html)
    }

    fn add_transition(mut self, url: &str, when: Option<&str>, selector: &str, html: &str) -> Self {
        self.documents
            .entry(url.to_string())
            .or_default()
            .transitions
            .push(Transition {
                when: when.map(str::to_string),
                selector: selector.to_string(),
                html: html.to_string(),
            });
        self
    }

    /// 最初の `times` 回の open を失敗させる
    pub(crate) fn failing_open(self, url: &str, times: usize) -> Self {
        self.open_failures
            .lock()
            .unwrap()
            .insert(url.to_string(), times);
        self
    }

    /// 最初の `times` 回の fill を ElementNotInteractable にする
    pub(crate) fn flaky_fill(self, selector: &str, times: usize) -> Self {
        self.fill_failures
            .lock()
            .unwrap()
            .insert(selector.to_string(), times);
        self
    }

    pub(crate) fn opened_urls(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }

    fn consume_failure(map: &Mutex<HashMap<String, usize>>, key: &str) -> bool {
        let mut map = map.lock().unwrap();
        match map.get_mut(key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

pub(crate) struct MockPage {
    site: Arc<MockSite>,
    url: String,
    html: String,
}

impl MockPage {
    pub(crate) fn new(site: Arc<MockSite>) -> Self {
        Self {
            site,
            url: "about:blank".to_string(),
            html: String::new(),
        }
    }

    fn with_element<T>(
        &self,
        selector: &str,
        f: impl FnOnce(Option<ElementRef<'_>>) -> T,
    ) -> Result<T, ScraperError> {
        let sel = parse_selector(selector)?;
        let doc = Html::parse_document(&self.html);
        let element = doc.select(&sel).next();
        Ok(f(element))
    }

    /// missing / blocked / ok
    fn check_interactable(&self, selector: &str) -> Result<(), ScraperError> {
        let state = self.with_element(selector, |el| {
            el.map(|el| {
                let attrs = el.value();
                let style = attrs.attr("style").unwrap_or_default().replace(' ', "");
                attrs.attr("disabled").is_some()
                    || attrs.attr("hidden").is_some()
                    || attrs.attr("readonly").is_some()
                    || style.contains("display:none")
            })
        })?;

        match state {
            None => Err(ScraperError::ElementNotFound(selector.to_string())),
            Some(true) => Err(ScraperError::ElementNotInteractable(selector.to_string())),
            Some(false) => Ok(()),
        }
    }
}

#[async_trait]
impl PageClient for MockPage {
    async fn open(&mut self, url: &str) -> Result<(), ScraperError> {
        self.site.opened.lock().unwrap().push(url.to_string());

        if MockSite::consume_failure(&self.site.open_failures, url) {
            return Err(ScraperError::Navigation(format!("{}: net::ERR_CONNECTION_RESET", url)));
        }

        let doc = self
            .site
            .documents
            .get(url)
            .ok_or_else(|| ScraperError::Navigation(format!("{}: 404", url)))?;

        self.url = url.to_string();
        self.html = doc.html.clone();
        Ok(())
    }

    async fn read(&mut self, selector: &str) -> Result<Option<String>, ScraperError> {
        self.with_element(selector, |el| el.map(element_text))
    }

    async fn fill(&mut self, selector: &str, value: &str) -> Result<(), ScraperError> {
        self.check_interactable(selector)?;
        if MockSite::consume_failure(&self.site.fill_failures, selector) {
            return Err(ScraperError::ElementNotInteractable(selector.to_string()));
        }
        self.site
            .filled
            .lock()
            .unwrap()
            .push((selector.to_string(), value.to_string()));
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> Result<(), ScraperError> {
        self.check_interactable(selector)?;

        let mut next = None;
        if let Some(doc) = self.site.documents.get(&self.url) {
            for transition in doc.transitions.iter().filter(|t| t.selector == selector) {
                let applies = match &transition.when {
                    Some(when) => self.with_element(when, |el| el.is_some())?,
                    None => true,
                };
                if applies {
                    next = Some(transition.html.clone());
                    break;
                }
            }
        }
        if let Some(html) = next {
            self.html = html;
        }
        Ok(())
    }

    async fn wait_for_settled(&mut self, _timeout: Duration) -> Result<(), ScraperError> {
        Ok(())
    }

    async fn content(&mut self) -> Result<String, ScraperError> {
        Ok(self.html.clone())
    }

    async fn current_url(&mut self) -> Result<String, ScraperError> {
        Ok(self.url.clone())
    }

    async fn close(&mut self) -> Result<(), ScraperError> {
        self.site.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone)]
pub(crate) struct MockLauncher {
    pub(crate) site: Arc<MockSite>,
}

impl MockLauncher {
    pub(crate) fn new(site: MockSite) -> Self {
        Self {
            site: Arc::new(site),
        }
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    type Page = MockPage;

    async fn launch(&self, _index: usize) -> Result<MockPage, ScraperError> {
        self.site.launched.fetch_add(1, Ordering::SeqCst);
        Ok(MockPage::new(self.site.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://mock.test/form";

    fn site() -> MockSite {
        MockSite::new()
            .page(
                URL,
                r#"<form><input name="age"><input name="pin" disabled><button id="go">Go</button></form>"#,
            )
            .on_click(URL, "button#go", "<div class='done'>Done</div>")
    }

    #[tokio::test]
    async fn test_read_absent_is_not_error() {
        let mut page = MockPage::new(Arc::new(site()));
        page.open(URL).await.unwrap();
        assert_eq!(page.read("#missing").await.unwrap(), None);
        assert_eq!(page.read("button#go").await.unwrap().as_deref(), Some("Go"));
    }

    #[tokio::test]
    async fn test_disabled_input_not_interactable() {
        let mut page = MockPage::new(Arc::new(site()));
        page.open(URL).await.unwrap();
        assert!(page.fill("input[name='age']", "30").await.is_ok());
        assert!(matches!(
            page.fill("input[name='pin']", "110001").await,
            Err(ScraperError::ElementNotInteractable(_))
        ));
    }

    #[tokio::test]
    async fn test_click_transition() {
        let mut page = MockPage::new(Arc::new(site()));
        page.open(URL).await.unwrap();
        page.click("button#go").await.unwrap();
        assert!(page.exists("div.done").await.unwrap());
        assert!(!page.exists("form").await.unwrap());
    }

    #[tokio::test]
    async fn test_conditional_transition() {
        let site = MockSite::new()
            .page(URL, "<div class='one'><button id='go'>Next</button></div>")
            .on_click_when(URL, "div.two", "button#go", "<div class='three'>Done</div>")
            .on_click_when(
                URL,
                "div.one",
                "button#go",
                "<div class='two'><button id='go'>Next</button></div>",
            );
        let mut page = MockPage::new(Arc::new(site));
        page.open(URL).await.unwrap();

        page.click("button#go").await.unwrap();
        assert!(page.exists("div.two").await.unwrap());
        page.click("button#go").await.unwrap();
        assert!(page.exists("div.three").await.unwrap());
    }
}
