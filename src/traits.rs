use std::time::Duration;

use async_trait::async_trait;

use crate::error::ScraperError;
use crate::page::Snapshot;

/// ブラウザページの操作
///
/// 各操作は呼び出し側から見てブロッキング（完了・タイムアウトまで待つ）。
#[async_trait]
pub trait PageClient: Send {
    /// URLを開き、読み込み完了まで待機
    async fn open(&mut self, url: &str) -> Result<(), ScraperError>;

    /// 要素のテキスト。要素がなければ `None`（エラーではない）
    async fn read(&mut self, selector: &str) -> Result<Option<String>, ScraperError>;

    /// 要素が存在するか
    async fn exists(&mut self, selector: &str) -> Result<bool, ScraperError> {
        Ok(self.read(selector).await?.is_some())
    }

    /// 入力欄に値を入れる（非表示・無効なら `ElementNotInteractable`）
    async fn fill(&mut self, selector: &str, value: &str) -> Result<(), ScraperError>;

    /// クリック（非表示・無効なら `ElementNotInteractable`）
    async fn click(&mut self, selector: &str) -> Result<(), ScraperError>;

    /// ネットワーク・DOMが落ち着くまで待機
    async fn wait_for_settled(&mut self, timeout: Duration) -> Result<(), ScraperError>;

    /// 描画済みHTML
    async fn content(&mut self) -> Result<String, ScraperError>;

    async fn current_url(&mut self) -> Result<String, ScraperError>;

    /// デバッグ用スクリーンショット（PNG）
    async fn screenshot(&mut self) -> Result<Vec<u8>, ScraperError> {
        Ok(Vec::new())
    }

    /// リソース解放
    async fn close(&mut self) -> Result<(), ScraperError>;

    /// 現在のページを抽出用に固定する
    async fn snapshot(&mut self) -> Result<Snapshot, ScraperError> {
        let url = self.current_url().await?;
        let html = self.content().await?;
        Ok(Snapshot::new(url, html))
    }
}

/// 独立したブラウザセッションを起動する
#[async_trait]
pub trait Launcher: Send + Sync {
    type Page: PageClient + 'static;

    /// `index` はセッション番号（並列実行時の識別用）
    async fn launch(&self, index: usize) -> Result<Self::Page, ScraperError>;
}
