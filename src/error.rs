use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScraperError {
    #[error("ブラウザ初期化エラー: {0}")]
    BrowserInit(String),

    #[error("ナビゲーションエラー: {0}")]
    Navigation(String),

    #[error("タイムアウト: {0}")]
    Timeout(String),

    #[error("要素が見つかりません: {0}")]
    ElementNotFound(String),

    #[error("要素を操作できません: {0}")]
    ElementNotInteractable(String),

    #[error("値の変換に失敗: {field}: {text:?}")]
    FieldCoercion { field: String, text: String },

    #[error("プラン一覧が空です: {0}")]
    ListingEmpty(String),

    #[error("JavaScript実行エラー: {0}")]
    JavaScript(String),

    #[error("レイアウト定義エラー: {0}")]
    Layout(String),

    #[error("出力エラー: {0}")]
    Sink(String),

    #[error("ファイル操作エラー: {0}")]
    FileIO(#[from] std::io::Error),

    #[error("JSONエラー: {0}")]
    Json(#[from] serde_json::Error),
}

impl ScraperError {
    /// リトライで回復しうるエラーか
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ScraperError::Navigation(_)
                | ScraperError::Timeout(_)
                | ScraperError::ElementNotInteractable(_)
                | ScraperError::JavaScript(_)
        )
    }
}
