use std::path::PathBuf;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::layout::SiteLayout;

/// プラン一覧ページ
pub const DEFAULT_LISTING_URL: &str = "https://www.axismaxlife.com/term-insurance-plans";
/// 保険会社名（実行中は固定）
pub const DEFAULT_INSURER: &str = "Axis Max Life Insurance";

/// 性別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    /// フォーム上のコード（gender_M / gender_F）
    pub fn code(&self) -> &'static str {
        match self {
            Gender::Male => "M",
            Gender::Female => "F",
        }
    }
}

/// 見積フォームに入力する申込者プロファイル
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicantProfile {
    pub age: u32,
    pub gender: Gender,
    #[serde(with = "rust_decimal::serde::float")]
    pub annual_income: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub cover_amount: Decimal,
    pub term_years: u32,
    pub smoker: bool,
    /// 見積の後段（申込者情報ページ）で使う連絡先
    #[serde(default)]
    pub contact: ApplicantContact,
}

/// 申込者の連絡先
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApplicantContact {
    pub first_name: String,
    pub middle_name: String,
    pub last_name: String,
    pub email: String,
    pub pincode: String,
}

impl Default for ApplicantContact {
    fn default() -> Self {
        Self {
            first_name: "Test".to_string(),
            middle_name: String::new(),
            last_name: "Applicant".to_string(),
            email: "applicant@example.com".to_string(),
            pincode: "110001".to_string(),
        }
    }
}

impl Default for ApplicantProfile {
    fn default() -> Self {
        Self {
            age: 30,
            gender: Gender::Female,
            annual_income: Decimal::from(700_000u64),
            cover_amount: Decimal::from(10_000_000u64),
            term_years: 45,
            smoker: false,
            contact: ApplicantContact::default(),
        }
    }
}

impl ApplicantProfile {
    /// JSONファイルから読み込む
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> Result<Self, crate::ScraperError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[derive(Debug, Clone)]
pub struct ScraperConfig {
    pub listing_url: String,
    pub insurer: String,
    pub headless: bool,
    pub debug: bool,
    /// 未指定なら CHROME_PATH / CHROMIUM_PATH / "chromium"
    pub chrome_path: Option<PathBuf>,
    /// ページ読み込み（goto）の上限
    pub navigation_timeout: Duration,
    /// ネットワークアイドル・DOM安定待ちの上限
    pub settle_timeout: Duration,
    /// 見積フォームの出現待ち
    pub form_timeout: Duration,
    /// 送信後の見積結果・エラー表示待ち
    pub quote_timeout: Duration,
    /// プラン1件あたりの上限
    pub plan_timeout: Duration,
    /// 実行全体の上限（超えた時点で残りのプランはTimeout扱い）
    pub run_timeout: Option<Duration>,
    pub navigation_retries: u32,
    pub navigation_retry_delay: Duration,
    pub fill_retries: u32,
    pub fill_backoff: Duration,
    /// 要素待ちのポーリング間隔
    pub poll_interval: Duration,
    /// 並列ブラウザセッション数
    pub sessions: usize,
    /// 処理するプラン数の上限
    pub limit: Option<usize>,
    pub profile: ApplicantProfile,
    pub layout: SiteLayout,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            listing_url: DEFAULT_LISTING_URL.to_string(),
            insurer: DEFAULT_INSURER.to_string(),
            headless: true,
            debug: false,
            chrome_path: None,
            navigation_timeout: Duration::from_secs(60),
            settle_timeout: Duration::from_secs(30),
            form_timeout: Duration::from_secs(15),
            quote_timeout: Duration::from_secs(30),
            plan_timeout: Duration::from_secs(180),
            run_timeout: None,
            navigation_retries: 3,
            navigation_retry_delay: Duration::from_secs(5),
            fill_retries: 3,
            fill_backoff: Duration::from_secs(1),
            poll_interval: Duration::from_millis(250),
            sessions: 1,
            limit: None,
            profile: ApplicantProfile::default(),
            layout: SiteLayout::default(),
        }
    }
}

impl ScraperConfig {
    pub fn new(listing_url: impl Into<String>) -> Self {
        Self {
            listing_url: listing_url.into(),
            ..Default::default()
        }
    }

    pub fn with_insurer(mut self, insurer: impl Into<String>) -> Self {
        self.insurer = insurer.into();
        self
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_chrome_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.chrome_path = Some(path.into());
        self
    }

    pub fn with_plan_timeout(mut self, timeout: Duration) -> Self {
        self.plan_timeout = timeout;
        self
    }

    pub fn with_run_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.run_timeout = timeout;
        self
    }

    pub fn with_form_timeout(mut self, timeout: Duration) -> Self {
        self.form_timeout = timeout;
        self
    }

    pub fn with_quote_timeout(mut self, timeout: Duration) -> Self {
        self.quote_timeout = timeout;
        self
    }

    pub fn with_navigation_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.navigation_retries = retries;
        self.navigation_retry_delay = delay;
        self
    }

    pub fn with_fill_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.fill_retries = retries;
        self.fill_backoff = backoff;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_sessions(mut self, sessions: usize) -> Self {
        self.sessions = sessions.max(1);
        self
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_profile(mut self, profile: ApplicantProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_layout(mut self, layout: SiteLayout) -> Self {
        self.layout = layout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = ScraperConfig::new("https://example.test/plans")
            .with_headless(false)
            .with_sessions(0)
            .with_limit(Some(2))
            .with_plan_timeout(Duration::from_secs(10));

        assert_eq!(config.listing_url, "https://example.test/plans");
        assert!(!config.headless);
        assert_eq!(config.sessions, 1);
        assert_eq!(config.limit, Some(2));
        assert_eq!(config.plan_timeout, Duration::from_secs(10));
        assert_eq!(config.insurer, DEFAULT_INSURER);
    }

    #[test]
    fn test_profile_camel_case() {
        let json = r#"{"age":35,"gender":"male","annualIncome":1200000,"coverAmount":20000000,"termYears":30,"smoker":true}"#;
        let profile: ApplicantProfile = serde_json::from_str(json).unwrap();

        assert_eq!(profile.age, 35);
        assert_eq!(profile.gender, Gender::Male);
        assert_eq!(profile.cover_amount, Decimal::from(20_000_000u64));
        assert!(profile.smoker);
        assert_eq!(profile.contact, ApplicantContact::default());

        let out = serde_json::to_value(&profile).unwrap();
        assert_eq!(out["termYears"], 30);
        assert_eq!(out["annualIncome"], 1200000.0);
    }

    #[test]
    fn test_profile_contact_partial() {
        let json = r#"{"age":35,"gender":"female","annualIncome":900000,"coverAmount":10000000,"termYears":30,"smoker":false,
                       "contact":{"firstName":"Asha","pincode":"560001"}}"#;
        let profile: ApplicantProfile = serde_json::from_str(json).unwrap();

        assert_eq!(profile.contact.first_name, "Asha");
        assert_eq!(profile.contact.pincode, "560001");
        assert_eq!(profile.contact.email, "applicant@example.com");
    }
}
