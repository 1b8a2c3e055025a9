//! 定期保険プラン スクレイパーライブラリ
//!
//! - 保険会社サイトのプラン一覧から詳細ページURLを収集
//! - 詳細ページの見積フォームに申込者プロファイルを入力して見積を取得
//! - 詳細・見積ページから保険料・特約・見積内訳を抽出し、JSON配列として出力
//!
//! # 使用例
//!
//! ```rust,ignore
//! use term_plan_scraper::{ChromeLauncher, JsonFileSink, Pipeline, ScraperConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ScraperConfig::default()
//!         .with_headless(false)
//!         .with_limit(Some(3));
//!
//!     let launcher = ChromeLauncher::new(config.clone());
//!     let pipeline = Pipeline::new(launcher, config).unwrap();
//!
//!     let summary = pipeline.run(&JsonFileSink::new("plans.json")).await.unwrap();
//!     println!("Records: {}", summary.produced);
//! }
//! ```

pub mod config;
pub mod error;
pub mod extract;
pub mod layout;
pub mod listing;
pub mod money;
pub mod navigator;
pub mod page;
pub mod pipeline;
pub mod record;
pub mod sink;
pub mod traits;

// 主要な型をリエクスポート
pub use config::{ApplicantContact, ApplicantProfile, Gender, ScraperConfig};
pub use error::ScraperError;
pub use layout::SiteLayout;
pub use navigator::{FormState, NavigationOutcome};
pub use page::{ChromeLauncher, ChromeSession, Snapshot};
pub use pipeline::{Pipeline, RunOutput, RunSummary};
pub use record::{PlanRecord, QuoteDetails, Rider};
pub use sink::{JsonFileSink, RecordSink};
pub use traits::{Launcher, PageClient};
