//! パイプライン
//!
//! 一覧 → (プランごとに) フォーム操作 → 抽出 → 組み立て → 出力。
//!
//! プラン単位の失敗はここで受け止め、部分レコードかスキップ（理由付き）に変換する。
//! 呼び出し元まで伝播するのは一覧・出力レベルのエラーだけ。
//! `sessions > 1` のときはURLを互いに素な組に分け、組ごとに独立したブラウザで処理し、
//! 最後に一覧の順序へ並べ直す。

use std::collections::BTreeMap;
use std::future::{poll_fn, Future};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use base64::Engine;
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{timeout, timeout_at, Instant};
use tower::Service;
use tracing::{debug, error, info, warn};

use crate::config::ScraperConfig;
use crate::error::ScraperError;
use crate::extract::FieldExtractor;
use crate::listing::collect_plan_urls;
use crate::navigator::{FormNavigator, FormState, NavigationOutcome};
use crate::page::{open_with_retries, Snapshot};
use crate::record::{PlanExtraction, PlanRecord, RecordAssembler};
use crate::sink::RecordSink;
use crate::traits::{Launcher, PageClient};

const SCREENSHOT_TIMEOUT: Duration = Duration::from_secs(10);

/// 1プランの処理要求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRequest {
    /// 一覧上の位置
    pub index: usize,
    pub url: String,
}

#[derive(Debug, Clone)]
pub enum PlanOutcome {
    Produced {
        record: PlanRecord,
        state: FormState,
    },
    /// 内容を読む前に失敗（レコードは出さない）
    Skipped { reason: String },
    /// 実行上限・セッション起動失敗で着手しなかった
    NotStarted { reason: String },
}

#[derive(Debug, Clone)]
pub struct PlanReport {
    pub index: usize,
    pub url: String,
    pub outcome: PlanOutcome,
}

impl PlanReport {
    fn skipped(request: &PlanRequest, reason: impl Into<String>) -> Self {
        Self {
            index: request.index,
            url: request.url.clone(),
            outcome: PlanOutcome::Skipped {
                reason: reason.into(),
            },
        }
    }

    fn not_started(request: &PlanRequest, reason: impl Into<String>) -> Self {
        Self {
            index: request.index,
            url: request.url.clone(),
            outcome: PlanOutcome::NotStarted {
                reason: reason.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedPlan {
    pub url: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanNotes {
    pub url: String,
    pub notes: Vec<String>,
}

/// 実行サマリー
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub listed: usize,
    /// 着手したプラン数（実行上限で着手しなかったものは含まない）
    pub attempted: usize,
    pub produced: usize,
    pub skipped: Vec<SkippedPlan>,
    /// フォームの終端状態ごとの件数
    pub states: BTreeMap<FormState, usize>,
    pub notes: Vec<PlanNotes>,
    pub elapsed_secs: f64,
}

impl RunSummary {
    fn from_reports(listed: usize, reports: &[PlanReport], elapsed: Duration) -> Self {
        let mut summary = RunSummary {
            listed,
            elapsed_secs: elapsed.as_secs_f64(),
            ..Default::default()
        };

        for report in reports {
            match &report.outcome {
                PlanOutcome::Produced { record, state } => {
                    summary.attempted += 1;
                    summary.produced += 1;
                    *summary.states.entry(*state).or_default() += 1;
                    if !record.notes.is_empty() {
                        summary.notes.push(PlanNotes {
                            url: report.url.clone(),
                            notes: record.notes.clone(),
                        });
                    }
                }
                PlanOutcome::Skipped { reason } => {
                    summary.attempted += 1;
                    summary.skipped.push(SkippedPlan {
                        url: report.url.clone(),
                        reason: reason.clone(),
                    });
                }
                PlanOutcome::NotStarted { reason } => summary.skipped.push(SkippedPlan {
                    url: report.url.clone(),
                    reason: reason.clone(),
                }),
            }
        }

        summary
    }

    pub fn log(&self) {
        info!(
            "Run finished in {:.1}s: attempted={}, produced={}, skipped={}",
            self.elapsed_secs,
            self.attempted,
            self.produced,
            self.skipped.len()
        );
        for (state, count) in &self.states {
            info!("  {}: {}", state, count);
        }
        for skipped in &self.skipped {
            warn!("  skipped {}: {}", skipped.url, skipped.reason);
        }
        for plan in &self.notes {
            for note in &plan.notes {
                debug!("  note {}: {}", plan.url, note);
            }
        }
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), ScraperError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// プラン処理で共有する読み取り専用の文脈
struct PlanContext {
    config: ScraperConfig,
    extractor: FieldExtractor,
    assembler: RecordAssembler,
}

/// 1セッション（1ページ）でプランを処理する tower::Service
pub struct PlanService<P> {
    page: Arc<Mutex<P>>,
    ctx: Arc<PlanContext>,
    run_deadline: Option<Instant>,
}

impl<P> Clone for PlanService<P> {
    fn clone(&self) -> Self {
        Self {
            page: self.page.clone(),
            ctx: self.ctx.clone(),
            run_deadline: self.run_deadline,
        }
    }
}

impl<P: PageClient + 'static> Service<PlanRequest> for PlanService<P> {
    type Response = PlanReport;
    type Error = ScraperError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: PlanRequest) -> Self::Future {
        let page = self.page.clone();
        let ctx = self.ctx.clone();
        let run_deadline = self.run_deadline;

        Box::pin(async move {
            let now = Instant::now();
            if run_deadline.is_some_and(|deadline| now >= deadline) {
                warn!("Run time limit reached, skipping {}", request.url);
                return Ok(PlanReport::not_started(&request, "run time limit exceeded"));
            }

            let plan_deadline = now + ctx.config.plan_timeout;
            let deadline = run_deadline.map_or(plan_deadline, |d| d.min(plan_deadline));

            let mut page = page.lock().await;
            Ok(scrape_plan(&mut *page, &ctx, &request, deadline).await)
        })
    }
}

/// 詳細ページを開いて固定する
async fn load_detail<P: PageClient + ?Sized>(
    page: &mut P,
    url: &str,
    config: &ScraperConfig,
) -> Result<Snapshot, ScraperError> {
    open_with_retries(page, url, config.navigation_retries, config.navigation_retry_delay).await?;
    if let Err(e) = page.wait_for_settled(config.settle_timeout).await {
        warn!("Detail page did not settle ({}): {}", url, e);
    }
    page.snapshot().await
}

async fn load_quote<P: PageClient + ?Sized>(
    page: &mut P,
    config: &ScraperConfig,
) -> Result<Snapshot, ScraperError> {
    if let Err(e) = page.wait_for_settled(config.settle_timeout).await {
        warn!("Quote page did not settle: {}", e);
    }
    page.snapshot().await
}

/// デバッグ用にスクリーンショットをログへ
async fn log_screenshot<P: PageClient + ?Sized>(page: &mut P, url: &str) {
    match timeout(SCREENSHOT_TIMEOUT, page.screenshot()).await {
        Ok(Ok(png)) if !png.is_empty() => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(&png);
            debug!("Screenshot for {}: data:image/png;base64,{}", url, encoded);
        }
        Ok(Ok(_)) => {}
        Ok(Err(e)) => debug!("Screenshot failed for {}: {}", url, e),
        Err(_) => debug!("Screenshot timed out for {}", url),
    }
}

/// 1プラン分の処理（失敗はレポートとして返す）
async fn scrape_plan<P: PageClient + ?Sized>(
    page: &mut P,
    ctx: &PlanContext,
    request: &PlanRequest,
    deadline: Instant,
) -> PlanReport {
    let url = request.url.as_str();
    let config = &ctx.config;

    let detail_snapshot = match timeout_at(deadline, load_detail(page, url, config)).await {
        Ok(Ok(snapshot)) => snapshot,
        Ok(Err(e)) => {
            error!("Skipping {}: {}", url, e);
            if config.debug {
                log_screenshot(page, url).await;
            }
            return PlanReport::skipped(request, e.to_string());
        }
        Err(_) => {
            error!("Skipping {}: timed out before content was read", url);
            return PlanReport::skipped(request, "timed out before content was read");
        }
    };

    let mut extraction = PlanExtraction {
        detail: ctx.extractor.extract_detail(&detail_snapshot),
        ..Default::default()
    };

    let navigator = FormNavigator::new(config);
    let mut outcome = match timeout_at(deadline, navigator.run(page)).await {
        Ok(outcome) => outcome,
        Err(_) => NavigationOutcome::timeout("plan time limit exceeded"),
    };

    // 特約ページ → 見積ページ → 詳細ページの順で特約を探す
    let mut rider_source = detail_snapshot;
    if outcome.is_quote_rendered() {
        match timeout_at(deadline, load_quote(page, config)).await {
            Ok(Ok(snapshot)) => {
                extraction.quote = Some(ctx.extractor.extract_quote(&snapshot));
                rider_source = snapshot;
            }
            Ok(Err(e)) => {
                outcome = NavigationOutcome {
                    state: FormState::SubmitFailed,
                    message: Some(format!("quote page unreadable: {}", e)),
                    ..outcome
                };
            }
            Err(_) => {
                outcome = NavigationOutcome {
                    state: FormState::Timeout,
                    message: Some("plan time limit exceeded".to_string()),
                    ..outcome
                };
            }
        }
    }
    if let Some(riders_page) = outcome.riders_page.take() {
        rider_source = riders_page;
    }
    extraction.riders = ctx
        .extractor
        .extract_riders(&rider_source, &mut extraction.notes);

    match outcome.state {
        FormState::QuoteRendered => info!("Quote captured for {}", url),
        state => {
            error!(
                "Quote not captured for {}: {} ({})",
                url,
                state,
                outcome.message.as_deref().unwrap_or("-")
            );
            if config.debug {
                log_screenshot(page, url).await;
            }
        }
    }

    let scrape_date = Utc::now().date_naive();
    let record = ctx
        .assembler
        .assemble(url, scrape_date, &outcome, extraction);
    for note in &record.notes {
        debug!("{}: {}", url, note);
    }

    PlanReport {
        index: request.index,
        url: request.url.clone(),
        outcome: PlanOutcome::Produced {
            record,
            state: outcome.state,
        },
    }
}

/// 1セッションで担当分を順に処理し、最後に必ずページを閉じる
async fn run_session<P: PageClient + 'static>(
    session: usize,
    page: P,
    requests: Vec<PlanRequest>,
    total: usize,
    ctx: Arc<PlanContext>,
    run_deadline: Option<Instant>,
) -> Vec<PlanReport> {
    let mut service = PlanService {
        page: Arc::new(Mutex::new(page)),
        ctx,
        run_deadline,
    };
    let mut reports = Vec::with_capacity(requests.len());

    for request in requests {
        info!(
            "[session {}] Plan {}/{}: {}",
            session,
            request.index + 1,
            total,
            request.url
        );

        let result = match poll_fn(|cx| service.poll_ready(cx)).await {
            Ok(()) => service.call(request.clone()).await,
            Err(e) => Err(e),
        };
        reports.push(result.unwrap_or_else(|e| {
            error!("Plan service failed for {}: {}", request.url, e);
            PlanReport::skipped(&request, e.to_string())
        }));
    }

    if let Err(e) = service.page.lock().await.close().await {
        warn!("Failed to close session {}: {}", session, e);
    }
    reports
}

/// URLを `sessions` 個の互いに素な組に分ける（ラウンドロビン）
fn partition(requests: Vec<PlanRequest>, sessions: usize) -> Vec<Vec<PlanRequest>> {
    let sessions = sessions.clamp(1, requests.len().max(1));
    let mut chunks = vec![Vec::new(); sessions];
    for (i, request) in requests.into_iter().enumerate() {
        chunks[i % sessions].push(request);
    }
    chunks
}

/// 実行結果
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// 一覧順のレコード
    pub records: Vec<PlanRecord>,
    pub summary: RunSummary,
}

/// パイプライン本体
pub struct Pipeline<L: Launcher> {
    launcher: L,
    ctx: Arc<PlanContext>,
}

impl<L: Launcher> Pipeline<L> {
    /// レイアウトの検証（セレクタ・正規表現のコンパイル）を含む
    pub fn new(launcher: L, config: ScraperConfig) -> Result<Self, ScraperError> {
        let extractor = FieldExtractor::new(&config.layout)?;
        let assembler = RecordAssembler::new(config.insurer.clone());
        Ok(Self {
            launcher,
            ctx: Arc::new(PlanContext {
                config,
                extractor,
                assembler,
            }),
        })
    }

    /// 一覧取得から全プランの処理まで（出力はしない）
    pub async fn scrape(&self) -> Result<RunOutput, ScraperError> {
        let started = Instant::now();
        let config = &self.ctx.config;
        let run_deadline = config.run_timeout.map(|t| started + t);

        // セッション0で一覧を取得し、そのままプラン処理にも使う
        let mut first_page = self.launcher.launch(0).await?;
        let listed = match collect_plan_urls(&mut first_page, config).await {
            Ok(urls) => urls,
            Err(e) => {
                if let Err(close_err) = first_page.close().await {
                    warn!("Failed to close session 0: {}", close_err);
                }
                return Err(e);
            }
        };
        let listed_count = listed.len();

        let mut urls = listed;
        if let Some(limit) = config.limit {
            if urls.len() > limit {
                info!("Limiting to first {} of {} plans", limit, urls.len());
                urls.truncate(limit);
            }
        }

        let requests: Vec<PlanRequest> = urls
            .into_iter()
            .enumerate()
            .map(|(index, url)| PlanRequest { index, url })
            .collect();
        let total = requests.len();

        let mut chunks = partition(requests, config.sessions).into_iter();
        let first_chunk = chunks.next().unwrap_or_default();

        let mut sessions: Vec<Pin<Box<dyn Future<Output = Vec<PlanReport>> + Send + '_>>> =
            Vec::with_capacity(config.sessions);
        sessions.push(Box::pin(run_session(
            0,
            first_page,
            first_chunk,
            total,
            self.ctx.clone(),
            run_deadline,
        )));

        for (offset, chunk) in chunks.enumerate() {
            let session = offset + 1;
            let ctx = self.ctx.clone();
            sessions.push(Box::pin(async move {
                match self.launcher.launch(session).await {
                    Ok(page) => run_session(session, page, chunk, total, ctx, run_deadline).await,
                    Err(e) => {
                        error!("Session {} failed to start: {}", session, e);
                        chunk
                            .iter()
                            .map(|request| PlanReport::not_started(request, e.to_string()))
                            .collect()
                    }
                }
            }));
        }

        let mut reports: Vec<PlanReport> = join_all(sessions).await.into_iter().flatten().collect();
        reports.sort_by_key(|report| report.index);

        let summary = RunSummary::from_reports(listed_count, &reports, started.elapsed());
        let records = reports
            .into_iter()
            .filter_map(|report| match report.outcome {
                PlanOutcome::Produced { record, .. } => Some(record),
                PlanOutcome::Skipped { .. } | PlanOutcome::NotStarted { .. } => None,
            })
            .collect();

        Ok(RunOutput { records, summary })
    }

    /// 全件処理して出力先に1度だけ書き出す
    pub async fn run(&self, sink: &dyn RecordSink) -> Result<RunSummary, ScraperError> {
        let RunOutput { records, summary } = self.scrape().await?;

        sink.write(&records).map_err(|e| match e {
            ScraperError::Sink(_) => e,
            other => ScraperError::Sink(other.to_string()),
        })?;

        summary.log();
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::mock::{MockLauncher, MockSite};
    use crate::record::Rider;
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex as StdMutex;

    const LISTING_URL: &str = "https://www.axismaxlife.com/term-insurance-plans";
    const PLAN_QUOTE: &str = "https://www.axismaxlife.com/term-insurance-plans/smart-term-plan-plus-plan";
    const PLAN_INVALID: &str = "https://www.axismaxlife.com/term-insurance-plans/online-term-plan";
    const PLAN_NO_FORM: &str = "https://www.axismaxlife.com/term-insurance-plans/saral-jeevan-bima-plan";
    const PLAN_DOWN: &str = "https://www.axismaxlife.com/term-insurance-plans/super-term-plan";
    const PLAN_STEPS: &str = "https://www.axismaxlife.com/term-insurance-plans/smart-secure-plus-plan";

    const FORM: &str = r#"
        <h1>Smart Term Plan Plus</h1>
        <ul><li>Special rates for non-smoker applicants</li></ul>
        <span class="premium">₹ 512/month</span>
        <form class="quote-form">
          <label for="gender_F">Female</label>
          <label for="tobacco_No">No</label>
          <input name="age">
          <input name="coverAmount">
          <button id="viewPlans">View Plans</button>
        </form>
    "#;

    const QUOTE: &str = r#"
        <div class="px-2 card">
          <p>Equote Number: EQ-0001</p>
          <p>Policy Name: Smart Term Plan Plus</p>
          <p>Life Cover ₹ 1 Crore</p>
          <p>Cover till age 75</p>
          <p>Base Premium ₹ 1,000</p>
          <p>Add-ons ₹ 120</p>
          <p>Base + Add-ons ₹ 1,120</p>
          <p>GST Amount ₹ 201.60</p>
          <p>Total Amount ₹ 1,321.60</p>
        </div>
        <span class="premium">₹ 1,321.60/month</span>
        <div class="rider-container">
          <div class="rider-card">Accidental Death, ₹10,00,000, ₹120</div>
        </div>
    "#;

    const COVER_PAGE: &str = r#"
        <div class="jsx-1782489574">
          <label for="75">75 yrs</label>
          <button id="viewPlans">Proceed</button>
        </div>
    "#;

    const RIDER_PAGE: &str = r#"
        <div class="rider-container">
          <div class="rider-card">
            <span class="title">Critical Illness</span>
            <div class="coverage-amount">₹ 5,00,000</div>
            <div class="rider-premium">₹ 210</div>
          </div>
        </div>
        <button id="viewPlans">Skip</button>
    "#;

    const DETAILS_PAGE: &str = r#"
        <form>
          <input id="firstName"><input id="lastName"><input id="email">
          <input id="pincode"><input type="checkbox">
          <button type="submit">Submit</button>
        </form>
    "#;

    const FINAL_QUOTE: &str = r#"
        <div class="px-2 card">
          <p>Equote Number: EQ-0002</p>
          <p>Policy Name: Smart Secure Plus</p>
          <p>Life Cover ₹ 1 Crore</p>
          <p>Cover till age 75</p>
          <p>Base Premium ₹ 1,000</p>
          <p>Add-ons ₹ 210</p>
          <p>Base + Add-ons ₹ 1,210</p>
          <p>GST Amount ₹ 217.80</p>
          <p>Total Amount ₹ 1,427.80</p>
        </div>
    "#;

    #[derive(Default)]
    struct MemorySink {
        writes: StdMutex<Vec<Vec<PlanRecord>>>,
    }

    impl RecordSink for MemorySink {
        fn write(&self, records: &[PlanRecord]) -> Result<(), ScraperError> {
            self.writes.lock().unwrap().push(records.to_vec());
            Ok(())
        }
    }

    fn listing(urls: &[&str]) -> String {
        urls.iter()
            .map(|u| format!("<a href=\"{}\">plan</a>", u))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn site(urls: &[&str]) -> MockSite {
        MockSite::new()
            .page(LISTING_URL, &listing(urls))
            .page(PLAN_QUOTE, FORM)
            .on_click(PLAN_QUOTE, "button#viewPlans", QUOTE)
            .page(PLAN_INVALID, FORM)
            .on_click(
                PLAN_INVALID,
                "button#viewPlans",
                "<form class='quote-form'><p class='error-message'>Age must be between 18 and 65</p></form>",
            )
            .page(PLAN_NO_FORM, "<h1>Saral Jeevan Bima</h1><p>Medical check may apply</p>")
            .page(PLAN_STEPS, FORM)
            .on_click_when(PLAN_STEPS, "form.quote-form", "button#viewPlans", COVER_PAGE)
            .on_click_when(PLAN_STEPS, "div.jsx-1782489574", "button#viewPlans", RIDER_PAGE)
            .on_click_when(PLAN_STEPS, "div.rider-container", "button#viewPlans", DETAILS_PAGE)
            .on_click(
                PLAN_STEPS,
                "button[type='submit']",
                r#"<button id="viewPlans" class="unified-button-primary">Proceed</button>"#,
            )
            .on_click(PLAN_STEPS, "button#viewPlans.unified-button-primary", FINAL_QUOTE)
    }

    fn config() -> ScraperConfig {
        ScraperConfig::new(LISTING_URL)
            .with_form_timeout(Duration::from_millis(50))
            .with_quote_timeout(Duration::from_millis(50))
            .with_poll_interval(Duration::from_millis(5))
            .with_navigation_retries(2, Duration::from_millis(1))
            .with_fill_retries(2, Duration::from_millis(1))
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[tokio::test]
    async fn test_three_plan_scenario() {
        let launcher = MockLauncher::new(site(&[PLAN_QUOTE, PLAN_INVALID, PLAN_NO_FORM]));
        let site = launcher.site.clone();
        let pipeline = Pipeline::new(launcher, config()).unwrap();
        let sink = MemorySink::default();

        let summary = pipeline.run(&sink).await.unwrap();

        let writes = sink.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        let records = &writes[0];
        assert_eq!(records.len(), 3);

        let quoted = &records[0];
        assert_eq!(quoted.source_url, PLAN_QUOTE);
        assert_eq!(quoted.plan_name, "Smart Term Plan Plus");
        assert_eq!(quoted.monthly_premium, Some(dec("1321.60")));
        assert!(quoted.smoker_premium_diff);
        assert!(!quoted.medical_required);
        assert_eq!(
            quoted.add_on_riders,
            vec![Rider {
                name: "Accidental Death".to_string(),
                coverage: "₹10,00,000".to_string(),
                premium: Some(dec("120")),
            }]
        );
        let details = quoted.quote_details.as_ref().unwrap();
        assert_eq!(details.equote_number, "EQ-0001");
        assert_eq!(details.total_amount, dec("1321.60"));

        let invalid = &records[1];
        assert!(invalid.quote_details.is_none());
        assert_eq!(invalid.monthly_premium, Some(dec("512")));
        assert!(invalid
            .notes
            .iter()
            .any(|n| n.contains("SubmitFailed") && n.contains("Age must be between")));

        let no_form = &records[2];
        assert!(no_form.quote_details.is_none());
        assert_eq!(no_form.plan_name, "Saral Jeevan Bima");
        assert!(no_form.medical_required);
        assert!(no_form.notes.iter().any(|n| n.contains("Timeout")));

        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.produced, 3);
        assert_eq!(summary.states.get(&FormState::QuoteRendered), Some(&1));
        assert_eq!(summary.states.get(&FormState::SubmitFailed), Some(&1));
        assert_eq!(summary.states.get(&FormState::Timeout), Some(&1));
        assert!(summary.skipped.is_empty());

        assert_eq!(site.launched.load(Ordering::SeqCst), 1);
        assert_eq!(site.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_multi_step_quote_keeps_rider_page() {
        let pipeline = Pipeline::new(MockLauncher::new(site(&[PLAN_STEPS])), config()).unwrap();

        let output = pipeline.scrape().await.unwrap();

        assert_eq!(output.summary.states.get(&FormState::QuoteRendered), Some(&1));
        let record = &output.records[0];
        assert_eq!(
            record.add_on_riders,
            vec![Rider {
                name: "Critical Illness".to_string(),
                coverage: "₹ 5,00,000".to_string(),
                premium: Some(dec("210")),
            }]
        );
        let details = record.quote_details.as_ref().unwrap();
        assert_eq!(details.equote_number, "EQ-0002");
        assert_eq!(details.total_amount, dec("1427.80"));
        assert!(details.check_totals(dec("0.01")).is_empty());
    }

    #[tokio::test]
    async fn test_listing_empty_writes_nothing() {
        let launcher = MockLauncher::new(MockSite::new().page(LISTING_URL, "<p>No plans</p>"));
        let site = launcher.site.clone();
        let pipeline = Pipeline::new(launcher, config()).unwrap();
        let sink = MemorySink::default();

        let err = pipeline.run(&sink).await.unwrap_err();

        assert!(matches!(err, ScraperError::ListingEmpty(_)));
        assert!(sink.writes.lock().unwrap().is_empty());
        assert_eq!(site.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unreachable_plan_is_skipped() {
        let launcher = MockLauncher::new(site(&[PLAN_DOWN, PLAN_QUOTE]));
        let site = launcher.site.clone();
        let pipeline = Pipeline::new(launcher, config()).unwrap();

        let output = pipeline.scrape().await.unwrap();

        assert_eq!(output.records.len(), 1);
        assert_eq!(output.records[0].source_url, PLAN_QUOTE);
        assert_eq!(output.summary.skipped.len(), 1);
        assert_eq!(output.summary.skipped[0].url, PLAN_DOWN);
        // 2回試行してから諦める
        let attempts = site
            .opened_urls()
            .iter()
            .filter(|u| u.as_str() == PLAN_DOWN)
            .count();
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_navigation_failure_is_retried() {
        let launcher = MockLauncher::new(site(&[PLAN_QUOTE]).failing_open(PLAN_QUOTE, 1));
        let pipeline = Pipeline::new(launcher, config()).unwrap();

        let output = pipeline.scrape().await.unwrap();

        assert_eq!(output.records.len(), 1);
        assert!(output.records[0].quote_details.is_some());
    }

    #[tokio::test]
    async fn test_parallel_sessions_keep_listing_order() {
        let urls = [PLAN_NO_FORM, PLAN_QUOTE, PLAN_DOWN, PLAN_INVALID];
        let launcher = MockLauncher::new(site(&urls));
        let site = launcher.site.clone();
        let pipeline = Pipeline::new(launcher, config().with_sessions(3)).unwrap();

        let output = pipeline.scrape().await.unwrap();

        let produced: Vec<&str> = output
            .records
            .iter()
            .map(|r| r.source_url.as_str())
            .collect();
        assert_eq!(produced, vec![PLAN_NO_FORM, PLAN_QUOTE, PLAN_INVALID]);
        assert!(output.records.len() <= urls.len());
        assert_eq!(site.launched.load(Ordering::SeqCst), 3);
        assert_eq!(site.closed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let urls = [PLAN_QUOTE, PLAN_INVALID, PLAN_NO_FORM];
        let first = Pipeline::new(MockLauncher::new(site(&urls)), config())
            .unwrap()
            .scrape()
            .await
            .unwrap();
        let second = Pipeline::new(MockLauncher::new(site(&urls)), config())
            .unwrap()
            .scrape()
            .await
            .unwrap();

        let strip_date = |records: Vec<PlanRecord>| {
            records
                .into_iter()
                .map(|mut r| {
                    r.source_scrape_date = chrono::NaiveDate::MIN;
                    r
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(strip_date(first.records), strip_date(second.records));
    }

    #[tokio::test]
    async fn test_quote_totals_are_consistent() {
        let pipeline = Pipeline::new(
            MockLauncher::new(site(&[PLAN_QUOTE, PLAN_INVALID])),
            config(),
        )
        .unwrap();

        let output = pipeline.scrape().await.unwrap();

        let tolerance = dec("0.01");
        for details in output.records.iter().filter_map(|r| r.quote_details.as_ref()) {
            assert!(details.check_totals(tolerance).is_empty());
        }
    }

    #[tokio::test]
    async fn test_limit_and_run_timeout() {
        let urls = [PLAN_QUOTE, PLAN_INVALID, PLAN_NO_FORM];

        let limited = Pipeline::new(MockLauncher::new(site(&urls)), config().with_limit(Some(1)))
            .unwrap()
            .scrape()
            .await
            .unwrap();
        assert_eq!(limited.summary.listed, 3);
        assert_eq!(limited.summary.attempted, 1);
        assert_eq!(limited.records.len(), 1);

        let expired = Pipeline::new(
            MockLauncher::new(site(&urls)),
            config().with_run_timeout(Some(Duration::ZERO)),
        )
        .unwrap()
        .scrape()
        .await
        .unwrap();
        assert!(expired.records.is_empty());
        assert_eq!(expired.summary.listed, 3);
        assert_eq!(expired.summary.attempted, 0);
        assert_eq!(expired.summary.skipped.len(), 3);
        assert!(expired
            .summary
            .skipped
            .iter()
            .all(|s| s.reason == "run time limit exceeded"));
    }

    #[test]
    fn test_attempted_excludes_plans_never_started() {
        let urls = [PLAN_DOWN, PLAN_QUOTE];
        let reports = vec![
            PlanReport::skipped(
                &PlanRequest { index: 0, url: urls[0].to_string() },
                "net::ERR_CONNECTION_RESET",
            ),
            PlanReport::not_started(
                &PlanRequest { index: 1, url: urls[1].to_string() },
                "run time limit exceeded",
            ),
        ];

        let summary = RunSummary::from_reports(2, &reports, Duration::ZERO);
        assert_eq!(summary.attempted, 1);
        assert_eq!(summary.produced, 0);
        assert_eq!(summary.skipped.len(), 2);
        assert_eq!(summary.skipped[1].reason, "run time limit exceeded");
    }

    #[tokio::test]
    async fn test_plan_deadline_cuts_form_wait() {
        // フォーム待ちの上限より先にプラン単位の上限が来る
        let config = config()
            .with_form_timeout(Duration::from_secs(5))
            .with_plan_timeout(Duration::from_millis(30));
        let pipeline = Pipeline::new(MockLauncher::new(site(&[PLAN_NO_FORM])), config).unwrap();

        let started = std::time::Instant::now();
        let output = pipeline.scrape().await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(output.records.len(), 1);
        assert_eq!(output.summary.attempted, 1);
        assert_eq!(output.summary.states.get(&FormState::Timeout), Some(&1));
        let record = &output.records[0];
        assert!(record.quote_details.is_none());
        assert_eq!(record.plan_name, "Saral Jeevan Bima");
        assert!(
            record
                .notes
                .iter()
                .any(|n| n.contains("plan time limit exceeded")),
            "{:?}",
            record.notes
        );
    }

    #[test]
    fn test_partition_is_disjoint() {
        let requests: Vec<PlanRequest> = (0..5)
            .map(|index| PlanRequest {
                index,
                url: format!("https://mock.test/{}", index),
            })
            .collect();

        let chunks = partition(requests, 2);
        assert_eq!(chunks.len(), 2);
        assert_eq!(
            chunks[0].iter().map(|r| r.index).collect::<Vec<_>>(),
            vec![0, 2, 4]
        );
        assert_eq!(chunks[1].iter().map(|r| r.index).collect::<Vec<_>>(), vec![1, 3]);

        assert_eq!(partition(Vec::new(), 4).len(), 1);
    }
}
