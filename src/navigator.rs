//! 見積フォームの状態遷移
//!
//! ```text
//! Loaded → FormVisible → Submitted → QuoteRendered
//!                     ↘ SubmitFailed
//! (どの状態からでも) → Timeout
//! ```
//!
//! Submitted の間に、レイアウトの `steps`（特約選択・申込者情報など）を順に通る。
//! 見積が先に表示されたら残りのステップは飛ばす。
//!
//! 終端状態は必ず `NavigationOutcome` として返し、エラーで抜けることはない。

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::{ApplicantProfile, ScraperConfig};
use crate::error::ScraperError;
use crate::layout::{FormInput, FormStep, InputAction, QuoteFormLayout};
use crate::page::{wait_for_any, Snapshot};
use crate::traits::PageClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum FormState {
    Loaded,
    FormVisible,
    Submitted,
    QuoteRendered,
    SubmitFailed,
    Timeout,
}

impl FormState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FormState::QuoteRendered | FormState::SubmitFailed | FormState::Timeout
        )
    }
}

impl fmt::Display for FormState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FormState::Loaded => "Loaded",
            FormState::FormVisible => "FormVisible",
            FormState::Submitted => "Submitted",
            FormState::QuoteRendered => "QuoteRendered",
            FormState::SubmitFailed => "SubmitFailed",
            FormState::Timeout => "Timeout",
        };
        f.write_str(name)
    }
}

/// フォーム操作の終端結果
#[derive(Debug, Clone, PartialEq)]
pub struct NavigationOutcome {
    pub state: FormState,
    /// バリデーションエラー・失敗理由
    pub message: Option<String>,
    pub notes: Vec<String>,
    /// 特約ページを通った場合、そのページの写し
    pub riders_page: Option<Snapshot>,
}

impl NavigationOutcome {
    fn new(state: FormState, message: Option<String>) -> Self {
        Self {
            state,
            message,
            notes: Vec::new(),
            riders_page: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FormState::Timeout, Some(message.into()))
    }

    pub fn is_quote_rendered(&self) -> bool {
        self.state == FormState::QuoteRendered
    }
}

/// 送信後の待機結果
enum Awaited {
    /// 次のステップのページが出た
    Step,
    Finished(NavigationOutcome),
}

/// フォーム操作の状態機械
pub struct FormNavigator<'a> {
    layout: &'a QuoteFormLayout,
    profile: &'a ApplicantProfile,
    form_timeout: Duration,
    quote_timeout: Duration,
    poll_interval: Duration,
    fill_retries: u32,
    fill_backoff: Duration,
}

impl<'a> FormNavigator<'a> {
    pub fn new(config: &'a ScraperConfig) -> Self {
        Self {
            layout: &config.layout.quote_form,
            profile: &config.profile,
            form_timeout: config.form_timeout,
            quote_timeout: config.quote_timeout,
            poll_interval: config.poll_interval,
            fill_retries: config.fill_retries.max(1),
            fill_backoff: config.fill_backoff,
        }
    }

    /// 開いた詳細ページ（Loaded）から終端状態まで進める
    pub async fn run<P: PageClient + ?Sized>(&self, page: &mut P) -> NavigationOutcome {
        let mut notes = Vec::new();
        let mut riders_page = None;
        let mut outcome = match self.drive(page, &mut notes, &mut riders_page).await {
            Ok(outcome) => outcome,
            Err(ScraperError::Timeout(msg)) => NavigationOutcome::timeout(msg),
            Err(e) => NavigationOutcome::new(FormState::SubmitFailed, Some(e.to_string())),
        };
        outcome.notes.extend(notes);
        outcome.riders_page = riders_page;
        outcome
    }

    async fn drive<P: PageClient + ?Sized>(
        &self,
        page: &mut P,
        notes: &mut Vec<String>,
        riders_page: &mut Option<Snapshot>,
    ) -> Result<NavigationOutcome, ScraperError> {
        let mut state = FormState::Loaded;

        // Loaded → FormVisible
        let form = self.layout.form.as_str();
        if wait_for_any(page, &[form], self.form_timeout, self.poll_interval)
            .await?
            .is_none()
        {
            return Ok(NavigationOutcome::timeout(format!(
                "quote form '{}' not rendered within {:?}",
                form, self.form_timeout
            )));
        }
        state = self.transition(state, FormState::FormVisible);

        if let Some(failed) = self.enter_inputs(page, &self.layout.inputs).await? {
            return Ok(failed);
        }

        // FormVisible → Submitted
        if let Err(e) = self
            .interact(page, &self.layout.submit, InputAction::Click, "")
            .await
        {
            warn!("Failed to submit quote form: {}", e);
            return Ok(NavigationOutcome::new(
                FormState::SubmitFailed,
                Some(e.to_string()),
            ));
        }
        state = self.transition(state, FormState::Submitted);

        let mut interstitial_dismissed = false;
        for step in &self.layout.steps {
            match self
                .await_page(page, Some(step), notes, &mut interstitial_dismissed)
                .await?
            {
                Awaited::Step => {}
                Awaited::Finished(outcome) => {
                    self.transition(state, outcome.state);
                    return Ok(outcome);
                }
            }
            info!("Form step '{}'", step.name);

            if step.capture_riders {
                match page.snapshot().await {
                    Ok(snapshot) => *riders_page = Some(snapshot),
                    Err(e) => {
                        warn!("Could not capture '{}' page: {}", step.name, e);
                        notes.push(format!("{} page: {}", step.name, e));
                    }
                }
            }

            if let Some(failed) = self.enter_inputs(page, &step.inputs).await? {
                return Ok(failed);
            }
            if let Err(e) = self
                .interact(page, &step.submit, InputAction::Click, "")
                .await
            {
                warn!("Failed to leave form step '{}': {}", step.name, e);
                return Ok(NavigationOutcome::new(
                    FormState::SubmitFailed,
                    Some(format!("{}: {}", step.name, e)),
                ));
            }
        }

        // Submitted → QuoteRendered / SubmitFailed
        let outcome = match self
            .await_page(page, None, notes, &mut interstitial_dismissed)
            .await?
        {
            Awaited::Finished(outcome) => outcome,
            Awaited::Step => NavigationOutcome::timeout("quote not rendered"),
        };
        self.transition(state, outcome.state);
        Ok(outcome)
    }

    /// ページが出している入力欄だけ埋める。入力できなければ SubmitFailed を返す
    async fn enter_inputs<P: PageClient + ?Sized>(
        &self,
        page: &mut P,
        inputs: &[FormInput],
    ) -> Result<Option<NavigationOutcome>, ScraperError> {
        for input in inputs {
            let value = input.field.value(self.profile);
            let selector = input.resolved_selector(&value);

            if !page.exists(&selector).await? {
                debug!("Input {:?} not exposed by this form ({})", input.field, selector);
                continue;
            }

            if let Err(e) = self.interact(page, &selector, input.action, &value).await {
                warn!("Failed to enter {:?}: {}", input.field, e);
                return Ok(Some(NavigationOutcome::new(
                    FormState::SubmitFailed,
                    Some(e.to_string()),
                )));
            }
        }
        Ok(None)
    }

    fn transition(&self, from: FormState, to: FormState) -> FormState {
        debug!("Form state: {} → {}", from, to);
        to
    }

    /// 入力・クリックを上限回数まで再試行（待機は毎回倍）
    async fn interact<P: PageClient + ?Sized>(
        &self,
        page: &mut P,
        selector: &str,
        action: InputAction,
        value: &str,
    ) -> Result<(), ScraperError> {
        let mut backoff = self.fill_backoff;
        let mut attempt = 1;

        loop {
            let result = match action {
                InputAction::Fill => page.fill(selector, value).await,
                InputAction::Click => page.click(selector).await,
            };

            match result {
                Ok(()) => {
                    debug!("{:?} '{}' ok (attempt {})", action, selector, attempt);
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < self.fill_retries => {
                    warn!(
                        "{:?} '{}' failed (attempt {}/{}): {}. Retrying in {:?}",
                        action, selector, attempt, self.fill_retries, e, backoff
                    );
                    sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 見積結果・エラー表示・次のステップのいずれかが出るまで待つ
    async fn await_page<P: PageClient + ?Sized>(
        &self,
        page: &mut P,
        step: Option<&FormStep>,
        notes: &mut Vec<String>,
        interstitial_dismissed: &mut bool,
    ) -> Result<Awaited, ScraperError> {
        let deadline = Instant::now() + self.quote_timeout;

        loop {
            if page.exists(&self.layout.quote_marker).await? {
                info!("Quote rendered");
                return Ok(Awaited::Finished(NavigationOutcome::new(
                    FormState::QuoteRendered,
                    None,
                )));
            }

            if let Some(message) = page.read(&self.layout.error_marker).await? {
                let message = message.split_whitespace().collect::<Vec<_>>().join(" ");
                if !message.is_empty() {
                    warn!("Form validation error: {}", message);
                    return Ok(Awaited::Finished(NavigationOutcome::new(
                        FormState::SubmitFailed,
                        Some(message),
                    )));
                }
            }

            if let Some(interstitial) = &self.layout.interstitial {
                if !*interstitial_dismissed && page.exists(&interstitial.marker).await? {
                    *interstitial_dismissed = true;
                    match page.click(&interstitial.proceed).await {
                        Ok(()) => info!("Dismissed interstitial '{}'", interstitial.marker),
                        Err(e) => {
                            warn!("Could not dismiss interstitial: {}", e);
                            notes.push(format!("interstitial: {}", e));
                        }
                    }
                    continue;
                }
            }

            if let Some(step) = step {
                if page.exists(&step.marker).await? {
                    return Ok(Awaited::Step);
                }
            }

            if Instant::now() >= deadline {
                let message = match step {
                    Some(step) => format!(
                        "no quote, validation error or '{}' page within {:?}",
                        step.name, self.quote_timeout
                    ),
                    None => format!(
                        "no quote or validation error within {:?}",
                        self.quote_timeout
                    ),
                };
                return Ok(Awaited::Finished(NavigationOutcome::timeout(message)));
            }
            sleep(self.poll_interval).await;
        }
    }
}
