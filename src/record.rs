//! 出力レコードと組み立て
//!
//! 一覧のURL、フォーム遷移の終端状態、詳細・見積ページの抽出値を
//! 1件の `PlanRecord` にまとめる。組み立ては純粋な合成で、ページには触れない。

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::extract::Extracted;
use crate::layout::Field;
use crate::money::approx_eq;
use crate::navigator::{FormState, NavigationOutcome};

/// plan_type が取れなかった場合の値
pub const DEFAULT_PLAN_TYPE: &str = "Term Insurance";

static SLUG_NOISE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(buy|best|online|in india|202\d|axis max life insurance)\b")
        .expect("slug noise regex")
});

static PLAN_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)-plan$").expect("plan suffix regex"));

/// 特約
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rider {
    pub name: String,
    /// 補償額（表示どおりの文字列）
    pub coverage: String,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub premium: Option<Decimal>,
}

/// 見積内訳
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteDetails {
    pub equote_number: String,
    pub policy_name: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub life_cover: Decimal,
    pub cover_till_age: u32,
    #[serde(with = "rust_decimal::serde::float")]
    pub base_premium: Decimal,
    #[serde(rename = "add_ons", with = "rust_decimal::serde::float")]
    pub add_ons_total: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub base_plus_addons: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub gst: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_amount: Decimal,
    #[serde(
        rename = "premium_from_second_year",
        with = "rust_decimal::serde::float_option"
    )]
    pub premium_from_year_2: Option<Decimal>,
}

impl QuoteDetails {
    /// 合計の整合性を検査する（補正はしない）
    ///
    /// - total_amount == base_plus_addons + gst
    /// - base_plus_addons == base_premium + add_ons
    pub fn check_totals(&self, tolerance: Decimal) -> Vec<String> {
        let mut violations = Vec::new();

        match self.base_plus_addons.checked_add(self.gst) {
            Some(expected) if approx_eq(self.total_amount, expected, tolerance) => {}
            Some(_) => violations.push(format!(
                "total_amount {} != base_plus_addons {} + gst {}",
                self.total_amount, self.base_plus_addons, self.gst
            )),
            None => violations.push(format!(
                "total_amount: base_plus_addons {} + gst {} out of range",
                self.base_plus_addons, self.gst
            )),
        }

        match self.base_premium.checked_add(self.add_ons_total) {
            Some(expected) if approx_eq(self.base_plus_addons, expected, tolerance) => {}
            Some(_) => violations.push(format!(
                "base_plus_addons {} != base_premium {} + add_ons {}",
                self.base_plus_addons, self.base_premium, self.add_ons_total
            )),
            None => violations.push(format!(
                "base_plus_addons: base_premium {} + add_ons {} out of range",
                self.base_premium, self.add_ons_total
            )),
        }

        violations
    }

    /// 見積ページの抽出値から作る。必須項目が欠けていれば欠けた項目名を返す
    pub fn from_extracted(fields: &Extracted) -> Result<Self, Vec<&'static str>> {
        let mut missing = Vec::new();

        let mut text = |field: Field| {
            let value = fields.text(field);
            if value.is_none() {
                missing.push(field.name());
            }
            value
        };
        let equote_number = text(Field::EquoteNumber);
        let policy_name = text(Field::PolicyName);

        let mut amount = |field: Field| {
            let value = fields.amount(field);
            if value.is_none() {
                missing.push(field.name());
            }
            value
        };
        let life_cover = amount(Field::LifeCover);
        let base_premium = amount(Field::BasePremium);
        let add_ons_total = amount(Field::AddOnsTotal);
        let base_plus_addons = amount(Field::BasePlusAddons);
        let gst = amount(Field::Gst);
        let total_amount = amount(Field::TotalAmount);

        let cover_till_age = fields
            .integer(Field::CoverTillAge)
            .and_then(|age| u32::try_from(age).ok());
        if cover_till_age.is_none() {
            missing.push(Field::CoverTillAge.name());
        }

        match (
            equote_number,
            policy_name,
            life_cover,
            cover_till_age,
            base_premium,
            add_ons_total,
            base_plus_addons,
            gst,
            total_amount,
        ) {
            (
                Some(equote_number),
                Some(policy_name),
                Some(life_cover),
                Some(cover_till_age),
                Some(base_premium),
                Some(add_ons_total),
                Some(base_plus_addons),
                Some(gst),
                Some(total_amount),
            ) => Ok(Self {
                equote_number,
                policy_name,
                life_cover,
                cover_till_age,
                base_premium,
                add_ons_total,
                base_plus_addons,
                gst,
                total_amount,
                premium_from_year_2: fields.amount(Field::PremiumFromSecondYear),
            }),
            _ => Err(missing),
        }
    }
}

/// 出力の1件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRecord {
    pub source_url: String,
    pub source_scrape_date: NaiveDate,
    pub insurer: String,
    pub plan_name: String,
    pub plan_type: String,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub monthly_premium: Option<Decimal>,
    pub medical_required: bool,
    pub smoker_premium_diff: bool,
    pub add_on_riders: Vec<Rider>,
    pub quote_details: Option<QuoteDetails>,
    /// 診断メモ（ログ・サマリー用。JSONには出さない）
    #[serde(skip)]
    pub notes: Vec<String>,
}

/// 1プラン分の抽出結果
#[derive(Debug, Clone, Default)]
pub struct PlanExtraction {
    pub detail: Extracted,
    /// 見積ページ（QuoteRendered のときのみ）
    pub quote: Option<Extracted>,
    pub riders: Vec<Rider>,
    pub notes: Vec<String>,
}

/// URLのスラッグからプラン名を作る
///
/// `.../smart-term-plan-plus-plan` → `"<brand> Smart Term Plan Plus Plan"`
pub fn plan_name_from_url(url: &str, brand: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let slug = path.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
    let slug = PLAN_SUFFIX_RE.replace(slug, "");

    let titled = slug
        .split('-')
        .filter(|w| !w.is_empty())
        .map(title_case)
        .collect::<Vec<_>>()
        .join(" ");
    let cleaned = SLUG_NOISE_RE.replace_all(&titled, "");
    let name = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");

    format!("{} {} Plan", brand, name)
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// 保険会社名からブランド名（末尾の " Insurance" を除く）
fn brand_of(insurer: &str) -> &str {
    insurer.strip_suffix(" Insurance").unwrap_or(insurer)
}

/// レコード組み立て
#[derive(Debug, Clone)]
pub struct RecordAssembler {
    insurer: String,
    tolerance: Decimal,
}

impl RecordAssembler {
    pub fn new(insurer: impl Into<String>) -> Self {
        Self {
            insurer: insurer.into(),
            tolerance: Decimal::new(1, 2),
        }
    }

    pub fn assemble(
        &self,
        url: &str,
        scrape_date: NaiveDate,
        outcome: &NavigationOutcome,
        extraction: PlanExtraction,
    ) -> PlanRecord {
        let PlanExtraction {
            detail,
            quote,
            riders,
            notes: extraction_notes,
        } = extraction;

        let mut notes = outcome.notes.clone();
        notes.extend(detail.notes.iter().cloned());
        notes.extend(extraction_notes);

        let quote = match (outcome.state, quote) {
            (FormState::QuoteRendered, Some(quote)) => {
                notes.extend(quote.notes.iter().cloned());
                Some(quote)
            }
            (state, _) => {
                match &outcome.message {
                    Some(message) => notes.push(format!("form {}: {}", state, message)),
                    None => notes.push(format!("form {}", state)),
                }
                None
            }
        };

        let quote_details = quote.as_ref().and_then(|fields| {
            match QuoteDetails::from_extracted(fields) {
                Ok(details) => {
                    for violation in details.check_totals(self.tolerance) {
                        warn!("{}: {}", url, violation);
                        notes.push(violation);
                    }
                    Some(details)
                }
                Err(missing) => {
                    notes.push(format!("quote_details incomplete: {}", missing.join(", ")));
                    None
                }
            }
        });

        let monthly_premium = quote
            .as_ref()
            .and_then(|q| q.amount(Field::MonthlyPremium))
            .or_else(|| detail.amount(Field::MonthlyPremium));

        let plan_name = detail
            .text(Field::PlanName)
            .unwrap_or_else(|| plan_name_from_url(url, brand_of(&self.insurer)));

        let plan_type = detail
            .text(Field::PlanType)
            .unwrap_or_else(|| DEFAULT_PLAN_TYPE.to_string());

        let flag = |field: Field| {
            detail
                .flag(field)
                .or_else(|| quote.as_ref().and_then(|q| q.flag(field)))
                .unwrap_or(false)
        };

        PlanRecord {
            source_url: url.to_string(),
            source_scrape_date: scrape_date,
            insurer: self.insurer.clone(),
            plan_name,
            plan_type,
            monthly_premium,
            medical_required: flag(Field::MedicalRequired),
            smoker_premium_diff: flag(Field::SmokerPremiumDiff),
            add_on_riders: riders,
            quote_details,
            notes,
        }
    }
}
