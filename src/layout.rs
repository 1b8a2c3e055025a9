//! サイト構造の宣言的定義
//!
//! セレクタ・正規表現・変換規則はすべてデータとして保持する。
//! サイト側の構造変更はこの定義（またはJSONで渡すレイアウトファイル）の
//! 差し替えで対応し、抽出ロジックには手を入れない。

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::ApplicantProfile;
use crate::error::ScraperError;

/// 抽出対象フィールド
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    PlanName,
    PlanType,
    MonthlyPremium,
    MedicalRequired,
    SmokerPremiumDiff,
    EquoteNumber,
    PolicyName,
    LifeCover,
    CoverTillAge,
    BasePremium,
    AddOnsTotal,
    BasePlusAddons,
    Gst,
    TotalAmount,
    PremiumFromSecondYear,
}

impl Field {
    pub fn name(&self) -> &'static str {
        match self {
            Field::PlanName => "plan_name",
            Field::PlanType => "plan_type",
            Field::MonthlyPremium => "monthly_premium",
            Field::MedicalRequired => "medical_required",
            Field::SmokerPremiumDiff => "smoker_premium_diff",
            Field::EquoteNumber => "equote_number",
            Field::PolicyName => "policy_name",
            Field::LifeCover => "life_cover",
            Field::CoverTillAge => "cover_till_age",
            Field::BasePremium => "base_premium",
            Field::AddOnsTotal => "add_ons",
            Field::BasePlusAddons => "base_plus_addons",
            Field::Gst => "gst",
            Field::TotalAmount => "total_amount",
            Field::PremiumFromSecondYear => "premium_from_second_year",
        }
    }
}

/// テキスト→型付き値の変換規則
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "arg", rename_all = "snake_case")]
pub enum Coercion {
    /// 空白を正規化した文字列
    Text,
    /// ₹金額 → Decimal
    Amount,
    /// 最初の整数
    Integer,
    /// "Yes"/"No" 等の真偽表記。テキストのない要素（アイコン）は存在すれば true
    Flag,
    /// マッチした全要素のテキストに語が含まれるか（大文字小文字無視）
    Mentions(String),
}

/// 1フィールドの抽出規則
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    pub selector: String,
    /// 要素テキストに適用する正規表現（キャプチャ1があればそれを採用）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    pub coercion: Coercion,
}

impl FieldRule {
    pub fn new(selector: impl Into<String>, coercion: Coercion) -> Self {
        Self {
            selector: selector.into(),
            pattern: None,
            coercion,
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }
}

/// 特約（ライダー）行の抽出規則
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiderRule {
    /// 行要素（DOM順に列挙）
    pub row: String,
    pub name: String,
    pub coverage: String,
    pub premium: String,
}

/// 一覧ページのプランリンク
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingLayout {
    pub plan_link: String,
    /// 対象とするパスの接頭辞
    #[serde(default)]
    pub path_prefix: Option<String>,
    /// href に含まれていたら除外する語
    #[serde(default)]
    pub excluded_terms: Vec<String>,
}

/// 申込者プロファイルの項目
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileField {
    Age,
    Gender,
    AnnualIncome,
    CoverAmount,
    TermYears,
    /// 年齢 + 保険期間
    CoverTillAge,
    Smoker,
    FirstName,
    MiddleName,
    LastName,
    Email,
    Pincode,
    /// 同意チェックボックス（クリックのみ）
    Consent,
}

impl ProfileField {
    /// フォームに入力する値
    pub fn value(&self, profile: &ApplicantProfile) -> String {
        match self {
            ProfileField::Age => profile.age.to_string(),
            ProfileField::Gender => profile.gender.code().to_string(),
            ProfileField::AnnualIncome => profile.annual_income.trunc().to_string(),
            ProfileField::CoverAmount => profile.cover_amount.trunc().to_string(),
            ProfileField::TermYears => profile.term_years.to_string(),
            ProfileField::CoverTillAge => (profile.age + profile.term_years).to_string(),
            ProfileField::Smoker => {
                let answer = if profile.smoker { "Yes" } else { "No" };
                answer.to_string()
            }
            ProfileField::FirstName => profile.contact.first_name.clone(),
            ProfileField::MiddleName => profile.contact.middle_name.clone(),
            ProfileField::LastName => profile.contact.last_name.clone(),
            ProfileField::Email => profile.contact.email.clone(),
            ProfileField::Pincode => profile.contact.pincode.clone(),
            ProfileField::Consent => "Yes".to_string(),
        }
    }
}

/// 入力方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputAction {
    /// テキスト入力
    Fill,
    /// ラベル・ラジオのクリック（セレクタ中の `{value}` を値で置換）
    Click,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormInput {
    pub field: ProfileField,
    pub selector: String,
    pub action: InputAction,
}

impl FormInput {
    /// `{value}` を置換したセレクタ
    pub fn resolved_selector(&self, value: &str) -> String {
        self.selector.replace("{value}", value)
    }
}

/// 送信後に出ることがある中間ポップアップ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interstitial {
    pub marker: String,
    pub proceed: String,
}

/// 最初のフォーム送信後に続くページ（特約選択・申込者情報など）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormStep {
    /// ログ用の名前
    pub name: String,
    /// このページが表示されたことの判定
    pub marker: String,
    #[serde(default)]
    pub inputs: Vec<FormInput>,
    /// 次へ進むボタン
    pub submit: String,
    /// 進む前にページを固定し、特約の抽出元にする
    #[serde(default)]
    pub capture_riders: bool,
}

/// 見積フォーム
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteFormLayout {
    /// フォーム表示の判定
    pub form: String,
    pub inputs: Vec<FormInput>,
    pub submit: String,
    /// 送信後、見積表示までに順に通るページ。見積が先に出たら残りは飛ばす
    #[serde(default)]
    pub steps: Vec<FormStep>,
    /// 見積結果の表示
    pub quote_marker: String,
    /// バリデーションエラーの表示
    pub error_marker: String,
    #[serde(default)]
    pub interstitial: Option<Interstitial>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteLayout {
    pub listing: ListingLayout,
    pub quote_form: QuoteFormLayout,
    pub detail_fields: BTreeMap<Field, FieldRule>,
    pub quote_fields: BTreeMap<Field, FieldRule>,
    pub riders: RiderRule,
}

impl SiteLayout {
    /// JSONファイルから読み込む
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ScraperError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| ScraperError::Layout(e.to_string()))
    }
}

// 金額ラベルの後ろの値（₹・数字・単位）
const AMOUNT_VALUE: &str = r"(₹?\s*[0-9][0-9,.]*(?:\s*(?:crores?|cr|lakhs?|lacs?))?)";

// 見積番号: ラベルと同じ行か直後の1行。数字を含まない語（次のラベル）は拾わない
const EQUOTE_PATTERN: &str =
    r"(?i)e-?quote[^\S\n]*(?:number|no\.?)?[^\S\n]*:?[^\S\n]*\n?[^\S\n]*([A-Z0-9-]*[0-9][A-Z0-9-]*)";

fn labelled_amount(label: &str) -> String {
    format!(r"(?i){}[^₹0-9]*{}", label, AMOUNT_VALUE)
}

fn fill(field: ProfileField, selector: &str) -> FormInput {
    FormInput {
        field,
        selector: selector.to_string(),
        action: InputAction::Fill,
    }
}

// 保障期間 → 特約選択 → 申込者情報 → 確認
fn default_steps() -> Vec<FormStep> {
    vec![
        FormStep {
            name: "cover options".to_string(),
            marker: ".jsx-1782489574".to_string(),
            inputs: vec![FormInput {
                field: ProfileField::CoverTillAge,
                selector: "label[for='{value}']".to_string(),
                action: InputAction::Click,
            }],
            submit: "button#viewPlans".to_string(),
            capture_riders: false,
        },
        FormStep {
            name: "riders".to_string(),
            marker: "div.rider-container".to_string(),
            inputs: Vec::new(),
            submit: "button#viewPlans".to_string(),
            capture_riders: true,
        },
        FormStep {
            name: "applicant details".to_string(),
            marker: "input#firstName".to_string(),
            inputs: vec![
                fill(ProfileField::FirstName, "input#firstName"),
                fill(ProfileField::MiddleName, "input#middleName"),
                fill(ProfileField::LastName, "input#lastName"),
                fill(ProfileField::Email, "input#email"),
                fill(ProfileField::AnnualIncome, "input#eligibilityAnnualIncome"),
                fill(ProfileField::Pincode, "input#pincode"),
                FormInput {
                    field: ProfileField::Consent,
                    selector: "input[type='checkbox']".to_string(),
                    action: InputAction::Click,
                },
            ],
            submit: "button[type='submit']".to_string(),
            capture_riders: false,
        },
        FormStep {
            name: "confirm".to_string(),
            marker: "button#viewPlans.unified-button-primary".to_string(),
            inputs: Vec::new(),
            submit: "button#viewPlans.unified-button-primary".to_string(),
            capture_riders: false,
        },
    ]
}

impl Default for SiteLayout {
    fn default() -> Self {
        let quote_card = "div.px-2.card";

        let mut detail_fields = BTreeMap::new();
        detail_fields.insert(Field::PlanName, FieldRule::new("h1", Coercion::Text));
        detail_fields.insert(
            Field::PlanType,
            FieldRule::new(".plan-type, [data-plan-type]", Coercion::Text),
        );
        detail_fields.insert(
            Field::MonthlyPremium,
            FieldRule::new(".premium, [class*='premium-amount']", Coercion::Amount),
        );
        detail_fields.insert(
            Field::MedicalRequired,
            FieldRule::new("li, p, td, span", Coercion::Mentions("medical".to_string())),
        );
        detail_fields.insert(
            Field::SmokerPremiumDiff,
            FieldRule::new("li, p, td, span", Coercion::Mentions("smoker".to_string())),
        );

        let mut quote_fields = BTreeMap::new();
        quote_fields.insert(
            Field::MonthlyPremium,
            FieldRule::new("label[for='75'] .premium, .premium", Coercion::Amount),
        );
        quote_fields.insert(
            Field::EquoteNumber,
            FieldRule::new(quote_card, Coercion::Text)
                .with_pattern(EQUOTE_PATTERN),
        );
        quote_fields.insert(
            Field::PolicyName,
            FieldRule::new(quote_card, Coercion::Text)
                .with_pattern(r"(?i)policy\s*name\s*:?\s*([^\n]+)"),
        );
        quote_fields.insert(
            Field::LifeCover,
            FieldRule::new(quote_card, Coercion::Amount).with_pattern(labelled_amount(r"life\s*cover")),
        );
        quote_fields.insert(
            Field::CoverTillAge,
            FieldRule::new(quote_card, Coercion::Integer)
                .with_pattern(r"(?i)cover\s*till\s*age[^0-9]*([0-9]+)"),
        );
        quote_fields.insert(
            Field::BasePremium,
            FieldRule::new(quote_card, Coercion::Amount)
                .with_pattern(labelled_amount(r"base\s*premium")),
        );
        quote_fields.insert(
            Field::AddOnsTotal,
            FieldRule::new(quote_card, Coercion::Amount).with_pattern(format!(
                r"(?im)^\s*(?:monthly\s+)?add-?ons(?:\s+total)?[^₹0-9]*{}",
                AMOUNT_VALUE
            )),
        );
        quote_fields.insert(
            Field::BasePlusAddons,
            FieldRule::new(quote_card, Coercion::Amount)
                .with_pattern(labelled_amount(r"base\s*\+\s*add-?ons")),
        );
        quote_fields.insert(
            Field::Gst,
            FieldRule::new(quote_card, Coercion::Amount)
                .with_pattern(labelled_amount(r"gst\s*amount")),
        );
        quote_fields.insert(
            Field::TotalAmount,
            FieldRule::new(quote_card, Coercion::Amount)
                .with_pattern(labelled_amount(r"total\s*amount")),
        );
        quote_fields.insert(
            Field::PremiumFromSecondYear,
            FieldRule::new(quote_card, Coercion::Amount)
                .with_pattern(labelled_amount(r"premium\s*from\s*2nd\s*year")),
        );

        Self {
            listing: ListingLayout {
                plan_link: "a[href*='-plan']".to_string(),
                path_prefix: Some("/term-insurance-plans/".to_string()),
                excluded_terms: ["calculator", "claim", "settlement", "faqs", "compare"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            },
            quote_form: QuoteFormLayout {
                form: "form.quote-form, .modal-content form".to_string(),
                inputs: vec![
                    FormInput {
                        field: ProfileField::Gender,
                        selector: "label[for='gender_{value}']".to_string(),
                        action: InputAction::Click,
                    },
                    FormInput {
                        field: ProfileField::Smoker,
                        selector: "label[for='tobacco_{value}']".to_string(),
                        action: InputAction::Click,
                    },
                    FormInput {
                        field: ProfileField::Age,
                        selector: "input[name='age']".to_string(),
                        action: InputAction::Fill,
                    },
                    FormInput {
                        field: ProfileField::AnnualIncome,
                        selector: "input#eligibilityAnnualIncome".to_string(),
                        action: InputAction::Fill,
                    },
                    FormInput {
                        field: ProfileField::CoverAmount,
                        selector: "input[name='coverAmount']".to_string(),
                        action: InputAction::Fill,
                    },
                ],
                submit: "button#viewPlans".to_string(),
                steps: default_steps(),
                quote_marker: quote_card.to_string(),
                error_marker: ".error-message, .invalid-feedback, [role='alert']".to_string(),
                interstitial: Some(Interstitial {
                    marker: "div.rider-popup-content".to_string(),
                    proceed: "div.rider-popup-content button#viewPlans".to_string(),
                }),
            },
            detail_fields,
            quote_fields,
            riders: RiderRule {
                row: "div.rider-container .rider-card".to_string(),
                name: "span.title".to_string(),
                coverage: ".coverage-amount".to_string(),
                premium: ".rider-premium".to_string(),
            },
        }
    }
}
