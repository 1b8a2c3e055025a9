//! フィールド抽出
//!
//! `SiteLayout` の規則（セレクタ＋正規表現＋変換）を描画済みページに適用する。
//! 読み取り以外の副作用はない。テキストはあるが変換できない場合は
//! 値なし＋診断メモとし、プラン処理は中断しない。

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use rust_decimal::Decimal;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};

use crate::error::ScraperError;
use crate::layout::{Coercion, Field, FieldRule, RiderRule, SiteLayout};
use crate::money::{parse_amount, parse_integer};
use crate::page::{element_text, parse_selector, Snapshot};
use crate::record::Rider;

/// 行テキストの区切り（改行、またはカンマ＋空白。₹10,00,000 の桁区切りは分割しない）
static ROW_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\n\s*|,\s+").expect("row split regex"));

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// 型付きの抽出値
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Amount(Decimal),
    Integer(i64),
    Flag(bool),
}

/// 抽出結果と診断メモ
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extracted {
    values: BTreeMap<Field, Value>,
    pub notes: Vec<String>,
}

impl Extracted {
    pub fn get(&self, field: Field) -> Option<&Value> {
        self.values.get(&field)
    }

    pub fn text(&self, field: Field) -> Option<String> {
        match self.values.get(&field)? {
            Value::Text(s) => Some(s.clone()),
            Value::Amount(d) => Some(d.to_string()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Flag(b) => Some(b.to_string()),
        }
    }

    pub fn amount(&self, field: Field) -> Option<Decimal> {
        match self.values.get(&field)? {
            Value::Amount(d) => Some(*d),
            Value::Integer(i) => Some(Decimal::from(*i)),
            _ => None,
        }
    }

    pub fn integer(&self, field: Field) -> Option<i64> {
        match self.values.get(&field)? {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn flag(&self, field: Field) -> Option<bool> {
        match self.values.get(&field)? {
            Value::Flag(b) => Some(*b),
            _ => None,
        }
    }
}

struct CompiledRule {
    selector: Selector,
    pattern: Option<Regex>,
    coercion: Coercion,
}

impl CompiledRule {
    fn compile(field: Field, rule: &FieldRule) -> Result<Self, ScraperError> {
        let pattern = rule
            .pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| ScraperError::Layout(format!("{}: {}", field.name(), e)))?;

        Ok(Self {
            selector: parse_selector(&rule.selector)?,
            pattern,
            coercion: rule.coercion.clone(),
        })
    }

    /// 対象テキストを探す（正規表現があれば最初にマッチした要素のキャプチャ）
    fn locate(&self, elements: &[ElementRef<'_>]) -> Option<String> {
        match &self.pattern {
            None => elements.first().map(|el| element_text(*el)),
            Some(re) => elements.iter().find_map(|el| {
                let text = element_text(*el);
                let caps = re.captures(&text)?;
                let m = caps.get(1).or_else(|| caps.get(0))?;
                Some(m.as_str().trim().to_string())
            }),
        }
    }

    fn apply(&self, field: Field, doc: &Html) -> Result<Option<Value>, ScraperError> {
        let elements: Vec<ElementRef<'_>> = doc.select(&self.selector).collect();

        if let Coercion::Mentions(word) = &self.coercion {
            if elements.is_empty() {
                return Ok(None);
            }
            let word = word.to_lowercase();
            let mentioned = elements
                .iter()
                .any(|el| element_text(*el).to_lowercase().contains(&word));
            return Ok(Some(Value::Flag(mentioned)));
        }

        let Some(text) = self.locate(&elements) else {
            return Ok(None);
        };

        let coercion_error = || ScraperError::FieldCoercion {
            field: field.name().to_string(),
            text: text.clone(),
        };

        let value = match &self.coercion {
            Coercion::Text => {
                let normalized = WHITESPACE_RE.replace_all(text.trim(), " ").to_string();
                if normalized.is_empty() {
                    return Ok(None);
                }
                Value::Text(normalized)
            }
            Coercion::Amount => Value::Amount(parse_amount(&text).map_err(|_| coercion_error())?),
            Coercion::Integer => Value::Integer(parse_integer(&text).map_err(|_| coercion_error())?),
            Coercion::Flag => Value::Flag(parse_flag(&text).ok_or_else(coercion_error)?),
            Coercion::Mentions(_) => unreachable!("handled above"),
        };

        Ok(Some(value))
    }
}

/// "Yes"/"No" 等の真偽表記。テキストなし（アイコンのみ）は存在＝true
fn parse_flag(text: &str) -> Option<bool> {
    let normalized = text.trim().to_lowercase();
    match normalized.as_str() {
        "" | "yes" | "y" | "true" | "required" | "✓" | "✔" => Some(true),
        "no" | "n" | "false" | "not required" | "✗" | "✘" => Some(false),
        _ => None,
    }
}

struct CompiledRiderRule {
    row: Selector,
    name: Selector,
    coverage: Selector,
    premium: Selector,
}

impl CompiledRiderRule {
    fn compile(rule: &RiderRule) -> Result<Self, ScraperError> {
        Ok(Self {
            row: parse_selector(&rule.row)?,
            name: parse_selector(&rule.name)?,
            coverage: parse_selector(&rule.coverage)?,
            premium: parse_selector(&rule.premium)?,
        })
    }
}

fn first_text(row: ElementRef<'_>, selector: &Selector) -> Option<String> {
    row.select(selector)
        .next()
        .map(element_text)
        .map(|t| WHITESPACE_RE.replace_all(&t, " ").trim().to_string())
        .filter(|t| !t.is_empty())
}

/// レイアウトからコンパイルした抽出器
pub struct FieldExtractor {
    detail: Vec<(Field, CompiledRule)>,
    quote: Vec<(Field, CompiledRule)>,
    riders: CompiledRiderRule,
}

impl FieldExtractor {
    /// セレクタ・正規表現を事前に検証してコンパイル
    pub fn new(layout: &SiteLayout) -> Result<Self, ScraperError> {
        let compile = |rules: &BTreeMap<Field, FieldRule>| {
            rules
                .iter()
                .map(|(field, rule)| Ok((*field, CompiledRule::compile(*field, rule)?)))
                .collect::<Result<Vec<_>, ScraperError>>()
        };

        Ok(Self {
            detail: compile(&layout.detail_fields)?,
            quote: compile(&layout.quote_fields)?,
            riders: CompiledRiderRule::compile(&layout.riders)?,
        })
    }

    /// 詳細ページのフィールド
    pub fn extract_detail(&self, snapshot: &Snapshot) -> Extracted {
        Self::extract_with(&self.detail, snapshot)
    }

    /// 見積結果ページのフィールド
    pub fn extract_quote(&self, snapshot: &Snapshot) -> Extracted {
        Self::extract_with(&self.quote, snapshot)
    }

    fn extract_with(rules: &[(Field, CompiledRule)], snapshot: &Snapshot) -> Extracted {
        let doc = snapshot.document();
        let mut extracted = Extracted::default();

        for (field, rule) in rules {
            match rule.apply(*field, &doc) {
                Ok(Some(value)) => {
                    debug!("{}: {:?}", field.name(), value);
                    extracted.values.insert(*field, value);
                }
                Ok(None) => debug!("{}: not found on {}", field.name(), snapshot.url),
                Err(e) => {
                    warn!("{} on {}", e, snapshot.url);
                    extracted.notes.push(e.to_string());
                }
            }
        }

        extracted
    }

    /// 特約一覧（DOM順）
    ///
    /// 行に名称・補償額・保険料の子要素がなければ行テキストを分割して読む。
    pub fn extract_riders(&self, snapshot: &Snapshot, notes: &mut Vec<String>) -> Vec<Rider> {
        let doc = snapshot.document();
        let rule = &self.riders;
        let mut riders = Vec::new();

        for (idx, row) in doc.select(&rule.row).enumerate() {
            let mut name = first_text(row, &rule.name);
            let mut coverage = first_text(row, &rule.coverage);
            let mut premium_text = first_text(row, &rule.premium);

            if name.is_none() && coverage.is_none() && premium_text.is_none() {
                let row_text = element_text(row);
                let mut parts = ROW_SPLIT_RE
                    .split(row_text.trim())
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string);
                name = parts.next();
                coverage = parts.next();
                premium_text = parts.next();
                debug!("Rider row {} read from text: {:?}", idx, row_text);
            }

            let Some(name) = name else {
                notes.push(format!("rider row {}: no name", idx));
                continue;
            };

            let premium = match premium_text.as_deref().map(parse_amount) {
                Some(Ok(amount)) => Some(amount),
                Some(Err(_)) => {
                    let err = ScraperError::FieldCoercion {
                        field: format!("add_on_riders[{}].premium", idx),
                        text: premium_text.unwrap_or_default(),
                    };
                    warn!("{} on {}", err, snapshot.url);
                    notes.push(err.to_string());
                    None
                }
                None => None,
            };

            riders.push(Rider {
                name,
                coverage: coverage.unwrap_or_default(),
                premium,
            });
        }

        riders
    }
}
