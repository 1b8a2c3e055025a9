//! 金額・数値テキストの解析
//!
//! 例: "₹10,00,000", "₹ 1,234.50/month", "Rs. 120", "₹ 2 Crore", "50 Lakh"

use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use rust_decimal::Decimal;

/// 金額の小数桁
pub const AMOUNT_SCALE: u32 = 2;

static AMOUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([0-9][0-9,]*(?:\.[0-9]+)?)(?:\s*(crores?|cr|lakhs?|lacs?|l)\b)?")
        .expect("amount regex")
});

static INTEGER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9][0-9,]*").expect("integer regex"));

/// ₹表記の金額を Decimal に変換する
///
/// インド式の桁区切り（10,00,000）と Lakh / Crore 単位に対応。
pub fn parse_amount(text: &str) -> Result<Decimal, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("空のテキスト".to_string());
    }

    let caps = AMOUNT_RE
        .captures(trimmed)
        .ok_or_else(|| format!("金額が見つかりません: '{}'", text))?;

    let digits = caps[1].replace(',', "");
    let value = Decimal::from_str(&digits).map_err(|e| format!("数値変換エラー: {}", e))?;

    let multiplier = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        Some(unit) if unit.starts_with("cr") => Decimal::from(10_000_000u64),
        Some(_) => Decimal::from(100_000u64),
        None => Decimal::ONE,
    };

    value
        .checked_mul(multiplier)
        .map(|amount| amount.round_dp(AMOUNT_SCALE))
        .ok_or_else(|| format!("金額が大きすぎます: '{}'", text))
}

/// テキスト中の最初の整数（"75 yrs" → 75）
pub fn parse_integer(text: &str) -> Result<i64, String> {
    let m = INTEGER_RE
        .find(text)
        .ok_or_else(|| format!("整数が見つかりません: '{}'", text))?;
    m.as_str()
        .replace(',', "")
        .parse::<i64>()
        .map_err(|e| format!("整数変換エラー: {}", e))
}

/// 許容誤差内で一致するか（差が表現できなければ不一致）
pub fn approx_eq(a: Decimal, b: Decimal, tolerance: Decimal) -> bool {
    a.checked_sub(b)
        .is_some_and(|diff| diff.abs() <= tolerance)
}
