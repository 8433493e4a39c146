//! Standard transform steps.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use uuid::Uuid;

use super::{TransformContext, TransformError, TransformStep};
use crate::core::value::{DataType, FieldValue};

/// Minimum digits in a plausible phone number.
const MIN_PHONE_DIGITS: usize = 7;

/// E.164 maximum.
const MAX_PHONE_DIGITS: usize = 15;

/// Strip leading and trailing whitespace from text values.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrimWhitespace;

impl TransformStep for TrimWhitespace {
    fn name(&self) -> &'static str {
        "trim_whitespace"
    }

    fn apply(
        &self,
        value: FieldValue,
        _hint: DataType,
        _ctx: &TransformContext<'_>,
    ) -> Result<FieldValue, TransformError> {
        Ok(match value {
            FieldValue::Text(s) if s.trim().len() != s.len() => FieldValue::Text(s.trim().to_string()),
            other => other,
        })
    }
}

/// Collapse internal runs of whitespace into a single space.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizeWhitespace;

impl TransformStep for NormalizeWhitespace {
    fn name(&self) -> &'static str {
        "normalize_whitespace"
    }

    fn apply(
        &self,
        value: FieldValue,
        _hint: DataType,
        _ctx: &TransformContext<'_>,
    ) -> Result<FieldValue, TransformError> {
        Ok(match value {
            FieldValue::Text(s) => FieldValue::Text(s.split_whitespace().collect::<Vec<_>>().join(" ")),
            other => other,
        })
    }
}

/// Normalize phone numbers to digits, with a `+country` prefix when known.
///
/// Only fields hinted as [`DataType::Phone`] are touched. Extensions
/// (`x123`, `ext. 123`, `#123`) are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizePhone;

impl TransformStep for NormalizePhone {
    fn name(&self) -> &'static str {
        "normalize_phone"
    }

    fn apply(
        &self,
        value: FieldValue,
        hint: DataType,
        ctx: &TransformContext<'_>,
    ) -> Result<FieldValue, TransformError> {
        let raw = match (&value, hint) {
            (FieldValue::Text(s), DataType::Phone) if !s.is_empty() => s.as_str(),
            (FieldValue::Int(i), DataType::Phone) => return self.apply(FieldValue::Text(i.to_string()), hint, ctx),
            _ => return Ok(value),
        };

        let lowered = raw.to_lowercase();
        let number = lowered
            .split(|c| c == 'x' || c == '#')
            .next()
            .unwrap_or_default();
        let number = number.split("ext").next().unwrap_or_default().trim();

        let international = number.starts_with('+') || number.starts_with("00");
        let mut digits: String = number.chars().filter(char::is_ascii_digit).collect();
        if number.starts_with("00") {
            digits.drain(..2);
        }

        if digits.len() < MIN_PHONE_DIGITS || digits.len() > MAX_PHONE_DIGITS {
            return Err(TransformError::new(
                ctx,
                self.name(),
                format!("'{}' has {} digits, expected {}-{}", raw, digits.len(), MIN_PHONE_DIGITS, MAX_PHONE_DIGITS),
            ));
        }

        if international {
            return Ok(FieldValue::Text(format!("+{}", digits)));
        }
        match ctx.default_country_code() {
            Some(cc) if digits.len() == 10 => Ok(FieldValue::Text(format!("+{}{}", cc, digits))),
            _ => Ok(FieldValue::Text(digits)),
        }
    }
}

/// Lowercase and validate email addresses.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizeEmail;

impl TransformStep for NormalizeEmail {
    fn name(&self) -> &'static str {
        "normalize_email"
    }

    fn apply(
        &self,
        value: FieldValue,
        hint: DataType,
        ctx: &TransformContext<'_>,
    ) -> Result<FieldValue, TransformError> {
        let raw = match (&value, hint) {
            (FieldValue::Text(s), DataType::Email) if !s.is_empty() => s,
            _ => return Ok(value),
        };
        let email = raw.trim().to_lowercase();
        if !is_plausible_email(&email) {
            return Err(TransformError::new(
                ctx,
                self.name(),
                format!("'{}' is not a valid email address", raw),
            ));
        }
        Ok(FieldValue::Text(email))
    }
}

fn is_plausible_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let mut parts = email.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !domain.contains("..")
}

/// Coerce a value into the type its mapping declares.
///
/// Empty strings become NULL. Values already of the declared type pass
/// through untouched, so coercion is idempotent.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoerceType;

impl TransformStep for CoerceType {
    fn name(&self) -> &'static str {
        "coerce_type"
    }

    fn apply(
        &self,
        value: FieldValue,
        hint: DataType,
        ctx: &TransformContext<'_>,
    ) -> Result<FieldValue, TransformError> {
        if matches!(&value, FieldValue::Text(s) if s.is_empty()) {
            return Ok(FieldValue::Null);
        }
        if value.is_null() {
            return Ok(value);
        }

        let fail = |value: &FieldValue| {
            TransformError::new(
                ctx,
                self.name(),
                format!("cannot coerce {} '{}' to {:?}", value.type_name(), value, hint),
            )
        };

        let coerced = match hint {
            DataType::Text | DataType::Email | DataType::Phone => match &value {
                FieldValue::Text(_) => Some(value.clone()),
                other => Some(FieldValue::Text(other.to_string())),
            },
            DataType::Integer => match &value {
                FieldValue::Int(_) => Some(value.clone()),
                FieldValue::Float(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                    Some(FieldValue::Int(*f as i64))
                }
                FieldValue::Decimal(d) if d.fract().is_zero() => d.to_i64().map(FieldValue::Int),
                FieldValue::Text(s) => numeric_text(s, ctx).parse::<i64>().ok().map(FieldValue::Int),
                _ => None,
            },
            DataType::Decimal => match &value {
                FieldValue::Decimal(_) => Some(value.clone()),
                FieldValue::Int(i) => Some(FieldValue::Decimal(Decimal::from(*i))),
                FieldValue::Float(f) => Decimal::try_from(*f).ok().map(FieldValue::Decimal),
                FieldValue::Text(s) => Decimal::from_str(&numeric_text(s, ctx))
                    .ok()
                    .map(FieldValue::Decimal),
                _ => None,
            },
            DataType::Float => match &value {
                FieldValue::Float(_) => Some(value.clone()),
                FieldValue::Int(i) => Some(FieldValue::Float(*i as f64)),
                FieldValue::Decimal(d) => d.to_f64().map(FieldValue::Float),
                FieldValue::Text(s) => numeric_text(s, ctx).parse::<f64>().ok().map(FieldValue::Float),
                _ => None,
            },
            DataType::Boolean => match &value {
                FieldValue::Bool(_) => Some(value.clone()),
                FieldValue::Int(0) => Some(FieldValue::Bool(false)),
                FieldValue::Int(1) => Some(FieldValue::Bool(true)),
                FieldValue::Text(s) => parse_bool(s).map(FieldValue::Bool),
                _ => None,
            },
            DataType::Date => match &value {
                FieldValue::Date(_) => Some(value.clone()),
                FieldValue::DateTime(dt) => Some(FieldValue::Date(dt.date_naive())),
                FieldValue::Text(s) => parse_date(s, ctx.month_first()).map(FieldValue::Date),
                _ => None,
            },
            DataType::DateTime => match &value {
                FieldValue::DateTime(_) => Some(value.clone()),
                FieldValue::Date(d) => d
                    .and_hms_opt(0, 0, 0)
                    .map(|naive| FieldValue::DateTime(Utc.from_utc_datetime(&naive))),
                FieldValue::Text(s) => parse_datetime(s, ctx.month_first()).map(FieldValue::DateTime),
                _ => None,
            },
            DataType::Uuid => match &value {
                FieldValue::Uuid(_) => Some(value.clone()),
                FieldValue::Text(s) => Uuid::parse_str(s).ok().map(FieldValue::Uuid),
                _ => None,
            },
        };

        coerced.ok_or_else(|| fail(&value))
    }
}

/// Strip currency symbols and grouping separators for the context's locale.
fn numeric_text(s: &str, ctx: &TransformContext<'_>) -> String {
    let s = s.trim().trim_start_matches(['$', '€', '£']).trim();
    if ctx.locale.to_ascii_lowercase().starts_with("en") {
        s.replace(',', "")
    } else if s.contains(',') && !s.contains('.') {
        s.replace(',', ".")
    } else {
        s.replace(',', "")
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" | "on" => Some(true),
        "false" | "f" | "no" | "n" | "0" | "off" => Some(false),
        _ => None,
    }
}

fn date_formats(month_first: bool) -> [&'static str; 4] {
    if month_first {
        ["%Y-%m-%d", "%m/%d/%Y", "%Y%m%d", "%d.%m.%Y"]
    } else {
        ["%Y-%m-%d", "%d/%m/%Y", "%Y%m%d", "%d.%m.%Y"]
    }
}

fn parse_date(s: &str, month_first: bool) -> Option<NaiveDate> {
    date_formats(month_first)
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
        .or_else(|| parse_datetime(s, month_first).map(|dt| dt.date_naive()))
}

fn parse_datetime(s: &str, month_first: bool) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    const NAIVE_FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
    ];
    if let Some(naive) = NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
    {
        return Some(Utc.from_utc_datetime(&naive));
    }
    date_formats(month_first)
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}
