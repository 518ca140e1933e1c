use std::fmt;

/// Prices and balances are integer cents; the marketplace only deals in USD.
/// $19.99 is stored as 1999.
pub type Cents = i64;

pub const CURRENCY: &str = "USD";

/// Plain decimal rendering: 1999 -> "19.99", -5 -> "-0.05".
pub fn format_cents(cents: Cents) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

/// Display form used everywhere a price is shown to a user: "$19.99".
pub fn format_price(cents: Cents) -> String {
    if cents < 0 {
        format!("-${}", format_cents(-cents))
    } else {
        format!("${}", format_cents(cents))
    }
}

/// Parse user input such as "19.99", "$15", "0.5" or "20." into cents.
/// Digits past the second decimal place are truncated.
pub fn parse_cents(input: &str) -> Result<Cents, ParseCentsError> {
    let trimmed = input.trim();
    let (negative, unsigned) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    let unsigned = unsigned.strip_prefix('$').unwrap_or(unsigned);
    if unsigned.is_empty() {
        return Err(ParseCentsError::Empty);
    }

    let (whole, fraction) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    if whole.is_empty() && fraction.is_empty() {
        return Err(ParseCentsError::InvalidFormat);
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit())
    {
        return Err(ParseCentsError::InvalidFormat);
    }

    let units: i64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| ParseCentsError::InvalidFormat)?
    };

    let mut digits = fraction.chars().take(2);
    let tens = digits.next().and_then(|c| c.to_digit(10)).unwrap_or(0) as i64;
    let ones = digits.next().and_then(|c| c.to_digit(10)).unwrap_or(0) as i64;

    let cents = units
        .checked_mul(100)
        .and_then(|c| c.checked_add(tens * 10 + ones))
        .ok_or(ParseCentsError::Overflow)?;

    Ok(if negative { -cents } else { cents })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseCentsError {
    Empty,
    InvalidFormat,
    Overflow,
}

impl fmt::Display for ParseCentsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseCentsError::Empty => write!(f, "empty amount"),
            ParseCentsError::InvalidFormat => write!(f, "invalid money format"),
            ParseCentsError::Overflow => write!(f, "amount too large"),
        }
    }
}

impl std::error::Error for ParseCentsError {}
