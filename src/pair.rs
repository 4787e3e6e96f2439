use serde::{Deserialize, Serialize};
use std::fmt;

use crate::Error;

const DEFAULT_QUOTE: &str = "USDT";

/// Base/quote pair, e.g. `BTC/USDT`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TradingPair {
    pub base: String,
    pub quote: String,
}

impl TradingPair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into().trim().to_ascii_uppercase(),
            quote: quote.into().trim().to_ascii_uppercase(),
        }
    }

    /// Accepts `BASE/QUOTE`, `BASEUSDT`, or falls back to treating the first
    /// three characters as the base.
    pub fn parse(symbol: &str) -> Result<Self, Error> {
        let symbol = symbol.trim().to_ascii_uppercase();
        if symbol.is_empty() {
            return Err(Error::validation("pair is required"));
        }

        if let Some((base, quote)) = symbol.split_once('/') {
            if base.is_empty() || quote.is_empty() {
                return Err(Error::validation(format!("malformed pair: {symbol}")));
            }
            return Ok(Self::new(base, quote));
        }

        if let Some(base) = symbol.strip_suffix(DEFAULT_QUOTE) {
            if base.is_empty() {
                return Err(Error::validation(format!("missing base asset: {symbol}")));
            }
            return Ok(Self::new(base, DEFAULT_QUOTE));
        }

        if symbol.len() > 3 && symbol.is_char_boundary(3) {
            let (base, quote) = symbol.split_at(3);
            return Ok(Self::new(base, quote));
        }

        Err(Error::validation(format!("cannot split pair: {symbol}")))
    }

    /// Explicit assets win over whatever the symbol parses to.
    pub fn resolve(
        symbol: &str,
        base: Option<&str>,
        quote: Option<&str>,
    ) -> Result<Self, Error> {
        let base = base.map(str::trim).filter(|s| !s.is_empty());
        let quote = quote.map(str::trim).filter(|s| !s.is_empty());
        match (base, quote) {
            (Some(b), Some(q)) => Ok(Self::new(b, q)),
            _ => {
                let parsed = Self::parse(symbol)?;
                Ok(Self::new(
                    base.unwrap_or(&parsed.base),
                    quote.unwrap_or(&parsed.quote),
                ))
            }
        }
    }

    pub fn symbol(&self) -> String {
        format!("{}/{}", self.base, self.quote)
    }
}

impl fmt::Display for TradingPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}
