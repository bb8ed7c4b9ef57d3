//! Capture resolution parsing

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::Error;

/// Frame dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Parse a JSON resize value: either `"WIDTHxHEIGHT"` or `[width, height]`
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => s.parse().ok(),
            Value::Array(items) if items.len() == 2 => {
                let width = items[0].as_u64().and_then(|w| u32::try_from(w).ok())?;
                let height = items[1].as_u64().and_then(|h| u32::try_from(h).ok())?;
                Some(Self::new(width, height))
            }
            _ => None,
        }
    }

    /// Resolve an optional resize request, falling back to `native`
    ///
    /// Missing or unparseable input never fails the request; a warning is
    /// logged when something was supplied but could not be understood.
    pub fn resolve(value: Option<&Value>, native: Resolution) -> Self {
        match value {
            None | Some(Value::Null) => native,
            Some(v) => Self::from_value(v).unwrap_or_else(|| {
                tracing::warn!(
                    resize = %v,
                    fallback = %native,
                    "Unparseable resize, using native resolution"
                );
                native
            }),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::Configuration(format!("invalid resolution {:?}", s));
        let (w, h) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let width = w.trim().parse().map_err(|_| invalid())?;
        let height = h.trim().parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self::new(width, height))
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self::new(width, height)
    }
}
