//! Human-readable JSON rendering of messages for diagnostics.
//!
//! Formatting options travel as an explicit [`JsonConfig`] value instead of
//! process-wide serializer state.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Immutable JSON formatting options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JsonConfig {
    /// Pretty-print with indentation.
    pub indent: bool,
}

impl JsonConfig {
    /// Compact single-line output.
    pub const COMPACT: JsonConfig = JsonConfig { indent: false };
    /// Indented multi-line output.
    pub const PRETTY: JsonConfig = JsonConfig { indent: true };
}

/// Render `value` as JSON using `config`.
pub fn to_json<T: Serialize + ?Sized>(value: &T, config: &JsonConfig) -> Result<String> {
    let json = if config.indent {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    Ok(json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{flags, MessageHeader};

    #[test]
    fn test_compact_header() {
        let header = MessageHeader::new(4, 1, 0, flags::FINAL_PART);
        let json = to_json(&header, &JsonConfig::COMPACT).unwrap();
        assert_eq!(
            json,
            r#"{"protocol":4,"messageType":1,"correlationId":0,"messageId":0,"messageFlags":2}"#
        );
    }

    #[test]
    fn test_pretty_is_multiline() {
        let header = MessageHeader::new(4, 1, 0, flags::NONE);
        let json = to_json(&header, &JsonConfig::PRETTY).unwrap();
        assert!(json.contains('\n'));
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["protocol"], 4);
    }
}
