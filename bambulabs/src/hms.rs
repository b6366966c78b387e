//! Health management system (HMS) entries as they appear in reports.

use serde::{Deserialize, Serialize};

/// One active fault in the `hms` list of a report.
///
/// Current firmware sends a pair of 32-bit integers. Older firmware and some
/// bridges send the already formatted code instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HmsEntry {
    /// The numeric form, `{"attr": .., "code": ..}`.
    Coded {
        /// Module and part identifier.
        attr: u32,
        /// Error identifier.
        code: u32,
    },
    /// An object carrying a formatted code.
    Labelled {
        /// The formatted code.
        code: String,
    },
    /// A bare formatted code.
    Text(String),
}

impl HmsEntry {
    /// The code in its `XXXX-XXXX-XXXX-XXXX` form, upper-cased.
    pub fn code_string(&self) -> String {
        match self {
            HmsEntry::Coded { attr, code } => format!(
                "{:04X}-{:04X}-{:04X}-{:04X}",
                attr >> 16,
                attr & 0xFFFF,
                code >> 16,
                code & 0xFFFF
            ),
            HmsEntry::Labelled { code } | HmsEntry::Text(code) => code.trim().to_uppercase(),
        }
    }
}

/// Format the generic `print_error` integer the way the firmware displays it.
///
/// Values that do not fit in 32 bits are kept in decimal.
pub fn format_print_error(error: i64) -> String {
    match u32::try_from(error) {
        Ok(error) => format!("{:04X}-{:04X}", error >> 16, error & 0xFFFF),
        Err(_) => error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_numeric_entry() {
        let entry: HmsEntry = serde_json::from_str(r#"{"attr": 117440512, "code": 131074}"#).unwrap();
        assert_eq!(entry.code_string(), "0700-0000-0002-0002");
    }

    #[test]
    fn test_string_entries() {
        let text: HmsEntry = serde_json::from_str(r#"" 0300-0100-0001-0001 ""#).unwrap();
        assert_eq!(text.code_string(), "0300-0100-0001-0001");

        let labelled: HmsEntry = serde_json::from_str(r#"{"code": "0500-0100-0001-0002"}"#).unwrap();
        assert_eq!(labelled.code_string(), "0500-0100-0001-0002");
    }

    #[test]
    fn test_print_error() {
        assert_eq!(format_print_error(0x0300_8003), "0300-8003");
        assert_eq!(format_print_error(-1), "-1");
        assert_eq!(format_print_error(0x1_0000_0000), "4294967296");
    }
}
