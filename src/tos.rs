//! Type-of-service (DSCP-ish) label mapping between human-readable class
//! names and the TOS byte sent on the wire to the measurement tool.

/// Differentiated-services class carried by a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TosClass {
    BestEffort,
    Background,
    Video,
    Voice,
}

impl TosClass {
    /// Parse a free-form label (`"BE"`, `"besteffort"`, `"0x80"`, ...) into a class.
    ///
    /// Returns `None` for anything that isn't recognized, mirroring the source's
    /// `"unset"` sentinel (spec.md §7, "Unknown TOS label").
    pub fn from_label(label: &str) -> Option<Self> {
        let norm = label.trim().to_ascii_uppercase();
        match norm.as_str() {
            "BE" | "BESTEFFORT" | "0X0" | "0" => Some(Self::BestEffort),
            "BK" | "BACKGROUND" | "0X20" => Some(Self::Background),
            "VI" | "VIDEO" | "0X80" => Some(Self::Video),
            "VO" | "VOICE" | "0XC0" => Some(Self::Voice),
            _ => None,
        }
    }

    /// The two-letter label used in the measurement-tool command line and reports.
    pub fn short_label(self) -> &'static str {
        match self {
            Self::BestEffort => "BE",
            Self::Background => "BK",
            Self::Video => "VI",
            Self::Voice => "VO",
        }
    }

    /// The TOS byte passed to the measurement tool via `-S <tos_hex>`.
    pub fn tos_byte(self) -> u8 {
        match self {
            Self::BestEffort => 0x00,
            Self::Background => 0x20,
            Self::Video => 0x80,
            Self::Voice => 0xC0,
        }
    }

    /// The hex string form used on the remote command line, e.g. `"0xC0"`.
    ///
    /// Literal per spec.md §6/§8: uppercase, and best-effort is the single
    /// digit `"0x0"` rather than a zero-padded byte.
    pub fn tos_hex(self) -> &'static str {
        match self {
            Self::BestEffort => "0x0",
            Self::Background => "0x20",
            Self::Video => "0x80",
            Self::Voice => "0xC0",
        }
    }

    /// Reverse mapping: byte -> class.
    ///
    /// The source has a well-known asymmetry here (it recognized `0x02` instead
    /// of `0x20` for `BK`, spec.md §9 open question). We resolve it as the spec
    /// recommends: `0x20` round-trips to `BK` in both directions.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::BestEffort),
            0x20 => Some(Self::Background),
            0x80 => Some(Self::Video),
            0xC0 => Some(Self::Voice),
            _ => None,
        }
    }
}

/// Convenience wrapper matching the source's free function names, for callers
/// that prefer the string-in/string-out shape.
pub fn txt_to_tos(label: &str) -> String {
    TosClass::from_label(label)
        .map(|c| c.tos_hex().to_string())
        .unwrap_or_else(|| "unset".to_string())
}

/// Convenience wrapper matching the source's free function names.
pub fn tos_to_txt(byte: u8) -> String {
    TosClass::from_byte(byte)
        .map(|c| c.short_label().to_string())
        .unwrap_or_else(|| "unset".to_string())
}
