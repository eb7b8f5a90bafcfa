use thiserror::Error;

/// Errors surfaced from the codec core.
///
/// Decode tolerates errors that occur after the main header: already
/// delivered layers and resolutions still form a valid image, and the
/// decoder returns that partial image instead of failing. Encode errors
/// are surfaced immediately and no partial codestream is emitted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum J2kError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("malformed codestream at byte {offset}: {reason}")]
    MalformedCodestream { offset: usize, reason: String },

    #[error("input truncated at byte {offset}")]
    TruncatedInput { offset: usize },

    #[error("coefficient overflow in tile {tile}, component {component}, resolution {resolution}")]
    CoefficientOverflow {
        tile: usize,
        component: usize,
        resolution: usize,
    },

    #[error("rate target of {requested} bytes is below the minimum codestream overhead of {minimum} bytes")]
    RateControlInfeasible { requested: usize, minimum: usize },

    #[error("operation cancelled")]
    Cancelled,
}

impl J2kError {
    pub(crate) fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        Self::MalformedCodestream {
            offset,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_offset() {
        let e = J2kError::malformed(42, "bad marker length");
        assert!(e.to_string().contains("42"));
        assert!(e.to_string().contains("bad marker length"));
    }
}
