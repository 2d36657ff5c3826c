// 🧯 Error taxonomy
// Transport failures are recovered at the fetcher boundary; everything else
// propagates as anyhow::Error with context.

use thiserror::Error;

/// Failure of a single upstream request.
///
/// Never escapes the fetcher: it is logged and turned into a partial
/// outcome (see `fetcher::FetchOutcome::complete`).
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection refused, DNS failure, TLS error, ...
    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },

    /// The per-request timeout elapsed.
    #[error("request to {url} timed out")]
    Timeout { url: String },

    /// Upstream answered with a non-success status.
    #[error("{url} answered HTTP {status}")]
    Status { url: String, status: u16 },

    /// Body could not be decoded as the expected JSON envelope.
    #[error("could not decode response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl FetchError {
    pub fn url(&self) -> &str {
        match self {
            FetchError::Transport { url, .. }
            | FetchError::Timeout { url }
            | FetchError::Status { url, .. }
            | FetchError::Decode { url, .. } => url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_url_and_status() {
        let err = FetchError::Status {
            url: "https://example.org/records".to_string(),
            status: 503,
        };

        assert_eq!(err.to_string(), "https://example.org/records answered HTTP 503");
        assert_eq!(err.url(), "https://example.org/records");
    }
}
