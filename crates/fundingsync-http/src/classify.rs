//! Maps HTTP outcomes onto [`FundingError`].
//!
//! Rate limiting and unreachable networks are reported as
//! [`FundingError::Transport`]; callers treat those as "try again later".
//! Everything else the server says is [`FundingError::Upstream`], and bodies
//! that cannot be read are [`FundingError::Decode`]. Requests that could not
//! even be built are [`FundingError::InvalidRequest`].

use fundingsync_core::FundingError;

/// Status codes treated as rate limiting.
pub const RATE_LIMIT_STATUSES: [u16; 2] = [403, 429];

/// Longest body excerpt carried in an error message.
const EXCERPT_LEN: usize = 200;

/// Case-insensitive search for any rate-limit marker in `body`.
pub fn mentions_rate_limit(body: &str, markers: &[String]) -> bool {
    let lower = body.to_ascii_lowercase();
    markers
        .iter()
        .filter(|m| !m.is_empty())
        .any(|m| lower.contains(&m.to_ascii_lowercase()))
}

/// Classify a non-2xx response.
pub fn classify_status(status: u16, body: &str, markers: &[String]) -> FundingError {
    if RATE_LIMIT_STATUSES.contains(&status) || mentions_rate_limit(body, markers) {
        return FundingError::transport(format!("HTTP {status}: {}", excerpt(body)));
    }
    FundingError::Upstream {
        status,
        message: excerpt(body),
    }
}

/// Classify a 2xx response whose envelope reports `success: false`.
pub fn classify_rejection(status: u16, message: &str, markers: &[String]) -> FundingError {
    if mentions_rate_limit(message, markers) {
        return FundingError::transport(format!("HTTP {status}: {}", excerpt(message)));
    }
    FundingError::Upstream {
        status,
        message: excerpt(message),
    }
}

/// Classify a failure to send the request or read the response.
///
/// Connection refusals, DNS failures and timeouts are transport. A request
/// that never left the client (malformed URL, bad header) is not.
pub fn classify_request(error: &reqwest::Error) -> FundingError {
    if error.is_builder() {
        return FundingError::InvalidRequest(error.to_string());
    }
    let kind = if error.is_timeout() {
        "timeout"
    } else if error.is_connect() {
        "connect"
    } else {
        "request"
    };
    FundingError::transport(format!("{kind}: {error}"))
}

pub fn classify_decode(error: &serde_json::Error, body: &str) -> FundingError {
    FundingError::Decode(format!("{error} (body: {})", excerpt(body)))
}

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(EXCERPT_LEN) {
        Some((cut, _)) => format!("{}…", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers() -> Vec<String> {
        vec!["rate limit".into(), "Too Many Requests".into()]
    }

    #[test]
    fn forbidden_and_429_are_transport() {
        assert!(classify_status(403, "", &markers()).is_transport());
        assert!(classify_status(429, "slow down", &markers()).is_transport());
    }

    #[test]
    fn marker_in_body_is_transport() {
        let err = classify_status(503, "Error: RATE LIMIT reached", &markers());
        assert!(err.is_transport());
        let err = classify_rejection(200, "too many requests", &markers());
        assert!(err.is_transport());
    }

    #[test]
    fn other_statuses_are_upstream() {
        let err = classify_status(404, "user not found", &markers());
        assert_eq!(
            err,
            FundingError::Upstream {
                status: 404,
                message: "user not found".into()
            }
        );
        assert!(!classify_rejection(200, "invalid wallet", &markers()).is_transport());
    }

    #[test]
    fn empty_markers_never_match() {
        assert!(!mentions_rate_limit("anything", &[String::new()]));
    }

    #[tokio::test]
    async fn malformed_url_is_not_transport() {
        let error = reqwest::Client::new().get("not a url").send().await.unwrap_err();
        let err = classify_request(&error);
        assert!(matches!(err, FundingError::InvalidRequest(_)));
        assert!(!err.is_transport());
    }

    #[test]
    fn long_bodies_are_cut() {
        let body = "x".repeat(1_000);
        match classify_status(500, &body, &[]) {
            FundingError::Upstream { message, .. } => {
                assert_eq!(message.chars().count(), EXCERPT_LEN + 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decode_errors_carry_the_body() {
        let err = serde_json::from_str::<serde_json::Value>("<html>").unwrap_err();
        match classify_decode(&err, "<html>") {
            FundingError::Decode(msg) => assert!(msg.contains("<html>")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
