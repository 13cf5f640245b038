//! Transient vs fatal classification of agent failures.

use std::time::Duration;

/// Whether a failed attempt is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts, connection failures, rate limits, server errors.
    Transient,
    /// Invalid input or a permanent rejection; retrying cannot help.
    Fatal,
}

/// Marks an error as non-retryable regardless of its message.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct PermanentFailure(pub String);

impl PermanentFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Default classification for errors coming back from HTTP-backed agents.
///
/// Client errors (4xx) are fatal except 408 and 429. Anything without a
/// recognisable status is assumed transient.
pub fn classify_error(err: &anyhow::Error) -> ErrorClass {
    if err.chain().any(|e| e.is::<PermanentFailure>()) {
        return ErrorClass::Fatal;
    }

    if let Some(reqwest_err) = err
        .chain()
        .find_map(|e| e.downcast_ref::<reqwest::Error>())
    {
        if let Some(status) = reqwest_err.status() {
            return class_for_status(status.as_u16());
        }
        if reqwest_err.is_builder() {
            return ErrorClass::Fatal;
        }
        return ErrorClass::Transient;
    }

    status_in_message(&format!("{err:#}")).map_or(ErrorClass::Transient, class_for_status)
}

const STATUS_LABELS: [&str; 6] = ["http ", "http/1.1 ", "status ", "status: ", "status code ", "("];

/// First HTTP error status written the way clients report one: labelled
/// (`HTTP 503`, `status: 422`, `(429`) or followed by its reason phrase
/// (`404 Not Found`). Bare numbers such as `450ms` or `column 412` do not count.
fn status_in_message(msg: &str) -> Option<u16> {
    let bytes = msg.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        let glued = (start > 0 && bytes[start - 1].is_ascii_alphanumeric())
            || bytes.get(i).is_some_and(u8::is_ascii_alphanumeric);
        if i - start != 3 || glued {
            continue;
        }
        let Ok(code) = msg[start..i].parse::<u16>() else {
            continue;
        };
        if !(400..600).contains(&code) {
            continue;
        }

        let before = msg[..start].to_ascii_lowercase();
        let labelled = STATUS_LABELS.iter().any(|label| before.ends_with(label));
        let phrased = reqwest::StatusCode::from_u16(code)
            .ok()
            .and_then(|status| status.canonical_reason())
            .is_some_and(|reason| {
                msg[i..]
                    .strip_prefix(' ')
                    .is_some_and(|rest| rest.starts_with(reason))
            });
        if labelled || phrased {
            return Some(code);
        }
    }
    None
}

fn class_for_status(code: u16) -> ErrorClass {
    if (400..500).contains(&code) && code != 408 && code != 429 {
        ErrorClass::Fatal
    } else {
        ErrorClass::Transient
    }
}

/// Server-requested wait carried in an error message (`Retry-After: 5`).
pub fn retry_after_hint(err: &anyhow::Error) -> Option<Duration> {
    let msg = format!("{err:#}");
    let lower = msg.to_lowercase();

    for prefix in ["retry-after:", "retry_after:", "retry-after ", "retry_after "] {
        if let Some(pos) = lower.find(prefix) {
            let num: String = lower[pos + prefix.len()..]
                .trim_start()
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            if let Ok(secs) = num.parse::<f64>() {
                if let Ok(wait) = Duration::try_from_secs_f64(secs) {
                    return Some(wait);
                }
            }
        }
    }
    None
}
