pub mod gigachat;
pub mod ollama;
pub mod registry;
pub mod traits;

pub use gigachat::GigaChatBackend;
pub use ollama::OllamaBackend;
pub use registry::{BackendFactory, BackendRegistry};
pub use traits::{ChatBackend, ChatMessage};

const MAX_API_ERROR_CHARS: usize = 200;

/// Collapse whitespace and truncate an upstream error body for logs and errors.
pub fn sanitize_api_error(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= MAX_API_ERROR_CHARS {
        return collapsed;
    }
    let truncated: String = collapsed.chars().take(MAX_API_ERROR_CHARS).collect();
    format!("{truncated}...")
}
