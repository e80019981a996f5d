use crate::llm::ClarifyAnswers;
use sha2::{Digest, Sha256};

/// Stable hex digest of (query, schema preview, clarify answers).
///
/// Fields are length-prefixed so that moving text between the query and
/// the preview changes the digest. Answers are hashed in key order.
pub fn request_fingerprint(
    user_query: &str,
    schema_preview: &str,
    clarify_answers: &ClarifyAnswers,
) -> String {
    let answers = serde_json::to_string(clarify_answers).unwrap_or_default();

    let mut hasher = Sha256::new();
    for part in [user_query, schema_preview, answers.as_str()] {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
