use crate::stages::AmbiguityCheck;
use lazy_static::lazy_static;
use regex::Regex;

/// Terms whose meaning depends on intent the query does not state
pub const AMBIGUOUS_TERMS: &[&str] = &["recent", "top", "name", "rank", "latest"];

lazy_static! {
    static ref TERM_PATTERNS: Vec<(&'static str, Regex)> = AMBIGUOUS_TERMS
        .iter()
        .map(|term| {
            let pattern = format!(r"\b{}\b", regex::escape(term));
            (*term, Regex::new(&pattern).expect("static pattern"))
        })
        .collect();
}

/// Lexical detector that asks for clarification before any LLM call.
pub struct AmbiguityDetector {
    terms: Vec<(String, Regex)>,
}

impl AmbiguityDetector {
    pub fn new() -> Self {
        Self {
            terms: TERM_PATTERNS
                .iter()
                .map(|(term, re)| (term.to_string(), re.clone()))
                .collect(),
        }
    }

    /// Detector over a custom vocabulary
    pub fn with_terms<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let terms = terms
            .into_iter()
            .filter_map(|t| {
                let term = t.as_ref().trim().to_lowercase();
                if term.is_empty() {
                    return None;
                }
                let re = Regex::new(&format!(r"\b{}\b", regex::escape(&term))).ok()?;
                Some((term, re))
            })
            .collect();
        Self { terms }
    }

    /// One clarification message per distinct matched term, in vocabulary order
    pub fn detect(&self, query: &str, _schema_preview: &str) -> Vec<String> {
        let lowered = query.to_lowercase();
        let mut questions: Vec<String> = Vec::new();
        let mut seen: Vec<&str> = Vec::new();

        for (term, re) in &self.terms {
            if seen.contains(&term.as_str()) {
                continue;
            }
            if re.is_match(&lowered) {
                seen.push(term.as_str());
                questions.push(format!(
                    "The term '{}' is ambiguous in this query. \
                     Please clarify what you mean by '{}'.",
                    term, term
                ));
            }
        }

        questions
    }
}

impl Default for AmbiguityDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl AmbiguityCheck for AmbiguityDetector {
    fn detect(&self, query: &str, schema_preview: &str) -> Vec<String> {
        AmbiguityDetector::detect(self, query, schema_preview)
    }
}
