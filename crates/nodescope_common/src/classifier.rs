//! Error Classifier - maps an ErrorRecord onto the first matching catalog pattern.

use crate::patterns::PatternCatalog;
use crate::record::{Diagnosis, ErrorRecord};

pub struct ErrorClassifier {
    catalog: PatternCatalog,
}

impl ErrorClassifier {
    pub fn new(catalog: PatternCatalog) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &PatternCatalog {
        &self.catalog
    }

    /// First match in catalog order wins. Never fails: unmatched records get
    /// the unclassified diagnosis.
    pub fn classify(&self, record: &ErrorRecord) -> Diagnosis {
        for pattern in self.catalog.patterns() {
            if let Some(found) = pattern.matches(record) {
                return Diagnosis {
                    category: pattern.category,
                    title: pattern.title.clone(),
                    suggested_fix: Some(pattern.render_fix(&found)),
                    pattern_id: Some(pattern.id.clone()),
                    confidence: pattern.confidence,
                    matched_text: Some(found.matched_text),
                };
            }
        }
        Diagnosis::unclassified()
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(PatternCatalog::builtin())
    }
}
