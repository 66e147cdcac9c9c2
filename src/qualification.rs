//! Qualification rule applied to parsed ownership records

use crate::company::LifecycleState;
use crate::config::{ExtractionConfig, QualificationConfig};
use crate::ownership::OwnershipRecord;

/// Decision plus a short human-readable reason for the event log
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub state: LifecycleState,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QualificationRule {
    pub max_natural_persons: usize,
    pub reject_legal_entities: bool,
    pub confidence_threshold: f64,
}

impl Default for QualificationRule {
    fn default() -> Self {
        Self::from_config(&QualificationConfig::default(), &ExtractionConfig::default())
    }
}

impl QualificationRule {
    pub fn from_config(qualification: &QualificationConfig, extraction: &ExtractionConfig) -> Self {
        Self {
            max_natural_persons: qualification.max_natural_persons,
            reject_legal_entities: qualification.reject_legal_entities,
            confidence_threshold: extraction.confidence_threshold,
        }
    }

    /// Low confidence always wins over the count
    pub fn verdict(&self, record: &OwnershipRecord, confidence: f64) -> Verdict {
        let naturals = record.natural_person_count();
        let entities = record.legal_entity_count();

        if confidence < self.confidence_threshold {
            return Verdict {
                state: LifecycleState::NeedsReview,
                reason: format!(
                    "confidence {:.2} below {:.2} ({} natural person(s))",
                    confidence, self.confidence_threshold, naturals
                ),
            };
        }

        if naturals > self.max_natural_persons {
            return Verdict {
                state: LifecycleState::NotQualified,
                reason: format!("{} natural persons (max {})", naturals, self.max_natural_persons),
            };
        }

        if self.reject_legal_entities && entities > 0 {
            return Verdict {
                state: LifecycleState::NotQualified,
                reason: format!("{} legal entity shareholder(s)", entities),
            };
        }

        Verdict {
            state: LifecycleState::Qualified,
            reason: format!("{} natural person(s), confidence {:.2}", naturals, confidence),
        }
    }
}
