//! Typed result of reading a shareholder list

use serde::{Deserialize, Serialize};
use std::fmt;

/// What kind of party holds a share
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartyKind {
    NaturalPerson,
    LegalEntity,
    Other,
}

impl fmt::Display for PartyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PartyKind::NaturalPerson => "natural_person",
            PartyKind::LegalEntity => "legal_entity",
            PartyKind::Other => "other",
        };
        f.write_str(label)
    }
}

/// Nominal amount in euros or a percentage of the capital
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "unit", content = "value", rename_all = "lowercase")]
pub enum ShareAmount {
    Eur(f64),
    Percent(f64),
}

impl ShareAmount {
    /// Sum two amounts of the same unit; mixed units keep the first one
    pub fn combine(self, other: ShareAmount) -> ShareAmount {
        match (self, other) {
            (ShareAmount::Eur(a), ShareAmount::Eur(b)) => ShareAmount::Eur(a + b),
            (ShareAmount::Percent(a), ShareAmount::Percent(b)) => ShareAmount::Percent(a + b),
            (first, _) => first,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareholderEntry {
    pub kind: PartyKind,
    pub name: String,
    pub share: Option<ShareAmount>,
}

/// Shareholders in document order plus the capital the document states
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    pub entries: Vec<ShareholderEntry>,
    /// Share capital (Stammkapital) in EUR as stated by the document
    pub stated_capital: Option<f64>,
}

impl OwnershipRecord {
    pub fn natural_person_count(&self) -> usize {
        self.count(PartyKind::NaturalPerson)
    }

    pub fn legal_entity_count(&self) -> usize {
        self.count(PartyKind::LegalEntity)
    }

    pub fn natural_person_names(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|e| e.kind == PartyKind::NaturalPerson)
            .map(|e| e.name.as_str())
    }

    fn count(&self, kind: PartyKind) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }
}
