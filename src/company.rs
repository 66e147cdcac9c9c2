//! Company identity, register numbers and the screening lifecycle
//!
//! A company is identified by its normalized commercial-register number
//! (optionally qualified by the register court). Its progress through the
//! pipeline is a [`LifecycleState`] that only moves forward, except for the
//! retry, reclaim and operator reset edges encoded in
//! [`LifecycleState::can_transition_to`] and [`ResetKind::allows`].

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::documents::DocumentHandle;
use crate::ownership::OwnershipRecord;

/// Register kinds kept by German register courts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegisterKind {
    /// Handelsregister Abteilung B (GmbH, AG, ...)
    Hrb,
    /// Handelsregister Abteilung A (e.K., OHG, KG)
    Hra,
    /// Genossenschaftsregister
    GnR,
    /// Vereinsregister
    Vr,
    /// Partnerschaftsregister
    Pr,
}

impl RegisterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterKind::Hrb => "HRB",
            RegisterKind::Hra => "HRA",
            RegisterKind::GnR => "GnR",
            RegisterKind::Vr => "VR",
            RegisterKind::Pr => "PR",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "HRB" => Some(RegisterKind::Hrb),
            "HRA" => Some(RegisterKind::Hra),
            "GNR" => Some(RegisterKind::GnR),
            "VR" => Some(RegisterKind::Vr),
            "PR" => Some(RegisterKind::Pr),
            _ => None,
        }
    }
}

static REGISTER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(HRB|HRA|GnR|VR|PR)\s*\.?\s*(\d{1,7})(?:\s+([A-Z]{1,2})\b)?").unwrap()
});

static BARE_NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d{1,7})(?:\s*([A-Z]{1,2}))?\s*$").unwrap());

static COURT_PREFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(?:amtsgericht|registergericht|ag)\s+").unwrap());

/// A commercial-register number such as `HRB 12345 B`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegisterNumber {
    pub kind: RegisterKind,
    pub number: u32,
    /// Court-specific suffix, e.g. the `B` used by Berlin-Charlottenburg
    pub suffix: Option<String>,
}

impl RegisterNumber {
    /// Parse a register number out of free text.
    ///
    /// Accepts `HRB 12345`, `HRB12345 B`, `Amtsgericht Berlin HRB 12345` and a
    /// bare `12345`, for which `HRB` is assumed.
    pub fn parse(raw: &str) -> Option<Self> {
        if let Some(caps) = REGISTER_RE.captures(raw) {
            let kind = RegisterKind::from_token(&caps[1])?;
            let number = caps[2].parse().ok()?;
            let suffix = caps.get(3).map(|m| m.as_str().to_ascii_uppercase());
            return Some(Self { kind, number, suffix });
        }

        let caps = BARE_NUMBER_RE.captures(raw)?;
        let number = caps[1].parse().ok()?;
        let suffix = caps.get(2).map(|m| m.as_str().to_ascii_uppercase());
        Some(Self {
            kind: RegisterKind::Hrb,
            number,
            suffix,
        })
    }

    /// Court named in front of the register number, if any
    /// (`Amtsgericht München HRB 1` yields `München`).
    pub fn court_prefix(raw: &str) -> Option<String> {
        let found = REGISTER_RE.find(raw)?;
        let prefix = raw[..found.start()].trim().trim_end_matches([',', ';', ':']);
        let court = COURT_PREFIX_RE.replace(prefix, "");
        let court = normalize_court(&court);
        if court.is_empty() {
            None
        } else {
            Some(court)
        }
    }
}

impl fmt::Display for RegisterNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.as_str(), self.number)?;
        if let Some(suffix) = &self.suffix {
            write!(f, " {}", suffix)?;
        }
        Ok(())
    }
}

/// Collapse whitespace and drop a leading "Amtsgericht"
pub fn normalize_court(raw: &str) -> String {
    let stripped = COURT_PREFIX_RE.replace(raw.trim(), "");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Stable identity of a company in the work store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompanyKey(String);

impl CompanyKey {
    /// `HRB 12345 B`, or `Berlin (Charlottenburg)/HRB 12345 B` when the court is known
    pub fn new(register: &RegisterNumber, court: Option<&str>) -> Self {
        match court.map(normalize_court).filter(|c| !c.is_empty()) {
            Some(court) => CompanyKey(format!("{}/{}", court, register)),
            None => CompanyKey(register.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-system safe rendering used for document file names
    pub fn file_stem(&self) -> String {
        let mut stem = String::with_capacity(self.0.len());
        let mut last_was_sep = false;
        for c in self.0.chars() {
            if c.is_ascii_alphanumeric() {
                stem.push(c);
                last_was_sep = false;
            } else if !last_was_sep {
                stem.push('_');
                last_was_sep = true;
            }
        }
        stem.trim_matches('_').to_string()
    }
}

impl From<&str> for CompanyKey {
    fn from(raw: &str) -> Self {
        CompanyKey(raw.trim().to_string())
    }
}

impl From<String> for CompanyKey {
    fn from(raw: String) -> Self {
        CompanyKey::from(raw.as_str())
    }
}

impl fmt::Display for CompanyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The two pipeline phases that lease work from the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Fetch,
    Parse,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Fetch => "fetch",
            Phase::Parse => "parse",
        }
    }

    /// State an item must be in to be leased by this phase
    pub fn eligible_state(&self) -> LifecycleState {
        match self {
            Phase::Fetch => LifecycleState::Pending,
            Phase::Parse => LifecycleState::Fetched,
        }
    }

    pub fn in_progress_state(&self) -> LifecycleState {
        match self {
            Phase::Fetch => LifecycleState::FetchInProgress,
            Phase::Parse => LifecycleState::ParseInProgress,
        }
    }

    pub fn failed_state(&self) -> LifecycleState {
        match self {
            Phase::Fetch => LifecycleState::FetchFailed,
            Phase::Parse => LifecycleState::ParseFailed,
        }
    }

    pub fn exhausted_state(&self) -> LifecycleState {
        match self {
            Phase::Fetch => LifecycleState::FetchExhausted,
            Phase::Parse => LifecycleState::ParseExhausted,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fetch" => Ok(Phase::Fetch),
            "parse" => Ok(Phase::Parse),
            other => Err(format!("unknown phase '{}'", other)),
        }
    }
}

/// Where a company stands in the screening pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Pending,
    FetchInProgress,
    Fetched,
    ParseInProgress,
    Parsed,
    Qualified,
    NotQualified,
    NeedsReview,
    FetchFailed,
    ParseFailed,
    FetchExhausted,
    ParseExhausted,
    NotFound,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 13] = [
        LifecycleState::Pending,
        LifecycleState::FetchInProgress,
        LifecycleState::Fetched,
        LifecycleState::ParseInProgress,
        LifecycleState::Parsed,
        LifecycleState::Qualified,
        LifecycleState::NotQualified,
        LifecycleState::NeedsReview,
        LifecycleState::FetchFailed,
        LifecycleState::ParseFailed,
        LifecycleState::FetchExhausted,
        LifecycleState::ParseExhausted,
        LifecycleState::NotFound,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Pending => "pending",
            LifecycleState::FetchInProgress => "fetch_in_progress",
            LifecycleState::Fetched => "fetched",
            LifecycleState::ParseInProgress => "parse_in_progress",
            LifecycleState::Parsed => "parsed",
            LifecycleState::Qualified => "qualified",
            LifecycleState::NotQualified => "not_qualified",
            LifecycleState::NeedsReview => "needs_review",
            LifecycleState::FetchFailed => "fetch_failed",
            LifecycleState::ParseFailed => "parse_failed",
            LifecycleState::FetchExhausted => "fetch_exhausted",
            LifecycleState::ParseExhausted => "parse_exhausted",
            LifecycleState::NotFound => "not_found",
        }
    }

    /// Absorbing states: nothing but an operator reset moves an item out of them
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleState::Qualified
                | LifecycleState::NotQualified
                | LifecycleState::NeedsReview
                | LifecycleState::FetchExhausted
                | LifecycleState::ParseExhausted
                | LifecycleState::NotFound
        )
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            LifecycleState::FetchInProgress | LifecycleState::ParseInProgress
        )
    }

    /// Whether a document has been retrieved by the time an item is in this state
    pub fn is_past_fetch(&self) -> bool {
        matches!(
            self,
            LifecycleState::Fetched
                | LifecycleState::ParseInProgress
                | LifecycleState::Parsed
                | LifecycleState::Qualified
                | LifecycleState::NotQualified
                | LifecycleState::ParseFailed
                | LifecycleState::ParseExhausted
        )
    }

    /// Pipeline edges, including retry and lease-reclaim edges.
    ///
    /// Operator resets are not pipeline edges; see [`ResetKind::allows`].
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;

        matches!(
            (*self, next),
            (Pending, FetchInProgress)
                | (FetchInProgress, Fetched)
                | (FetchInProgress, FetchFailed)
                | (FetchInProgress, FetchExhausted)
                | (FetchInProgress, NotFound)
                | (FetchInProgress, NeedsReview)
                | (FetchInProgress, Pending)
                | (FetchFailed, Pending)
                | (Fetched, ParseInProgress)
                | (ParseInProgress, Parsed)
                | (ParseInProgress, ParseFailed)
                | (ParseInProgress, ParseExhausted)
                | (ParseInProgress, Fetched)
                | (ParseFailed, Fetched)
                | (Parsed, Qualified)
                | (Parsed, NotQualified)
                | (Parsed, NeedsReview)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LifecycleState::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown lifecycle state '{}'", s))
    }
}

/// Operator-initiated edges that move an item backwards on purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// Back to `pending`: document, record, confidence and counters are cleared
    Refetch,
    /// Back to `fetched`: record, confidence and the parse counter are cleared
    Reparse,
}

impl ResetKind {
    pub fn target(&self) -> LifecycleState {
        match self {
            ResetKind::Refetch => LifecycleState::Pending,
            ResetKind::Reparse => LifecycleState::Fetched,
        }
    }

    /// `has_document` tells whether the item still holds a readable document
    pub fn allows(&self, from: LifecycleState, has_document: bool) -> bool {
        if from.is_in_progress() {
            return false;
        }
        match self {
            ResetKind::Refetch => true,
            ResetKind::Reparse => has_document && (from.is_past_fetch() || from == LifecycleState::NeedsReview),
        }
    }
}

/// A company as read from the import file
#[derive(Debug, Clone, PartialEq)]
pub struct NewCompany {
    pub key: CompanyKey,
    pub name: String,
    pub location: String,
    pub court: Option<String>,
    pub register: RegisterNumber,
}

impl NewCompany {
    pub fn new(name: &str, location: &str, court: Option<&str>, register: RegisterNumber) -> Self {
        let court = court.map(normalize_court).filter(|c| !c.is_empty());
        Self {
            key: CompanyKey::new(&register, court.as_deref()),
            name: name.split_whitespace().collect::<Vec<_>>().join(" "),
            location: location.trim().to_string(),
            court,
            register,
        }
    }
}

/// Full persisted view of one company
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompanyRecord {
    pub key: CompanyKey,
    pub name: String,
    pub location: String,
    pub court: Option<String>,
    pub register: String,
    pub state: LifecycleState,
    pub fetch_attempts: u32,
    pub parse_attempts: u32,
    pub retry_after: Option<DateTime<Utc>>,
    pub document: Option<DocumentHandle>,
    pub ownership: Option<OwnershipRecord>,
    pub confidence: Option<f64>,
    pub last_error: Option<String>,
    pub doc_purged_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CompanyRecord {
    pub fn natural_person_count(&self) -> Option<usize> {
        self.ownership.as_ref().map(|o| o.natural_person_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_number_forms() {
        let cases = [
            ("HRB 12345", "HRB 12345"),
            ("HRB12345", "HRB 12345"),
            ("hrb 12345 b", "HRB 12345 B"),
            ("HRB 12345 B", "HRB 12345 B"),
            ("Amtsgericht Berlin HRB 98765", "HRB 98765"),
            ("HRA 4711", "HRA 4711"),
            ("GnR 17", "GnR 17"),
            ("VR 2001", "VR 2001"),
            ("12345", "HRB 12345"),
            ("  4242  ", "HRB 4242"),
        ];

        for (raw, expected) in cases {
            let parsed = RegisterNumber::parse(raw).unwrap_or_else(|| panic!("should parse {:?}", raw));
            assert_eq!(parsed.to_string(), expected, "input {:?}", raw);
        }
    }

    #[test]
    fn test_register_number_followed_by_city_has_no_suffix() {
        let parsed = RegisterNumber::parse("HRB 12345 Berlin").unwrap();
        assert_eq!(parsed.suffix, None);
        assert_eq!(parsed.number, 12345);
    }

    #[test]
    fn test_register_number_rejects_garbage() {
        assert!(RegisterNumber::parse("").is_none());
        assert!(RegisterNumber::parse("Musterfirma GmbH").is_none());
        assert!(RegisterNumber::parse("HRX 123").is_none());
    }

    #[test]
    fn test_court_prefix() {
        assert_eq!(
            RegisterNumber::court_prefix("Amtsgericht München HRB 1234").as_deref(),
            Some("München")
        );
        assert_eq!(
            RegisterNumber::court_prefix("Berlin (Charlottenburg), HRB 5 B").as_deref(),
            Some("Berlin (Charlottenburg)")
        );
        assert_eq!(RegisterNumber::court_prefix("HRB 1234"), None);
    }

    #[test]
    fn test_company_key_with_and_without_court() {
        let register = RegisterNumber::parse("HRB 12345 B").unwrap();
        assert_eq!(CompanyKey::new(&register, None).as_str(), "HRB 12345 B");
        assert_eq!(
            CompanyKey::new(&register, Some("Amtsgericht  Berlin (Charlottenburg)")).as_str(),
            "Berlin (Charlottenburg)/HRB 12345 B"
        );
        assert_eq!(CompanyKey::new(&register, Some("   ")).as_str(), "HRB 12345 B");
    }

    #[test]
    fn test_same_number_different_courts_are_distinct() {
        let register = RegisterNumber::parse("HRB 100").unwrap();
        let munich = CompanyKey::new(&register, Some("München"));
        let hamburg = CompanyKey::new(&register, Some("Hamburg"));
        assert_ne!(munich, hamburg);
    }

    #[test]
    fn test_file_stem_is_filesystem_safe() {
        let key = CompanyKey::from("Berlin (Charlottenburg)/HRB 12345 B");
        assert_eq!(key.file_stem(), "Berlin_Charlottenburg_HRB_12345_B");
    }

    #[test]
    fn test_state_string_roundtrip_covers_all_states() {
        for state in LifecycleState::ALL {
            assert_eq!(state.as_str().parse::<LifecycleState>().unwrap(), state);
        }
        assert!("bogus".parse::<LifecycleState>().is_err());
    }

    #[test]
    fn test_forward_path_is_allowed() {
        use LifecycleState::*;
        let path = [Pending, FetchInProgress, Fetched, ParseInProgress, Parsed, Qualified];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_parse_states_unreachable_without_fetch() {
        use LifecycleState::*;
        for target in [ParseInProgress, Parsed, ParseFailed, Qualified, NotQualified] {
            assert!(!Pending.can_transition_to(target), "pending -> {}", target);
            assert!(!FetchFailed.can_transition_to(target), "fetch_failed -> {}", target);
        }
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        for from in LifecycleState::ALL.iter().filter(|s| s.is_terminal()) {
            for to in LifecycleState::ALL {
                assert!(!from.can_transition_to(to), "{} -> {} must be rejected", from, to);
            }
        }
    }

    #[test]
    fn test_retry_edges() {
        use LifecycleState::*;
        assert!(FetchFailed.can_transition_to(Pending));
        assert!(ParseFailed.can_transition_to(Fetched));
        assert!(!FetchExhausted.can_transition_to(Pending));
        assert!(!ParseExhausted.can_transition_to(Fetched));
    }

    #[test]
    fn test_reset_rules() {
        use LifecycleState::*;
        assert!(ResetKind::Refetch.allows(NotFound, false));
        assert!(ResetKind::Refetch.allows(Qualified, true));
        assert!(!ResetKind::Refetch.allows(FetchInProgress, false));

        assert!(ResetKind::Reparse.allows(Qualified, true));
        assert!(ResetKind::Reparse.allows(ParseExhausted, true));
        assert!(ResetKind::Reparse.allows(NeedsReview, true));
        assert!(!ResetKind::Reparse.allows(Pending, false));
        assert!(!ResetKind::Reparse.allows(Qualified, false), "purged document cannot be reparsed");
        assert!(!ResetKind::Reparse.allows(ParseInProgress, true));
    }

    #[test]
    fn test_new_company_normalizes_fields() {
        let company = NewCompany::new(
            "  Muster   Handels GmbH ",
            " Berlin ",
            Some("Amtsgericht Charlottenburg"),
            RegisterNumber::parse("HRB 1").unwrap(),
        );
        assert_eq!(company.name, "Muster Handels GmbH");
        assert_eq!(company.location, "Berlin");
        assert_eq!(company.court.as_deref(), Some("Charlottenburg"));
        assert_eq!(company.key.as_str(), "Charlottenburg/HRB 1");
    }
}
