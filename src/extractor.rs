//! Shareholder-list extraction
//!
//! Turns the text of a shareholder list into an [`OwnershipRecord`] plus a
//! confidence score built from structural signals. Extraction is a pure
//! function of the document bytes.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

use crate::classify::{classify_name, clean_name, dedup_key, has_legal_form};
use crate::documents::{document_text, DocumentFormat};
use crate::ownership::{OwnershipRecord, PartyKind, ShareAmount, ShareholderEntry};

const HEADING_WEIGHT: f64 = 0.35;
const COMPLETENESS_WEIGHT: f64 = 0.40;
const RECONCILIATION_WEIGHT: f64 = 0.25;

/// Reconciliation score when the document offers nothing to compare
const NEUTRAL_RECONCILIATION: f64 = 0.5;

/// Sums within one cent count as an exact match
const RECONCILIATION_TOLERANCE: f64 = 0.01;

/// Longer lines are prose, not headings
const MAX_HEADING_CHARS: usize = 120;

static HEADING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(?:(?:aktualisierte|neue|geänderte)\s+)?(?:liste\s+der\s+gesellschafter\b|gesellschafter\s*-?\s*liste\b|gesellschafter\s*:)",
    )
    .unwrap()
});

/// Notary certificate, signature block or place-and-date line
static END_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?ix)^(?:
            (?:ich|wir)\s+bescheinige
            |hiermit\s+(?:wird\s+)?bescheinig
            |bescheinigung\b
            |(?:der|die)\s+(?:unterzeichnende\s+)?notar
            |notar(?:in)?\s*$
            |unterschrift
            |\(?\s*siegel
            |ort\s*,\s*datum
            |urkundenrolle
            |[\p{L}][\p{L}\ ./()-]*,\s*(?:den|am)\s+\d{1,2}\.\s?\d{1,2}\.\s?\d{2,4}\s*$
        )",
    )
    .unwrap()
});

static PAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:seite\s+\d+(?:\s*(?:von|/)\s*\d+)?|page\s+\d+(?:\s*(?:of|/)\s*\d+)?|-\s*\d+\s*-|\d+\s*/\s*\d+)$")
        .unwrap()
});

static TOTAL_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:summe|gesamt|insgesamt|stammkapital|grundkapital|gesamtnennbetrag)\b").unwrap()
});

/// Company description above an unnumbered list
static PREAMBLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(?:(?:der|die|des)\b|mit\s+(?:dem\s+)?sitz|sitz\b|amtsgericht|registergericht|eingetragen|stand\b|handelsregister|hrb\b|hra\b)",
    )
    .unwrap()
});

static NUMBER_ONLY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{1,3}[.)]?$").unwrap());

/// `1. Name`, `1) Name`, `1, Name` (table column) or `1 Name`
static NUMBERED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,3})(?:\s*[.),:]\s*|\s+)(\D.*)?$").unwrap());

/// Share-number range opening a table row: `1 - 12.500`, `12.501 - 25.000`, `Nr. 1 bis 100`
static SHARE_RANGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(?:(?:lfd\.?\s*)?nr\.?\s*)?(?:\d{1,3}(?:\.\d{3})+|\d+)\s*(?:-|–|bis)\s*(?:\d{1,3}(?:\.\d{3})+|\d+)(?:\s*[.),:;]\s*|\s+|$)(.*)$",
    )
    .unwrap()
});

static RUNNING_NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{1,3}(?:\s*[.),:]\s*|\s+)(\d.*)$").unwrap());

/// `Nr. 3 Name` without a range
static NR_PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:lfd\.?\s*)?nr\.?\s*(?:\d{1,3}(?:\.\d{3})+|\d+)(?:\s*[.),:;]\s*|\s+|$)(.*)$").unwrap()
});

static COLUMN_SPLIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*[|\t]\s*|\s{3,}").unwrap());

static EUR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:(?:EUR|€)\s*(\d{1,3}(?:\.\d{3})+|\d+)(?:,(\d{1,2}|-{1,2}))?|(\d{1,3}(?:\.\d{3})+|\d+)(?:,(\d{1,2}|-{1,2}))?\s*(?:Euro|EUR|€))",
    )
    .unwrap()
});

/// Amount column without a unit: needs a thousands separator or cents to count
static BARE_AMOUNT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|,\s*)(\d{1,3}(?:\.\d{3})+(?:,(?:\d{2}|-{1,2}))?|\d+,(?:\d{2}|-{1,2}))\s*(?:,|$)").unwrap()
});

static AMOUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,3}(?:\.\d{3})+|\d+)(?:,(\d{1,2}|-{1,2}))?").unwrap());

static CAPITAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)stammkapital").unwrap());

static PERCENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d{1,3}(?:[.,]\d+)?)\s*(?:%|prozent)").unwrap());

static BIRTH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:\*|geb(?:oren)?\.?(?:\s+am)?)\s*(\d{1,2}\.\s?\d{1,2}\.\s?\d{4})").unwrap()
});

static DATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{1,2}\.\s?\d{1,2}\.\s?\d{4}\b").unwrap());

static REGISTER_INFO_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:(?:eingetragen\s+(?:im|in\s+dem)\s+)?(?:handelsregister|amtsgerichts?|registergericht)\b[^,;]*?)?\b(?:HRB|HRA|GnR|VR|PR)\s*\d+(?:\s+[A-Z]\b)?",
    )
    .unwrap()
});

static LABEL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:lfd\.?\s*nr|geschäftsanteile?|nennbetr(?:ag|äge)|anteile?|nr\.\s*\d+(?:\s*(?:-|bis)\s*\d+)?|zu\s+je|je|stammeinlage|einlage)\b\.?:?",
    )
    .unwrap()
});

static SEAT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*,?\s*\(?(?:mit\s+(?:dem\s+)?)?\bsitz\s*(?:in|:)?\s+.*$").unwrap());

/// Column captions of tabular lists
const HEADER_WORDS: &[&str] = &[
    "lfd",
    "nr",
    "name",
    "vorname",
    "nachname",
    "geburtsdatum",
    "geburtsort",
    "wohnort",
    "sitz",
    "firma",
    "nennbetrag",
    "nennbeträge",
    "geschäftsanteil",
    "geschäftsanteile",
    "anteil",
    "prozent",
    "veränderung",
    "veränderungen",
    "bemerkung",
    "bemerkungen",
    "gesellschafter",
    "registergericht",
];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseFailure {
    #[error("document contains no text")]
    EmptyDocument,

    #[error("document could not be read: {0}")]
    Unreadable(String),

    #[error("no shareholder list found")]
    NoOwnershipSection,
}

/// Structural observations behind a confidence score
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Signals {
    pub headings: usize,
    pub parsed_candidates: usize,
    pub unparsed_candidates: usize,
    /// Discarded fields of parsed entries that look like further shareholders
    pub leftover_fields: usize,
    /// `None` when there was nothing to reconcile
    pub reconciliation: Option<f64>,
}

impl Signals {
    pub fn heading_unambiguous(&self) -> bool {
        self.headings == 1
    }

    pub fn completeness(&self) -> f64 {
        let total = self.parsed_candidates + self.unparsed_candidates + self.leftover_fields;
        if total == 0 {
            0.0
        } else {
            self.parsed_candidates as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub record: OwnershipRecord,
    pub confidence: f64,
    pub signals: Signals,
}

/// Stateless shareholder-list extractor
#[derive(Debug, Clone, Copy, Default)]
pub struct Extractor;

impl Extractor {
    pub fn new() -> Self {
        Self
    }

    pub fn extract(&self, bytes: &[u8], format: DocumentFormat) -> Result<Extraction, ParseFailure> {
        let text = document_text(bytes, format).map_err(|e| ParseFailure::Unreadable(e.to_string()))?;
        self.extract_text(&text)
    }

    pub fn extract_text(&self, text: &str) -> Result<Extraction, ParseFailure> {
        let lines: Vec<String> = text
            .lines()
            .map(normalize_line)
            .filter(|line| !line.is_empty())
            .collect();

        if !lines.iter().any(|line| line.chars().any(char::is_alphabetic)) {
            return Err(ParseFailure::EmptyDocument);
        }

        let headings = find_headings(&lines);
        let section = section_lines(&lines, &headings);
        let candidates = segment(&section);

        let mut parsed = Vec::new();
        let mut unparsed = 0usize;
        let mut leftover = 0usize;
        for candidate in &candidates {
            match parse_entry(candidate) {
                Some((entry, discarded)) => {
                    if discarded > 0 {
                        debug!("{} field(s) of '{}' left unparsed", discarded, candidate);
                    }
                    leftover += discarded;
                    parsed.push(entry);
                }
                None => {
                    debug!("Unparsed shareholder candidate: {}", candidate);
                    unparsed += 1;
                }
            }
        }

        if headings.is_empty() && parsed.is_empty() {
            return Err(ParseFailure::NoOwnershipSection);
        }

        let parsed_candidates = parsed.len();
        let record = OwnershipRecord {
            entries: deduplicate(parsed),
            stated_capital: stated_capital(&lines),
        };

        let signals = Signals {
            headings: headings.len(),
            parsed_candidates,
            unparsed_candidates: unparsed,
            leftover_fields: leftover,
            reconciliation: reconcile(&record),
        };
        let confidence = score(&record, &signals);

        debug!(
            "Extracted {} shareholder(s), confidence {:.2} ({:?})",
            record.entries.len(),
            confidence,
            signals
        );

        Ok(Extraction {
            record,
            confidence,
            signals,
        })
    }
}

fn score(record: &OwnershipRecord, signals: &Signals) -> f64 {
    if record.entries.is_empty() {
        return 0.0;
    }

    let heading = if signals.heading_unambiguous() { 1.0 } else { 0.0 };
    // Sums over entries that swallowed other rows do not count
    let reconciliation = if signals.leftover_fields > 0 {
        0.0
    } else {
        signals.reconciliation.unwrap_or(NEUTRAL_RECONCILIATION)
    };

    (HEADING_WEIGHT * heading + COMPLETENESS_WEIGHT * signals.completeness() + RECONCILIATION_WEIGHT * reconciliation)
        .clamp(0.0, 1.0)
}

/// Split table columns into comma fields and collapse whitespace
fn normalize_line(raw: &str) -> String {
    let raw = raw.replace('\u{00A0}', " ");
    COLUMN_SPLIT_RE
        .split(raw.trim())
        .map(|part| part.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

struct Heading {
    /// First line after the heading
    next: usize,
    /// Text following a `Gesellschafter:` heading on the same line
    remainder: Option<String>,
}

fn heading_end(line: &str) -> Option<usize> {
    if line.chars().count() > MAX_HEADING_CHARS {
        return None;
    }
    HEADING_RE.find(line).map(|m| m.end())
}

fn heading_remainder(line: &str, end: usize) -> Option<String> {
    let rest = line[end..].trim_matches(|c: char| c.is_whitespace() || c == ',' || c == ':');
    (!rest.is_empty()).then(|| rest.to_string())
}

/// Headings, including ones broken across two lines
fn find_headings(lines: &[String]) -> Vec<Heading> {
    let mut headings = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        if let Some(end) = heading_end(&lines[i]) {
            headings.push(Heading {
                next: i + 1,
                remainder: heading_remainder(&lines[i], end),
            });
            i += 1;
            continue;
        }

        if let Some(next) = lines.get(i + 1) {
            let joined = match lines[i].strip_suffix('-') {
                Some(stem) => format!("{}{}", stem, next),
                None => format!("{} {}", lines[i], next),
            };
            if let Some(end) = heading_end(&joined) {
                headings.push(Heading {
                    next: i + 2,
                    remainder: heading_remainder(&joined, end),
                });
                i += 2;
                continue;
            }
        }

        i += 1;
    }

    headings
}

/// Lines from the first heading to the closing marker; the whole text without a heading
fn section_lines(lines: &[String], headings: &[Heading]) -> Vec<String> {
    let (start, remainder) = match headings.first() {
        Some(heading) => (heading.next, heading.remainder.clone()),
        None => (0, None),
    };

    let mut section: Vec<String> = remainder.into_iter().collect();
    for line in lines.iter().skip(start) {
        if END_RE.is_match(line) {
            break;
        }
        section.push(line.clone());
    }
    section
}

enum LineKind {
    Noise,
    /// Starts a numbered entry, carrying the text after the number
    Start(String),
    /// Only amounts; belongs to the entry above
    Amount(String),
    Text(String),
}

fn is_table_header(line: &str) -> bool {
    if line.chars().any(|c| c.is_ascii_digit()) {
        return false;
    }
    let lower = line.to_lowercase();
    lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| HEADER_WORDS.contains(word))
        .count()
        >= 2
}

fn is_amount_only(line: &str) -> bool {
    let stripped = EUR_RE.replace_all(line, "");
    let stripped = PERCENT_RE.replace_all(&stripped, "");
    stripped != line && !stripped.chars().any(char::is_alphanumeric)
}

/// Text after a share-range or `Nr.` row opener
fn share_range_rest(line: &str) -> Option<&str> {
    SHARE_RANGE_RE
        .captures(line)
        .or_else(|| NR_PREFIX_RE.captures(line))
        .map(|caps| caps.get(1).map_or("", |m| m.as_str()).trim())
}

fn line_kind(line: &str) -> LineKind {
    if heading_end(line).is_some() || PAGE_RE.is_match(line) || TOTAL_LINE_RE.is_match(line) || is_table_header(line)
    {
        return LineKind::Noise;
    }
    if NUMBER_ONLY_RE.is_match(line) {
        return LineKind::Start(String::new());
    }
    if is_amount_only(line) {
        return LineKind::Amount(line.to_string());
    }
    // `1 | 1 - 12.500 | Name`: running number followed by the share range
    let after_running_number = RUNNING_NUMBER_RE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| share_range_rest(m.as_str()));
    if let Some(rest) = share_range_rest(line).or(after_running_number) {
        return LineKind::Start(rest.to_string());
    }
    if let Some(caps) = NUMBERED_RE.captures(line) {
        let rest = caps.get(2).map_or("", |m| m.as_str()).trim();
        return LineKind::Start(rest.to_string());
    }
    if line.chars().any(char::is_alphabetic) {
        LineKind::Text(line.to_string())
    } else {
        LineKind::Noise
    }
}

fn append(entry: &mut String, text: &str) {
    if !entry.is_empty() {
        entry.push_str(", ");
    }
    entry.push_str(text);
}

/// One candidate string per listed shareholder
fn segment(section: &[String]) -> Vec<String> {
    let kinds: Vec<LineKind> = section.iter().map(|line| line_kind(line)).collect();
    let numbered = kinds.iter().any(|kind| matches!(kind, LineKind::Start(_)));

    let mut candidates: Vec<String> = Vec::new();

    if numbered {
        let mut current: Option<String> = None;
        for kind in kinds {
            match kind {
                LineKind::Noise => {}
                LineKind::Start(text) => {
                    if let Some(done) = current.replace(text) {
                        candidates.push(done);
                    }
                }
                // Text before the first number is the company preamble
                LineKind::Amount(text) | LineKind::Text(text) => {
                    if let Some(entry) = current.as_mut() {
                        append(entry, &text);
                    }
                }
            }
        }
        candidates.extend(current);
    } else {
        for kind in kinds {
            match kind {
                LineKind::Text(text) if !PREAMBLE_RE.is_match(&text) => candidates.push(text),
                LineKind::Amount(text) => {
                    if let Some(entry) = candidates.last_mut() {
                        append(entry, &text);
                    }
                }
                _ => {}
            }
        }
    }

    candidates.retain(|c| !c.trim().is_empty());
    candidates
}

/// Parse a German amount such as `12.500,00`, `25.000` or `100,-`
fn parse_amount(integer: &str, fraction: Option<&str>) -> Option<f64> {
    let integer: String = integer.chars().filter(|c| c.is_ascii_digit()).collect();
    let fraction = fraction.filter(|f| f.chars().all(|c| c.is_ascii_digit())).unwrap_or("0");
    format!("{}.{}", integer, fraction).parse().ok()
}

fn parse_amount_str(text: &str) -> Option<f64> {
    let caps = AMOUNT_RE.captures(text)?;
    parse_amount(caps.get(1)?.as_str(), caps.get(2).map(|m| m.as_str()))
}

fn is_name_word(word: &str) -> bool {
    let mut chars = word.chars();
    let starts_upper = chars.next().is_some_and(char::is_uppercase);
    starts_upper
        && word.chars().count() >= 2
        && word
            .chars()
            .all(|c| c.is_alphabetic() || matches!(c, '-' | '\'' | '.'))
}

fn looks_like_given_names(field: &str) -> bool {
    let words: Vec<&str> = field.split_whitespace().collect();
    (1..=3).contains(&words.len())
        && words.iter().all(|w| is_name_word(w))
        && words.iter().any(|w| !w.ends_with('.'))
        && !has_legal_form(field)
}

fn strip_seat(name: &str) -> String {
    SEAT_RE.replace(name, "").trim().to_string()
}

/// Parse one candidate into an entry and the number of shareholder-like fields it had to drop.
/// `None` when it yields no usable shareholder.
fn parse_entry(candidate: &str) -> Option<(ShareholderEntry, usize)> {
    let has_birth_date = BIRTH_RE.is_match(candidate) || DATE_RE.is_match(candidate);
    let rest = BIRTH_RE.replace_all(candidate, ",");
    let rest = DATE_RE.replace_all(&rest, ",");

    let mut eur: Option<f64> = None;
    for caps in EUR_RE.captures_iter(&rest) {
        let (integer, fraction) = match (caps.get(1), caps.get(3)) {
            (Some(int), _) => (int.as_str(), caps.get(2)),
            (None, Some(int)) => (int.as_str(), caps.get(4)),
            (None, None) => continue,
        };
        if let Some(amount) = parse_amount(integer, fraction.map(|m| m.as_str())) {
            eur = Some(eur.unwrap_or(0.0) + amount);
        }
    }
    let mut rest = EUR_RE.replace_all(&rest, ",").into_owned();

    if eur.is_none() {
        for caps in BARE_AMOUNT_RE.captures_iter(&rest) {
            if let Some(amount) = caps.get(1).and_then(|m| parse_amount_str(m.as_str())) {
                eur = Some(eur.unwrap_or(0.0) + amount);
            }
        }
        rest = BARE_AMOUNT_RE.replace_all(&rest, ",").into_owned();
    }

    let mut percent: Option<f64> = None;
    for caps in PERCENT_RE.captures_iter(&rest) {
        if let Some(value) = caps.get(1).and_then(|m| m.as_str().replace(',', ".").parse::<f64>().ok()) {
            percent = Some(percent.unwrap_or(0.0) + value);
        }
    }
    let rest = PERCENT_RE.replace_all(&rest, ",");
    let rest = REGISTER_INFO_RE.replace_all(&rest, ",");
    let rest = LABEL_RE.replace_all(&rest, " ");

    let fields: Vec<String> = rest
        .split([',', ';'])
        .map(clean_name)
        .filter(|field| field.chars().any(char::is_alphabetic))
        .collect();

    let first = fields.first()?;
    let (name, consumed) = if has_legal_form(first) {
        (strip_seat(first), 1)
    } else if fields.len() >= 2 && !first.contains(' ') && is_name_word(first) && looks_like_given_names(&fields[1]) {
        // Surname-first: "Mustermann, Max"
        (format!("{} {}", fields[1], first), 2)
    } else {
        (first.clone(), 1)
    };

    let name = clean_name(&name);
    if name.is_empty() {
        return None;
    }

    let share = eur.map(ShareAmount::Eur).or(percent.map(ShareAmount::Percent));
    let kind = classify_name(&name);
    if kind == PartyKind::Other && !has_birth_date && share.is_none() {
        return None;
    }

    let leftover = leftover_shareholders(&fields[consumed..], DATE_RE.find_iter(candidate).count());
    Some((ShareholderEntry { kind, name, share }, leftover))
}

/// Discarded fields that look like further shareholders.
///
/// A company name left over counts once. Extra dates count when enough name
/// words remain to carry another person; one residence field does not.
fn leftover_shareholders(rest: &[String], dates: usize) -> usize {
    let entities = rest.iter().filter(|field| has_legal_form(field)).count();
    let name_fields = rest
        .iter()
        .filter(|field| field.split_whitespace().all(is_name_word))
        .count();

    let people = if dates > 1 && name_fields >= 2 { dates - 1 } else { 0 };
    entities + people
}

/// Merge entries naming the same shareholder, keeping the first position
fn deduplicate(entries: Vec<ShareholderEntry>) -> Vec<ShareholderEntry> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<ShareholderEntry> = Vec::with_capacity(entries.len());

    for entry in entries {
        let key = dedup_key(&entry.name);
        match index.get(&key) {
            Some(&at) => {
                let existing = &mut unique[at];
                existing.share = match (existing.share, entry.share) {
                    (Some(a), Some(b)) => Some(a.combine(b)),
                    (a, b) => a.or(b),
                };
            }
            None => {
                index.insert(key, unique.len());
                unique.push(entry);
            }
        }
    }

    unique
}

/// Stated share capital: a Stammkapital line, else the last total line
fn stated_capital(lines: &[String]) -> Option<f64> {
    let amount_after = |line: &str, keyword_end: usize| -> Option<f64> {
        let tail = &line[keyword_end..];
        if let Some(caps) = EUR_RE.captures(tail) {
            let (integer, fraction) = match (caps.get(1), caps.get(3)) {
                (Some(int), _) => (int, caps.get(2)),
                (None, Some(int)) => (int, caps.get(4)),
                (None, None) => return None,
            };
            return parse_amount(integer.as_str(), fraction.map(|m| m.as_str()));
        }
        parse_amount_str(tail)
    };

    let capital = lines.iter().find_map(|line| {
        let m = CAPITAL_RE.find(line)?;
        amount_after(line.as_str(), m.end())
    });
    if capital.is_some() {
        return capital;
    }

    lines
        .iter()
        .filter_map(|line| {
            let m = TOTAL_LINE_RE.find(line)?;
            amount_after(line.as_str(), m.end())
        })
        .last()
}

fn agreement(actual: f64, expected: f64) -> f64 {
    if (actual - expected).abs() <= RECONCILIATION_TOLERANCE {
        1.0
    } else if actual <= 0.0 || expected <= 0.0 {
        0.0
    } else {
        actual.min(expected) / actual.max(expected)
    }
}

/// Compare listed shares with the stated capital, or percents with 100
fn reconcile(record: &OwnershipRecord) -> Option<f64> {
    let eur: Vec<f64> = record
        .entries
        .iter()
        .filter_map(|e| match e.share {
            Some(ShareAmount::Eur(v)) => Some(v),
            _ => None,
        })
        .collect();

    if let Some(capital) = record.stated_capital {
        if !eur.is_empty() {
            return Some(agreement(eur.iter().sum(), capital));
        }
    }

    let percents: Vec<f64> = record
        .entries
        .iter()
        .filter_map(|e| match e.share {
            Some(ShareAmount::Percent(v)) => Some(v),
            _ => None,
        })
        .collect();

    if percents.is_empty() {
        None
    } else {
        Some(agreement(percents.iter().sum(), 100.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::company::LifecycleState;
    use crate::qualification::QualificationRule;

    fn extract(text: &str) -> Extraction {
        Extractor::new().extract_text(text).unwrap()
    }

    fn names(extraction: &Extraction) -> Vec<&str> {
        extraction.record.entries.iter().map(|e| e.name.as_str()).collect()
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    const TABLE_LIST: &str = "\
Liste der Gesellschafter
der Alpha Verwaltungs GmbH
mit dem Sitz in Berlin
Amtsgericht Charlottenburg HRB 12345 B

Lfd. Nr. | Name, Vorname | Wohnort | Geburtsdatum | Nennbetrag
1 | Mustermann, Max | Berlin | *01.02.1970 | 12.500,00 EUR
2 | Musterfrau, Erika | Hamburg | *03.04.1975 | 12.500,00 EUR

Stammkapital: 25.000,00 EUR

Berlin, den 05.06.2023
Dr. Hans Notar, Notar
";

    // ==================== Entry shapes ====================

    #[test]
    fn test_table_list_surname_first() {
        let extraction = extract(TABLE_LIST);

        assert_eq!(names(&extraction), vec!["Max Mustermann", "Erika Musterfrau"]);
        assert_eq!(extraction.record.natural_person_count(), 2);
        assert_eq!(extraction.record.stated_capital, Some(25_000.0));
        assert_eq!(extraction.record.entries[0].share, Some(ShareAmount::Eur(12_500.0)));
        assert_eq!(extraction.signals.reconciliation, Some(1.0));
        assert!(approx(extraction.confidence, 1.0));
    }

    #[test]
    fn test_legal_entity_and_geb_form() {
        let extraction = extract(
            "Gesellschafter:\n\
             1. Beta Holding GmbH, Sitz München, Amtsgericht München HRB 98765, 50 %\n\
             2. Dr. Anna Schmidt, geb. 12.03.1968, Köln, 50 %\n",
        );

        assert_eq!(names(&extraction), vec!["Beta Holding GmbH", "Dr. Anna Schmidt"]);
        assert_eq!(extraction.record.entries[0].kind, PartyKind::LegalEntity);
        assert_eq!(extraction.record.entries[1].kind, PartyKind::NaturalPerson);
        assert_eq!(extraction.record.natural_person_count(), 1);
        assert_eq!(extraction.record.legal_entity_count(), 1);
        assert_eq!(extraction.signals.reconciliation, Some(1.0));
        assert!(approx(extraction.confidence, 1.0));
    }

    #[test]
    fn test_seat_phrase_is_stripped_from_entity() {
        let extraction = extract("Gesellschafterliste\n1. Gamma Beteiligungs GmbH mit Sitz in Hamburg, 25.000 EUR\n");
        assert_eq!(names(&extraction), vec!["Gamma Beteiligungs GmbH"]);
        assert_eq!(extraction.record.entries[0].share, Some(ShareAmount::Eur(25_000.0)));
    }

    #[test]
    fn test_continuation_lines_fold_into_entry() {
        let extraction = extract(
            "Gesellschafterliste\n\
             1.\n\
             Max Mustermann\n\
             Berlin\n\
             12.500,00 EUR\n\
             2.\n\
             Erika Musterfrau\n\
             Hamburg\n\
             12.500,00 EUR\n",
        );

        assert_eq!(names(&extraction), vec!["Max Mustermann", "Erika Musterfrau"]);
        assert_eq!(extraction.record.entries[1].share, Some(ShareAmount::Eur(12_500.0)));
    }

    #[test]
    fn test_unnumbered_lines_each_form_an_entry() {
        let extraction = extract("Gesellschafterliste\nMax Mustermann\nErika Musterfrau\nHans Meier\n");

        assert_eq!(extraction.record.natural_person_count(), 3);
        assert_eq!(extraction.signals.reconciliation, None);
        // heading 0.35 + completeness 0.40 + neutral reconciliation 0.125
        assert!(approx(extraction.confidence, 0.875));
    }

    #[test]
    fn test_heading_broken_across_lines() {
        let extraction = extract("Liste der\nGesellschafter\n1. Max Mustermann, 100 %\n");
        assert_eq!(extraction.signals.headings, 1);
        assert_eq!(names(&extraction), vec!["Max Mustermann"]);
    }

    #[test]
    fn test_heading_remainder_is_first_entry() {
        let extraction = extract("Gesellschafter: Max Mustermann, 100 %\n");
        assert_eq!(names(&extraction), vec!["Max Mustermann"]);
        assert_eq!(extraction.record.entries[0].share, Some(ShareAmount::Percent(100.0)));
    }

    #[test]
    fn test_grouping_needs_evidence() {
        let extraction = extract(
            "Gesellschafterliste\n\
             1. Erbengemeinschaft nach Otto Muster, 5.000 EUR\n\
             2. Max Mustermann, 20.000 EUR\n",
        );
        assert_eq!(extraction.record.entries[0].kind, PartyKind::Other);
        assert_eq!(extraction.record.natural_person_count(), 1);
    }

    const SHARE_RANGE_TABLE: &str = "\
Gesellschafterliste
der Delta Bau GmbH mit dem Sitz in Leipzig
Nr. der Geschäftsanteile | Name | Vorname | Geburtsdatum | Wohnort | Nennbetrag
1 - 10.000 | Alt | Anna | 01.01.1970 | Berlin | 10.000
10.001 - 20.000 | Bau | Bernd | 02.02.1972 | Hamburg | 10.000
20.001 - 25.000 | Cord | Carla | 03.03.1974 | München | 5.000
Stammkapital: 25.000,00 EUR
";

    #[test]
    fn test_share_range_rows_each_form_an_entry() {
        let extraction = extract(SHARE_RANGE_TABLE);

        assert_eq!(names(&extraction), vec!["Anna Alt", "Bernd Bau", "Carla Cord"]);
        assert_eq!(extraction.record.natural_person_count(), 3);
        assert_eq!(extraction.record.entries[1].share, Some(ShareAmount::Eur(10_000.0)));
        assert_eq!(extraction.record.entries[2].share, Some(ShareAmount::Eur(5_000.0)));
        assert_eq!(extraction.signals.leftover_fields, 0);
        assert_eq!(extraction.signals.reconciliation, Some(1.0));
        assert!(approx(extraction.confidence, 1.0));

        let verdict = QualificationRule::default().verdict(&extraction.record, extraction.confidence);
        assert_eq!(verdict.state, LifecycleState::NotQualified);
    }

    #[test]
    fn test_share_ranges_above_one_thousand() {
        let extraction = extract(
            "Gesellschafterliste\n\
             1 - 12.500 | Mustermann | Max | 01.02.1970 | Berlin | 12.500\n\
             12.501 - 25.000 | Musterfrau | Erika | 03.04.1975 | Hamburg | 12.500\n\
             Stammkapital: 25.000 EUR\n",
        );

        assert_eq!(names(&extraction), vec!["Max Mustermann", "Erika Musterfrau"]);
        assert_eq!(extraction.record.entries[0].share, Some(ShareAmount::Eur(12_500.0)));
        assert_eq!(extraction.record.entries[1].share, Some(ShareAmount::Eur(12_500.0)));
    }

    #[test]
    fn test_nr_bis_rows_and_running_number_before_range() {
        let extraction = extract(
            "Gesellschafterliste\n\
             Nr. 1 bis 100, Beta Holding GmbH, 100 EUR\n\
             Nr. 101 bis 25.000, Erika Musterfrau, *03.04.1975, 24.900 EUR\n",
        );
        assert_eq!(names(&extraction), vec!["Beta Holding GmbH", "Erika Musterfrau"]);

        let extraction = extract(
            "Gesellschafterliste\n\
             1 | 1 - 1.000 | Alt | Anna | Berlin | 1.000,00\n\
             2 | 1.001 - 2.000 | Bau | Bernd | Hamburg | 1.000,00\n",
        );
        assert_eq!(names(&extraction), vec!["Anna Alt", "Bernd Bau"]);
    }

    #[test]
    fn test_merged_rows_lower_confidence() {
        // Three people folded into one numbered entry
        let extraction = extract(
            "Gesellschafterliste\n\
             1. Alt, Anna, 01.01.1970, Berlin, Bau, Bernd, 02.02.1972, Hamburg, Cord, Carla, 03.03.1974, München, 25.000 EUR\n\
             Stammkapital: 25.000 EUR\n",
        );

        assert_eq!(extraction.record.entries.len(), 1);
        assert_eq!(extraction.signals.leftover_fields, 2);
        // heading 0.35 + completeness 1/3 * 0.40, reconciliation discarded
        assert!(approx(extraction.confidence, 0.35 + 0.40 / 3.0));
        assert!(extraction.confidence < 0.5);
    }

    #[test]
    fn test_residence_field_is_not_leftover() {
        let extraction = extract(TABLE_LIST);
        assert_eq!(extraction.signals.leftover_fields, 0);

        let extraction = extract("Gesellschafterliste\n1. Max Mustermann, Beta Verwaltungs GmbH, 100 %\n");
        assert_eq!(extraction.signals.leftover_fields, 1);
    }

    // ==================== Noise and boundaries ====================

    #[test]
    fn test_noise_lines_are_skipped() {
        let extraction = extract(
            "Gesellschafterliste\n\
             Lfd. Nr. | Name | Nennbetrag\n\
             1. Max Mustermann, 12.500 EUR\n\
             Seite 1 von 2\n\
             Gesellschafterliste\n\
             2. Erika Musterfrau, 12.500 EUR\n\
             Summe: 25.000 EUR\n",
        );

        assert_eq!(names(&extraction), vec!["Max Mustermann", "Erika Musterfrau"]);
        assert_eq!(extraction.record.stated_capital, Some(25_000.0));
    }

    #[test]
    fn test_notary_block_ends_section() {
        let extraction = extract(
            "Gesellschafterliste\n\
             1. Max Mustermann, 100 %\n\
             Ich bescheinige hiermit die Übereinstimmung\n\
             2. Not Ashareholder, 100 %\n",
        );
        assert_eq!(names(&extraction), vec!["Max Mustermann"]);
    }

    #[test]
    fn test_duplicates_merge_shares() {
        let extraction = extract(
            "Gesellschafterliste\n\
             1. Max Mustermann, 12.500,00 EUR\n\
             2. MAX MUSTERMANN, 12.500,00 EUR\n\
             Stammkapital: 25.000,00 EUR\n",
        );

        assert_eq!(extraction.record.entries.len(), 1);
        assert_eq!(extraction.record.entries[0].name, "Max Mustermann");
        assert_eq!(extraction.record.entries[0].share, Some(ShareAmount::Eur(25_000.0)));
        assert_eq!(extraction.signals.parsed_candidates, 2);
        assert_eq!(extraction.signals.reconciliation, Some(1.0));
    }

    // ==================== Confidence ====================

    #[test]
    fn test_ambiguous_heading_and_unparsed_line_lower_confidence() {
        let extraction = extract(
            "Gesellschafterliste\n\
             Liste der Gesellschafter\n\
             1. Max Mustermann, 100 %\n\
             2. ???, Nennbetrag\n",
        );

        assert_eq!(extraction.signals.headings, 2);
        assert_eq!(extraction.signals.unparsed_candidates, 1);
        // completeness 0.5 * 0.40 + reconciliation 1.0 * 0.25
        assert!(approx(extraction.confidence, 0.45));
    }

    #[test]
    fn test_capital_mismatch_scales_reconciliation() {
        let extraction = extract(
            "Gesellschafterliste\n\
             1. Max Mustermann, 10.000 EUR\n\
             Stammkapital: 25.000 EUR\n",
        );
        assert_eq!(extraction.signals.reconciliation, Some(0.4));
    }

    #[test]
    fn test_heading_without_entries_scores_zero() {
        let extraction = extract("Gesellschafterliste\nSeite 1\n");
        assert!(extraction.record.entries.is_empty());
        assert_eq!(extraction.confidence, 0.0);
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let first = extract(TABLE_LIST);
        let second = extract(TABLE_LIST);
        assert_eq!(first, second);
    }

    // ==================== Failures ====================

    #[test]
    fn test_empty_document_fails() {
        let result = Extractor::new().extract_text("  \n\t\n 12 ");
        assert_eq!(result, Err(ParseFailure::EmptyDocument));
    }

    #[test]
    fn test_unrelated_text_fails() {
        let result = Extractor::new().extract_text("Dies ist ein Brief ohne Liste.\n");
        assert_eq!(result, Err(ParseFailure::NoOwnershipSection));
    }

    #[test]
    fn test_unreadable_pdf_fails() {
        let result = Extractor::new().extract(b"%PDF-1.4 broken", DocumentFormat::Pdf);
        assert!(matches!(result, Err(ParseFailure::Unreadable(_))));
    }

    #[test]
    fn test_text_bytes_are_decoded() {
        let bytes = "Gesellschafterliste\n1. Jürgen Müller, 100 %\n".as_bytes();
        let extraction = Extractor::new().extract(bytes, DocumentFormat::Text).unwrap();
        assert_eq!(names(&extraction), vec!["Jürgen Müller"]);
    }

    #[test]
    fn test_parse_amount_forms() {
        assert_eq!(parse_amount("12.500", Some("00")), Some(12_500.0));
        assert_eq!(parse_amount("100", Some("-")), Some(100.0));
        assert_eq!(parse_amount_str("25.000,50"), Some(25_000.5));
    }
}
