//! Shareholder name classification
//!
//! Decides whether a shareholder name denotes a natural person, a legal
//! entity or something else (estates, communities of heirs, unreadable
//! fragments). Pure functions over the name text only.
//!
//! Legal entities are recognised by:
//! - legal-form tokens: GmbH, AG, KG, UG, e.V., Ltd., B.V., S.A. ...
//! - organisation keywords: Holding, Beteiligungs..., Stiftung ...
//! - public bodies: Stadt, Landkreis, Freistaat ...

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::trace;

use crate::ownership::PartyKind;

/// Legal-form tokens, matched case-sensitively with token boundaries.
/// Dotted forms tolerate a space after each dot ("e. V.", "S. A.").
static LEGAL_FORM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
        (?:^|[\s,(/-])
        (?:
            gGmbH | GmbH | mbH | InvAG | AG | KGaA | KG | SE | UG | OHG | GbR | eG | eK
            | PartGmbB | PartG | EWIV | VVaG | KdöR | AöR
            | e\.\s?V\.? | e\.\s?K\.? | e\.\s?G\.?
            | Ltd\.? | Limited | LLC | L\.L\.C\. | LLP | LP | Inc\.? | Corp\.? | plc | PLC
            | B\.\s?V\.? | BV | N\.\s?V\.? | NV
            | S\.\s?A\.? | SA | SAS | SARL | S\.\s?à\s?r\.\s?l\.?
            | S\.\s?L\.? | SL | S\.\s?r\.\s?l\.? | Srl | S\.\s?p\.\s?A\.? | SpA
            | AB | ApS | A/S | Oy | GesmbH | Sp\.\s?z\s?o\.\s?o\.?
        )
        (?:$|[\s,;)/])
        ",
    )
    .unwrap()
});

/// `& Co.` and `& Co. KG` style partnership suffixes
static AND_CO_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)&\s*co\.?(?:\s|$)").unwrap());

/// Organisation words that also occur inside compounds ("Musterholding")
const ORGANISATION_KEYWORDS: &[&str] = &[
    "aktiengesellschaft",
    "kommanditgesellschaft",
    "gesellschaft",
    "genossenschaft",
    "holding",
    "beteiligung",
    "verwaltung",
    "stiftung",
    "treuhand",
    "verein",
    "sparkasse",
    "versicherung",
    "investment",
    "capital",
    "partners",
    "ventures",
];

/// First words naming a public body ("Stadt München", "Land Berlin")
const PUBLIC_BODY_PREFIXES: &[&str] = &[
    "stadt",
    "gemeinde",
    "landkreis",
    "kreis",
    "markt",
    "land",
    "freistaat",
    "bundesrepublik",
    "bezirk",
    "zweckverband",
];

/// Groupings of people that are neither a single person nor an entity
const OTHER_MARKERS: &[&str] = &[
    "erbengemeinschaft",
    "nachlass",
    "testamentsvollstrecker",
    "eheleute",
    "geschwister",
    "unbekannt",
];

/// List vocabulary; a name containing one of these is a fragment of the list itself
const LIST_WORDS: &[&str] = &[
    "gesellschafter",
    "gesellschafterliste",
    "liste",
    "summe",
    "insgesamt",
    "stammkapital",
    "nennbetrag",
    "geschäftsanteil",
    "geschäftsanteile",
];

/// Words that never occur in a person's name but do occur in list text
const NON_PERSON_WORDS: &[&str] = &[
    "geschäftsanteil",
    "geschäftsanteile",
    "stammkapital",
    "nennbetrag",
    "laufende",
    "nummer",
    "betrag",
    "liste",
    "gesellschafter",
    "insgesamt",
    "summe",
    "eur",
    "euro",
    "anteil",
    "veränderung",
    "seite",
    "und",
    "sitz",
];

/// Tokens allowed inside a person's name without being a name word
const NAME_PARTICLES: &[&str] = &[
    "von", "van", "vom", "zu", "zum", "zur", "de", "der", "den", "di", "da", "del", "della", "le",
    "la", "ten", "ter", "y", "geb.", "geborene",
];

static TITLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:herr|frau|dr\.?|prof\.?|dipl\.-[\p{L}.]+|med\.|rer\.|nat\.|jur\.|phil\.|h\.\s?c\.|mag\.|ing\.)$")
        .unwrap()
});

static NAME_WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\p{Lu}[\p{L}'’.\-]*$").unwrap());

/// Classify a shareholder name
pub fn classify_name(name: &str) -> PartyKind {
    let name = normalize_whitespace(name);
    if name.is_empty() {
        return PartyKind::Other;
    }

    let lower = name.to_lowercase();

    if OTHER_MARKERS.iter().any(|marker| lower.contains(marker)) {
        trace!("'{}' classified as other (grouping marker)", name);
        return PartyKind::Other;
    }

    let is_list_fragment = lower
        .split_whitespace()
        .map(|token| token.trim_matches(|c: char| !c.is_alphanumeric()))
        .any(|token| LIST_WORDS.contains(&token));
    if is_list_fragment {
        trace!("'{}' classified as other (list vocabulary)", name);
        return PartyKind::Other;
    }

    if is_legal_entity(&name, &lower) {
        trace!("'{}' classified as legal entity", name);
        return PartyKind::LegalEntity;
    }

    if is_natural_person(&name) {
        trace!("'{}' classified as natural person", name);
        return PartyKind::NaturalPerson;
    }

    trace!("'{}' classified as other", name);
    PartyKind::Other
}

/// Whether the name carries a legal form or organisation marker
pub fn has_legal_form(name: &str) -> bool {
    let name = normalize_whitespace(name);
    let lower = name.to_lowercase();
    is_legal_entity(&name, &lower)
}

fn is_legal_entity(name: &str, lower: &str) -> bool {
    if LEGAL_FORM_RE.is_match(name) || AND_CO_RE.is_match(name) {
        return true;
    }

    if ORGANISATION_KEYWORDS.iter().any(|keyword| lower.contains(keyword)) {
        return true;
    }

    lower
        .split_whitespace()
        .next()
        .map(|first| PUBLIC_BODY_PREFIXES.contains(&first))
        .unwrap_or(false)
        && lower.split_whitespace().count() > 1
}

fn is_natural_person(name: &str) -> bool {
    if name.chars().any(|c| c.is_ascii_digit()) {
        return false;
    }

    let mut name_words = 0usize;
    let mut has_full_word = false;

    for token in name.split_whitespace() {
        let token = token.trim_end_matches([',', ';', ':']);
        if token.is_empty() || TITLE_RE.is_match(token) {
            continue;
        }

        let lower = token.to_lowercase();
        if NON_PERSON_WORDS.contains(&lower.as_str()) {
            return false;
        }
        if NAME_PARTICLES.contains(&lower.as_str()) {
            continue;
        }
        if !NAME_WORD_RE.is_match(token) {
            return false;
        }

        name_words += 1;
        if token.chars().filter(|c| c.is_alphabetic()).count() >= 2 {
            has_full_word = true;
        }
    }

    has_full_word && (2..=5).contains(&name_words)
}

/// Collapse runs of whitespace, unify quotes, strip list punctuation at the ends
pub fn clean_name(raw: &str) -> String {
    let unified: String = raw
        .chars()
        .map(|c| match c {
            '\u{00A0}' | '\t' => ' ',
            '\u{2018}' | '\u{2019}' | '`' => '\'',
            '\u{201C}' | '\u{201D}' | '\u{201E}' => '"',
            other => other,
        })
        .collect();

    let collapsed = normalize_whitespace(&unified);
    collapsed
        .trim_matches(|c: char| matches!(c, ',' | ';' | ':' | '-' | '"' | '|'))
        .trim()
        .to_string()
}

/// Key used to detect the same shareholder listed twice
pub fn dedup_key(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

fn normalize_whitespace(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Natural persons
    // =========================================================================

    #[test]
    fn test_plain_person_names() {
        for name in [
            "Max Mustermann",
            "Erika Musterfrau",
            "A. Muster",
            "Hans-Peter Müller",
            "Anna Maria Schmidt-Lüdenscheidt",
            "MAX MUSTERMANN",
            "Ludwig van Beethoven",
            "Karl-Theodor zu Guttenberg",
        ] {
            assert_eq!(classify_name(name), PartyKind::NaturalPerson, "{}", name);
        }
    }

    #[test]
    fn test_titles_are_ignored() {
        assert_eq!(classify_name("Dr. Max Mustermann"), PartyKind::NaturalPerson);
        assert_eq!(classify_name("Prof. Dr. Erika Muster"), PartyKind::NaturalPerson);
        assert_eq!(classify_name("Frau Dipl.-Ing. Jana Beispiel"), PartyKind::NaturalPerson);
    }

    #[test]
    fn test_birth_name_is_allowed() {
        assert_eq!(classify_name("Erika Mustermann geb. Schmidt"), PartyKind::NaturalPerson);
    }

    #[test]
    fn test_single_word_is_not_a_person() {
        assert_eq!(classify_name("Mustermann"), PartyKind::Other);
        assert_eq!(classify_name("Dr. Mustermann"), PartyKind::Other);
    }

    #[test]
    fn test_too_many_words_is_not_a_person() {
        assert_eq!(classify_name("Max Moritz Hans Peter Paul Mustermann"), PartyKind::Other);
    }

    #[test]
    fn test_digits_and_list_words_are_not_persons() {
        assert_eq!(classify_name("Max Mustermann 1980"), PartyKind::Other);
        assert_eq!(classify_name("Summe Geschäftsanteile"), PartyKind::Other);
        assert_eq!(classify_name("Liste Gesellschafter"), PartyKind::Other);
        assert_eq!(classify_name("die gesellschafter"), PartyKind::Other);
    }

    #[test]
    fn test_initials_only_is_not_a_person() {
        assert_eq!(classify_name("A. B."), PartyKind::Other);
    }

    // =========================================================================
    // Legal entities
    // =========================================================================

    #[test]
    fn test_german_legal_forms() {
        for name in [
            "Muster GmbH",
            "Muster gGmbH",
            "Beispiel AG",
            "Muster GmbH & Co. KG",
            "Muster UG (haftungsbeschränkt)",
            "Tennisclub Musterstadt e.V.",
            "Tennisclub Musterstadt e. V.",
            "Muster OHG",
            "Muster Verwaltungs-GmbH",
            "Muster SE",
            "Schulz & Co.",
            "Muster Beteiligungsgesellschaft mbH",
        ] {
            assert_eq!(classify_name(name), PartyKind::LegalEntity, "{}", name);
        }
    }

    #[test]
    fn test_foreign_legal_forms() {
        for name in [
            "Example Ltd.",
            "Example Limited",
            "Example Inc.",
            "Voorbeeld B.V.",
            "Exemple S.A.",
            "Esempio S.r.l.",
            "Example LLC",
            "Exempel AB",
        ] {
            assert_eq!(classify_name(name), PartyKind::LegalEntity, "{}", name);
        }
    }

    #[test]
    fn test_organisation_keywords() {
        assert_eq!(classify_name("Musterholding"), PartyKind::LegalEntity);
        assert_eq!(classify_name("Familie Muster Stiftung"), PartyKind::LegalEntity);
        assert_eq!(classify_name("Stadt München"), PartyKind::LegalEntity);
        assert_eq!(classify_name("Freistaat Bayern"), PartyKind::LegalEntity);
    }

    #[test]
    fn test_short_forms_need_token_boundaries() {
        // "Ag" inside a surname must not read as Aktiengesellschaft
        assert_eq!(classify_name("Hans Agricola"), PartyKind::NaturalPerson);
        assert_eq!(classify_name("Sebastian Segler"), PartyKind::NaturalPerson);
        assert_eq!(classify_name("Kai Landmann"), PartyKind::NaturalPerson);
    }

    // =========================================================================
    // Other
    // =========================================================================

    #[test]
    fn test_groupings_are_other() {
        assert_eq!(classify_name("Erbengemeinschaft nach Max Muster"), PartyKind::Other);
        assert_eq!(classify_name("Eheleute Max und Erika Muster"), PartyKind::Other);
        assert_eq!(classify_name(""), PartyKind::Other);
    }

    // =========================================================================
    // Name cleanup
    // =========================================================================

    #[test]
    fn test_clean_name() {
        assert_eq!(clean_name("  Max\u{00A0}  Mustermann, "), "Max Mustermann");
        assert_eq!(clean_name("| Muster GmbH |"), "Muster GmbH");
        assert_eq!(clean_name("Tennisclub e.V."), "Tennisclub e.V.");
    }

    #[test]
    fn test_dedup_key_ignores_case_and_punctuation() {
        assert_eq!(dedup_key("Max Mustermann"), dedup_key("MAX  MUSTERMANN"));
        assert_eq!(dedup_key("Muster GmbH"), dedup_key("Muster-GmbH"));
        assert_ne!(dedup_key("Max Mustermann"), dedup_key("Moritz Mustermann"));
    }

    #[test]
    fn test_has_legal_form() {
        assert!(has_legal_form("Muster GmbH"));
        assert!(!has_legal_form("Max Mustermann"));
    }
}
