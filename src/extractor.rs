//! Turns noisy OCR text into ranked licence plate candidates.
//!
//! OCR of a plate on a moving, angled and partly reflective surface comes back
//! in many shapes: glued together with neighbouring text, split by spaces, or
//! as a token with trailing garbage. Four independent strategies each cover one
//! of those shapes and tag their hits with a fixed confidence; the merged list
//! is ranked so the coordinator can try the most plausible reading first.

use crate::types::{CandidateSource, PlateCandidate, PlateFormat};
use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashSet;

/// Words printed on plate backgrounds (country, states, their abbreviations
/// and large cities). They are never part of a plate number.
const DENYLIST: &[&str] = &[
    "BRASIL", "BRAZIL", "MERCOSUL",
    // states
    "ACRE", "ALAGOAS", "AMAPA", "AMAZONAS", "BAHIA", "CEARA", "DISTRITO", "FEDERAL",
    "ESPIRITO", "SANTO", "GOIAS", "MARANHAO", "MATO", "GROSSO", "MINAS", "GERAIS", "PARA",
    "PARAIBA", "PARANA", "PERNAMBUCO", "PIAUI", "RIO", "JANEIRO", "GRANDE", "NORTE", "SUL",
    "RONDONIA", "RORAIMA", "SANTA", "CATARINA", "SAO", "PAULO", "SERGIPE", "TOCANTINS",
    // state abbreviations
    "AC", "AL", "AP", "AM", "BA", "CE", "DF", "ES", "GO", "MA", "MT", "MS", "MG", "PA", "PB",
    "PR", "PE", "PI", "RJ", "RN", "RS", "RO", "RR", "SC", "SP", "SE", "TO",
    // cities
    "BELO", "HORIZONTE", "BRASILIA", "SALVADOR", "FORTALEZA", "RECIFE", "MANAUS", "CURITIBA",
    "PORTO", "ALEGRE", "BELEM", "GOIANIA", "CAMPINAS", "FLORIANOPOLIS", "VITORIA",
    "UBERLANDIA", "CONTAGEM", "BETIM", "JUIZ", "FORA", "NITEROI", "GUARULHOS", "SANTOS",
];

const PLATE_LEN: usize = 7;

const MERCOSUL_SPACED: &str = r"[A-Z]{3}\s?[0-9]\s?[A-Z]\s?[0-9]{2}";
const LEGACY_SPACED: &str = r"[A-Z]{3}\s?[0-9]{4}";

pub struct PlateExtractor {
    spaced: [Regex; 2],
}

impl Default for PlateExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl PlateExtractor {
    pub fn new() -> Self {
        PlateExtractor {
            spaced: [
                Regex::new(MERCOSUL_SPACED).expect("mercosul pattern compiles"),
                Regex::new(LEGACY_SPACED).expect("legacy pattern compiles"),
            ],
        }
    }

    /// Returns every distinct plate found in `text`, best first.
    pub fn extract(&self, text: &str) -> Vec<PlateCandidate> {
        let normalized = normalize(text);
        let tokens = surviving_tokens(&normalized);

        let mut candidates = Vec::new();
        continuous_scan(&tokens, &mut candidates);
        self.pattern_scan(&normalized, &mut candidates);
        adjacent_words(&tokens, &mut candidates);
        single_words(&tokens, &mut candidates);

        rank(candidates)
    }

    fn pattern_scan(&self, normalized: &str, out: &mut Vec<PlateCandidate>) {
        // Short tokens stay in here: a spaced Mercosul plate ("ABC 1 D 23")
        // is made of them.
        let text = normalized
            .split(' ')
            .filter(|t| !t.is_empty() && !is_denied(t))
            .collect::<Vec<_>>()
            .join(" ");
        for regex in self.spaced.iter() {
            for m in regex.find_iter(&text) {
                let plate: String = m.as_str().chars().filter(|c| !c.is_whitespace()).collect();
                push(out, &plate, CandidateSource::Pattern);
            }
        }
    }
}

/// Uppercases, maps everything outside `[A-Z0-9]` and whitespace to a space,
/// and collapses runs of whitespace.
pub fn normalize(text: &str) -> String {
    let mapped: String = text
        .to_uppercase()
        .chars()
        .map(|c| {
            if c.is_ascii_uppercase() || c.is_ascii_digit() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_denied(token: &str) -> bool {
    DENYLIST.contains(&token)
}

fn surviving_tokens(normalized: &str) -> Vec<&str> {
    normalized
        .split(' ')
        .filter(|t| t.len() >= 2 && !is_denied(t))
        .filter(|t| {
            let letters = t.chars().any(|c| c.is_ascii_uppercase());
            let digits = t.chars().any(|c| c.is_ascii_digit());
            (letters && digits) || (letters && !digits) || (digits && !letters)
        })
        .collect()
}

fn push(out: &mut Vec<PlateCandidate>, plate: &str, source: CandidateSource) {
    if let Some(format) = PlateFormat::classify(plate) {
        out.push(PlateCandidate {
            plate: plate.to_string(),
            format,
            source,
            confidence: source.confidence(),
        });
    }
}

fn continuous_scan(tokens: &[&str], out: &mut Vec<PlateCandidate>) {
    let joined = tokens.concat();
    if joined.len() < PLATE_LEN {
        return;
    }
    for start in 0..=joined.len() - PLATE_LEN {
        push(out, &joined[start..start + PLATE_LEN], CandidateSource::Continuous);
    }
}

fn adjacent_words(tokens: &[&str], out: &mut Vec<PlateCandidate>) {
    for pair in tokens.windows(2) {
        let joined = [pair[0], pair[1]].concat();
        push(out, &joined, CandidateSource::Words);
    }
}

fn single_words(tokens: &[&str], out: &mut Vec<PlateCandidate>) {
    for token in tokens.iter().filter(|t| t.len() >= PLATE_LEN) {
        push(out, &token[..PLATE_LEN], CandidateSource::Word);
    }
}

fn rank(mut candidates: Vec<PlateCandidate>) -> Vec<PlateCandidate> {
    // Stable sort: equal confidences keep discovery order.
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });
    let mut seen = HashSet::new();
    candidates.retain(|c| seen.insert(c.plate.clone()));
    candidates
}
