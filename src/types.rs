use image::DynamicImage;
use serde_json::{json, Value};
use std::fmt;

/// A still snapshot of the camera stream at its native resolution.
pub type Frame = DynamicImage;

/// Raw OCR output for one frame. `confidence` is on the engine's 0-100 scale.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionResult {
    pub text: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlateFormat {
    /// Three letters, one digit, one letter, two digits (ABC1D23).
    Mercosul,
    /// Three letters, four digits (ABC1234).
    Legacy,
}

impl PlateFormat {
    /// Classifies a 7-character string against the two plate grammars.
    pub fn classify(s: &str) -> Option<PlateFormat> {
        let b = s.as_bytes();
        if b.len() != 7 || !b[..3].iter().all(u8::is_ascii_uppercase) {
            return None;
        }
        let digit = |i: usize| b[i].is_ascii_digit();
        if digit(3) && digit(5) && digit(6) {
            if digit(4) {
                return Some(PlateFormat::Legacy);
            }
            if b[4].is_ascii_uppercase() {
                return Some(PlateFormat::Mercosul);
            }
        }
        None
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PlateFormat::Mercosul => "mercosul",
            PlateFormat::Legacy => "legacy",
        }
    }
}

/// Which extraction strategy produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSource {
    Continuous,
    Pattern,
    Words,
    Word,
}

impl CandidateSource {
    pub fn confidence(self) -> f64 {
        match self {
            CandidateSource::Continuous => 0.9,
            CandidateSource::Pattern => 0.8,
            CandidateSource::Words => 0.7,
            CandidateSource::Word => 0.6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CandidateSource::Continuous => "continuous",
            CandidateSource::Pattern => "pattern",
            CandidateSource::Words => "words",
            CandidateSource::Word => "word",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlateCandidate {
    pub plate: String,
    pub format: PlateFormat,
    pub source: CandidateSource,
    pub confidence: f64,
}

/// Backend record for a plate. Opaque to the scanner apart from the identity
/// fields needed to route the UI; `raw` carries the full backend payload.
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleRecord {
    pub plate: String,
    pub appointment_id: Option<String>,
    pub owner_name: Option<String>,
    pub raw: Value,
}

impl VehicleRecord {
    pub fn new(plate: &str) -> Self {
        VehicleRecord {
            plate: plate.to_string(),
            appointment_id: None,
            owner_name: None,
            raw: Value::Null,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "plate": self.plate,
            "appointmentId": self.appointment_id,
            "ownerName": self.owner_name,
            "raw": self.raw,
        })
    }
}

/// Three-way result of a backend plate lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    /// Vehicle has an active appointment.
    Appointment(VehicleRecord),
    /// Vehicle (and possibly its owner) is known but has no booking.
    OwnerWithoutAppointment(VehicleRecord),
    /// Plate is unknown to the backend.
    NotRegistered,
}

impl LookupOutcome {
    pub fn into_match(self) -> Option<(MatchKind, VehicleRecord)> {
        match self {
            LookupOutcome::Appointment(r) => Some((MatchKind::Appointment, r)),
            LookupOutcome::OwnerWithoutAppointment(r) => {
                Some((MatchKind::OwnerWithoutAppointment, r))
            }
            LookupOutcome::NotRegistered => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Appointment,
    OwnerWithoutAppointment,
}

impl MatchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchKind::Appointment => "appointment",
            MatchKind::OwnerWithoutAppointment => "owner_without_appointment",
        }
    }
}

impl fmt::Display for MatchKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The candidate that ended a session, with the backend's answer for it.
#[derive(Debug, Clone, PartialEq)]
pub struct PlateMatch {
    pub kind: MatchKind,
    pub candidate: PlateCandidate,
    pub record: VehicleRecord,
}

impl PlateMatch {
    pub fn to_json(&self) -> Value {
        json!({
            "kind": self.kind.as_str(),
            "plate": self.candidate.plate,
            "format": self.candidate.format.as_str(),
            "source": self.candidate.source.as_str(),
            "confidence": self.candidate.confidence,
            "record": self.record.to_json(),
        })
    }
}

/// Notifications forwarded from the coordinator to the UI side.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    Matched(PlateMatch),
    Failed(String),
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_accepts_only_the_two_grammars() {
        assert_eq!(PlateFormat::classify("ABC1234"), Some(PlateFormat::Legacy));
        assert_eq!(PlateFormat::classify("ABC1D23"), Some(PlateFormat::Mercosul));
        assert_eq!(PlateFormat::classify("AB12345"), None);
        assert_eq!(PlateFormat::classify("ABC12D3"), None);
        assert_eq!(PlateFormat::classify("abc1234"), None);
        assert_eq!(PlateFormat::classify("ABC123"), None);
        assert_eq!(PlateFormat::classify("ABC12345"), None);
        assert_eq!(PlateFormat::classify("ABCD123"), None);
    }

    #[test]
    fn not_registered_is_not_a_match() {
        assert_eq!(LookupOutcome::NotRegistered.into_match(), None);
        let record = VehicleRecord::new("ABC1234");
        let (kind, r) = LookupOutcome::OwnerWithoutAppointment(record.clone())
            .into_match()
            .unwrap();
        assert_eq!(kind, MatchKind::OwnerWithoutAppointment);
        assert_eq!(r, record);
    }
}
