//! The 20-digit consecutive number and the 50-digit clave.
use std::{fmt, str::FromStr};

use chrono::NaiveDate;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::DocumentType;

const CLAVE_LEN: usize = 50;
const CONSECUTIVE_LEN: usize = 20;
const COUNTRY_CODE: &str = "506";
const ISSUER_ID_WIDTH: usize = 12;

const MAX_BRANCH: u16 = 999;
const MAX_TERMINAL: u32 = 99_999;
const MAX_SEQUENCE: u64 = 9_999_999_999;
const SECURITY_CODE_BOUND: u32 = 100_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClaveError {
    #[error("Clave must be 50 digits, got {0}")]
    InvalidLength(usize),
    #[error("Expected only ASCII digits, found '{found}' at position {position}")]
    NonDigit { position: usize, found: char },
    #[error("Issuer id '{0}' does not fit in 12 digits")]
    InvalidIssuer(String),
    #[error("Consecutive number field out of range: {0}")]
    OutOfRange(&'static str),
    #[error("Unknown document type code {0}")]
    UnknownDocumentType(String),
    #[error("Unknown situation code {0}")]
    UnknownSituation(char),
    #[error("Invalid date in clave: {0}")]
    InvalidDate(String),
}

fn ensure_digits(value: &str) -> Result<(), ClaveError> {
    match value.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((position, found)) => Err(ClaveError::NonDigit { position, found }),
        None => Ok(()),
    }
}

/// Why the document was issued the way it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SituationCode {
    Normal,
    Contingency,
    NoInternet,
}

impl SituationCode {
    pub fn digit(&self) -> char {
        match self {
            SituationCode::Normal => '1',
            SituationCode::Contingency => '2',
            SituationCode::NoInternet => '3',
        }
    }

    pub fn from_digit(digit: char) -> Result<Self, ClaveError> {
        match digit {
            '1' => Ok(SituationCode::Normal),
            '2' => Ok(SituationCode::Contingency),
            '3' => Ok(SituationCode::NoInternet),
            other => Err(ClaveError::UnknownSituation(other)),
        }
    }
}

/// Branch (3), terminal (5), document type (2), sequence (10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsecutiveNumber {
    branch: u16,
    terminal: u32,
    document_type: DocumentType,
    sequence: u64,
}

impl ConsecutiveNumber {
    pub fn new(
        branch: u16,
        terminal: u32,
        document_type: DocumentType,
        sequence: u64,
    ) -> Result<Self, ClaveError> {
        if branch > MAX_BRANCH {
            return Err(ClaveError::OutOfRange("branch"));
        }
        if terminal > MAX_TERMINAL {
            return Err(ClaveError::OutOfRange("terminal"));
        }
        if sequence == 0 || sequence > MAX_SEQUENCE {
            return Err(ClaveError::OutOfRange("sequence"));
        }
        Ok(Self {
            branch,
            terminal,
            document_type,
            sequence,
        })
    }

    pub fn branch(&self) -> u16 {
        self.branch
    }

    pub fn terminal(&self) -> u32 {
        self.terminal
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl fmt::Display for ConsecutiveNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:03}{:05}{}{:010}",
            self.branch,
            self.terminal,
            self.document_type.code(),
            self.sequence
        )
    }
}

impl FromStr for ConsecutiveNumber {
    type Err = ClaveError;

    fn from_str(value: &str) -> Result<Self, ClaveError> {
        if value.len() != CONSECUTIVE_LEN {
            return Err(ClaveError::OutOfRange("consecutive length"));
        }
        ensure_digits(value)?;
        let number = |range: std::ops::Range<usize>| value[range].parse::<u64>().unwrap_or(0);
        let document_type = DocumentType::from_code(&value[8..10])?;
        Self::new(
            number(0..3) as u16,
            number(3..8) as u32,
            document_type,
            number(10..20),
        )
    }
}

/// The 50-digit document key.
///
/// `506`, `DDMMYY`, issuer id (12), consecutive number (20), situation (1),
/// security code (8).
///
/// # Examples
/// ```rust
/// use chrono::NaiveDate;
/// use factura_core::document::{Clave, ConsecutiveNumber, DocumentType, SituationCode};
///
/// let consecutive = ConsecutiveNumber::new(1, 1, DocumentType::Invoice, 1)?;
/// let date = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
/// let clave = Clave::generate(date, "3-101-123456", &consecutive, SituationCode::Normal, 1)?;
/// assert_eq!(
///     clave.as_str(),
///     "50601012500310112345600100001010000000001100000001"
/// );
/// # Ok::<(), factura_core::document::ClaveError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Clave(String);

impl Clave {
    pub fn generate(
        date: NaiveDate,
        issuer_id: &str,
        consecutive: &ConsecutiveNumber,
        situation: SituationCode,
        security_code: u32,
    ) -> Result<Self, ClaveError> {
        let issuer: String = issuer_id
            .chars()
            .filter(|c| *c != '-' && !c.is_whitespace())
            .collect();
        if issuer.is_empty() || issuer.len() > ISSUER_ID_WIDTH {
            return Err(ClaveError::InvalidIssuer(issuer_id.to_string()));
        }
        ensure_digits(&issuer).map_err(|_| ClaveError::InvalidIssuer(issuer_id.to_string()))?;
        if security_code >= SECURITY_CODE_BOUND {
            return Err(ClaveError::OutOfRange("security code"));
        }
        let clave = format!(
            "{COUNTRY_CODE}{}{issuer:0>12}{consecutive}{}{security_code:08}",
            date.format("%d%m%y"),
            situation.digit(),
        );
        Self::parse(&clave)
    }

    /// Generate with a random security code.
    pub fn generate_random(
        date: NaiveDate,
        issuer_id: &str,
        consecutive: &ConsecutiveNumber,
        situation: SituationCode,
    ) -> Result<Self, ClaveError> {
        let security_code = rand::thread_rng().gen_range(0..SECURITY_CODE_BOUND);
        Self::generate(date, issuer_id, consecutive, situation, security_code)
    }

    /// Accept exactly 50 ASCII digits with a valid embedded structure.
    pub fn parse(value: &str) -> Result<Self, ClaveError> {
        let length = value.chars().count();
        if length != CLAVE_LEN {
            return Err(ClaveError::InvalidLength(length));
        }
        ensure_digits(value)?;
        let clave = Self(value.to_string());
        clave.date()?;
        clave.consecutive()?;
        clave.situation()?;
        Ok(clave)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn country_code(&self) -> &str {
        &self.0[0..3]
    }

    pub fn date(&self) -> Result<NaiveDate, ClaveError> {
        NaiveDate::parse_from_str(&self.0[3..9], "%d%m%y")
            .map_err(|_| ClaveError::InvalidDate(self.0[3..9].to_string()))
    }

    /// Issuer id as embedded, left-padded with zeros.
    pub fn issuer_id(&self) -> &str {
        &self.0[9..21]
    }

    pub fn consecutive(&self) -> Result<ConsecutiveNumber, ClaveError> {
        self.0[21..41].parse()
    }

    pub fn situation(&self) -> Result<SituationCode, ClaveError> {
        let digit = self.0[41..42].chars().next().unwrap_or('0');
        SituationCode::from_digit(digit)
    }

    pub fn security_code(&self) -> &str {
        &self.0[42..50]
    }
}

impl fmt::Display for Clave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Clave {
    type Err = ClaveError;

    fn from_str(value: &str) -> Result<Self, ClaveError> {
        Self::parse(value)
    }
}

impl TryFrom<String> for Clave {
    type Error = ClaveError;

    fn try_from(value: String) -> Result<Self, ClaveError> {
        Self::parse(&value)
    }
}

impl From<Clave> for String {
    fn from(clave: Clave) -> String {
        clave.0
    }
}
