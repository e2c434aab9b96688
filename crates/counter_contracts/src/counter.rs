#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{ContractViolation, SchemaVersion, UnixTimeMs, Validate};

pub const COUNTER_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const NATIONAL_ID_LEN: usize = 10;
pub const YEAR_CODE_LEN: usize = 2;
pub const PREFIX_LEN: usize = 3;
pub const SUBJECT_HASH_LEN: usize = 64;
pub const DEFAULT_SEQUENCE_WIDTH: u8 = 4;
pub const MAX_SEQUENCE_WIDTH: u8 = 9;

fn all_ascii_digits(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

/// Maps Persian (U+06F0..U+06F9) and Arabic-Indic (U+0660..U+0669) digits onto
/// ASCII and trims surrounding whitespace. Other characters pass through.
pub fn normalize_digits(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| match c {
            '\u{06F0}'..='\u{06F9}' => shift_digit(c, 0x06F0),
            '\u{0660}'..='\u{0669}' => shift_digit(c, 0x0660),
            other => other,
        })
        .collect()
}

fn shift_digit(c: char, zero: u32) -> char {
    char::from_digit(c as u32 - zero, 10).unwrap_or(c)
}

/// Ten-digit national identifier after digit normalisation.
///
/// `Debug` masks all but the last four digits so the value can sit inside
/// error payloads and test failures without leaking.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NationalId(String);

impl NationalId {
    pub fn new(raw: &str) -> Result<Self, ContractViolation> {
        let v = Self(normalize_digits(raw));
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NationalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tail = self.0.get(self.0.len().saturating_sub(4)..).unwrap_or("");
        write!(f, "NationalId(******{tail})")
    }
}

impl Validate for NationalId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.len() != NATIONAL_ID_LEN || !all_ascii_digits(&self.0) {
            return Err(ContractViolation::InvalidValue {
                field: "national_id",
                reason: "must be exactly 10 digits",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Gender {
    Female,
    Male,
}

impl Gender {
    pub const ALL: [Gender; 2] = [Gender::Female, Gender::Male];

    pub fn from_code(code: i64) -> Result<Self, ContractViolation> {
        match code {
            0 => Ok(Gender::Female),
            1 => Ok(Gender::Male),
            _ => Err(ContractViolation::InvalidValue {
                field: "gender",
                reason: "must be 0 or 1",
            }),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Gender::Female => 0,
            Gender::Male => 1,
        }
    }

    /// Accepts the canonical codes and the aliases used by upstream ingestion
    /// files (`f`, `female`, `زن`, `ز`, `m`, `male`, `مرد`, `م`).
    pub fn parse_alias(raw: &str) -> Result<Self, ContractViolation> {
        let normalized = normalize_digits(raw).to_lowercase();
        match normalized.as_str() {
            "0" | "f" | "female" | "زن" | "ز" => Ok(Gender::Female),
            "1" | "m" | "male" | "مرد" | "م" => Ok(Gender::Male),
            _ => Err(ContractViolation::InvalidValue {
                field: "gender",
                reason: "unrecognized gender code or alias",
            }),
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct YearCode(String);

impl YearCode {
    pub fn new(raw: &str) -> Result<Self, ContractViolation> {
        let v = Self(normalize_digits(raw));
        v.validate()?;
        Ok(v)
    }

    /// Two-digit code of a calendar year (`2024` -> `"24"`).
    pub fn from_year(year: i32) -> Self {
        Self(format!("{:02}", year.rem_euclid(100)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for YearCode {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.len() != YEAR_CODE_LEN || !all_ascii_digits(&self.0) {
            return Err(ContractViolation::InvalidValue {
                field: "year_code",
                reason: "must be exactly 2 digits",
            });
        }
        Ok(())
    }
}

impl TryFrom<String> for YearCode {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        YearCode::new(&value)
    }
}

impl From<YearCode> for String {
    fn from(value: YearCode) -> Self {
        value.0
    }
}

impl fmt::Display for YearCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Partition within which sequence numbers are allocated.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bucket {
    pub gender: Gender,
    pub year_code: YearCode,
}

impl Bucket {
    pub fn new(gender: Gender, year_code: YearCode) -> Self {
        Self { gender, year_code }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.year_code, self.gender)
    }
}

/// Lowercase SHA-256 hex digest identifying a subject in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubjectHash(String);

impl SubjectHash {
    pub fn new(hex: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(hex.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for SubjectHash {
    fn validate(&self) -> Result<(), ContractViolation> {
        let ok = self.0.len() == SUBJECT_HASH_LEN
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !ok {
            return Err(ContractViolation::InvalidValue {
                field: "national_id_hash",
                reason: "must be 64 lowercase hex characters",
            });
        }
        Ok(())
    }
}

/// Gender -> prefix mapping. Total over [`Gender::ALL`]; prefixes are distinct
/// three-digit strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixMap {
    prefixes: BTreeMap<Gender, String>,
}

impl PrefixMap {
    pub fn new(female: &str, male: &str) -> Result<Self, ContractViolation> {
        let v = Self {
            prefixes: BTreeMap::from([
                (Gender::Female, female.to_string()),
                (Gender::Male, male.to_string()),
            ]),
        };
        v.validate()?;
        Ok(v)
    }

    pub fn mvp_v1() -> Self {
        Self {
            prefixes: BTreeMap::from([
                (Gender::Female, "373".to_string()),
                (Gender::Male, "357".to_string()),
            ]),
        }
    }

    pub fn prefix_for(&self, gender: Gender) -> &str {
        self.prefixes.get(&gender).map(String::as_str).unwrap_or("")
    }

    /// Resolves a raw gender code; anything outside the canonical codes fails.
    pub fn prefix_for_code(&self, code: i64) -> Result<(Gender, &str), ContractViolation> {
        let gender = Gender::from_code(code)?;
        Ok((gender, self.prefix_for(gender)))
    }

    pub fn gender_for_prefix(&self, prefix: &str) -> Option<Gender> {
        self.prefixes
            .iter()
            .find(|(_, p)| p.as_str() == prefix)
            .map(|(g, _)| *g)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Gender, &str)> {
        self.prefixes.iter().map(|(g, p)| (*g, p.as_str()))
    }
}

impl Validate for PrefixMap {
    fn validate(&self) -> Result<(), ContractViolation> {
        for gender in Gender::ALL {
            let prefix = self
                .prefixes
                .get(&gender)
                .ok_or(ContractViolation::InvalidValue {
                    field: "prefix_map",
                    reason: "must cover every gender code",
                })?;
            if prefix.len() != PREFIX_LEN || !all_ascii_digits(prefix) {
                return Err(ContractViolation::InvalidValue {
                    field: "prefix_map.prefix",
                    reason: "must be exactly 3 digits",
                });
            }
        }
        if self.prefix_for(Gender::Female) == self.prefix_for(Gender::Male) {
            return Err(ContractViolation::InvalidValue {
                field: "prefix_map.prefix",
                reason: "prefixes must be distinct",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterFormat {
    pub sequence_width: u8,
    pub max_sequence: u32,
}

impl CounterFormat {
    pub fn new(sequence_width: u8, max_sequence: u32) -> Result<Self, ContractViolation> {
        let v = Self {
            sequence_width,
            max_sequence,
        };
        v.validate()?;
        Ok(v)
    }

    /// Uses the full numeric range of the width as the bucket maximum.
    pub fn with_width(sequence_width: u8) -> Result<Self, ContractViolation> {
        if !(1..=MAX_SEQUENCE_WIDTH).contains(&sequence_width) {
            return Err(ContractViolation::InvalidRange {
                field: "counter_format.sequence_width",
                min: 1,
                max: MAX_SEQUENCE_WIDTH as u64,
                got: sequence_width as u64,
            });
        }
        Self::new(sequence_width, width_ceiling(sequence_width))
    }

    pub fn mvp_v1() -> Self {
        Self {
            sequence_width: DEFAULT_SEQUENCE_WIDTH,
            max_sequence: width_ceiling(DEFAULT_SEQUENCE_WIDTH),
        }
    }

    pub fn counter_len(&self) -> usize {
        PREFIX_LEN + YEAR_CODE_LEN + self.sequence_width as usize
    }
}

fn width_ceiling(width: u8) -> u32 {
    10u32.saturating_pow(width as u32).saturating_sub(1)
}

impl Validate for CounterFormat {
    fn validate(&self) -> Result<(), ContractViolation> {
        if !(1..=MAX_SEQUENCE_WIDTH).contains(&self.sequence_width) {
            return Err(ContractViolation::InvalidRange {
                field: "counter_format.sequence_width",
                min: 1,
                max: MAX_SEQUENCE_WIDTH as u64,
                got: self.sequence_width as u64,
            });
        }
        let ceiling = width_ceiling(self.sequence_width);
        if self.max_sequence == 0 || self.max_sequence > ceiling {
            return Err(ContractViolation::InvalidRange {
                field: "counter_format.max_sequence",
                min: 1,
                max: ceiling as u64,
                got: self.max_sequence as u64,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCounter {
    pub prefix: String,
    pub gender: Gender,
    pub year_code: YearCode,
    pub sequence: u32,
}

/// Encoding rules shared by the live service and the reconciler.
#[derive(Debug, Clone)]
pub struct CounterCodec {
    prefixes: PrefixMap,
    format: CounterFormat,
    pattern: Regex,
}

impl CounterCodec {
    pub fn new(prefixes: PrefixMap, format: CounterFormat) -> Result<Self, ContractViolation> {
        prefixes.validate()?;
        format.validate()?;
        let alternatives = prefixes
            .iter()
            .map(|(_, p)| regex::escape(p))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = Regex::new(&format!(
            r"^({alternatives})(\d{{{YEAR_CODE_LEN}}})(\d{{{}}})$",
            format.sequence_width
        ))
        .map_err(|_| ContractViolation::InvalidValue {
            field: "counter_codec.pattern",
            reason: "failed to compile counter pattern",
        })?;
        Ok(Self {
            prefixes,
            format,
            pattern,
        })
    }

    pub fn mvp_v1() -> Result<Self, ContractViolation> {
        Self::new(PrefixMap::mvp_v1(), CounterFormat::mvp_v1())
    }

    pub fn prefixes(&self) -> &PrefixMap {
        &self.prefixes
    }

    pub fn format(&self) -> CounterFormat {
        self.format
    }

    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }

    pub fn encode(
        &self,
        gender: Gender,
        year_code: &YearCode,
        sequence: u32,
    ) -> Result<String, ContractViolation> {
        if sequence == 0 || sequence > self.format.max_sequence {
            return Err(ContractViolation::InvalidRange {
                field: "counter.sequence",
                min: 1,
                max: self.format.max_sequence as u64,
                got: sequence as u64,
            });
        }
        let counter = format!(
            "{}{}{:0width$}",
            self.prefixes.prefix_for(gender),
            year_code,
            sequence,
            width = self.format.sequence_width as usize
        );
        if !self.pattern.is_match(&counter) {
            return Err(ContractViolation::InvalidValue {
                field: "counter",
                reason: "encoded counter violates the counter pattern",
            });
        }
        Ok(counter)
    }

    pub fn parse(&self, counter: &str) -> Result<ParsedCounter, ContractViolation> {
        let invalid = ContractViolation::InvalidValue {
            field: "counter",
            reason: "does not match the counter pattern",
        };
        let caps = self.pattern.captures(counter).ok_or(invalid.clone())?;
        let prefix = caps.get(1).map(|m| m.as_str()).ok_or(invalid.clone())?;
        let year = caps.get(2).map(|m| m.as_str()).ok_or(invalid.clone())?;
        let sequence = caps
            .get(3)
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .ok_or(invalid.clone())?;
        let gender = self.prefixes.gender_for_prefix(prefix).ok_or(invalid)?;
        Ok(ParsedCounter {
            prefix: prefix.to_string(),
            gender,
            year_code: YearCode::new(year)?,
            sequence,
        })
    }

    /// Leading three characters of a counter, whether or not it is well formed.
    pub fn prefix_of<'a>(&self, counter: &'a str) -> Option<&'a str> {
        counter.get(..PREFIX_LEN)
    }

    pub fn is_well_formed(&self, counter: &str) -> bool {
        self.pattern.is_match(counter)
    }

    /// `373540001` -> `373****01`.
    pub fn mask(counter: &str) -> String {
        let head = counter.get(..3).unwrap_or("");
        let tail = counter.get(counter.len().saturating_sub(2)..).unwrap_or("");
        format!("{head}****{tail}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterRecord {
    pub schema_version: SchemaVersion,
    pub national_id_hash: SubjectHash,
    pub gender: Gender,
    pub year_code: YearCode,
    pub sequence: u32,
    pub counter: String,
    pub created_at: UnixTimeMs,
}

impl CounterRecord {
    pub fn v1(
        codec: &CounterCodec,
        national_id_hash: SubjectHash,
        bucket: Bucket,
        sequence: u32,
        created_at: UnixTimeMs,
    ) -> Result<Self, ContractViolation> {
        let counter = codec.encode(bucket.gender, &bucket.year_code, sequence)?;
        Ok(Self {
            schema_version: COUNTER_CONTRACT_VERSION,
            national_id_hash,
            gender: bucket.gender,
            year_code: bucket.year_code,
            sequence,
            counter,
            created_at,
        })
    }

    pub fn bucket(&self) -> Bucket {
        Bucket::new(self.gender, self.year_code.clone())
    }

    /// True when the stored string is exactly what the codec derives from the
    /// record's own gender, year and sequence.
    pub fn is_canonical(&self, codec: &CounterCodec) -> bool {
        codec
            .encode(self.gender, &self.year_code, self.sequence)
            .map(|expected| expected == self.counter)
            .unwrap_or(false)
    }
}
