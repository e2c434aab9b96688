#![forbid(unsafe_code)]

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Utc};
use counter_contracts::counter::YearCode;
use counter_contracts::ContractViolation;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Maps an instant to an academic-year code. Implementations are pure in the
/// timestamp: the same instant always resolves to the same code.
pub trait YearProvider: Send + Sync {
    fn resolve(&self, at: DateTime<Utc>) -> YearCode;
}

/// Academic year that rolls over at a fixed local date.
///
/// Instants strictly before `month-day 00:00` local time of calendar year `Y`
/// belong to year `Y-1`; instants at or after it belong to `Y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutoverYearProvider {
    cutover_month: u32,
    cutover_day: u32,
    offset: FixedOffset,
}

impl CutoverYearProvider {
    pub fn new(
        cutover_month: u32,
        cutover_day: u32,
        utc_offset_minutes: i32,
    ) -> Result<Self, ContractViolation> {
        // Checked against a non-leap year so the boundary exists every year.
        if NaiveDate::from_ymd_opt(2001, cutover_month, cutover_day).is_none() {
            return Err(ContractViolation::InvalidValue {
                field: "year_provider.cutover",
                reason: "must be a valid month/day in every year",
            });
        }
        let offset = utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or(ContractViolation::InvalidValue {
                field: "year_provider.utc_offset_minutes",
                reason: "must be within +/- 24h",
            })?;
        Ok(Self {
            cutover_month,
            cutover_day,
            offset,
        })
    }

    /// 23 September, Tehran standard time (UTC+03:30).
    pub fn mvp_v1() -> Result<Self, ContractViolation> {
        Self::new(9, 23, 210)
    }
}

impl YearProvider for CutoverYearProvider {
    fn resolve(&self, at: DateTime<Utc>) -> YearCode {
        let local = at.with_timezone(&self.offset).date_naive();
        let year = local.year();
        let after_cutover = NaiveDate::from_ymd_opt(year, self.cutover_month, self.cutover_day)
            .map(|boundary| local >= boundary)
            .unwrap_or(true);
        if after_cutover {
            YearCode::from_year(year)
        } else {
            YearCode::from_year(year - 1)
        }
    }
}

/// Always resolves to one pinned code; used by operator tools that receive
/// the year explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedYearProvider {
    year_code: YearCode,
}

impl FixedYearProvider {
    pub fn new(year_code: YearCode) -> Self {
        Self { year_code }
    }
}

impl YearProvider for FixedYearProvider {
    fn resolve(&self, _at: DateTime<Utc>) -> YearCode {
        self.year_code.clone()
    }
}
