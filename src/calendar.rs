//! Calendar of power-limit programs.
//!
//! The table is an ordered list: the first enabled program whose day, month
//! and time window contain the current instant is in force. Overlapping
//! windows are allowed and resolved by table order; [`Calendar::overlaps`]
//! lists them so they are not accidental. When nothing matches, the zero-power
//! default applies.

use chrono::{DateTime, Datelike, NaiveDateTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaySelector {
    Day(Weekday),
    /// Monday to Friday.
    BusinessDays,
    /// Saturday and Sunday.
    Weekend,
    Any,
}

impl DaySelector {
    pub fn matches(&self, day: Weekday) -> bool {
        match self {
            DaySelector::Day(d) => *d == day,
            DaySelector::BusinessDays => !matches!(day, Weekday::Sat | Weekday::Sun),
            DaySelector::Weekend => matches!(day, Weekday::Sat | Weekday::Sun),
            DaySelector::Any => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonthSelector {
    /// 1 = January.
    Month(u8),
    Any,
}

impl MonthSelector {
    pub fn matches(&self, month: u32) -> bool {
        match self {
            MonthSelector::Month(m) => u32::from(*m) == month,
            MonthSelector::Any => true,
        }
    }

    fn intersects(&self, other: &MonthSelector) -> bool {
        match (self, other) {
            (MonthSelector::Month(a), MonthSelector::Month(b)) => a == b,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
}

impl TimeOfDay {
    pub const fn new(hour: u8, minute: u8) -> Self {
        Self { hour, minute }
    }

    pub fn minutes(&self) -> u32 {
        u32::from(self.hour) * 60 + u32::from(self.minute)
    }
}

impl core::fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub id: u8,
    pub enabled: bool,
    pub day: DaySelector,
    pub month: MonthSelector,
    /// Inclusive.
    pub start: TimeOfDay,
    /// Exclusive.
    pub end: TimeOfDay,
    pub power_w: u32,
}

impl Program {
    pub fn matches(&self, now: &NaiveDateTime) -> bool {
        let minute_of_day = now.hour() * 60 + now.minute();
        self.enabled
            && self.month.matches(now.month())
            && self.day.matches(now.weekday())
            && self.start.minutes() <= minute_of_day
            && minute_of_day < self.end.minutes()
    }

    fn overlaps(&self, other: &Program) -> bool {
        const WEEK: [Weekday; 7] = [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ];
        self.enabled
            && other.enabled
            && self.month.intersects(&other.month)
            && WEEK.iter().any(|d| self.day.matches(*d) && other.day.matches(*d))
            && self.start.minutes() < other.end.minutes()
            && other.start.minutes() < self.end.minutes()
    }
}

/// Applied when no program matches: export blocked.
pub const DEFAULT_PROGRAM: Program = Program {
    id: 0x00,
    enabled: true,
    day: DaySelector::Any,
    month: MonthSelector::Any,
    start: TimeOfDay::new(0, 0),
    end: TimeOfDay::new(0, 0),
    power_w: 0,
};

const SUN: u8 = 0;
const SAT: u8 = 6;
const BUSINESS: u8 = 10;
const WEEKEND: u8 = 11;

/// Table entry from the compact calendar notation: day code 0..=6 is Sunday
/// to Saturday, 10 business days, 11 weekend; month 0 is any month.
pub const fn program(
    id: u8,
    day: u8,
    month: u8,
    start: (u8, u8),
    end: (u8, u8),
    power_w: u32,
) -> Program {
    let day = match day {
        0 => DaySelector::Day(Weekday::Sun),
        1 => DaySelector::Day(Weekday::Mon),
        2 => DaySelector::Day(Weekday::Tue),
        3 => DaySelector::Day(Weekday::Wed),
        4 => DaySelector::Day(Weekday::Thu),
        5 => DaySelector::Day(Weekday::Fri),
        6 => DaySelector::Day(Weekday::Sat),
        BUSINESS => DaySelector::BusinessDays,
        WEEKEND => DaySelector::Weekend,
        _ => DaySelector::Any,
    };
    let month = if month == 0 {
        MonthSelector::Any
    } else {
        MonthSelector::Month(month)
    };
    Program {
        id,
        enabled: true,
        day,
        month,
        start: TimeOfDay::new(start.0, start.1),
        end: TimeOfDay::new(end.0, end.1),
        power_w,
    }
}

/// Production calendar. 75 000 W is unrestricted, 0 W blocks export. Windows
/// ending at 23:59 leave the last minute of the day to the default.
pub static PROGRAMS: [Program; 106] = [
    program(0x01, BUSINESS,  1, ( 0,  0), (10,  0),  75_000),
    program(0x02, BUSINESS,  1, (10,  0), (15,  0),      0),
    program(0x03, BUSINESS,  1, (15,  0), (23, 59),  75_000),
    program(0x04, SAT,  1, ( 0,  0), (11,  0),  75_000),
    program(0x05, SAT,  1, (11,  0), (15,  0),      0),
    program(0x06, SAT,  1, (15,  0), (23, 59),  75_000),
    program(0x07, SUN,  1, ( 0,  0), (10,  0),  75_000),
    program(0x08, SUN,  1, (10,  0), (15,  0),      0),
    program(0x09, SUN,  1, (15,  0), (23, 59),  75_000),
    program(0x0A, BUSINESS,  2, ( 0,  0), (23, 59),  75_000),
    program(0x0B, SAT,  2, ( 0,  0), (11,  0),  75_000),
    program(0x0C, SAT,  2, (11,  0), (16,  0),      0),
    program(0x0D, SAT,  2, (16,  0), (23, 59),  75_000),
    program(0x0E, SUN,  2, ( 0,  0), (10,  0),  75_000),
    program(0x0F, SUN,  2, (10,  0), (16,  0),      0),
    program(0x10, SUN,  2, (16,  0), (23, 59),  75_000),
    program(0x11, BUSINESS,  3, ( 0,  0), (11,  0),  75_000),
    program(0x12, BUSINESS,  3, (11,  0), (14,  0),      0),
    program(0x13, BUSINESS,  3, (14,  0), (23, 59),  75_000),
    program(0x14, SAT,  3, ( 0,  0), (11,  0),  75_000),
    program(0x15, SAT,  3, (11,  0), (15,  0),      0),
    program(0x16, SAT,  3, (15,  0), (23, 59),  75_000),
    program(0x17, SUN,  3, ( 0,  0), (10,  0),  75_000),
    program(0x18, SUN,  3, (10,  0), (14,  0),      0),
    program(0x19, SUN,  3, (14,  0), (15,  0),  34_000),
    program(0x1A, SUN,  3, (15,  0), (23, 59),  75_000),
    program(0x1B, BUSINESS,  4, ( 0,  0), (10,  0),  75_000),
    program(0x1C, BUSINESS,  4, (10,  0), (14,  0),      0),
    program(0x1D, BUSINESS,  4, (14,  0), (23, 59),  75_000),
    program(0x1E, SAT,  4, ( 0,  0), (11,  0),  75_000),
    program(0x1F, SAT,  4, (11,  0), (15,  0),      0),
    program(0x20, SAT,  4, (15,  0), (23, 59),  75_000),
    program(0x21, SUN,  4, ( 0,  0), (11,  0),  75_000),
    program(0x22, SUN,  4, (11,  0), (15,  0),      0),
    program(0x23, SUN,  4, (15,  0), (23, 59),  75_000),
    program(0x24, BUSINESS,  5, ( 0,  0), (10,  0),  75_000),
    program(0x25, BUSINESS,  5, (10,  0), (15,  0),      0),
    program(0x26, BUSINESS,  5, (15,  0), (16,  0),  58_000),
    program(0x27, BUSINESS,  5, (16,  0), (23, 59),  75_000),
    program(0x28, SAT,  5, ( 0,  0), (10,  0),  75_000),
    program(0x29, SAT,  5, (10,  0), (16,  0),      0),
    program(0x2A, SAT,  5, (16,  0), (23, 59),  75_000),
    program(0x2B, SUN,  5, ( 0,  0), (10,  0),  75_000),
    program(0x2C, SUN,  5, (10,  0), (16,  0),      0),
    program(0x2D, SUN,  5, (16,  0), (23, 59),  75_000),
    program(0x2E, BUSINESS,  6, ( 0,  0), (11,  0),  75_000),
    program(0x2F, BUSINESS,  6, (11,  0), (16,  0),      0),
    program(0x30, BUSINESS,  6, (16,  0), (23, 59),  75_000),
    program(0x31, SAT,  6, ( 0,  0), (11,  0),  75_000),
    program(0x32, SAT,  6, (11,  0), (16,  0),      0),
    program(0x33, SAT,  6, (16,  0), (23, 59),  75_000),
    program(0x34, SUN,  6, ( 0,  0), (11,  0),  75_000),
    program(0x35, SUN,  6, (11,  0), (16,  0),      0),
    program(0x36, SUN,  6, (16,  0), (23, 59),  75_000),
    program(0x37, BUSINESS,  7, ( 0,  0), (11,  0),  75_000),
    program(0x38, BUSINESS,  7, (11,  0), (16,  0),      0),
    program(0x39, BUSINESS,  7, (16,  0), (23, 59),  75_000),
    program(0x3A, SAT,  7, ( 0,  0), (11,  0),  75_000),
    program(0x3B, SAT,  7, (11,  0), (16,  0),      0),
    program(0x3C, SAT,  7, (16,  0), (23, 59),  75_000),
    program(0x3D, SUN,  7, ( 0,  0), (10,  0),  75_000),
    program(0x3E, SUN,  7, (10,  0), (16,  0),      0),
    program(0x3F, SUN,  7, (16,  0), (23, 59),  75_000),
    program(0x40, BUSINESS,  8, ( 0,  0), (11,  0),  75_000),
    program(0x41, BUSINESS,  8, (11,  0), (15,  0),      0),
    program(0x42, BUSINESS,  8, (15,  0), (23, 59),  75_000),
    program(0x43, SAT,  8, ( 0,  0), (11,  0),  75_000),
    program(0x44, SAT,  8, (11,  0), (16,  0),      0),
    program(0x45, SAT,  8, (16,  0), (23, 59),  75_000),
    program(0x46, SUN,  8, ( 0,  0), (10,  0),  75_000),
    program(0x47, SUN,  8, (10,  0), (16,  0),      0),
    program(0x48, SUN,  8, (16,  0), (23, 59),  75_000),
    program(0x49, BUSINESS,  9, ( 0,  0), (13,  0),  75_000),
    program(0x4A, BUSINESS,  9, (13,  0), (14,  0),      0),
    program(0x4B, BUSINESS,  9, (14,  0), (23, 59),  75_000),
    program(0x4C, SAT,  9, ( 0,  0), (23, 59),  75_000),
    program(0x4D, SUN,  9, ( 0,  0), (11,  0),  75_000),
    program(0x4E, SUN,  9, (11,  0), (15,  0),      0),
    program(0x4F, SUN,  9, (15,  0), (23, 59),  75_000),
    program(0x50, BUSINESS, 10, ( 0,  0), (23, 59),  75_000),
    program(0x51, SAT, 10, ( 0,  0), (12,  0),  75_000),
    program(0x52, SAT, 10, (12,  0), (14,  0),      0),
    program(0x53, SAT, 10, (14,  0), (23, 59),  75_000),
    program(0x54, SUN, 10, ( 0,  0), (11,  0),  75_000),
    program(0x55, SUN, 10, (11,  0), (14,  0),      0),
    program(0x56, SUN, 10, (14,  0), (23, 59),  75_000),
    program(0x57, BUSINESS, 11, ( 0,  0), (23, 59),  75_000),
    program(0x58, SAT, 11, ( 0,  0), (13,  0),  75_000),
    program(0x59, SAT, 11, (13,  0), (14,  0),      0),
    program(0x5A, SAT, 11, (14,  0), (23, 59),  75_000),
    program(0x5B, SUN, 11, ( 0,  0), ( 9,  0),  75_000),
    program(0x5C, SUN, 11, ( 9,  0), (16,  0),      0),
    program(0x5D, SUN, 11, (16,  0), (23, 59),  75_000),
    program(0x5E, BUSINESS, 12, ( 0,  0), (10,  0),  75_000),
    program(0x5F, BUSINESS, 12, (10,  0), (14,  0),      0),
    program(0x60, BUSINESS, 12, (14,  0), (15,  0),  75_000),
    program(0x61, BUSINESS, 12, (15,  0), (16,  0),      0),
    program(0x62, BUSINESS, 12, (16,  0), (23, 59),  75_000),
    program(0x63, SAT, 12, ( 0,  0), (11,  0),  75_000),
    program(0x64, SAT, 12, (11,  0), (14,  0),      0),
    program(0x65, SAT, 12, (14,  0), (23, 59),  75_000),
    program(0x66, SUN, 12, ( 0,  0), (10,  0),  75_000),
    program(0x67, SUN, 12, (10,  0), (13,  0),      0),
    program(0x68, SUN, 12, (13,  0), (14,  0),  75_000),
    program(0x69, SUN, 12, (14,  0), (15,  0),      0),
    program(0x6A, SUN, 12, (15,  0), (23, 59),  75_000),
];

/// Desired value of the power-limit register (0.1 kW units).
pub fn desired_register(power_w: u32, rated_power_w: u32) -> u16 {
    u16::try_from(power_w.min(rated_power_w) / 100).unwrap_or(u16::MAX)
}

/// Local wall time of a local-time epoch.
pub fn local_time(epoch: u64) -> Option<NaiveDateTime> {
    let seconds = i64::try_from(epoch).ok()?;
    DateTime::from_timestamp(seconds, 0).map(|t| t.naive_utc())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEvaluation {
    pub program: Program,
    /// False when the zero-power default was applied.
    pub matched: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Calendar<'a> {
    programs: &'a [Program],
}

impl Calendar<'static> {
    pub fn production() -> Self {
        Self { programs: &PROGRAMS }
    }
}

impl<'a> Calendar<'a> {
    pub fn new(programs: &'a [Program]) -> Self {
        Self { programs }
    }

    pub fn programs(&self) -> &'a [Program] {
        self.programs
    }

    pub fn get(&self, id: u8) -> Option<&'a Program> {
        self.programs.iter().find(|p| p.id == id)
    }

    pub fn select(&self, now: &NaiveDateTime) -> ScheduleEvaluation {
        match self.programs.iter().find(|p| p.matches(now)) {
            Some(program) => ScheduleEvaluation {
                program: *program,
                matched: true,
            },
            None => ScheduleEvaluation {
                program: DEFAULT_PROGRAM,
                matched: false,
            },
        }
    }

    /// Pairs of program ids whose windows overlap; the earlier one wins.
    pub fn overlaps(&self) -> Vec<(u8, u8)> {
        let mut pairs = Vec::new();
        for (i, a) in self.programs.iter().enumerate() {
            for b in &self.programs[i + 1..] {
                if a.overlaps(b) {
                    pairs.push((a.id, b.id));
                }
            }
        }
        pairs
    }
}

impl Default for Calendar<'static> {
    fn default() -> Self {
        Self::production()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, hh: u32, mm: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(hh, mm, 0)
            .unwrap()
    }

    #[test]
    fn test_production_table_shape() {
        assert_eq!(PROGRAMS.len(), 106);
        assert_eq!(PROGRAMS[0].id, 0x01);
        assert_eq!(PROGRAMS[105].id, 0x6A);
        assert!(Calendar::production().overlaps().is_empty());
    }

    #[test]
    fn test_saturday_march_midday() {
        // 2024-03-16 is a Saturday
        let evaluation = Calendar::production().select(&at(2024, 3, 16, 12, 0));
        assert!(evaluation.matched);
        assert_eq!(evaluation.program.id, 0x15);
        assert_eq!(evaluation.program.power_w, 0);
    }

    #[test]
    fn test_window_bounds() {
        let calendar = Calendar::production();
        // Wednesday 2024-03-13: business days 11:00..14:00 block export
        assert_eq!(calendar.select(&at(2024, 3, 13, 11, 0)).program.id, 0x12);
        assert_eq!(calendar.select(&at(2024, 3, 13, 13, 59)).program.id, 0x12);
        assert_eq!(calendar.select(&at(2024, 3, 13, 14, 0)).program.id, 0x13);
        // 23:59 is outside every window
        let last_minute = calendar.select(&at(2024, 3, 13, 23, 59));
        assert!(!last_minute.matched);
        assert_eq!(last_minute.program.power_w, 0);
    }

    #[test]
    fn test_business_and_weekend_classes() {
        assert!(DaySelector::BusinessDays.matches(Weekday::Fri));
        assert!(!DaySelector::BusinessDays.matches(Weekday::Sat));
        assert!(DaySelector::Weekend.matches(Weekday::Sun));
        assert!(!DaySelector::Weekend.matches(Weekday::Mon));
    }

    #[test]
    fn test_first_match_wins() {
        let table = [
            program(1, WEEKEND, 0, (8, 0), (12, 0), 10_000),
            program(2, SAT, 0, (9, 0), (10, 0), 20_000),
        ];
        let calendar = Calendar::new(&table);
        for _ in 0..3 {
            assert_eq!(calendar.select(&at(2024, 3, 16, 9, 30)).program.id, 1);
        }
        assert_eq!(calendar.overlaps(), vec![(1, 2)]);
    }

    #[test]
    fn test_disabled_program_is_skipped() {
        let mut table = [program(1, 0, 0, (0, 0), (23, 0), 5_000)];
        table[0].enabled = false;
        let evaluation = Calendar::new(&table).select(&at(2024, 3, 17, 10, 0));
        assert!(!evaluation.matched);
    }

    #[test]
    fn test_desired_register_is_clamped() {
        assert_eq!(desired_register(75_000, 75_000), 750);
        assert_eq!(desired_register(34_000, 75_000), 340);
        assert_eq!(desired_register(90_000, 75_000), 750);
        assert_eq!(desired_register(0, 75_000), 0);
    }

    #[test]
    fn test_local_time_of_epoch() {
        let t = local_time(946_684_800).unwrap();
        assert_eq!(t, at(2000, 1, 1, 0, 0));
        assert_eq!(t.weekday(), Weekday::Sat);
    }
}
