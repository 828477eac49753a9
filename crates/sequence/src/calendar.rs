//! Clock and calendar resolution: sending windows, local days, and the
//! eligibility time of the next step.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;

use crate::types::{ClockTime, Contact, SendingSchedule, SequenceDefinition, Step, TimeRange};

/// Days scanned when searching for the next open window. One full weekly
/// cycle plus today.
const WINDOW_SEARCH_DAYS: i64 = 8;

pub fn parse_timezone(name: &str) -> Option<Tz> {
    name.parse::<Tz>().ok()
}

fn is_weekend(day: Weekday) -> bool {
    matches!(day, Weekday::Sat | Weekday::Sun)
}

/// A schedule bound to the timezone it is evaluated in.
#[derive(Debug, Clone, Copy)]
pub struct SendingWindow<'a> {
    schedule: &'a SendingSchedule,
    tz: Tz,
    skip_weekends: bool,
}

impl<'a> SendingWindow<'a> {
    pub fn new(schedule: &'a SendingSchedule, tz: Tz) -> Self {
        Self {
            schedule,
            tz,
            skip_weekends: false,
        }
    }

    pub fn skipping_weekends(mut self, skip: bool) -> Self {
        self.skip_weekends = skip;
        self
    }

    fn ranges_on(&self, day: Weekday) -> &'a [TimeRange] {
        if self.skip_weekends && is_weekend(day) {
            return &[];
        }
        self.schedule.ranges_for(day)
    }

    /// Start inclusive, end exclusive, in local wall-clock time.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        let local = instant.with_timezone(&self.tz);
        let seconds = local.num_seconds_from_midnight();
        self.ranges_on(local.weekday())
            .iter()
            .any(|r| r.contains_seconds(seconds))
    }

    /// `instant` itself when already inside a window, otherwise the start of
    /// the next window. `None` when the schedule has no usable window at all.
    pub fn next_start(&self, instant: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.contains(instant) {
            return Some(instant);
        }
        let today = instant.with_timezone(&self.tz).date_naive();
        for offset in 0..WINDOW_SEARCH_DAYS {
            let date = today + Duration::days(offset);
            let mut starts: Vec<ClockTime> = self
                .ranges_on(date.weekday())
                .iter()
                .filter(|r| r.start < r.end)
                .map(|r| r.start)
                .collect();
            starts.sort();
            for start in starts {
                let candidate = resolve_local(self.tz, date, start);
                // A start inside a DST gap resolves forward and may land
                // outside its own range.
                if candidate > instant && self.contains(candidate) {
                    return Some(candidate);
                }
            }
        }
        None
    }
}

/// Whether `instant` lies inside one of the schedule's windows.
pub fn is_within_window(schedule: &SendingSchedule, tz: Tz, instant: DateTime<Utc>) -> bool {
    SendingWindow::new(schedule, tz).contains(instant)
}

/// Earliest instant `>= instant` inside a window.
pub fn next_window_start(
    schedule: &SendingSchedule,
    tz: Tz,
    instant: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    SendingWindow::new(schedule, tz).next_start(instant)
}

/// Map a local wall-clock time to UTC. Ambiguous times (DST fall-back) take
/// the earlier instant, non-existent times (spring-forward) move forward to
/// the first valid minute.
pub fn resolve_local(tz: Tz, date: NaiveDate, time: ClockTime) -> DateTime<Utc> {
    let naive = date.and_time(NaiveTime::MIN) + Duration::minutes(i64::from(time.minutes()));
    let mut candidate = naive;
    for _ in 0..(24 * 4) {
        if let Some(resolved) = tz.from_local_datetime(&candidate).earliest() {
            return resolved.with_timezone(&Utc);
        }
        candidate += Duration::minutes(15);
    }
    Utc.from_utc_datetime(&naive)
}

/// Local calendar day of `instant`.
pub fn local_day(tz: Tz, instant: DateTime<Utc>) -> NaiveDate {
    instant.with_timezone(&tz).date_naive()
}

/// The next local midnight strictly after `instant`.
pub fn next_local_midnight(tz: Tz, instant: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = local_day(tz, instant) + Duration::days(1);
    resolve_local(tz, tomorrow, ClockTime::MIDNIGHT)
}

/// First instant `>= earliest` whose local time of day is `time`.
pub fn at_or_after_local_time(tz: Tz, earliest: DateTime<Utc>, time: ClockTime) -> DateTime<Utc> {
    let day = local_day(tz, earliest);
    let candidate = resolve_local(tz, day, time);
    if candidate >= earliest {
        candidate
    } else {
        resolve_local(tz, day + Duration::days(1), time)
    }
}

/// Timezone a step is evaluated in: the prospect's own when the step asks for
/// it and it is known, then the step override, then the schedule timezone.
pub fn step_timezone(definition: &SequenceDefinition, step: &Step, contact: &Contact) -> Tz {
    let prospect = step
        .respect_timezone
        .then(|| contact.timezone.as_deref().and_then(parse_timezone))
        .flatten();
    prospect
        .or_else(|| step.timezone.as_deref().and_then(parse_timezone))
        .or_else(|| parse_timezone(&definition.settings.sending_schedule.timezone))
        .unwrap_or(Tz::UTC)
}

/// Timezone used for the per-sequence daily budget.
pub fn schedule_timezone(definition: &SequenceDefinition) -> Tz {
    parse_timezone(&definition.settings.sending_schedule.timezone).unwrap_or(Tz::UTC)
}

/// When `step` becomes eligible given the completion time of the step before
/// it (or the enrollment time for the first step): the delay, then the
/// preferred send time, then the next open window.
pub fn step_eligible_at(
    definition: &SequenceDefinition,
    step: &Step,
    contact: &Contact,
    base: DateTime<Utc>,
) -> DateTime<Utc> {
    let tz = step_timezone(definition, step, contact);
    let mut at = base + step.delay.duration();
    if let Some(send_time) = step.send_time {
        at = at_or_after_local_time(tz, at, send_time);
    }
    if step.kind.is_window_gated() {
        let window = SendingWindow::new(&definition.settings.sending_schedule, tz)
            .skipping_weekends(step.skip_weekends);
        if let Some(open) = window.next_start(at) {
            at = open;
        }
    }
    at
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SequenceSettings, StepKind};
    use uuid::Uuid;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn nine_to_five(tz: &str) -> SendingSchedule {
        SendingSchedule::weekdays(TimeRange::new(ClockTime::hm(9, 0), ClockTime::hm(17, 0)), tz)
    }

    fn definition(schedule: SendingSchedule, steps: Vec<Step>) -> SequenceDefinition {
        SequenceDefinition {
            id: Uuid::new_v4(),
            version: 1,
            name: "calendar".into(),
            description: None,
            steps,
            settings: SequenceSettings {
                sending_schedule: schedule,
                ..SequenceSettings::default()
            },
            digest: String::new(),
            published_at: Utc::now(),
        }
    }

    #[test]
    fn test_window_bounds_are_half_open() {
        let schedule = nine_to_five("UTC");
        // 2024-01-08 is a Monday
        assert!(is_within_window(&schedule, Tz::UTC, utc(2024, 1, 8, 9, 0)));
        assert!(is_within_window(&schedule, Tz::UTC, utc(2024, 1, 8, 16, 59)));
        assert!(!is_within_window(&schedule, Tz::UTC, utc(2024, 1, 8, 17, 0)));
        assert!(!is_within_window(&schedule, Tz::UTC, utc(2024, 1, 8, 8, 59)));
    }

    #[test]
    fn test_next_window_start_returns_instant_when_open() {
        let schedule = nine_to_five("UTC");
        let inside = utc(2024, 1, 8, 10, 15);
        assert_eq!(next_window_start(&schedule, Tz::UTC, inside), Some(inside));
    }

    #[test]
    fn test_next_window_start_friday_evening_rolls_to_monday() {
        let schedule = nine_to_five("UTC");
        // Friday 2024-01-12 18:00 UTC
        let next = next_window_start(&schedule, Tz::UTC, utc(2024, 1, 12, 18, 0)).unwrap();
        assert_eq!(next, utc(2024, 1, 15, 9, 0));
    }

    #[test]
    fn test_next_window_start_uses_local_time() {
        let tz = parse_timezone("America/New_York").unwrap();
        let schedule = nine_to_five("America/New_York");
        // Monday 2024-01-08 12:00 UTC is 07:00 in New York (EST, UTC-5)
        let next = next_window_start(&schedule, tz, utc(2024, 1, 8, 12, 0)).unwrap();
        assert_eq!(next, utc(2024, 1, 8, 14, 0));
    }

    #[test]
    fn test_empty_schedule_has_no_window() {
        let mut schedule = nine_to_five("UTC");
        for day in [
            &mut schedule.monday,
            &mut schedule.tuesday,
            &mut schedule.wednesday,
            &mut schedule.thursday,
            &mut schedule.friday,
        ] {
            day.clear();
        }
        assert!(next_window_start(&schedule, Tz::UTC, utc(2024, 1, 8, 10, 0)).is_none());
    }

    #[test]
    fn test_skip_weekends_ignores_weekend_ranges() {
        let schedule = SendingSchedule::always("UTC");
        let saturday = utc(2024, 1, 13, 12, 0);
        let window = SendingWindow::new(&schedule, Tz::UTC).skipping_weekends(true);
        assert!(!window.contains(saturday));
        assert_eq!(window.next_start(saturday), Some(utc(2024, 1, 15, 0, 0)));
    }

    #[test]
    fn test_dst_gap_moves_forward() {
        let tz = parse_timezone("America/New_York").unwrap();
        // 2024-03-10 02:30 does not exist in New York
        let resolved = resolve_local(
            tz,
            NaiveDate::from_ymd_opt(2024, 3, 10).unwrap(),
            ClockTime::hm(2, 30),
        );
        // first valid local time is 03:00 EDT == 07:00 UTC
        assert_eq!(resolved, utc(2024, 3, 10, 7, 0));
    }

    #[test]
    fn test_dst_ambiguity_takes_earliest() {
        let tz = parse_timezone("America/New_York").unwrap();
        // 2024-11-03 01:30 happens twice; the first is EDT (UTC-4)
        let resolved = resolve_local(
            tz,
            NaiveDate::from_ymd_opt(2024, 11, 3).unwrap(),
            ClockTime::hm(1, 30),
        );
        assert_eq!(resolved, utc(2024, 11, 3, 5, 30));
    }

    #[test]
    fn test_next_local_midnight() {
        let tz = parse_timezone("Europe/Berlin").unwrap();
        // 2024-01-08 22:30 UTC is 23:30 in Berlin; next midnight is 23:00 UTC
        let midnight = next_local_midnight(tz, utc(2024, 1, 8, 22, 30));
        assert_eq!(midnight, utc(2024, 1, 8, 23, 0));
        // 23:30 UTC is already the 9th locally
        let later = next_local_midnight(tz, utc(2024, 1, 8, 23, 30));
        assert_eq!(later, utc(2024, 1, 9, 23, 0));
    }

    #[test]
    fn test_step_eligible_applies_delay_send_time_and_window() {
        let mut step = Step::new(2, StepKind::Email).with_delay(1, 0);
        step.send_time = Some(ClockTime::hm(10, 30));
        let def = definition(nine_to_five("UTC"), vec![Step::new(1, StepKind::Email), step.clone()]);
        // Thursday 15:00 + 1 day = Friday 15:00, send time 10:30 -> Saturday 10:30,
        // window closed on weekends -> Monday 09:00
        let at = step_eligible_at(&def, &step, &Contact::default(), utc(2024, 1, 11, 15, 0));
        assert_eq!(at, utc(2024, 1, 15, 9, 0));
    }

    #[test]
    fn test_wait_steps_ignore_window() {
        let step = Step::new(2, StepKind::Wait).with_delay(0, 3);
        let def = definition(nine_to_five("UTC"), vec![Step::new(1, StepKind::Email), step.clone()]);
        let at = step_eligible_at(&def, &step, &Contact::default(), utc(2024, 1, 12, 16, 0));
        assert_eq!(at, utc(2024, 1, 12, 19, 0));
    }

    #[test]
    fn test_prospect_timezone_respected_when_requested() {
        let mut step = Step::new(1, StepKind::Email);
        step.respect_timezone = true;
        let def = definition(nine_to_five("UTC"), vec![step.clone()]);
        let contact = Contact {
            timezone: Some("Asia/Tokyo".into()),
            ..Contact::default()
        };
        assert_eq!(step_timezone(&def, &step, &contact), chrono_tz::Asia::Tokyo);

        step.respect_timezone = false;
        assert_eq!(step_timezone(&def, &step, &contact), Tz::UTC);
    }
}
