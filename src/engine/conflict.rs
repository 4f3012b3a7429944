use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// True if `candidate` overlaps any occupied interval. Touching endpoints do not overlap.
pub fn has_conflict(candidate: &Span, occupied: &[Span]) -> bool {
    occupied.iter().any(|o| candidate.overlaps(o))
}

/// The first occupant (by start time) that `candidate` overlaps.
pub fn first_conflict<'a>(candidate: &Span, occupants: &'a [Occupant]) -> Option<&'a Occupant> {
    occupants
        .iter()
        .filter(|o| o.span.overlaps(candidate))
        .min_by_key(|o| o.span.start)
}

pub(crate) fn check_no_conflict(candidate: &Span, occupants: &[Occupant]) -> Result<(), EngineError> {
    match first_conflict(candidate, occupants) {
        Some(o) => Err(EngineError::Conflict {
            span: *candidate,
            occupant: o.source,
        }),
        None => Ok(()),
    }
}

pub(crate) fn validate_actor(actor: &str) -> Result<(), EngineError> {
    if actor.trim().is_empty() {
        return Err(EngineError::validation("requester id must not be empty"));
    }
    if actor.len() > MAX_REQUESTER_ID_LEN {
        return Err(EngineError::LimitExceeded("requester id too long"));
    }
    Ok(())
}

/// `[start, end)` inside the court's window on `date`.
pub(crate) fn validate_placement(court: &Court, date: chrono::NaiveDate, span: &Span) -> Result<(), EngineError> {
    if !court.active {
        return Err(EngineError::validation(format!("court {} is not accepting bookings", court.id)));
    }
    let Some(window) = court.hours.window_on(date) else {
        return Err(EngineError::validation(format!("court {} is closed on {date}", court.id)));
    };
    if !window.contains_span(span) {
        return Err(EngineError::validation(format!(
            "interval {span} is outside operating hours {window}"
        )));
    }
    Ok(())
}

/// Checks an untrusted reservation against its court. Takes no lock.
pub(crate) fn validate_reservation(
    court: &Court,
    input: &NewReservation,
) -> Result<ReservationRequest, EngineError> {
    validate_actor(&input.requester_id)?;
    let span = Span::try_new(input.start, input.end).map_err(|e| EngineError::validation(e.to_string()))?;
    validate_placement(court, input.date, &span)?;
    Ok(ReservationRequest {
        key: PartitionKey::new(court.id, input.date),
        span,
        requester_id: input.requester_id.clone(),
        price: court.quote(&span),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Weekday};
    use ulid::Ulid;

    fn t(h: u16, m: u16) -> TimeOfDay {
        TimeOfDay::hm(h, m)
    }

    fn span(a: (u16, u16), b: (u16, u16)) -> Span {
        Span::new(t(a.0, a.1), t(b.0, b.1))
    }

    fn court() -> Court {
        Court {
            id: Ulid::new(),
            facility_id: Ulid::new(),
            owner_id: "owner".into(),
            name: "Center".into(),
            hours: OperatingHours {
                open: t(6, 0),
                close: t(22, 0),
                closed_on: vec![Weekday::Sun],
            },
            price_per_hour: 6000,
            active: true,
        }
    }

    // 2030-05-06 is a Monday, 2030-05-05 a Sunday.
    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 5, 6).unwrap()
    }

    fn input(court: &Court, start: TimeOfDay, end: TimeOfDay) -> NewReservation {
        NewReservation {
            court_id: court.id,
            date: monday(),
            start,
            end,
            requester_id: "alice".into(),
        }
    }

    #[test]
    fn overlap_rules() {
        let occupied = [span((9, 0), (10, 0)), span((13, 0), (14, 0))];
        assert!(has_conflict(&span((9, 30), (10, 30)), &occupied));
        assert!(has_conflict(&span((8, 0), (15, 0)), &occupied));
        assert!(has_conflict(&span((9, 15), (9, 45)), &occupied));
        assert!(!has_conflict(&span((10, 0), (11, 0)), &occupied));
        assert!(!has_conflict(&span((8, 0), (9, 0)), &occupied));
        assert!(!has_conflict(&span((10, 0), (13, 0)), &occupied));
        assert!(!has_conflict(&span((9, 0), (10, 0)), &[]));
    }

    #[test]
    fn first_conflict_names_earliest_occupant() {
        let a = Ulid::new();
        let b = Ulid::new();
        let occupants = [
            Occupant { span: span((11, 0), (12, 0)), source: OccupantRef::Block(b) },
            Occupant { span: span((9, 0), (10, 0)), source: OccupantRef::Booking(a) },
        ];
        let hit = first_conflict(&span((9, 30), (11, 30)), &occupants).unwrap();
        assert_eq!(hit.source, OccupantRef::Booking(a));
        assert!(first_conflict(&span((10, 0), (11, 0)), &occupants).is_none());
    }

    #[test]
    fn valid_reservation_is_priced() {
        let c = court();
        let req = validate_reservation(&c, &input(&c, t(9, 0), t(10, 30))).unwrap();
        assert_eq!(req.span(), span((9, 0), (10, 30)));
        assert_eq!(req.key(), PartitionKey::new(c.id, monday()));
        assert_eq!(req.price, 9000);
    }

    #[test]
    fn rejects_inverted_and_empty_intervals() {
        let c = court();
        let err = validate_reservation(&c, &input(&c, t(10, 0), t(9, 0))).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        let err = validate_reservation(&c, &input(&c, t(10, 0), t(10, 0))).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn rejects_outside_operating_hours() {
        let c = court();
        for (s, e) in [(t(5, 0), t(7, 0)), (t(21, 0), t(23, 0)), (t(0, 0), t(24, 0))] {
            let err = validate_reservation(&c, &input(&c, s, e)).unwrap_err();
            assert!(matches!(err, EngineError::Validation(_)));
        }
        assert!(validate_reservation(&c, &input(&c, t(6, 0), t(22, 0))).is_ok());
    }

    #[test]
    fn rejects_closed_day_and_inactive_court() {
        let mut c = court();
        let mut sunday = input(&c, t(9, 0), t(10, 0));
        sunday.date = NaiveDate::from_ymd_opt(2030, 5, 5).unwrap();
        assert!(matches!(validate_reservation(&c, &sunday), Err(EngineError::Validation(_))));

        c.active = false;
        let err = validate_reservation(&c, &input(&c, t(9, 0), t(10, 0))).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn rejects_bad_requester() {
        let c = court();
        let mut blank = input(&c, t(9, 0), t(10, 0));
        blank.requester_id = "  ".into();
        assert!(matches!(validate_reservation(&c, &blank), Err(EngineError::Validation(_))));

        let mut long = input(&c, t(9, 0), t(10, 0));
        long.requester_id = "x".repeat(MAX_REQUESTER_ID_LEN + 1);
        assert!(matches!(validate_reservation(&c, &long), Err(EngineError::LimitExceeded(_))));
    }
}
