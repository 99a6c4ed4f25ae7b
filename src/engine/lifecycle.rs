use std::str::FromStr;

use crate::model::BookingStatus;

use super::SchedulingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BookingAction {
    Confirm,
    Start,
    Complete,
    Cancel,
    NoShow,
    Reschedule,
}

impl BookingAction {
    pub const ALL: [BookingAction; 6] = [
        BookingAction::Confirm,
        BookingAction::Start,
        BookingAction::Complete,
        BookingAction::Cancel,
        BookingAction::NoShow,
        BookingAction::Reschedule,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingAction::Confirm => "confirm",
            BookingAction::Start => "start",
            BookingAction::Complete => "complete",
            BookingAction::Cancel => "cancel",
            BookingAction::NoShow => "no-show",
            BookingAction::Reschedule => "reschedule",
        }
    }
}

impl FromStr for BookingAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "confirm" => Ok(BookingAction::Confirm),
            "start" => Ok(BookingAction::Start),
            "complete" => Ok(BookingAction::Complete),
            "cancel" => Ok(BookingAction::Cancel),
            "no-show" | "no_show" => Ok(BookingAction::NoShow),
            "reschedule" => Ok(BookingAction::Reschedule),
            other => Err(format!("unknown booking action: {other}")),
        }
    }
}

use BookingAction as A;
use BookingStatus as S;

/// The whole status graph. Anything not listed is an invalid transition.
/// For `Reschedule` the target is the status of the replacement booking;
/// the replaced booking itself becomes `Cancelled`.
const TRANSITIONS: [(BookingStatus, BookingAction, BookingStatus); 8] = [
    (S::Pending, A::Confirm, S::Confirmed),
    (S::Pending, A::Cancel, S::Cancelled),
    (S::Confirmed, A::Start, S::InProgress),
    (S::Confirmed, A::Cancel, S::Cancelled),
    (S::Confirmed, A::Reschedule, S::Pending),
    (S::Confirmed, A::NoShow, S::NoShow),
    (S::InProgress, A::Complete, S::Completed),
    // Only before any irreversible side effect; the core performs none.
    (S::InProgress, A::Cancel, S::Cancelled),
];

pub fn next_status(from: BookingStatus, action: BookingAction) -> Result<BookingStatus, SchedulingError> {
    TRANSITIONS
        .iter()
        .find(|(f, a, _)| *f == from && *a == action)
        .map(|(_, _, to)| *to)
        .ok_or(SchedulingError::InvalidTransition {
            from,
            action: action.as_str(),
        })
}

pub fn allowed_actions(from: BookingStatus) -> Vec<BookingAction> {
    BookingAction::ALL
        .into_iter()
        .filter(|a| next_status(from, *a).is_ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUSES: [BookingStatus; 6] = [
        S::Pending,
        S::Confirmed,
        S::InProgress,
        S::Completed,
        S::Cancelled,
        S::NoShow,
    ];

    #[test]
    fn happy_path() {
        let s = next_status(S::Pending, A::Confirm).unwrap();
        let s = next_status(s, A::Start).unwrap();
        let s = next_status(s, A::Complete).unwrap();
        assert_eq!(s, S::Completed);
    }

    #[test]
    fn cancelled_cannot_be_confirmed() {
        assert!(matches!(
            next_status(S::Cancelled, A::Confirm),
            Err(SchedulingError::InvalidTransition { from: S::Cancelled, action: "confirm" })
        ));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for s in STATUSES.into_iter().filter(|s| s.is_terminal()) {
            assert!(allowed_actions(s).is_empty(), "{s} should be terminal");
        }
    }

    #[test]
    fn graph_has_exactly_eight_edges() {
        let edges: usize = STATUSES.iter().map(|s| allowed_actions(*s).len()).sum();
        assert_eq!(edges, 8);
        assert_eq!(
            allowed_actions(S::Confirmed),
            vec![A::Start, A::Cancel, A::NoShow, A::Reschedule]
        );
        assert_eq!(allowed_actions(S::InProgress), vec![A::Complete, A::Cancel]);
    }

    #[test]
    fn pending_cannot_be_rescheduled_or_started() {
        assert!(next_status(S::Pending, A::Reschedule).is_err());
        assert!(next_status(S::Pending, A::Start).is_err());
        assert!(next_status(S::Pending, A::NoShow).is_err());
    }

    #[test]
    fn action_names_parse() {
        for a in BookingAction::ALL {
            assert_eq!(a.as_str().parse::<BookingAction>(), Ok(a));
        }
        assert_eq!("no_show".parse::<BookingAction>(), Ok(A::NoShow));
        assert!("delete".parse::<BookingAction>().is_err());
    }
}
