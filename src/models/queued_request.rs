use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// A request's priority. Ordered so `Priority::High` sorts first when
/// draining the three streams within one scheduling round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    /// Burst size read per scheduling round: high > normal > low.
    pub fn read_count(&self) -> usize {
        match self {
            Priority::High => 10,
            Priority::Normal => 3,
            Priority::Low => 1,
        }
    }
}

#[cfg(test)]
mod priority_tests {
    use super::*;

    #[test]
    fn read_counts_are_strictly_ordered_high_over_low() {
        // A round must attempt strictly more high-priority messages than
        // normal, and more normal than low, or draining stops being
        // priority-weighted.
        assert!(Priority::High.read_count() > Priority::Normal.read_count());
        assert!(Priority::Normal.read_count() > Priority::Low.read_count());
    }

    #[test]
    fn all_lists_high_before_normal_before_low() {
        assert_eq!(Priority::ALL, [Priority::High, Priority::Normal, Priority::Low]);
    }

    #[test]
    fn round_trips_through_as_str_and_from_str() {
        for p in Priority::ALL {
            assert_eq!(p.as_str().parse::<Priority>().unwrap(), p);
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority {other}")),
        }
    }
}

/// A queued request's lifecycle state. Terminal states never transition
/// further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Completed
                | RequestState::Failed
                | RequestState::Cancelled
                | RequestState::Expired
        )
    }

    /// A request observed in state X is guaranteed never to revert to a
    /// state earlier in the sequence Pending -> Processing -> {Completed,
    /// Failed, Cancelled, Expired}. `self` is the current recorded state;
    /// `next` is the proposed write. A terminal state accepts no further
    /// transition, including repeating itself.
    pub fn can_transition_to(&self, next: RequestState) -> bool {
        use RequestState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Pending, Processing) => true,
            (Pending, Cancelled) => true,
            (Processing, Completed | Failed | Cancelled | Expired) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod state_machine_tests {
    use super::*;
    use proptest::prelude::*;

    fn any_state() -> impl Strategy<Value = RequestState> {
        prop_oneof![
            Just(RequestState::Pending),
            Just(RequestState::Processing),
            Just(RequestState::Completed),
            Just(RequestState::Failed),
            Just(RequestState::Cancelled),
            Just(RequestState::Expired),
        ]
    }

    proptest! {
        /// Once a state is terminal, no proposed next state (including
        /// itself) is an allowed transition.
        #[test]
        fn terminal_states_never_transition_again(state in any_state(), next in any_state()) {
            if state.is_terminal() {
                prop_assert!(!state.can_transition_to(next));
            }
        }

        /// Every allowed transition strictly advances the sequence
        /// Pending -> Processing -> terminal; nothing ever steps backward.
        #[test]
        fn allowed_transitions_only_move_forward(state in any_state(), next in any_state()) {
            if state.can_transition_to(next) {
                prop_assert_ne!(state, next);
                prop_assert!(!matches!((state, next), (RequestState::Processing, RequestState::Pending)));
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationRequestPayload {
    pub event_id: i64,
    pub seat_ids: Vec<i64>,
    pub user_id: String,
}

/// Typed error descriptor stored alongside a `Failed`/`Cancelled`/`Expired`
/// request. `kind` is the error taxonomy kind, not a Rust type name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestErrorDescriptor {
    pub kind: String,
    pub message: String,
}

/// The request-status store's record for one queued request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestStatusRecord {
    pub request_id: String,
    pub state: RequestState,
    pub priority: Priority,
    pub event_id: i64,
    pub seat_ids: Vec<i64>,
    pub user_id: String,
    pub enqueued_at: NaiveDateTime,
    pub started_at: Option<NaiveDateTime>,
    pub finished_at: Option<NaiveDateTime>,
    pub result: Option<crate::models::reservation::ReservationOutcome>,
    pub error: Option<RequestErrorDescriptor>,
}
