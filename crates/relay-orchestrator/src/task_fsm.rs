use relay_types::TaskStatus;

/// Inputs that drive a `Task`'s state machine. Named by trigger rather
/// than by destination state, since several events fan out to more than
/// one legal next state depending on what they carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    StartPlanning,
    PlanReady { requires_approval: bool },
    PlanFailed,
    Approve { approved: bool },
    Dispatch,
    Complete,
    Fail,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot apply {event:?} to a task in state {from:?}")]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub event: TaskEvent,
}

/// Pure reducer over the task lifecycle graph (spec.md §4.4):
///
/// ```text
/// pending → planning → (awaiting_approval | ready | failed)
/// awaiting_approval → (ready | rejected | cancelled)
/// ready → running
/// running → (completed | failed | cancelled)
/// ```
///
/// `cancel` is legal from any non-terminal state. Every other transition
/// not named above is rejected with `InvalidTransition`.
pub fn apply(from: TaskStatus, event: TaskEvent) -> Result<TaskStatus, InvalidTransition> {
    use TaskEvent::*;
    use TaskStatus::*;

    if matches!(event, Cancel) {
        return if from.is_terminal() {
            Err(InvalidTransition { from, event })
        } else {
            Ok(Cancelled)
        };
    }

    let next = match (from, event) {
        (Pending, StartPlanning) => Planning,
        (Planning, PlanReady { requires_approval: true }) => AwaitingApproval,
        (Planning, PlanReady { requires_approval: false }) => Ready,
        (Planning, PlanFailed) => Failed,
        (AwaitingApproval, Approve { approved: true }) => Ready,
        (AwaitingApproval, Approve { approved: false }) => Rejected,
        (Ready, Dispatch) => Running,
        (Running, Complete) => Completed,
        (Running, Fail) => Failed,
        _ => return Err(InvalidTransition { from, event }),
    };

    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskEvent::*;
    use TaskStatus::*;

    #[test]
    fn pending_to_planning_is_legal() {
        assert_eq!(apply(Pending, StartPlanning), Ok(Planning));
    }

    #[test]
    fn planning_fans_out_by_approval_requirement() {
        assert_eq!(
            apply(Planning, PlanReady { requires_approval: true }),
            Ok(AwaitingApproval)
        );
        assert_eq!(
            apply(Planning, PlanReady { requires_approval: false }),
            Ok(Ready)
        );
        assert_eq!(apply(Planning, PlanFailed), Ok(Failed));
    }

    #[test]
    fn approval_routes_to_ready_or_rejected() {
        assert_eq!(
            apply(AwaitingApproval, Approve { approved: true }),
            Ok(Ready)
        );
        assert_eq!(
            apply(AwaitingApproval, Approve { approved: false }),
            Ok(Rejected)
        );
    }

    #[test]
    fn ready_dispatches_to_running_which_terminates() {
        assert_eq!(apply(Ready, Dispatch), Ok(Running));
        assert_eq!(apply(Running, Complete), Ok(Completed));
        assert_eq!(apply(Running, Fail), Ok(Failed));
    }

    #[test]
    fn cancel_is_legal_from_every_non_terminal_state() {
        for state in [Pending, Planning, AwaitingApproval, Ready, Running] {
            assert_eq!(apply(state, Cancel), Ok(Cancelled));
        }
    }

    #[test]
    fn cancel_is_illegal_from_terminal_states() {
        for state in [Completed, Failed, Rejected, Cancelled] {
            assert!(apply(state, Cancel).is_err());
        }
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        assert!(apply(Pending, Dispatch).is_err());
        assert!(apply(Ready, StartPlanning).is_err());
        assert!(apply(Completed, Complete).is_err());
        assert!(apply(AwaitingApproval, StartPlanning).is_err());
        assert!(apply(Running, Approve { approved: true }).is_err());
    }

    #[test]
    fn terminal_states_accept_no_further_transitions() {
        for state in [Completed, Failed, Rejected, Cancelled] {
            assert!(state.is_terminal());
            assert!(apply(state, Dispatch).is_err());
            assert!(apply(state, Complete).is_err());
        }
    }
}
