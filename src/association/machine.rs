//! The association dispatch table.
//!
//! [`next`] is a pure function from the current association state
//! and an incoming PDU to the successor state and the action to take.
//! Keeping it free of I/O means every transition can be tested
//! by feeding PDU values directly;
//! the client and server loops only interpret the returned [`Action`].

use crate::pdu::{AbortRQServiceProviderReason, AbortRQSource, Pdu};

/// The lifecycle state of one association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// no transport connection yet
    Idle,
    /// requester sent A-ASSOCIATE-RQ, waiting for the answer
    AwaitingAc,
    /// acceptor waiting for A-ASSOCIATE-RQ
    AwaitingRq,
    /// association negotiated, data transfer possible
    Established,
    /// this node sent A-RELEASE-RQ, waiting for the reply
    Releasing,
    /// association ended in an orderly fashion
    Closed,
    /// association torn down by an abort or a protocol error
    Aborted,
}

/// What the caller must do with the PDU that produced a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// interpret the PDU in the successor state
    /// (negotiation reply, data, peer abort)
    Deliver,
    /// write the given PDU to the peer and carry on in the successor state
    Reply(Pdu),
    /// best-effort write the given PDU to the peer,
    /// then surface a protocol error
    ReplyAndFail(Pdu),
    /// surface an error without writing anything:
    /// the peer is gone, or past the point of a meaningful abort
    Fail,
}

/// The outcome of one dispatch step.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: State,
    pub action: Action,
}

fn transition(state: State, action: Action) -> Transition {
    Transition { state, action }
}

fn abort_unexpected() -> Pdu {
    Pdu::AbortRQ {
        source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
    }
}

fn abort_unrecognized() -> Pdu {
    Pdu::AbortRQ {
        source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnrecognizedPdu),
    }
}

/// Dispatch one incoming PDU against the current state.
pub fn next(state: State, pdu: &Pdu) -> Transition {
    match state {
        // a requester awaits A-ASSOCIATE-AC, -RJ or an abort;
        // on anything else the connection is not worth an abort exchange
        State::AwaitingAc => match pdu {
            Pdu::AssociationAC { .. } => transition(State::Established, Action::Deliver),
            Pdu::AssociationRJ { .. } => transition(State::Closed, Action::Deliver),
            Pdu::AbortRQ { .. } => transition(State::Aborted, Action::Deliver),
            _ => transition(State::Closed, Action::Fail),
        },
        // an acceptor awaits A-ASSOCIATE-RQ;
        // an unexpected but well-formed PDU is answered with an abort
        State::AwaitingRq => match pdu {
            Pdu::AssociationRQ { .. } => transition(State::Established, Action::Deliver),
            Pdu::AbortRQ { .. } => transition(State::Aborted, Action::Deliver),
            Pdu::Unknown { .. } => {
                transition(State::Aborted, Action::ReplyAndFail(abort_unrecognized()))
            }
            _ => transition(State::Aborted, Action::ReplyAndFail(abort_unexpected())),
        },
        State::Established => match pdu {
            Pdu::PData { .. } => transition(State::Established, Action::Deliver),
            Pdu::ReleaseRQ => transition(State::Closed, Action::Reply(Pdu::ReleaseRP)),
            Pdu::AbortRQ { .. } => transition(State::Aborted, Action::Deliver),
            Pdu::Unknown { .. } => {
                transition(State::Aborted, Action::ReplyAndFail(abort_unrecognized()))
            }
            // association PDUs and spurious A-RELEASE-RP
            _ => transition(State::Aborted, Action::ReplyAndFail(abort_unexpected())),
        },
        State::Releasing => match pdu {
            Pdu::ReleaseRP => transition(State::Closed, Action::Deliver),
            // data still in flight from the peer is delivered,
            // the release just has not completed yet
            Pdu::PData { .. } => transition(State::Releasing, Action::Deliver),
            // release collision: answer it, both sides close
            Pdu::ReleaseRQ => transition(State::Closed, Action::Reply(Pdu::ReleaseRP)),
            Pdu::AbortRQ { .. } => transition(State::Aborted, Action::Deliver),
            Pdu::Unknown { .. } => {
                transition(State::Aborted, Action::ReplyAndFail(abort_unrecognized()))
            }
            _ => transition(State::Aborted, Action::ReplyAndFail(abort_unexpected())),
        },
        // no PDU is legitimate before a connection exists or after the end
        State::Idle | State::Closed | State::Aborted => transition(state, Action::Fail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{
        AssociationAC, AssociationRJ, AssociationRJResult, AssociationRJServiceUserReason,
        AssociationRJSource, AssociationRQ,
    };

    fn sample_rq() -> Pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "THIS-SCU".to_string(),
            called_ae_title: "THIS-SCP".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![],
            user_variables: vec![],
        })
    }

    fn sample_ac() -> Pdu {
        Pdu::AssociationAC(AssociationAC {
            protocol_version: 1,
            calling_ae_title: "THIS-SCU".to_string(),
            called_ae_title: "THIS-SCP".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![],
            user_variables: vec![],
        })
    }

    fn sample_rj() -> Pdu {
        Pdu::AssociationRJ(AssociationRJ {
            result: AssociationRJResult::Permanent,
            source: AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::NoReasonGiven,
            ),
        })
    }

    fn abort() -> Pdu {
        Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        }
    }

    fn pdata() -> Pdu {
        Pdu::PData { data: vec![] }
    }

    #[test]
    fn awaiting_ac_accepts_the_negotiation_replies() {
        let t = next(State::AwaitingAc, &sample_ac());
        assert_eq!(t, transition(State::Established, Action::Deliver));

        let t = next(State::AwaitingAc, &sample_rj());
        assert_eq!(t, transition(State::Closed, Action::Deliver));

        let t = next(State::AwaitingAc, &abort());
        assert_eq!(t, transition(State::Aborted, Action::Deliver));
    }

    #[test]
    fn awaiting_ac_fails_without_reply_on_anything_else() {
        for pdu in [sample_rq(), pdata(), Pdu::ReleaseRQ, Pdu::ReleaseRP] {
            let t = next(State::AwaitingAc, &pdu);
            assert_eq!(t, transition(State::Closed, Action::Fail), "pdu: {:?}", pdu);
        }
    }

    #[test]
    fn awaiting_rq_takes_only_a_request() {
        let t = next(State::AwaitingRq, &sample_rq());
        assert_eq!(t, transition(State::Established, Action::Deliver));

        for pdu in [sample_ac(), sample_rj(), pdata(), Pdu::ReleaseRQ, Pdu::ReleaseRP] {
            let t = next(State::AwaitingRq, &pdu);
            assert_eq!(t.state, State::Aborted);
            assert!(
                matches!(t.action, Action::ReplyAndFail(Pdu::AbortRQ { .. })),
                "pdu: {:?}",
                pdu
            );
        }
    }

    #[test]
    fn established_delivers_data_and_honors_release() {
        let t = next(State::Established, &pdata());
        assert_eq!(t, transition(State::Established, Action::Deliver));

        let t = next(State::Established, &Pdu::ReleaseRQ);
        assert_eq!(t, transition(State::Closed, Action::Reply(Pdu::ReleaseRP)));

        let t = next(State::Established, &abort());
        assert_eq!(t, transition(State::Aborted, Action::Deliver));
    }

    #[test]
    fn established_aborts_on_protocol_violations() {
        // a second association request mid-association
        let t = next(State::Established, &sample_rq());
        assert_eq!(t.state, State::Aborted);
        assert!(matches!(t.action, Action::ReplyAndFail(Pdu::AbortRQ { .. })));

        // spurious release reply
        let t = next(State::Established, &Pdu::ReleaseRP);
        assert_eq!(t.state, State::Aborted);
        assert!(matches!(t.action, Action::ReplyAndFail(Pdu::AbortRQ { .. })));

        // PDU of unknown type
        let t = next(
            State::Established,
            &Pdu::Unknown {
                pdu_type: 0xAA,
                data: vec![],
            },
        );
        assert_eq!(t.state, State::Aborted);
        match t.action {
            Action::ReplyAndFail(Pdu::AbortRQ {
                source: AbortRQSource::ServiceProvider(reason),
            }) => {
                assert_eq!(reason, AbortRQServiceProviderReason::UnrecognizedPdu);
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn releasing_completes_collides_and_tolerates_late_data() {
        let t = next(State::Releasing, &Pdu::ReleaseRP);
        assert_eq!(t, transition(State::Closed, Action::Deliver));

        let t = next(State::Releasing, &pdata());
        assert_eq!(t, transition(State::Releasing, Action::Deliver));

        let t = next(State::Releasing, &Pdu::ReleaseRQ);
        assert_eq!(t, transition(State::Closed, Action::Reply(Pdu::ReleaseRP)));
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for state in [State::Idle, State::Closed, State::Aborted] {
            let t = next(state, &pdata());
            assert_eq!(t, transition(state, Action::Fail));
        }
    }
}
