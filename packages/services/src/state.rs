//! Guards for the transaction and attempt state machines.
//!
//! Every cross-boundary mutation re-checks the state it is moving away
//! from; an illegal transition aborts the current worker cycle with an
//! invariant error. The storage layer additionally constrains its
//! `UPDATE`s to the expected prior state, so a row that changed under us
//! fails there too.

use crate::{
    Error, Result,
    types::{Attempt, AttemptState, Tx, TxState},
};

pub fn tx_transition(tx: &Tx, to: TxState) -> Result<()> {
    let allowed = matches!(
        (tx.state, to),
        (TxState::Unstarted, TxState::InProgress)
            | (TxState::InProgress, TxState::Unconfirmed)
            | (TxState::InProgress, TxState::FatalError)
    );

    if allowed {
        Ok(())
    } else {
        Err(Error::InvariantViolation(format!(
            "transaction {} cannot transition from {} to {to}",
            tx.id, tx.state
        )))
    }
}

pub fn attempt_transition(attempt: &Attempt, to: AttemptState) -> Result<()> {
    if attempt.state == AttemptState::InProgress && to == AttemptState::Broadcast {
        Ok(())
    } else {
        Err(Error::InvariantViolation(format!(
            "attempt {} cannot transition from {} to {to}",
            attempt.id, attempt.state
        )))
    }
}

pub fn attempt_deletion(attempt: &Attempt) -> Result<()> {
    if attempt.state == AttemptState::InProgress {
        Ok(())
    } else {
        Err(Error::InvariantViolation(format!(
            "attempt {} cannot be discarded while {}",
            attempt.id, attempt.state
        )))
    }
}
