/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The timeout ticker: a thread that turns scheduled timeouts into inbox messages.
//!
//! At most one timeout is pending at a time. Scheduling a timeout for a later (height, round,
//! step) replaces the pending one; scheduling one for an earlier tuple is ignored, since the
//! engine has already moved past it. When the pending timeout's deadline passes, its
//! [`TimeoutInfo`] is delivered into the consensus inbox like any other message, which is what
//! keeps the engine single-threaded: timeouts and network messages are processed by the same
//! loop in arrival order.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::types::basic::{Height, Round};

use super::round_state::Step;
use super::ConsensusInput;

/// A scheduled timeout: fire after `duration`, on behalf of the given (height, round, step).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeoutInfo {
    pub duration: Duration,
    pub height: Height,
    pub round: Round,
    pub step: Step,
}

impl TimeoutInfo {
    /// Whether this timeout belongs to a later point of the protocol than `other`.
    pub(crate) fn supersedes(&self, other: &TimeoutInfo) -> bool {
        (self.height, self.round, self.step) > (other.height, other.round, other.step)
    }
}

/// Start the ticker thread. Timeouts scheduled through the returned sender are delivered into
/// `inbox` when they expire. The thread exits when every sender has been dropped.
pub(crate) fn start_timeout_ticker(
    inbox: Sender<ConsensusInput>,
) -> (Sender<TimeoutInfo>, JoinHandle<()>) {
    let (tick_tx, tick_rx) = mpsc::channel::<TimeoutInfo>();
    let handle = thread::spawn(move || {
        let mut pending: Option<(Instant, TimeoutInfo)> = None;
        loop {
            match pending {
                None => match tick_rx.recv() {
                    Ok(timeout_info) => {
                        pending = Some((Instant::now() + timeout_info.duration, timeout_info));
                    }
                    Err(_) => return,
                },
                Some((deadline, timeout_info)) => {
                    let now = Instant::now();
                    if deadline <= now {
                        if inbox.send(ConsensusInput::Timeout(timeout_info)).is_err() {
                            return;
                        }
                        pending = None;
                        continue;
                    }
                    match tick_rx.recv_timeout(deadline - now) {
                        Ok(new_timeout_info) => {
                            if new_timeout_info.supersedes(&timeout_info) {
                                pending = Some((
                                    Instant::now() + new_timeout_info.duration,
                                    new_timeout_info,
                                ));
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if inbox.send(ConsensusInput::Timeout(timeout_info)).is_err() {
                                return;
                            }
                            pending = None;
                        }
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
            }
        }
    });
    (tick_tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::basic::{Height, Round};

    #[test]
    fn later_tuples_supersede_earlier_ones() {
        let base = TimeoutInfo {
            duration: Duration::from_millis(10),
            height: Height::new(5),
            round: Round::new(1),
            step: Step::Prevote,
        };
        let later_step = TimeoutInfo {
            step: Step::PrevoteWait,
            ..base
        };
        let later_round = TimeoutInfo {
            round: Round::new(2),
            step: Step::Propose,
            ..base
        };
        let earlier_height = TimeoutInfo {
            height: Height::new(4),
            round: Round::new(9),
            step: Step::Commit,
            ..base
        };
        assert!(later_step.supersedes(&base));
        assert!(later_round.supersedes(&base));
        assert!(!earlier_height.supersedes(&base));
        assert!(!base.supersedes(&base));
    }

    #[test]
    fn expired_timeouts_arrive_in_the_inbox() {
        let (inbox_tx, inbox_rx) = mpsc::channel();
        let (tick_tx, _handle) = start_timeout_ticker(inbox_tx);
        let timeout_info = TimeoutInfo {
            duration: Duration::from_millis(5),
            height: Height::new(1),
            round: Round::new(0),
            step: Step::Propose,
        };
        tick_tx.send(timeout_info).unwrap();
        match inbox_rx.recv_timeout(Duration::from_secs(1)).unwrap() {
            ConsensusInput::Timeout(received) => assert_eq!(received, timeout_info),
            _ => panic!("expected a timeout"),
        }
    }
}
