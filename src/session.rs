//! Dual-session execution.
//!
//! Two device sessions are kept alternately in flight: while the device
//! computes one input the host transfers the next. Each slot moves through
//! `Idle -> Submitted -> Polling -> Ready -> Idle`, and a slot only becomes
//! `Ready` from a status read made for it.

use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::{LinkError, Result};
use crate::proto::message::{self, DME_MODE_ASYNC, SessionStatus};
use crate::stats::Stats;
use crate::transport::Transport;

pub const SLOTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Submitted { session: u16 },
    Polling { session: u16, polls: u32 },
    Ready { session: u16, result_size: u32 },
}

impl SlotState {
    pub fn session(&self) -> Option<u16> {
        match *self {
            SlotState::Idle => None,
            SlotState::Submitted { session }
            | SlotState::Polling { session, .. }
            | SlotState::Ready { session, .. } => Some(session),
        }
    }

    /// Submitted or polling: the device still owns this session.
    pub fn is_running(&self) -> bool {
        matches!(self, SlotState::Submitted { .. } | SlotState::Polling { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSlot {
    pub state: SlotState,
    /// Position of the input in the run that occupies this slot.
    pub input: u64,
}

impl Default for SessionSlot {
    fn default() -> Self {
        Self {
            state: SlotState::Idle,
            input: 0,
        }
    }
}

/// Bookkeeping for the two slots. All transitions are checked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPair {
    slots: [SessionSlot; SLOTS],
}

impl SessionPair {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(&self, slot: usize) -> &SessionSlot {
        &self.slots[slot % SLOTS]
    }

    /// Fails unless `slot` can take a new submission.
    pub fn ensure_idle(&self, slot: usize) -> Result<()> {
        let state = self.slot(slot).state;
        if state == SlotState::Idle {
            return Ok(());
        }
        error!(slot, ?state, "submission into an occupied slot");
        Err(LinkError::violation(format!(
            "slot {slot} is {state:?}; submitting would overwrite session {:?}",
            state.session()
        )))
    }

    pub fn submitted(&mut self, slot: usize, session: u16, input: u64) -> Result<()> {
        self.ensure_idle(slot)?;
        self.slots[slot % SLOTS] = SessionSlot {
            state: SlotState::Submitted { session },
            input,
        };
        Ok(())
    }

    /// Applies one fresh status read. Returns `true` once the slot is ready.
    pub fn polled(&mut self, slot: usize, status: &SessionStatus) -> Result<bool> {
        let entry = &mut self.slots[slot % SLOTS];
        let (session, polls) = match entry.state {
            SlotState::Submitted { session } => (session, 0),
            SlotState::Polling { session, polls } => (session, polls),
            other => {
                return Err(LinkError::violation(format!(
                    "status read for slot {slot} in state {other:?}"
                )));
            }
        };
        if status.session != session {
            error!(slot, expected = session, got = status.session, "status for wrong session");
            return Err(LinkError::violation(format!(
                "slot {slot} polls session {session}, device answered for {}",
                status.session
            )));
        }
        entry.state = if status.ready {
            SlotState::Ready {
                session,
                result_size: status.result_size,
            }
        } else {
            SlotState::Polling {
                session,
                polls: polls.saturating_add(1),
            }
        };
        Ok(status.ready)
    }

    /// Returns a ready slot to idle.
    pub fn consumed(&mut self, slot: usize) -> Result<(u16, u32)> {
        let entry = &mut self.slots[slot % SLOTS];
        match entry.state {
            SlotState::Ready {
                session,
                result_size,
            } => {
                entry.state = SlotState::Idle;
                Ok((session, result_size))
            }
            other => Err(LinkError::violation(format!(
                "consuming slot {slot} in state {other:?}"
            ))),
        }
    }

    /// Occupied slots, oldest input first.
    pub fn occupied_oldest_first(&self) -> Vec<usize> {
        let mut occupied: Vec<usize> = (0..SLOTS)
            .filter(|&i| self.slots[i].state != SlotState::Idle)
            .collect();
        occupied.sort_by_key(|&i| self.slots[i].input);
        occupied
    }
}

/// One finished inference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    pub slot: usize,
    pub session: u16,
    pub input: u64,
    pub raw: Vec<u8>,
}

/// Ping-pong execution over one configured model.
pub struct DualSessionPipeline<'d, T: Transport> {
    dev: &'d mut Dispatcher<T>,
    pair: SessionPair,
    model_id: u16,
    pub stats: Stats,
}

impl<'d, T: Transport> DualSessionPipeline<'d, T> {
    pub fn new(dev: &'d mut Dispatcher<T>, model_id: u16) -> Self {
        Self {
            dev,
            pair: SessionPair::new(),
            model_id,
            stats: Stats::new("session"),
        }
    }

    pub fn pair(&self) -> &SessionPair {
        &self.pair
    }

    /// Sends `image` as a new asynchronous session in `slot`.
    pub fn submit(&mut self, slot: usize, input: u64, image: &[u8]) -> Result<u16> {
        if self.dev.cancel_token().is_cancelled() {
            return Err(LinkError::Cancelled);
        }
        self.pair.ensure_idle(slot)?;
        let request = message::dme_send_image(image, DME_MODE_ASYNC, self.model_id);
        let rsp = self.dev.execute_with_retry(&request)?;
        let session = message::dme_send_image_reply(&rsp)?;
        self.pair.submitted(slot, session, input)?;
        self.stats.add_submitted(image.len());
        debug!(slot, session, input, "session submitted");
        Ok(session)
    }

    /// Polls `slot` until its session is ready and returns the result size.
    pub fn wait_ready(&mut self, slot: usize) -> Result<u32> {
        let policy = self.dev.config().poll.clone();
        let cancel = self.dev.cancel_token().clone();
        let started = Instant::now();
        loop {
            let session = match self.pair.slot(slot).state {
                SlotState::Ready { result_size, .. } => return Ok(result_size),
                SlotState::Idle => {
                    return Err(LinkError::violation(format!("polling idle slot {slot}")));
                }
                state => state.session().unwrap_or_default(),
            };
            if cancel.is_cancelled() {
                warn!(slot, session, "poll cancelled");
                return Err(LinkError::Cancelled);
            }
            let rsp = self.dev.execute(&message::dme_get_status(session))?;
            let status = message::dme_get_status_reply(&rsp)?;
            if self.pair.polled(slot, &status)? {
                continue;
            }
            if let Some(max) = policy.max_wait
                && started.elapsed() >= max
            {
                error!(slot, session, "session not ready in time");
                return Err(LinkError::Timeout {
                    duration_ms: max.as_millis() as u64,
                });
            }
            if let Some(interval) = policy.interval {
                std::thread::sleep(interval);
            }
        }
    }

    /// Waits for `slot`, pulls its raw result and frees the slot.
    pub fn retrieve(&mut self, slot: usize) -> Result<Completed> {
        let result_size = self.wait_ready(slot)?;
        let raw = self.dev.pull(0, result_size as usize)?;
        let input = self.pair.slot(slot).input;
        let (session, _) = self.pair.consumed(slot)?;
        self.stats.add_retrieved(raw.len());
        debug!(slot, session, input, len = raw.len(), "session retrieved");
        Ok(Completed {
            slot,
            session,
            input,
            raw,
        })
    }

    /// Runs every input through the two slots, handing results to
    /// `on_result` in input order. A result-local error from `on_result`
    /// counts as bad and the run continues.
    ///
    /// A stop request returns `Cancelled` at the next submission or poll
    /// without draining; whatever is still on the device is left there.
    pub fn run<I, F>(&mut self, inputs: I, mut on_result: F) -> Result<()>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
        F: FnMut(Completed) -> Result<()>,
    {
        let mut inputs = inputs.into_iter().peekable();
        let Some(first) = inputs.next() else {
            return Ok(());
        };
        self.submit(0, 0, first.as_ref())?;

        let mut input = 0u64;
        while let Some(image) = inputs.next() {
            input += 1;
            let slot = (input % SLOTS as u64) as usize;
            self.submit(slot, input, image.as_ref())?;
            if inputs.peek().is_none() {
                break;
            }
            let done = self.retrieve(1 - slot)?;
            self.stats.absorb(on_result(done))?;
            self.stats.maybe_log();
        }

        for slot in self.pair.occupied_oldest_first() {
            let done = self.retrieve(slot)?;
            self.stats.absorb(on_result(done))?;
        }
        self.stats.log_summary();
        info!(inputs = input + 1, "session run complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::proto::command::Command;
    use crate::proto::status;
    use crate::sim::{Event, SimDevice};
    use proptest::prelude::*;
    use std::time::Duration;

    fn device(polls_before_ready: u32) -> Dispatcher<SimDevice> {
        let mut sim = SimDevice::new();
        sim.polls_before_ready = polls_before_ready;
        Dispatcher::new(sim, SimDevice::test_config())
    }

    fn inputs(n: u8) -> Vec<Vec<u8>> {
        (0..n).map(|i| vec![10 + i; 32]).collect()
    }

    #[test]
    fn five_turns_alternate_and_drain_two() {
        let mut dev = device(1);
        let mut p = DualSessionPipeline::new(&mut dev, 1000);
        let mut done = Vec::new();
        p.run(inputs(5), |c| {
            done.push(c);
            Ok(())
        })
        .unwrap();

        let retrieved: Vec<u64> = done.iter().map(|c| c.input).collect();
        assert_eq!(retrieved, [0, 1, 2, 3, 4]);

        done.sort_by_key(|c| c.session);
        let slots: Vec<usize> = done.iter().map(|c| c.slot).collect();
        assert_eq!(slots, [0, 1, 0, 1, 0]);
        for c in &done {
            let nodes = crate::result::parse(&c.raw).unwrap();
            assert!(nodes[0].bytes.iter().all(|&b| b == 10 + c.input as u8));
        }

        let log = &dev.transport().log;
        let last_send = log
            .iter()
            .rposition(|e| matches!(e, Event::Command(Command::DmeSendImage, ..)))
            .unwrap();
        let drained = log[last_send..]
            .iter()
            .filter(|e| matches!(e, Event::Command(Command::AckNack, ..)))
            .count();
        assert_eq!(drained, 2);
        assert_eq!(dev.transport().status_reads, 5 * 2);
    }

    #[test]
    fn single_input_drains_slot_zero() {
        let mut dev = device(0);
        let mut p = DualSessionPipeline::new(&mut dev, 1000);
        let mut done = Vec::new();
        p.run(inputs(1), |c| {
            done.push((c.slot, c.input));
            Ok(())
        })
        .unwrap();
        assert_eq!(done, [(0, 0)]);
        assert_eq!(p.pair(), &SessionPair::new());
    }

    #[test]
    fn not_ready_is_never_stale() {
        let mut dev = device(3);
        let mut p = DualSessionPipeline::new(&mut dev, 1000);
        let mut n = 0;
        p.run(inputs(4), |_| {
            n += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(n, 4);
        // every session needed its own three not-ready reads plus the ready one
        assert_eq!(dev.transport().status_reads, 4 * 4);
    }

    #[test]
    fn spoiled_result_counted_and_skipped() {
        let mut dev = device(0);
        let mut p = DualSessionPipeline::new(&mut dev, 1000);
        let mut got = Vec::new();
        p.run(inputs(3), |c| {
            let raw = if c.input == 1 { &c.raw[..c.raw.len() - 1] } else { &c.raw[..] };
            crate::result::parse(raw)?;
            got.push(c.input);
            Ok(())
        })
        .unwrap();
        assert_eq!(got, [0, 2]);
        assert_eq!(p.stats.bad, 1);
    }

    #[test]
    fn pending_reply_without_size_keeps_polling() {
        let mut dev = device(2);
        let mut p = DualSessionPipeline::new(&mut dev, 1000);
        p.submit(0, 0, &[1u8; 8]).unwrap();
        let size = p.wait_ready(0).unwrap();
        assert_eq!(size as usize, SimDevice::result_for(1).len());
        assert_eq!(p.dev.transport().status_reads, 3);
        assert!(matches!(
            p.pair().slot(0).state,
            SlotState::Ready { session: 1, .. }
        ));
    }

    #[test]
    fn poll_counter_saturates() {
        let mut pair = SessionPair::new();
        pair.slots[0] = SessionSlot {
            state: SlotState::Polling {
                session: 7,
                polls: u32::MAX,
            },
            input: 0,
        };
        let pending = SessionStatus {
            session: 7,
            ready: false,
            result_size: 0,
        };
        assert!(!pair.polled(0, &pending).unwrap());
        assert_eq!(
            pair.slot(0).state,
            SlotState::Polling {
                session: 7,
                polls: u32::MAX
            }
        );
    }

    #[test]
    fn unknown_session_rejected() {
        let mut dev = device(0);
        let mut p = DualSessionPipeline::new(&mut dev, 1000);
        p.submit(0, 0, &[1u8; 8]).unwrap();
        p.dev.transport_mut().fail_next(Command::DmeGetStatus, status::BAD_SESSION);
        assert!(matches!(
            p.retrieve(0),
            Err(LinkError::DeviceRejected {
                status: status::BAD_SESSION,
                ..
            })
        ));
    }

    #[test]
    fn double_submit_refused_before_sending() {
        let mut dev = device(0);
        let mut p = DualSessionPipeline::new(&mut dev, 1000);
        p.submit(1, 0, &[1u8; 8]).unwrap();
        assert!(matches!(
            p.submit(1, 1, &[2u8; 8]),
            Err(LinkError::ProtocolViolation { .. })
        ));
        assert_eq!(p.dev.transport().commands(Command::DmeSendImage).len(), 1);
    }

    #[test]
    fn bounded_poll_times_out() {
        let mut sim = SimDevice::new();
        sim.polls_before_ready = u32::MAX;
        let mut config = SimDevice::test_config();
        config.poll.max_wait = Some(Duration::from_millis(30));
        config.poll.interval = Some(Duration::from_millis(5));
        let mut dev = Dispatcher::new(sim, config);
        let mut p = DualSessionPipeline::new(&mut dev, 1000);
        p.submit(0, 0, &[0u8; 8]).unwrap();
        assert!(matches!(
            p.retrieve(0),
            Err(LinkError::Timeout { duration_ms: 30 })
        ));
        assert!(matches!(
            p.pair().slot(0).state,
            SlotState::Polling { session: 1, .. }
        ));
    }

    #[test]
    fn cancel_skips_drain() {
        let cancel = CancelToken::new();
        let mut dev = device(0).with_cancel(cancel.clone());
        let mut p = DualSessionPipeline::new(&mut dev, 1000);
        let mut seen = Vec::new();
        let err = p
            .run(inputs(6), |c| {
                seen.push(c.input);
                cancel.cancel();
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, LinkError::Cancelled));
        assert_eq!(seen, [0]);
        // input 1 is still on the device
        assert!(p.pair().slot(1).state.is_running());
    }

    #[test]
    fn submit_retries_transient_busy() {
        let mut dev = device(0);
        dev.transport_mut().drop_next(Command::DmeSendImage, 2);
        let mut p = DualSessionPipeline::new(&mut dev, 1000);
        assert_eq!(p.submit(0, 0, &[5u8; 8]).unwrap(), 1);
        assert_eq!(p.dev.transport().dropped(Command::DmeSendImage), 2);
    }

    #[test]
    fn status_for_other_session_is_violation() {
        let mut pair = SessionPair::new();
        pair.submitted(0, 7, 0).unwrap();
        let wrong = SessionStatus {
            session: 8,
            ready: true,
            result_size: 1,
        };
        assert!(pair.polled(0, &wrong).is_err());
        assert_eq!(pair.slot(0).state, SlotState::Submitted { session: 7 });
    }

    #[derive(Debug, Clone)]
    enum Op {
        Submit(usize),
        Poll(usize, bool),
        Consume(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..SLOTS).prop_map(Op::Submit),
            (0..SLOTS, any::<bool>()).prop_map(|(s, r)| Op::Poll(s, r)),
            (0..SLOTS).prop_map(Op::Consume),
        ]
    }

    proptest! {
        #[test]
        fn occupied_slot_never_resubmitted(ops in prop::collection::vec(op(), 0..80)) {
            let mut pair = SessionPair::new();
            let mut next_session = 1u16;
            for op in ops {
                let before = pair.clone();
                match op {
                    Op::Submit(s) => {
                        let was = before.slot(s).state;
                        let res = pair.submitted(s, next_session, next_session as u64);
                        next_session += 1;
                        if was == SlotState::Idle {
                            prop_assert!(res.is_ok());
                            prop_assert_eq!(pair.slot(s).state.session(), Some(next_session - 1));
                        } else {
                            prop_assert!(res.is_err());
                            prop_assert_eq!(&pair, &before);
                        }
                    }
                    Op::Poll(s, ready) => {
                        let status = SessionStatus {
                            session: before.slot(s).state.session().unwrap_or(0),
                            ready,
                            result_size: 64,
                        };
                        if pair.polled(s, &status).is_err() {
                            prop_assert_eq!(&pair, &before);
                        }
                    }
                    Op::Consume(s) => {
                        if pair.consumed(s).is_ok() {
                            prop_assert_eq!(pair.slot(s).state, SlotState::Idle);
                        } else {
                            prop_assert_eq!(&pair, &before);
                        }
                    }
                }
            }
        }
    }
}
