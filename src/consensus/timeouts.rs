//! One-shot step timers with round-indexed backoff.
//!
//! Each of propose/prevote/precommit owns at most one live timer task.
//! Scheduling replaces any live task; stopping a non-running timer is a
//! no-op. Expiry posts a `TimeoutEvent` on the main event channel -- the
//! engine, not the timer, decides whether the event is still current.

use crate::config::TimeoutConfig;
use crate::consensus::events::{CoreEvent, TimeoutEvent};
use crate::consensus::round_state::Step;
use crate::types::{Height, Round};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::debug;

pub fn timeout_duration(cfg: &TimeoutConfig, step: Step, round: Round) -> Duration {
    let base = match step {
        Step::Propose => cfg.base_propose_ms,
        Step::Prevote => cfg.base_prevote_ms,
        Step::Precommit => cfg.base_precommit_ms,
    };
    Duration::from_millis(base + round * cfg.delta_ms)
}

struct StepTimer {
    step: Step,
    handle: Option<JoinHandle<()>>,
}

impl StepTimer {
    fn new(step: Step) -> Self {
        Self { step, handle: None }
    }

    fn schedule(
        &mut self,
        duration: Duration,
        height: Height,
        round: Round,
        events: UnboundedSender<CoreEvent>,
    ) {
        self.stop();
        let step = self.step;
        debug!(?step, height, round, ?duration, "timeout scheduled");
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = events.send(CoreEvent::Timeout(TimeoutEvent { step, height, round }));
        }));
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

pub struct TimeoutScheduler {
    cfg: TimeoutConfig,
    events: UnboundedSender<CoreEvent>,
    propose: StepTimer,
    prevote: StepTimer,
    precommit: StepTimer,
}

impl TimeoutScheduler {
    pub fn new(cfg: TimeoutConfig, events: UnboundedSender<CoreEvent>) -> Self {
        Self {
            cfg,
            events,
            propose: StepTimer::new(Step::Propose),
            prevote: StepTimer::new(Step::Prevote),
            precommit: StepTimer::new(Step::Precommit),
        }
    }

    pub fn schedule(&mut self, step: Step, height: Height, round: Round) {
        let duration = timeout_duration(&self.cfg, step, round);
        let events = self.events.clone();
        self.timer_mut(step).schedule(duration, height, round, events);
    }

    pub fn stop(&mut self, step: Step) {
        self.timer_mut(step).stop();
    }

    pub fn stop_all(&mut self) {
        self.propose.stop();
        self.prevote.stop();
        self.precommit.stop();
    }

    fn timer_mut(&mut self, step: Step) -> &mut StepTimer {
        match step {
            Step::Propose => &mut self.propose,
            Step::Prevote => &mut self.prevote,
            Step::Precommit => &mut self.precommit,
        }
    }
}
