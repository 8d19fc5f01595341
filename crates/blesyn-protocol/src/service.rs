use std::thread;
use std::time::{Duration, Instant};

use blesyn_transport::{InitiatorTransport, ResponderTransport};
use tracing::debug;

use crate::initiator::InitiatorProtocol;
use crate::observer::SessionObserver;
use crate::responder::{AdvertisingState, ResponderProtocol};
use crate::session::SessionPhase;

/// Polling cadence for [`run_until_settled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Sleep between polls that found no work.
    pub tick_interval: Duration,
    pub max_ticks: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(50),
            max_ticks: 2000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerExit {
    Settled { ticks: u64 },
    TickBudgetExhausted { ticks: u64 },
}

impl RunnerExit {
    pub fn is_settled(&self) -> bool {
        matches!(self, RunnerExit::Settled { .. })
    }

    pub fn ticks(&self) -> u64 {
        match self {
            RunnerExit::Settled { ticks } | RunnerExit::TickBudgetExhausted { ticks } => *ticks,
        }
    }
}

/// Something the runner can poll until a session finishes.
pub trait Driver {
    /// Handles whatever work is pending. Returns how much was done.
    fn step(&mut self, now: Instant) -> usize;

    /// Applies the phase timeout, if any.
    fn check_timeout(&mut self, _now: Instant) -> bool {
        false
    }

    fn is_settled(&self) -> bool;
}

impl<T: ResponderTransport, O: SessionObserver> Driver for ResponderProtocol<T, O> {
    fn step(&mut self, now: Instant) -> usize {
        self.pump(now)
    }

    fn check_timeout(&mut self, now: Instant) -> bool {
        ResponderProtocol::check_timeout(self, now)
    }

    /// A responder whose service never registered has nothing left to do.
    fn is_settled(&self) -> bool {
        self.phase().is_terminal() || self.advertising_state() == AdvertisingState::Failed
    }
}

impl<T: InitiatorTransport, O: SessionObserver> Driver for InitiatorProtocol<T, O> {
    fn step(&mut self, now: Instant) -> usize {
        self.pump(now)
    }

    fn check_timeout(&mut self, now: Instant) -> bool {
        InitiatorProtocol::check_timeout(self, now)
    }

    fn is_settled(&self) -> bool {
        self.is_finished()
    }
}

/// Polls `driver` until it settles or the tick budget runs out. Sleeps
/// `tick_interval` only after a poll that found nothing to do.
pub fn run_until_settled<D: Driver + ?Sized>(driver: &mut D, config: &RunnerConfig) -> RunnerExit {
    let mut ticks = 0;
    loop {
        if driver.is_settled() {
            debug!("runner: settled after {ticks} ticks");
            return RunnerExit::Settled { ticks };
        }
        if ticks >= config.max_ticks {
            debug!("runner: tick budget of {} exhausted", config.max_ticks);
            return RunnerExit::TickBudgetExhausted { ticks };
        }
        ticks += 1;

        let now = Instant::now();
        let work = driver.step(now);
        let timed_out = driver.check_timeout(now);
        if work == 0 && !timed_out && !driver.is_settled() {
            thread::sleep(config.tick_interval);
        }
    }
}
