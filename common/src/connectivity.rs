use std::{thread, time::Duration};

use log::{info, warn};

use crate::error::ConnectivityError;

/// A connection the device must hold before any detection cycle runs.
pub trait Link {
    fn name(&self) -> &'static str;
    fn is_connected(&mut self) -> bool;
    fn try_connect(&mut self) -> Result<(), ConnectivityError>;
}

pub trait Backoff {
    /// Delay before retry number `attempt` (1-based, counted after a failure).
    fn delay_ms(&self, attempt: u32) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay(pub u64);

impl Backoff for FixedDelay {
    fn delay_ms(&self, _attempt: u32) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Backoff for ExponentialBackoff {
    fn delay_ms(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(1).min(32);
        self.base_ms
            .saturating_mul(1_u64 << shift)
            .min(self.max_ms.max(self.base_ms))
    }
}

pub trait Sleeper {
    fn sleep_ms(&mut self, ms: u64);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep_ms(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

#[derive(Debug, Clone)]
pub struct Reconnector<B> {
    backoff: B,
    max_attempts: Option<u32>,
}

impl<B: Backoff> Reconnector<B> {
    pub fn unbounded(backoff: B) -> Self {
        Self {
            backoff,
            max_attempts: None,
        }
    }

    pub fn bounded(backoff: B, max_attempts: u32) -> Self {
        Self {
            backoff,
            max_attempts: Some(max_attempts.max(1)),
        }
    }

    pub fn with_limit(backoff: B, max_attempts: Option<u32>) -> Self {
        match max_attempts {
            Some(limit) => Self::bounded(backoff, limit),
            None => Self::unbounded(backoff),
        }
    }

    /// Blocks until `link` is up. Returns the number of connect attempts made,
    /// zero when the link was already up.
    pub fn ensure_connected<L, S>(
        &self,
        link: &mut L,
        sleeper: &mut S,
    ) -> Result<u32, ConnectivityError>
    where
        L: Link + ?Sized,
        S: Sleeper + ?Sized,
    {
        if link.is_connected() {
            return Ok(0);
        }

        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match link.try_connect() {
                Ok(()) => {
                    info!("{} connected on attempt {attempt}", link.name());
                    return Ok(attempt);
                }
                Err(err) => {
                    if self.max_attempts.is_some_and(|limit| attempt >= limit) {
                        warn!("{} giving up after {attempt} attempts: {err}", link.name());
                        return Err(ConnectivityError::Exhausted {
                            link: link.name(),
                            attempts: attempt,
                        });
                    }

                    let delay = self.backoff.delay_ms(attempt);
                    warn!(
                        "{} connect attempt {attempt} failed ({err}); retrying in {delay}ms",
                        link.name()
                    );
                    sleeper.sleep_ms(delay);
                }
            }
        }
    }
}
