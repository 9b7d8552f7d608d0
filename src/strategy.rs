//! Scaling strategy (C4, spec §4.4): a periodic control loop, not an
//! event-driven one, because provider actions have minute-scale latency
//! (§4.4 "Why periodic, not event-driven").

use crate::executor::{LoadView, Provider};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait ScalingStrategy: Send + Sync {
    /// Called once per tick with the current load view and block count.
    async fn tick(&self, load: LoadView, current_blocks: usize, provider: &dyn Provider);
}

/// The required default policy: maintain enough blocks to cover outstanding
/// tasks (capped at `max_blocks`), and scale down to `min_blocks` once
/// `max_idletime` has passed with no submissions. Ties between a scale-out
/// and scale-in signal in the same tick favor scaling out (§4.4).
pub struct SimpleStrategy {
    pub min_blocks: usize,
    pub max_blocks: usize,
    pub max_idletime: Duration,
}

impl SimpleStrategy {
    pub fn new(min_blocks: usize, max_blocks: usize, max_idletime: Duration) -> Self {
        Self {
            min_blocks,
            max_blocks,
            max_idletime,
        }
    }

    /// Pure decision function, split out from `tick` so it can be unit
    /// tested without a real `Provider`.
    fn decide(&self, load: LoadView, current_blocks: usize) -> Option<(bool, usize)> {
        let wants_out = load.outstanding > current_blocks && current_blocks < self.max_blocks;
        let wants_in = load.idle_for >= self.max_idletime && current_blocks > self.min_blocks;

        // Tie-break in favour of scaling out over in (§4.4).
        if wants_out {
            let target = load.outstanding.min(self.max_blocks);
            Some((true, target - current_blocks))
        } else if wants_in {
            Some((false, current_blocks - self.min_blocks))
        } else {
            None
        }
    }
}

#[async_trait]
impl ScalingStrategy for SimpleStrategy {
    async fn tick(&self, load: LoadView, current_blocks: usize, provider: &dyn Provider) {
        match self.decide(load, current_blocks) {
            Some((true, n)) if n > 0 => provider.scale_out(n).await,
            Some((false, n)) if n > 0 => provider.scale_in(n).await,
            _ => {}
        }
    }
}

/// Drives a [`ScalingStrategy`] on a fixed tick against a narrow read-only
/// load source, breaking the Interchange/Executor/Strategy ownership cycle
/// described in spec §9: the strategy only ever sees `LoadView` plus the
/// `Provider` it controls, never the whole core.
pub async fn run_strategy_loop(
    strategy: Arc<dyn ScalingStrategy>,
    provider: Arc<dyn Provider>,
    load_source: Arc<dyn Fn() -> LoadView + Send + Sync>,
    tick_interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(tick_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let load = load_source();
                let blocks = provider.status();
                strategy.tick(load, blocks, provider.as_ref()).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
