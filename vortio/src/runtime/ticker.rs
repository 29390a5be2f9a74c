use bitflags::bitflags;

/// Monotonic per-worker tick counter, one increment per event-loop pass.
#[derive(Debug)]
pub(crate) struct Ticker {
    tick: u32,
}

impl Ticker {
    pub(crate) fn new() -> Self {
        Self { tick: 0 }
    }

    pub(crate) fn next(&mut self) -> u32 {
        self.tick = self.tick.wrapping_add(1);
        self.tick
    }
}

bitflags! {
    /// Actions a worker owes this tick, in priority order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct TickerEvents: u8 {
        /// Flush submissions and run one pass over ready completions.
        const POLL_COMPLETIONS = 1;

        /// Visit the global queue before the local one.
        const POP_GLOBAL = 1 << 1;

        /// The runtime is shutting down; leave the loop.
        const SHUTDOWN = 1 << 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_increments_and_wraps() {
        let mut ticker = Ticker { tick: u32::MAX - 1 };
        assert_eq!(ticker.next(), u32::MAX);
        assert_eq!(ticker.next(), 0);
        assert_eq!(ticker.next(), 1);
    }

    #[test]
    fn test_events_compose() {
        let events = TickerEvents::POLL_COMPLETIONS | TickerEvents::POP_GLOBAL;
        assert!(events.contains(TickerEvents::POLL_COMPLETIONS));
        assert!(!events.contains(TickerEvents::SHUTDOWN));
    }
}
