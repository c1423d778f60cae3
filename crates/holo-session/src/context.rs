//! The bounded conversation history fed to generation.

use crate::config::{ContextConfig, EvictionPolicy};
use holo_voice::Exchange;
use std::collections::VecDeque;

/// The most recent exchanges of a session, bounded by turn count and size.
#[derive(Debug)]
pub struct ContextWindow {
    config: ContextConfig,
    exchanges: VecDeque<Exchange>,
    chars: usize,
}

fn exchange_chars(exchange: &Exchange) -> usize {
    exchange.said.chars().count() + exchange.replied.chars().count()
}

impl ContextWindow {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            exchanges: VecDeque::new(),
            chars: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    pub fn chars(&self) -> usize {
        self.chars
    }

    /// Appends a finished exchange and evicts until both bounds hold.
    ///
    /// An exchange larger than the whole character budget is still kept on
    /// its own, so the latest turn is always in context.
    pub fn push(&mut self, exchange: Exchange) -> usize {
        self.chars += exchange_chars(&exchange);
        self.exchanges.push_back(exchange);

        let mut evicted = 0;
        while self.exchanges.len() > 1
            && (self.exchanges.len() > self.config.max_turns || self.chars > self.config.max_chars)
        {
            let batch = match self.config.eviction {
                EvictionPolicy::DropOldest => 1,
                EvictionPolicy::DropOldestHalf => (self.exchanges.len() / 2).max(1),
            };
            for _ in 0..batch.min(self.exchanges.len() - 1) {
                if let Some(old) = self.exchanges.pop_front() {
                    self.chars -= exchange_chars(&old);
                    evicted += 1;
                }
            }
        }
        if evicted > 0 {
            tracing::debug!(evicted, kept = self.exchanges.len(), "context window evicted exchanges");
        }
        evicted
    }

    /// Oldest-first copy of the window.
    pub fn snapshot(&self) -> Vec<Exchange> {
        self.exchanges.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(said: &str, replied: &str) -> Exchange {
        Exchange {
            participant_id: "alice".into(),
            said: said.into(),
            replied: replied.into(),
        }
    }

    fn window(max_turns: usize, max_chars: usize, eviction: EvictionPolicy) -> ContextWindow {
        ContextWindow::new(ContextConfig {
            max_turns,
            max_chars,
            eviction,
        })
    }

    #[test]
    fn evicts_oldest_past_turn_limit() {
        let mut w = window(2, 1_000, EvictionPolicy::DropOldest);
        w.push(exchange("one", "1"));
        w.push(exchange("two", "2"));
        assert_eq!(w.push(exchange("three", "3")), 1);
        let said: Vec<_> = w.snapshot().into_iter().map(|e| e.said).collect();
        assert_eq!(said, vec!["two", "three"]);
    }

    #[test]
    fn evicts_by_characters() {
        let mut w = window(10, 10, EvictionPolicy::DropOldest);
        w.push(exchange("abcd", "ef"));
        w.push(exchange("ghij", "kl"));
        assert_eq!(w.len(), 1);
        assert_eq!(w.chars(), 6);
    }

    #[test]
    fn oversized_exchange_is_kept_alone() {
        let mut w = window(10, 4, EvictionPolicy::DropOldest);
        w.push(exchange("a", "b"));
        w.push(exchange("a long question", "a long answer"));
        assert_eq!(w.len(), 1);
        assert_eq!(w.snapshot()[0].said, "a long question");
    }

    #[test]
    fn drop_oldest_half_evicts_in_batches() {
        let mut w = window(4, 1_000, EvictionPolicy::DropOldestHalf);
        for i in 0..4 {
            w.push(exchange(&i.to_string(), ""));
        }
        assert_eq!(w.push(exchange("4", "")), 2);
        let said: Vec<_> = w.snapshot().into_iter().map(|e| e.said).collect();
        assert_eq!(said, vec!["2", "3", "4"]);
    }
}
