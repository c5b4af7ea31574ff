//! Token-space sharding for the single shared `mio::Poll`.
//!
//! Every registered source gets a contiguous slice of the `usize` token
//! space (`TOKENS_PER_SOURCE` wide) for its own bookkeeping -- a listener,
//! a waker, a slab of connections, whatever it needs -- so the loop can
//! route a readiness event back to its owning source with two integer ops
//! instead of a `HashMap<Token, usize>` lookup on every poll wakeup.
//!
//! The shard key is a source's stable `source_id` (see
//! `crate::event_loop`), not its current position in the loop's registry:
//! positions shift when an earlier source is deregistered, but a live
//! socket's already-registered `Token` can never be re-baked, so the key
//! that routes it back must never change underneath it.

use mio::Token;

/// 16 million local tokens per source. Generous enough for any connection
/// count this crate is meant for; cheap because it only costs address
/// space in the `usize` token, not memory.
pub const TOKENS_PER_SOURCE: usize = 1 << 24;

pub fn token_for(source_id: usize, local: usize) -> Token {
    debug_assert!(local < TOKENS_PER_SOURCE, "local token out of range");
    Token(source_id * TOKENS_PER_SOURCE + local)
}

pub fn split_token(token: Token) -> (usize, usize) {
    (token.0 / TOKENS_PER_SOURCE, token.0 % TOKENS_PER_SOURCE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let t = token_for(3, 42);
        assert_eq!(split_token(t), (3, 42));
    }
}
