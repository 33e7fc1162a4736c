//! thred core
//!
//! Model backends for the thred training loop. The bigram backend is a small,
//! dependency-free language model that exercises every execution context:
//! training, perplexity scoring and decoding (greedy, beam, sampling).

pub mod bigram;

pub use bigram::{BigramModel, BigramModelFactory};
