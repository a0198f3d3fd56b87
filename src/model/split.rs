//! Split functions
//!
//! A split partitions a population N into a taken part T and a left part
//! L. Non-virtual splits consume what they take (T + L = N); virtual
//! splits only measure (L = N). The taken part lands in the simulation's
//! split buffer, from where later commands of the same reaction release
//! it into compartments or wait lists.

use crate::rng::RngManager;
use crate::Population;
use serde::{Deserialize, Serialize};

/// The outcome of applying a split to a population of size N.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitOutcome {
    /// Amount taken into the split buffer
    pub taken: Population,
    /// Amount left in place
    pub left: Population,
}

/// Split variant and parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SplitKind {
    /// T = N with probability p, else 0
    AllOrNothing { p: f64 },
    /// T ~ Binomial(N, q) with q ~ Beta(a, b); `unbiased` mirrors the
    /// parameters (Beta(b, a)) with probability ½
    BetaBinomial { a: f64, b: f64, unbiased: bool },
    /// T ~ Binomial(N, p); `unbiased` mirrors T to N − T with probability ½
    Binomial { p: f64, unbiased: bool },
    /// T ~ Binomial(N, L1/(L1+L2)) where L1 and L2 are read from split
    /// buffer slots i and j (p = ½ when both are empty)
    BinomialFromBuffer { i: usize, j: usize, unbiased: bool },
    /// Pairwise partitioning: u ~ Bin(⌊N/2⌋, r), v ~ Bin(u, p),
    /// T = Bin(N−2u, ½) + 2·Bin(u−v, ½) + v
    Pair { p: f64, r: f64 },
    /// T = ⌊N·f⌋, deterministic
    Take { f: f64 },
    /// T = ⌊N·f + ½⌋, deterministic
    TakeRound { f: f64 },
    /// T = min(max(0, N−u), v−u), deterministic
    Range { u: Population, v: Population },
}

/// A split function: variant plus the virtual flag.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitFunction {
    pub kind: SplitKind,
    /// Virtual splits measure without consuming: L stays N.
    pub is_virtual: bool,
}

impl SplitFunction {
    pub fn new(kind: SplitKind) -> Self {
        Self {
            kind,
            is_virtual: false,
        }
    }

    pub fn new_virtual(kind: SplitKind) -> Self {
        Self {
            kind,
            is_virtual: true,
        }
    }

    /// Apply the split to a population of `n` molecules (or compartments).
    ///
    /// `buffer` is the per-simulation split-result buffer, consulted only
    /// by [`SplitKind::BinomialFromBuffer`].
    pub fn split(&self, n: Population, rng: &mut RngManager, buffer: &[Population]) -> SplitOutcome {
        let taken = match self.kind {
            SplitKind::AllOrNothing { p } => {
                if rng.next_f64() < p {
                    n
                } else {
                    0
                }
            }
            SplitKind::BetaBinomial { a, b, unbiased } => {
                let q = if unbiased && rng.next_f64() < 0.5 {
                    rng.beta(b, a)
                } else {
                    rng.beta(a, b)
                };
                rng.binomial(q, n)
            }
            SplitKind::Binomial { p, unbiased } => {
                let mut t = rng.binomial(p, n);
                if unbiased && rng.next_f64() < 0.5 {
                    t = n - t;
                }
                t
            }
            SplitKind::BinomialFromBuffer { i, j, unbiased } => {
                let l1 = buffer[i];
                let l2 = buffer[j];
                let p = if l1 == 0 && l2 == 0 {
                    0.5
                } else {
                    l1 as f64 / (l1 + l2) as f64
                };
                let mut t = rng.binomial(p, n);
                if unbiased && rng.next_f64() < 0.5 {
                    t = n - t;
                }
                t
            }
            SplitKind::Pair { p, r } => {
                let u = rng.binomial(r, n >> 1);
                let v = rng.binomial(p, u);
                rng.binomial(0.5, n - (u << 1)) + (rng.binomial(0.5, u - v) << 1) + v
            }
            SplitKind::Take { f } => (n as f64 * f).floor() as Population,
            SplitKind::TakeRound { f } => (n as f64 * f + 0.5).floor() as Population,
            SplitKind::Range { u, v } => (n - u).clamp(0, v - u),
        };
        let left = if self.is_virtual { n } else { n - taken };
        SplitOutcome { taken, left }
    }
}
