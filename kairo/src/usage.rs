//! Token usage and cost accounting.

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

/// Token usage statistics accumulated across a session's model calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Number of tokens in the input/prompt.
    #[serde(default, alias = "prompt_tokens")]
    pub input_tokens: u64,

    /// Number of tokens in the output/completion.
    #[serde(default, alias = "completion_tokens")]
    pub output_tokens: u64,

    /// Total tokens used (input + output).
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    /// Create a new usage record.
    #[must_use]
    pub const fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    /// Create an empty usage record.
    #[must_use]
    pub const fn zero() -> Self {
        Self {
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
        }
    }
}

impl Add for Usage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
            total_tokens: self.total_tokens + rhs.total_tokens,
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Accumulated monetary cost of a session.
///
/// `total` is monotonically non-decreasing; [`Cost::add`] is the only
/// mutator and rejects negative deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cost {
    /// Total cost accumulated so far.
    pub total: f64,
    /// ISO currency code, e.g. `"USD"`.
    pub currency: String,
}

impl Cost {
    /// Create a zero cost in the given currency.
    #[must_use]
    pub fn zero(currency: impl Into<String>) -> Self {
        Self {
            total: 0.0,
            currency: currency.into(),
        }
    }

    /// Accumulate a non-negative cost delta.
    pub fn add(&mut self, delta: f64) {
        if delta > 0.0 {
            self.total += delta;
        }
    }
}

impl Default for Cost {
    fn default() -> Self {
        Self::zero("USD")
    }
}

/// What to do when a session's accumulated cost crosses its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnExceeded {
    /// Stop scheduling further steps; the session keeps its last status.
    Stop,
    /// Transition the session to `interrupted` (resumable).
    Interrupt,
    /// Keep running.
    Continue,
}

/// A per-session spending limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostLimit {
    /// Maximum total cost before `on_exceeded` applies.
    pub max_total_cost: f64,
    /// Currency the limit is expressed in.
    pub currency: String,
    /// Behavior once the limit is crossed.
    pub on_exceeded: OnExceeded,
}

impl CostLimit {
    /// Whether `cost` has reached or crossed this limit.
    #[must_use]
    pub fn is_exceeded(&self, cost: &Cost) -> bool {
        cost.total >= self.max_total_cost
    }
}
