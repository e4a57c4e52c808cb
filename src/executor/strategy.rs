use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why one strategy did not produce a result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyFailure {
    /// Precondition not met (binary missing, no flake.nix). The next strategy is tried.
    Unavailable(String),
    /// Ran and failed. Ends the chain.
    Failed(String),
    /// Ran out of time. Ends the chain.
    TimedOut(String),
}

impl StrategyFailure {
    pub fn message(&self) -> &str {
        match self {
            StrategyFailure::Unavailable(m) | StrategyFailure::Failed(m) | StrategyFailure::TimedOut(m) => m,
        }
    }
}

impl fmt::Display for StrategyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyFailure::Unavailable(m) => write!(f, "unavailable: {}", m),
            StrategyFailure::Failed(m) => write!(f, "failed: {}", m),
            StrategyFailure::TimedOut(m) => write!(f, "timed out: {}", m),
        }
    }
}

/// Record of one strategy invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyAttempt {
    pub strategy: String,
    pub failure: Option<StrategyFailure>,
}

#[derive(Debug)]
pub struct StrategyOutcome<T> {
    pub result: std::result::Result<T, StrategyFailure>,
    pub attempts: Vec<StrategyAttempt>,
}

/// One way of performing an operation against context `C`
#[async_trait]
pub trait Strategy<C: ?Sized + Sync, T: Send>: Send + Sync {
    fn name(&self) -> &str;

    async fn attempt(&self, ctx: &C) -> std::result::Result<T, StrategyFailure>;
}

/// Ordered fallbacks for one operation. Moves on only when a strategy is
/// unavailable; a real failure or timeout is final.
pub struct StrategyChain<C: ?Sized + Sync, T: Send> {
    operation: String,
    strategies: Vec<Box<dyn Strategy<C, T>>>,
}

impl<C: ?Sized + Sync, T: Send> StrategyChain<C, T> {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            strategies: Vec::new(),
        }
    }

    pub fn with(mut self, strategy: Box<dyn Strategy<C, T>>) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub async fn run(&self, ctx: &C) -> StrategyOutcome<T> {
        let mut attempts = Vec::new();
        let mut last = StrategyFailure::Unavailable(format!("no strategy for {}", self.operation));

        for strategy in &self.strategies {
            tracing::debug!(operation = %self.operation, strategy = strategy.name(), "trying strategy");
            match strategy.attempt(ctx).await {
                Ok(value) => {
                    attempts.push(StrategyAttempt {
                        strategy: strategy.name().to_string(),
                        failure: None,
                    });
                    return StrategyOutcome {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(failure) => {
                    tracing::info!(
                        operation = %self.operation,
                        strategy = strategy.name(),
                        failure = %failure,
                        "strategy did not succeed"
                    );
                    attempts.push(StrategyAttempt {
                        strategy: strategy.name().to_string(),
                        failure: Some(failure.clone()),
                    });
                    let fall_through = matches!(failure, StrategyFailure::Unavailable(_));
                    last = failure;
                    if !fall_through {
                        break;
                    }
                }
            }
        }

        StrategyOutcome {
            result: Err(last),
            attempts,
        }
    }
}
