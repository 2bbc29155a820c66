//! Retry logic with configurable backoff policies for pipeline node execution.

use std::time::Duration;

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone)]
pub enum BackoffPolicy {
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Exponential backoff: `initial_delay * factor^attempt`, capped at
    /// `max_delay`, optionally randomized by a uniform `[0.5, 1.5)` jitter.
    Exponential {
        initial_delay: Duration,
        max_delay: Duration,
        factor: f64,
        jitter: bool,
    },
    /// No delay between retries.
    None,
}

impl BackoffPolicy {
    /// Compute the delay for a given attempt number (0-indexed: the attempt
    /// that just failed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::Fixed(d) => *d,
            BackoffPolicy::Exponential {
                initial_delay,
                max_delay,
                factor,
                jitter,
            } => {
                let scaled = initial_delay.as_secs_f64() * factor.powi(attempt as i32);
                let capped = scaled.min(max_delay.as_secs_f64());
                let final_secs = if *jitter {
                    let mult = rand::Rng::gen_range(&mut rand::thread_rng(), 0.5..1.5);
                    capped * mult
                } else {
                    capped
                };
                Duration::from_secs_f64(final_secs.max(0.0))
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            factor: 2.0,
            jitter: true,
        }
    }
}

/// Execute a handler with retry logic.
///
/// The closure `f` is called up to `max_retries + 1` times. A retry happens
/// only when the outcome's status is `FAIL`; handler-level errors are fatal
/// and propagate immediately — handlers report failure truthfully via
/// `Outcome`, they don't throw across the engine boundary.
pub async fn execute_with_retry<F, Fut>(
    f: F,
    max_retries: usize,
    policy: &BackoffPolicy,
    node_id: &str,
) -> attractor_types::Result<attractor_types::Outcome>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = attractor_types::Result<attractor_types::Outcome>>,
{
    for attempt in 0..=max_retries {
        let outcome = f().await?;
        if outcome.status == attractor_types::StageStatus::Fail && attempt < max_retries {
            let delay = policy.delay_for_attempt(attempt);
            tracing::info!(node = %node_id, attempt, delay_ms = %delay.as_millis(), "Retrying");
            tokio::time::sleep(delay).await;
            continue;
        }
        return Ok(outcome);
    }
    unreachable!("loop always returns on its last iteration")
}
