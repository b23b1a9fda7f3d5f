use std::fmt;
use std::num::NonZeroU32;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio_util::sync::CancellationToken;

use crate::error::TtlJobError;

/// Token bucket shared by every worker of a job, bounding the aggregate
/// number of rows deleted per second.
///
/// The bucket holds one second worth of tokens. A limit of 0 disables
/// throttling.
pub struct DeleteRateLimiter {
    limiter: Option<DefaultDirectRateLimiter>,
    burst: NonZeroU32,
}

impl fmt::Debug for DeleteRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.limiter {
            Some(_) => write!(f, "DeleteRateLimiter({} rows/s)", self.burst),
            None => write!(f, "DeleteRateLimiter(unlimited)"),
        }
    }
}

impl DeleteRateLimiter {
    pub fn new(rows_per_second: u64) -> Self {
        let rate = u32::try_from(rows_per_second).unwrap_or(u32::MAX);
        match NonZeroU32::new(rate) {
            Some(burst) => Self {
                limiter: Some(RateLimiter::direct(Quota::per_second(burst))),
                burst,
            },
            None => Self::unlimited(),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            limiter: None,
            burst: NonZeroU32::MAX,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.limiter.is_none()
    }

    /// Waits until `rows` tokens are available, or the job is cancelled.
    ///
    /// Requests larger than the bucket are served in bucket-sized chunks.
    pub async fn acquire(&self, rows: usize, cancel: &CancellationToken) -> Result<(), TtlJobError> {
        if cancel.is_cancelled() {
            return Err(TtlJobError::Cancelled);
        }
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };

        let mut remaining = u64::try_from(rows).unwrap_or(u64::MAX);
        while remaining > 0 {
            let chunk = remaining.min(u64::from(self.burst.get()));
            remaining -= chunk;
            let Some(chunk) = u32::try_from(chunk).ok().and_then(NonZeroU32::new) else {
                break;
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(TtlJobError::Cancelled),
                ready = limiter.until_n_ready(chunk) => {
                    ready.map_err(|err| TtlJobError::InvalidSettings(err.to_string()))?;
                }
            }
        }
        Ok(())
    }
}
