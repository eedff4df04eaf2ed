//! Per-connection traffic limiting.
//!
//! A limiter hands out short-lived byte reservations before each read step.
//! The reservation is released once the read completes: an errored read
//! refunds the whole reservation, a successful one charges the bytes that
//! actually crossed the socket and refunds the remainder. This keeps the
//! accounted totals exactly equal to the bytes moved.
//!
//! The limiter is shared between the two directions of one connection and is
//! never shared across connections.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Direction of travel for traffic accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficDirection {
    /// Bytes read from the client socket.
    FromUser,
    /// Bytes read from the target socket.
    FromTarget,
}

impl TrafficDirection {
    fn index(self) -> usize {
        match self {
            TrafficDirection::FromUser => 0,
            TrafficDirection::FromTarget => 1,
        }
    }
}

impl fmt::Display for TrafficDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrafficDirection::FromUser => write!(f, "from-user"),
            TrafficDirection::FromTarget => write!(f, "from-target"),
        }
    }
}

/// A byte budget reserved for one read step.
///
/// Must be released with the read's outcome so unused budget flows back to
/// the limiter.
#[must_use = "a reservation must be released with the I/O outcome"]
#[derive(Debug)]
pub struct Reservation {
    capacity: usize,
}

impl Reservation {
    /// A reservation granting `capacity` bytes. Limiter implementations call
    /// this from [`TrafficLimiter::reserve_read_portion`].
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }

    /// Bytes the holder may read on this step. May be zero (throttled).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Finalize against the limiter. An errored read is refunded in full;
    /// a successful one charges the actual byte count and refunds the rest.
    pub fn release(
        self,
        limiter: &dyn TrafficLimiter,
        direction: TrafficDirection,
        outcome: &io::Result<usize>,
    ) {
        let consumed = match outcome {
            Ok(bytes) => (*bytes).min(self.capacity),
            Err(_) => 0,
        };
        limiter.finalize(direction, self.capacity, consumed);
    }
}

/// Byte-budget accountant for one connection.
pub trait TrafficLimiter: Send + Sync {
    /// Reserve up to `desired` bytes of quota for `direction`.
    /// A capacity of zero means the direction is throttled until the next
    /// timer tick.
    fn reserve_read_portion(&self, direction: TrafficDirection, desired: usize) -> Reservation;

    /// Charge `consumed` bytes out of a `reserved` budget and return the
    /// remainder to the pool. Invoked through [`Reservation::release`].
    fn finalize(&self, direction: TrafficDirection, reserved: usize, consumed: usize);

    /// Replenish per-tick budgets. Invoked on each timer tick of the owning
    /// connection.
    fn refill(&self);

    /// Total bytes charged so far for `direction`.
    fn consumed(&self, direction: TrafficDirection) -> u64;
}

/// Limiter that always grants the full requested budget.
///
/// Used when no rate is configured; byte totals are still accounted.
#[derive(Debug, Default)]
pub struct UnboundedLimiter {
    charged: [AtomicU64; 2],
}

impl UnboundedLimiter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrafficLimiter for UnboundedLimiter {
    fn reserve_read_portion(&self, _direction: TrafficDirection, desired: usize) -> Reservation {
        Reservation::new(desired)
    }

    fn finalize(&self, direction: TrafficDirection, _reserved: usize, consumed: usize) {
        self.charged[direction.index()].fetch_add(consumed as u64, Ordering::Relaxed);
    }

    fn refill(&self) {}

    fn consumed(&self, direction: TrafficDirection) -> u64 {
        self.charged[direction.index()].load(Ordering::Relaxed)
    }
}

/// Limiter granting a fixed byte budget per direction per timer tick.
///
/// [`refill`](TrafficLimiter::refill) resets the available budget to the
/// configured quota, so refunds never accumulate beyond one tick's worth.
#[derive(Debug)]
pub struct RateLimiter {
    quota_per_tick: usize,
    available: [AtomicUsize; 2],
    charged: [AtomicU64; 2],
}

impl RateLimiter {
    pub fn new(quota_per_tick: usize) -> Self {
        Self {
            quota_per_tick,
            available: [
                AtomicUsize::new(quota_per_tick),
                AtomicUsize::new(quota_per_tick),
            ],
            charged: [AtomicU64::new(0), AtomicU64::new(0)],
        }
    }
}

impl TrafficLimiter for RateLimiter {
    fn reserve_read_portion(&self, direction: TrafficDirection, desired: usize) -> Reservation {
        let available = &self.available[direction.index()];
        let mut current = available.load(Ordering::Acquire);
        loop {
            let granted = desired.min(current);
            match available.compare_exchange_weak(
                current,
                current - granted,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Reservation::new(granted),
                Err(observed) => current = observed,
            }
        }
    }

    fn finalize(&self, direction: TrafficDirection, reserved: usize, consumed: usize) {
        let unused = reserved - consumed;
        if unused > 0 {
            self.available[direction.index()].fetch_add(unused, Ordering::AcqRel);
        }
        if consumed > 0 {
            self.charged[direction.index()].fetch_add(consumed as u64, Ordering::Relaxed);
        }
    }

    fn refill(&self) {
        for available in &self.available {
            available.store(self.quota_per_tick, Ordering::Release);
        }
    }

    fn consumed(&self, direction: TrafficDirection) -> u64 {
        self.charged[direction.index()].load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // UnboundedLimiter Tests
    // ========================================================================

    #[test]
    fn test_unbounded_grants_full_request() {
        let limiter = UnboundedLimiter::new();
        let reservation = limiter.reserve_read_portion(TrafficDirection::FromUser, 4096);
        assert_eq!(reservation.capacity(), 4096);
        reservation.release(&limiter, TrafficDirection::FromUser, &Ok(4096));
    }

    #[test]
    fn test_unbounded_charges_consumed_bytes() {
        let limiter = UnboundedLimiter::new();
        let reservation = limiter.reserve_read_portion(TrafficDirection::FromUser, 4096);
        reservation.release(&limiter, TrafficDirection::FromUser, &Ok(100));
        assert_eq!(limiter.consumed(TrafficDirection::FromUser), 100);
        assert_eq!(limiter.consumed(TrafficDirection::FromTarget), 0);
    }

    #[test]
    fn test_unbounded_error_charges_nothing() {
        let limiter = UnboundedLimiter::new();
        let reservation = limiter.reserve_read_portion(TrafficDirection::FromTarget, 4096);
        let failed: io::Result<usize> =
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        reservation.release(&limiter, TrafficDirection::FromTarget, &failed);
        assert_eq!(limiter.consumed(TrafficDirection::FromTarget), 0);
    }

    // ========================================================================
    // RateLimiter Tests
    // ========================================================================

    #[test]
    fn test_rate_limiter_caps_reservation_at_quota() {
        let limiter = RateLimiter::new(16);
        let reservation = limiter.reserve_read_portion(TrafficDirection::FromUser, 4096);
        assert_eq!(reservation.capacity(), 16);
        reservation.release(&limiter, TrafficDirection::FromUser, &Ok(16));
    }

    #[test]
    fn test_rate_limiter_exhausted_returns_zero() {
        let limiter = RateLimiter::new(16);
        let first = limiter.reserve_read_portion(TrafficDirection::FromUser, 16);
        assert_eq!(first.capacity(), 16);

        // Budget spent; second reservation in the same tick gets nothing.
        let second = limiter.reserve_read_portion(TrafficDirection::FromUser, 16);
        assert_eq!(second.capacity(), 0);

        first.release(&limiter, TrafficDirection::FromUser, &Ok(16));
        second.release(&limiter, TrafficDirection::FromUser, &Ok(0));
    }

    #[test]
    fn test_rate_limiter_directions_are_independent() {
        let limiter = RateLimiter::new(16);
        let user = limiter.reserve_read_portion(TrafficDirection::FromUser, 16);
        let target = limiter.reserve_read_portion(TrafficDirection::FromTarget, 16);
        assert_eq!(user.capacity(), 16);
        assert_eq!(target.capacity(), 16);
        user.release(&limiter, TrafficDirection::FromUser, &Ok(16));
        target.release(&limiter, TrafficDirection::FromTarget, &Ok(16));
    }

    #[test]
    fn test_rate_limiter_refunds_unused_budget() {
        let limiter = RateLimiter::new(100);
        let reservation = limiter.reserve_read_portion(TrafficDirection::FromUser, 100);
        // Only 30 of the 100 reserved bytes arrived.
        reservation.release(&limiter, TrafficDirection::FromUser, &Ok(30));

        let next = limiter.reserve_read_portion(TrafficDirection::FromUser, 100);
        assert_eq!(next.capacity(), 70);
        next.release(&limiter, TrafficDirection::FromUser, &Ok(0));
        assert_eq!(limiter.consumed(TrafficDirection::FromUser), 30);
    }

    #[test]
    fn test_rate_limiter_error_refunds_everything() {
        let limiter = RateLimiter::new(100);
        let reservation = limiter.reserve_read_portion(TrafficDirection::FromUser, 100);
        let failed: io::Result<usize> = Err(io::Error::new(io::ErrorKind::Other, "boom"));
        reservation.release(&limiter, TrafficDirection::FromUser, &failed);

        let next = limiter.reserve_read_portion(TrafficDirection::FromUser, 100);
        assert_eq!(next.capacity(), 100);
        next.release(&limiter, TrafficDirection::FromUser, &Ok(0));
        assert_eq!(limiter.consumed(TrafficDirection::FromUser), 0);
    }

    #[test]
    fn test_rate_limiter_refill_restores_quota() {
        let limiter = RateLimiter::new(16);
        let reservation = limiter.reserve_read_portion(TrafficDirection::FromUser, 16);
        reservation.release(&limiter, TrafficDirection::FromUser, &Ok(16));
        assert_eq!(
            limiter
                .reserve_read_portion(TrafficDirection::FromUser, 16)
                .capacity(),
            0
        );

        limiter.refill();
        let refreshed = limiter.reserve_read_portion(TrafficDirection::FromUser, 16);
        assert_eq!(refreshed.capacity(), 16);
        refreshed.release(&limiter, TrafficDirection::FromUser, &Ok(0));
    }

    #[test]
    fn test_rate_limiter_refill_discards_carried_budget() {
        let limiter = RateLimiter::new(16);
        // Nothing spent this tick; refill must not stack budgets.
        limiter.refill();
        limiter.refill();
        let reservation = limiter.reserve_read_portion(TrafficDirection::FromUser, 1000);
        assert_eq!(reservation.capacity(), 16);
        reservation.release(&limiter, TrafficDirection::FromUser, &Ok(0));
    }

    // ========================================================================
    // Display Tests
    // ========================================================================

    #[test]
    fn test_traffic_direction_display() {
        assert_eq!(TrafficDirection::FromUser.to_string(), "from-user");
        assert_eq!(TrafficDirection::FromTarget.to_string(), "from-target");
    }
}
