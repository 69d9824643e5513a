//! Token bucket with two-phase reservations.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// A token bucket holding up to `burst` tokens, refilled at `rate` tokens per second.
///
/// Requests take tokens through a [`Reservation`], which reports how long the
/// caller must wait before the withdrawal is compliant with the rate. The
/// reservation is then either committed or cancelled; cancelling returns the
/// tokens so the reservation leaves no debt on the bucket.
///
/// A rate of zero means no refill at all. The shaping middleware never
/// consults a bucket in that case.
#[derive(Debug)]
pub struct TokenBucket {
    /// Refill rate in tokens per second
    rate: f64,
    /// Maximum number of tokens
    burst: u32,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    /// Tokens available at `last`; negative while reservations are outstanding
    tokens: f64,
    /// When `tokens` was last brought up to date
    last: Instant,
    /// Time to act of the latest reservation, possibly in the future
    last_event: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(rate: f64, burst: u32) -> Self {
        Self::new_at(rate, burst, Instant::now())
    }

    /// Create a full bucket whose clock starts at `now`.
    pub fn new_at(rate: f64, burst: u32, now: Instant) -> Self {
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: f64::from(burst),
                last: now,
                last_event: now,
            }),
        }
    }

    /// Refill rate in tokens per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Bucket capacity.
    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Tokens available at `now`, negative while the bucket is in debt.
    pub fn tokens_at(&self, now: Instant) -> f64 {
        let state = self.state.lock();
        self.advance(&state, now).1
    }

    /// Reserve one token now.
    pub fn reserve(&self) -> Reservation<'_> {
        self.reserve_n(Instant::now(), 1)
    }

    /// Reserve `n` tokens at `now`.
    ///
    /// The reservation is not satisfiable when `n` exceeds the burst, since the
    /// bucket can never hold that many tokens; in that case nothing is taken.
    pub fn reserve_n(&self, now: Instant, n: u32) -> Reservation<'_> {
        let mut state = self.state.lock();

        if n > self.burst {
            return Reservation::rejected(self, now);
        }

        let (now, available) = self.advance(&state, now);
        let tokens = available - f64::from(n);

        let wait = if tokens < 0.0 {
            match self.duration_from_tokens(-tokens) {
                Some(wait) => wait,
                // No refill will ever cover the debt
                None => return Reservation::rejected(self, now),
            }
        } else {
            Duration::ZERO
        };

        let Some(time_to_act) = now.checked_add(wait) else {
            return Reservation::rejected(self, now);
        };
        state.last = now;
        state.tokens = tokens;
        state.last_event = time_to_act;

        Reservation {
            bucket: self,
            ok: true,
            tokens: n,
            time_to_act,
            created_at: now,
        }
    }

    /// Token count brought forward to `now`, capped at the burst.
    fn advance(&self, state: &BucketState, now: Instant) -> (Instant, f64) {
        let last = state.last.min(now);
        let elapsed = now.saturating_duration_since(last);
        let tokens = state.tokens + self.tokens_from_duration(elapsed);
        (now, tokens.min(f64::from(self.burst)))
    }

    fn tokens_from_duration(&self, duration: Duration) -> f64 {
        duration.as_secs_f64() * self.rate
    }

    fn duration_from_tokens(&self, tokens: f64) -> Option<Duration> {
        if self.rate <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(tokens / self.rate).ok()
    }

    fn cancel(&self, reservation: &Reservation<'_>, now: Instant) {
        let mut state = self.state.lock();

        if now > reservation.time_to_act {
            return;
        }

        // Tokens taken by reservations made after this one stay taken
        let later = signed_secs(state.last_event, reservation.time_to_act) * self.rate;
        let restore = f64::from(reservation.tokens) - later;
        if restore <= 0.0 {
            return;
        }

        let (now, tokens) = self.advance(&state, now);
        state.last = now;
        state.tokens = (tokens + restore).min(f64::from(self.burst));

        if reservation.time_to_act == state.last_event {
            if let Some(back) = self.duration_from_tokens(f64::from(reservation.tokens)) {
                if let Some(previous) = reservation.time_to_act.checked_sub(back) {
                    if previous >= now {
                        state.last_event = previous;
                    }
                }
            }
        }
    }
}

/// Seconds from `earlier` to `later`, negative when `later` comes first.
fn signed_secs(later: Instant, earlier: Instant) -> f64 {
    if later >= earlier {
        later.duration_since(earlier).as_secs_f64()
    } else {
        -earlier.duration_since(later).as_secs_f64()
    }
}

/// Tokens withdrawn speculatively from a [`TokenBucket`].
///
/// Finish with [`commit`](Reservation::commit) to keep the tokens or
/// [`cancel`](Reservation::cancel) to hand them back.
#[derive(Debug)]
#[must_use = "a reservation must be committed or cancelled"]
pub struct Reservation<'a> {
    bucket: &'a TokenBucket,
    ok: bool,
    tokens: u32,
    time_to_act: Instant,
    created_at: Instant,
}

impl<'a> Reservation<'a> {
    fn rejected(bucket: &'a TokenBucket, now: Instant) -> Self {
        Self {
            bucket,
            ok: false,
            tokens: 0,
            time_to_act: now,
            created_at: now,
        }
    }

    /// Whether the bucket can ever grant this reservation.
    pub fn is_ok(&self) -> bool {
        self.ok
    }

    /// Wait required from the moment of reservation, zero when not satisfiable.
    pub fn delay(&self) -> Duration {
        self.delay_from(self.created_at)
    }

    /// Wait required from `now` until the reservation becomes compliant.
    pub fn delay_from(&self, now: Instant) -> Duration {
        if !self.ok {
            return Duration::ZERO;
        }
        self.time_to_act.saturating_duration_since(now)
    }

    /// Keep the reserved tokens and return the wait still required.
    pub fn commit(self) -> Duration {
        self.delay_from(Instant::now())
    }

    /// Return the reserved tokens to the bucket.
    pub fn cancel(self) {
        self.cancel_at(Instant::now());
    }

    /// Return the reserved tokens to the bucket as of `now`.
    pub fn cancel_at(self, now: Instant) {
        if !self.ok || self.tokens == 0 {
            return;
        }
        self.bucket.cancel(&self, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-9;

    #[test]
    fn test_new_bucket_is_full() {
        let now = Instant::now();
        let bucket = TokenBucket::new_at(1.0, 5, now);
        assert!((bucket.tokens_at(now) - 5.0).abs() < EPSILON);
    }

    #[test]
    fn test_burst_admitted_without_delay() {
        let now = Instant::now();
        let bucket = TokenBucket::new_at(10.0, 3, now);

        for _ in 0..3 {
            let reservation = bucket.reserve_n(now, 1);
            assert!(reservation.is_ok());
            assert_eq!(reservation.delay(), Duration::ZERO);
            let _ = reservation.commit();
        }

        // The next token arrives 1/rate later
        let reservation = bucket.reserve_n(now, 1);
        assert!(reservation.is_ok());
        assert_eq!(reservation.delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_debt_accumulates() {
        let now = Instant::now();
        let bucket = TokenBucket::new_at(5.0, 1, now);

        assert_eq!(bucket.reserve_n(now, 1).delay(), Duration::ZERO);

        let later = now + Duration::from_millis(50);
        let second = bucket.reserve_n(later, 1);
        assert_eq!(second.delay(), Duration::from_millis(150));

        let third = bucket.reserve_n(later, 1);
        assert_eq!(third.delay(), Duration::from_millis(350));
    }

    #[test]
    fn test_refill_over_time() {
        let now = Instant::now();
        let bucket = TokenBucket::new_at(2.0, 2, now);
        let _ = bucket.reserve_n(now, 2).commit();

        let later = now + Duration::from_millis(500);
        assert!((bucket.tokens_at(later) - 1.0).abs() < EPSILON);

        // Never refills past the burst
        let much_later = now + Duration::from_secs(60);
        assert!((bucket.tokens_at(much_later) - 2.0).abs() < EPSILON);
    }

    #[test]
    fn test_reservation_larger_than_burst_rejected() {
        let now = Instant::now();
        let bucket = TokenBucket::new_at(10.0, 2, now);

        let reservation = bucket.reserve_n(now, 3);
        assert!(!reservation.is_ok());
        assert_eq!(reservation.delay(), Duration::ZERO);
        reservation.cancel_at(now);

        // Nothing was taken
        assert!((bucket.tokens_at(now) - 2.0).abs() < EPSILON);
    }

    #[test]
    fn test_unrepresentable_wait_rejected() {
        let now = Instant::now();
        // The second token is ~10^19 seconds away, past any instant
        let bucket = TokenBucket::new_at(1e-19, 1, now);
        let _ = bucket.reserve_n(now, 1).commit();

        let reservation = bucket.reserve_n(now, 1);
        assert!(!reservation.is_ok());
        assert_eq!(reservation.delay(), Duration::ZERO);
        reservation.cancel_at(now);
        assert!(bucket.tokens_at(now).abs() < EPSILON);
    }

    #[test]
    fn test_cancel_restores_tokens() {
        let now = Instant::now();
        let bucket = TokenBucket::new_at(1.0, 1, now);
        let _ = bucket.reserve_n(now, 1).commit();

        let reservation = bucket.reserve_n(now, 1);
        assert_eq!(reservation.delay(), Duration::from_secs(1));
        reservation.cancel_at(now);

        assert!(bucket.tokens_at(now).abs() < EPSILON);
        let again = bucket.reserve_n(now, 1);
        assert_eq!(again.delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_cancel_keeps_later_reservations() {
        let now = Instant::now();
        let bucket = TokenBucket::new_at(1.0, 1, now);
        let _ = bucket.reserve_n(now, 1).commit();

        let first = bucket.reserve_n(now, 1);
        let second = bucket.reserve_n(now, 1);
        assert_eq!(second.delay(), Duration::from_secs(2));

        // The second reservation depends on the first one's token
        first.cancel_at(now);
        assert!((bucket.tokens_at(now) + 2.0).abs() < EPSILON);
        let _ = second.commit();
    }

    #[test]
    fn test_cancel_after_time_to_act_is_noop() {
        let now = Instant::now();
        let bucket = TokenBucket::new_at(1.0, 1, now);
        let reservation = bucket.reserve_n(now, 1);

        let later = now + Duration::from_millis(10);
        reservation.cancel_at(later);
        assert!((bucket.tokens_at(later) - 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_zero_rate_never_refills() {
        let now = Instant::now();
        let bucket = TokenBucket::new_at(0.0, 1, now);

        assert!(bucket.reserve_n(now, 1).is_ok());
        let reservation = bucket.reserve_n(now + Duration::from_secs(3600), 1);
        assert!(!reservation.is_ok());
    }

    #[test]
    fn test_sub_hertz_rate() {
        let now = Instant::now();
        let bucket = TokenBucket::new_at(0.5, 1, now);
        let _ = bucket.reserve_n(now, 1).commit();

        assert_eq!(bucket.reserve_n(now, 1).delay(), Duration::from_secs(2));
    }
}
