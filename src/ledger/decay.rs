//! The leaky-bucket decay law, kept pure so it can be tested without a
//! clock or a lock.

/// Drain `consumed` by `elapsed * rate`, flooring at zero. Negative elapsed
/// time (a clock jump) drains nothing; a jump must never grant restitution.
pub fn decay(consumed: f64, elapsed: f64, rate: f64) -> f64 {
    if elapsed <= 0.0 {
        return consumed;
    }
    let reduction = elapsed * rate;
    if reduction > consumed {
        0.0
    } else {
        consumed - reduction
    }
}

/// Seconds a charger must wait before `consumed` drains back under `limit`.
/// Zero when already under quota. Callers guarantee `limit > 0`.
pub fn drain_seconds(consumed: f64, limit: f64) -> f64 {
    if consumed <= limit {
        0.0
    } else {
        (consumed - limit) / limit
    }
}
