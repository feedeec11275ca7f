use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Phase one: every reservation with `start > span.start - window` and
/// `end < span.end + window`.
///
/// As long as no stored reservation is longer than `window`, this is a
/// superset of the true collisions. Reservations are sorted by start, so the
/// lower bound is a binary search and the scan stops once starts pass the
/// upper bound.
pub(crate) fn may_collide_with<'a>(
    rs: &'a ResourceState,
    span: Span,
    window: Ms,
) -> impl Iterator<Item = &'a Reservation> {
    let lower = span.start.saturating_sub(window);
    let upper = span.end.saturating_add(window);
    let first = rs.reservations.partition_point(|r| r.span.start <= lower);
    rs.reservations[first..]
        .iter()
        .take_while(move |r| r.span.start < upper)
        .filter(move |r| r.span.end < upper)
}

/// Phase two: the exact half-open overlap test over the pruned window.
/// `exclude` skips the reservation being updated.
pub(crate) fn collide_with<'a>(
    rs: &'a ResourceState,
    span: Span,
    exclude: Option<Ulid>,
    window: Ms,
) -> impl Iterator<Item = &'a Reservation> {
    may_collide_with(rs, span, window)
        .filter(move |r| Some(r.id) != exclude && span.overlaps(&r.span))
}

/// Fails with the first collision in `(start, end, name)` order.
pub(crate) fn check_no_collision(
    rs: &ResourceState,
    span: &Span,
    exclude: Option<Ulid>,
    window: Ms,
) -> Result<(), EngineError> {
    match collide_with(rs, *span, exclude, window).next() {
        Some(other) => {
            metrics::counter!(crate::observability::COLLISIONS_TOTAL).increment(1);
            tracing::debug!(
                "collision on resource {}: {} vs reservation {}",
                rs.id,
                span.display(),
                other.id
            );
            Err(EngineError::Collision(Box::new(ReservationInfo::redacted(other))))
        }
        None => Ok(()),
    }
}
