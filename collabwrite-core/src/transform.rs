//! Operational transform for concurrent deltas.
//!
//! Given `a` and `b` computed against the same document `S`:
//!
//! ```text
//!            S
//!       a  ╱   ╲  b
//!         ╱     ╲
//!      S·a       S·b
//!         ╲     ╱
//!      b'  ╲   ╱  a'
//!         S·a·b' == S·b·a'
//! ```
//!
//! ## Tie-breaking
//!
//! Two inserts at the same offset are the one place where replicas could
//! silently diverge. The insert whose origin `ClientId` sorts lower is
//! placed first. The same side wins when both operations set the same
//! formatting attribute on the same characters. For `transform(a, b)` with
//! equal origins `b` goes first; a single client never produces concurrent
//! operations, so the case only arises for hand-built inputs.

use crate::delta::{transform_attributes, Component, Cursor, Delta, OtError};
use crate::operation::Operation;

/// Transform two concurrent operations.
///
/// Returns `(a', b')` where `a'` applies after `b` and `b'` applies after
/// `a`. Their `revision` fields are advanced past the other operation.
pub fn transform(a: &Operation, b: &Operation) -> Result<(Operation, Operation), OtError> {
    let a_first = a.has_priority_over(b);
    let (a_delta, b_delta) = transform_deltas(&a.delta, &b.delta, a_first)?;

    let a_prime = Operation {
        client_id: a.client_id.clone(),
        seq: a.seq,
        revision: b.revision + 1,
        delta: a_delta,
    };
    let b_prime = Operation {
        client_id: b.client_id.clone(),
        seq: b.seq,
        revision: a.revision + 1,
        delta: b_delta,
    };
    Ok((a_prime, b_prime))
}

/// Transform two deltas over the same base document.
///
/// `a_first` decides insert ties and attribute conflicts in favour of `a`.
pub fn transform_deltas(a: &Delta, b: &Delta, a_first: bool) -> Result<(Delta, Delta), OtError> {
    if a.base_len() != b.base_len() {
        return Err(OtError::TransformLength {
            left: a.base_len(),
            right: b.base_len(),
        });
    }

    let mut a_iter = Cursor::new(a.components());
    let mut b_iter = Cursor::new(b.components());
    let mut a_prime = Delta::new();
    let mut b_prime = Delta::new();

    loop {
        match (a_iter.peek(), b_iter.peek()) {
            (None, None) => break,

            (Some(Component::Insert { .. }), other)
                if a_first || !other.is_some_and(Component::is_insert) =>
            {
                if let Some(insert) = a_iter.next(usize::MAX) {
                    b_prime.push(Component::retain(insert.len()));
                    a_prime.push(insert);
                }
            }

            (_, Some(Component::Insert { .. })) => {
                if let Some(insert) = b_iter.next(usize::MAX) {
                    a_prime.push(Component::retain(insert.len()));
                    b_prime.push(insert);
                }
            }

            (Some(_), Some(_)) => {
                let len = a_iter.peek_len().min(b_iter.peek_len());
                match (a_iter.next(len), b_iter.next(len)) {
                    (
                        Some(Component::Retain { attributes: x, .. }),
                        Some(Component::Retain { attributes: y, .. }),
                    ) => {
                        a_prime.push(Component::Retain {
                            len,
                            attributes: transform_attributes(&y, &x, !a_first),
                        });
                        b_prime.push(Component::Retain {
                            len,
                            attributes: transform_attributes(&x, &y, a_first),
                        });
                    }
                    // b already removed these characters.
                    (Some(Component::Retain { .. }), Some(Component::Delete(_))) => {
                        b_prime.push(Component::Delete(len));
                    }
                    (Some(Component::Delete(_)), Some(Component::Retain { .. })) => {
                        a_prime.push(Component::Delete(len));
                    }
                    // Both deleted the same characters.
                    (Some(Component::Delete(_)), Some(Component::Delete(_))) => {}
                    _ => {
                        return Err(OtError::TransformLength {
                            left: a.base_len(),
                            right: b.base_len(),
                        })
                    }
                }
            }

            // One side ran out early; cannot happen when base lengths agree.
            _ => {
                return Err(OtError::TransformLength {
                    left: a.base_len(),
                    right: b.base_len(),
                })
            }
        }
    }

    Ok((a_prime, b_prime))
}
