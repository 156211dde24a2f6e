//! The `when_any` combinator.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Result of [`when_any`]: which input finished first, with its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Either<A, B> {
    Left(A),
    Right(B),
}

/// Future returned by [`when_any`].
#[derive(Debug)]
pub struct WhenAny<A, B> {
    a: A,
    b: B,
}

/// Races two futures and yields the result of whichever completes
/// first. The loser is dropped with the returned future; a dropped
/// in-flight kernel op marks its submission ignored, so the losing
/// completion is discarded without resuming anyone.
///
/// When both inputs are ready in the same loop iteration (both CQEs
/// extracted in one batch) the left input wins the tie, matching the
/// kernel's completion order for a linked pair. A caller racing an op
/// against a timer therefore must not conclude from a `Right` that the
/// op never ran; it may simply have lost the race.
pub fn when_any<A, B>(a: A, b: B) -> WhenAny<A, B>
where
    A: Future,
    B: Future,
{
    WhenAny { a, b }
}

impl<A, B> Future for WhenAny<A, B>
where
    A: Future,
    B: Future,
{
    type Output = Either<A::Output, B::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: `a` and `b` are never moved out of `self`; the
        // projections below are the only access.
        let this = unsafe { self.get_unchecked_mut() };
        let a = unsafe { Pin::new_unchecked(&mut this.a) };
        if let Poll::Ready(value) = a.poll(cx) {
            return Poll::Ready(Either::Left(value));
        }
        let b = unsafe { Pin::new_unchecked(&mut this.b) };
        if let Poll::Ready(value) = b.poll(cx) {
            return Poll::Ready(Either::Right(value));
        }
        Poll::Pending
    }
}
