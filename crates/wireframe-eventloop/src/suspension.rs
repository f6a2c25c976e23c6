use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

/// Outcome of a suspended coroutine resuming.
#[derive(Debug)]
pub enum Resumption<T> {
    /// Resumed normally with a value handed to it.
    Value(T),
    /// Resumed via a thrown error instead of a value.
    Thrown(wireframe_core::error::CoreError),
}

/// A single-use suspend point for the coroutine backend: a coroutine calls
/// [`Suspension::await`] (as a future) to park itself, and some other part
/// of the system later calls [`Resume::resume`] or [`Resume::throw`] on the
/// matching handle to wake it back up with a value or an error.
///
/// Mirrors the fiber yield/resume primitive a libco-style coroutine
/// scheduler exposes, built here on a oneshot channel since the backend
/// itself runs atop `tokio::task::LocalSet`.
pub struct Suspension<T> {
    rx: oneshot::Receiver<Resumption<T>>,
}

/// The other half of a [`Suspension`]; held by whichever code will resume
/// the coroutine later.
pub struct Resume<T> {
    tx: oneshot::Sender<Resumption<T>>,
}

/// Creates a linked suspend/resume pair.
pub fn suspend<T>() -> (Suspension<T>, Resume<T>) {
    let (tx, rx) = oneshot::channel();
    (Suspension { rx }, Resume { tx })
}

impl<T> Resume<T> {
    /// Wakes the coroutine with a value. A no-op if the coroutine has
    /// already been dropped (e.g. the connection it belonged to closed).
    pub fn resume(self, value: T) {
        let _ = self.tx.send(Resumption::Value(value));
    }

    /// Wakes the coroutine by throwing an error into it, matching the
    /// `throw()` half of a generator-based coroutine contract.
    pub fn throw(self, err: wireframe_core::error::CoreError) {
        let _ = self.tx.send(Resumption::Thrown(err));
    }
}

impl<T> Future for Suspension<T> {
    type Output = Resumption<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(resumption)) => Poll::Ready(resumption),
            Poll::Ready(Err(_)) => Poll::Ready(Resumption::Thrown(
                wireframe_core::error::CoreError::new(
                    wireframe_core::error::ErrorKind::Uncaught,
                    "suspension dropped without being resumed",
                ),
            )),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resume_delivers_value() {
        let (susp, resume) = suspend::<u32>();
        resume.resume(42);
        match susp.await {
            Resumption::Value(v) => assert_eq!(v, 42),
            Resumption::Thrown(_) => panic!("expected value"),
        }
    }

    #[tokio::test]
    async fn throw_delivers_error() {
        let (susp, resume) = suspend::<u32>();
        resume.throw(wireframe_core::error::CoreError::new(
            wireframe_core::error::ErrorKind::ProtocolError,
            "bad frame",
        ));
        match susp.await {
            Resumption::Thrown(err) => assert_eq!(err.kind(), wireframe_core::error::ErrorKind::ProtocolError),
            Resumption::Value(_) => panic!("expected thrown"),
        }
    }

    #[tokio::test]
    async fn dropped_resume_surfaces_as_thrown() {
        let (susp, resume) = suspend::<u32>();
        drop(resume);
        match susp.await {
            Resumption::Thrown(_) => {}
            Resumption::Value(_) => panic!("expected thrown"),
        }
    }
}
