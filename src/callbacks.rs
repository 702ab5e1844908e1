//! Callback fanout (C1).
//!
//! A notifier that N handlers can subscribe to. Invocation calls each
//! handler in registration order and, by default, swallows and logs any
//! handler failure so that one bad subscriber cannot break the chain for
//! the rest. An optional strict mode re-raises on the first failure
//! instead.
//!
//! Handlers here are async: subscribers in this crate (channels
//! formatting an incoming entry, then writing it out over the wire) need
//! to `.await`, unlike the original's synchronous callback list.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Result;

type BoxFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// A subscriber: takes the dispatched value by reference and returns a
/// future resolving to success or failure. Boxed so the fanout list can
/// hold a heterogeneous set of closures/methods.
pub trait Callback<T: ?Sized>: Send + Sync {
    fn call<'a>(&'a self, value: &'a T) -> BoxFuture<'a>;
}

impl<T, F, Fut> Callback<T> for F
where
    T: ?Sized,
    F: Fn(&T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    fn call<'a>(&'a self, value: &'a T) -> BoxFuture<'a> {
        Box::pin(self(value))
    }
}

/// An ordered list of subscribers, invoked in registration order.
///
/// No reentrancy protection: a handler must not add new subscribers
/// while dispatch is in progress (the spec explicitly leaves this
/// unguarded, matching the original's plain Python list iteration).
pub struct CallbackList<T: ?Sized> {
    subscribers: Vec<Arc<dyn Callback<T>>>,
    strict: bool,
}

impl<T: ?Sized> Default for CallbackList<T> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
            strict: false,
        }
    }
}

impl<T: ?Sized + 'static> CallbackList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-raise the first handler failure instead of swallowing it.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn add_callback(&mut self, cb: impl Callback<T> + 'static) {
        self.subscribers.push(Arc::new(cb));
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Invoke every subscriber in registration order, passing `value` by
    /// reference. In non-strict mode (the default), a failing handler is
    /// logged and dispatch continues to the remaining subscribers. In
    /// strict mode, the first failure short-circuits and is returned.
    pub async fn dispatch(&self, value: &T) -> Result<()> {
        for cb in &self.subscribers {
            match cb.call(value).await {
                Ok(()) => {}
                Err(e) if self.strict => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, "callback subscriber failed, continuing");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn dispatch_calls_subscribers_in_registration_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::<i32>::new()));
        let mut list: CallbackList<i32> = CallbackList::new();

        let o1 = order.clone();
        list.add_callback(move |v: &i32| {
            let o1 = o1.clone();
            let v = *v;
            async move {
                o1.lock().push(v * 10 + 1);
                Ok(())
            }
        });
        let o2 = order.clone();
        list.add_callback(move |v: &i32| {
            let o2 = o2.clone();
            let v = *v;
            async move {
                o2.lock().push(v * 10 + 2);
                Ok(())
            }
        });

        list.dispatch(&7).await.unwrap();
        assert_eq!(*order.lock(), vec![71, 72]);
    }

    #[tokio::test]
    async fn non_strict_mode_swallows_failures_and_continues() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut list: CallbackList<()> = CallbackList::new();

        list.add_callback(|_: &()| async { Err(crate::error::GatewayError::Internal("boom".into())) });
        let c = calls.clone();
        list.add_callback(move |_: &()| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        list.dispatch(&()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn strict_mode_returns_first_failure() {
        let mut list: CallbackList<()> = CallbackList::new().strict();
        list.add_callback(|_: &()| async { Err(crate::error::GatewayError::Internal("boom".into())) });
        let result = list.dispatch(&()).await;
        assert!(result.is_err());
    }
}
