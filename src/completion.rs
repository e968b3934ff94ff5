use crate::error::TransportError;
use tokio::sync::watch;

/// A complete-exactly-once signal with any number of waiters.
///
/// This is the suspension-point primitive of the transport: "sent", "delivered" and
///  "execution finished" are all modelled as completion signals that callers compose on
///  instead of blocking. Completion fan-out (one datagram's ack completing many packets'
///  signals) is an explicit broadcast - whoever owns the signal calls `complete` or `fail`
///  once, and every handle obtained before or after that observes the same outcome.
pub struct CompletionSignal {
    tx: watch::Sender<Option<Result<(), TransportError>>>,
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionSignal {
    pub fn new() -> CompletionSignal {
        let (tx, _) = watch::channel(None);
        CompletionSignal { tx }
    }

    pub fn handle(&self) -> CompletionHandle {
        CompletionHandle { rx: self.tx.subscribe() }
    }

    /// Marks the signal as successfully completed. A no-op if the signal already has an
    ///  outcome - re-acknowledgement of an already-acknowledged datagram must not flip a
    ///  failure into a success or notify waiters twice.
    pub fn complete(&self) {
        self.tx.send_if_modified(|outcome| {
            if outcome.is_none() {
                *outcome = Some(Ok(()));
                true
            }
            else {
                false
            }
        });
    }

    /// Marks the signal as failed. A no-op if an outcome is already set.
    pub fn fail(&self, error: TransportError) {
        self.tx.send_if_modified(|outcome| {
            if outcome.is_none() {
                *outcome = Some(Err(error));
                true
            }
            else {
                false
            }
        });
    }

    pub fn is_completed(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

/// A waiter on a [CompletionSignal]. Cheap to clone; `wait` can be called at any time,
///  including after the outcome is already set.
#[derive(Clone)]
pub struct CompletionHandle {
    rx: watch::Receiver<Option<Result<(), TransportError>>>,
}

impl CompletionHandle {
    pub async fn wait(&mut self) -> Result<(), TransportError> {
        loop {
            if let Some(outcome) = self.rx.borrow().clone() {
                return outcome;
            }
            if self.rx.changed().await.is_err() {
                // the signal was dropped without an outcome - its owner went away
                return Err(TransportError::ConnectionClosed);
            }
        }
    }

    pub fn outcome(&self) -> Option<Result<(), TransportError>> {
        self.rx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::runtime::Builder;

    #[test]
    fn test_complete_notifies_all_waiters() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let signal = Arc::new(CompletionSignal::new());
            let mut early = signal.handle();

            let waiter = {
                let mut handle = signal.handle();
                tokio::spawn(async move { handle.wait().await })
            };

            signal.complete();

            assert_eq!(early.wait().await, Ok(()));
            assert_eq!(waiter.await.unwrap(), Ok(()));

            // a handle taken after completion sees the outcome as well
            assert_eq!(signal.handle().wait().await, Ok(()));
        });
    }

    #[test]
    fn test_fail_is_sticky() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let signal = CompletionSignal::new();
            signal.fail(TransportError::ConnectionClosed);
            signal.complete();

            assert_eq!(signal.handle().wait().await, Err(TransportError::ConnectionClosed));
            assert!(signal.is_completed());
        });
    }

    #[test]
    fn test_dropped_signal_fails_waiters() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let signal = CompletionSignal::new();
            let mut handle = signal.handle();
            drop(signal);

            assert_eq!(handle.wait().await, Err(TransportError::ConnectionClosed));
        });
    }
}
