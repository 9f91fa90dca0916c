use std::future::pending;
use tokio::sync::watch;

/// Operator-initiated stop. Cloneable; every clone observes the same signal.
#[derive(Clone, Debug)]
pub struct CancelSignal {
  rx: watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct CancelHandle {
  tx: watch::Sender<bool>,
}

impl CancelHandle {
  pub fn cancel(&self) {
    // Errors only if every signal has been dropped, in which case there is nobody to tell.
    let _ = self.tx.send(true);
  }
}

impl CancelSignal {
  pub fn new() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
  }

  /// A signal that never fires.
  pub fn never() -> CancelSignal {
    let (_, signal) = CancelSignal::new();
    signal
  }

  pub fn is_cancelled(&self) -> bool {
    *self.rx.borrow()
  }

  /// Resolves once cancelled. Never resolves if the handle was dropped without cancelling.
  pub async fn cancelled(&mut self) {
    loop {
      if *self.rx.borrow_and_update() {
        return;
      }
      if self.rx.changed().await.is_err() {
        pending::<()>().await;
      }
    }
  }
}
