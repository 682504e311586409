use tokio::sync::watch;

/// Write side of a single-assignment result cell. `resolve` consumes it, so a
/// value can be published at most once.
#[derive(Debug)]
pub(crate) struct Promise<T> {
    tx: watch::Sender<Option<T>>,
}

/// Read side of a `Promise`. Clones observe the same value.
#[derive(Debug, Clone)]
pub(crate) struct Outcome<T> {
    rx: watch::Receiver<Option<T>>,
}

pub(crate) fn promise<T>() -> (Promise<T>, Outcome<T>) {
    let (tx, rx) = watch::channel(None);
    (Promise { tx }, Outcome { rx })
}

impl<T> Promise<T> {
    pub(crate) fn resolve(self, value: T) {
        self.tx.send_replace(Some(value));
    }
}

impl<T: Clone> Outcome<T> {
    /// Waits for the value. `None` means the promise was dropped unresolved.
    pub(crate) async fn wait(&self) -> Option<T> {
        let mut rx = self.rx.clone();
        let resolved = rx.wait_for(Option::is_some).await;
        match resolved {
            Ok(value) => value.clone(),
            Err(_) => None,
        }
    }

    pub(crate) fn peek(&self) -> Option<T> {
        self.rx.borrow().clone()
    }
}
