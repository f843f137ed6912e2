use tokio::sync::watch;

/// Live view of one store document.
///
/// Pull with [`Subscription::poll_update`], push with
/// [`Subscription::changed`]. Dropping the handle or calling
/// [`Subscription::cancel`] stops delivery.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: Option<watch::Receiver<T>>,
}

impl<T: Clone> Subscription<T> {
    pub(crate) fn new(rx: watch::Receiver<T>) -> Self {
        Self { rx: Some(rx) }
    }

    /// Most recent value, without consuming the change marker.
    pub fn latest(&self) -> Option<T> {
        self.rx.as_ref().map(|rx| rx.borrow().clone())
    }

    /// Returns the newest value if it changed since the last observation.
    /// Intermediate values between polls are coalesced.
    pub fn poll_update(&mut self) -> Option<T> {
        let rx = self.rx.as_mut()?;
        match rx.has_changed() {
            Ok(true) => Some(rx.borrow_and_update().clone()),
            Ok(false) => None,
            Err(_) => {
                self.rx = None;
                None
            }
        }
    }

    /// Waits for the next change. `None` once cancelled or when the store
    /// side has gone away.
    pub async fn changed(&mut self) -> Option<T> {
        let rx = self.rx.as_mut()?;
        if rx.changed().await.is_err() {
            self.rx = None;
            return None;
        }
        Some(rx.borrow_and_update().clone())
    }

    pub fn cancel(&mut self) {
        self.rx = None;
    }

    pub fn is_active(&self) -> bool {
        self.rx.is_some()
    }
}
