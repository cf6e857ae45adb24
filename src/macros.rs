/// Helper macro for locking items
///
/// Evaluates to a `Result` holding the guard; a poisoned mutex maps to
/// [`crate::Error::LockError`] so callers can propagate with `?`.
///
/// ```rust, ignore
///  let guard = lock!(self.writer)?;
///  guard.emitted += 1;
/// ```
macro_rules! lock {
    ($lock:expr) => {
        $lock.lock().map_err(|_| crate::Error::LockError)
    };
}
