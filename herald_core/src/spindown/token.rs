use tokio_util::sync::CancellationToken;

/// Issued for every workload registered with a [`Spindown`](crate::Spindown).
///
/// The owning workload [punches out](SpindownToken::punch_out) once it has
/// released its resources; dropping the token has the same effect.
#[derive(Debug)]
pub struct SpindownToken {
    token: CancellationToken,
}

impl SpindownToken {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Signals that the associated workload has completed.
    pub fn punch_out(&self) {
        self.token.cancel();
    }
}

impl Drop for SpindownToken {
    fn drop(&mut self) {
        self.punch_out();
    }
}
