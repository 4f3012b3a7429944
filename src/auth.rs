//! Authorization decisions consumed from the identity collaborator.
//!
//! Identities are opaque strings; this crate never authenticates them. The network surface can
//! additionally require a shared token before any request is served.

use crate::model::{Booking, Court};

/// Who may do what. Implementations must be cheap and side-effect free; they run on the
/// request path before any exclusive section is taken.
pub trait Authorizer: Send + Sync {
    /// May `actor` cancel `booking` on `court`?
    fn may_cancel(&self, actor: &str, booking: &Booking, court: &Court) -> bool;

    /// May `actor` block or unblock windows on `court`?
    fn may_manage(&self, actor: &str, court: &Court) -> bool;
}

/// The requester may cancel their own booking; the court owner may cancel any booking on the
/// court and manage its blocked windows.
#[derive(Debug, Default, Clone, Copy)]
pub struct OwnerOrRequester;

impl Authorizer for OwnerOrRequester {
    fn may_cancel(&self, actor: &str, booking: &Booking, court: &Court) -> bool {
        actor == booking.requester_id || actor == court.owner_id
    }

    fn may_manage(&self, actor: &str, court: &Court) -> bool {
        actor == court.owner_id
    }
}

/// Constant-time comparison of a presented token against the configured one.
pub fn token_matches(expected: &str, presented: &str) -> bool {
    let (a, b) = (expected.as_bytes(), presented.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
