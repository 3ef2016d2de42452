use thiserror::Error;

use crate::config::ConfigError;
use crate::crypto::CryptoError;
use crate::db::PersistenceError;
use crate::odoo::OdooError;
use crate::webhook::WebhookError;

/// Umbrella error returned by a worker cycle. Carries enough information
/// for the scheduler to decide whether the failure counts against the
/// connection's circuit breaker (see `counts_as_breaker_failure`).
#[derive(Debug, Error)]
pub enum PollerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Odoo(#[from] OdooError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("mapping error: {0}")]
    Mapping(String),
}

impl PollerError {
    /// Whether this failure indicates the Odoo side (or the webhook
    /// endpoint, for every order in the cycle) is broken, and so should
    /// count against the circuit breaker. Per-order webhook failures that
    /// go through the retry queue are not represented here at all — only
    /// whole-cycle failures reach this type.
    pub fn counts_as_breaker_failure(&self) -> bool {
        match self {
            PollerError::Odoo(e) => e.is_transport_like() || matches!(e, OdooError::Auth(_)),
            PollerError::Webhook(_) => true,
            PollerError::Persistence(_) => false,
            PollerError::Config(_) | PollerError::Crypto(_) | PollerError::Mapping(_) => false,
        }
    }
}
