use uuid::Uuid;

pub mod cancellations;
pub mod orders;
pub mod payments;
pub mod reservations;
pub mod returns;
pub mod shipments;
pub mod stock_ledger;
pub mod store_credits;

/// Actor recorded for mutations driven by inbound gateway/carrier events
/// rather than an authenticated user.
pub const SYSTEM_ACTOR: Uuid = Uuid::nil();
