// Payment reconciliation core
pub mod reconciliation;

// Forward-only status policy and administrative status changes
pub mod order_status;

// Gateway status interpretation and order submission
pub mod payments;

// Stock reduction behind the claim protocol
pub mod inventory;

// Guest order linking at sign-in
pub mod guest_orders;

pub use guest_orders::GuestOrderLinker;
pub use inventory::{
    DbInventoryAdjuster, InMemoryInventoryAdjuster, InventoryAdjuster, InventoryOutcome,
    InventoryReductionGuard,
};
pub use order_status::{merge_status, OrderStatusService};
pub use payments::{interpret_payment_status, PaymentInterpretation, PaymentSubmissionService};
pub use reconciliation::{
    Channel, PaymentOutcome, ReconcileOutcome, ReconcileReport, ReconciliationService,
};
