pub mod order;

pub use order::{
    InventoryLine, Order, OrderItem, OrderPatch, OrderStatus, PaymentStatus, GUEST_USER_ID,
};
