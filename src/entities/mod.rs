pub mod order;
pub mod product_stock;
