pub mod daemon;
pub mod inbox;
pub mod records;
