pub mod ftl;
pub mod nand;
