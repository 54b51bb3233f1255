pub mod addr;
pub mod id_map;
