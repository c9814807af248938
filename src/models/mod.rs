pub mod media_item;
pub mod tile;

pub use media_item::*;
pub use tile::*;
