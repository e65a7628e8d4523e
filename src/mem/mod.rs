pub mod bitmap;
pub mod slab;
pub mod xfbtree;
