pub mod pagination;

pub use pagination::PageArgs;
