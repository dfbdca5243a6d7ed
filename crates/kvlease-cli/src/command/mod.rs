pub mod contend;
pub mod delete_tree;

pub use contend::ContendReport;
pub use delete_tree::DeleteTreeReport;
