pub mod sqlite;

pub use sqlite::MemoirDb;
