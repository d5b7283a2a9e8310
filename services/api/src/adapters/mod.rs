pub mod db;
pub mod open_library;

pub use db::DbAdapter;
pub use open_library::OpenLibraryAdapter;
