//! Database models split into separate files.

pub mod push_message;
pub mod subscriber;
pub mod uploaded_asset;

pub use self::push_message::*;
pub use self::subscriber::*;
pub use self::uploaded_asset::*;
