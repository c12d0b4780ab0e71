pub mod push_message_repository;
pub mod subscriber_repository;
pub mod uploaded_asset_repository;

pub use push_message_repository::PushMessageRepository;
pub use subscriber_repository::SubscriberRepository;
pub use uploaded_asset_repository::UploadedAssetRepository;
