pub mod dispatch;
pub mod init;
pub mod storage;
pub mod webpush;
