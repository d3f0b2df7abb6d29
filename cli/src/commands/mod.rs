pub mod backup;
pub mod daemon;
pub mod export;
pub mod init;
pub mod list;
pub mod lock;
pub mod maintenance;
pub mod remove;
pub mod reset;
pub mod restore;
pub mod status;
