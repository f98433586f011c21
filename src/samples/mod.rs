//! Sample Jobs
//!
//! Concrete jobs showing how locks compose:
//!
//! - [`DeleteOldUsersJob`]: periodic, leader lock only
//! - [`ProcessLogFilesJob`]: periodic, plus a lock per file that is never released
//! - [`SendEmailsJob`]: background, lock per message

mod email;
mod log_files;
mod users;

pub use email::{
    message_lock_name, EmailMessage, EmailSender, OutboxSender, SendEmailsJob,
    DEFAULT_MESSAGE_LOCK_TIMEOUT, SEND_EMAILS_QUEUE_ID,
};
pub use log_files::{
    file_lock_name, InMemoryLogFileSource, LogFileSource, LogLine, LogSummary, ProcessLogFilesJob,
    DEFAULT_FILE_LOCK_TIMEOUT, PROCESS_LOG_FILES_JOB_ID,
};
pub use users::{
    DeleteOldUsersJob, InMemoryUserRepository, User, UserRepository, DELETE_OLD_USERS_JOB_ID,
};
