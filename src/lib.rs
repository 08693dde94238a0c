// Streaming client for a remote ticket generation service

pub mod attachments;
pub mod commands;
pub mod config;
pub mod error;
pub mod notice;
pub mod session;
pub mod ticket_api;

pub use attachments::{Attachment, AttachmentSet, EncodedAttachment, RejectionNotice};
pub use commands::TicketDesk;
pub use config::ClientConfig;
pub use error::{AttachmentError, ConfigError, GenerationError};
pub use notice::{Notice, NoticeLevel, NoticeSink};
pub use session::{Generator, SessionHandle, SessionOutcome, SessionReport, SessionStatus};
pub use ticket_api::{TicketClient, TicketRequest, TicketTransport};
