// Consumer-facing commands: staging attachments, generating and stopping

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::attachments::{Attachment, AttachmentSet};
use crate::notice::{Notice, NoticeSink};
use crate::session::{Generator, SessionHandle, SessionStatus};
use crate::ticket_api::{self, TicketTransport};

/// Everything a front end needs for one authoring context: the staged
/// attachments, the generator and the notice channel both report into.
pub struct TicketDesk {
    attachments: AttachmentSet,
    generator: Generator,
    notices: NoticeSink,
}

impl TicketDesk {
    pub fn new(transport: Arc<dyn TicketTransport>, notices: NoticeSink) -> Self {
        Self {
            attachments: AttachmentSet::new(),
            generator: Generator::new(transport, notices.clone()),
            notices,
        }
    }

    pub fn attachments(&self) -> &AttachmentSet {
        &self.attachments
    }

    /// Stages selected, dropped or pasted files. Rejections are reported as
    /// notices; returns how many files were staged.
    pub fn stage(&mut self, files: Vec<Attachment>) -> usize {
        let before = self.attachments.len();
        for notice in self.attachments.admit(files) {
            self.notices.emit(Notice::error(notice.to_string()));
        }
        self.attachments.len() - before
    }

    /// Inspects files on disk and stages them.
    ///
    /// If any path cannot be inspected nothing is staged, the failure is
    /// reported as a notice and `false` is returned so the caller does not
    /// submit without it.
    pub async fn stage_paths(&mut self, paths: &[PathBuf]) -> bool {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            match Attachment::from_path(path).await {
                Ok(file) => files.push(file),
                Err(e) => {
                    warn!(error = %e, "attachment could not be inspected");
                    self.notices.emit(Notice::error(e.to_string()));
                    return false;
                }
            }
        }
        self.stage(files);
        true
    }

    pub fn unstage(&mut self, index: usize) -> Option<Attachment> {
        self.attachments.remove(index)
    }

    /// Encodes the staged attachments and starts a generation.
    ///
    /// Returns `None` when nothing was sent; the reason is on the notice
    /// channel. Staged attachments are discarded once the request is under way.
    pub async fn generate(&mut self, description: &str) -> Option<SessionHandle> {
        if let Err(e) = ticket_api::check_description(description) {
            self.notices.emit(Notice::error(e.to_string()));
            return None;
        }

        let images = match self.attachments.encode().await {
            Ok(images) => images,
            Err(e) => {
                warn!(error = %e, "submission aborted before sending");
                self.notices.emit(Notice::error(e.to_string()));
                return None;
            }
        };

        match self.generator.start(description, images).await {
            Ok(handle) => {
                info!(session = %handle.id(), "submitted generation request");
                self.attachments.clear();
                Some(handle)
            }
            Err(e) => {
                self.notices.emit(Notice::error(e.to_string()));
                None
            }
        }
    }

    pub async fn stop(&self) -> bool {
        self.generator.cancel().await
    }

    pub async fn acknowledge(&self) -> bool {
        self.generator.acknowledge().await
    }

    pub fn status(&self) -> SessionStatus {
        self.generator.status()
    }

    pub fn text(&self) -> String {
        self.generator.text()
    }

    pub fn subscribe_text(&self) -> watch::Receiver<String> {
        self.generator.subscribe_text()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.generator.subscribe_status()
    }
}
