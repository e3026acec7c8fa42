use keyminter_contracts::{InboundCommand, OutboundMessage, Update};
use keyminter_kernel::{
    classify, display_name, issued_text, Command, ALREADY_ACTIVE_TEXT, GREETING_TEXT,
    ISSUE_FAILED_TEXT,
};
use tracing::{debug, error, warn};

use crate::gateway::MessageGateway;
use crate::issuer::{IssueOutcome, KeyIssuer};

/// Maps one chat command to at most one reply. Holds no per-chat state.
pub struct CommandDispatcher {
    issuer: KeyIssuer,
}

impl CommandDispatcher {
    pub fn new(issuer: KeyIssuer) -> Self {
        Self { issuer }
    }

    pub async fn dispatch(&self, cmd: &InboundCommand) -> Option<OutboundMessage> {
        let text = match classify(&cmd.text)? {
            Command::Start => GREETING_TEXT.to_string(),
            Command::GetKey => self.get_key(cmd).await,
        };
        Some(OutboundMessage {
            chat_id: cmd.chat_id,
            text,
        })
    }

    /// Runs one decoded update through dispatch and delivers the reply, if
    /// any. Delivery failures are logged and dropped.
    pub async fn respond(&self, update: &Update, gateway: &dyn MessageGateway) {
        let Some(cmd) = InboundCommand::from_update(update) else {
            debug!(update_id = ?update.update_id, "update carries no actionable message");
            return;
        };

        let Some(reply) = self.dispatch(&cmd).await else {
            debug!(chat_id = cmd.chat_id, "ignoring unrecognised text");
            return;
        };

        if let Err(err) = gateway.send(&reply).await {
            warn!(chat_id = reply.chat_id, error = %err, "reply delivery failed");
        }
    }

    async fn get_key(&self, cmd: &InboundCommand) -> String {
        let owner_id = cmd.user_id.to_string();
        match self.issuer.issue(&owner_id).await {
            Ok(IssueOutcome::AlreadyActive) => ALREADY_ACTIVE_TEXT.to_string(),
            Ok(IssueOutcome::Issued(token)) => {
                let name = display_name(cmd.username.as_deref(), cmd.user_id);
                debug!(owner_id = %owner_id, display_name = %name, "rendering issued key reply");
                issued_text(&token, &name, cmd.user_id)
            }
            Err(err) => {
                error!(owner_id = %owner_id, kind = err.kind(), error = %err, "key issuance failed");
                ISSUE_FAILED_TEXT.to_string()
            }
        }
    }
}
