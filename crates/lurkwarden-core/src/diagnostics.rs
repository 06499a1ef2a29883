//! Operator diagnostics.
//!
//! Unexpected failures caught at a sweep, purge or event boundary are logged
//! and, when an operator chat is configured, forwarded there.

use crate::gateway::ChatGateway;
use std::fmt::Display;
use std::sync::Arc;
use tracing::{error, warn};

/// Forwards unexpected failures to the operator chat.
pub struct OperatorReporter {
    gateway: Arc<dyn ChatGateway>,
    operator_chat_id: Option<i64>,
}

impl OperatorReporter {
    /// Create a reporter; `None` only logs.
    #[must_use]
    pub fn new(gateway: Arc<dyn ChatGateway>, operator_chat_id: Option<i64>) -> Self {
        Self {
            gateway,
            operator_chat_id,
        }
    }

    /// Log the failure and forward it to the operator chat.
    pub async fn report(&self, context: &str, chat_id: Option<i64>, err: &(dyn Display + Sync)) {
        error!(context, chat_id, error = %err, "Unexpected failure");
        let Some(operator_chat) = self.operator_chat_id else {
            return;
        };
        let text = match chat_id {
            Some(chat_id) => format!("[{context}] chat {chat_id}: {err}"),
            None => format!("[{context}] {err}"),
        };
        if let Err(e) = self.gateway.send_message(operator_chat, text).await {
            warn!(operator_chat, error = %e, "Failed to deliver diagnostic");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockChatGateway;
    use mockall::predicate::{eq, function};

    #[tokio::test]
    async fn test_forwards_to_operator_chat() {
        let mut gateway = MockChatGateway::new();
        gateway
            .expect_send_message()
            .with(eq(99), function(|text: &String| text.contains("sweep") && text.contains("-5")))
            .times(1)
            .returning(|_, _| Ok(()));
        let reporter = OperatorReporter::new(Arc::new(gateway), Some(99));
        reporter.report("sweep", Some(-5), &"boom").await;
    }

    #[tokio::test]
    async fn test_without_operator_chat_only_logs() {
        let gateway = MockChatGateway::new();
        let reporter = OperatorReporter::new(Arc::new(gateway), None);
        reporter.report("purge", None, &"boom").await;
    }
}
