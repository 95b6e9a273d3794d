use survey_kernel_core::MessageStatus;

/// What a reconciliation did, as seen by a [`MessageStatusPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusFacts {
    pub current: MessageStatus,
    pub responses_changed: bool,
    /// The contact had no responses before and has at least one now.
    pub first_response: bool,
}

pub trait MessageStatusPolicy: Send + Sync {
    /// Status to store with the reconciliation, or `None` to keep it.
    fn next_status(&self, facts: &StatusFacts) -> Option<MessageStatus>;
}

/// Never touches the message status.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetainStatusPolicy;

impl MessageStatusPolicy for RetainStatusPolicy {
    fn next_status(&self, _facts: &StatusFacts) -> Option<MessageStatus> {
        None
    }
}

/// Moves contacts awaiting a reply to `responded` once their first answer
/// is recorded.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkRespondedPolicy;

impl MessageStatusPolicy for MarkRespondedPolicy {
    fn next_status(&self, facts: &StatusFacts) -> Option<MessageStatus> {
        let awaiting = matches!(
            facts.current,
            MessageStatus::Messaged | MessageStatus::NeedsResponse
        );
        (awaiting && facts.first_response).then_some(MessageStatus::Responded)
    }
}
