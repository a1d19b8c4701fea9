//! The turn loop: model output in, tool results back, repeat.
//!
//! One conversation owns one transcript. Tool calls within a round run
//! concurrently, but every call completes (or fails) before the next model
//! turn is issued, because the model expects all prior results together.
//! Failures come back as transcript data the model can reason about.

use crate::core::message::{ConversationContext, Turn};
use crate::core::provider::{ChatProvider, ModelTurn};
use crate::mcp::dispatcher::ToolDispatcher;
use futures_util::future::join_all;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Answer returned when the round limit cuts a tool-call loop short.
pub const UNABLE_TO_COMPLETE_MESSAGE: &str =
    "I wasn't able to complete this request: it needed more tool calls than one turn allows.";

/// Terminal failures of the turn loop itself.
///
/// Everything below this level (transport, session, dispatch) has already
/// been folded into the transcript as structured tool results; only the
/// controller's own failures surface here, and their display form is the
/// graceful message shown to the end user.
#[derive(Debug)]
pub enum ConversationError {
    /// The model collaborator failed to produce a turn.
    Provider(String),
    /// The caller aborted the turn.
    Interrupted,
}

impl fmt::Display for ConversationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationError::Provider(reason) => {
                write!(f, "The assistant could not complete this request: {reason}")
            }
            ConversationError::Interrupted => {
                write!(f, "The request was interrupted before it finished.")
            }
        }
    }
}

impl StdError for ConversationError {}

/// Drives one conversation against the shared tool pool.
pub struct Conversation {
    context: ConversationContext,
    provider: Arc<dyn ChatProvider>,
    dispatcher: Arc<ToolDispatcher>,
    max_tool_rounds_per_turn: u32,
}

impl Conversation {
    pub(crate) fn new(
        provider: Arc<dyn ChatProvider>,
        dispatcher: Arc<ToolDispatcher>,
        max_tool_rounds_per_turn: u32,
    ) -> Self {
        Self {
            context: ConversationContext::new(),
            provider,
            dispatcher,
            max_tool_rounds_per_turn: max_tool_rounds_per_turn.max(1),
        }
    }

    pub fn context(&self) -> &ConversationContext {
        &self.context
    }

    /// Runs one user turn to completion: model turns and tool rounds until
    /// a final answer, the round limit, or a terminal failure.
    pub async fn submit_user_message(&mut self, text: &str) -> Result<String, ConversationError> {
        self.submit_with_cancellation(text, None).await
    }

    /// Like [`Conversation::submit_user_message`], with a token that aborts
    /// the whole turn, releasing every outstanding dispatch.
    pub async fn submit_with_cancellation(
        &mut self,
        text: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<String, ConversationError> {
        self.context.push(Turn::user(text));

        for round in 0..self.max_tool_rounds_per_turn {
            if cancel.is_some_and(|token| token.is_cancelled()) {
                return Err(ConversationError::Interrupted);
            }

            let turn = self
                .provider
                .generate_turn(&self.context)
                .await
                .map_err(ConversationError::Provider)?;

            let calls = match turn {
                ModelTurn::Answer(answer) => {
                    self.context.push(Turn::assistant(answer.clone()));
                    return Ok(answer);
                }
                ModelTurn::ToolCalls(calls) => calls,
            };

            debug!(round, call_count = calls.len(), "Running tool-call round");
            for call in &calls {
                self.context.push(Turn::tool_call(
                    &call.call_id,
                    &call.tool_name,
                    call.arguments_json(),
                ));
            }

            // Independent calls run concurrently; completion order is not
            // the transcript order, which follows the request order.
            let results = join_all(
                calls
                    .iter()
                    .map(|call| self.dispatcher.dispatch(call, cancel)),
            )
            .await;

            if cancel.is_some_and(|token| token.is_cancelled()) {
                return Err(ConversationError::Interrupted);
            }

            for (call, result) in calls.iter().zip(results) {
                self.context.push(Turn::tool_result(
                    &call.call_id,
                    &call.tool_name,
                    result.outcome.as_turn_content(),
                ));
            }
        }

        self.context
            .push(Turn::assistant(UNABLE_TO_COMPLETE_MESSAGE));
        Ok(UNABLE_TO_COMPLETE_MESSAGE.to_string())
    }
}
