use tracing::warn;

use querypilot_agent::{AgentResponse, QueryRequest};
use querypilot_common::{
    ChatMessage, Error, MessageMetadata, Result, SessionId,
};
use querypilot_connect::{Endpoint, EndpointKind};
use querypilot_memory::{SessionRow, StoredEndpoint};

use crate::state::AppState;

impl AppState {
    /// Join (creating on first use) a session. Foreign sessions are
    /// rejected; the per-user cap bounds creation.
    pub fn join_session(&self, session_id: &str, user_id: &str) -> Result<SessionRow> {
        let session = match self.meta.get_session(session_id)? {
            Some(session) => {
                if session.user_id != user_id {
                    return Err(Error::Unauthorized(
                        "session belongs to another user".to_string(),
                    ));
                }
                session
            }
            None => {
                self.check_session_cap(user_id)?;
                self.meta
                    .create_session_with_id(session_id, user_id, None)?
            }
        };

        self.meta.touch_session(session_id, true)?;
        self.live_session(session_id, user_id);
        Ok(session)
    }

    pub fn create_session(&self, user_id: &str, title: Option<&str>) -> Result<SessionRow> {
        self.check_session_cap(user_id)?;
        let session = self.meta.create_session(user_id, title)?;
        self.live_session(&session.id, user_id);
        Ok(session)
    }

    pub fn list_sessions(&self, user_id: &str) -> Result<Vec<SessionRow>> {
        self.meta.list_sessions(user_id)
    }

    pub fn delete_session(&self, session_id: &str, user_id: &str) -> Result<()> {
        let session = self
            .meta
            .get_session(session_id)?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        if session.user_id != user_id {
            return Err(Error::Unauthorized(
                "session belongs to another user".to_string(),
            ));
        }
        self.meta.delete_session(session_id)?;
        self.forget_session(session_id);
        Ok(())
    }

    fn check_session_cap(&self, user_id: &str) -> Result<()> {
        let count = self.meta.count_sessions(user_id)?;
        if count >= self.config.sessions.max_per_user as i64 {
            return Err(Error::BadInput(format!(
                "session limit reached ({} per user)",
                self.config.sessions.max_per_user
            )));
        }
        Ok(())
    }

    /// One conversational turn on a session: persist the user message,
    /// drive the pipeline, persist the agent reply, refresh context.
    /// The agent message timestamp is never earlier than the user's.
    pub async fn send_message(
        &self,
        session_id: &str,
        user_id: &str,
        request: &QueryRequest,
    ) -> Result<(ChatMessage, AgentResponse, ChatMessage)> {
        let session = self
            .meta
            .get_session(session_id)?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        if session.user_id != user_id {
            return Err(Error::Unauthorized(
                "session belongs to another user".to_string(),
            ));
        }

        let sid = SessionId::from_str(session_id);
        let user_message = ChatMessage::user(sid.clone(), user_id, request.query.clone());
        self.meta.append_message(&user_message)?;

        let endpoint = self.resolve_endpoint(session_id, request)?;
        let response = self
            .pipeline
            .handle_turn(user_id, request, &endpoint)
            .await?;

        let metadata = MessageMetadata {
            query_kind: None,
            execution_millis: response.execution_millis,
            data_retrieved: Some(!response.data.is_null()),
            tools_used: response
                .trace
                .as_ref()
                .map(|trace| trace.iter().map(|step| step.kind.clone()).collect()),
            confidence: None,
        };
        let agent_message = ChatMessage::agent(sid, response.message.clone(), metadata);
        self.meta.append_message(&agent_message)?;

        self.refresh_context(session_id, request, &session, &endpoint);
        self.remember_endpoint(session_id, endpoint);

        Ok((user_message, response, agent_message))
    }

    /// Effective endpoint: the request's override wins, else the
    /// session's last-used endpoint.
    fn resolve_endpoint(&self, session_id: &str, request: &QueryRequest) -> Result<Endpoint> {
        if let Some(url) = &request.db_url {
            let kind = request
                .db_type
                .as_deref()
                .and_then(EndpointKind::from_str);
            return Endpoint::new(url.clone(), kind);
        }
        self.last_endpoint(session_id).ok_or_else(|| {
            Error::BadInput("no database endpoint for this session; provide dbUrl".to_string())
        })
    }

    /// Context updates are best-effort; a failed write never fails the
    /// turn.
    fn refresh_context(
        &self,
        session_id: &str,
        request: &QueryRequest,
        session: &SessionRow,
        endpoint: &Endpoint,
    ) {
        let mut context = session.context.clone();
        context.push_recent_query(request.query.clone());
        context.last_endpoint = Some(StoredEndpoint {
            url: endpoint.sanitized_url(),
            kind: endpoint.kind().as_str().to_string(),
        });
        if let Err(e) = self.meta.update_session_context(session_id, &context) {
            warn!("failed to update session context: {e}");
        }
    }
}
