//! The conversational agent: session management, per-session turn
//! serialization, the blocking `chat` pipeline and the low-latency
//! `chat_stream` path.

pub mod classifier;
pub mod finalizer;
pub mod graph;
pub mod router;
pub mod strategies;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::database::{SessionDatabase, StoredMessage};
use crate::llm::{ChatMessage, CompletionRequest, LanguageBackend};
use crate::preprocess::{clean_text, is_crisis};
use crate::tools::ToolRegistry;
use crate::transcript::Transcript;

use finalizer::{crisis_response, FinalResponse, CRISIS_SCORE_DELTA};
use graph::{run_turn, TurnInput};
use router::Strategy;
use strategies::{model_for, StrategyRun};

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("persistence failed: {0}")]
    Persistence(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResult {
    pub session_id: String,
    pub response: FinalResponse,
    pub strategy: Strategy,
    pub crisis: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub messages: Vec<StoredMessage>,
    pub total_messages: usize,
    pub page: usize,
    pub per_page: usize,
    pub has_more: bool,
}

pub struct ChatAgent {
    backend: Arc<dyn LanguageBackend>,
    registry: Arc<ToolRegistry>,
    db: Arc<SessionDatabase>,
    config: ServiceConfig,
    // One async mutex per session so turns never interleave writes.
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ChatAgent {
    pub fn new(
        backend: Arc<dyn LanguageBackend>,
        registry: Arc<ToolRegistry>,
        db: Arc<SessionDatabase>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            backend,
            registry,
            db,
            config,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        // An entry nobody else holds a clone of belongs to an idle session.
        locks.retain(|id, lock| id.as_str() == session_id || Arc::strong_count(lock) > 1);
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Create a fresh session for the user.
    pub fn open_session(&self, user_id: &str, user_name: &str) -> Result<String, TurnError> {
        let session_id = Uuid::new_v4().to_string();
        self.db.upsert_session(&session_id, user_id, user_name)?;
        tracing::info!("Opened session {} for user {}", session_id, user_id);
        Ok(session_id)
    }

    /// Resolve a caller-supplied session id, creating the session if it does
    /// not exist yet. No id means a new session.
    fn get_or_create_session(
        &self,
        session_id: Option<&str>,
        user_id: &str,
        user_name: &str,
    ) -> Result<String, TurnError> {
        match session_id {
            Some(id) if !id.trim().is_empty() => {
                self.db.upsert_session(id, user_id, user_name)?;
                Ok(id.to_string())
            }
            _ => self.open_session(user_id, user_name),
        }
    }

    pub fn get_user_sessions(
        &self,
        user_id: &str,
    ) -> Result<Vec<crate::database::SessionRecord>, TurnError> {
        Ok(self.db.get_user_sessions(user_id)?)
    }

    /// One full structured turn.
    pub async fn chat(
        &self,
        session_id: Option<&str>,
        user_id: &str,
        user_name: &str,
        message: &str,
    ) -> Result<ChatResult, TurnError> {
        let session_id = self.get_or_create_session(session_id, user_id, user_name)?;
        let lock = self.session_lock(&session_id).await;
        let _guard = lock.lock().await;

        let (mut transcript, prior_crisis) = match self.db.load_checkpoint(&session_id) {
            Ok(Some(checkpoint)) => (checkpoint.transcript, checkpoint.crisis_flag),
            Ok(None) => (Transcript::new(), false),
            Err(e) => {
                tracing::error!("Checkpoint load failed for {}: {}", session_id, e);
                (Transcript::new(), false)
            }
        };

        let safety_score = self
            .db
            .get_session(&session_id)
            .ok()
            .flatten()
            .map(|s| s.safety_score)
            .unwrap_or(0);

        let run = StrategyRun {
            backend: self.backend.as_ref(),
            registry: &self.registry,
            config: &self.config,
        };
        let outcome = run_turn(
            &run,
            &mut transcript,
            TurnInput {
                user_id,
                user_name,
                raw_text: message,
                safety_score,
            },
        )
        .await;

        let score_after = if outcome.crisis {
            match self.db.adjust_safety_score(&session_id, CRISIS_SCORE_DELTA) {
                Ok(score) => score,
                Err(e) => {
                    tracing::error!("Safety score update failed for {}: {}", session_id, e);
                    safety_score
                }
            }
        } else {
            safety_score
        };

        // Persistence is best-effort: the user gets their response either way.
        let metadata = serde_json::to_value(&outcome.response).unwrap_or(serde_json::Value::Null);
        if !outcome.cleaned_text.is_empty() {
            if let Err(e) = self.db.store_message(
                &session_id,
                user_id,
                user_name,
                &outcome.cleaned_text,
                &outcome.response.message,
                &metadata,
            ) {
                tracing::error!("Message store failed for {}: {}", session_id, e);
            }
            if let Err(e) = self.db.save_checkpoint(
                &session_id,
                &transcript.cleaned_for_storage(),
                prior_crisis || outcome.crisis,
                score_after,
            ) {
                tracing::error!("Checkpoint save failed for {}: {}", session_id, e);
            }
        }
        if let Err(e) = self.db.touch_session(&session_id) {
            tracing::error!("Session touch failed for {}: {}", session_id, e);
        }

        Ok(ChatResult {
            session_id,
            response: outcome.response,
            strategy: outcome.strategy,
            crisis: outcome.crisis,
        })
    }

    /// Low-latency streaming turn: plain text chunks, no tool use.
    ///
    /// A crisis message gets the canned response immediately, before any
    /// model round trip. Accumulation and persistence continue in the
    /// background even if the receiver goes away mid-stream.
    pub async fn chat_stream(
        self: Arc<Self>,
        session_id: Option<&str>,
        user_id: &str,
        user_name: &str,
        message: &str,
    ) -> Result<(String, flume::Receiver<String>), TurnError> {
        let session_id = self.get_or_create_session(session_id, user_id, user_name)?;
        let (tx, rx) = flume::unbounded::<String>();

        let cleaned = clean_text(message);
        if cleaned.is_empty() {
            let _ = tx.send(format!(
                "I'm here whenever you're ready, {}. What's on your mind?",
                user_name
            ));
            return Ok((session_id, rx));
        }

        if is_crisis(&cleaned) {
            let response = crisis_response(user_name);
            let _ = tx.send(response.clone());

            let agent = Arc::clone(&self);
            let sid = session_id.clone();
            let (uid, uname) = (user_id.to_string(), user_name.to_string());
            tokio::spawn(async move {
                let lock = agent.session_lock(&sid).await;
                let _guard = lock.lock().await;
                agent.persist_stream_turn(&sid, &uid, &uname, &cleaned, &response, true);
            });
            return Ok((session_id, rx));
        }

        let agent = Arc::clone(&self);
        let sid = session_id.clone();
        let (uid, uname) = (user_id.to_string(), user_name.to_string());
        tokio::spawn(async move {
            let lock = agent.session_lock(&sid).await;
            let _guard = lock.lock().await;

            let classification =
                classifier::classify(agent.backend.as_ref(), &agent.config.models.analysis, &cleaned)
                    .await;
            let strategy = router::route(false, &classification);
            let model = model_for(strategy, &agent.config.models).to_string();

            let mut messages = vec![ChatMessage::system(agent.config.persona_prompt())];
            match agent
                .db
                .get_recent_messages(&sid, agent.config.stream_context_messages)
            {
                Ok(recent) => {
                    for stored in recent {
                        messages.push(ChatMessage::user(stored.user_message));
                        messages.push(ChatMessage::assistant(stored.ai_response));
                    }
                }
                Err(e) => tracing::error!("History load failed for {}: {}", sid, e),
            }
            messages.push(ChatMessage::user(cleaned.clone()));

            let request = CompletionRequest::new(model, messages)
                .with_temperature(agent.config.temperature)
                .with_max_tokens(agent.config.max_tokens);

            let on_chunk = move |chunk: &str| {
                // Receiver may be gone; keep generating so the turn persists.
                let _ = tx.send(chunk.to_string());
            };

            let full_text = match agent
                .backend
                .complete_streaming(request, &on_chunk)
                .await
            {
                Ok(reply) => reply.content.unwrap_or_default(),
                Err(e) => {
                    tracing::error!("Streaming turn failed for {}: {}", sid, e);
                    String::new()
                }
            };

            if !full_text.is_empty() {
                agent.persist_stream_turn(&sid, &uid, &uname, &cleaned, &full_text, false);
            }
        });

        Ok((session_id, rx))
    }

    fn persist_stream_turn(
        &self,
        session_id: &str,
        user_id: &str,
        user_name: &str,
        user_message: &str,
        ai_response: &str,
        crisis: bool,
    ) {
        if crisis {
            if let Err(e) = self.db.adjust_safety_score(session_id, CRISIS_SCORE_DELTA) {
                tracing::error!("Safety score update failed for {}: {}", session_id, e);
            }
        }
        let metadata = serde_json::json!({"streamed": true, "crisis": crisis});
        if let Err(e) = self.db.store_message(
            session_id,
            user_id,
            user_name,
            user_message,
            ai_response,
            &metadata,
        ) {
            tracing::error!("Streamed message store failed for {}: {}", session_id, e);
        }
        if let Err(e) = self.db.touch_session(session_id) {
            tracing::error!("Session touch failed for {}: {}", session_id, e);
        }
    }

    /// Paginated exchange history for a session.
    pub fn get_history(
        &self,
        session_id: &str,
        page: usize,
        per_page: usize,
    ) -> Result<HistoryPage, TurnError> {
        if self.db.get_session(session_id)?.is_none() {
            return Err(TurnError::UnknownSession(session_id.to_string()));
        }

        let page = page.max(1);
        let per_page = per_page.clamp(1, 100);
        let total = self.db.count_messages(session_id)?;
        let offset = (page - 1) * per_page;
        let messages = self.db.get_message_history(session_id, per_page, offset)?;
        let has_more = offset + messages.len() < total;

        Ok(HistoryPage {
            messages,
            total_messages: total,
            page,
            per_page,
            has_more,
        })
    }
}
