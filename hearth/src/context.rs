//! Context builder: assembles the per-session document the assistant should
//! remember for its next turn, from recent turns, similar turns, related
//! session summaries, and entities.
//!
//! The rendered document is XML-shaped with every free-text leaf wrapped in
//! CDATA. The token budget is enforced by dropping sections least-important
//! first (entities, then summaries, then similar turns) and finally trimming
//! the oldest recent turns.

use std::sync::Arc;

use thiserror::Error;

use crate::error::{ErrorKind, Kinded};
use crate::llm::{Embedder, LlmError};
use crate::store::search::SearchFilter;
use crate::store::{millis_to_rfc3339, Store, StoreError};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ContextMode {
    /// Everything: recent, similar (embedding search), summaries, entities.
    #[default]
    Smart,
    /// No embedding search; recent turns plus related-session summaries.
    Related,
    /// Only the session's own recent turns.
    Literal,
}

impl ContextMode {
    pub fn parse(s: &str) -> Self {
        match s {
            "related" => ContextMode::Related,
            "literal" => ContextMode::Literal,
            _ => ContextMode::Smart,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ContextRequest {
    pub session_id: String,
    pub project_path: String,
    pub personality: String,
    /// Number of recent turns to pull.
    pub depth: usize,
    pub include_entities: bool,
    pub max_tokens: usize,
    /// May be empty; then no similarity search runs.
    pub current_prompt: String,
    pub mode: ContextMode,
}

#[derive(Clone, Debug)]
pub struct BuiltContext {
    pub document: String,
    pub sources: Vec<String>,
    pub token_estimate: i64,
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Llm(#[from] LlmError),
}

impl Kinded for ContextError {
    fn kind(&self) -> ErrorKind {
        match self {
            ContextError::Store(e) => e.kind(),
            ContextError::Llm(e) => e.kind(),
        }
    }
}

/// Rough token estimate: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// CDATA-wraps free text, splitting any `]]>` terminator.
fn cdata(text: &str) -> String {
    format!("<![CDATA[{}]]>", text.replace("]]>", "]]]]><![CDATA[>"))
}

fn xml_attr(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('"', "&quot;")
}

pub struct ContextBuilder {
    store: Store,
    embedder: Arc<dyn Embedder>,
}

struct Sections {
    recent: Vec<String>,
    similar: Vec<String>,
    sessions: Vec<String>,
    entities: Vec<String>,
    entity_names: Vec<String>,
}

impl ContextBuilder {
    pub fn new(store: Store, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    /// Builds the document and writes it to the context cache.
    pub async fn build(&self, req: &ContextRequest) -> Result<BuiltContext, ContextError> {
        let sections = self.collect(req).await?;
        let built = render(req, sections);
        self.store
            .write_context_cache(
                &req.session_id,
                &built.document,
                built.sources.clone(),
                built.token_estimate,
            )
            .await?;
        Ok(built)
    }

    async fn collect(&self, req: &ContextRequest) -> Result<Sections, ContextError> {
        let mut recent = Vec::new();
        for turn in self
            .store
            .recent_conversations(&req.session_id, req.depth)
            .await?
        {
            recent.push(format!(
                "    <turn role=\"{}\" at=\"{}\">{}</turn>",
                xml_attr(&turn.message_type),
                millis_to_rfc3339(turn.created_at),
                cdata(&turn.prompt),
            ));
        }

        let mut similar = Vec::new();
        if req.mode == ContextMode::Smart && !req.current_prompt.is_empty() {
            let vectors = self.embedder.embed(&[req.current_prompt.as_str()]).await?;
            if let Some(embedding) = vectors.into_iter().next() {
                let mut hits = self
                    .store
                    .search_similar(
                        embedding.clone(),
                        8,
                        SearchFilter {
                            exclude_session: Some(req.session_id.clone()),
                            working_dir: Some(req.project_path.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
                if hits.is_empty() {
                    hits = self
                        .store
                        .search_similar(
                            embedding,
                            8,
                            SearchFilter {
                                exclude_session: Some(req.session_id.clone()),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
                for hit in hits {
                    similar.push(format!(
                        "    <turn similarity=\"{:.3}\" session=\"{}\">{}</turn>",
                        hit.similarity,
                        xml_attr(&hit.session_id),
                        cdata(&hit.prompt),
                    ));
                }
            }
        }

        let mut sessions = Vec::new();
        if req.mode != ContextMode::Literal {
            let related = self.store.related_sessions(&req.session_id, 5).await?;
            let related_ids: Vec<String> =
                related.iter().map(|r| r.session.id.clone()).collect();
            let summaries = self
                .store
                .recent_summaries(
                    5,
                    Some(req.project_path.clone()),
                    Some(req.session_id.clone()),
                )
                .await?;
            for s in summaries {
                let score = related_ids
                    .iter()
                    .position(|id| *id == s.session_id)
                    .map(|i| related[i].score)
                    .unwrap_or(0);
                sessions.push(format!(
                    "    <session id=\"{}\" kind=\"{}\" score=\"{}\">{}</session>",
                    xml_attr(&s.session_id),
                    xml_attr(&s.summary_type),
                    score,
                    cdata(&s.summary),
                ));
            }
        }

        let mut entities = Vec::new();
        let mut entity_names = Vec::new();
        if req.include_entities && req.mode != ContextMode::Literal {
            for e in self
                .store
                .top_entities_for_session(&req.session_id, 10)
                .await?
            {
                entities.push(format!(
                    "    <entity name=\"{}\" kind=\"{}\" mentions=\"{}\"/>",
                    xml_attr(&e.name),
                    xml_attr(&e.kind),
                    e.mention_count,
                ));
                entity_names.push(e.name);
            }
        }

        Ok(Sections {
            recent,
            similar,
            sessions,
            entities,
            entity_names,
        })
    }
}

fn render(req: &ContextRequest, mut sections: Sections) -> BuiltContext {
    // Drop order under budget pressure, least important first.
    let assemble = |s: &Sections| -> String {
        let mut doc = format!("<context session=\"{}\">\n", xml_attr(&req.session_id));
        for (tag, lines) in [
            ("recent", &s.recent),
            ("similar", &s.similar),
            ("sessions", &s.sessions),
            ("entities", &s.entities),
        ] {
            if lines.is_empty() {
                continue;
            }
            doc.push_str(&format!("  <{}>\n{}\n  </{}>\n", tag, lines.join("\n"), tag));
        }
        doc.push_str("</context>");
        doc
    };

    let mut doc = assemble(&sections);
    let drop_order: [fn(&mut Sections); 3] = [
        |s| s.entities.clear(),
        |s| s.sessions.clear(),
        |s| s.similar.clear(),
    ];
    for drop_section in drop_order {
        if estimate_tokens(&doc) <= req.max_tokens {
            break;
        }
        drop_section(&mut sections);
        doc = assemble(&sections);
    }
    // Still over: trim recent turns from the oldest end (the list is
    // newest-first, so pop from the back).
    while estimate_tokens(&doc) > req.max_tokens && sections.recent.len() > 1 {
        sections.recent.pop();
        doc = assemble(&sections);
    }

    let mut sources = Vec::new();
    for (name, lines) in [
        ("recent", &sections.recent),
        ("similar", &sections.similar),
        ("sessions", &sections.sessions),
        ("entities", &sections.entities),
    ] {
        if !lines.is_empty() {
            sources.push(name.to_string());
        }
    }
    if !sections.entities.is_empty() {
        sources.extend(
            sections
                .entity_names
                .iter()
                .map(|n| format!("entity:{}", n)),
        );
    }

    let token_estimate = estimate_tokens(&doc) as i64;
    BuiltContext {
        document: doc,
        sources,
        token_estimate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockEmbedder;
    use crate::store::conversation::NewConversation;
    use crate::store::session::NewSession;

    const DIM: usize = 8;

    async fn setup() -> (tempfile::TempDir, Store, ContextBuilder, String) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("t.db"), DIM).unwrap();
        let embedder = Arc::new(MockEmbedder::new(DIM));
        let builder = ContextBuilder::new(store.clone(), embedder);
        let sid = store
            .create_session(NewSession {
                working_dir: "/p".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        (dir, store, builder, sid)
    }

    fn request(sid: &str) -> ContextRequest {
        ContextRequest {
            session_id: sid.to_string(),
            project_path: "/p".into(),
            personality: "default".into(),
            depth: 5,
            include_entities: false,
            max_tokens: 2000,
            current_prompt: String::new(),
            mode: ContextMode::Smart,
        }
    }

    #[tokio::test]
    async fn recent_turns_appear_in_document_and_cache() {
        let (_d, store, builder, sid) = setup().await;
        store
            .store_conversation(NewConversation {
                session_id: sid.clone(),
                prompt: "hello".into(),
                message_type: "user",
                ..Default::default()
            })
            .await
            .unwrap();

        let built = builder.build(&request(&sid)).await.unwrap();
        assert!(built.document.contains("hello"));
        assert!(built.document.starts_with("<context"));
        assert!(built.sources.contains(&"recent".to_string()));

        let cached = store.read_context_cache(&sid, 1).await.unwrap().unwrap();
        assert_eq!(cached.context, built.document);
    }

    #[tokio::test]
    async fn similar_turns_from_other_sessions_are_included() {
        let (_d, store, builder, sid) = setup().await;
        let other = store
            .create_session(NewSession {
                working_dir: "/p".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let cid = store
            .store_conversation(NewConversation {
                session_id: other,
                prompt: "how do I use tokio".into(),
                message_type: "user",
                ..Default::default()
            })
            .await
            .unwrap();
        let emb = MockEmbedder::new(DIM)
            .embed(&["how do I use tokio"])
            .await
            .unwrap();
        store
            .update_conversation_embedding(cid, emb.into_iter().next().unwrap())
            .await
            .unwrap();

        let mut req = request(&sid);
        req.current_prompt = "how do I use tokio".into();
        let built = builder.build(&req).await.unwrap();
        assert!(built.document.contains("<similar>"));
        assert!(built.document.contains("how do I use tokio"));
    }

    #[tokio::test]
    async fn literal_mode_skips_search_and_summaries() {
        let (_d, store, builder, sid) = setup().await;
        store
            .store_conversation(NewConversation {
                session_id: sid.clone(),
                prompt: "only this".into(),
                message_type: "user",
                ..Default::default()
            })
            .await
            .unwrap();
        let mut req = request(&sid);
        req.mode = ContextMode::Literal;
        req.current_prompt = "anything".into();
        let built = builder.build(&req).await.unwrap();
        assert!(built.document.contains("only this"));
        assert!(!built.document.contains("<similar>"));
        assert!(!built.document.contains("<sessions>"));
    }

    #[tokio::test]
    async fn budget_drops_sections_before_recent() {
        let (_d, store, builder, sid) = setup().await;
        for i in 0..3 {
            store
                .store_conversation(NewConversation {
                    session_id: sid.clone(),
                    prompt: format!("recent turn number {}", i),
                    message_type: "user",
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        let other = store
            .create_session(NewSession {
                working_dir: "/p".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .insert_summary(crate::store::summary::NewSummary {
                session_id: other,
                summary_type: "exit".into(),
                summary: "a long summary ".repeat(50),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut req = request(&sid);
        req.max_tokens = 80;
        let built = builder.build(&req).await.unwrap();
        // Summaries were dropped to fit; recent turns survive.
        assert!(!built.document.contains("<sessions>"));
        assert!(built.document.contains("recent turn"));
        assert!(built.token_estimate <= 80 || built.document.matches("<turn").count() == 1);
    }

    #[test]
    fn cdata_escapes_terminator() {
        let wrapped = cdata("a]]>b");
        assert!(!wrapped.contains("a]]>b"));
        assert!(wrapped.starts_with("<![CDATA["));
    }
}
