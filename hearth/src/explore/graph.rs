//! External knowledge-graph collaborators. The core only emits facts through
//! [`FactIntegration`] and reads gap queries from [`KnowledgeGraph`]; both are
//! implemented outside the daemon.

use async_trait::async_trait;

/// One graph entity surfaced by gap detection.
#[derive(Clone, Debug)]
pub struct GraphEntity {
    pub uuid: String,
    pub name: String,
}

/// Sink for promoted findings. Implementations must be eventually idempotent
/// on finding text within one group id: the core dedupes per task before
/// calling, but repeat submissions after retries must be tolerated.
#[async_trait]
pub trait FactIntegration: Send + Sync {
    async fn integrate_findings(
        &self,
        group_id: &str,
        findings: &[String],
        confidence: f64,
    ) -> Result<(), String>;
}

/// Gap queries over the external graph.
#[async_trait]
pub trait KnowledgeGraph: Send + Sync {
    async fn find_unexplored_entities(&self, limit: usize) -> Vec<GraphEntity>;
    async fn find_underexplored_entities(&self, limit: usize) -> Vec<GraphEntity>;
}

/// Discards promotions (logs at debug); the default until a graph component
/// is attached.
pub struct NullFactIntegration;

#[async_trait]
impl FactIntegration for NullFactIntegration {
    async fn integrate_findings(
        &self,
        group_id: &str,
        findings: &[String],
        confidence: f64,
    ) -> Result<(), String> {
        tracing::debug!(group_id, count = findings.len(), confidence, "fact integration disabled");
        Ok(())
    }
}

/// Graph with no entities; gap detection is a no-op.
pub struct NullKnowledgeGraph;

#[async_trait]
impl KnowledgeGraph for NullKnowledgeGraph {
    async fn find_unexplored_entities(&self, _limit: usize) -> Vec<GraphEntity> {
        Vec::new()
    }

    async fn find_underexplored_entities(&self, _limit: usize) -> Vec<GraphEntity> {
        Vec::new()
    }
}
