use super::TaskAction;
use crate::cluster::ClusterContext;
use crate::error::Result;
use async_trait::async_trait;

pub struct RunContextAction {
    context_id: String,
}

impl RunContextAction {
    pub fn new(context_id: String) -> Self {
        Self { context_id }
    }
}

#[async_trait]
impl TaskAction for RunContextAction {
    async fn execute(&self, cluster: &ClusterContext) -> Result<()> {
        cluster.contexts().run_context(&self.context_id).await
    }
}
