//! Splitting a master task into a task graph.

use async_trait::async_trait;

use crate::error::Result;
use crate::task::TaskGraph;

#[async_trait]
pub trait Decomposer: Send + Sync {
    async fn decompose(&self, master_task: &str) -> Result<TaskGraph>;
}

/// A graph decided ahead of time, e.g. read from a file by the caller.
#[derive(Debug, Clone)]
pub struct StaticDecomposer(pub TaskGraph);

#[async_trait]
impl Decomposer for StaticDecomposer {
    async fn decompose(&self, _master_task: &str) -> Result<TaskGraph> {
        Ok(self.0.clone())
    }
}

#[async_trait]
impl<F> Decomposer for F
where
    F: Fn(&str) -> Result<TaskGraph> + Send + Sync,
{
    async fn decompose(&self, master_task: &str) -> Result<TaskGraph> {
        self(master_task)
    }
}
