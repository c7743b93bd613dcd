//! Flow producer: parent/child job trees added in one atomic batch.
//!
//! The parent of a tree starts in `waiting-children`; each child carries a
//! reference back to it and registers itself in the parent's pending set.
//! Edge policies for child failures travel in the child's own options
//! (`failParentOnFailure` and friends).

use chrono::Utc;
use redis::aio::ConnectionManager;

use crate::connection::RedisLink;
use crate::error::{ConveyorError, Result};
use crate::job::{Job, ParentRef};
use crate::keys::DEFAULT_PREFIX;
use crate::options::JobOptions;
use crate::scripts::{add_jobs_script, run_add_jobs, AddNode};

/// One node of a flow to be added. Children may live on different queues.
#[derive(Debug, Clone)]
pub struct FlowJob {
    pub queue_name: String,
    pub name: String,
    pub data: serde_json::Value,
    pub opts: JobOptions,
    pub children: Vec<FlowJob>,
}

impl FlowJob {
    pub fn new(queue_name: &str, name: &str, data: serde_json::Value) -> Self {
        Self {
            queue_name: queue_name.to_string(),
            name: name.to_string(),
            data,
            opts: JobOptions::default(),
            children: Vec::new(),
        }
    }

    pub fn with_opts(mut self, opts: JobOptions) -> Self {
        self.opts = opts;
        self
    }

    pub fn with_child(mut self, child: FlowJob) -> Self {
        self.children.push(child);
        self
    }
}

/// Assigned ids of an added flow, mirroring the input tree.
#[derive(Debug, Clone)]
pub struct AddedFlowNode {
    pub job_id: String,
    pub queue_name: String,
    pub name: String,
    pub children: Vec<AddedFlowNode>,
}

#[derive(Debug, Clone)]
pub struct FlowProducerOptions {
    pub prefix: String,
    pub max_events_len: u64,
}

impl Default for FlowProducerOptions {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            max_events_len: 10_000,
        }
    }
}

pub struct FlowProducer {
    link: RedisLink,
    script: redis::Script,
    opts: FlowProducerOptions,
}

impl FlowProducer {
    pub async fn new(url: &str, opts: FlowProducerOptions) -> Result<Self> {
        let link = RedisLink::connect(url).await?;
        Ok(Self::with_link(link, opts))
    }

    pub fn with_link(link: RedisLink, opts: FlowProducerOptions) -> Self {
        Self {
            link,
            script: add_jobs_script(),
            opts,
        }
    }

    /// Add a whole tree atomically. Returns the assigned ids in the shape of
    /// the input.
    pub async fn add(&self, root: FlowJob) -> Result<AddedFlowNode> {
        self.add_with_parent(root, None).await
    }

    /// Add a tree whose root is a child of an already-persisted parent job.
    /// Fails with [`crate::ConveyorError::ParentMissing`] when that parent no
    /// longer exists; nothing is written in that case.
    pub async fn add_under(&self, parent: &ParentRef, root: FlowJob) -> Result<AddedFlowNode> {
        self.add_with_parent(root, Some(parent)).await
    }

    async fn add_with_parent(
        &self,
        root: FlowJob,
        parent: Option<&ParentRef>,
    ) -> Result<AddedFlowNode> {
        let now = Utc::now().timestamp_millis();
        let mut nodes = Vec::new();
        let mut shapes = Vec::new();
        flatten(&root, 0, &self.opts, &mut nodes, &mut shapes)?;
        if let Some(parent) = parent {
            nodes[0].parent_key = parent.qualified_key();
            nodes[0].parent_json = serde_json::to_string(parent)?;
        }

        let mut conn: ConnectionManager = self.link.manager();
        let ids = run_add_jobs(&self.script, &mut conn, &nodes, now).await?;
        if ids.len() != nodes.len() {
            return Err(ConveyorError::ScriptReply(format!(
                "flow add returned {} ids for {} nodes",
                ids.len(),
                nodes.len()
            )));
        }

        tracing::debug!(
            queue = %root.queue_name,
            nodes = nodes.len(),
            "Added flow"
        );
        Ok(rebuild(&shapes, &ids, 0).0)
    }
}

/// Flattened shape entry: `(queue_name, name, child_count)` in the same
/// parent-first order as the add nodes.
type Shape = (String, String, usize);

fn flatten(
    node: &FlowJob,
    parent_idx: usize,
    opts: &FlowProducerOptions,
    nodes: &mut Vec<AddNode>,
    shapes: &mut Vec<Shape>,
) -> Result<()> {
    if node.opts.repeat.is_some() {
        return Err(ConveyorError::Internal(
            "repeatable jobs cannot be part of a flow".to_string(),
        ));
    }
    let job = Job::new(&node.name, node.data.clone(), node.opts.clone());
    nodes.push(AddNode {
        prefix: format!("{}:{}:", opts.prefix, node.queue_name),
        id: job.opts.job_id.clone().unwrap_or_default(),
        name: job.name.clone(),
        data: serde_json::to_string(&job.data)?,
        opts: serde_json::to_string(&job.opts)?,
        timestamp: job.timestamp,
        delay: job.delay,
        priority: job.priority,
        parent_idx,
        parent_key: String::new(),
        parent_json: String::new(),
        wait_children: u8::from(!node.children.is_empty()),
        repeat_job_key: String::new(),
        max_events: opts.max_events_len,
    });
    shapes.push((
        node.queue_name.clone(),
        node.name.clone(),
        node.children.len(),
    ));

    let my_idx = nodes.len();
    for child in &node.children {
        flatten(child, my_idx, opts, nodes, shapes)?;
    }
    Ok(())
}

/// Rebuild the result tree from the flat parent-first traversal.
fn rebuild(shapes: &[Shape], ids: &[String], at: usize) -> (AddedFlowNode, usize) {
    let (queue_name, name, child_count) = &shapes[at];
    let mut node = AddedFlowNode {
        job_id: ids[at].clone(),
        queue_name: queue_name.clone(),
        name: name.clone(),
        children: Vec::with_capacity(*child_count),
    };
    let mut next = at + 1;
    for _ in 0..*child_count {
        let (child, after) = rebuild(shapes, ids, next);
        node.children.push(child);
        next = after;
    }
    (node, next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flatten_orders_parents_first() {
        let tree = FlowJob::new("renders", "assemble", json!({}))
            .with_child(FlowJob::new("steps", "draw", json!({"n": 1})))
            .with_child(
                FlowJob::new("steps", "paint", json!({"n": 2}))
                    .with_child(FlowJob::new("steps", "mix", json!({}))),
            );

        let opts = FlowProducerOptions::default();
        let mut nodes = Vec::new();
        let mut shapes = Vec::new();
        flatten(&tree, 0, &opts, &mut nodes, &mut shapes).unwrap();

        assert_eq!(nodes.len(), 4);
        assert_eq!(nodes[0].parent_idx, 0);
        assert_eq!(nodes[0].wait_children, 1);
        assert_eq!(nodes[1].parent_idx, 1);
        assert_eq!(nodes[1].wait_children, 0);
        assert_eq!(nodes[2].parent_idx, 1);
        assert_eq!(nodes[2].wait_children, 1);
        // grandchild points at its own parent, not the root
        assert_eq!(nodes[3].parent_idx, 3);
        assert_eq!(nodes[0].prefix, "bull:renders:");
        assert_eq!(nodes[3].prefix, "bull:steps:");
    }

    #[test]
    fn rebuild_mirrors_the_input_tree() {
        let tree = FlowJob::new("q", "root", json!({}))
            .with_child(FlowJob::new("q", "a", json!({})))
            .with_child(FlowJob::new("q", "b", json!({})));

        let opts = FlowProducerOptions::default();
        let mut nodes = Vec::new();
        let mut shapes = Vec::new();
        flatten(&tree, 0, &opts, &mut nodes, &mut shapes).unwrap();

        let ids: Vec<String> = (1..=3).map(|i| i.to_string()).collect();
        let (rebuilt, consumed) = rebuild(&shapes, &ids, 0);
        assert_eq!(consumed, 3);
        assert_eq!(rebuilt.job_id, "1");
        assert_eq!(rebuilt.children.len(), 2);
        assert_eq!(rebuilt.children[0].name, "a");
        assert_eq!(rebuilt.children[1].job_id, "3");
    }

    #[test]
    fn repeat_options_are_rejected_in_flows() {
        let mut node = FlowJob::new("q", "r", json!({}));
        node.opts.repeat = Some(Default::default());
        let opts = FlowProducerOptions::default();
        let mut nodes = Vec::new();
        let mut shapes = Vec::new();
        assert!(flatten(&node, 0, &opts, &mut nodes, &mut shapes).is_err());
    }
}
