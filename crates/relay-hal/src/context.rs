use std::sync::Arc;

use crate::{DescriptorAllocator, Device, Queue, ResourceManager};

///Everything the compiler and runtime need from the backend, bundled so it
/// can be threaded through explicitly instead of living in globals. Created
/// once per runtime, torn down with it.
#[derive(Clone)]
pub struct ExecContext {
    pub device: Arc<dyn Device>,
    ///Fixed list of hardware queues. Pass queue indices refer into this.
    pub queues: Vec<Arc<dyn Queue>>,
    pub resources: Arc<dyn ResourceManager>,
    pub descriptors: Arc<dyn DescriptorAllocator>,
}

impl ExecContext {
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }
}
