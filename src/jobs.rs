use std::collections::VecDeque;
use std::sync::Mutex;

use crate::agent::AgentId;
use crate::message::MessageId;

/// Work for the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    Check(AgentId),
    Receive(AgentId, Vec<MessageId>),
}

/// FIFO of pending jobs, shared by everything that can trigger an invocation.
#[derive(Default)]
pub struct JobQueue {
    jobs: Mutex<VecDeque<Job>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, job: Job) {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).push_back(job);
    }

    pub fn pop(&self) -> Option<Job> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the queue, front first.
    pub fn snapshot(&self) -> Vec<Job> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let queue = JobQueue::new();
        queue.push(Job::Check(1));
        queue.push(Job::Receive(2, vec![5, 6]));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Some(Job::Check(1)));
        assert_eq!(queue.pop(), Some(Job::Receive(2, vec![5, 6])));
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }
}
