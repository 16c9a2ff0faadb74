//
// Copyright (c) 2024 Hemi Labs, Inc.
//
// This file is part of the posixutils-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

use crate::atjob::AtJob;
use crate::database::User;
use crate::entry::Entry;
use std::rc::Rc;

/// A job waiting to be started during the current wakeup.
#[derive(Clone, Debug)]
pub enum Job {
    Cron { user: Rc<User>, entry: usize },
    At(AtJob),
}

impl Job {
    pub fn entry(&self) -> Option<&Entry> {
        match self {
            Job::Cron { user, entry } => user.entries.get(*entry),
            Job::At(_) => None,
        }
    }

    fn same_as(&self, other: &Job) -> bool {
        match (self, other) {
            (Job::Cron { user: a, entry: i }, Job::Cron { user: b, entry: j }) => {
                Rc::ptr_eq(a, b) && i == j
            }
            (Job::At(a), Job::At(b)) => a == b,
            _ => false,
        }
    }
}

/// Something that can start a job.
pub trait Dispatch {
    fn dispatch(&mut self, job: &Job);
}

#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: Vec<Job>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `job` unless the same job is already waiting.
    pub fn enqueue(&mut self, job: Job) {
        if !self.jobs.iter().any(|queued| queued.same_as(&job)) {
            self.jobs.push(job);
        }
    }

    /// Start every queued job in order and empty the queue.
    pub fn drain(&mut self, dispatcher: &mut dyn Dispatch) -> usize {
        let jobs = std::mem::take(&mut self.jobs);
        for job in &jobs {
            dispatcher.dispatch(job);
        }
        jobs.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
