//! hive: coordination for a pool of autonomous workers.
//!
//! A [`swarm::Swarm`] owns three subsystems: a [`channel::Channel`] of
//! bounded per-worker mailboxes, a [`scheduler::Scheduler`] distributing a
//! priority backlog across workers under capacity limits, and a
//! [`collective::Collective`] that aggregates worker votes and shared
//! knowledge under a reputation model. Workers implement the
//! [`worker::Worker`] trait and are handed to the swarm, which registers
//! them everywhere and drives them from its background loops.
//!
//! Everything runs in-process on the tokio runtime; no state persists
//! across restarts.

pub mod channel;
pub mod collective;
pub mod config;
pub mod error;
pub mod log;
pub mod scheduler;
pub mod swarm;
pub mod task;
pub mod worker;

pub use channel::{Channel, ChannelStats, Message, MessageHandler, MessagePriority};
pub use collective::{
    Collective, CollectiveDecision, CollectiveMetrics, KnowledgeItem, Vote, VotingMethod,
};
pub use config::SwarmConfig;
pub use error::{Error, Result};
pub use scheduler::{
    Assignment, QueueStatus, Scheduler, SchedulerEvent, Strategy, WorkerPerformance,
};
pub use swarm::{Swarm, SwarmState, SwarmStatus, WorkerInfo};
pub use task::{Task, TaskId, TaskResult, TaskStatus};
pub use worker::{Capability, Worker, WorkerCore, WorkerId, WorkerMetrics, WorkerState};
