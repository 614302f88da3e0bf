pub mod coordinator;
pub mod generation;
pub mod identity;
pub mod jobs;
pub mod memory;
pub mod notify;
pub mod queue;
pub mod quota;
pub mod redrive;
pub mod storage;
pub mod worker;
