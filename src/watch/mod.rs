pub mod policy;
pub mod scheduler;

pub use policy::FailureStreak;
pub use scheduler::WatchScheduler;
