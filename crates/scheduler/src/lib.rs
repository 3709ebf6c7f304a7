pub mod heartbeat;
pub mod sampler;

pub use heartbeat::HeartbeatService;
pub use sampler::PerformanceService;
