pub mod extract;
pub mod orchestrator;
pub mod payload;
pub mod retry;
pub mod state;
pub mod strategies;
pub mod transport;

pub use orchestrator::Orchestrator;
pub use retry::{RetryPolicy, Sleeper, ThreadSleeper};
pub use state::{JobPhase, JobState};
pub use strategies::{
    CompletionStrategy, ImmediateStrategy, PolledStrategy, StrategyRegistry, StreamedStrategy,
};
pub use transport::{HttpTransport, Transport};
