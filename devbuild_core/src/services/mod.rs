pub mod aggregator;
pub mod backend;
pub mod build_service;
pub mod fanout;
pub mod merge;
pub mod monolithic;
pub mod validator;

pub use backend::{system_clock, Backends, BoxTask, Clock, PipelineBackend, TaskSpawner, TokioSpawner};
pub use build_service::DevBuildService;
pub use fanout::FanoutBackend;
pub use monolithic::JenkinsBackend;
