pub mod options;
pub mod sim_config;

pub use options::{
    parse_reservation_starts, BatsimCheckpointSpec, CheckpointTimeBase, CopyAdjustment,
    CopyDistribution, CopyOp, CopySpec, DrawScope, SubmissionDistribution, SubmissionTimeSpec,
};
pub use sim_config::{
    CheckpointingConfig, FailureConfig, HostGroupConfig, HostRole, PlatformConfig, RedisConfig,
    SimulationConfig, TransformConfig, WorkloadDescription,
};
