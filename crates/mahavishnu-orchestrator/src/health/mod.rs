//! Health and readiness machinery

mod supervisor;

pub use supervisor::{
    ComponentHealth, ComponentReport, ComponentStatus, HealthSupervisor, LivenessReport,
    ReadinessReport, SchedulerPulse,
};
