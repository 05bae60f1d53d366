pub mod health;
pub mod supervisor;

pub use health::{HealthProbe, HttpHealthProbe};
pub use supervisor::{ServiceInfo, ServiceOptions, ServiceStatus, ServiceStatusChange, ServiceSupervisor};
