pub use crate::agent::{
    AgentConfig, AgentConfigBuilder, AgentExit, AgentImage, AgentLauncher, AgentProcess,
    ContainerAgent, LocalAgent, OutputLog,
};
pub use crate::assert::{
    SessionAssertions, has_any_metric_or_dim, has_datapoint, has_datapoint_with_all_dims,
    has_datapoint_with_dim, has_datapoint_with_metric_name, has_log_message, tcp_socket_open,
};
pub use crate::backend::wire::BackendClient;
pub use crate::backend::{BackendBuffer, DataPoint, FakeBackend, MetricType, MetricValue};
pub use crate::error::{Error, Result, SetupError};
pub use crate::metadata::{
    SelfDescribe, get_monitor_dims_from_selfdescribe, get_monitor_dims_from_selfdescribe_at,
    get_monitor_metrics_from_selfdescribe, get_monitor_metrics_from_selfdescribe_at,
};
pub use crate::session::{
    AgentSession, SessionBuilder, run_agent, run_agent_with, with_agent, with_agent_using,
};
pub use crate::settings::HarnessSettings;
pub use crate::wait::{Waiter, ensure_always, ensure_never, wait_for};
