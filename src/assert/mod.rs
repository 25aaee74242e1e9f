pub mod extensions;
pub mod predicates;

pub use extensions::SessionAssertions;
pub use predicates::{
    has_any_metric_or_dim, has_datapoint, has_datapoint_with_all_dims, has_datapoint_with_dim,
    has_datapoint_with_metric_name, has_log_message, tcp_socket_open,
};
