use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;

use crate::assert::predicates::{
    has_any_metric_or_dim, has_datapoint, has_datapoint_with_metric_name, has_log_message,
};
use crate::session::AgentSession;

/// Panicking assertions over a live session. Failure messages carry the
/// session diagnostics.
#[async_trait]
pub trait SessionAssertions {
    async fn assert_datapoints_received(&self, expected_count: usize, timeout: Duration);
    async fn assert_metric_received(&self, metric: &str, timeout: Duration);
    async fn assert_datapoint_received(
        &self,
        metric: &str,
        dims: &[(&str, &str)],
        timeout: Duration,
    );
    async fn assert_any_metric_or_dim(
        &self,
        metrics: &HashSet<String>,
        dims: &HashSet<String>,
        timeout: Duration,
    );
    async fn assert_metric_not_received(&self, metric: &str, wait_duration: Duration);

    fn assert_no_error_logs(&self);
    async fn assert_log_message(&self, message: &str, timeout: Duration);
}

#[async_trait]
impl SessionAssertions for AgentSession {
    async fn assert_datapoints_received(&self, expected_count: usize, timeout: Duration) {
        if !self
            .backend()
            .wait_for_datapoints(expected_count, timeout)
            .await
        {
            panic!(
                "timed out waiting for {} datapoints (timeout: {:?})\n{}",
                expected_count,
                timeout,
                self.diagnostics()
            );
        }
    }

    async fn assert_metric_received(&self, metric: &str, timeout: Duration) {
        if !self
            .wait_until(|points| has_datapoint_with_metric_name(points, metric), timeout)
            .await
        {
            panic!(
                "metric '{}' not received within timeout {:?}\n{}",
                metric,
                timeout,
                self.diagnostics()
            );
        }
    }

    async fn assert_datapoint_received(
        &self,
        metric: &str,
        dims: &[(&str, &str)],
        timeout: Duration,
    ) {
        if !self
            .wait_until(|points| has_datapoint(points, metric, dims), timeout)
            .await
        {
            panic!(
                "no '{}' datapoint with dimensions {:?} within timeout {:?}\n{}",
                metric,
                dims,
                timeout,
                self.diagnostics()
            );
        }
    }

    async fn assert_any_metric_or_dim(
        &self,
        metrics: &HashSet<String>,
        dims: &HashSet<String>,
        timeout: Duration,
    ) {
        if !self
            .wait_until(|points| has_any_metric_or_dim(points, metrics, dims), timeout)
            .await
        {
            panic!(
                "none of the expected metrics {:?} or dimensions {:?} received within timeout {:?}\n{}",
                metrics,
                dims,
                timeout,
                self.diagnostics()
            );
        }
    }

    async fn assert_metric_not_received(&self, metric: &str, wait_duration: Duration) {
        tokio::time::sleep(wait_duration).await;

        let found = self
            .backend()
            .buffer()
            .with_points(|points| has_datapoint_with_metric_name(points, metric));
        if found {
            panic!(
                "metric '{}' was received but expected not to be\n{}",
                metric,
                self.diagnostics()
            );
        }
    }

    fn assert_no_error_logs(&self) {
        let output = self.get_output().to_lowercase();
        if has_log_message(&output, "error") {
            panic!(
                "agent output contains errors:\n{}",
                self.output().lines_matching("error").join("\n")
            );
        }
    }

    async fn assert_log_message(&self, message: &str, timeout: Duration) {
        if !crate::wait::wait_for(|| has_log_message(&self.get_output(), message), timeout).await {
            panic!(
                "log message '{}' not seen within timeout {:?}\n{}",
                message,
                timeout,
                self.diagnostics()
            );
        }
    }
}
