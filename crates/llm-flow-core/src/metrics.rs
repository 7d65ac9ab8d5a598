// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prometheus metrics for engine activity.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_gauge, IntCounter, IntGauge,
};

lazy_static! {
    pub static ref INSTANCES_STARTED: IntCounter = register_int_counter!(
        "llm_flow_instances_started_total",
        "Workflow instances created by execute"
    )
    .expect("metric registration");
    pub static ref INSTANCES_COMPLETED: IntCounter = register_int_counter!(
        "llm_flow_instances_completed_total",
        "Workflow instances that reached COMPLETED"
    )
    .expect("metric registration");
    pub static ref INSTANCES_FAILED: IntCounter = register_int_counter!(
        "llm_flow_instances_failed_total",
        "Workflow instances that reached FAILED"
    )
    .expect("metric registration");
    pub static ref INSTANCES_CANCELLED: IntCounter = register_int_counter!(
        "llm_flow_instances_cancelled_total",
        "Workflow instances that reached CANCELLED"
    )
    .expect("metric registration");
    pub static ref STEPS_EXECUTED: IntCounter = register_int_counter!(
        "llm_flow_steps_executed_total",
        "Step executions started (excluding retry attempts)"
    )
    .expect("metric registration");
    pub static ref STEP_RETRIES: IntCounter = register_int_counter!(
        "llm_flow_step_retries_total",
        "Retry attempts scheduled by the retry engine"
    )
    .expect("metric registration");
    pub static ref ASYNC_TASKS_STARTED: IntCounter = register_int_counter!(
        "llm_flow_async_tasks_started_total",
        "Background tasks dispatched by async steps"
    )
    .expect("metric registration");
    pub static ref ASYNC_TASK_TIMEOUTS: IntCounter = register_int_counter!(
        "llm_flow_async_task_timeouts_total",
        "Background tasks that exceeded their deadline"
    )
    .expect("metric registration");
    pub static ref ACTIVE_INSTANCES: IntGauge = register_int_gauge!(
        "llm_flow_active_instances",
        "Instances currently inside a scheduling turn"
    )
    .expect("metric registration");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_register_and_count() {
        let before = STEPS_EXECUTED.get();
        STEPS_EXECUTED.inc();
        assert_eq!(STEPS_EXECUTED.get(), before + 1);

        ACTIVE_INSTANCES.inc();
        ACTIVE_INSTANCES.dec();
    }
}
