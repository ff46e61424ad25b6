//! # ServiceInstance Operator
//!
//! A Kubernetes operator that provisions service instances through an asynchronous
//! service manager API.
//!
//! ## Overview
//!
//! For every `ServiceInstance` resource the operator:
//!
//! 1. **Provisions** the instance, or adopts one an earlier attempt left behind
//! 2. **Tracks** asynchronous create, update and delete operations until they finish
//! 3. **Updates** the instance when its spec or its parameter secrets change
//! 4. **Shares** the instance with other subaccounts on request
//! 5. **Deprovisions** it when the resource is deleted
//!
//! ## Features
//!
//! - **Multi-namespace**: Watches `ServiceInstance` resources across all namespaces
//! - **Secret-sourced parameters**: Merges parameters from secrets and follows their changes
//! - **Prometheus metrics**: Exposes metrics for monitoring and observability
//! - **Health checks**: HTTP endpoints for liveness and readiness checks

use anyhow::Result;
use service_instance_operator::runtime::initialization::initialize;
use service_instance_operator::runtime::watch_loop::run_watch_loop;

#[tokio::main]
async fn main() -> Result<()> {
    let init = initialize().await?;
    run_watch_loop(init.client, init.reconciler, init.server_state).await
}
