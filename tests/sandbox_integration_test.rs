//! 沙箱相关集成测试：超时作为观察交还、取消级联到子运行与作业、墙钟预算
#![cfg(unix)]

mod common;

use std::time::{Duration, Instant};

use common::{build, call_observation, eventually, finished, finishing_planner, planner};
use hive::config::AppConfig;
use hive::core::{ErrorKind, ObservationError, RunState};
use hive::react::{AgentKind, Decision, RunEvent, ToolCallRequest};
use serde_json::json;
use tempfile::TempDir;

#[tokio::test]
async fn test_script_overrun_returns_to_planning() {
    let coding = planner(|ctx| {
        if ctx.steps.is_empty() {
            return Decision::act(vec![ToolCallRequest::new(
                "runScript",
                json!({
                    "source": "while :; do :; done",
                    "language": "shell",
                    "limits": { "timeout": 2000 }
                }),
            )]);
        }
        Decision::finish(json!({
            "error": call_observation(ctx, 0, 0).error(),
            "step": ctx.step,
        }))
    });

    let dir = TempDir::new().unwrap();
    let supervisor = build(AppConfig::default(), dir.path(), finishing_planner(), coding).await;
    let started = Instant::now();
    let run_id = supervisor
        .start(json!("spin"), Some(AgentKind::Coding), "spin")
        .await
        .unwrap();
    let status = finished(&supervisor, &run_id).await;

    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(status.state, RunState::Succeeded);
    let result = status.result.unwrap();
    assert_eq!(result["step"], 1);
    let error: ObservationError = serde_json::from_value(result["error"].clone()).unwrap();
    assert_eq!(error, ObservationError::TimedOut { limit_ms: 2000 });
    assert_eq!(supervisor.runtime().dispatcher().sandbox().active_jobs(), 0);
}

#[tokio::test]
async fn test_cancel_cascades_to_child_and_sandbox() {
    let reasoning = planner(|ctx| {
        if ctx.steps.is_empty() {
            return Decision::Delegate {
                target: AgentKind::Coding,
                task: json!("sleep for a while"),
            };
        }
        Decision::finish(json!("unreachable"))
    });
    let coding = planner(|ctx| {
        if ctx.steps.is_empty() {
            return Decision::act(vec![ToolCallRequest::new(
                "runScript",
                json!({ "source": "sleep 30", "limits": { "timeout": 60000 } }),
            )]);
        }
        Decision::finish(json!("unreachable"))
    });

    let dir = TempDir::new().unwrap();
    let supervisor = build(AppConfig::default(), dir.path(), reasoning, coding).await;
    let mut events = supervisor.subscribe();
    let parent = supervisor.start(json!("delegate"), None, "cascade").await.unwrap();

    let child = loop {
        match events.recv().await.unwrap() {
            RunEvent::Delegated { run_id, child_run, .. } if run_id == parent => break child_run,
            _ => continue,
        }
    };
    let sandbox = supervisor.runtime().dispatcher().sandbox().clone();
    eventually(|| sandbox.active_jobs() == 1).await;

    let cancelled_at = Instant::now();
    supervisor.cancel(&parent).unwrap();
    let parent_status = finished(&supervisor, &parent).await;
    let child_status = finished(&supervisor, &child).await;

    assert!(cancelled_at.elapsed() < Duration::from_secs(10));
    assert_eq!(parent_status.state, RunState::Cancelled);
    assert_eq!(child_status.state, RunState::Cancelled);
    assert_eq!(child_status.parent, Some(parent));
    assert_eq!(child_status.depth, 1);
    assert_eq!(sandbox.active_jobs(), 0);

    // 已结束的运行再次取消无副作用
    supervisor.cancel(&parent).unwrap();
    assert_eq!(supervisor.status(&parent).await.unwrap().state, RunState::Cancelled);
}

#[tokio::test]
async fn test_wall_clock_budget_fails_run() {
    let coding = planner(|_| {
        Decision::act(vec![ToolCallRequest::new(
            "runScript",
            json!({ "source": "sleep 30", "limits": { "timeout": 60000 } }),
        )])
    });

    let mut config = AppConfig::default();
    config.runtime.run_timeout_secs = 1;
    let dir = TempDir::new().unwrap();
    let supervisor = build(config, dir.path(), finishing_planner(), coding).await;
    let run_id = supervisor
        .start(json!("too slow"), Some(AgentKind::Coding), "budget")
        .await
        .unwrap();
    let status = finished(&supervisor, &run_id).await;

    assert_eq!(status.state, RunState::Failed);
    assert_eq!(status.error.unwrap().kind, ErrorKind::RunBudgetExceeded);
    assert_eq!(supervisor.runtime().dispatcher().sandbox().active_jobs(), 0);
}

#[tokio::test]
async fn test_parent_budget_fails_delegated_child() {
    let reasoning = planner(|ctx| {
        if ctx.steps.is_empty() {
            return Decision::Delegate {
                target: AgentKind::Coding,
                task: json!("sleep past the budget"),
            };
        }
        Decision::finish(json!("unreachable"))
    });
    let coding = planner(|_| {
        Decision::act(vec![ToolCallRequest::new(
            "runScript",
            json!({ "source": "sleep 30", "limits": { "timeout": 60000 } }),
        )])
    });

    let mut config = AppConfig::default();
    config.runtime.run_timeout_secs = 1;
    let dir = TempDir::new().unwrap();
    let supervisor = build(config, dir.path(), reasoning, coding).await;

    // 父子共用同一截止时间，哪个计时器先触发都必须判为预算耗尽
    for trial in 0..4 {
        let mut events = supervisor.subscribe();
        let parent = supervisor
            .start(json!("delegate"), None, &format!("shared-budget-{trial}"))
            .await
            .unwrap();
        let child = loop {
            match events.recv().await.unwrap() {
                RunEvent::Delegated { run_id, child_run, .. } if run_id == parent => break child_run,
                _ => continue,
            }
        };
        let parent_status = finished(&supervisor, &parent).await;
        let child_status = finished(&supervisor, &child).await;

        assert_eq!(child_status.state, RunState::Failed);
        assert_eq!(child_status.error.unwrap().kind, ErrorKind::RunBudgetExceeded);
        assert_eq!(parent_status.state, RunState::Failed);
        assert_eq!(parent_status.error.unwrap().kind, ErrorKind::RunBudgetExceeded);
    }
    assert_eq!(supervisor.runtime().dispatcher().sandbox().active_jobs(), 0);
}
